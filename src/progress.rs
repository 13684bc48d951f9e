//! Progress reporting and checkpoint timing for scan operations
//!
//! [`ProgressTracker`] counts processed entries and decides when the scanner
//! should checkpoint; [`ProgressReporter`] renders what the tracker dumps,
//! either as log lines or as JSON messages on stderr.

use humansize::{format_size, BINARY};
use serde::Serialize;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use crate::error::ScanError;
use crate::models::{FileEntry, ScanResult};

/// Scan phase indicator
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ScanPhase {
    /// Walking and cataloguing
    #[default]
    Scan,
    /// Scan completed
    Done,
}

impl ScanPhase {
    /// Get string representation of the phase
    pub fn as_str(&self) -> &'static str {
        match self {
            ScanPhase::Scan => "scan",
            ScanPhase::Done => "done",
        }
    }
}

/// Start message sent when a root scan begins
#[derive(Debug, Clone, Serialize)]
pub struct StartMessage {
    /// Message type identifier
    #[serde(rename = "_t")]
    pub msg_type: &'static str,
    /// Sequence number
    pub seq: u64,
    /// Timestamp in milliseconds since reporter creation
    pub ts: u64,
    /// Scan root path
    pub root: String,
    /// Maximum recursion depth, absent when unbounded
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_depth: Option<usize>,
}

impl StartMessage {
    /// Create a new start message
    pub fn new(seq: u64, ts: u64, root: String, max_depth: Option<usize>) -> Self {
        Self {
            msg_type: "start",
            seq,
            ts,
            root,
            max_depth,
        }
    }
}

/// Progress message emitted at each checkpoint
#[derive(Debug, Clone, Serialize)]
pub struct ProgressMessage {
    /// Message type identifier ("p" for progress)
    #[serde(rename = "_t")]
    pub msg_type: &'static str,
    /// Sequence number
    pub seq: u64,
    /// Timestamp in milliseconds since reporter creation
    pub ts: u64,
    /// Current scan phase
    pub phase: ScanPhase,
    /// Entries processed so far
    #[serde(rename = "f")]
    pub files: u64,
    /// Bytes accumulated so far
    #[serde(rename = "b")]
    pub bytes: u64,
    /// Entries per second since the previous dump
    pub rate: u64,
    /// Catalog id of the last processed entry
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<i64>,
    /// Path of the last processed entry
    #[serde(skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
}

/// Error message sent when a path could not be catalogued normally
#[derive(Debug, Clone, Serialize)]
pub struct ErrorProgressMessage {
    /// Message type identifier ("err" for error)
    #[serde(rename = "_t")]
    pub msg_type: &'static str,
    /// Sequence number
    pub seq: u64,
    /// Timestamp in milliseconds since reporter creation
    pub ts: u64,
    /// Error type/category
    pub error_type: String,
    /// Error message description
    pub message: String,
    /// Path that caused the error (if available)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
}

impl ErrorProgressMessage {
    /// Create a new error progress message
    pub fn new(
        seq: u64,
        ts: u64,
        error_type: String,
        message: String,
        path: Option<String>,
    ) -> Self {
        Self {
            msg_type: "err",
            seq,
            ts,
            error_type,
            message,
            path,
        }
    }
}

/// Done message sent when a root scan completes
#[derive(Debug, Clone, Serialize)]
pub struct DoneMessage {
    /// Message type identifier ("done" for completion)
    #[serde(rename = "_t")]
    pub msg_type: &'static str,
    /// Sequence number
    pub seq: u64,
    /// Timestamp in milliseconds since reporter creation
    pub ts: u64,
    /// Directories catalogued
    #[serde(rename = "td")]
    pub total_dirs: u64,
    /// Regular files catalogued
    #[serde(rename = "tf")]
    pub total_files: u64,
    /// Bytes catalogued
    #[serde(rename = "tb")]
    pub total_bytes: u64,
    /// Entries removed by pruning
    #[serde(rename = "pr")]
    pub pruned: u64,
    /// Foreign mount points skipped
    #[serde(rename = "sm")]
    pub skipped_mounts: u64,
    /// Number of errors encountered
    #[serde(rename = "ec")]
    pub error_count: usize,
    /// Total scan duration in milliseconds
    pub ms: u64,
}

impl DoneMessage {
    /// Create a done message from a finished scan
    pub fn from_result(seq: u64, ts: u64, result: &ScanResult) -> Self {
        Self {
            msg_type: "done",
            seq,
            ts,
            total_dirs: result.total_dirs,
            total_files: result.total_files,
            total_bytes: result.total_bytes,
            pruned: result.pruned_entries,
            skipped_mounts: result.skipped_mounts,
            error_count: result.error_count(),
            ms: result.duration_ms,
        }
    }
}

/// Renders progress either as log lines or as JSON on stderr
pub struct ProgressReporter {
    /// Whether progress reporting is enabled
    enabled: bool,
    /// JSON messages instead of log lines
    json: bool,
    /// Sequence number for messages
    seq: AtomicU64,
    /// Start time of the reporter
    start_time: Instant,
}

impl ProgressReporter {
    /// Create a new ProgressReporter
    pub fn new(enabled: bool, json: bool) -> Self {
        Self {
            enabled,
            json,
            seq: AtomicU64::new(0),
            start_time: Instant::now(),
        }
    }

    /// A reporter that prints nothing
    pub fn disabled() -> Self {
        Self::new(false, false)
    }

    /// Check if the reporter is enabled
    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Get the next sequence number (monotonically increasing)
    pub fn next_seq(&self) -> u64 {
        self.seq.fetch_add(1, Ordering::SeqCst)
    }

    /// Get the current timestamp in milliseconds since reporter creation
    pub fn current_timestamp(&self) -> u64 {
        self.start_time.elapsed().as_millis() as u64
    }

    /// Output a serializable message to stderr as JSON
    pub fn output_to_stderr<T: Serialize>(&self, msg: &T) {
        if let Ok(json) = serde_json::to_string(msg) {
            eprintln!("{}", json);
            std::io::stderr().flush().ok();
        }
    }

    /// Report the start of a root scan
    pub fn report_start(&self, root: &Path, max_depth: Option<usize>) {
        if !self.enabled {
            return;
        }
        if self.json {
            let msg = StartMessage::new(
                self.next_seq(),
                self.current_timestamp(),
                root.to_string_lossy().into_owned(),
                max_depth,
            );
            self.output_to_stderr(&msg);
        } else {
            log::info!("Scanning {:?}", root);
        }
    }

    /// Report a progress dump
    pub fn report_progress(&self, phase: ScanPhase, snapshot: &ProgressSnapshot) {
        if !self.enabled {
            return;
        }
        if self.json {
            let msg = ProgressMessage {
                msg_type: "p",
                seq: self.next_seq(),
                ts: self.current_timestamp(),
                phase,
                files: snapshot.files,
                bytes: snapshot.bytes,
                rate: snapshot.rate,
                id: snapshot.last_id,
                path: snapshot
                    .last_path
                    .as_ref()
                    .map(|p| p.to_string_lossy().into_owned()),
            };
            self.output_to_stderr(&msg);
        } else {
            log::info!("{}", snapshot.render());
        }
    }

    /// Report a per-path error; never throttled.
    ///
    /// Only JSON mode emits anything; in text mode the scanner's own log line
    /// is the report.
    pub fn report_error(&self, error: &ScanError) {
        if !self.enabled || !self.json {
            return;
        }
        let msg = ErrorProgressMessage::new(
            self.next_seq(),
            self.current_timestamp(),
            format!("{:?}", error.kind),
            error.message.clone(),
            error.path.as_ref().map(|p| p.to_string_lossy().into_owned()),
        );
        self.output_to_stderr(&msg);
    }

    /// Report completion of a root scan
    pub fn report_done(&self, result: &ScanResult) {
        if !self.enabled {
            return;
        }
        if self.json {
            let msg = DoneMessage::from_result(self.next_seq(), self.current_timestamp(), result);
            self.output_to_stderr(&msg);
        } else {
            log::info!(
                "Done: {} dirs, {} files, {}, {} pruned, {} mounts skipped, {} errors in {}ms",
                result.total_dirs,
                result.total_files,
                format_size(result.total_bytes, BINARY),
                result.pruned_entries,
                result.skipped_mounts,
                result.error_count(),
                result.duration_ms
            );
        }
    }
}

/// Counters captured at a dump
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProgressSnapshot {
    pub files: u64,
    pub bytes: u64,
    /// Entries per second since the previous dump
    pub rate: u64,
    pub last_id: Option<i64>,
    pub last_path: Option<PathBuf>,
}

impl ProgressSnapshot {
    /// One-line human rendering
    pub fn render(&self) -> String {
        let mut line = format!(
            "{} files\t{} files/sec\t{}",
            self.files,
            self.rate,
            format_size(self.bytes, BINARY)
        );
        if let (Some(id), Some(path)) = (self.last_id, &self.last_path) {
            line.push_str(&format!("\t[{}] {}", id, path.display()));
        }
        line
    }
}

/// Accumulates throughput and signals when a checkpoint is due
pub struct ProgressTracker {
    reporter: ProgressReporter,
    interval: Duration,
    files: u64,
    bytes: u64,
    last_id: Option<i64>,
    last_path: Option<PathBuf>,
    files_at_last_dump: u64,
    last_dump: Instant,
}

impl ProgressTracker {
    /// Create a tracker that signals at most once per `interval_ms`
    pub fn new(reporter: ProgressReporter, interval_ms: u64) -> Self {
        Self {
            reporter,
            interval: Duration::from_millis(interval_ms),
            files: 0,
            bytes: 0,
            last_id: None,
            last_path: None,
            files_at_last_dump: 0,
            last_dump: Instant::now(),
        }
    }

    /// The reporter progress is rendered through
    pub fn reporter(&self) -> &ProgressReporter {
        &self.reporter
    }

    /// Count one processed entry.
    ///
    /// Returns `true` (after dumping progress) when at least the interval has
    /// elapsed since the previous dump; the caller should checkpoint then.
    pub fn record_progress(&mut self, entry: &FileEntry, path: &Path) -> bool {
        self.files += 1;
        self.bytes += entry.size;
        self.last_id = Some(entry.id);
        self.last_path = Some(path.to_path_buf());

        if self.last_dump.elapsed() >= self.interval {
            self.dump(ScanPhase::Scan);
            return true;
        }
        false
    }

    /// Final dump regardless of elapsed time; the caller checkpoints afterwards
    pub fn record_done(&mut self) {
        self.dump(ScanPhase::Done);
    }

    /// Counters as of now
    pub fn snapshot(&self) -> ProgressSnapshot {
        let elapsed = self.last_dump.elapsed().as_secs_f64();
        let since = self.files - self.files_at_last_dump;
        let rate = if elapsed > 0.0 {
            (since as f64 / elapsed) as u64
        } else {
            since
        };
        ProgressSnapshot {
            files: self.files,
            bytes: self.bytes,
            rate,
            last_id: self.last_id,
            last_path: self.last_path.clone(),
        }
    }

    /// Entries processed so far
    pub fn files(&self) -> u64 {
        self.files
    }

    /// Bytes accumulated so far
    pub fn bytes(&self) -> u64 {
        self.bytes
    }

    fn dump(&mut self, phase: ScanPhase) {
        let snapshot = self.snapshot();
        self.reporter.report_progress(phase, &snapshot);
        self.files_at_last_dump = self.files;
        self.last_dump = Instant::now();
    }
}
