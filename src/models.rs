//! Core data models for the disk catalog

use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::fs::Metadata;
use std::time::{SystemTime, UNIX_EPOCH};

use crate::error::ScanError;

/// Current wall-clock time as milliseconds since the Unix epoch
pub fn now_millis() -> i64 {
    Utc::now().timestamp_millis()
}

/// Convert a filesystem timestamp to milliseconds since the Unix epoch.
///
/// Saturates at the `i64` range; on-disk timestamps can be arbitrary.
pub fn system_time_millis(time: SystemTime) -> i64 {
    match time.duration_since(UNIX_EPOCH) {
        Ok(after) => i64::try_from(after.as_millis()).unwrap_or(i64::MAX),
        Err(before) => i64::try_from(before.duration().as_millis()).map_or(i64::MIN, |ms| -ms),
    }
}

/// Catalog classification of a filesystem node
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FileType {
    /// Directory
    Directory,
    /// Regular file
    #[serde(rename = "file")]
    RegularFile,
    /// Symbolic link (never followed)
    Symlink,
    /// Device nodes, sockets, fifos and anything else
    Other,
}

impl FileType {
    /// All file types, in id order
    pub const ALL: [FileType; 4] = [
        FileType::Directory,
        FileType::RegularFile,
        FileType::Symlink,
        FileType::Other,
    ];

    /// Stable id stored in the FileType table
    pub fn id(&self) -> i64 {
        match self {
            FileType::Directory => 1,
            FileType::RegularFile => 2,
            FileType::Symlink => 3,
            FileType::Other => 4,
        }
    }

    /// Look up a file type by its stored id
    pub fn from_id(id: i64) -> Option<Self> {
        Self::ALL.into_iter().find(|t| t.id() == id)
    }

    /// Get string representation
    pub fn as_str(&self) -> &'static str {
        match self {
            FileType::Directory => "directory",
            FileType::RegularFile => "file",
            FileType::Symlink => "symlink",
            FileType::Other => "other",
        }
    }

    /// Classify attribute flags with precedence directory > file > symlink > other.
    ///
    /// More than one flag set should not happen; it is logged and the first
    /// match wins.
    pub fn classify(attrs: EntryAttributes) -> Self {
        let set = [attrs.is_dir, attrs.is_file, attrs.is_symlink]
            .iter()
            .filter(|flag| **flag)
            .count();
        if set > 1 {
            log::error!("Conflicting file attributes, should not happen: {:?}", attrs);
        }

        if attrs.is_dir {
            FileType::Directory
        } else if attrs.is_file {
            FileType::RegularFile
        } else if attrs.is_symlink {
            FileType::Symlink
        } else {
            FileType::Other
        }
    }
}

impl std::fmt::Display for FileType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Type flags of a node as reported by the filesystem, without following links
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EntryAttributes {
    pub is_dir: bool,
    pub is_file: bool,
    pub is_symlink: bool,
}

impl From<std::fs::FileType> for EntryAttributes {
    fn from(ft: std::fs::FileType) -> Self {
        Self {
            is_dir: ft.is_dir(),
            is_file: ft.is_file(),
            is_symlink: ft.is_symlink(),
        }
    }
}

/// Identity of a mounted storage device
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Volume {
    /// Store-assigned id, 0 until persisted
    pub id: i64,
    /// Mount point path (unique)
    pub mount_point: String,
    /// Device name
    pub device: String,
    /// Filesystem type
    pub file_system: String,
    /// Block size in bytes (power of two)
    pub block_size: u32,
    /// First time this volume was seen (ms)
    pub first_seen_timestamp: i64,
    /// Last time this volume was referenced by a scan (ms)
    pub last_seen_timestamp: i64,
}

/// One catalog node
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileEntry {
    /// Store-assigned id, 0 until persisted
    pub id: i64,
    /// Parent entry id, 0 for a root entry
    pub parent_id: i64,
    /// Path segment (non-empty)
    pub name: String,
    /// Owning volume id
    pub volume_id: i64,
    /// Node classification
    pub file_type: FileType,
    /// Size in bytes
    pub size: u64,
    pub creation_timestamp: i64,
    pub modification_timestamp: i64,
    pub access_timestamp: i64,
    /// Set when the entry is first inserted, never changed afterwards
    pub first_seen_timestamp: i64,
    /// Bumped every time a scan confirms the entry is present
    pub last_seen_timestamp: i64,
}

impl FileEntry {
    /// Build an unsaved candidate from filesystem metadata
    pub fn from_metadata(
        parent_id: i64,
        volume_id: i64,
        name: String,
        metadata: &Metadata,
        seen_timestamp: i64,
    ) -> Self {
        let modification_timestamp = metadata.modified().map(system_time_millis).unwrap_or(0);
        let creation_timestamp = metadata
            .created()
            .map(system_time_millis)
            .unwrap_or(modification_timestamp);
        let access_timestamp = metadata.accessed().map(system_time_millis).unwrap_or(0);

        Self {
            id: 0,
            parent_id,
            name,
            volume_id,
            file_type: FileType::classify(metadata.file_type().into()),
            size: metadata.len(),
            creation_timestamp,
            modification_timestamp,
            access_timestamp,
            first_seen_timestamp: seen_timestamp,
            last_seen_timestamp: seen_timestamp,
        }
    }

    /// Build an unsaved candidate for a name whose metadata could not be read
    pub fn placeholder(
        parent_id: i64,
        volume_id: i64,
        name: String,
        file_type: FileType,
        seen_timestamp: i64,
    ) -> Self {
        Self {
            id: 0,
            parent_id,
            name,
            volume_id,
            file_type,
            size: 0,
            creation_timestamp: 0,
            modification_timestamp: 0,
            access_timestamp: 0,
            first_seen_timestamp: seen_timestamp,
            last_seen_timestamp: seen_timestamp,
        }
    }

    /// Whether this entry is a directory
    pub fn is_dir(&self) -> bool {
        self.file_type == FileType::Directory
    }
}

/// Result of a scan operation
#[derive(Debug, Default, Serialize)]
pub struct ScanResult {
    /// Catalog entry of the start path (the deepest seeded ancestor)
    pub root: Option<FileEntry>,
    /// Directories catalogued, including seeded ancestors
    pub total_dirs: u64,
    /// Regular files catalogued
    pub total_files: u64,
    /// Symlinks catalogued
    pub total_symlinks: u64,
    /// Other nodes catalogued
    pub total_other: u64,
    /// Sum of catalogued sizes in bytes
    pub total_bytes: u64,
    /// Entries written as zeroed placeholders
    pub placeholders: u64,
    /// Rows removed by orphan pruning
    pub pruned_entries: u64,
    /// Directories on a foreign volume whose subtree was skipped
    pub skipped_mounts: u64,
    /// Non-fatal errors encountered during the walk
    #[serde(skip)]
    pub errors: Vec<ScanError>,
    /// Total scan duration in milliseconds
    pub duration_ms: u64,
}

impl ScanResult {
    /// Create a new empty scan result
    pub fn new() -> Self {
        Self::default()
    }

    /// Count a catalogued entry
    pub fn count(&mut self, entry: &FileEntry) {
        match entry.file_type {
            FileType::Directory => self.total_dirs += 1,
            FileType::RegularFile => self.total_files += 1,
            FileType::Symlink => self.total_symlinks += 1,
            FileType::Other => self.total_other += 1,
        }
        self.total_bytes += entry.size;
    }

    /// Total catalogued entries of every type
    pub fn total_entries(&self) -> u64 {
        self.total_dirs + self.total_files + self.total_symlinks + self.total_other
    }

    /// Get the number of errors
    pub fn error_count(&self) -> usize {
        self.errors.len()
    }

    /// Check if the scan completed without errors
    pub fn is_success(&self) -> bool {
        self.errors.is_empty()
    }
}
