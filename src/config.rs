//! Configuration for the disk cataloger

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::backup::DEFAULT_KEEP_BACKUPS;
use crate::error::ScanError;

/// Default catalog file
pub const DEFAULT_DB_PATH: &str = "catalog.db";

/// Default minimum time between checkpoints (milliseconds)
pub const DEFAULT_CHECKPOINT_INTERVAL_MS: u64 = 1000;

/// Configuration for a write-scan
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ScanConfig {
    /// Start paths, scanned in order into the same catalog
    pub roots: Vec<PathBuf>,

    /// Catalog database path
    pub db_path: PathBuf,

    /// Maximum recursion depth below each root; `None` is unbounded.
    /// Depth 0 catalogs the root only.
    pub max_depth: Option<usize>,

    /// Minimum time between checkpoints
    pub checkpoint_interval_ms: u64,

    /// Whether to print running progress lines
    pub show_progress: bool,

    /// Emit progress as JSON messages on stderr instead of log lines
    pub json_progress: bool,

    /// Number of previous catalogs kept when opening for writing
    pub keep_backups: usize,
}

impl Default for ScanConfig {
    fn default() -> Self {
        Self {
            roots: Vec::new(),
            db_path: PathBuf::from(DEFAULT_DB_PATH),
            max_depth: None,
            checkpoint_interval_ms: DEFAULT_CHECKPOINT_INTERVAL_MS,
            show_progress: true,
            json_progress: false,
            keep_backups: DEFAULT_KEEP_BACKUPS,
        }
    }
}

impl ScanConfig {
    /// Create a config builder
    pub fn builder() -> ScanConfigBuilder {
        ScanConfigBuilder::new()
    }

    /// Load a config from a JSON file; missing fields take their defaults
    pub fn from_json_file(path: &Path) -> Result<Self, ScanError> {
        let text = std::fs::read_to_string(path).map_err(|e| ScanError::from_io(path, &e))?;
        Self::from_json_str(&text).map_err(|e| e.with_path(path))
    }

    /// Parse a config from JSON text
    pub fn from_json_str(text: &str) -> Result<Self, ScanError> {
        serde_json::from_str(text)
            .map_err(|e| ScanError::io_error(None, format!("Invalid config: {}", e)))
    }

    /// Whether a directory at `depth` below the root may be descended into
    pub fn allows_descent(&self, depth: usize) -> bool {
        self.max_depth.map_or(true, |max| depth < max)
    }
}

/// Builder for ScanConfig
#[derive(Debug, Default)]
pub struct ScanConfigBuilder {
    config: ScanConfig,
}

impl ScanConfigBuilder {
    /// Create a new builder
    pub fn new() -> Self {
        Self::default()
    }

    /// Start from an existing config (e.g. one loaded from file)
    pub fn from_config(config: ScanConfig) -> Self {
        Self { config }
    }

    /// Set the root directories
    pub fn roots(mut self, roots: Vec<PathBuf>) -> Self {
        self.config.roots = roots;
        self
    }

    /// Add a root directory
    pub fn add_root(mut self, root: PathBuf) -> Self {
        self.config.roots.push(root);
        self
    }

    /// Set the database path
    pub fn db_path(mut self, path: PathBuf) -> Self {
        self.config.db_path = path;
        self
    }

    /// Set the maximum depth; `None` is unbounded
    pub fn max_depth(mut self, depth: Option<usize>) -> Self {
        self.config.max_depth = depth;
        self
    }

    /// Set the checkpoint interval
    pub fn checkpoint_interval_ms(mut self, interval: u64) -> Self {
        self.config.checkpoint_interval_ms = interval;
        self
    }

    /// Enable or disable progress output
    pub fn show_progress(mut self, enabled: bool) -> Self {
        self.config.show_progress = enabled;
        self
    }

    /// Switch progress output to JSON messages
    pub fn json_progress(mut self, enabled: bool) -> Self {
        self.config.json_progress = enabled;
        self
    }

    /// Set the number of kept backups
    pub fn keep_backups(mut self, keep: usize) -> Self {
        self.config.keep_backups = keep;
        self
    }

    /// Build the config
    pub fn build(self) -> ScanConfig {
        self.config
    }
}
