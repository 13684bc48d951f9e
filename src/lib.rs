//! Incremental disk cataloger
//!
//! Walks directory trees into a SQLite catalog of volumes and file entries.
//! Rescanning a tree converges the catalog to what is on disk: entries keep
//! their ids across scans, changed entries are updated in place, and entries
//! no longer present are pruned directory by directory.

pub mod backup;
pub mod config;
pub mod db;
pub mod error;
pub mod models;
pub mod progress;
pub mod scanner;
pub mod volume;

pub use config::{ScanConfig, ScanConfigBuilder};
pub use db::CatalogStore;
pub use error::{ScanError, ScanErrorKind};
pub use models::{FileEntry, FileType, ScanResult, Volume};
pub use progress::{
    DoneMessage, ErrorProgressMessage, ProgressMessage, ProgressReporter, ProgressTracker,
    ScanPhase, StartMessage,
};
pub use scanner::{scan_roots, DiskScanner};
pub use volume::{MountEntry, VolumeResolver};
