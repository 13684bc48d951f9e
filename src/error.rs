//! Error types for the disk cataloger

use std::path::PathBuf;
use thiserror::Error;

/// Error kinds that can occur while cataloging
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScanErrorKind {
    /// Permission denied when accessing a file or directory
    PermissionDenied,
    /// File, directory or store not found
    NotFound,
    /// I/O error during file operations
    IoError,
    /// Catalog store operation failed
    DatabaseError,
    /// No mount table entry contains the path
    MountNotFound,
    /// Path cannot be made absolute or has no usable name
    InvalidPath,
    /// Search pattern failed to compile
    InvalidPattern,
    /// Unknown error
    Unknown,
}

/// Represents an error that occurred while cataloging
#[derive(Debug, Error)]
#[error("{kind:?}: {message} (path: {path:?})")]
pub struct ScanError {
    /// The kind of error
    pub kind: ScanErrorKind,
    /// The path where the error occurred
    pub path: Option<PathBuf>,
    /// Human-readable error message
    pub message: String,
}

impl ScanError {
    /// Create a new scan error
    pub fn new(kind: ScanErrorKind, path: Option<PathBuf>, message: impl Into<String>) -> Self {
        Self {
            kind,
            path,
            message: message.into(),
        }
    }

    /// Create a permission denied error
    pub fn permission_denied(path: PathBuf) -> Self {
        Self::new(
            ScanErrorKind::PermissionDenied,
            Some(path.clone()),
            format!("Permission denied: {:?}", path),
        )
    }

    /// Create a not found error
    pub fn not_found(path: PathBuf) -> Self {
        Self::new(
            ScanErrorKind::NotFound,
            Some(path.clone()),
            format!("Not found: {:?}", path),
        )
    }

    /// Create an I/O error
    pub fn io_error(path: Option<PathBuf>, message: impl Into<String>) -> Self {
        Self::new(ScanErrorKind::IoError, path, message)
    }

    /// Create a database error
    pub fn database_error(message: impl Into<String>) -> Self {
        Self::new(ScanErrorKind::DatabaseError, None, message)
    }

    /// Create a mount-not-found error
    pub fn mount_not_found(path: PathBuf) -> Self {
        Self::new(
            ScanErrorKind::MountNotFound,
            Some(path.clone()),
            format!("Mount point not found: {:?}", path),
        )
    }

    /// Create an invalid path error
    pub fn invalid_path(path: PathBuf, message: impl Into<String>) -> Self {
        Self::new(ScanErrorKind::InvalidPath, Some(path), message)
    }

    /// Attach a path to an error that was converted without one
    pub fn with_path(mut self, path: impl Into<PathBuf>) -> Self {
        if self.path.is_none() {
            self.path = Some(path.into());
        }
        self
    }

    /// Build an error from an I/O error at a known path
    pub fn from_io(path: impl Into<PathBuf>, err: &std::io::Error) -> Self {
        Self::from_io_kind(err.kind(), err.to_string()).with_path(path)
    }

    fn from_io_kind(kind: std::io::ErrorKind, message: String) -> Self {
        let kind = match kind {
            std::io::ErrorKind::PermissionDenied => ScanErrorKind::PermissionDenied,
            std::io::ErrorKind::NotFound => ScanErrorKind::NotFound,
            _ => ScanErrorKind::IoError,
        };
        Self::new(kind, None, message)
    }
}

impl From<std::io::Error> for ScanError {
    fn from(err: std::io::Error) -> Self {
        Self::from_io_kind(err.kind(), err.to_string())
    }
}

impl From<rusqlite::Error> for ScanError {
    fn from(err: rusqlite::Error) -> Self {
        Self::database_error(err.to_string())
    }
}

impl From<walkdir::Error> for ScanError {
    fn from(err: walkdir::Error) -> Self {
        let path = err.path().map(|p| p.to_path_buf());
        let kind = err
            .io_error()
            .map(|e| e.kind())
            .unwrap_or(std::io::ErrorKind::Other);
        let mut error = Self::from_io_kind(kind, err.to_string());
        error.path = path;
        error
    }
}
