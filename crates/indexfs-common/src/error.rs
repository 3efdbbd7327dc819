//! Error types for IndexFS
//!
//! Every storage-layer call returns [`Result`]. Variants are grouped by the
//! kind of failure a caller has to react to; [`Error::kind`] collapses them
//! onto [`ErrorKind`] for callers that only care about the category.

use std::io;
use thiserror::Error;

/// Common result type for IndexFS operations
pub type Result<T> = std::result::Result<T, Error>;

/// Coarse error category
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    NotFound,
    AlreadyExists,
    NotSupported,
    BadParameter,
    IoError,
    Corruption,
    Internal,
}

/// Common error type for IndexFS
#[derive(Debug, Error)]
pub enum Error {
    // Storage errors
    #[error("disk I/O error: {0}")]
    DiskIo(#[from] io::Error),

    #[error("I/O error on {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: io::Error,
    },

    #[error("not found: {0}")]
    NotFound(String),

    #[error("already exists: {0}")]
    AlreadyExists(String),

    #[error("not supported: {0}")]
    NotSupported(String),

    #[error("bad parameter: {0}")]
    BadParameter(String),

    #[error("data corruption: {0}")]
    Corruption(String),

    #[error("read out of range: offset {offset} + length {length} exceeds size {size}")]
    OutOfRange { offset: u64, length: u64, size: u64 },

    #[error("memory quota exceeded: requested {requested} bytes, available {available} bytes")]
    QuotaExceeded { requested: u64, available: u64 },

    // Commit errors
    #[error("fenced out: commit holds fence {actual}, current fence is {expected}")]
    Fenced { expected: String, actual: String },

    // Codec errors
    #[error("compression error: {0}")]
    Compression(String),

    #[error("serialization error: {0}")]
    Serialization(String),

    // Internal errors
    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Wrap an I/O error that happened on `path`
    ///
    /// `NotFound` and `AlreadyExists` I/O errors are lifted to the
    /// matching variants so callers can branch on them without peeking
    /// into the source.
    pub fn io(path: impl Into<String>, source: io::Error) -> Self {
        let path = path.into();
        match source.kind() {
            io::ErrorKind::NotFound => Self::NotFound(path),
            io::ErrorKind::AlreadyExists => Self::AlreadyExists(path),
            _ => Self::Io { path, source },
        }
    }

    /// Create a not found error
    pub fn not_found(what: impl Into<String>) -> Self {
        Self::NotFound(what.into())
    }

    /// Create a not supported error
    pub fn not_supported(what: impl Into<String>) -> Self {
        Self::NotSupported(what.into())
    }

    /// Create a bad parameter error
    pub fn bad_parameter(msg: impl Into<String>) -> Self {
        Self::BadParameter(msg.into())
    }

    /// Create a corruption error
    pub fn corruption(msg: impl Into<String>) -> Self {
        Self::Corruption(msg.into())
    }

    /// Create an internal error
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    /// Error category
    #[must_use]
    pub const fn kind(&self) -> ErrorKind {
        match self {
            Self::NotFound(_) => ErrorKind::NotFound,
            Self::AlreadyExists(_) => ErrorKind::AlreadyExists,
            Self::NotSupported(_) => ErrorKind::NotSupported,
            Self::BadParameter(_) | Self::QuotaExceeded { .. } | Self::OutOfRange { .. } => {
                ErrorKind::BadParameter
            }
            Self::DiskIo(_) | Self::Io { .. } => ErrorKind::IoError,
            Self::Corruption(_) | Self::Compression(_) | Self::Serialization(_) => {
                ErrorKind::Corruption
            }
            Self::Fenced { .. } | Self::Internal(_) => ErrorKind::Internal,
        }
    }

    fn io_source(&self) -> Option<&io::Error> {
        match self {
            Self::DiskIo(e) | Self::Io { source: e, .. } => Some(e),
            _ => None,
        }
    }

    /// True for I/O errors caused by the local disk itself
    /// (permission denied, no space, quota, read-only filesystem)
    #[must_use]
    pub fn is_local_disk_error(&self) -> bool {
        self.io_source().is_some_and(|e| {
            e.kind() == io::ErrorKind::PermissionDenied
                || matches!(
                    e.raw_os_error(),
                    Some(libc::ENOSPC | libc::EDQUOT | libc::EROFS | libc::EACCES)
                )
        })
    }

    /// Check if this is a retryable error
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        self.kind() == ErrorKind::IoError
    }

    /// Check if this is a not found error
    #[must_use]
    pub const fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }
}
