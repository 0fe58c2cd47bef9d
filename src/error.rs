use std::io;
use std::path::PathBuf;

use thiserror::Error;

/// Result type for all library operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors surfaced at the library boundary.
///
/// Every variant carries the name of the operation that failed and, where one
/// exists, the offending path, so a thin CLI can map errors 1:1 to messages.
#[derive(Debug, Error)]
pub enum Error {
    /// Configuration rejected at construction time.
    #[error("invalid configuration: {reason}")]
    InvalidConfig { reason: String },

    /// A required input file or directory does not exist.
    #[error("{op}: not found: {}", .path.display())]
    FileNotFound { op: &'static str, path: PathBuf },

    /// Reading a file failed.
    #[error("{op}: read {}: {source}", .path.display())]
    FileRead {
        op: &'static str,
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// Writing, renaming, or removing a file failed.
    #[error("{op}: write {}: {source}", .path.display())]
    FileWrite {
        op: &'static str,
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// A signature is structurally unusable for delta generation.
    #[error("{op}: invalid signature: {reason}")]
    InvalidSignature { op: &'static str, reason: String },

    /// A strong digest did not match its expected value.
    #[error("{op}: checksum mismatch{}", display_path(.path))]
    ChecksumMismatch {
        op: &'static str,
        path: Option<PathBuf>,
    },

    /// An operation in a delta or patch is not executable.
    #[error("{op}: invalid operation: {reason}")]
    InvalidOperation { op: &'static str, reason: String },

    /// The configured memory ceiling would be exceeded.
    #[error("{op}: memory limit exceeded: need {needed} bytes, limit {limit}")]
    MemoryLimitExceeded {
        op: &'static str,
        needed: u64,
        limit: u64,
    },

    /// Data failed structural validation outside the patch container.
    #[error("{op}: corrupted data: {reason}")]
    CorruptedData { op: &'static str, reason: String },

    /// A patch container failed validation on load.
    #[error("corrupted patch: {reason}")]
    PatchCorrupted { reason: String },

    /// A patch container uses a version or codec this build does not speak.
    #[error("incompatible patch: {reason}")]
    PatchIncompatible { reason: String },

    /// The caller's cancellation flag was raised; no output was produced.
    #[error("{op}: cancelled")]
    Cancelled { op: &'static str },
}

fn display_path(path: &Option<PathBuf>) -> String {
    match path {
        Some(p) => format!(": {}", p.display()),
        None => String::new(),
    }
}

impl Error {
    pub(crate) fn read(op: &'static str, path: impl Into<PathBuf>, source: io::Error) -> Self {
        let path = path.into();
        if source.kind() == io::ErrorKind::NotFound {
            Error::FileNotFound { op, path }
        } else {
            Error::FileRead { op, path, source }
        }
    }

    pub(crate) fn write(op: &'static str, path: impl Into<PathBuf>, source: io::Error) -> Self {
        Error::FileWrite {
            op,
            path: path.into(),
            source,
        }
    }

    pub(crate) fn corrupted(op: &'static str, reason: impl Into<String>) -> Self {
        Error::CorruptedData {
            op,
            reason: reason.into(),
        }
    }
}
