//! Error types for the storage engine.
//!
//! `EngineError` covers every failure an API call can report. Each variant
//! maps to a stable string code (see [`EngineError::code`]) so that callers
//! can branch on the kind of failure without parsing messages. Per-entry
//! copy/move failures are recorded on task nodes, not returned as errors.

use std::io;
use std::path::{Path, PathBuf};

use serde::Serialize;
use thiserror::Error;
use uuid::Uuid;

use crate::model::Policy;

pub type EngineResult<T> = Result<T, EngineError>;

/// Errors reported by the identity store, forest, fingerprint engine,
/// registry and copy/move engine.
#[derive(Debug, Error)]
pub enum EngineError {
    /// The entry vanished (or never existed).
    #[error("Entry not found: {}", path.display())]
    NotFound { path: PathBuf },

    /// The stored identity differs from the one the caller expected: the
    /// entry was replaced out from under the caller.
    #[error("Identity mismatch at {}: expected {expected}, found {actual}", path.display())]
    UuidMismatch {
        path: PathBuf,
        expected: Uuid,
        actual: Uuid,
    },

    /// A hash was offered for a modification time the file no longer has.
    #[error("Entry modified since it was hashed: {}", path.display())]
    TimestampMismatch { path: PathBuf },

    /// Identity records cannot be written at all on this filesystem.
    #[error("Identity store is not writable at {}", path.display())]
    IdentityStoreUnwritable {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("Content changed during fingerprinting: {}", path.display())]
    ContentChanged { path: PathBuf },

    /// Block/char device, socket, FIFO or symlink.
    #[error("Unsupported entry kind: {}", path.display())]
    Unsupported { path: PathBuf },

    #[error("Not a regular file: {}", path.display())]
    NotAFile { path: PathBuf },

    #[error("Policy '{policy}' cannot be applied: {reason}")]
    InvalidPolicy { policy: Policy, reason: String },

    #[error("Node {node} is not waiting on a conflict")]
    NoConflict { node: Uuid },

    #[error("Not a directory: {}", path.display())]
    NotADirectory { path: PathBuf },

    #[error("Destination directory is missing: {}", path.display())]
    DestinationMissing { path: PathBuf },

    /// A directory cannot be copied or moved into itself.
    #[error("Destination {} lies inside {}", destination.display(), entry.display())]
    InsideSource { entry: PathBuf, destination: PathBuf },

    #[error("Permission denied: {}", path.display())]
    AccessDenied {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("Entry already exists: {}", path.display())]
    AlreadyExists { path: PathBuf },

    #[error("Cannot move across devices: {}", path.display())]
    CrossDevice { path: PathBuf },

    #[error("Drive not found: {drive}")]
    DriveNotFound { drive: Uuid },

    #[error("Node not found: {uuid}")]
    NodeNotFound { uuid: Uuid },

    #[error("Task not found: {uuid}")]
    TaskNotFound { uuid: Uuid },

    #[error("Copy verification failed: {}", path.display())]
    VerificationFailed { path: PathBuf },

    #[error("I/O error at {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("Invalid configuration: {message}")]
    Config { message: String },

    #[error("Worker pool failure: {message}")]
    Worker { message: String },
}

/// Serializable error payload for API consumers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ApiError {
    pub code: &'static str,
    pub message: String,
}

// errno values without a stable io::ErrorKind
const EXDEV: i32 = 18;
const ENOTDIR: i32 = 20;

impl EngineError {
    /// Classify an I/O error on `path` into the matching variant.
    pub fn io(path: impl AsRef<Path>, source: io::Error) -> Self {
        let path = path.as_ref().to_path_buf();
        match source.raw_os_error() {
            Some(EXDEV) => return Self::CrossDevice { path },
            Some(ENOTDIR) => return Self::NotADirectory { path },
            _ => {}
        }
        match source.kind() {
            io::ErrorKind::NotFound => Self::NotFound { path },
            io::ErrorKind::PermissionDenied => Self::AccessDenied { path, source },
            io::ErrorKind::AlreadyExists => Self::AlreadyExists { path },
            _ => Self::Io { path, source },
        }
    }

    /// Stable code for this error kind.
    pub fn code(&self) -> &'static str {
        match self {
            Self::NotFound { .. } => "ENOENT",
            Self::UuidMismatch { .. } => "EUUIDMISMATCH",
            Self::TimestampMismatch { .. } => "ETIMESTAMP",
            Self::IdentityStoreUnwritable { .. } => "EIDENTITYSTORE",
            Self::ContentChanged { .. } => "ECHANGED",
            Self::Unsupported { .. } => "EUNSUPPORTED",
            Self::NotAFile { .. } => "ENOTFILE",
            Self::InvalidPolicy { .. } => "EINVALIDPOLICY",
            Self::NoConflict { .. } => "ENOCONFLICT",
            Self::NotADirectory { .. } => "ENOTDIR",
            Self::DestinationMissing { .. } => "EDESTMISSING",
            Self::InsideSource { .. } => "EINSIDESOURCE",
            Self::AccessDenied { .. } => "EACCES",
            Self::AlreadyExists { .. } => "EEXIST",
            Self::CrossDevice { .. } => "EXDEV",
            Self::DriveNotFound { .. } => "ENODRIVE",
            Self::NodeNotFound { .. } => "ENONODE",
            Self::TaskNotFound { .. } => "ENOTASK",
            Self::VerificationFailed { .. } => "EVERIFY",
            Self::Io { .. } => "EIO",
            Self::Config { .. } => "ECONFIG",
            Self::Worker { .. } => "EWORKER",
        }
    }

    /// Conditions that signal a broken environment rather than a bad entry.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::IdentityStoreUnwritable { .. } | Self::Worker { .. }
        )
    }

    /// Extract the OS error code from this error, if available.
    pub fn raw_os_error(&self) -> Option<i32> {
        match self {
            Self::IdentityStoreUnwritable { source, .. }
            | Self::AccessDenied { source, .. }
            | Self::Io { source, .. } => source.raw_os_error(),
            _ => None,
        }
    }

    pub fn to_api(&self) -> ApiError {
        ApiError {
            code: self.code(),
            message: self.to_string(),
        }
    }
}

impl From<io::Error> for EngineError {
    fn from(err: io::Error) -> Self {
        EngineError::io(PathBuf::new(), err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_io_classification() {
        let err = EngineError::io("/x", io::Error::from(io::ErrorKind::NotFound));
        assert_eq!(err.code(), "ENOENT");

        let err = EngineError::io("/x", io::Error::from(io::ErrorKind::PermissionDenied));
        assert_eq!(err.code(), "EACCES");

        let err = EngineError::io("/x", io::Error::from_raw_os_error(EXDEV));
        assert_eq!(err.code(), "EXDEV");

        let err = EngineError::io("/x", io::Error::new(io::ErrorKind::Other, "boom"));
        assert_eq!(err.code(), "EIO");
    }

    #[test]
    fn test_api_error_carries_code_and_message() {
        let err = EngineError::ContentChanged {
            path: PathBuf::from("/data/movie.mkv"),
        };
        let api = err.to_api();
        assert_eq!(api.code, "ECHANGED");
        assert!(api.message.contains("movie.mkv"));
        assert!(!err.is_fatal());
    }

    #[test]
    fn test_fatal_errors() {
        let err = EngineError::IdentityStoreUnwritable {
            path: PathBuf::from("/ro"),
            source: io::Error::from(io::ErrorKind::Unsupported),
        };
        assert!(err.is_fatal());
        assert!(EngineError::Worker { message: "gone".into() }.is_fatal());
    }
}
