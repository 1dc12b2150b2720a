//! Storage error types.

use std::io;
use std::path::Path;

use thiserror::Error;

/// Errors surfaced by every storage operation.
///
/// Each variant carries the attempted operation and the offending path so
/// the caller can report the failure without further context.
#[derive(Debug, Error)]
pub enum StorageError {
    /// File or directory not found.
    #[error("{op}: not found: {path}")]
    NotFound { op: &'static str, path: String },

    /// Destination exists and overwriting was not allowed.
    #[error("{op}: already exists: {path}")]
    AlreadyExists { op: &'static str, path: String },

    /// Partial remote configuration, or a root outside the mount path.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// Local filesystem failure.
    #[error("{op}: I/O error on {path}: {source}")]
    Io {
        op: &'static str,
        path: String,
        #[source]
        source: io::Error,
    },

    /// Failure reported by the remote volume client.
    #[error("{op}: remote volume error on {path}: {message}")]
    Remote {
        op: &'static str,
        path: String,
        message: String,
    },

    /// JSON encode/decode failure.
    #[error("{op}: invalid JSON in {path}: {source}")]
    Serialization {
        op: &'static str,
        path: String,
        #[source]
        source: serde_json::Error,
    },
}

impl StorageError {
    /// Create a NotFound error.
    pub fn not_found(op: &'static str, path: impl AsRef<Path>) -> Self {
        Self::NotFound {
            op,
            path: display(path),
        }
    }

    /// Create an AlreadyExists error.
    pub fn already_exists(op: &'static str, path: impl AsRef<Path>) -> Self {
        Self::AlreadyExists {
            op,
            path: display(path),
        }
    }

    /// Create a Configuration error.
    pub fn configuration(msg: impl Into<String>) -> Self {
        Self::Configuration(msg.into())
    }

    /// Create a Remote error.
    pub fn remote(op: &'static str, path: impl AsRef<Path>, message: impl Into<String>) -> Self {
        Self::Remote {
            op,
            path: display(path),
            message: message.into(),
        }
    }

    /// Wrap an `io::Error`, promoting `NotFound` and `AlreadyExists` kinds to
    /// their dedicated variants.
    pub fn from_io(op: &'static str, path: impl AsRef<Path>, source: io::Error) -> Self {
        match source.kind() {
            io::ErrorKind::NotFound => Self::not_found(op, path),
            io::ErrorKind::AlreadyExists => Self::already_exists(op, path),
            _ => Self::Io {
                op,
                path: display(path),
                source,
            },
        }
    }

    pub fn serialization(op: &'static str, path: impl AsRef<Path>, source: serde_json::Error) -> Self {
        Self::Serialization {
            op,
            path: display(path),
            source,
        }
    }

    /// Re-attribute a remote client error to the caller's operation and path.
    ///
    /// The client only knows volume-relative paths; callers know the path they
    /// asked for. Local I/O and serialization errors are left untouched.
    pub fn at(self, op: &'static str, path: impl AsRef<Path>) -> Self {
        let path = display(path);
        match self {
            Self::NotFound { .. } => Self::NotFound { op, path },
            Self::AlreadyExists { .. } => Self::AlreadyExists { op, path },
            Self::Remote { message, .. } => Self::Remote { op, path, message },
            other => other,
        }
    }

    /// Returns true for `NotFound`.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }

    /// Returns true for `AlreadyExists`.
    pub fn is_already_exists(&self) -> bool {
        matches!(self, Self::AlreadyExists { .. })
    }
}

fn display(path: impl AsRef<Path>) -> String {
    path.as_ref().display().to_string()
}

/// Storage result type.
pub type StorageResult<T> = Result<T, StorageError>;
