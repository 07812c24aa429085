//! Storage error taxonomy
//!
//! Every adapter wraps its backend-native failures into [`StorageError`], so
//! callers only ever match on one set of variants regardless of which backend
//! produced the failure.

use std::io;

use thiserror::Error;

use crate::security::RangeCategory;

#[derive(Error, Debug)]
pub enum StorageError {
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    #[error("Unsupported: {0}")]
    Unsupported(String),

    #[error("Endpoint {endpoint} blocked: resolves to {category} address")]
    EndpointBlocked {
        endpoint: String,
        category: RangeCategory,
    },

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Transient failure: {0}")]
    Transient(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Operation cancelled")]
    Cancelled,
}

pub type StorageResult<T> = Result<T, StorageError>;

impl StorageError {
    /// Only transient failures are worth another attempt.
    pub fn is_retryable(&self) -> bool {
        matches!(self, StorageError::Transient(_))
    }

    pub fn not_found(path: impl Into<String>) -> Self {
        StorageError::NotFound(path.into())
    }

    /// Wrap an I/O error, keeping the path that caused it in the message.
    pub fn from_io(err: io::Error, path: &str) -> Self {
        match err.kind() {
            io::ErrorKind::NotFound => StorageError::NotFound(path.to_string()),
            io::ErrorKind::PermissionDenied => {
                StorageError::PermissionDenied(format!("{}: {}", path, err))
            }
            _ => {
                let mut mapped = StorageError::from(err);
                if let StorageError::Transient(msg) | StorageError::Conflict(msg) = &mut mapped {
                    *msg = format!("{}: {}", path, msg);
                }
                mapped
            }
        }
    }
}

impl From<io::Error> for StorageError {
    fn from(err: io::Error) -> Self {
        // Cancellation travels through byte streams as an I/O error
        if err.kind() == io::ErrorKind::Interrupted
            && err.to_string() == crate::transfer::stream::CANCELLED_MESSAGE
        {
            return StorageError::Cancelled;
        }
        match err.kind() {
            io::ErrorKind::NotFound => StorageError::NotFound(err.to_string()),
            io::ErrorKind::PermissionDenied => StorageError::PermissionDenied(err.to_string()),
            io::ErrorKind::AlreadyExists => StorageError::Conflict(err.to_string()),
            io::ErrorKind::Unsupported => StorageError::Unsupported(err.to_string()),
            _ => StorageError::Transient(err.to_string()),
        }
    }
}

impl From<StorageError> for io::Error {
    fn from(err: StorageError) -> Self {
        let kind = match &err {
            StorageError::NotFound(_) => io::ErrorKind::NotFound,
            StorageError::PermissionDenied(_) | StorageError::EndpointBlocked { .. } => {
                io::ErrorKind::PermissionDenied
            }
            StorageError::Unsupported(_) => io::ErrorKind::Unsupported,
            StorageError::Conflict(_) => io::ErrorKind::AlreadyExists,
            StorageError::Cancelled => io::ErrorKind::Interrupted,
            StorageError::InvalidConfig(_) => io::ErrorKind::InvalidInput,
            StorageError::Transient(_) => io::ErrorKind::Other,
        };
        io::Error::new(kind, err.to_string())
    }
}

impl From<serde_json::Error> for StorageError {
    fn from(err: serde_json::Error) -> Self {
        StorageError::InvalidConfig(err.to_string())
    }
}

impl From<zip::result::ZipError> for StorageError {
    fn from(err: zip::result::ZipError) -> Self {
        match err {
            zip::result::ZipError::Io(e) => StorageError::from(e),
            zip::result::ZipError::UnsupportedArchive(msg) => {
                StorageError::Unsupported(msg.to_string())
            }
            zip::result::ZipError::FileNotFound => {
                StorageError::NotFound("archive entry".to_string())
            }
            other => StorageError::Transient(other.to_string()),
        }
    }
}

impl From<tokio::task::JoinError> for StorageError {
    fn from(err: tokio::task::JoinError) -> Self {
        StorageError::Transient(format!("background task failed: {}", err))
    }
}

// Serialized as its display string for the HTTP layer
impl serde::Serialize for StorageError {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&self.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_io_error_mapping() {
        let err: StorageError = io::Error::new(io::ErrorKind::NotFound, "gone").into();
        assert!(matches!(err, StorageError::NotFound(_)));

        let err: StorageError = io::Error::new(io::ErrorKind::PermissionDenied, "no").into();
        assert!(matches!(err, StorageError::PermissionDenied(_)));

        let err: StorageError = io::Error::new(io::ErrorKind::AlreadyExists, "dup").into();
        assert!(matches!(err, StorageError::Conflict(_)));

        let err: StorageError = io::Error::new(io::ErrorKind::ConnectionReset, "reset").into();
        assert!(err.is_retryable());
    }

    #[test]
    fn test_from_io_keeps_path() {
        let err = StorageError::from_io(io::Error::new(io::ErrorKind::NotFound, "x"), "/a/b.txt");
        match err {
            StorageError::NotFound(path) => assert_eq!(path, "/a/b.txt"),
            other => panic!("unexpected: {:?}", other),
        }

        let err = StorageError::from_io(io::Error::new(io::ErrorKind::TimedOut, "slow"), "/c");
        assert!(err.to_string().contains("/c"));
        assert!(err.is_retryable());
    }

    #[test]
    fn test_only_transient_is_retryable() {
        assert!(!StorageError::NotFound("x".into()).is_retryable());
        assert!(!StorageError::Cancelled.is_retryable());
        assert!(!StorageError::Conflict("x".into()).is_retryable());
        assert!(StorageError::Transient("x".into()).is_retryable());
    }

    #[test]
    fn test_cancelled_round_trips_through_io() {
        let io_err: io::Error = StorageError::Cancelled.into();
        assert_eq!(io_err.kind(), io::ErrorKind::Interrupted);
        let back = StorageError::from(crate::transfer::stream::cancelled_io_error());
        assert!(matches!(back, StorageError::Cancelled));
    }

    #[test]
    fn test_serializes_as_string() {
        let json = serde_json::to_string(&StorageError::NotFound("/x".into())).unwrap();
        assert_eq!(json, "\"Not found: /x\"");
    }
}
