//! Unified error handling for the sync runtime.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Runtime error type.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SyncError {
    #[error("network error: {0}")]
    TransientNetwork(String),

    #[error("authentication failed: {0}")]
    Auth(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("schema validation failed: {0}")]
    SchemaValidation(String),

    #[error("storage error: {0}")]
    Storage(String),

    #[error("cancelled")]
    Cancelled,

    #[error("invalid state: {0}")]
    InvalidState(String),
}

/// Serializable tag of a [`SyncError`], carried by `syncFailed` events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ErrorKind {
    TransientNetwork,
    Auth,
    Conflict,
    SchemaValidation,
    Storage,
    Cancelled,
    InvalidState,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ErrorKind::TransientNetwork => "transientNetwork",
            ErrorKind::Auth => "auth",
            ErrorKind::Conflict => "conflict",
            ErrorKind::SchemaValidation => "schemaValidation",
            ErrorKind::Storage => "storage",
            ErrorKind::Cancelled => "cancelled",
            ErrorKind::InvalidState => "invalidState",
        };
        f.write_str(name)
    }
}

impl SyncError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            SyncError::TransientNetwork(_) => ErrorKind::TransientNetwork,
            SyncError::Auth(_) => ErrorKind::Auth,
            SyncError::Conflict(_) => ErrorKind::Conflict,
            SyncError::SchemaValidation(_) => ErrorKind::SchemaValidation,
            SyncError::Storage(_) => ErrorKind::Storage,
            SyncError::Cancelled => ErrorKind::Cancelled,
            SyncError::InvalidState(_) => ErrorKind::InvalidState,
        }
    }

    /// Errors worth retrying with backoff.
    pub fn is_transient(&self) -> bool {
        matches!(self, SyncError::TransientNetwork(_))
    }

    /// Errors that end the current sync cycle.
    pub fn is_fatal(&self) -> bool {
        matches!(self, SyncError::Auth(_) | SyncError::Storage(_))
    }
}

impl From<drift_engine::Error> for SyncError {
    fn from(err: drift_engine::Error) -> Self {
        use drift_engine::Error;

        match err {
            Error::InvalidSnapshot(_) | Error::SchemaVersionMismatch { .. } => {
                SyncError::Storage(err.to_string())
            }
            Error::ConstraintViolation { .. } => SyncError::SchemaValidation(err.to_string()),
            Error::VersionMismatch { .. } => SyncError::Conflict(err.to_string()),
            e if e.is_schema_violation() => SyncError::SchemaValidation(e.to_string()),
            e => SyncError::InvalidState(e.to_string()),
        }
    }
}

impl From<std::io::Error> for SyncError {
    fn from(err: std::io::Error) -> Self {
        SyncError::Storage(err.to_string())
    }
}

/// Result type alias for the runtime.
pub type Result<T> = std::result::Result<T, SyncError>;
