//! Error types for the Drift engine.

use crate::{ModelName, RecordId, SchemaVersion, Version};
use thiserror::Error;

/// All possible errors from the Drift engine.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum Error {
    // Validation errors
    #[error("model not registered: {0}")]
    ModelNotFound(ModelName),

    #[error("record not found: {0}")]
    RecordNotFound(RecordId),

    #[error("invalid payload: {0}")]
    InvalidPayload(String),

    #[error("missing required field: {0}")]
    MissingRequiredField(String),

    #[error("type mismatch for field '{field}': expected {expected}, got {got}")]
    TypeMismatch {
        field: String,
        expected: String,
        got: String,
    },

    // Write errors
    #[error("record already exists: {0}")]
    RecordAlreadyExists(RecordId),

    #[error("version mismatch: expected {expected}, got {actual}")]
    VersionMismatch { expected: Version, actual: Version },

    #[error("operation on deleted record: {0}")]
    OperationOnDeleted(RecordId),

    #[error("constraint violation on {model}/{id}: field '{field}' references missing {target}")]
    ConstraintViolation {
        model: ModelName,
        id: RecordId,
        field: String,
        target: ModelName,
    },

    // Queue errors
    #[error("mutation not queued: {0}")]
    MutationNotFound(String),

    // Lifecycle errors
    #[error("invalid state transition from {from} on {input}")]
    InvalidTransition { from: String, input: String },

    // Persistence errors
    #[error("invalid snapshot: {0}")]
    InvalidSnapshot(String),

    #[error("schema version mismatch: expected {expected}, got {actual}")]
    SchemaVersionMismatch {
        expected: SchemaVersion,
        actual: SchemaVersion,
    },
}

impl Error {
    /// Returns true if the error means the payload does not fit the model schema.
    pub fn is_schema_violation(&self) -> bool {
        matches!(
            self,
            Error::ModelNotFound(_)
                | Error::InvalidPayload(_)
                | Error::MissingRequiredField(_)
                | Error::TypeMismatch { .. }
        )
    }
}

/// Result type for engine operations.
pub type Result<T> = std::result::Result<T, Error>;
