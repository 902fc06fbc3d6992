use crate::services::processor::ProcessorError;
use crate::services::storage::StorageError;

/// Crate-level error taxonomy.
///
/// `NotFound` is recoverable by the caller; `Storage` is a retryable backend
/// failure; `Validation` is rejected at creation and never retried;
/// `Processing` is recorded on the failing project; `Conflict` marks an
/// illegal state transition such as deleting a batch mid-processing.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error("validation error: {0}")]
    Validation(String),

    #[error("processing error: {0}")]
    Processing(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

impl From<ProcessorError> for EngineError {
    fn from(e: ProcessorError) -> Self {
        EngineError::Processing(e.to_string())
    }
}
