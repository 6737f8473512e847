//! Execution-layer error taxonomy.

use depgate_core::{DecodeError, RunKey, RunStatus};
use depgate_storage::StorageError;

/// Result alias for engine operations.
pub type Result<T> = std::result::Result<T, EngineError>;

/// Errors surfaced to the dispatcher's caller.
///
/// A `FAILED` run is an outcome (`Directive::Failed`), never an error.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    /// Audit store could not complete a read or write; retry the operation
    #[error("store unavailable: {0}")]
    StoreUnavailable(#[source] StorageError),

    /// Record changed underneath us and retries were exhausted
    #[error("concurrent modification: {0}")]
    ConcurrentModification(String),

    /// Referenced run does not exist
    #[error("run not found: {0}")]
    NotFound(String),

    /// Executor cannot accept the submission right now
    #[error("resource unavailable for {run}: {reason}")]
    ResourceUnavailable {
        /// Run that could not be submitted
        run: RunKey,
        /// Diagnostic from the executor, also persisted on the record
        reason: String,
    },

    /// Event was rejected before touching any record
    #[error("malformed input: {0}")]
    MalformedInput(#[from] DecodeError),

    /// Operation does not apply to the run in its current status
    #[error("{run} is {status}; cannot {operation}")]
    InvalidState {
        /// Run addressed
        run: RunKey,
        /// Its current status
        status: RunStatus,
        /// What was attempted
        operation: &'static str,
    },

    /// Poll named a step other than the one recorded for the run
    #[error("{run}: step {requested} does not match recorded step {recorded:?}")]
    StepMismatch {
        /// Run addressed
        run: RunKey,
        /// Step named by the caller
        requested: String,
        /// Step on the record, if any
        recorded: Option<String>,
    },

    /// Executor failed for a reason other than capacity
    #[error("executor error: {0}")]
    Executor(String),
}

impl EngineError {
    /// Whether retrying the same invocation later can succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::StoreUnavailable(_) | Self::ConcurrentModification(_) | Self::ResourceUnavailable { .. }
        )
    }
}

impl From<StorageError> for EngineError {
    fn from(e: StorageError) -> Self {
        match e {
            StorageError::NotFound(what) => Self::NotFound(what),
            StorageError::ConcurrentModification(detail) => Self::ConcurrentModification(detail),
            other => Self::StoreUnavailable(other),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_storage_error_mapping() {
        let err: EngineError = StorageError::Unavailable("down".into()).into();
        assert!(matches!(err, EngineError::StoreUnavailable(_)));
        assert!(err.is_retryable());

        let err: EngineError = StorageError::NotFound("jobA@2024-01-01:1".into()).into();
        assert!(matches!(err, EngineError::NotFound(_)));
        assert!(!err.is_retryable());

        let err: EngineError = StorageError::ConcurrentModification("rev".into()).into();
        assert!(err.is_retryable());
    }

    #[test]
    fn test_malformed_input_not_retryable() {
        let err: EngineError = DecodeError::MissingField("job_name").into();
        assert!(!err.is_retryable());
        assert_eq!(err.to_string(), "malformed input: missing field `job_name`");
    }
}
