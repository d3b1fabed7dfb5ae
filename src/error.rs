use thiserror::Error;

/// Errors surfaced by the idempotency machinery.
///
/// Business-logic errors from wrapped functions are never folded into this
/// enum; they travel through [`crate::handler::ExecutionError::Handler`]
/// unchanged.
#[derive(Debug, Error)]
pub enum IdempotencyError {
    /// Required idempotency key material was missing from the payload.
    /// Raised before any store access and never retried.
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// The idempotency key was reused with a different payload hash.
    #[error("Validation error: {0}")]
    Validation(String),

    /// A concurrent execution holds the key and the retry budget is spent.
    #[error("Execution already in progress for key '{0}'")]
    AlreadyInProgress(String),

    /// The store kept returning conflicting states beyond the retry budget,
    /// or an optimistic update found no record to update.
    #[error("Inconsistent record state for key '{0}': {1}")]
    InconsistentState(String, String),

    /// Conditional create found a live record under the key. Internal signal
    /// of the claim protocol; the orchestrator branches on it and callers
    /// normally never see it.
    #[error("Record already exists for key '{0}'")]
    KeyAlreadyExists(String),

    /// Transport or protocol failure in the backing store.
    #[error("Persistence layer error: {0}")]
    PersistenceLayer(#[source] anyhow::Error),

    /// Response payload could not be (de)serialized.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl From<sqlx::Error> for IdempotencyError {
    fn from(e: sqlx::Error) -> Self {
        IdempotencyError::PersistenceLayer(anyhow::Error::new(e))
    }
}

impl From<redis::RedisError> for IdempotencyError {
    fn from(e: redis::RedisError) -> Self {
        IdempotencyError::PersistenceLayer(anyhow::Error::new(e))
    }
}

pub type Result<T> = std::result::Result<T, IdempotencyError>;
