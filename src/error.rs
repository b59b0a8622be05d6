use thiserror::Error;

/// Errors raised by the pluggable [`crate::storage::Storage`] backend.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("key not found: {0}")]
    KeyNotFound(String),
    #[error("failed to (de)serialize stored value: {0}")]
    Serde(#[from] serde_json::Error),
    #[error("storage backend error: {0}")]
    Backend(String),
}

/// Errors raised while parsing a raw transaction into the engine's [`crate::model::Transaction`].
#[derive(Debug, Error)]
pub enum ParseError {
    #[error("failed to decode transaction bytes: {0}")]
    Decode(#[from] bitcoin::consensus::encode::Error),
}

/// Errors raised by the ingest engine and its callers.
///
/// These mirror the taxonomy the original address synchronizer uses: a
/// transaction can be recoverably rejected ([`EngineError::UnrelatedTransaction`]),
/// or a corrupt derived index can be reported as a fatal, non-recoverable bug
/// ([`EngineError::InvariantViolation`]). Conflict-precedence rejections and
/// history-inconsistency detection are *not* modeled as errors: they return
/// `false` / an empty result and log, per the design.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("transaction is unrelated to this wallet")]
    UnrelatedTransaction,
    #[error("invariant violation: {0}")]
    InvariantViolation(String),
    #[error(transparent)]
    Storage(#[from] StorageError),
    #[error(transparent)]
    Parse(#[from] ParseError),
}

pub type Result<T> = std::result::Result<T, EngineError>;
