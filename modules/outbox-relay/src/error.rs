//! Relay error taxonomy
//!
//! - `StorageError`: the record store failed (claim, mark, commit, append).
//!   Cycle-fatal for the worker, propagated to the business transaction on append.
//! - `event_bus::PublishError`: one record could not be published. Record-fatal only.

pub use event_bus::PublishError;

#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("record store unavailable: {0}")]
    Unavailable(String),

    #[error("invalid outbox record: {0}")]
    InvalidRecord(String),

    #[error("payload serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

pub type StorageResult<T> = Result<T, StorageError>;
