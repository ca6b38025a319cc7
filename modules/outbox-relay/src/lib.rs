pub mod config;
pub mod db;
pub mod error;
pub mod metrics;
pub mod models;
pub mod repos;
pub mod store;
pub mod worker;

pub use error::{StorageError, StorageResult};
pub use models::{DomainEvent, NewOutboxRecord, OutboxRecord, OutboxStatus};
pub use repos::outbox_repo::{append, append_event};
pub use worker::{OutboxWorker, StopHandle, WorkerConfig, WorkerState};
