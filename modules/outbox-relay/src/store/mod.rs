//! Record store abstraction used by the worker
//!
//! A [`ClaimScope`] is one claim transaction: records returned by
//! `claim_batch` stay invisible to every other scope until this one commits,
//! rolls back, or is dropped. Dropping an unfinished scope behaves like a
//! rollback, which is what happens to a worker that crashes mid-batch.

mod memory;
mod postgres;

pub use memory::{InMemoryClaimScope, InMemoryOutboxStore};
pub use postgres::{PgClaimScope, PgOutboxStore};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::error::StorageResult;
use crate::models::OutboxRecord;

#[async_trait]
pub trait OutboxStore: Send + Sync {
    type Scope: ClaimScope;

    /// Open a claim scope (transaction)
    async fn begin(&self) -> StorageResult<Self::Scope>;
}

#[async_trait]
pub trait ClaimScope: Send {
    /// Claim up to `limit` pending records created at or before `now`,
    /// ordered by `created_at` ascending, append order within a tie.
    /// All-or-nothing.
    ///
    /// Stores that stamp `created_at` themselves may use their own clock
    /// for the cutoff instead of `now`.
    async fn claim_batch(
        &mut self,
        limit: usize,
        now: DateTime<Utc>,
    ) -> StorageResult<Vec<OutboxRecord>>;

    /// Mark a record processed within this scope. Idempotent.
    async fn mark_processed(&mut self, id: Uuid, processed_at: DateTime<Utc>)
        -> StorageResult<()>;

    async fn commit(self) -> StorageResult<()>;

    async fn rollback(self) -> StorageResult<()>;
}
