use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{PgPool, Postgres, Transaction};
use uuid::Uuid;

use super::{ClaimScope, OutboxStore};
use crate::error::StorageResult;
use crate::models::OutboxRecord;
use crate::repos::outbox_repo;

/// Postgres-backed record store
#[derive(Debug, Clone)]
pub struct PgOutboxStore {
    pool: PgPool,
}

impl PgOutboxStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl OutboxStore for PgOutboxStore {
    type Scope = PgClaimScope;

    async fn begin(&self) -> StorageResult<PgClaimScope> {
        let tx = self.pool.begin().await?;
        Ok(PgClaimScope { tx })
    }
}

/// One claim transaction; row locks are held until commit/rollback/drop
pub struct PgClaimScope {
    tx: Transaction<'static, Postgres>,
}

#[async_trait]
impl ClaimScope for PgClaimScope {
    async fn claim_batch(
        &mut self,
        limit: usize,
        _now: DateTime<Utc>,
    ) -> StorageResult<Vec<OutboxRecord>> {
        // Cutoff is taken from the database clock, see outbox_repo::claim_batch
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        outbox_repo::claim_batch(&mut self.tx, limit).await
    }

    async fn mark_processed(
        &mut self,
        id: Uuid,
        processed_at: DateTime<Utc>,
    ) -> StorageResult<()> {
        let updated = outbox_repo::mark_processed(&mut self.tx, id, processed_at).await?;
        if !updated {
            tracing::debug!(event_id = %id, "Outbox record already processed");
        }
        Ok(())
    }

    async fn commit(self) -> StorageResult<()> {
        self.tx.commit().await?;
        Ok(())
    }

    async fn rollback(self) -> StorageResult<()> {
        self.tx.rollback().await?;
        Ok(())
    }
}
