//! Outbox repository for reliable event publishing
//!
//! Uses the transactional outbox pattern: `append` runs inside the caller's
//! business transaction, the claim/mark functions run inside the relay's
//! claim transaction.

use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::{PgPool, Postgres, Transaction};
use uuid::Uuid;

use crate::error::StorageResult;
use crate::models::{DomainEvent, NewOutboxRecord, OutboxRecord};

const RECORD_COLUMNS: &str =
    "id, event_type, aggregate_type, aggregate_id, payload, status, created_at, processed_at";

/// Insert an event into the outbox within the caller's transaction
///
/// Nothing is committed here: the row becomes visible to the relay only when
/// the enclosing business transaction commits, and disappears with it on rollback.
pub async fn append(
    tx: &mut Transaction<'_, Postgres>,
    record: &NewOutboxRecord,
) -> StorageResult<OutboxRecord> {
    record.validate()?;

    let inserted = sqlx::query_as::<_, OutboxRecord>(&format!(
        r#"
        INSERT INTO outbox_events
            (id, event_type, aggregate_type, aggregate_id, payload)
        VALUES ($1, $2, $3, $4, $5)
        RETURNING {RECORD_COLUMNS}
        "#
    ))
    .bind(record.id)
    .bind(&record.event_type)
    .bind(&record.aggregate_type)
    .bind(&record.aggregate_id)
    .bind(Value::Object(record.payload.clone()))
    .fetch_one(&mut **tx)
    .await?;

    tracing::debug!(
        event_id = %inserted.id,
        event_type = %inserted.event_type,
        aggregate_type = %inserted.aggregate_type,
        "Event appended to outbox"
    );

    Ok(inserted)
}

/// Append a typed domain event within the caller's transaction
pub async fn append_event<E: DomainEvent>(
    tx: &mut Transaction<'_, Postgres>,
    event: &E,
) -> StorageResult<OutboxRecord> {
    let record = NewOutboxRecord::from_event(event)?;
    append(tx, &record).await
}

/// Lock up to `limit` pending records, oldest first
///
/// Rows written by one transaction share `created_at` (`NOW()` is the
/// transaction start), so `seq` orders them in append order.
///
/// `SKIP LOCKED` excludes rows another open claim already holds, so
/// concurrent callers partition the pending set instead of blocking on each
/// other. The locks live until `tx` commits or rolls back.
///
/// The cutoff is the database clock, the same clock that stamped
/// `created_at`, so skew on the relay host never delays a record.
pub async fn claim_batch(
    tx: &mut Transaction<'_, Postgres>,
    limit: i64,
) -> StorageResult<Vec<OutboxRecord>> {
    let records = sqlx::query_as::<_, OutboxRecord>(&format!(
        r#"
        SELECT {RECORD_COLUMNS}
        FROM outbox_events
        WHERE status = 'pending'
          AND created_at <= NOW()
        ORDER BY created_at ASC, seq ASC
        LIMIT $1
        FOR UPDATE SKIP LOCKED
        "#
    ))
    .bind(limit)
    .fetch_all(&mut **tx)
    .await?;

    Ok(records)
}

/// Transition a record to processed
///
/// Returns `false` when the record was already processed (or does not
/// exist); calling it twice is harmless.
pub async fn mark_processed(
    tx: &mut Transaction<'_, Postgres>,
    id: Uuid,
    processed_at: DateTime<Utc>,
) -> StorageResult<bool> {
    let result = sqlx::query(
        r#"
        UPDATE outbox_events
        SET status = 'processed', processed_at = $2
        WHERE id = $1 AND status = 'pending'
        "#,
    )
    .bind(id)
    .bind(processed_at)
    .execute(&mut **tx)
    .await?;

    Ok(result.rows_affected() > 0)
}

/// Fetch a single record by id
pub async fn fetch(pool: &PgPool, id: Uuid) -> StorageResult<Option<OutboxRecord>> {
    let record = sqlx::query_as::<_, OutboxRecord>(&format!(
        "SELECT {RECORD_COLUMNS} FROM outbox_events WHERE id = $1"
    ))
    .bind(id)
    .fetch_optional(pool)
    .await?;

    Ok(record)
}

/// Number of records still waiting for delivery
pub async fn count_pending(pool: &PgPool) -> StorageResult<i64> {
    let count = sqlx::query_scalar::<_, i64>(
        "SELECT COUNT(*) FROM outbox_events WHERE status = 'pending'",
    )
    .fetch_one(pool)
    .await?;

    Ok(count)
}
