mod common;

use chrono::Utc;
use common::{append_committed, get_test_pool, reset_outbox, user_created};
use event_bus::{InMemoryPublisher, MessagePublisher, TopicRouter};
use outbox_relay_rs::repos::outbox_repo;
use outbox_relay_rs::store::{ClaimScope, OutboxStore, PgOutboxStore};
use outbox_relay_rs::{NewOutboxRecord, OutboxStatus, OutboxWorker, StorageError, WorkerConfig};
use serde_json::Map;
use serial_test::serial;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

#[tokio::test]
#[serial]
#[ignore]
async fn test_append_is_discarded_with_rolled_back_transaction() {
    let pool = get_test_pool().await;
    reset_outbox(&pool).await;
    let record = user_created("u-rollback");

    let mut tx = pool.begin().await.expect("Failed to begin transaction");
    outbox_relay_rs::append(&mut tx, &record)
        .await
        .expect("Failed to append");
    tx.rollback().await.expect("Failed to roll back");

    let stored = outbox_repo::fetch(&pool, record.id)
        .await
        .expect("Failed to fetch");
    assert!(stored.is_none(), "Rolled back append must leave no record");
}

#[tokio::test]
#[serial]
#[ignore]
async fn test_append_commits_pending_record() {
    let pool = get_test_pool().await;
    reset_outbox(&pool).await;
    let record = user_created("u-1");

    append_committed(&pool, &record).await;

    let stored = outbox_repo::fetch(&pool, record.id)
        .await
        .expect("Failed to fetch")
        .expect("Record should exist after commit");
    assert_eq!(stored.status, OutboxStatus::Pending);
    assert!(stored.processed_at.is_none());
    assert_eq!(stored.payload["user_id"], "u-1");
    assert_eq!(outbox_repo::count_pending(&pool).await.unwrap(), 1);
}

#[tokio::test]
#[serial]
#[ignore]
async fn test_append_rejects_blank_event_type() {
    let pool = get_test_pool().await;
    let record = NewOutboxRecord::new("  ", "user", "u-1", Map::new());

    let mut tx = pool.begin().await.expect("Failed to begin transaction");
    let result = outbox_relay_rs::append(&mut tx, &record).await;

    assert!(matches!(result, Err(StorageError::InvalidRecord(_))));
}

#[tokio::test]
#[serial]
#[ignore]
async fn test_claim_returns_oldest_first_up_to_limit() {
    let pool = get_test_pool().await;
    reset_outbox(&pool).await;

    let mut ids = Vec::new();
    for i in 0..5 {
        let record = user_created(&format!("u-{}", i));
        ids.push(record.id);
        append_committed(&pool, &record).await;
    }

    let store = PgOutboxStore::new(pool.clone());
    let mut scope = store.begin().await.expect("Failed to begin scope");
    let batch = scope
        .claim_batch(3, Utc::now())
        .await
        .expect("Failed to claim");
    scope.rollback().await.expect("Failed to roll back");

    let claimed: Vec<_> = batch.iter().map(|r| r.id).collect();
    assert_eq!(claimed, ids[..3].to_vec());
}

#[tokio::test]
#[serial]
#[ignore]
async fn test_claim_keeps_append_order_within_one_transaction() {
    let pool = get_test_pool().await;
    reset_outbox(&pool).await;

    let created = user_created("u-seq");
    let updated = NewOutboxRecord::new("user.updated", "user", "u-seq", Map::new());
    let mut tx = pool.begin().await.expect("Failed to begin transaction");
    outbox_relay_rs::append(&mut tx, &created).await.unwrap();
    outbox_relay_rs::append(&mut tx, &updated).await.unwrap();
    tx.commit().await.expect("Failed to commit");

    // Rewrite the first row so its tuple moves behind the second one
    sqlx::query("UPDATE outbox_events SET payload = payload WHERE id = $1")
        .bind(created.id)
        .execute(&pool)
        .await
        .expect("Failed to touch row");

    let first = outbox_repo::fetch(&pool, created.id).await.unwrap().unwrap();
    let second = outbox_repo::fetch(&pool, updated.id).await.unwrap().unwrap();
    assert_eq!(first.created_at, second.created_at);

    let store = PgOutboxStore::new(pool.clone());
    let mut scope = store.begin().await.expect("Failed to begin scope");
    let batch = scope.claim_batch(10, Utc::now()).await.expect("claim");
    scope.rollback().await.unwrap();

    let order: Vec<_> = batch.iter().map(|r| r.event_type.as_str()).collect();
    assert_eq!(order, vec!["user.created", "user.updated"]);
}

#[tokio::test]
#[serial]
#[ignore]
async fn test_claim_cutoff_uses_database_clock() {
    let pool = get_test_pool().await;
    reset_outbox(&pool).await;
    append_committed(&pool, &user_created("u-skew")).await;

    // Relay host clock an hour behind the database
    let store = PgOutboxStore::new(pool.clone());
    let mut scope = store.begin().await.expect("Failed to begin scope");
    let batch = scope
        .claim_batch(10, Utc::now() - chrono::Duration::hours(1))
        .await
        .expect("claim");
    scope.rollback().await.unwrap();

    assert_eq!(batch.len(), 1);
}

#[tokio::test]
#[serial]
#[ignore]
async fn test_concurrent_claims_skip_locked_rows() {
    let pool = get_test_pool().await;
    reset_outbox(&pool).await;
    for i in 0..6 {
        append_committed(&pool, &user_created(&format!("u-{}", i))).await;
    }

    let store = PgOutboxStore::new(pool.clone());
    let mut first = store.begin().await.expect("Failed to begin first scope");
    let mut second = store.begin().await.expect("Failed to begin second scope");

    let a = first.claim_batch(4, Utc::now()).await.expect("first claim");
    let b = second.claim_batch(4, Utc::now()).await.expect("second claim");

    assert_eq!(a.len(), 4);
    assert_eq!(b.len(), 2, "Second claim must skip rows locked by the first");
    let a_ids: HashSet<_> = a.iter().map(|r| r.id).collect();
    assert!(b.iter().all(|r| !a_ids.contains(&r.id)));

    first.rollback().await.unwrap();
    second.rollback().await.unwrap();
}

#[tokio::test]
#[serial]
#[ignore]
async fn test_dropped_scope_releases_row_locks() {
    let pool = get_test_pool().await;
    reset_outbox(&pool).await;
    append_committed(&pool, &user_created("u-crash")).await;

    let store = PgOutboxStore::new(pool.clone());
    {
        let mut scope = store.begin().await.expect("Failed to begin scope");
        let batch = scope.claim_batch(10, Utc::now()).await.unwrap();
        assert_eq!(batch.len(), 1);
        // scope dropped without commit, as in a worker crash
    }

    let mut scope = store.begin().await.expect("Failed to begin scope");
    let batch = scope.claim_batch(10, Utc::now()).await.unwrap();
    assert_eq!(batch.len(), 1, "Record must be claimable again");
    scope.rollback().await.unwrap();
}

#[tokio::test]
#[serial]
#[ignore]
async fn test_mark_processed_is_idempotent() {
    let pool = get_test_pool().await;
    reset_outbox(&pool).await;
    let record = user_created("u-mark");
    append_committed(&pool, &record).await;

    let mut tx = pool.begin().await.unwrap();
    let first = outbox_repo::mark_processed(&mut tx, record.id, Utc::now())
        .await
        .unwrap();
    let second = outbox_repo::mark_processed(&mut tx, record.id, Utc::now())
        .await
        .unwrap();
    tx.commit().await.unwrap();

    assert!(first);
    assert!(!second);

    let stored = outbox_repo::fetch(&pool, record.id).await.unwrap().unwrap();
    assert_eq!(stored.status, OutboxStatus::Processed);
    assert!(stored.processed_at.is_some());

    let mut tx = pool.begin().await.unwrap();
    let batch = outbox_repo::claim_batch(&mut tx, 10).await.unwrap();
    assert!(batch.is_empty(), "Processed records are never claimed");
}

#[tokio::test]
#[serial]
#[ignore]
async fn test_worker_drains_postgres_outbox() {
    let pool = get_test_pool().await;
    reset_outbox(&pool).await;
    for i in 0..12 {
        append_committed(&pool, &user_created(&format!("u-{}", i))).await;
    }

    let publisher = InMemoryPublisher::new();
    publisher.start().await.unwrap();
    let worker = OutboxWorker::new(
        "pg-worker",
        PgOutboxStore::new(pool.clone()),
        Arc::new(publisher.clone()),
        TopicRouter::new("chat"),
        WorkerConfig {
            batch_size: 5,
            poll_interval: Duration::from_millis(20),
            max_backoff: Duration::from_millis(200),
        },
    );

    for _ in 0..3 {
        worker.poll_cycle().await.expect("cycle should succeed");
    }

    assert_eq!(outbox_repo::count_pending(&pool).await.unwrap(), 0);
    let published = publisher.published();
    assert_eq!(published.len(), 12);
    assert!(published.iter().all(|m| m.topic == "chat.user.events"));
}
