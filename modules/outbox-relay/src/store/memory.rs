use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use std::collections::HashSet;
use std::sync::{Arc, Mutex, MutexGuard};
use uuid::Uuid;

use super::{ClaimScope, OutboxStore};
use crate::error::{StorageError, StorageResult};
use crate::models::{NewOutboxRecord, OutboxRecord, OutboxStatus};

#[derive(Default)]
struct State {
    // (append sequence, record); sequence breaks created_at ties
    records: Vec<(u64, OutboxRecord)>,
    next_seq: u64,
    locked: HashSet<Uuid>,
    claim_failures: usize,
    commit_failures: usize,
    mark_failures: HashSet<Uuid>,
    mark_calls: usize,
    transitions: usize,
}

impl State {
    fn release(&mut self, ids: &[Uuid]) {
        for id in ids {
            self.locked.remove(id);
        }
    }
}

/// Record store held in process memory
///
/// Mirrors the Postgres claim semantics: claims are exclusive per scope,
/// marks become visible on commit, and an unfinished scope releases its
/// claims when dropped. Appends commit immediately.
///
/// Failures can be injected to exercise the worker's storage error handling.
#[derive(Clone, Default)]
pub struct InMemoryOutboxStore {
    state: Arc<Mutex<State>>,
}

impl InMemoryOutboxStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> StorageResult<MutexGuard<'_, State>> {
        lock_state(&self.state)
    }

    /// Append a committed record stamped with the current time
    pub fn append(&self, record: NewOutboxRecord) -> StorageResult<OutboxRecord> {
        self.append_at(record, Utc::now())
    }

    /// Append a committed record with an explicit `created_at`
    pub fn append_at(
        &self,
        record: NewOutboxRecord,
        created_at: DateTime<Utc>,
    ) -> StorageResult<OutboxRecord> {
        record.validate()?;

        let stored = OutboxRecord {
            id: record.id,
            event_type: record.event_type,
            aggregate_type: record.aggregate_type,
            aggregate_id: record.aggregate_id,
            payload: Value::Object(record.payload),
            status: OutboxStatus::Pending,
            created_at,
            processed_at: None,
        };

        let mut state = self.lock()?;
        if state.records.iter().any(|(_, r)| r.id == stored.id) {
            return Err(StorageError::InvalidRecord(format!(
                "duplicate outbox record id {}",
                stored.id
            )));
        }
        let seq = state.next_seq;
        state.next_seq += 1;
        state.records.push((seq, stored.clone()));

        Ok(stored)
    }

    pub fn get(&self, id: Uuid) -> Option<OutboxRecord> {
        self.lock().ok().and_then(|state| {
            state
                .records
                .iter()
                .find(|(_, r)| r.id == id)
                .map(|(_, r)| r.clone())
        })
    }

    /// All records in append order
    pub fn records(&self) -> Vec<OutboxRecord> {
        self.lock()
            .map(|state| state.records.iter().map(|(_, r)| r.clone()).collect())
            .unwrap_or_default()
    }

    pub fn pending_count(&self) -> usize {
        self.lock()
            .map(|state| state.records.iter().filter(|(_, r)| r.is_pending()).count())
            .unwrap_or(0)
    }

    /// Records currently held by an open claim scope
    pub fn claimed_count(&self) -> usize {
        self.lock().map(|state| state.locked.len()).unwrap_or(0)
    }

    /// Number of `mark_processed` calls across all scopes
    pub fn mark_calls(&self) -> usize {
        self.lock().map(|state| state.mark_calls).unwrap_or(0)
    }

    /// Number of committed pending -> processed transitions
    pub fn processed_count(&self) -> usize {
        self.lock().map(|state| state.transitions).unwrap_or(0)
    }

    /// Fail the next `count` calls to `claim_batch`
    pub fn fail_next_claims(&self, count: usize) {
        if let Ok(mut state) = self.lock() {
            state.claim_failures = count;
        }
    }

    /// Fail the next `count` commits; the scope's claims and marks are discarded
    pub fn fail_next_commits(&self, count: usize) {
        if let Ok(mut state) = self.lock() {
            state.commit_failures = count;
        }
    }

    /// Fail every `mark_processed` call for `id`
    pub fn fail_mark(&self, id: Uuid) {
        if let Ok(mut state) = self.lock() {
            state.mark_failures.insert(id);
        }
    }
}

#[async_trait]
impl OutboxStore for InMemoryOutboxStore {
    type Scope = InMemoryClaimScope;

    async fn begin(&self) -> StorageResult<InMemoryClaimScope> {
        Ok(InMemoryClaimScope {
            state: self.state.clone(),
            claimed: Vec::new(),
            marks: Vec::new(),
            finished: false,
        })
    }
}

/// Claim scope over [`InMemoryOutboxStore`]
pub struct InMemoryClaimScope {
    state: Arc<Mutex<State>>,
    claimed: Vec<Uuid>,
    marks: Vec<(Uuid, DateTime<Utc>)>,
    finished: bool,
}

impl InMemoryClaimScope {
    fn finish(&mut self) -> StorageResult<MutexGuard<'_, State>> {
        self.finished = true;
        let mut state = lock_state(&self.state)?;
        state.release(&self.claimed);
        Ok(state)
    }
}

#[async_trait]
impl ClaimScope for InMemoryClaimScope {
    async fn claim_batch(
        &mut self,
        limit: usize,
        now: DateTime<Utc>,
    ) -> StorageResult<Vec<OutboxRecord>> {
        let mut state = lock_state(&self.state)?;

        if state.claim_failures > 0 {
            state.claim_failures -= 1;
            return Err(StorageError::Unavailable("injected claim failure".to_string()));
        }

        let mut candidates: Vec<(DateTime<Utc>, u64, OutboxRecord)> = state
            .records
            .iter()
            .filter(|(_, r)| r.is_pending() && r.created_at <= now && !state.locked.contains(&r.id))
            .map(|(seq, r)| (r.created_at, *seq, r.clone()))
            .collect();
        candidates.sort_by_key(|(created_at, seq, _)| (*created_at, *seq));

        let batch: Vec<OutboxRecord> = candidates
            .into_iter()
            .take(limit)
            .map(|(_, _, r)| r)
            .collect();

        for record in &batch {
            state.locked.insert(record.id);
            self.claimed.push(record.id);
        }

        Ok(batch)
    }

    async fn mark_processed(
        &mut self,
        id: Uuid,
        processed_at: DateTime<Utc>,
    ) -> StorageResult<()> {
        let mut state = lock_state(&self.state)?;
        state.mark_calls += 1;

        if state.mark_failures.contains(&id) {
            return Err(StorageError::Unavailable(format!(
                "injected mark failure for {}",
                id
            )));
        }

        self.marks.push((id, processed_at));
        Ok(())
    }

    async fn commit(mut self) -> StorageResult<()> {
        let marks = std::mem::take(&mut self.marks);
        let mut state = self.finish()?;

        if state.commit_failures > 0 {
            state.commit_failures -= 1;
            return Err(StorageError::Unavailable("injected commit failure".to_string()));
        }

        let mut applied = 0;
        for (id, processed_at) in marks {
            if let Some((_, record)) = state.records.iter_mut().find(|(_, r)| r.id == id) {
                if record.status == OutboxStatus::Pending {
                    record.status = OutboxStatus::Processed;
                    record.processed_at = Some(processed_at);
                    applied += 1;
                }
            }
        }
        state.transitions += applied;

        Ok(())
    }

    async fn rollback(mut self) -> StorageResult<()> {
        self.marks.clear();
        self.finish()?;
        Ok(())
    }
}

impl Drop for InMemoryClaimScope {
    fn drop(&mut self) {
        if self.finished {
            return;
        }
        if let Ok(mut state) = self.state.lock() {
            state.release(&self.claimed);
        }
    }
}

fn lock_state(state: &Mutex<State>) -> StorageResult<MutexGuard<'_, State>> {
    state
        .lock()
        .map_err(|_| StorageError::Unavailable("in-memory store poisoned".to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::Map;

    fn new_record(aggregate_id: &str) -> NewOutboxRecord {
        NewOutboxRecord::new("user.created", "user", aggregate_id, Map::new())
    }

    #[tokio::test]
    async fn test_concurrent_scopes_never_share_records() {
        let store = InMemoryOutboxStore::new();
        for i in 0..6 {
            store.append(new_record(&format!("u-{}", i))).unwrap();
        }

        let mut first = store.begin().await.unwrap();
        let mut second = store.begin().await.unwrap();
        let a = first.claim_batch(4, Utc::now()).await.unwrap();
        let b = second.claim_batch(4, Utc::now()).await.unwrap();

        assert_eq!(a.len(), 4);
        assert_eq!(b.len(), 2);
        assert!(a.iter().all(|r| !b.iter().any(|o| o.id == r.id)));
    }

    #[tokio::test]
    async fn test_dropped_scope_releases_claims() {
        let store = InMemoryOutboxStore::new();
        store.append(new_record("u-1")).unwrap();

        {
            let mut scope = store.begin().await.unwrap();
            let batch = scope.claim_batch(10, Utc::now()).await.unwrap();
            assert_eq!(batch.len(), 1);
            assert_eq!(store.claimed_count(), 1);
        }

        assert_eq!(store.claimed_count(), 0);
        let mut scope = store.begin().await.unwrap();
        assert_eq!(scope.claim_batch(10, Utc::now()).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_marks_apply_only_on_commit() {
        let store = InMemoryOutboxStore::new();
        let record = store.append(new_record("u-1")).unwrap();

        let mut scope = store.begin().await.unwrap();
        scope.claim_batch(10, Utc::now()).await.unwrap();
        scope.mark_processed(record.id, Utc::now()).await.unwrap();
        assert!(store.get(record.id).unwrap().is_pending());

        scope.commit().await.unwrap();

        let stored = store.get(record.id).unwrap();
        assert_eq!(stored.status, OutboxStatus::Processed);
        assert!(stored.processed_at.is_some());
    }

    #[tokio::test]
    async fn test_rollback_discards_marks() {
        let store = InMemoryOutboxStore::new();
        let record = store.append(new_record("u-1")).unwrap();

        let mut scope = store.begin().await.unwrap();
        scope.claim_batch(10, Utc::now()).await.unwrap();
        scope.mark_processed(record.id, Utc::now()).await.unwrap();
        scope.rollback().await.unwrap();

        assert!(store.get(record.id).unwrap().is_pending());
        assert_eq!(store.claimed_count(), 0);
    }

    #[tokio::test]
    async fn test_claim_excludes_future_records() {
        let store = InMemoryOutboxStore::new();
        let now = Utc::now();
        store
            .append_at(new_record("later"), now + chrono::Duration::seconds(60))
            .unwrap();
        store.append_at(new_record("now"), now).unwrap();

        let mut scope = store.begin().await.unwrap();
        let batch = scope.claim_batch(10, now).await.unwrap();

        assert_eq!(batch.len(), 1);
        assert_eq!(batch[0].aggregate_id, "now");
    }

    #[tokio::test]
    async fn test_injected_claim_failure_is_one_shot() {
        let store = InMemoryOutboxStore::new();
        store.fail_next_claims(1);

        let mut scope = store.begin().await.unwrap();
        assert!(scope.claim_batch(10, Utc::now()).await.is_err());
        assert!(scope.claim_batch(10, Utc::now()).await.is_ok());
    }

    #[test]
    fn test_append_rejects_duplicate_id() {
        let store = InMemoryOutboxStore::new();
        let record = new_record("u-1");

        store.append(record.clone()).unwrap();

        assert!(matches!(
            store.append(record),
            Err(StorageError::InvalidRecord(_))
        ));
    }
}
