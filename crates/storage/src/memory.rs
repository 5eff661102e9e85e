//! In-memory storage backend.
//!
//! [`InMemoryStorage`] keeps every table in process memory. It is used by the
//! test suites, the scenario replayer and local development.
//!
//! ## Transaction model
//!
//! A single writer lock serializes snapshots. `begin_snapshot` takes the lock
//! and shares the committed tables with the snapshot; the first batch copies
//! them into a private working set (copy-on-write), and later batches apply in
//! place, journaling each touched row so a failed batch is rolled back.
//! `commit_snapshot` publishes the working set as the new committed state.
//! Aborting (or dropping) the snapshot discards it and releases the lock.
//!
//! Queries outside a snapshot read the last committed state and never wait on
//! an open snapshot.
//!
//! ## Limitations
//!
//! - **No durability**: all state is lost when the process exits
//! - **Whole-store serialization**: snapshots on unrelated entities do not run
//!   in parallel
//! - **Copy per writing snapshot**: the first write of a snapshot copies every
//!   table, so a writing unit of work costs time proportional to the stored
//!   state. Read-only snapshots copy nothing.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};

use async_trait::async_trait;
use tokio::sync::{Mutex, OwnedMutexGuard};

use crate::batch::{WriteBatch, WriteOp, WriteOutcome};
use crate::error::StorageError;
use crate::record::{
    EntityKey, EntityKind, EntityRecord, Micros, WorkItemHistoryRecord, WorkItemRecord,
    WorkItemState, WorkerRecord,
};
use crate::traits::TimelineStorage;

#[derive(Debug, Clone, Default)]
struct Tables {
    active: BTreeMap<EntityKey, EntityRecord>,
    history: BTreeMap<EntityKey, BTreeMap<Micros, EntityRecord>>,
    work_items: BTreeMap<i64, WorkItemRecord>,
    work_item_history: BTreeMap<i64, BTreeMap<Micros, WorkItemHistoryRecord>>,
    workers: BTreeMap<(String, i64), WorkerRecord>,
}

/// The prior value of one row touched by a batch, for rolling the batch back.
#[derive(Debug)]
enum Undo {
    Active(EntityKey, Option<EntityRecord>),
    History(EntityKey, Micros, Option<EntityRecord>),
    WorkItem(i64, Option<WorkItemRecord>),
    WorkItemHistory(i64, Micros, Option<WorkItemHistoryRecord>),
    Worker((String, i64), Option<WorkerRecord>),
}

fn restore<K: Ord, V>(map: &mut BTreeMap<K, V>, key: K, prev: Option<V>) {
    match prev {
        Some(row) => {
            map.insert(key, row);
        }
        None => {
            map.remove(&key);
        }
    }
}

impl Tables {
    /// Apply one write, returning the number of rows it affected. Every row
    /// changed is recorded in `journal` first; a write that fails changes
    /// nothing.
    fn apply(&mut self, op: WriteOp, journal: &mut Vec<Undo>) -> Result<usize, StorageError> {
        match op {
            WriteOp::InsertActive(record) => {
                if self.active.contains_key(&record.key) {
                    return Err(StorageError::AlreadyExists { key: record.key });
                }
                journal.push(Undo::Active(record.key.clone(), None));
                self.active.insert(record.key.clone(), record);
                Ok(1)
            }
            WriteOp::UpdateActive(record) => match self.active.get_mut(&record.key) {
                Some(row) => {
                    let prev = std::mem::replace(row, record);
                    journal.push(Undo::Active(prev.key.clone(), Some(prev)));
                    Ok(1)
                }
                None => Ok(0),
            },
            WriteOp::DeleteActive(key) => match self.active.remove(&key) {
                Some(prev) => {
                    journal.push(Undo::Active(key, Some(prev)));
                    Ok(1)
                }
                None => Ok(0),
            },
            WriteOp::InsertHistory(record) => {
                let rows = self.history.entry(record.key.clone()).or_default();
                if rows.contains_key(&record.change_ts) {
                    return Err(StorageError::DuplicateHistory {
                        key: record.key,
                        ts: record.change_ts,
                    });
                }
                journal.push(Undo::History(record.key.clone(), record.change_ts, None));
                rows.insert(record.change_ts, record);
                Ok(1)
            }
            WriteOp::InsertWorkItem(record) => {
                if self.work_items.contains_key(&record.id) {
                    return Err(StorageError::AlreadyExists {
                        key: EntityKey::work_item(record.id),
                    });
                }
                journal.push(Undo::WorkItem(record.id, None));
                self.work_items.insert(record.id, record);
                Ok(1)
            }
            WriteOp::UpdateWorkItem(record) => match self.work_items.get_mut(&record.id) {
                Some(row) => {
                    let prev = std::mem::replace(row, record);
                    journal.push(Undo::WorkItem(prev.id, Some(prev)));
                    Ok(1)
                }
                None => Ok(0),
            },
            WriteOp::DeleteWorkItem(id) => match self.work_items.remove(&id) {
                Some(prev) => {
                    journal.push(Undo::WorkItem(id, Some(prev)));
                    Ok(1)
                }
                None => Ok(0),
            },
            WriteOp::InsertWorkItemHistory(record) => {
                let id = record.item.id;
                let rows = self.work_item_history.entry(id).or_default();
                if rows.contains_key(&record.ts()) {
                    return Err(StorageError::DuplicateHistory {
                        key: EntityKey::work_item(id),
                        ts: record.ts(),
                    });
                }
                journal.push(Undo::WorkItemHistory(id, record.ts(), None));
                rows.insert(record.ts(), record);
                Ok(1)
            }
            WriteOp::ReplaceWorkItemHistory { at_ts, record } => {
                let id = record.item.id;
                let Some(rows) = self.work_item_history.get_mut(&id) else {
                    return Ok(0);
                };
                if !rows.contains_key(&at_ts) {
                    return Ok(0);
                }
                let new_ts = record.ts();
                if new_ts != at_ts && rows.contains_key(&new_ts) {
                    return Err(StorageError::DuplicateHistory {
                        key: EntityKey::work_item(id),
                        ts: new_ts,
                    });
                }
                let prev = rows.remove(&at_ts);
                if new_ts != at_ts {
                    journal.push(Undo::WorkItemHistory(id, new_ts, None));
                }
                journal.push(Undo::WorkItemHistory(id, at_ts, prev));
                rows.insert(new_ts, record);
                Ok(1)
            }
            WriteOp::UpsertWorker(record) => {
                let key = (record.kind.clone(), record.id);
                let prev = self.workers.insert(key.clone(), record);
                journal.push(Undo::Worker(key, prev));
                Ok(1)
            }
            WriteOp::DeleteWorker { kind, id } => {
                let key = (kind, id);
                match self.workers.remove(&key) {
                    Some(prev) => {
                        journal.push(Undo::Worker(key, Some(prev)));
                        Ok(1)
                    }
                    None => Ok(0),
                }
            }
        }
    }

    /// Undo journaled writes, newest first.
    fn roll_back(&mut self, journal: Vec<Undo>) {
        for undo in journal.into_iter().rev() {
            match undo {
                Undo::Active(key, prev) => restore(&mut self.active, key, prev),
                Undo::History(key, ts, prev) => {
                    if let Some(rows) = self.history.get_mut(&key) {
                        restore(rows, ts, prev);
                        if rows.is_empty() {
                            self.history.remove(&key);
                        }
                    }
                }
                Undo::WorkItem(id, prev) => restore(&mut self.work_items, id, prev),
                Undo::WorkItemHistory(id, ts, prev) => {
                    if let Some(rows) = self.work_item_history.get_mut(&id) {
                        restore(rows, ts, prev);
                        if rows.is_empty() {
                            self.work_item_history.remove(&id);
                        }
                    }
                }
                Undo::Worker(key, prev) => restore(&mut self.workers, key, prev),
            }
        }
    }
}

/// A snapshot of [`InMemoryStorage`]: holds the writer lock and its working
/// tables. The tables are shared with the committed state until the first
/// write.
pub struct MemorySnapshot {
    _writer: OwnedMutexGuard<()>,
    working: Arc<Tables>,
}

impl std::fmt::Debug for MemorySnapshot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemorySnapshot")
            .field("active_rows", &self.working.active.len())
            .field("work_items", &self.working.work_items.len())
            .finish()
    }
}

/// In-memory timeline storage.
///
/// ## Example
///
/// ```rust
/// use timeline_storage::InMemoryStorage;
///
/// let storage = InMemoryStorage::new();
/// // Use storage in tests...
/// ```
#[derive(Debug)]
pub struct InMemoryStorage {
    committed: RwLock<Arc<Tables>>,
    writer: Arc<Mutex<()>>,
    next_work_item_id: AtomicI64,
}

impl Default for InMemoryStorage {
    fn default() -> Self {
        Self::new()
    }
}

/// Converts a lock poison error to a storage error.
fn poison_err<T>(_: PoisonError<T>) -> StorageError {
    StorageError::Backend("lock poisoned".to_string())
}

impl InMemoryStorage {
    /// Creates an empty store. Work item ids start at 1.
    #[must_use]
    pub fn new() -> Self {
        Self::with_first_work_item_id(1)
    }

    /// Creates an empty store whose first reserved work item id is `first`.
    #[must_use]
    pub fn with_first_work_item_id(first: i64) -> Self {
        Self {
            committed: RwLock::new(Arc::new(Tables::default())),
            writer: Arc::new(Mutex::new(())),
            next_work_item_id: AtomicI64::new(first),
        }
    }

    fn committed(&self) -> Result<Arc<Tables>, StorageError> {
        Ok(Arc::clone(&*self.committed.read().map_err(poison_err)?))
    }
}

#[async_trait]
impl TimelineStorage for InMemoryStorage {
    type Snapshot = MemorySnapshot;

    async fn begin_snapshot(&self) -> Result<MemorySnapshot, StorageError> {
        let writer = Arc::clone(&self.writer).lock_owned().await;
        let working = self.committed()?;
        Ok(MemorySnapshot {
            _writer: writer,
            working,
        })
    }

    async fn commit_snapshot(&self, snapshot: MemorySnapshot) -> Result<(), StorageError> {
        let MemorySnapshot { _writer, working } = snapshot;
        *self.committed.write().map_err(poison_err)? = working;
        Ok(())
    }

    async fn abort_snapshot(&self, snapshot: MemorySnapshot) -> Result<(), StorageError> {
        drop(snapshot);
        Ok(())
    }

    async fn get_active_for_update(
        &self,
        snapshot: &mut MemorySnapshot,
        key: &EntityKey,
    ) -> Result<Option<EntityRecord>, StorageError> {
        Ok(snapshot.working.active.get(key).cloned())
    }

    async fn history_exists_at(
        &self,
        snapshot: &mut MemorySnapshot,
        key: &EntityKey,
        ts: Micros,
    ) -> Result<bool, StorageError> {
        let tables = &snapshot.working;
        if key.kind == EntityKind::WorkItem {
            let id: i64 = key
                .id
                .parse()
                .map_err(|_| StorageError::Backend(format!("invalid work item key {key}")))?;
            return Ok(tables
                .work_item_history
                .get(&id)
                .is_some_and(|rows| rows.contains_key(&ts)));
        }
        Ok(tables
            .history
            .get(key)
            .is_some_and(|rows| rows.contains_key(&ts)))
    }

    async fn preceding_history(
        &self,
        snapshot: &mut MemorySnapshot,
        key: &EntityKey,
        ts: Micros,
    ) -> Result<Option<EntityRecord>, StorageError> {
        Ok(snapshot
            .working
            .history
            .get(key)
            .and_then(|rows| rows.range(..ts).next_back())
            .map(|(_, row)| row.clone()))
    }

    async fn list_active_children(
        &self,
        snapshot: &mut MemorySnapshot,
        kind: EntityKind,
        parent_id: &str,
    ) -> Result<Vec<EntityRecord>, StorageError> {
        Ok(snapshot
            .working
            .active
            .values()
            .filter(|r| r.key.kind == kind && r.parent_id.as_deref() == Some(parent_id))
            .cloned()
            .collect())
    }

    async fn get_work_item_for_update(
        &self,
        snapshot: &mut MemorySnapshot,
        id: i64,
    ) -> Result<Option<WorkItemRecord>, StorageError> {
        Ok(snapshot.working.work_items.get(&id).cloned())
    }

    async fn list_work_items_in_state(
        &self,
        snapshot: &mut MemorySnapshot,
        state: WorkItemState,
    ) -> Result<Vec<WorkItemRecord>, StorageError> {
        Ok(snapshot
            .working
            .work_items
            .values()
            .filter(|w| w.state == state)
            .cloned()
            .collect())
    }

    async fn latest_work_item_history(
        &self,
        snapshot: &mut MemorySnapshot,
        id: i64,
        state: WorkItemState,
        owner: Option<i64>,
    ) -> Result<Option<WorkItemHistoryRecord>, StorageError> {
        Ok(snapshot.working.work_item_history.get(&id).and_then(|rows| {
            rows.values()
                .rev()
                .find(|h| h.item.state == state && h.item.working_adapter_id == owner)
                .cloned()
        }))
    }

    async fn next_work_item_id(&self, _snapshot: &mut MemorySnapshot) -> Result<i64, StorageError> {
        Ok(self.next_work_item_id.fetch_add(1, Ordering::SeqCst))
    }

    async fn list_live_workers(
        &self,
        snapshot: &mut MemorySnapshot,
    ) -> Result<Vec<WorkerRecord>, StorageError> {
        Ok(snapshot.working.workers.values().cloned().collect())
    }

    async fn execute_batch(
        &self,
        snapshot: &mut MemorySnapshot,
        batch: WriteBatch,
    ) -> Result<Vec<WriteOutcome>, StorageError> {
        if batch.is_empty() {
            return Ok(Vec::new());
        }
        let tables = Arc::make_mut(&mut snapshot.working);
        let mut journal = Vec::with_capacity(batch.len());
        let mut outcomes = Vec::with_capacity(batch.len());
        for (index, write) in batch.into_writes().into_iter().enumerate() {
            let op = write.op.name();
            let rows = match tables.apply(write.op, &mut journal) {
                Ok(rows) => rows,
                Err(e) => {
                    tables.roll_back(journal);
                    return Err(e);
                }
            };
            if !write.expect.admits(rows) {
                tables.roll_back(journal);
                return Err(StorageError::ExpectationViolated {
                    index,
                    op,
                    expected: write.expect,
                    actual: rows,
                });
            }
            outcomes.push(WriteOutcome {
                rows_affected: rows,
            });
        }
        Ok(outcomes)
    }

    async fn get_active(&self, key: &EntityKey) -> Result<Option<EntityRecord>, StorageError> {
        Ok(self.committed()?.active.get(key).cloned())
    }

    async fn list_active(
        &self,
        kind: EntityKind,
        state_filter: Option<&str>,
    ) -> Result<Vec<EntityRecord>, StorageError> {
        Ok(self
            .committed()?
            .active
            .values()
            .filter(|r| r.key.kind == kind)
            .filter(|r| state_filter.map_or(true, |s| r.state == s))
            .cloned()
            .collect())
    }

    async fn list_history(&self, key: &EntityKey) -> Result<Vec<EntityRecord>, StorageError> {
        Ok(self
            .committed()?
            .history
            .get(key)
            .map(|rows| rows.values().cloned().collect())
            .unwrap_or_default())
    }

    async fn get_work_item(&self, id: i64) -> Result<Option<WorkItemRecord>, StorageError> {
        Ok(self.committed()?.work_items.get(&id).cloned())
    }

    async fn list_work_item_history(
        &self,
        id: i64,
    ) -> Result<Vec<WorkItemHistoryRecord>, StorageError> {
        Ok(self
            .committed()?
            .work_item_history
            .get(&id)
            .map(|rows| rows.values().cloned().collect())
            .unwrap_or_default())
    }

    async fn list_workers(&self) -> Result<Vec<WorkerRecord>, StorageError> {
        Ok(self.committed()?.workers.values().cloned().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conformance::run_conformance_suite;
    use crate::record::Fields;

    fn node(id: &str, ts: Micros) -> EntityRecord {
        EntityRecord {
            key: EntityKey::new(EntityKind::ComputeNode, id),
            parent_id: None,
            state: "A".to_string(),
            change_ts: ts,
            db_updated_ts: ts,
            last_chg_adapter_type: "TEST".to_string(),
            last_chg_work_item_id: -1,
            fields: Fields::new(),
        }
    }

    #[tokio::test]
    async fn in_memory_conformance() {
        let report = run_conformance_suite(|| async { InMemoryStorage::new() }).await;
        assert_eq!(report.failed, 0, "{report}");
        assert!(report.total > 0);
    }

    #[tokio::test]
    async fn failed_batch_leaves_snapshot_untouched() {
        let storage = InMemoryStorage::new();
        let mut snap = storage.begin_snapshot().await.unwrap();

        let mut batch = WriteBatch::new();
        batch
            .insert_active(node("R0-CN0", 10))
            .update_active(node("R0-CN1", 10));
        let err = storage.execute_batch(&mut snap, batch).await.unwrap_err();
        assert!(matches!(
            err,
            StorageError::ExpectationViolated { index: 1, actual: 0, .. }
        ));

        // The insert staged before the violation is not visible in the snapshot.
        let key = EntityKey::new(EntityKind::ComputeNode, "R0-CN0");
        assert!(storage
            .get_active_for_update(&mut snap, &key)
            .await
            .unwrap()
            .is_none());
        storage.abort_snapshot(snap).await.unwrap();
    }

    #[tokio::test]
    async fn work_item_ids_are_not_reused_after_abort() {
        let storage = InMemoryStorage::with_first_work_item_id(40_000_000_000);
        let mut snap = storage.begin_snapshot().await.unwrap();
        let first = storage.next_work_item_id(&mut snap).await.unwrap();
        storage.abort_snapshot(snap).await.unwrap();

        let mut snap = storage.begin_snapshot().await.unwrap();
        let second = storage.next_work_item_id(&mut snap).await.unwrap();
        storage.commit_snapshot(snap).await.unwrap();

        assert_eq!(first, 40_000_000_000);
        assert_eq!(second, first + 1);
    }

    #[tokio::test]
    async fn dropped_snapshot_releases_writer_lock() {
        let storage = InMemoryStorage::new();
        {
            let mut snap = storage.begin_snapshot().await.unwrap();
            let mut batch = WriteBatch::new();
            batch.insert_active(node("R0-CN0", 10));
            storage.execute_batch(&mut snap, batch).await.unwrap();
        }
        // A new snapshot can begin, and the dropped one left nothing behind.
        let snap = storage.begin_snapshot().await.unwrap();
        storage.commit_snapshot(snap).await.unwrap();
        let key = EntityKey::new(EntityKind::ComputeNode, "R0-CN0");
        assert!(storage.get_active(&key).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn read_only_snapshot_shares_committed_tables() {
        let storage = InMemoryStorage::new();
        let mut snap = storage.begin_snapshot().await.unwrap();
        let mut batch = WriteBatch::new();
        batch.insert_active(node("R0-CN0", 10));
        storage.execute_batch(&mut snap, batch).await.unwrap();
        storage.commit_snapshot(snap).await.unwrap();

        let mut snap = storage.begin_snapshot().await.unwrap();
        let key = EntityKey::new(EntityKind::ComputeNode, "R0-CN0");
        assert!(storage
            .get_active_for_update(&mut snap, &key)
            .await
            .unwrap()
            .is_some());
        assert!(Arc::ptr_eq(&snap.working, &storage.committed().unwrap()));

        let mut batch = WriteBatch::new();
        batch.delete_active(key);
        storage.execute_batch(&mut snap, batch).await.unwrap();
        assert!(!Arc::ptr_eq(&snap.working, &storage.committed().unwrap()));
        storage.abort_snapshot(snap).await.unwrap();
    }

    #[tokio::test]
    async fn failed_batch_rolls_back_only_its_own_writes() {
        let storage = InMemoryStorage::new();
        let key = EntityKey::new(EntityKind::ComputeNode, "R0-CN0");
        let worker = WorkerRecord {
            kind: "RAS".to_string(),
            id: 5,
            lctn: "SN0".to_string(),
            pid: 100,
            started_ts: 1,
        };
        let mut snap = storage.begin_snapshot().await.unwrap();

        let mut first = WriteBatch::new();
        first
            .insert_active(node("R0-CN0", 10))
            .insert_history(node("R0-CN0", 10))
            .upsert_worker(worker.clone());
        storage.execute_batch(&mut snap, first).await.unwrap();

        let mut second = WriteBatch::new();
        second
            .update_active(node("R0-CN0", 20))
            .insert_history(node("R0-CN0", 20))
            .delete_worker("RAS", 5)
            .insert_history(node("R0-CN1", 20))
            .insert_active(node("R0-CN0", 30));
        let err = storage.execute_batch(&mut snap, second).await.unwrap_err();
        assert!(matches!(err, StorageError::AlreadyExists { .. }));

        let active = storage
            .get_active_for_update(&mut snap, &key)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(active.change_ts, 10);
        assert!(storage.history_exists_at(&mut snap, &key, 10).await.unwrap());
        assert!(!storage.history_exists_at(&mut snap, &key, 20).await.unwrap());
        assert_eq!(
            storage.list_live_workers(&mut snap).await.unwrap(),
            vec![worker]
        );
        let other = EntityKey::new(EntityKind::ComputeNode, "R0-CN1");
        assert!(!snap.working.history.contains_key(&other));

        storage.commit_snapshot(snap).await.unwrap();
        assert_eq!(storage.list_history(&key).await.unwrap().len(), 1);
    }
}
