use async_trait::async_trait;

use crate::batch::{WriteBatch, WriteOutcome};
use crate::error::StorageError;
use crate::record::{
    EntityKey, EntityKind, EntityRecord, Micros, WorkItemHistoryRecord, WorkItemRecord,
    WorkItemState, WorkerRecord,
};

/// The storage trait for timeline backends.
///
/// A `TimelineStorage` implementation provides durable, transactional storage
/// for entity active rows and their history, work items and their history,
/// and the live-worker registry.
///
/// ## Snapshot Semantics
///
/// Every read that feeds a decision and every write takes `&mut Self::Snapshot`,
/// a type representing an in-progress transaction. The lifecycle is:
///
/// 1. `begin_snapshot()`: start a transaction, returns a `Snapshot`
/// 2. Read rows and stage writes with `execute_batch(&mut snapshot, ..)`
/// 3. `commit_snapshot(snapshot)`: commit and consume the transaction
///    OR `abort_snapshot(snapshot)`: roll back and consume the transaction
///
/// If a `Snapshot` is dropped without committing, the underlying transaction
/// MUST be rolled back.
///
/// Snapshots are serializable: a snapshot that read an active row is never
/// interleaved with another snapshot writing that row.
///
/// ## History uniqueness
///
/// No two history rows for the same key may share a change-timestamp.
/// Inserting one fails with `StorageError::DuplicateHistory`.
///
/// ## Thread Safety
///
/// Implementations must be `Send + Sync + 'static` so they can be shared
/// across async task boundaries.
#[async_trait]
pub trait TimelineStorage: Send + Sync + 'static {
    /// The snapshot (transaction) type used by this storage backend.
    type Snapshot: Send;

    // ── Snapshot lifecycle ────────────────────────────────────────────────────

    /// Begin a new snapshot (transaction).
    async fn begin_snapshot(&self) -> Result<Self::Snapshot, StorageError>;

    /// Commit a snapshot, making all executed batches durable.
    async fn commit_snapshot(&self, snapshot: Self::Snapshot) -> Result<(), StorageError>;

    /// Abort (roll back) a snapshot, discarding all executed batches.
    async fn abort_snapshot(&self, snapshot: Self::Snapshot) -> Result<(), StorageError>;

    // ── Reads (within snapshot) ───────────────────────────────────────────────

    /// Read an entity's active row, locking it until the snapshot ends.
    ///
    /// Returns `Ok(None)` when the entity has no active row.
    async fn get_active_for_update(
        &self,
        snapshot: &mut Self::Snapshot,
        key: &EntityKey,
    ) -> Result<Option<EntityRecord>, StorageError>;

    /// Whether a history row exists at exactly `(key, ts)`.
    ///
    /// For `EntityKind::WorkItem` keys this probes the work item history.
    async fn history_exists_at(
        &self,
        snapshot: &mut Self::Snapshot,
        key: &EntityKey,
        ts: Micros,
    ) -> Result<bool, StorageError>;

    /// The latest history row for `key` with a change-timestamp strictly
    /// before `ts`.
    async fn preceding_history(
        &self,
        snapshot: &mut Self::Snapshot,
        key: &EntityKey,
        ts: Micros,
    ) -> Result<Option<EntityRecord>, StorageError>;

    /// Active rows of `kind` whose `parent_id` equals `parent_id`, ordered by id.
    async fn list_active_children(
        &self,
        snapshot: &mut Self::Snapshot,
        kind: EntityKind,
        parent_id: &str,
    ) -> Result<Vec<EntityRecord>, StorageError>;

    /// Read a work item's active row, locking it until the snapshot ends.
    async fn get_work_item_for_update(
        &self,
        snapshot: &mut Self::Snapshot,
        id: i64,
    ) -> Result<Option<WorkItemRecord>, StorageError>;

    /// Active work items in `state`, ordered by id.
    async fn list_work_items_in_state(
        &self,
        snapshot: &mut Self::Snapshot,
        state: WorkItemState,
    ) -> Result<Vec<WorkItemRecord>, StorageError>;

    /// The most recent history row of work item `id` in `state` owned by
    /// `owner`.
    async fn latest_work_item_history(
        &self,
        snapshot: &mut Self::Snapshot,
        id: i64,
        state: WorkItemState,
        owner: Option<i64>,
    ) -> Result<Option<WorkItemHistoryRecord>, StorageError>;

    /// Reserve the next work item id. Ids are never reused, even when the
    /// snapshot that reserved one is aborted.
    async fn next_work_item_id(&self, snapshot: &mut Self::Snapshot) -> Result<i64, StorageError>;

    /// All registered live workers, ordered by kind then id.
    async fn list_live_workers(
        &self,
        snapshot: &mut Self::Snapshot,
    ) -> Result<Vec<WorkerRecord>, StorageError>;

    // ── Writes (within snapshot) ──────────────────────────────────────────────

    /// Apply every planned write of `batch` in order.
    ///
    /// Returns one `WriteOutcome` per write. The first write whose row count
    /// violates its expectation fails the call with
    /// `StorageError::ExpectationViolated`; the caller must then abort the
    /// snapshot.
    async fn execute_batch(
        &self,
        snapshot: &mut Self::Snapshot,
        batch: WriteBatch,
    ) -> Result<Vec<WriteOutcome>, StorageError>;

    // ── Query operations (outside snapshot, committed data) ───────────────────

    /// Read an entity's active row without locking.
    async fn get_active(&self, key: &EntityKey) -> Result<Option<EntityRecord>, StorageError>;

    /// All active rows of `kind`, optionally filtered by state, ordered by id.
    async fn list_active(
        &self,
        kind: EntityKind,
        state_filter: Option<&str>,
    ) -> Result<Vec<EntityRecord>, StorageError>;

    /// All history rows for `key`, ordered by change-timestamp.
    async fn list_history(&self, key: &EntityKey) -> Result<Vec<EntityRecord>, StorageError>;

    /// Read a work item's active row without locking.
    async fn get_work_item(&self, id: i64) -> Result<Option<WorkItemRecord>, StorageError>;

    /// All history rows for work item `id`, ordered by timestamp.
    async fn list_work_item_history(
        &self,
        id: i64,
    ) -> Result<Vec<WorkItemHistoryRecord>, StorageError>;

    /// All registered workers, ordered by kind then id.
    async fn list_workers(&self) -> Result<Vec<WorkerRecord>, StorageError>;
}
