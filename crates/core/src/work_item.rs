//! Work item lifecycle.
//!
//! ```text
//! Queued ──start──> Working ──finish──> Finished / FinishedDueToError ──acknowledge──> Done
//!    ^                 │  \
//!    │              sweep  finish (requester not notified) ─────────────────────────> Done
//!    │                 v
//!    └──start──── Requeued
//! ```
//!
//! Every transition updates (or deletes) the active row and appends a history
//! row whose timestamp comes from the unique-timestamp allocator against the
//! work item's own history. Checkpoints may coalesce into the open `Working`
//! history row; that in-place rewrite is the only history mutation and the
//! rewritten row is flagged `coalesced`.

use serde::{Deserialize, Serialize};
use timeline_storage::{
    EntityKey, Micros, TimelineStorage, WorkItemHistoryRecord, WorkItemRecord, WorkItemState,
    WriteBatch,
};
use tracing::{debug, info};

use crate::allocator::allocate_unique_ts;
use crate::error::TimelineError;
use crate::reconcile::Requester;
use crate::timeline::Timeline;

/// A request to queue new work.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnqueueRequest {
    pub queue: String,
    /// Kind of worker that should pick the item up; compared case-insensitively.
    pub worker_kind: String,
    pub work_to_be_done: String,
    #[serde(default)]
    pub parameters: String,
    #[serde(default)]
    pub notify_when_finished: bool,
    pub requester: Requester,
}

fn invalid(item: &WorkItemRecord, to: WorkItemState) -> TimelineError {
    TimelineError::invalid_transition(
        &EntityKey::work_item(item.id),
        item.state.to_string(),
        to.to_string(),
    )
}

impl<S: TimelineStorage> Timeline<S> {
    /// Queue a new work item and return its id.
    pub async fn enqueue_work_item(&self, req: EnqueueRequest) -> Result<i64, TimelineError> {
        let mut snap = self.storage.begin_snapshot().await?;
        let result = self.enqueue_in(&mut snap, &req).await;
        self.settle(snap, result).await
    }

    async fn enqueue_in(
        &self,
        snap: &mut S::Snapshot,
        req: &EnqueueRequest,
    ) -> Result<i64, TimelineError> {
        let id = self.storage.next_work_item_id(snap).await?;
        let ts = allocate_unique_ts(
            &self.storage,
            snap,
            &EntityKey::work_item(id),
            self.now(),
            None,
            self.config.reconcile.max_timestamp_probes,
        )
        .await?;
        let item = WorkItemRecord {
            id,
            queue: req.queue.clone(),
            worker_kind: req.worker_kind.to_uppercase(),
            work_to_be_done: req.work_to_be_done.clone(),
            parameters: req.parameters.clone(),
            notify_when_finished: req.notify_when_finished,
            state: WorkItemState::Queued,
            requesting_work_item_id: req.requester.work_item_id,
            requesting_adapter_type: req.requester.adapter_type.clone(),
            working_adapter_id: None,
            working_results: None,
            results: None,
            start_ts: ts,
            db_updated_ts: ts,
            end_ts: None,
        };
        let mut batch = WriteBatch::new();
        batch
            .insert_work_item(item.clone())
            .insert_work_item_history(WorkItemHistoryRecord::transition(item));
        self.storage.execute_batch(snap, batch).await?;
        info!(id, worker_kind = %req.worker_kind, work = %req.work_to_be_done, "work item queued");
        Ok(id)
    }

    /// Claim the oldest queued or requeued item of `worker_kind` for
    /// `worker_id`, optionally restricted to `queue`.
    ///
    /// Returns `None` when nothing is available. A requeued item keeps its
    /// restart data so the new owner can resume from the last checkpoint.
    pub async fn start_work(
        &self,
        worker_kind: &str,
        worker_id: i64,
        queue: Option<&str>,
    ) -> Result<Option<WorkItemRecord>, TimelineError> {
        let mut snap = self.storage.begin_snapshot().await?;
        let result = self.start_in(&mut snap, worker_kind, worker_id, queue).await;
        self.settle(snap, result).await
    }

    async fn start_in(
        &self,
        snap: &mut S::Snapshot,
        worker_kind: &str,
        worker_id: i64,
        queue: Option<&str>,
    ) -> Result<Option<WorkItemRecord>, TimelineError> {
        let kind = worker_kind.to_uppercase();
        let mut candidates = Vec::new();
        for state in [WorkItemState::Queued, WorkItemState::Requeued] {
            candidates.extend(
                self.storage
                    .list_work_items_in_state(snap, state)
                    .await?
                    .into_iter()
                    .filter(|w| w.worker_kind == kind)
                    .filter(|w| queue.map_or(true, |q| w.queue == q)),
            );
        }
        let Some(id) = candidates.iter().map(|w| w.id).min() else {
            debug!(worker_kind = %kind, worker_id, "no work available");
            return Ok(None);
        };

        let mut item = self.locked_item(snap, id).await?;
        let ts = self.next_item_ts(snap, &item).await?;
        item.state = WorkItemState::Working;
        item.working_adapter_id = Some(worker_id);
        item.db_updated_ts = ts;

        let mut batch = WriteBatch::new();
        batch
            .update_work_item(item.clone())
            .insert_work_item_history(WorkItemHistoryRecord::transition(item.clone()));
        self.storage.execute_batch(snap, batch).await?;
        info!(id, worker_kind = %kind, worker_id, "work item started");
        Ok(Some(item))
    }

    /// Persist restart data for a working item.
    ///
    /// Without `coalesce` every checkpoint appends a history row. With
    /// `coalesce` the first checkpoint of a working period appends and later
    /// ones rewrite that checkpoint row in place.
    pub async fn save_restart_data(
        &self,
        id: i64,
        payload: &str,
        coalesce: bool,
    ) -> Result<WorkItemRecord, TimelineError> {
        let mut snap = self.storage.begin_snapshot().await?;
        let result = self.checkpoint_in(&mut snap, id, payload, coalesce).await;
        self.settle(snap, result).await
    }

    async fn checkpoint_in(
        &self,
        snap: &mut S::Snapshot,
        id: i64,
        payload: &str,
        coalesce: bool,
    ) -> Result<WorkItemRecord, TimelineError> {
        let mut item = self.locked_item(snap, id).await?;
        if item.state != WorkItemState::Working {
            return Err(invalid(&item, WorkItemState::Working));
        }
        let ts = self.next_item_ts(snap, &item).await?;
        item.working_results = Some(payload.to_string());
        item.db_updated_ts = ts;

        let open = if coalesce {
            self.storage
                .latest_work_item_history(snap, id, WorkItemState::Working, item.working_adapter_id)
                .await?
                .filter(|row| row.checkpoint)
        } else {
            None
        };

        let mut batch = WriteBatch::new();
        batch.update_work_item(item.clone());
        match open {
            Some(open) => {
                batch.replace_work_item_history(
                    open.ts(),
                    WorkItemHistoryRecord {
                        item: item.clone(),
                        checkpoint: true,
                        coalesced: true,
                    },
                );
                debug!(id, replaced_ts = open.ts(), ts, "checkpoint coalesced");
            }
            None => {
                batch.insert_work_item_history(WorkItemHistoryRecord {
                    item: item.clone(),
                    checkpoint: true,
                    coalesced: false,
                });
                debug!(id, ts, "checkpoint appended");
            }
        }
        self.storage.execute_batch(snap, batch).await?;
        Ok(item)
    }

    /// Finish a working item.
    ///
    /// When the requester asked to be notified, the item stays active as
    /// `Finished` (or `FinishedDueToError`) until acknowledged. Otherwise it
    /// collapses straight to `Done`: the active row is deleted and exactly one
    /// `Done` history row is written, preceded by a `FinishedDueToError` row
    /// when the work failed.
    pub async fn finish(
        &self,
        id: i64,
        results: &str,
        succeeded: bool,
    ) -> Result<WorkItemRecord, TimelineError> {
        let mut snap = self.storage.begin_snapshot().await?;
        let result = self.finish_in(&mut snap, id, results, succeeded).await;
        self.settle(snap, result).await
    }

    async fn finish_in(
        &self,
        snap: &mut S::Snapshot,
        id: i64,
        results: &str,
        succeeded: bool,
    ) -> Result<WorkItemRecord, TimelineError> {
        let finished = if succeeded {
            WorkItemState::Finished
        } else {
            WorkItemState::FinishedDueToError
        };
        let mut item = self.locked_item(snap, id).await?;
        if item.state != WorkItemState::Working {
            return Err(invalid(&item, finished));
        }
        let ts = self.next_item_ts(snap, &item).await?;
        item.state = finished;
        item.results = Some(results.to_string());
        item.db_updated_ts = ts;
        item.end_ts = Some(ts);

        let mut batch = WriteBatch::new();
        if item.notify_when_finished {
            batch
                .update_work_item(item.clone())
                .insert_work_item_history(WorkItemHistoryRecord::transition(item.clone()));
            self.storage.execute_batch(snap, batch).await?;
            info!(id, state = %item.state, "work item finished; awaiting acknowledgement");
            return Ok(item);
        }

        if !succeeded {
            batch.insert_work_item_history(WorkItemHistoryRecord::transition(item.clone()));
            let done_ts = self.next_item_ts(snap, &item).await?;
            item.db_updated_ts = done_ts;
            item.end_ts = Some(done_ts);
        }
        item.state = WorkItemState::Done;
        batch
            .delete_work_item(id)
            .insert_work_item_history(WorkItemHistoryRecord::transition(item.clone()));
        self.storage.execute_batch(snap, batch).await?;
        info!(id, succeeded, "work item done");
        Ok(item)
    }

    /// Acknowledge a finished item: delete its active row and write the
    /// `Done` history row. Returns the final record, results included.
    pub async fn acknowledge(&self, id: i64) -> Result<WorkItemRecord, TimelineError> {
        let mut snap = self.storage.begin_snapshot().await?;
        let result = self.acknowledge_in(&mut snap, id).await;
        self.settle(snap, result).await
    }

    async fn acknowledge_in(
        &self,
        snap: &mut S::Snapshot,
        id: i64,
    ) -> Result<WorkItemRecord, TimelineError> {
        let mut item = self.locked_item(snap, id).await?;
        if !item.state.is_finished() {
            return Err(invalid(&item, WorkItemState::Done));
        }
        let ts = self.next_item_ts(snap, &item).await?;
        item.state = WorkItemState::Done;
        item.db_updated_ts = ts;

        let mut batch = WriteBatch::new();
        batch
            .delete_work_item(id)
            .insert_work_item_history(WorkItemHistoryRecord::transition(item.clone()));
        self.storage.execute_batch(snap, batch).await?;
        info!(id, "work item acknowledged");
        Ok(item)
    }

    pub(crate) async fn locked_item(
        &self,
        snap: &mut S::Snapshot,
        id: i64,
    ) -> Result<WorkItemRecord, TimelineError> {
        self.storage
            .get_work_item_for_update(snap, id)
            .await?
            .ok_or(TimelineError::WorkItemNotFound { id })
    }

    /// Timestamp for the next history row of `item`: now, but never before
    /// the item's current timestamp, and unique in its history.
    pub(crate) async fn next_item_ts(
        &self,
        snap: &mut S::Snapshot,
        item: &WorkItemRecord,
    ) -> Result<Micros, TimelineError> {
        allocate_unique_ts(
            &self.storage,
            snap,
            &EntityKey::work_item(item.id),
            self.now().max(item.db_updated_ts),
            Some(item.db_updated_ts),
            self.config.reconcile.max_timestamp_probes,
        )
        .await
    }
}
