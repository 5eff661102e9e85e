//! Zombie reclamation.
//!
//! A work item is a zombie when it is `Working` but its owner is not in the
//! live-worker registry. There are no leases or heartbeats: liveness is
//! registry membership at sweep time.

use std::collections::{BTreeMap, BTreeSet};

use serde::Serialize;
use timeline_storage::{TimelineStorage, WorkItemHistoryRecord, WorkItemState, WriteBatch};
use tracing::{debug, info, warn};

use crate::error::TimelineError;
use crate::timeline::Timeline;

/// A work item moved back to `Requeued` by a sweep.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ReclaimedWorkItem {
    pub id: i64,
    pub worker_kind: String,
    pub previous_owner: Option<i64>,
    pub work_to_be_done: String,
}

impl<S: TimelineStorage> Timeline<S> {
    /// Requeue every working item of `worker_kind` whose owner is no longer
    /// live. Returns the reclaimed items in id order.
    pub async fn sweep_zombies(
        &self,
        worker_kind: &str,
    ) -> Result<Vec<ReclaimedWorkItem>, TimelineError> {
        let mut snap = self.storage.begin_snapshot().await?;
        let result = self.sweep_in(&mut snap, &worker_kind.to_uppercase()).await;
        self.settle(snap, result).await
    }

    async fn sweep_in(
        &self,
        snap: &mut S::Snapshot,
        kind: &str,
    ) -> Result<Vec<ReclaimedWorkItem>, TimelineError> {
        let mut live: BTreeMap<String, BTreeSet<i64>> = BTreeMap::new();
        for worker in self.storage.list_live_workers(snap).await? {
            live.entry(worker.kind).or_default().insert(worker.id);
        }
        let live_ids = live.remove(kind).unwrap_or_default();

        let working = self
            .storage
            .list_work_items_in_state(snap, WorkItemState::Working)
            .await?;

        let mut batch = WriteBatch::new();
        let mut reclaimed = Vec::new();
        for mut item in working.into_iter().filter(|w| w.worker_kind == kind) {
            if item
                .working_adapter_id
                .is_some_and(|owner| live_ids.contains(&owner))
            {
                continue;
            }
            let ts = self.next_item_ts(snap, &item).await?;
            let previous_owner = item.working_adapter_id.take();
            item.state = WorkItemState::Requeued;
            item.db_updated_ts = ts;
            batch
                .update_work_item(item.clone())
                .insert_work_item_history(WorkItemHistoryRecord::transition(item.clone()));
            warn!(id = item.id, worker_kind = kind, ?previous_owner, "reclaimed zombie work item");
            reclaimed.push(ReclaimedWorkItem {
                id: item.id,
                worker_kind: item.worker_kind,
                previous_owner,
                work_to_be_done: item.work_to_be_done,
            });
        }

        if reclaimed.is_empty() {
            debug!(worker_kind = kind, live = live_ids.len(), "no zombie work items");
            return Ok(reclaimed);
        }
        self.storage.execute_batch(snap, batch).await?;
        info!(worker_kind = kind, count = reclaimed.len(), "zombie sweep requeued work");
        Ok(reclaimed)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use timeline_storage::InMemoryStorage;

    use crate::clock::ManualClock;
    use crate::config::TimelineConfig;
    use crate::reconcile::Requester;
    use crate::timeline::Timeline;
    use crate::work_item::EnqueueRequest;

    use super::*;

    fn timeline() -> Timeline<InMemoryStorage> {
        Timeline::with_clock(
            InMemoryStorage::new(),
            TimelineConfig::default(),
            Arc::new(ManualClock::new(1_000)),
        )
    }

    async fn started(tl: &Timeline<InMemoryStorage>, kind: &str, owner: i64) -> i64 {
        let id = tl
            .enqueue_work_item(EnqueueRequest {
                queue: "q".to_string(),
                worker_kind: kind.to_string(),
                work_to_be_done: "Work".to_string(),
                parameters: String::new(),
                notify_when_finished: false,
                requester: Requester::new("TEST"),
            })
            .await
            .unwrap();
        tl.start_work(kind, owner, None).await.unwrap();
        id
    }

    #[tokio::test]
    async fn sweep_only_touches_the_requested_kind() {
        let tl = timeline();
        let ras = started(&tl, "RAS", 9).await;
        let wlm = started(&tl, "WLM", 9).await;

        let reclaimed = tl.sweep_zombies("ras").await.unwrap();
        assert_eq!(reclaimed.len(), 1);
        assert_eq!(reclaimed[0].id, ras);
        assert_eq!(
            tl.storage().get_work_item(wlm).await.unwrap().unwrap().state,
            WorkItemState::Working
        );
    }

    #[tokio::test]
    async fn same_id_live_under_another_kind_is_still_a_zombie() {
        let tl = timeline();
        tl.register_worker("WLM", 4, "SN0", 1).await.unwrap();
        let id = started(&tl, "RAS", 4).await;
        let reclaimed = tl.sweep_zombies("RAS").await.unwrap();
        assert_eq!(reclaimed.iter().map(|r| r.id).collect::<Vec<_>>(), [id]);
    }

    #[tokio::test]
    async fn empty_sweep_writes_nothing() {
        let tl = timeline();
        tl.register_worker("RAS", 1, "SN0", 1).await.unwrap();
        let id = started(&tl, "RAS", 1).await;
        assert!(tl.sweep_zombies("RAS").await.unwrap().is_empty());
        assert_eq!(tl.storage().list_work_item_history(id).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn requeued_item_resumes_with_restart_data() {
        let tl = timeline();
        let id = started(&tl, "RAS", 9).await;
        tl.save_restart_data(id, "chunk-7", false).await.unwrap();
        tl.sweep_zombies("RAS").await.unwrap();

        let resumed = tl.start_work("RAS", 10, None).await.unwrap().unwrap();
        assert_eq!(resumed.id, id);
        assert_eq!(resumed.working_adapter_id, Some(10));
        assert_eq!(resumed.working_results.as_deref(), Some("chunk-7"));

        let codes: Vec<_> = tl
            .storage()
            .list_work_item_history(id)
            .await
            .unwrap()
            .iter()
            .map(|h| h.item.state.code())
            .collect();
        assert_eq!(codes, ['Q', 'W', 'W', 'R', 'W']);
    }
}
