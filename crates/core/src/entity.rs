//! Entity operations: create, change, terminate, and bulk component sync.

use serde::{Deserialize, Serialize};
use timeline_storage::{
    EntityKey, EntityKind, EntityRecord, Fields, Micros, TimelineStorage, WriteBatch,
};
use tracing::{debug, info};

use crate::allocator::allocate_unique_ts;
use crate::error::TimelineError;
use crate::policy::MissingOnTerminate;
use crate::reconcile::{reconcile, stamped, ChangeOutcome, ChangeRequest, Requester};
use crate::timeline::Timeline;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CreateRequest {
    pub key: EntityKey,
    #[serde(default)]
    pub parent_id: Option<String>,
    pub state: String,
    #[serde(default)]
    pub fields: Fields,
    #[serde(default)]
    pub ts: Option<Micros>,
    pub requester: Requester,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TerminateRequest {
    pub key: EntityKey,
    /// Final field values laid over the active row.
    #[serde(default)]
    pub fields: Fields,
    #[serde(default)]
    pub ts: Option<Micros>,
    pub requester: Requester,
}

/// What `terminate_entity` did.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TerminateOutcome {
    /// The active row was removed; this is its final history row.
    Terminated(EntityRecord),
    /// No active row existed; a lone terminal history row was recorded.
    Tombstoned(EntityRecord),
    /// No active row existed and the kind ignores that.
    NotPresent,
}

fn entity_kind_only(key: &EntityKey) -> Result<(), TimelineError> {
    if key.kind == EntityKind::WorkItem {
        return Err(TimelineError::UnsupportedKind { kind: key.kind });
    }
    Ok(())
}

impl<S: TimelineStorage> Timeline<S> {
    /// Create an entity: its active row and first history row.
    pub async fn create_entity(&self, req: CreateRequest) -> Result<EntityRecord, TimelineError> {
        entity_kind_only(&req.key)?;
        let mut snap = self.storage.begin_snapshot().await?;
        let result = self.create_in(&mut snap, &req).await;
        self.settle(snap, result).await
    }

    async fn create_in(
        &self,
        snap: &mut S::Snapshot,
        req: &CreateRequest,
    ) -> Result<EntityRecord, TimelineError> {
        let now = self.now();
        if self
            .storage
            .get_active_for_update(snap, &req.key)
            .await?
            .is_some()
        {
            return Err(TimelineError::EntityAlreadyExists {
                key: req.key.clone(),
            });
        }
        let ts = allocate_unique_ts(
            &self.storage,
            snap,
            &req.key,
            req.ts.unwrap_or(now),
            None,
            self.config.reconcile.max_timestamp_probes,
        )
        .await?;
        let row = EntityRecord {
            key: req.key.clone(),
            parent_id: req.parent_id.clone(),
            state: req.state.clone(),
            change_ts: ts,
            db_updated_ts: now,
            last_chg_adapter_type: req.requester.adapter_type.clone(),
            last_chg_work_item_id: req.requester.work_item_id,
            fields: req.fields.clone(),
        };
        let mut batch = WriteBatch::new();
        batch.insert_active(row.clone()).insert_history(row.clone());
        self.storage.execute_batch(snap, batch).await?;
        info!(key = %req.key, state = %row.state, ts, "entity created");
        Ok(row)
    }

    /// Apply a state change to an existing entity.
    pub async fn apply_change(&self, change: ChangeRequest) -> Result<ChangeOutcome, TimelineError> {
        entity_kind_only(&change.key)?;
        let policy = self.policies.get(change.key.kind);
        let now = self.now();
        let mut snap = self.storage.begin_snapshot().await?;
        let result = reconcile(
            &self.storage,
            &mut snap,
            &policy,
            &self.config.reconcile,
            now,
            &change,
        )
        .await;
        let outcome = self.settle(snap, result).await?;
        debug!(key = %change.key, code = outcome.code(), "change reconciled");
        Ok(outcome)
    }

    /// Terminate an entity: its final values become the last history row and
    /// the active row is deleted.
    pub async fn terminate_entity(
        &self,
        req: TerminateRequest,
    ) -> Result<TerminateOutcome, TimelineError> {
        entity_kind_only(&req.key)?;
        let mut snap = self.storage.begin_snapshot().await?;
        let result = self.terminate_in(&mut snap, &req).await;
        self.settle(snap, result).await
    }

    async fn terminate_in(
        &self,
        snap: &mut S::Snapshot,
        req: &TerminateRequest,
    ) -> Result<TerminateOutcome, TimelineError> {
        let policy = self.policies.get(req.key.kind);
        let now = self.now();
        let desired = req.ts.unwrap_or(now);
        let max_probes = self.config.reconcile.max_timestamp_probes;

        let Some(active) = self.storage.get_active_for_update(snap, &req.key).await? else {
            return match policy.on_missing_terminate {
                MissingOnTerminate::Error => Err(TimelineError::EntityNotFound {
                    key: req.key.clone(),
                }),
                MissingOnTerminate::Ignore => {
                    debug!(key = %req.key, "terminate of absent entity ignored");
                    Ok(TerminateOutcome::NotPresent)
                }
                MissingOnTerminate::RecordTombstone => {
                    let ts = allocate_unique_ts(
                        &self.storage,
                        snap,
                        &req.key,
                        desired,
                        None,
                        max_probes,
                    )
                    .await?;
                    let row = stamped(
                        EntityRecord {
                            key: req.key.clone(),
                            parent_id: None,
                            state: policy.terminal_state.clone(),
                            change_ts: ts,
                            db_updated_ts: now,
                            last_chg_adapter_type: String::new(),
                            last_chg_work_item_id: -1,
                            fields: req.fields.clone(),
                        },
                        ts,
                        now,
                        &req.requester,
                    );
                    let mut batch = WriteBatch::new();
                    batch.insert_history(row.clone());
                    self.storage.execute_batch(snap, batch).await?;
                    info!(key = %req.key, ts, "tombstone recorded for entity never seen active");
                    Ok(TerminateOutcome::Tombstoned(row))
                }
            };
        };

        // The terminal row is never placed before the active row.
        let ts = allocate_unique_ts(
            &self.storage,
            snap,
            &req.key,
            desired.max(active.change_ts),
            Some(active.change_ts),
            max_probes,
        )
        .await?;
        let mut row = active;
        row.state = policy.terminal_state.clone();
        for (name, value) in &req.fields {
            row.fields.insert(name.clone(), value.clone());
        }
        let row = stamped(row, ts, now, &req.requester);

        let mut batch = WriteBatch::new();
        batch
            .delete_active(req.key.clone())
            .insert_history(row.clone());
        self.storage.execute_batch(snap, batch).await?;
        info!(key = %req.key, state = %row.state, ts, "entity terminated");
        Ok(TerminateOutcome::Terminated(row))
    }

    /// Move every component of `parent_id` that is not already in
    /// `new_state` to it, in one unit of work.
    ///
    /// Returns the outcome for each component touched, ordered by id.
    pub async fn set_component_states(
        &self,
        parent_id: &str,
        new_state: &str,
        ts: Option<Micros>,
        requester: Requester,
    ) -> Result<Vec<(EntityKey, ChangeOutcome)>, TimelineError> {
        let mut snap = self.storage.begin_snapshot().await?;
        let result = self
            .set_component_states_in(&mut snap, parent_id, new_state, ts, requester)
            .await;
        self.settle(snap, result).await
    }

    async fn set_component_states_in(
        &self,
        snap: &mut S::Snapshot,
        parent_id: &str,
        new_state: &str,
        ts: Option<Micros>,
        requester: Requester,
    ) -> Result<Vec<(EntityKey, ChangeOutcome)>, TimelineError> {
        let policy = self.policies.get(EntityKind::Component);
        let now = self.now();
        let components = self
            .storage
            .list_active_children(snap, EntityKind::Component, parent_id)
            .await?;

        let mut outcomes = Vec::new();
        for component in components {
            if policy.skip_unchanged && component.state == new_state {
                continue;
            }
            let change = ChangeRequest {
                key: component.key,
                state: Some(new_state.to_string()),
                fields: Fields::new(),
                ts,
                requester: requester.clone(),
            };
            let outcome = reconcile(
                &self.storage,
                snap,
                &policy,
                &self.config.reconcile,
                now,
                &change,
            )
            .await?;
            outcomes.push((change.key, outcome));
        }
        info!(
            parent_id,
            new_state,
            touched = outcomes.len(),
            "component states synchronized"
        );
        Ok(outcomes)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use serde_json::json;
    use timeline_storage::InMemoryStorage;

    use super::*;
    use crate::clock::ManualClock;
    use crate::config::TimelineConfig;

    fn timeline() -> Timeline<InMemoryStorage> {
        Timeline::with_clock(
            InMemoryStorage::new(),
            TimelineConfig::default(),
            Arc::new(ManualClock::new(100_000_000)),
        )
    }

    fn create(kind: EntityKind, id: &str, state: &str, ts: Micros) -> CreateRequest {
        CreateRequest {
            key: EntityKey::new(kind, id),
            parent_id: None,
            state: state.to_string(),
            fields: Fields::new(),
            ts: Some(ts),
            requester: Requester::new("TEST"),
        }
    }

    fn terminate(key: EntityKey, ts: Micros) -> TerminateRequest {
        TerminateRequest {
            key,
            fields: Fields::from([("exit_status".to_string(), json!(0))]),
            ts: Some(ts),
            requester: Requester::new("WLM"),
        }
    }

    #[tokio::test]
    async fn create_writes_active_and_first_history_row() {
        let tl = timeline();
        let row = tl
            .create_entity(create(EntityKind::Job, "job-1", "S", 1_000))
            .await
            .unwrap();
        assert_eq!(row.change_ts, 1_000);
        assert_eq!(row.db_updated_ts, 100_000_000);
        assert_eq!(tl.storage().get_active(&row.key).await.unwrap(), Some(row.clone()));
        assert_eq!(tl.storage().list_history(&row.key).await.unwrap(), vec![row]);
    }

    #[tokio::test]
    async fn duplicate_create_is_rejected() {
        let tl = timeline();
        tl.create_entity(create(EntityKind::Job, "job-1", "S", 1_000))
            .await
            .unwrap();
        let err = tl
            .create_entity(create(EntityKind::Job, "job-1", "S", 2_000))
            .await
            .unwrap_err();
        assert!(matches!(err, TimelineError::EntityAlreadyExists { .. }));
    }

    #[tokio::test]
    async fn recreate_after_terminate_avoids_history_collision() {
        let tl = timeline();
        let key = EntityKey::new(EntityKind::Reservation, "res-1");
        tl.create_entity(create(EntityKind::Reservation, "res-1", "A", 1_000))
            .await
            .unwrap();
        tl.terminate_entity(terminate(key.clone(), 2_000))
            .await
            .unwrap();
        let again = tl
            .create_entity(create(EntityKind::Reservation, "res-1", "A", 1_000))
            .await
            .unwrap();
        assert_eq!(again.change_ts, 1_001);
    }

    #[tokio::test]
    async fn work_items_are_not_entities() {
        let tl = timeline();
        let err = tl
            .create_entity(create(EntityKind::WorkItem, "1", "Q", 1_000))
            .await
            .unwrap_err();
        assert!(matches!(err, TimelineError::UnsupportedKind { .. }));
    }

    #[tokio::test]
    async fn terminate_moves_final_values_into_history() {
        let tl = timeline();
        let key = EntityKey::new(EntityKind::Job, "job-2");
        tl.create_entity(create(EntityKind::Job, "job-2", "S", 1_000))
            .await
            .unwrap();

        let outcome = tl.terminate_entity(terminate(key.clone(), 5_000)).await.unwrap();
        let TerminateOutcome::Terminated(last) = outcome else {
            panic!("expected Terminated, got {outcome:?}");
        };
        assert_eq!(last.state, "T");
        assert_eq!(last.change_ts, 5_000);
        assert_eq!(last.fields["exit_status"], json!(0));
        assert_eq!(last.last_chg_adapter_type, "WLM");

        assert!(tl.storage().get_active(&key).await.unwrap().is_none());
        let history = tl.storage().list_history(&key).await.unwrap();
        assert_eq!(history.last(), Some(&last));
    }

    #[tokio::test]
    async fn terminate_never_precedes_the_active_row() {
        let tl = timeline();
        let key = EntityKey::new(EntityKind::JobStep, "job-3.0");
        tl.create_entity(create(EntityKind::JobStep, "job-3.0", "S", 9_000))
            .await
            .unwrap();
        let outcome = tl.terminate_entity(terminate(key, 4_000)).await.unwrap();
        let TerminateOutcome::Terminated(last) = outcome else {
            panic!("expected Terminated, got {outcome:?}");
        };
        assert_eq!(last.change_ts, 9_001);
    }

    #[tokio::test]
    async fn terminate_missing_honours_policy() {
        let tl = timeline();

        let job = EntityKey::new(EntityKind::Job, "never-started");
        let outcome = tl.terminate_entity(terminate(job.clone(), 7_000)).await.unwrap();
        assert!(matches!(outcome, TerminateOutcome::Tombstoned(ref row) if row.state == "T"));
        assert_eq!(tl.storage().list_history(&job).await.unwrap().len(), 1);
        assert!(tl.storage().get_active(&job).await.unwrap().is_none());

        let node = EntityKey::new(EntityKind::ComputeNode, "R9-CN0");
        let err = tl.terminate_entity(terminate(node, 7_000)).await.unwrap_err();
        assert!(matches!(err, TimelineError::EntityNotFound { .. }));
    }

    #[tokio::test]
    async fn component_sync_skips_parts_already_in_state() {
        let tl = timeline();
        for (id, parent, state) in [
            ("R0-CN0-P0", "R0-CN0", "A"),
            ("R0-CN0-P1", "R0-CN0", "E"),
            ("R0-CN0-D0", "R0-CN0", "A"),
            ("R0-CN1-P0", "R0-CN1", "A"),
        ] {
            let mut req = create(EntityKind::Component, id, state, 1_000);
            req.parent_id = Some(parent.to_string());
            tl.create_entity(req).await.unwrap();
        }

        let touched = tl
            .set_component_states("R0-CN0", "E", Some(2_000), Requester::new("RAS"))
            .await
            .unwrap();
        let ids: Vec<_> = touched.iter().map(|(k, _)| k.id.as_str()).collect();
        assert_eq!(ids, ["R0-CN0-D0", "R0-CN0-P0"]);
        assert!(touched.iter().all(|(_, o)| *o == ChangeOutcome::Applied));

        let other = EntityKey::new(EntityKind::Component, "R0-CN1-P0");
        assert_eq!(
            tl.storage().get_active(&other).await.unwrap().unwrap().state,
            "A"
        );
        let p1 = EntityKey::new(EntityKind::Component, "R0-CN0-P1");
        assert_eq!(tl.storage().list_history(&p1).await.unwrap().len(), 1);
    }
}
