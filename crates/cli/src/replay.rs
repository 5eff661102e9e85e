//! `timeline replay`: run a scenario against a fresh in-memory store.

use std::collections::BTreeSet;
use std::sync::Arc;

use serde::Serialize;
use timeline_core::{
    ChangeOutcome, ManualClock, OutOfOrder, TerminateOutcome, Timeline, TimelineConfig,
    TimelineError,
};
use timeline_storage::{EntityKey, InMemoryStorage, Micros, TimelineStorage};
use tracing::debug;

use crate::scenario::Step;

/// Clock reading at the start of every replay (2023-11-14T22:13:20Z).
pub const REPLAY_EPOCH_US: Micros = 1_700_000_000_000_000;

/// Result of one scenario step.
#[derive(Debug, Clone, Serialize)]
pub struct StepReport {
    pub index: usize,
    pub op: &'static str,
    pub ok: bool,
    /// Reconciliation result code, for steps that reconcile a change.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub code: Option<u8>,
    pub detail: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct EntitySummary {
    pub key: String,
    /// State of the active row, `None` once the entity is gone.
    pub active_state: Option<String>,
    pub history_rows: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct WorkItemSummary {
    pub id: i64,
    pub state: Option<String>,
    pub history_rows: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct ReplayReport {
    pub steps: Vec<StepReport>,
    pub failed: usize,
    pub entities: Vec<EntitySummary>,
    pub work_items: Vec<WorkItemSummary>,
    pub live_workers: Vec<String>,
}

/// Keys and ids seen during a replay, for the closing summary.
#[derive(Default)]
struct Touched {
    entities: BTreeSet<EntityKey>,
    work_items: BTreeSet<i64>,
}

/// Step outcome before it is numbered: `(code, detail)`.
type StepResult = Result<(Option<u8>, String), TimelineError>;

pub async fn run(
    steps: Vec<Step>,
    config: TimelineConfig,
) -> Result<ReplayReport, TimelineError> {
    let clock = Arc::new(ManualClock::new(REPLAY_EPOCH_US));
    let coalesce_default = config.work_items.coalesce_checkpoints;
    let tl = Timeline::with_clock(InMemoryStorage::new(), config, clock.clone());
    let mut touched = Touched::default();

    let mut reports = Vec::with_capacity(steps.len());
    for (index, step) in steps.into_iter().enumerate() {
        let op = step.op();
        debug!(index, op, "replaying step");
        let result = execute(&tl, &clock, &mut touched, coalesce_default, step).await;
        reports.push(match result {
            Ok((code, detail)) => StepReport {
                index,
                op,
                ok: true,
                code,
                detail,
            },
            Err(e) => StepReport {
                index,
                op,
                ok: false,
                code: None,
                detail: e.to_string(),
            },
        });
    }

    let failed = reports.iter().filter(|r| !r.ok).count();
    let storage = tl.storage();

    let mut entities = Vec::new();
    for key in &touched.entities {
        entities.push(EntitySummary {
            key: key.to_string(),
            active_state: storage.get_active(key).await?.map(|r| r.state),
            history_rows: storage.list_history(key).await?.len(),
        });
    }
    let mut work_items = Vec::new();
    for id in &touched.work_items {
        work_items.push(WorkItemSummary {
            id: *id,
            state: storage
                .get_work_item(*id)
                .await?
                .map(|w| w.state.to_string()),
            history_rows: storage.list_work_item_history(*id).await?.len(),
        });
    }
    let live_workers = storage
        .list_workers()
        .await?
        .into_iter()
        .map(|w| format!("{}/{}", w.kind, w.id))
        .collect();

    Ok(ReplayReport {
        steps: reports,
        failed,
        entities,
        work_items,
        live_workers,
    })
}

fn describe(outcome: ChangeOutcome) -> &'static str {
    match outcome {
        ChangeOutcome::Applied => "applied",
        ChangeOutcome::AppliedWithinSlack => "applied within slack",
        ChangeOutcome::RejectedOutOfOrder(OutOfOrder::HistoryOnly) => {
            "out of order, history only"
        }
        ChangeOutcome::RejectedOutOfOrder(OutOfOrder::NoHistoricalBaseline) => {
            "out of order, no historical baseline"
        }
    }
}

async fn execute(
    tl: &Timeline<InMemoryStorage>,
    clock: &ManualClock,
    touched: &mut Touched,
    coalesce_default: bool,
    step: Step,
) -> StepResult {
    match step {
        Step::RegisterWorker {
            kind,
            id,
            lctn,
            pid,
        } => {
            let worker = tl.register_worker(&kind, id, &lctn, pid).await?;
            Ok((None, format!("{}/{} registered", worker.kind, worker.id)))
        }
        Step::DeregisterWorker { kind, id } => {
            let removed = tl.deregister_worker(&kind, id).await?;
            let detail = if removed {
                format!("{kind}/{id} deregistered")
            } else {
                format!("{kind}/{id} was not registered")
            };
            Ok((None, detail))
        }
        Step::Create(req) => {
            touched.entities.insert(req.key.clone());
            let row = tl.create_entity(req).await?;
            let detail = format!("{} created in '{}' at {}", row.key, row.state, row.change_ts);
            Ok((None, detail))
        }
        Step::Change(change) => {
            touched.entities.insert(change.key.clone());
            let key = change.key.clone();
            let outcome = tl.apply_change(change).await?;
            Ok((Some(outcome.code()), format!("{key}: {}", describe(outcome))))
        }
        Step::Terminate(req) => {
            touched.entities.insert(req.key.clone());
            let key = req.key.clone();
            let detail = match tl.terminate_entity(req).await? {
                TerminateOutcome::Terminated(row) => {
                    format!("{key} terminated in '{}' at {}", row.state, row.change_ts)
                }
                TerminateOutcome::Tombstoned(row) => {
                    format!("{key} tombstoned in '{}' at {}", row.state, row.change_ts)
                }
                TerminateOutcome::NotPresent => format!("{key} not present"),
            };
            Ok((None, detail))
        }
        Step::SetComponentStates {
            parent_id,
            state,
            ts,
            requester,
        } => {
            let outcomes = tl
                .set_component_states(&parent_id, &state, ts, requester)
                .await?;
            let parts: Vec<_> = outcomes
                .iter()
                .map(|(key, outcome)| {
                    touched.entities.insert(key.clone());
                    format!("{}={}", key.id, outcome.code())
                })
                .collect();
            let detail = format!(
                "{parent_id}: {} component(s) -> '{state}' [{}]",
                parts.len(),
                parts.join(", ")
            );
            Ok((None, detail))
        }
        Step::Enqueue(req) => {
            let id = tl.enqueue_work_item(req).await?;
            touched.work_items.insert(id);
            Ok((None, format!("work item {id} queued")))
        }
        Step::StartWork {
            worker_kind,
            worker_id,
            queue,
        } => match tl.start_work(&worker_kind, worker_id, queue.as_deref()).await? {
            Some(item) => {
                touched.work_items.insert(item.id);
                Ok((
                    None,
                    format!("work item {} started by {}/{worker_id}", item.id, item.worker_kind),
                ))
            }
            None => Ok((None, format!("no work for {worker_kind}"))),
        },
        Step::Checkpoint {
            id,
            payload,
            coalesce,
        } => {
            touched.work_items.insert(id);
            let coalesce = coalesce.unwrap_or(coalesce_default);
            tl.save_restart_data(id, &payload, coalesce).await?;
            Ok((None, format!("work item {id} checkpointed (coalesce={coalesce})")))
        }
        Step::Finish {
            id,
            results,
            succeeded,
        } => {
            touched.work_items.insert(id);
            let item = tl.finish(id, &results, succeeded).await?;
            Ok((None, format!("work item {id} -> {}", item.state)))
        }
        Step::Acknowledge { id } => {
            touched.work_items.insert(id);
            let item = tl.acknowledge(id).await?;
            Ok((
                None,
                format!(
                    "work item {id} -> {} (results: {})",
                    item.state,
                    item.results.as_deref().unwrap_or("-")
                ),
            ))
        }
        Step::Sweep { worker_kind } => {
            let reclaimed = tl.sweep_zombies(&worker_kind).await?;
            let ids: Vec<_> = reclaimed
                .iter()
                .map(|r| {
                    touched.work_items.insert(r.id);
                    r.id.to_string()
                })
                .collect();
            Ok((None, format!("requeued [{}]", ids.join(", "))))
        }
        Step::AdvanceClock { us } => {
            let now = clock.advance(us);
            Ok((None, format!("clock at {now}")))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scenario::parse;

    #[tokio::test]
    async fn failed_steps_are_reported_and_replay_continues() {
        let steps = parse(
            r#"[
                {"op": "change", "key": {"kind": "job", "id": "ghost"},
                 "requester": {"adapter_type": "WLM"}},
                {"op": "create", "key": {"kind": "job", "id": "j1"}, "state": "S",
                 "ts": 1000, "requester": {"adapter_type": "WLM"}},
                {"op": "terminate", "key": {"kind": "job", "id": "j1"},
                 "requester": {"adapter_type": "WLM"}}
            ]"#,
        )
        .unwrap();
        let report = run(steps, TimelineConfig::default()).await.unwrap();
        assert_eq!(report.failed, 1);
        assert!(!report.steps[0].ok);
        assert!(report.steps[0].detail.contains("entity not found"));
        assert!(report.steps[2].ok);

        let j1 = report.entities.iter().find(|e| e.key == "job/j1").unwrap();
        assert_eq!(j1.active_state, None);
        assert_eq!(j1.history_rows, 2);
    }
}
