//! Scenario file format for `timeline replay`.
//!
//! A scenario is a JSON array of steps, each tagged by `op`:
//!
//! ```json
//! [
//!   { "op": "register_worker", "kind": "RAS", "id": 5 },
//!   { "op": "create", "key": { "kind": "compute_node", "id": "R0-CN0" },
//!     "state": "A", "ts": 10000000, "requester": { "adapter_type": "PROVISIONER" } },
//!   { "op": "change", "key": { "kind": "compute_node", "id": "R0-CN0" },
//!     "state": "M", "ts": 9000000, "requester": { "adapter_type": "RAS" } },
//!   { "op": "enqueue", "queue": "default", "worker_kind": "RAS",
//!     "work_to_be_done": "Inventory", "requester": { "adapter_type": "CONTROL" } },
//!   { "op": "start_work", "worker_kind": "RAS", "worker_id": 5 },
//!   { "op": "sweep", "worker_kind": "RAS" }
//! ]
//! ```

use std::path::Path;

use anyhow::{Context, Result};
use serde::Deserialize;
use timeline_core::{ChangeRequest, CreateRequest, EnqueueRequest, Requester, TerminateRequest};
use timeline_storage::Micros;

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Step {
    RegisterWorker {
        kind: String,
        id: i64,
        #[serde(default)]
        lctn: String,
        #[serde(default)]
        pid: i64,
    },
    DeregisterWorker {
        kind: String,
        id: i64,
    },
    Create(CreateRequest),
    Change(ChangeRequest),
    Terminate(TerminateRequest),
    SetComponentStates {
        parent_id: String,
        state: String,
        #[serde(default)]
        ts: Option<Micros>,
        requester: Requester,
    },
    Enqueue(EnqueueRequest),
    StartWork {
        worker_kind: String,
        worker_id: i64,
        #[serde(default)]
        queue: Option<String>,
    },
    Checkpoint {
        id: i64,
        payload: String,
        /// Falls back to `work_items.coalesce_checkpoints` from the config.
        #[serde(default)]
        coalesce: Option<bool>,
    },
    Finish {
        id: i64,
        results: String,
        #[serde(default = "succeeded")]
        succeeded: bool,
    },
    Acknowledge {
        id: i64,
    },
    Sweep {
        worker_kind: String,
    },
    AdvanceClock {
        us: Micros,
    },
}

fn succeeded() -> bool {
    true
}

impl Step {
    pub fn op(&self) -> &'static str {
        match self {
            Step::RegisterWorker { .. } => "register_worker",
            Step::DeregisterWorker { .. } => "deregister_worker",
            Step::Create(_) => "create",
            Step::Change(_) => "change",
            Step::Terminate(_) => "terminate",
            Step::SetComponentStates { .. } => "set_component_states",
            Step::Enqueue(_) => "enqueue",
            Step::StartWork { .. } => "start_work",
            Step::Checkpoint { .. } => "checkpoint",
            Step::Finish { .. } => "finish",
            Step::Acknowledge { .. } => "acknowledge",
            Step::Sweep { .. } => "sweep",
            Step::AdvanceClock { .. } => "advance_clock",
        }
    }
}

pub fn parse(content: &str) -> Result<Vec<Step>> {
    serde_json::from_str(content).context("invalid scenario")
}

pub fn load(path: &Path) -> Result<Vec<Step>> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("could not read scenario '{}'", path.display()))?;
    parse(&content).with_context(|| format!("in '{}'", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use timeline_storage::EntityKind;

    #[test]
    fn steps_parse_with_defaults() {
        let steps = parse(
            r#"[
                {"op": "register_worker", "kind": "ras", "id": 5},
                {"op": "change", "key": {"kind": "job", "id": "j1"},
                 "requester": {"adapter_type": "WLM"}},
                {"op": "finish", "id": 3, "results": "ok"},
                {"op": "advance_clock", "us": 250}
            ]"#,
        )
        .unwrap();
        let ops: Vec<_> = steps.iter().map(Step::op).collect();
        assert_eq!(ops, ["register_worker", "change", "finish", "advance_clock"]);

        match &steps[1] {
            Step::Change(change) => {
                assert_eq!(change.key.kind, EntityKind::Job);
                assert_eq!(change.state, None);
                assert_eq!(change.ts, None);
                assert_eq!(change.requester.work_item_id, -1);
            }
            other => panic!("expected change, got {other:?}"),
        }
        assert!(matches!(steps[2], Step::Finish { succeeded: true, .. }));
    }

    #[test]
    fn unknown_op_is_rejected() {
        let err = parse(r#"[{"op": "explode"}]"#).unwrap_err();
        assert!(format!("{err:#}").contains("invalid scenario"));
    }
}
