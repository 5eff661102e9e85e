use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Microseconds since the Unix epoch.
///
/// All change-timestamps are carried at this resolution; the one-microsecond
/// bump used to disambiguate colliding history rows is the smallest step.
pub type Micros = i64;

/// Schema-agnostic projection of a row's non-key columns.
pub type Fields = BTreeMap<String, serde_json::Value>;

/// The kinds of entity tracked with an active row plus a history log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    ComputeNode,
    ServiceNode,
    Job,
    JobStep,
    /// Hardware part attached to a node (processor, dimm, accelerator, hfi).
    Component,
    Reservation,
    Diagnostic,
    ServiceOperation,
    WorkItem,
}

impl EntityKind {
    pub const ALL: [EntityKind; 9] = [
        EntityKind::ComputeNode,
        EntityKind::ServiceNode,
        EntityKind::Job,
        EntityKind::JobStep,
        EntityKind::Component,
        EntityKind::Reservation,
        EntityKind::Diagnostic,
        EntityKind::ServiceOperation,
        EntityKind::WorkItem,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            EntityKind::ComputeNode => "compute_node",
            EntityKind::ServiceNode => "service_node",
            EntityKind::Job => "job",
            EntityKind::JobStep => "job_step",
            EntityKind::Component => "component",
            EntityKind::Reservation => "reservation",
            EntityKind::Diagnostic => "diagnostic",
            EntityKind::ServiceOperation => "service_operation",
            EntityKind::WorkItem => "work_item",
        }
    }
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EntityKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        EntityKind::ALL
            .into_iter()
            .find(|k| k.as_str() == s)
            .ok_or_else(|| format!("unknown entity kind '{s}'"))
    }
}

/// Identity of a tracked entity: its kind plus a stable id (a location
/// string, job id, work item id, ...).
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct EntityKey {
    pub kind: EntityKind,
    pub id: String,
}

impl EntityKey {
    pub fn new(kind: EntityKind, id: impl Into<String>) -> Self {
        Self {
            kind,
            id: id.into(),
        }
    }

    /// Key under which a work item's history rows are tracked.
    pub fn work_item(id: i64) -> Self {
        Self::new(EntityKind::WorkItem, id.to_string())
    }
}

impl fmt::Display for EntityKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.kind, self.id)
    }
}

/// One row of an entity table. The same shape is used for the active row
/// and for every history row (a history row is a full snapshot).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntityRecord {
    pub key: EntityKey,
    /// Owning entity id for sub-records (e.g. the node a component sits in).
    #[serde(default)]
    pub parent_id: Option<String>,
    pub state: String,
    /// Logical time of the change this row reflects.
    pub change_ts: Micros,
    /// Time the row was written.
    pub db_updated_ts: Micros,
    pub last_chg_adapter_type: String,
    pub last_chg_work_item_id: i64,
    #[serde(default)]
    pub fields: Fields,
}

/// Work item lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkItemState {
    Queued,
    Working,
    Finished,
    FinishedDueToError,
    Done,
    Requeued,
}

impl WorkItemState {
    /// Single-letter code stored in the state column.
    pub fn code(self) -> char {
        match self {
            WorkItemState::Queued => 'Q',
            WorkItemState::Working => 'W',
            WorkItemState::Finished => 'F',
            WorkItemState::FinishedDueToError => 'E',
            WorkItemState::Done => 'D',
            WorkItemState::Requeued => 'R',
        }
    }

    pub fn from_code(code: char) -> Option<Self> {
        match code {
            'Q' => Some(WorkItemState::Queued),
            'W' => Some(WorkItemState::Working),
            'F' => Some(WorkItemState::Finished),
            'E' => Some(WorkItemState::FinishedDueToError),
            'D' => Some(WorkItemState::Done),
            'R' => Some(WorkItemState::Requeued),
            _ => None,
        }
    }

    pub fn is_finished(self) -> bool {
        matches!(
            self,
            WorkItemState::Finished | WorkItemState::FinishedDueToError
        )
    }
}

impl fmt::Display for WorkItemState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            WorkItemState::Queued => "Queued",
            WorkItemState::Working => "Working",
            WorkItemState::Finished => "Finished",
            WorkItemState::FinishedDueToError => "FinishedDueToError",
            WorkItemState::Done => "Done",
            WorkItemState::Requeued => "Requeued",
        };
        f.write_str(name)
    }
}

/// The active row of a work item.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkItemRecord {
    pub id: i64,
    pub queue: String,
    /// Kind of worker (adapter type) that handles this item.
    pub worker_kind: String,
    pub work_to_be_done: String,
    pub parameters: String,
    pub notify_when_finished: bool,
    pub state: WorkItemState,
    pub requesting_work_item_id: i64,
    pub requesting_adapter_type: String,
    /// Id of the worker that currently owns the item.
    pub working_adapter_id: Option<i64>,
    /// Latest checkpoint payload (restart data).
    pub working_results: Option<String>,
    pub results: Option<String>,
    pub start_ts: Micros,
    /// Change-timestamp of the row.
    pub db_updated_ts: Micros,
    pub end_ts: Option<Micros>,
}

/// A history row for a work item.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkItemHistoryRecord {
    #[serde(flatten)]
    pub item: WorkItemRecord,
    /// Row was written by a checkpoint rather than a state transition.
    pub checkpoint: bool,
    /// Row has been rewritten in place by a coalescing checkpoint.
    pub coalesced: bool,
}

impl WorkItemHistoryRecord {
    pub fn transition(item: WorkItemRecord) -> Self {
        Self {
            item,
            checkpoint: false,
            coalesced: false,
        }
    }

    /// History key timestamp of this row.
    pub fn ts(&self) -> Micros {
        self.item.db_updated_ts
    }
}

/// A live entry in the worker (adapter) registry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerRecord {
    /// Worker kind, normalized to upper case.
    pub kind: String,
    pub id: i64,
    pub lctn: String,
    pub pid: i64,
    pub started_ts: Micros,
}
