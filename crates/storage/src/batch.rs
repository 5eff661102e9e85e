//! Queue-then-execute write batches.
//!
//! An operation registers every write it plans to make on a [`WriteBatch`],
//! then submits the batch through
//! [`TimelineStorage::execute_batch`](crate::TimelineStorage::execute_batch).
//! Each write declares how many rows it expects to touch; a violated
//! expectation fails the batch and the caller aborts the snapshot, so either
//! all of a call's writes commit or none do.

use serde::Serialize;

use crate::record::{
    EntityKey, EntityRecord, Micros, WorkItemHistoryRecord, WorkItemRecord, WorkerRecord,
};

/// Row-count expectation attached to a planned write.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Expect {
    ExactlyOne,
    ZeroOrOne,
    Any,
}

impl Expect {
    pub fn admits(self, rows: usize) -> bool {
        match self {
            Expect::ExactlyOne => rows == 1,
            Expect::ZeroOrOne => rows <= 1,
            Expect::Any => true,
        }
    }
}

/// A single row mutation.
#[derive(Debug, Clone, PartialEq)]
pub enum WriteOp {
    InsertActive(EntityRecord),
    /// Replace the active row with the same key.
    UpdateActive(EntityRecord),
    DeleteActive(EntityKey),
    InsertHistory(EntityRecord),
    InsertWorkItem(WorkItemRecord),
    /// Replace the active work item with the same id.
    UpdateWorkItem(WorkItemRecord),
    DeleteWorkItem(i64),
    InsertWorkItemHistory(WorkItemHistoryRecord),
    /// Rewrite the work item history row keyed by `(record.item.id, at_ts)`.
    ReplaceWorkItemHistory {
        at_ts: Micros,
        record: WorkItemHistoryRecord,
    },
    UpsertWorker(WorkerRecord),
    DeleteWorker {
        kind: String,
        id: i64,
    },
}

impl WriteOp {
    pub fn name(&self) -> &'static str {
        match self {
            WriteOp::InsertActive(_) => "insert_active",
            WriteOp::UpdateActive(_) => "update_active",
            WriteOp::DeleteActive(_) => "delete_active",
            WriteOp::InsertHistory(_) => "insert_history",
            WriteOp::InsertWorkItem(_) => "insert_work_item",
            WriteOp::UpdateWorkItem(_) => "update_work_item",
            WriteOp::DeleteWorkItem(_) => "delete_work_item",
            WriteOp::InsertWorkItemHistory(_) => "insert_work_item_history",
            WriteOp::ReplaceWorkItemHistory { .. } => "replace_work_item_history",
            WriteOp::UpsertWorker(_) => "upsert_worker",
            WriteOp::DeleteWorker { .. } => "delete_worker",
        }
    }
}

/// A write plus its row-count expectation.
#[derive(Debug, Clone, PartialEq)]
pub struct PlannedWrite {
    pub op: WriteOp,
    pub expect: Expect,
}

/// Per-write result of an executed batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct WriteOutcome {
    pub rows_affected: usize,
}

/// Accumulator for the writes of one unit of work.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct WriteBatch {
    writes: Vec<PlannedWrite>,
}

impl WriteBatch {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a write with an explicit expectation.
    pub fn push(&mut self, op: WriteOp, expect: Expect) -> &mut Self {
        self.writes.push(PlannedWrite { op, expect });
        self
    }

    pub fn insert_active(&mut self, record: EntityRecord) -> &mut Self {
        self.push(WriteOp::InsertActive(record), Expect::ExactlyOne)
    }

    pub fn update_active(&mut self, record: EntityRecord) -> &mut Self {
        self.push(WriteOp::UpdateActive(record), Expect::ExactlyOne)
    }

    pub fn delete_active(&mut self, key: EntityKey) -> &mut Self {
        self.push(WriteOp::DeleteActive(key), Expect::ExactlyOne)
    }

    pub fn insert_history(&mut self, record: EntityRecord) -> &mut Self {
        self.push(WriteOp::InsertHistory(record), Expect::ExactlyOne)
    }

    pub fn insert_work_item(&mut self, record: WorkItemRecord) -> &mut Self {
        self.push(WriteOp::InsertWorkItem(record), Expect::ExactlyOne)
    }

    pub fn update_work_item(&mut self, record: WorkItemRecord) -> &mut Self {
        self.push(WriteOp::UpdateWorkItem(record), Expect::ExactlyOne)
    }

    pub fn delete_work_item(&mut self, id: i64) -> &mut Self {
        self.push(WriteOp::DeleteWorkItem(id), Expect::ExactlyOne)
    }

    pub fn insert_work_item_history(&mut self, record: WorkItemHistoryRecord) -> &mut Self {
        self.push(WriteOp::InsertWorkItemHistory(record), Expect::ExactlyOne)
    }

    pub fn replace_work_item_history(
        &mut self,
        at_ts: Micros,
        record: WorkItemHistoryRecord,
    ) -> &mut Self {
        self.push(
            WriteOp::ReplaceWorkItemHistory { at_ts, record },
            Expect::ExactlyOne,
        )
    }

    pub fn upsert_worker(&mut self, record: WorkerRecord) -> &mut Self {
        self.push(WriteOp::UpsertWorker(record), Expect::ExactlyOne)
    }

    pub fn delete_worker(&mut self, kind: impl Into<String>, id: i64) -> &mut Self {
        self.push(
            WriteOp::DeleteWorker {
                kind: kind.into(),
                id,
            },
            Expect::ZeroOrOne,
        )
    }

    pub fn len(&self) -> usize {
        self.writes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.writes.is_empty()
    }

    pub fn writes(&self) -> &[PlannedWrite] {
        &self.writes
    }

    pub fn into_writes(self) -> Vec<PlannedWrite> {
        self.writes
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::EntityKind;

    #[test]
    fn expectations_admit_row_counts() {
        assert!(Expect::ExactlyOne.admits(1));
        assert!(!Expect::ExactlyOne.admits(0));
        assert!(!Expect::ExactlyOne.admits(2));
        assert!(Expect::ZeroOrOne.admits(0));
        assert!(Expect::ZeroOrOne.admits(1));
        assert!(!Expect::ZeroOrOne.admits(2));
        assert!(Expect::Any.admits(7));
    }

    #[test]
    fn builder_preserves_registration_order() {
        let key = EntityKey::new(EntityKind::Job, "job-1");
        let mut batch = WriteBatch::new();
        batch
            .delete_active(key.clone())
            .delete_worker("RAS", 3)
            .push(WriteOp::DeleteActive(key), Expect::Any);

        let names: Vec<_> = batch.writes().iter().map(|w| w.op.name()).collect();
        assert_eq!(names, ["delete_active", "delete_worker", "delete_active"]);
        assert_eq!(batch.writes()[1].expect, Expect::ZeroOrOne);
        assert_eq!(batch.writes()[2].expect, Expect::Any);
        assert_eq!(batch.len(), 3);
    }
}
