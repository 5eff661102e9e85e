//! Storage contract for timeline backends.
//!
//! Record types for entity active/history rows, work items and the worker
//! registry; the [`WriteBatch`] builder; the [`TimelineStorage`] trait; an
//! [`InMemoryStorage`] backend; and a backend-agnostic conformance suite.

pub mod batch;
pub mod conformance;
mod error;
pub mod memory;
mod record;
mod traits;

pub use batch::{Expect, PlannedWrite, WriteBatch, WriteOp, WriteOutcome};
pub use error::StorageError;
pub use memory::InMemoryStorage;
pub use record::{
    EntityKey, EntityKind, EntityRecord, Fields, Micros, WorkItemHistoryRecord, WorkItemRecord,
    WorkItemState, WorkerRecord,
};
pub use traits::TimelineStorage;
