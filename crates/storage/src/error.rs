use crate::batch::Expect;
use crate::record::{EntityKey, Micros};

/// All errors that can be returned by a TimelineStorage implementation.
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    /// No active row with the given key.
    #[error("entity not found: {key}")]
    EntityNotFound { key: EntityKey },

    /// An active row with this key already exists.
    #[error("entity already exists: {key}")]
    AlreadyExists { key: EntityKey },

    /// No active work item with the given id.
    #[error("work item not found: {id}")]
    WorkItemNotFound { id: i64 },

    /// A history row for this key already carries this change-timestamp.
    #[error("duplicate history row for {key} at {ts}")]
    DuplicateHistory { key: EntityKey, ts: Micros },

    /// A planned write affected a different number of rows than declared.
    /// The whole batch must be discarded by aborting the snapshot.
    #[error("write #{index} ({op}) expected {expected:?} rows, affected {actual}")]
    ExpectationViolated {
        index: usize,
        op: &'static str,
        expected: Expect,
        actual: usize,
    },

    /// A backend-specific storage error (connection, serialization, etc.).
    #[error("storage backend error: {0}")]
    Backend(String),
}
