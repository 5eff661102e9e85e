use timeline_storage::{EntityKey, EntityKind, Micros, StorageError};

/// Errors returned by timeline operations.
///
/// Every error aborts the unit of work it occurred in; none of the call's
/// writes are committed.
#[derive(Debug, thiserror::Error)]
pub enum TimelineError {
    /// The operation referenced an entity with no active row.
    #[error("entity not found: {key}")]
    EntityNotFound { key: EntityKey },

    #[error("entity already exists: {key}")]
    EntityAlreadyExists { key: EntityKey },

    #[error("work item not found: {id}")]
    WorkItemNotFound { id: i64 },

    /// The requested state change is not permitted from the current state.
    #[error("invalid transition for {key}: '{from}' -> '{to}'")]
    InvalidTransition {
        key: EntityKey,
        from: String,
        to: String,
    },

    /// Work items are driven by the lifecycle operations, not by the
    /// generic entity operations.
    #[error("entity kind '{kind}' is not supported by this operation")]
    UnsupportedKind { kind: EntityKind },

    /// The collision probe hit the configured bound.
    #[error("no free history timestamp for {key} within {probes} probes from {desired}")]
    TimestampExhausted {
        key: EntityKey,
        desired: Micros,
        probes: u32,
    },

    #[error(transparent)]
    Storage(#[from] StorageError),
}

impl TimelineError {
    pub(crate) fn invalid_transition(
        key: &EntityKey,
        from: impl Into<String>,
        to: impl Into<String>,
    ) -> Self {
        TimelineError::InvalidTransition {
            key: key.clone(),
            from: from.into(),
            to: to.into(),
        }
    }
}
