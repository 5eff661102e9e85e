use std::sync::Arc;

use timeline_storage::{Micros, TimelineStorage};
use tracing::warn;

use crate::clock::{Clock, SystemClock};
use crate::config::TimelineConfig;
use crate::error::TimelineError;
use crate::policy::PolicySet;

/// The entry point for every timeline operation.
///
/// Each public operation runs as one unit of work: it begins a snapshot,
/// performs its reads and executes its write batch inside it, and commits.
/// Any error aborts the snapshot, so a failed call leaves no writes behind.
///
/// Operations are spread over several modules:
/// entity operations in [`crate::entity`], the work item lifecycle in
/// [`crate::work_item`], the worker registry in [`crate::workers`] and the
/// zombie sweep in [`crate::zombie`].
#[derive(Debug)]
pub struct Timeline<S> {
    pub(crate) storage: S,
    pub(crate) config: TimelineConfig,
    pub(crate) policies: PolicySet,
    pub(crate) clock: Arc<dyn Clock>,
}

impl<S: TimelineStorage> Timeline<S> {
    /// A timeline on `storage` using the system clock and built-in policies.
    pub fn new(storage: S, config: TimelineConfig) -> Self {
        Self::with_clock(storage, config, Arc::new(SystemClock))
    }

    pub fn with_clock(storage: S, config: TimelineConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            storage,
            config,
            policies: PolicySet::default(),
            clock,
        }
    }

    pub fn with_policies(mut self, policies: PolicySet) -> Self {
        self.policies = policies;
        self
    }

    pub fn storage(&self) -> &S {
        &self.storage
    }

    pub fn config(&self) -> &TimelineConfig {
        &self.config
    }

    pub fn policies(&self) -> &PolicySet {
        &self.policies
    }

    pub(crate) fn now(&self) -> Micros {
        self.clock.now_micros()
    }

    /// Commit `snapshot` if the unit of work succeeded, abort it otherwise.
    pub(crate) async fn settle<T>(
        &self,
        snapshot: S::Snapshot,
        result: Result<T, TimelineError>,
    ) -> Result<T, TimelineError> {
        match result {
            Ok(value) => {
                self.storage.commit_snapshot(snapshot).await?;
                Ok(value)
            }
            Err(e) => {
                if let Err(abort) = self.storage.abort_snapshot(snapshot).await {
                    warn!(error = %abort, "abort after failed unit of work also failed");
                }
                Err(e)
            }
        }
    }
}
