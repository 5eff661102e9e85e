//! Temporal reconciliation of an entity's active row and history log.
//!
//! Changes to an entity arrive out of wall-clock order. [`reconcile`] keeps
//! the active row at the latest accepted change while every accepted change
//! still lands in history as a full snapshot at a unique timestamp:
//!
//! - **in order** (`ts` after the active row): active row and history advance
//! - **within the slack window**: history is written; the active row keeps its
//!   timestamp and only receives what the kind's [`SlackOverlay`] allows
//! - **beyond the slack window**: history only, built on the nearest
//!   preceding history row; with no such row nothing is written

use serde::{Deserialize, Serialize};
use timeline_storage::{EntityKey, EntityRecord, Fields, Micros, TimelineStorage, WriteBatch};
use tracing::{debug, warn};

use crate::allocator::allocate_unique_ts;
use crate::config::ReconcileConfig;
use crate::error::TimelineError;
use crate::policy::{EntityPolicy, SlackOverlay};

/// Who made a change. Recorded in the `last_chg_*` columns of every row
/// written on its behalf.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Requester {
    pub adapter_type: String,
    /// Work item on whose behalf the change is made; -1 for none.
    #[serde(default = "no_work_item")]
    pub work_item_id: i64,
}

fn no_work_item() -> i64 {
    -1
}

impl Requester {
    pub fn new(adapter_type: impl Into<String>) -> Self {
        Self {
            adapter_type: adapter_type.into(),
            work_item_id: -1,
        }
    }

    pub fn for_work_item(adapter_type: impl Into<String>, work_item_id: i64) -> Self {
        Self {
            adapter_type: adapter_type.into(),
            work_item_id,
        }
    }
}

/// A state change for one entity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeRequest {
    pub key: EntityKey,
    /// New state, if the change carries one.
    #[serde(default)]
    pub state: Option<String>,
    /// Supplied fields; unsupplied fields keep their baseline values.
    #[serde(default)]
    pub fields: Fields,
    /// Change-timestamp; the clock is used when absent.
    #[serde(default)]
    pub ts: Option<Micros>,
    pub requester: Requester,
}

/// Why an out-of-order change did not touch the active row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum OutOfOrder {
    /// A history row was reconstructed from the preceding baseline.
    HistoryOnly,
    /// No preceding history row exists; nothing was written.
    NoHistoricalBaseline,
}

/// Result of a reconciled change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeOutcome {
    Applied,
    AppliedWithinSlack,
    RejectedOutOfOrder(OutOfOrder),
}

impl ChangeOutcome {
    /// Numeric result code: 0 applied, 1 rejected out of order, 2 applied
    /// within slack.
    pub fn code(self) -> u8 {
        match self {
            ChangeOutcome::Applied => 0,
            ChangeOutcome::RejectedOutOfOrder(_) => 1,
            ChangeOutcome::AppliedWithinSlack => 2,
        }
    }
}

/// Run one change against `change.key` inside `snapshot` and execute its
/// writes there. The caller commits or aborts the snapshot.
///
/// `now` is the write time recorded in `db_updated_ts`, and the change
/// timestamp when the request carries none.
pub async fn reconcile<S: TimelineStorage>(
    storage: &S,
    snapshot: &mut S::Snapshot,
    policy: &EntityPolicy,
    settings: &ReconcileConfig,
    now: Micros,
    change: &ChangeRequest,
) -> Result<ChangeOutcome, TimelineError> {
    let key = &change.key;
    let active = storage
        .get_active_for_update(snapshot, key)
        .await?
        .ok_or_else(|| TimelineError::EntityNotFound { key: key.clone() })?;
    let cur_ts = active.change_ts;

    let ts = allocate_unique_ts(
        storage,
        snapshot,
        key,
        change.ts.unwrap_or(now),
        Some(cur_ts),
        settings.max_timestamp_probes,
    )
    .await?;

    let mut batch = WriteBatch::new();
    let outcome = if ts > cur_ts {
        check_transition(policy, &active, change)?;
        let row = stamped(overlay(&active, change), ts, now, &change.requester);
        batch.update_active(row.clone()).insert_history(row);
        ChangeOutcome::Applied
    } else if cur_ts.saturating_sub(ts) <= settings.slack_window_us {
        // A freshly created entity has no history before its first row;
        // inside the slack window the active row stands in as the baseline.
        let baseline = match storage.preceding_history(snapshot, key, ts).await? {
            Some(row) => row,
            None => active.clone(),
        };
        if let Some(updated) = slack_overlay(policy, &active, change, now)? {
            batch.update_active(updated);
        }
        batch.insert_history(stamped(overlay(&baseline, change), ts, now, &change.requester));
        debug!(%key, ts, cur_ts, "out-of-order change within slack window");
        ChangeOutcome::AppliedWithinSlack
    } else {
        let Some(baseline) = storage.preceding_history(snapshot, key, ts).await? else {
            warn!(%key, ts, cur_ts, "stale change has no historical baseline; rejected");
            return Ok(ChangeOutcome::RejectedOutOfOrder(
                OutOfOrder::NoHistoricalBaseline,
            ));
        };
        batch.insert_history(stamped(overlay(&baseline, change), ts, now, &change.requester));
        warn!(
            %key,
            ts,
            cur_ts,
            lag_us = cur_ts.saturating_sub(ts),
            "stale change recorded in history only"
        );
        ChangeOutcome::RejectedOutOfOrder(OutOfOrder::HistoryOnly)
    };

    storage.execute_batch(snapshot, batch).await?;
    Ok(outcome)
}

fn check_transition(
    policy: &EntityPolicy,
    active: &EntityRecord,
    change: &ChangeRequest,
) -> Result<(), TimelineError> {
    match &change.state {
        Some(to) if policy.forbids(&active.state, to) => Err(TimelineError::invalid_transition(
            &active.key,
            active.state.as_str(),
            to.as_str(),
        )),
        _ => Ok(()),
    }
}

/// The active row after an in-slack change, or `None` when the policy
/// leaves it untouched. The row keeps its change-timestamp.
fn slack_overlay(
    policy: &EntityPolicy,
    active: &EntityRecord,
    change: &ChangeRequest,
    now: Micros,
) -> Result<Option<EntityRecord>, TimelineError> {
    let mut updated = active.clone();
    match &policy.slack_overlay {
        SlackOverlay::None => return Ok(None),
        SlackOverlay::All => {
            check_transition(policy, active, change)?;
            updated = overlay(active, change);
        }
        SlackOverlay::Fields(names) => {
            for name in names {
                if let Some(value) = change.fields.get(name) {
                    updated.fields.insert(name.clone(), value.clone());
                }
            }
        }
    }
    if updated.state == active.state && updated.fields == active.fields {
        return Ok(None);
    }
    updated.db_updated_ts = now;
    updated.last_chg_adapter_type = change.requester.adapter_type.clone();
    updated.last_chg_work_item_id = change.requester.work_item_id;
    Ok(Some(updated))
}

/// `base` with the change's state and fields laid over it.
pub(crate) fn overlay(base: &EntityRecord, change: &ChangeRequest) -> EntityRecord {
    let mut row = base.clone();
    if let Some(state) = &change.state {
        row.state = state.clone();
    }
    for (name, value) in &change.fields {
        row.fields.insert(name.clone(), value.clone());
    }
    row
}

pub(crate) fn stamped(
    mut row: EntityRecord,
    ts: Micros,
    now: Micros,
    requester: &Requester,
) -> EntityRecord {
    row.change_ts = ts;
    row.db_updated_ts = now;
    row.last_chg_adapter_type = requester.adapter_type.clone();
    row.last_chg_work_item_id = requester.work_item_id;
    row
}
