//! Per-kind reconciliation policies.
//!
//! Every entity kind runs the same reconciliation control flow; the
//! differences between kinds (which fields an in-slack change may still
//! overlay, which transitions are forbidden, what termination writes) live
//! here as data.

use std::collections::BTreeMap;

use serde::Serialize;
use timeline_storage::EntityKind;

/// What an out-of-order change inside the slack window overlays onto the
/// active row. The active row's change-timestamp is never moved back.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum SlackOverlay {
    /// The active row is left untouched.
    None,
    /// The supplied state and every supplied field are overlaid.
    All,
    /// Only the named fields are overlaid, and only when supplied.
    Fields(Vec<String>),
}

/// What `terminate_entity` does when the entity has no active row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum MissingOnTerminate {
    Error,
    Ignore,
    /// Write a single terminal history row with the supplied fields.
    RecordTombstone,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EntityPolicy {
    pub slack_overlay: SlackOverlay,
    /// `(from, to)` state pairs rejected with `InvalidTransition`.
    pub forbidden_transitions: Vec<(String, String)>,
    /// Bulk component sync leaves members already in the target state alone.
    pub skip_unchanged: bool,
    pub terminal_state: String,
    pub on_missing_terminate: MissingOnTerminate,
}

impl EntityPolicy {
    /// The built-in policy for `kind`.
    pub fn for_kind(kind: EntityKind) -> Self {
        let base = EntityPolicy {
            slack_overlay: SlackOverlay::None,
            forbidden_transitions: Vec::new(),
            skip_unchanged: false,
            terminal_state: "D".to_string(),
            on_missing_terminate: MissingOnTerminate::Error,
        };
        match kind {
            EntityKind::ComputeNode => EntityPolicy {
                slack_overlay: overlay(&["environment", "wlm_node_state", "proof_of_life_ts"]),
                forbidden_transitions: error_to_active(),
                terminal_state: "M".to_string(),
                ..base
            },
            EntityKind::ServiceNode => EntityPolicy {
                slack_overlay: overlay(&["inventory_ts", "bios_info", "proof_of_life_ts"]),
                forbidden_transitions: error_to_active(),
                terminal_state: "M".to_string(),
                ..base
            },
            EntityKind::Job => EntityPolicy {
                slack_overlay: overlay(&["wlm_job_state"]),
                terminal_state: "T".to_string(),
                on_missing_terminate: MissingOnTerminate::RecordTombstone,
                ..base
            },
            EntityKind::JobStep => EntityPolicy {
                slack_overlay: overlay(&["wlm_job_step_state"]),
                terminal_state: "T".to_string(),
                ..base
            },
            EntityKind::Component => EntityPolicy {
                skip_unchanged: true,
                terminal_state: "M".to_string(),
                ..base
            },
            EntityKind::Diagnostic => EntityPolicy {
                terminal_state: "F".to_string(),
                ..base
            },
            EntityKind::ServiceOperation => EntityPolicy {
                slack_overlay: overlay(&["remarks"]),
                terminal_state: "F".to_string(),
                ..base
            },
            EntityKind::Reservation | EntityKind::WorkItem => base,
        }
    }

    pub fn forbids(&self, from: &str, to: &str) -> bool {
        self.forbidden_transitions
            .iter()
            .any(|(f, t)| f == from && t == to)
    }
}

fn overlay(fields: &[&str]) -> SlackOverlay {
    SlackOverlay::Fields(fields.iter().map(|f| f.to_string()).collect())
}

/// Nodes may not go straight from error back to active.
fn error_to_active() -> Vec<(String, String)> {
    vec![("E".to_string(), "A".to_string())]
}

/// The policy table consulted by a timeline, one entry per kind.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PolicySet {
    overrides: BTreeMap<EntityKind, EntityPolicy>,
}

impl Default for PolicySet {
    fn default() -> Self {
        Self::new()
    }
}

impl PolicySet {
    pub fn new() -> Self {
        Self {
            overrides: BTreeMap::new(),
        }
    }

    /// Replace the policy for `kind`.
    pub fn with(mut self, kind: EntityKind, policy: EntityPolicy) -> Self {
        self.overrides.insert(kind, policy);
        self
    }

    pub fn get(&self, kind: EntityKind) -> EntityPolicy {
        self.overrides
            .get(&kind)
            .cloned()
            .unwrap_or_else(|| EntityPolicy::for_kind(kind))
    }
}
