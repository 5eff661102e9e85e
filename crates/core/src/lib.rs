//! Temporal state/history reconciliation and work item lifecycle for
//! control-plane entities.
//!
//! Updates to an entity (node, job, component, ...) arrive out of wall-clock
//! order from independent sources. A [`Timeline`] keeps one authoritative
//! active row per entity consistent with an append-only history log, with no
//! two history rows of an entity sharing a change-timestamp. It also drives
//! background work items from `Queued` to `Done` and reclaims items whose
//! worker has disappeared.
//!
//! All state lives behind a [`timeline_storage::TimelineStorage`] backend;
//! every public operation is one atomic unit of work against it.

pub mod allocator;
pub mod clock;
pub mod config;
pub mod entity;
mod error;
pub mod policy;
pub mod reconcile;
mod timeline;
pub mod work_item;
pub mod workers;
pub mod zombie;

pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{ConfigError, ReconcileConfig, TimelineConfig, WorkItemConfig};
pub use entity::{CreateRequest, TerminateOutcome, TerminateRequest};
pub use error::TimelineError;
pub use policy::{EntityPolicy, MissingOnTerminate, PolicySet, SlackOverlay};
pub use reconcile::{ChangeOutcome, ChangeRequest, OutOfOrder, Requester};
pub use timeline::Timeline;
pub use work_item::EnqueueRequest;
pub use zombie::ReclaimedWorkItem;
