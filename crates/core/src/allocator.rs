//! Unique-timestamp allocation.
//!
//! A history row is keyed by `(entity, change_ts)`, so before any history row
//! is written its timestamp is moved off every existing one. The allocator is
//! read-only; the caller performs the write in the same snapshot, which keeps
//! the probed state stable until commit.

use timeline_storage::{EntityKey, Micros, TimelineStorage};
use tracing::{debug, warn};

use crate::error::TimelineError;

/// Probe count after which a single allocation is logged as contended.
const CONTENDED_PROBES: u32 = 1_000;

/// Return the first timestamp `>= desired` that differs from `active` and
/// collides with no history row of `key`.
///
/// Each collision bumps the candidate by one microsecond. `max_probes == 0`
/// probes without bound; otherwise exceeding `max_probes` history lookups
/// fails with [`TimelineError::TimestampExhausted`]. Running past
/// `Micros::MAX` fails the same way.
pub async fn allocate_unique_ts<S: TimelineStorage>(
    storage: &S,
    snapshot: &mut S::Snapshot,
    key: &EntityKey,
    desired: Micros,
    active: Option<Micros>,
    max_probes: u32,
) -> Result<Micros, TimelineError> {
    let mut candidate = desired;
    let mut probes = 0u32;
    loop {
        if active == Some(candidate) {
            candidate = bump(key, desired, probes, candidate)?;
        }
        if max_probes != 0 && probes >= max_probes {
            return Err(TimelineError::TimestampExhausted {
                key: key.clone(),
                desired,
                probes,
            });
        }
        probes += 1;
        if probes == CONTENDED_PROBES {
            warn!(%key, desired, probes, "history timestamp heavily contended");
        }
        if !storage.history_exists_at(snapshot, key, candidate).await? {
            break;
        }
        candidate = bump(key, desired, probes, candidate)?;
    }
    if candidate != desired {
        debug!(%key, desired, allocated = candidate, probes, "bumped change timestamp");
    }
    Ok(candidate)
}

fn bump(
    key: &EntityKey,
    desired: Micros,
    probes: u32,
    candidate: Micros,
) -> Result<Micros, TimelineError> {
    candidate
        .checked_add(1)
        .ok_or_else(|| TimelineError::TimestampExhausted {
            key: key.clone(),
            desired,
            probes,
        })
}
