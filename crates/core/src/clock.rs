//! Wall-clock sources.

use std::fmt;
use std::sync::atomic::{AtomicI64, Ordering};

use timeline_storage::Micros;

/// A source of wall-clock time in microseconds since the Unix epoch.
///
/// Used for `db_updated_ts`, work item timestamps and default change
/// timestamps when a caller supplies none.
pub trait Clock: fmt::Debug + Send + Sync {
    fn now_micros(&self) -> Micros;
}

/// The system clock.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_micros(&self) -> Micros {
        let nanos = time::OffsetDateTime::now_utc().unix_timestamp_nanos();
        (nanos / 1_000) as Micros
    }
}

/// A clock that only moves when told to.
#[derive(Debug, Default)]
pub struct ManualClock {
    now: AtomicI64,
}

impl ManualClock {
    pub fn new(start: Micros) -> Self {
        Self {
            now: AtomicI64::new(start),
        }
    }

    pub fn set(&self, now: Micros) {
        self.now.store(now, Ordering::SeqCst);
    }

    /// Moves the clock forward by `delta` and returns the new time.
    pub fn advance(&self, delta: Micros) -> Micros {
        self.now.fetch_add(delta, Ordering::SeqCst) + delta
    }
}

impl Clock for ManualClock {
    fn now_micros(&self) -> Micros {
        self.now.load(Ordering::SeqCst)
    }
}
