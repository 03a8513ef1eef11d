//! Injectable wall-clock source.
//!
//! Isolates `Utc::now()` calls to a single seam so tests can supply a fixed
//! or stepped clock instead of real time, the way the sqlite driver's tests
//! isolate time-sensitive assertions to narrow call sites.

use chrono::{DateTime, Utc};

/// A source of the current UTC instant.
pub trait Clock: Send + Sync {
    /// Returns the current instant.
    fn now(&self) -> DateTime<Utc>;
}

/// The real system clock.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// A clock that starts at a fixed instant and advances by one microsecond
/// on every call, so ordering-sensitive tests get distinct, monotonic
/// timestamps without sleeping. Exposed crate-wide (not `#[cfg(test)]`) so
/// downstream crates' own test suites can use it too.
pub struct FixedClock {
    micros: std::sync::atomic::AtomicI64,
}

impl FixedClock {
    /// Builds a clock starting at `start`.
    pub fn new(start: DateTime<Utc>) -> Self {
        Self { micros: std::sync::atomic::AtomicI64::new(start.timestamp_micros()) }
    }
}

impl Clock for FixedClock {
    fn now(&self) -> DateTime<Utc> {
        use std::sync::atomic::Ordering;
        let micros = self.micros.fetch_add(1, Ordering::SeqCst);
        DateTime::from_timestamp_micros(micros).expect("valid timestamp")
    }
}
