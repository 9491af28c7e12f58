//! Collection timestamps.
//!
//! Every write in a scope receives `max(now, previous + 1)` as its `last_modified`,
//! which is also stored as the new collection timestamp. Timestamps therefore increase
//! strictly within a scope even when writes land in the same millisecond or when the
//! clock moves backward.
//!
//! Backends differ only in how they make the read-modify-write atomic: the in-memory
//! store holds its write lock, the key/value store runs a compare-and-swap loop (see
//! [`CasPolicy`]), and the relational store evaluates the same expression inside the
//! write's transaction.

use std::{
    fmt::Debug,
    sync::{
        Arc,
        atomic::{AtomicI64, Ordering},
    },
};

use chrono::Utc;

/// Source of the current time, in milliseconds since the epoch.
pub trait Clock: Send + Sync + Debug {
    fn now_millis(&self) -> i64;
}

/// Wall clock.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_millis(&self) -> i64 {
        Utc::now().timestamp_millis()
    }
}

/// A clock that only moves when told to. Clones share the same time.
#[derive(Debug, Clone)]
pub struct ManualClock {
    now: Arc<AtomicI64>,
}

impl ManualClock {
    pub fn new(now: i64) -> Self {
        Self { now: Arc::new(AtomicI64::new(now)) }
    }

    pub fn set(&self, now: i64) {
        self.now.store(now, Ordering::SeqCst);
    }

    /// Moves the clock by `delta` milliseconds, backward when negative.
    pub fn advance(&self, delta: i64) {
        self.now.fetch_add(delta, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now_millis(&self) -> i64 {
        self.now.load(Ordering::SeqCst)
    }
}

/// Shared handle on a clock.
pub type ClockRef = Arc<dyn Clock>;

/// The default clock handle.
pub fn system_clock() -> ClockRef {
    Arc::new(SystemClock)
}

/// Computes the next timestamp of a scope.
pub fn next_timestamp(previous: Option<i64>, now: i64) -> i64 {
    match previous {
        Some(previous) if previous >= now => previous + 1,
        _ => now,
    }
}

/// Retry budget of an optimistic timestamp bump.
///
/// Each attempt is a read followed by a conditional write, so retrying immediately is
/// cheap. The bound keeps a pathological contention from spinning forever.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CasPolicy {
    pub max_attempts: usize,
}

impl CasPolicy {
    pub const DEFAULT_MAX_ATTEMPTS: usize = 100;

    pub fn new(max_attempts: usize) -> Self {
        Self { max_attempts: max_attempts.max(1) }
    }
}

impl Default for CasPolicy {
    fn default() -> Self {
        Self::new(Self::DEFAULT_MAX_ATTEMPTS)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn uses_the_clock_when_it_is_ahead() {
        assert_eq!(next_timestamp(None, 1_000), 1_000);
        assert_eq!(next_timestamp(Some(999), 1_000), 1_000);
    }

    #[test]
    fn slides_forward_on_collision_or_skew() {
        assert_eq!(next_timestamp(Some(1_000), 1_000), 1_001);
        assert_eq!(next_timestamp(Some(5_000), 1_000), 5_001);
    }

    #[test]
    fn manual_clock_is_shared_between_clones() {
        let clock = ManualClock::new(10);
        let other = clock.clone();

        clock.advance(5);
        assert_eq!(other.now_millis(), 15);
        other.advance(-20);
        assert_eq!(clock.now_millis(), -5);
    }
}
