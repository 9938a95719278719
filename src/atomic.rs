//! Typed atomic counters.
//!
//! Grounded on `original_source/easy/base/Atomic.h`: a small generic
//! wrapper around a machine-word atomic exposing the handful of
//! operations the scheduler and coroutine id generator actually need
//! (fetch-add, add-fetch, compare-and-set, get/set), rather than the
//! full `std::sync::atomic` surface.

use std::sync::atomic::{AtomicI64, AtomicU64, AtomicUsize, Ordering};

/// A 64-bit unsigned counter, used for coroutine id generation.
#[derive(Debug, Default)]
pub struct AtomicCounter(AtomicU64);

impl AtomicCounter {
    pub const fn new(value: u64) -> Self {
        AtomicCounter(AtomicU64::new(value))
    }

    /// Returns the previous value and increments by one.
    pub fn fetch_add_one(&self) -> u64 {
        self.0.fetch_add(1, Ordering::SeqCst)
    }

    pub fn get(&self) -> u64 {
        self.0.load(Ordering::SeqCst)
    }

    pub fn set(&self, value: u64) {
        self.0.store(value, Ordering::SeqCst);
    }
}

/// A signed counter used for reference/active-worker bookkeeping
/// where a transient negative value during concurrent updates must
/// not panic.
#[derive(Debug, Default)]
pub struct AtomicSignedCounter(AtomicI64);

impl AtomicSignedCounter {
    pub const fn new(value: i64) -> Self {
        AtomicSignedCounter(AtomicI64::new(value))
    }

    pub fn increment_and_fetch(&self) -> i64 {
        self.0.fetch_add(1, Ordering::SeqCst) + 1
    }

    pub fn decrement_and_fetch(&self) -> i64 {
        self.0.fetch_sub(1, Ordering::SeqCst) - 1
    }

    pub fn get(&self) -> i64 {
        self.0.load(Ordering::SeqCst)
    }

    pub fn compare_and_set(&self, old: i64, new: i64) -> bool {
        self.0
            .compare_exchange(old, new, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }
}

/// An unsigned size counter, used for the IOManager's pending-events
/// count and the Channel table length.
#[derive(Debug, Default)]
pub struct AtomicSize(AtomicUsize);

impl AtomicSize {
    pub const fn new(value: usize) -> Self {
        AtomicSize(AtomicUsize::new(value))
    }

    pub fn get(&self) -> usize {
        self.0.load(Ordering::SeqCst)
    }

    pub fn increment(&self) {
        self.0.fetch_add(1, Ordering::SeqCst);
    }

    pub fn decrement(&self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counter_is_monotonic() {
        let c = AtomicCounter::new(0);
        assert_eq!(c.fetch_add_one(), 0);
        assert_eq!(c.fetch_add_one(), 1);
        assert_eq!(c.get(), 2);
    }

    #[test]
    fn signed_counter_tracks_active_workers() {
        let c = AtomicSignedCounter::new(0);
        assert_eq!(c.increment_and_fetch(), 1);
        assert_eq!(c.increment_and_fetch(), 2);
        assert_eq!(c.decrement_and_fetch(), 1);
        assert!(c.compare_and_set(1, 0));
        assert_eq!(c.get(), 0);
    }
}
