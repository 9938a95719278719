//! A repeating timer (time-scaled down from real-world intervals)
//! fires a few times, gets `reset()` to a new interval anchored at
//! "now", fires a few more times at the new cadence, then
//! `cancel()` stops it for good.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use corio::timer::TimerManager;

#[test]
fn reset_changes_cadence_and_cancel_stops_firing() {
    let mgr = TimerManager::new();
    let fires = Arc::new(AtomicUsize::new(0));
    let fires2 = fires.clone();

    let timer = mgr.add_timer(20, move || { fires2.fetch_add(1, Ordering::SeqCst); }, true);

    // Let it fire a handful of times at the original 20ms cadence.
    let deadline = Instant::now() + Duration::from_millis(90);
    while Instant::now() < deadline {
        for cb in mgr.list_expired() {
            cb();
        }
        std::thread::sleep(Duration::from_millis(5));
    }
    let before_reset = fires.load(Ordering::SeqCst);
    assert!(before_reset >= 2, "expected several fires before reset, got {before_reset}");

    assert!(timer.reset(40, true));

    let deadline = Instant::now() + Duration::from_millis(130);
    while Instant::now() < deadline {
        for cb in mgr.list_expired() {
            cb();
        }
        std::thread::sleep(Duration::from_millis(5));
    }
    let before_cancel = fires.load(Ordering::SeqCst);
    assert!(
        before_cancel > before_reset,
        "expected additional fires after reset, before={before_reset} after={before_cancel}"
    );

    assert!(timer.cancel());
    assert!(!mgr.has_timer());

    std::thread::sleep(Duration::from_millis(60));
    let expired = mgr.list_expired();
    assert!(expired.is_empty());
    assert_eq!(fires.load(Ordering::SeqCst), before_cancel);
}
