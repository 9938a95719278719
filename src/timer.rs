//! Timers and the ordered `TimerManager`.
//!
//! Grounded on `original_source/easy/base/Timer.{h,cc}`: timers are
//! ordered by `(deadline, identity)`, `list_expired` detects clock
//! rollover by comparing against the previous check's timestamp, and
//! conditional timers wrap a callback so it only runs if a weak
//! reference can still be upgraded — the mechanism behind per-syscall
//! timeouts that may have already been satisfied normally.

use std::cmp::Ordering as CmpOrdering;
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Instant;

use crate::atomic::AtomicCounter;

static NEXT_TIMER_ID: AtomicCounter = AtomicCounter::new(1);

/// Seam for injecting a controllable time source. `TimerManager` reads
/// the clock on every deadline computation instead of calling
/// `Instant::now()` directly, so the clock-rollover branch of
/// `list_expired` can be driven by a test clock that actually moves
/// backward, which a real monotonic clock never does.
pub trait Clock: Send + Sync {
    fn now_ms(&self) -> u64;
}

/// Default clock: milliseconds elapsed since this clock was
/// constructed, backed by `Instant` the way `original_source`'s
/// `GetCurrentMS` is backed by `clock_gettime(CLOCK_MONOTONIC)`.
pub struct MonotonicClock {
    epoch: Instant,
}

impl Default for MonotonicClock {
    fn default() -> Self {
        MonotonicClock { epoch: Instant::now() }
    }
}

impl Clock for MonotonicClock {
    fn now_ms(&self) -> u64 {
        self.epoch.elapsed().as_millis() as u64
    }
}

/// Timer bodies are `Fn`, not `FnOnce`: a repeating timer's body is
/// invoked once per firing, so it must be callable more than once
/// (mirrors `std::function<void()>` in `original_source`).
type Callback = Arc<dyn Fn() + Send + Sync>;

struct TimerState {
    deadline_ms: AtomicU64,
    interval_ms: u64,
    repeat: bool,
    cb: Mutex<Option<Callback>>,
}

/// Handle to an armed (or cancelled) timer.
#[derive(Clone)]
pub struct Timer {
    id: u64,
    state: Arc<TimerState>,
    manager: Arc<TimerManagerCore>,
}

impl Timer {
    fn deadline(&self) -> u64 {
        self.state.deadline_ms.load(Ordering::SeqCst)
    }

    /// Clear the callable and remove the timer from the set. Returns
    /// `true` iff it was still armed.
    pub fn cancel(&self) -> bool {
        let had_cb = self.state.cb.lock().unwrap().take().is_some();
        self.manager.remove(self.id, self.deadline());
        had_cb
    }

    /// Reset the deadline to `now + interval`, preserving ordering by
    /// removing then reinserting.
    pub fn refresh(&self) -> bool {
        if self.state.cb.lock().unwrap().is_none() {
            return false;
        }
        let old_deadline = self.deadline();
        let new_deadline = self.manager.clock.now_ms() + self.state.interval_ms;
        self.manager.reinsert(self.id, old_deadline, new_deadline, self.state.clone());
        self.state.deadline_ms.store(new_deadline, Ordering::SeqCst);
        true
    }

    /// Reset with a new interval. `from_now`: anchor at `now`;
    /// otherwise anchor at the timer's original start
    /// (`deadline - old_interval`).
    pub fn reset(&self, new_interval_ms: u64, from_now: bool) -> bool {
        if self.state.cb.lock().unwrap().is_none() {
            return false;
        }
        let old_deadline = self.deadline();
        let anchor = if from_now {
            self.manager.clock.now_ms()
        } else {
            old_deadline.saturating_sub(self.state.interval_ms)
        };
        let new_deadline = anchor + new_interval_ms;
        self.manager.reinsert(self.id, old_deadline, new_deadline, self.state.clone());
        self.state.deadline_ms.store(new_deadline, Ordering::SeqCst);
        true
    }
}

struct OrderedTimer {
    deadline_ms: u64,
    id: u64,
    state: Arc<TimerState>,
}

impl Clone for OrderedTimer {
    fn clone(&self) -> Self {
        OrderedTimer {
            deadline_ms: self.deadline_ms,
            id: self.id,
            state: self.state.clone(),
        }
    }
}
impl PartialEq for OrderedTimer {
    fn eq(&self, other: &Self) -> bool {
        self.deadline_ms == other.deadline_ms && self.id == other.id
    }
}
impl Eq for OrderedTimer {}
impl PartialOrd for OrderedTimer {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}
impl Ord for OrderedTimer {
    fn cmp(&self, other: &Self) -> CmpOrdering {
        (self.deadline_ms, self.id).cmp(&(other.deadline_ms, other.id))
    }
}

struct TimerManagerCore {
    set: Mutex<BTreeSet<OrderedTimer>>,
    previous_check_ms: AtomicU64,
    on_inserted_at_front: Mutex<Option<Box<dyn Fn() + Send + Sync>>>,
    clock: Arc<dyn Clock>,
}

impl TimerManagerCore {
    fn remove(&self, id: u64, deadline_ms: u64) {
        let mut set = self.set.lock().unwrap();
        set.retain(|t| !(t.id == id && t.deadline_ms == deadline_ms));
    }

    fn reinsert(&self, id: u64, old_deadline_ms: u64, new_deadline_ms: u64, state: Arc<TimerState>) {
        let mut set = self.set.lock().unwrap();
        set.retain(|t| !(t.id == id && t.deadline_ms == old_deadline_ms));
        let became_front = set
            .iter()
            .next()
            .map(|front| new_deadline_ms < front.deadline_ms)
            .unwrap_or(true);
        set.insert(OrderedTimer {
            deadline_ms: new_deadline_ms,
            id,
            state,
        });
        if became_front {
            drop(set);
            self.notify_inserted_at_front();
        }
    }

    fn notify_inserted_at_front(&self) {
        if let Some(cb) = self.on_inserted_at_front.lock().unwrap().as_ref() {
            cb();
        }
    }
}

/// Ordered set of deadlines fed through to a reactor's timer fd.
pub struct TimerManager {
    core: Arc<TimerManagerCore>,
}

impl Default for TimerManager {
    fn default() -> Self {
        Self::new()
    }
}

impl TimerManager {
    pub fn new() -> Self {
        Self::with_clock(Arc::new(MonotonicClock::default()))
    }

    /// Build a `TimerManager` reading time from `clock` instead of the
    /// default monotonic source. Tests use this to drive `list_expired`'s
    /// rollover branch with a clock that can actually move backward.
    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        let now = clock.now_ms();
        TimerManager {
            core: Arc::new(TimerManagerCore {
                set: Mutex::new(BTreeSet::new()),
                previous_check_ms: AtomicU64::new(now),
                on_inserted_at_front: Mutex::new(None),
                clock,
            }),
        }
    }

    /// Install the callback invoked whenever an insertion becomes the
    /// new earliest deadline, so a reactor blocked in `epoll_wait` can
    /// be woken to recompute its timeout.
    pub fn set_front_notifier(&self, f: impl Fn() + Send + Sync + 'static) {
        *self.core.on_inserted_at_front.lock().unwrap() = Some(Box::new(f));
    }

    pub fn add_timer(&self, interval_ms: u64, cb: impl Fn() + Send + Sync + 'static, repeat: bool) -> Timer {
        self.insert(interval_ms, Arc::new(cb), repeat)
    }

    /// A timer whose callback only runs if `weak_cond` can still be
    /// upgraded at fire time; otherwise the tick is silently dropped.
    /// This is how per-syscall timeouts cancel themselves when the
    /// operation already completed normally.
    pub fn add_conditional_timer<T: Send + Sync + 'static>(
        &self,
        interval_ms: u64,
        cb: impl Fn() + Send + Sync + 'static,
        weak_cond: Weak<T>,
        repeat: bool,
    ) -> Timer {
        let wrapped = move || {
            if weak_cond.upgrade().is_some() {
                cb();
            }
        };
        self.insert(interval_ms, Arc::new(wrapped), repeat)
    }

    fn insert(&self, interval_ms: u64, cb: Callback, repeat: bool) -> Timer {
        let deadline_ms = self.core.clock.now_ms() + interval_ms;
        let id = NEXT_TIMER_ID.fetch_add_one();
        let state = Arc::new(TimerState {
            deadline_ms: AtomicU64::new(deadline_ms),
            interval_ms,
            repeat,
            cb: Mutex::new(Some(cb)),
        });
        let became_front = {
            let mut set = self.core.set.lock().unwrap();
            let front = set.iter().next().map(|t| t.deadline_ms);
            set.insert(OrderedTimer {
                deadline_ms,
                id,
                state: state.clone(),
            });
            front.map(|f| deadline_ms < f).unwrap_or(true)
        };
        if became_front {
            self.core.notify_inserted_at_front();
        }
        Timer {
            id,
            state,
            manager: self.core.clone(),
        }
    }

    pub fn has_timer(&self) -> bool {
        !self.core.set.lock().unwrap().is_empty()
    }

    /// Milliseconds until the earliest deadline, or `None` if no
    /// timer is pending.
    pub fn next_timer_ms(&self) -> Option<i64> {
        let set = self.core.set.lock().unwrap();
        set.iter().next().map(|t| {
            let now = self.core.clock.now_ms();
            if t.deadline_ms <= now {
                0
            } else {
                (t.deadline_ms - now) as i64
            }
        })
    }

    /// Harvest every timer whose deadline has passed, reinserting
    /// repeating ones at `now + interval` and clearing (removing)
    /// one-shots. Detects clock rollover: if `now` precedes the
    /// previous check by more than an hour, every timer is treated
    /// as expired regardless of deadline.
    pub fn list_expired(&self) -> Vec<Callback> {
        let now = self.core.clock.now_ms();
        let previous = self.core.previous_check_ms.swap(now, Ordering::SeqCst);
        let rollover = now + 3_600_000 < previous;

        let mut set = self.core.set.lock().unwrap();
        let mut due: Vec<OrderedTimer> = Vec::new();
        loop {
            let take = match set.iter().next() {
                Some(t) if rollover || t.deadline_ms <= now => Some(t.clone()),
                _ => None,
            };
            let Some(t) = take else { break };
            set.remove(&t);
            due.push(t);
        }

        let mut expired = Vec::with_capacity(due.len());
        for t in due {
            let cb = if t.state.repeat {
                t.state.cb.lock().unwrap().clone()
            } else {
                t.state.cb.lock().unwrap().take()
            };
            if let Some(cb) = cb {
                expired.push(cb);
                if t.state.repeat {
                    let new_deadline = now + t.state.interval_ms;
                    t.state.deadline_ms.store(new_deadline, Ordering::SeqCst);
                    set.insert(OrderedTimer {
                        deadline_ms: new_deadline,
                        id: t.id,
                        state: t.state.clone(),
                    });
                }
            }
        }
        expired
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    /// A clock whose reading is set directly, so tests can simulate a
    /// backward jump without waiting on, or being at the mercy of, a
    /// real monotonic clock.
    struct TestClock(AtomicU64);

    impl TestClock {
        fn new(start_ms: u64) -> Self {
            TestClock(AtomicU64::new(start_ms))
        }

        fn set(&self, ms: u64) {
            self.0.store(ms, Ordering::SeqCst);
        }
    }

    impl Clock for TestClock {
        fn now_ms(&self) -> u64 {
            self.0.load(Ordering::SeqCst)
        }
    }

    #[test]
    fn list_expired_returns_everything_after_clock_rolls_back() {
        let clock = Arc::new(TestClock::new(10_000_000));
        let mgr = TimerManager::with_clock(clock.clone());

        // Deadlines far in the future relative to the clock's current
        // reading, so neither fires under the ordinary `deadline <= now`
        // rule.
        let fired = Arc::new(AtomicUsize::new(0));
        let f1 = fired.clone();
        let f2 = fired.clone();
        mgr.add_timer(60_000, move || { f1.fetch_add(1, Ordering::SeqCst); }, false);
        mgr.add_timer(120_000, move || { f2.fetch_add(1, Ordering::SeqCst); }, false);

        // Establish `previous_check_ms` via a normal, forward-moving check.
        clock.set(10_000_500);
        assert!(mgr.list_expired().is_empty());

        // Jump the clock backward by more than an hour.
        clock.set(10_000_500 - 3_600_001);
        let expired = mgr.list_expired();
        assert_eq!(expired.len(), 2);
        assert!(!mgr.has_timer());
    }

    #[test]
    fn timers_order_by_deadline() {
        let mgr = TimerManager::new();
        let order = Arc::new(Mutex::new(Vec::new()));
        let o1 = order.clone();
        let o2 = order.clone();
        mgr.add_timer(0, move || o1.lock().unwrap().push(1), false);
        mgr.add_timer(0, move || o2.lock().unwrap().push(2), false);
        std::thread::sleep(Duration::from_millis(5));
        let expired = mgr.list_expired();
        assert_eq!(expired.len(), 2);
        for cb in expired {
            cb();
        }
        assert_eq!(*order.lock().unwrap(), vec![1, 2]);
    }

    #[test]
    fn cancel_prevents_firing() {
        let mgr = TimerManager::new();
        let fired = Arc::new(AtomicUsize::new(0));
        let fired2 = fired.clone();
        let t = mgr.add_timer(
            0,
            move || {
                fired2.fetch_add(1, Ordering::SeqCst);
            },
            false,
        );
        assert!(t.cancel());
        std::thread::sleep(Duration::from_millis(5));
        let expired = mgr.list_expired();
        assert!(expired.is_empty());
        assert_eq!(fired.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn conditional_timer_drops_silently_once_condition_is_gone() {
        let mgr = TimerManager::new();
        let cond = Arc::new(());
        let weak = Arc::downgrade(&cond);
        let fired = Arc::new(AtomicUsize::new(0));
        let fired2 = fired.clone();
        mgr.add_conditional_timer(
            0,
            move || {
                fired2.fetch_add(1, Ordering::SeqCst);
            },
            weak,
            false,
        );
        drop(cond);
        std::thread::sleep(Duration::from_millis(5));
        for cb in mgr.list_expired() {
            cb();
        }
        assert_eq!(fired.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn repeating_timer_reinserts_at_now_plus_interval() {
        let mgr = TimerManager::new();
        let count = Arc::new(AtomicUsize::new(0));
        let count2 = count.clone();
        mgr.add_timer(
            0,
            move || {
                count2.fetch_add(1, Ordering::SeqCst);
            },
            true,
        );
        std::thread::sleep(Duration::from_millis(5));
        for cb in mgr.list_expired() {
            cb();
        }
        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert!(mgr.has_timer());
    }
}
