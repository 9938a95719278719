//! Primitive synchronization wrappers.
//!
//! Grounded on `original_source/easy/base/Mutex.{h,cc}`: the original
//! wraps `pthread_mutex_t` / `pthread_rwlock_t` / `pthread_spinlock_t`
//! / `sem_t` behind RAII guards. We keep the same four primitives —
//! mutex, rwlock, spinlock, counting semaphore — but back them with
//! `std::sync` and the `spin` crate rather than raw `pthread_*` FFI,
//! since Rust's standard primitives already provide poison-safe RAII
//! guards.

pub use spin::Mutex as SpinLock;
pub use spin::MutexGuard as SpinLockGuard;
pub use std::sync::{Mutex, MutexGuard, RwLock, RwLockReadGuard, RwLockWriteGuard};

use std::sync::{Condvar, Mutex as StdMutex};

/// A classic counting semaphore: `wait()` blocks until the count is
/// positive then decrements it; `notify()` increments the count and
/// wakes one waiter.
///
/// The original wraps POSIX `sem_t`; there is no safe Rust wrapper for
/// it in this crate's dependency set, so the idiomatic replacement is
/// a condvar-guarded counter, which is what the rest of the Rust
/// ecosystem reaches for in the same spot.
pub struct Semaphore {
    count: StdMutex<u32>,
    cond: Condvar,
}

impl Semaphore {
    pub fn new(initial: u32) -> Self {
        Semaphore {
            count: StdMutex::new(initial),
            cond: Condvar::new(),
        }
    }

    pub fn wait(&self) {
        let mut count = self.count.lock().unwrap();
        while *count == 0 {
            count = self.cond.wait(count).unwrap();
        }
        *count -= 1;
    }

    pub fn notify(&self) {
        let mut count = self.count.lock().unwrap();
        *count += 1;
        self.cond.notify_one();
    }
}
