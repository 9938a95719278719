//! # corio
//!
//! A user-space concurrency runtime for Linux: stackful coroutines
//! scheduled N:M onto a fixed worker-thread pool, with an
//! edge-triggered epoll reactor and an ordered timer set driving
//! cooperative wakeups, and a syscall hook layer that turns ordinary
//! blocking-looking `read`/`write`/`accept`/`connect`/`sleep` calls
//! into yield points instead of blocking a whole worker thread.
//!
//! Grounded on `mioco`'s coroutine-over-reactor architecture,
//! generalized from its single fixed event loop to a pool of
//! pinnable workers, and on `original_source/easy`'s
//! `Fiber`/`Scheduler`/`IOManager`/`Timer`/`hook` split for the
//! concrete semantics of each module (see `DESIGN.md` for the full
//! grounding ledger).
//!
//! ```no_run
//! use corio::runtime::Runtime;
//!
//! let rt = Runtime::new(4, false);
//! rt.spawn(|| {
//!     println!("hello from a coroutine");
//! });
//! std::thread::sleep(std::time::Duration::from_millis(10));
//! rt.stop();
//! ```

#![warn(missing_docs)]
#![allow(clippy::module_inception)]

/// Typed atomic counters used throughout the runtime's bookkeeping.
pub mod atomic;
/// Per-descriptor readiness tracking shared by the reactor and hooks.
pub mod channel;
/// Runtime-tunable constants and environment-based configuration.
pub mod config;
/// Stackful coroutines: allocation, resume/yield, and lifecycle.
pub mod coroutine;
/// The crate's own `Result`/error type for its non-POSIX API surface.
pub mod error;
/// Lazily-populated per-fd bookkeeping (socket-ness, timeouts, flags).
pub mod fd;
/// Syscall hooks that convert blocking calls into yield points.
pub mod hook;
/// The edge-triggered epoll reactor.
pub mod io_manager;
/// Top-level bootstrap tying a scheduler to a reactor.
pub mod runtime;
/// The N:M worker-thread scheduler.
pub mod scheduler;
/// Synchronization primitives built on top of `spin` and `std::sync`.
pub mod sync;
/// Ordered timers and the timer manager.
pub mod timer;
/// Worker OS threads and kernel-tid lookup.
pub mod worker;

pub use coroutine::Coroutine;
pub use error::{CoreError, CoreResult};
pub use runtime::Runtime;
pub use scheduler::{Scheduler, Task};

/// Yield the current coroutine back to the scheduler without
/// blocking on anything. For this to resume promptly the caller must
/// actually be running inside a coroutine spawned onto a
/// [`Runtime`]; called from a bare OS thread it is a no-op panic
/// guard away from nonsense, so prefer [`Runtime::spawn`] bodies only.
pub fn yield_now() {
    coroutine::current().r#yield();
}

/// Suspend the current coroutine for `ms` milliseconds via the
/// active runtime's timer set rather than blocking the worker thread.
pub fn sleep_ms(ms: u64) {
    hook::sleep_ms(ms);
}
