//! Top-level bootstrap: wires a [`Scheduler`] to an [`IOManager`] and
//! installs the pair as the process's active hook target, mirroring
//! the constructor sequence in `original_source/easy/base/hook.cc`'s
//! `hook_init` plus `mioco`'s `Mioco::start` entry point.

use std::sync::Arc;

use crate::coroutine::Coroutine;
use crate::io_manager::IOManager;
use crate::scheduler::{Scheduler, Task};
use crate::{config, hook};

/// A running coroutine runtime: a worker pool plus its epoll reactor.
pub struct Runtime {
    scheduler: Arc<Scheduler>,
    io: IOManager,
}

impl Runtime {
    /// Build and start a runtime with `workers` worker threads. If
    /// `use_caller`, the constructing thread joins the pool instead
    /// of a dedicated thread being spawned for it.
    pub fn new(workers: usize, use_caller: bool) -> Runtime {
        let scheduler = Scheduler::new(workers, use_caller, "corio-worker");
        let io = IOManager::new(scheduler.clone());
        hook::install(io.clone());
        scheduler.start();
        Runtime { scheduler, io }
    }

    /// Convenience: a single-worker runtime using the default stack
    /// size from [`config::global`].
    pub fn single_threaded() -> Runtime {
        let _ = config::global();
        Runtime::new(1, true)
    }

    pub fn io_manager(&self) -> &IOManager {
        &self.io
    }

    pub fn scheduler(&self) -> &Arc<Scheduler> {
        &self.scheduler
    }

    /// Schedule `f` to run as a new coroutine on this runtime.
    pub fn spawn(&self, f: impl FnOnce() + Send + 'static) {
        let stack = config::global().coroutine_stack_size;
        let co = Coroutine::new(f, stack);
        self.scheduler.schedule(Task::Coroutine(co), None);
    }

    /// Stop accepting work and join every worker thread.
    pub fn stop(&self) {
        self.scheduler.stop();
    }
}

impl Drop for Runtime {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn spawned_coroutines_run_to_completion() {
        let rt = Runtime::new(2, false);
        let count = Arc::new(AtomicUsize::new(0));
        for _ in 0..8 {
            let count2 = count.clone();
            rt.spawn(move || {
                count2.fetch_add(1, Ordering::SeqCst);
            });
        }
        std::thread::sleep(std::time::Duration::from_millis(150));
        rt.stop();
        assert_eq!(count.load(Ordering::SeqCst), 8);
    }
}
