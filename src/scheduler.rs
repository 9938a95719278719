//! The N:M asymmetric scheduler: a fixed worker-thread pool draining a
//! FIFO task queue of coroutines and callables, with optional
//! attachment of the constructing ("caller") thread.
//!
//! Grounded on `mioco`'s per-thread dispatch loop (its old
//! `src/thread.rs`) and on
//! `other_examples/f8cc8f18_doomsplayer-coroutine-demo__src-scheduler-fifo_scheduler.rs.rs`
//! for the worker-pulls-one-task-or-idles shape; the pin/tickle/
//! can_stop contract is this crate's own addition since neither
//! source encodes per-task thread affinity.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use log::{debug, warn};

use crate::atomic::AtomicSignedCounter;
use crate::coroutine::{self, Coroutine, State};
use crate::worker::{kernel_tid, WorkerThread};

/// A queued unit of work: exactly one of a coroutine reference or a
/// callable, optionally pinned to a worker's kernel tid (`None` means
/// any worker may run it).
pub enum Task {
    Coroutine(Arc<Coroutine>),
    Callable(Box<dyn FnOnce() + Send>),
}

struct QueuedTask {
    task: Task,
    pin: Option<i32>,
}

/// Extension point for the hot-spot virtual methods `tickle`,
/// `idle`, `can_stop`, `on_timer_inserted_at_front` (design notes
/// §9). The only implementor in this crate is the IOManager reactor;
/// a plain [`Scheduler`] falls back to built-in defaults when no
/// extension is installed.
pub trait SchedulerExtension: Send + Sync {
    /// Body of the per-worker idle coroutine: called repeatedly while
    /// a worker has no task, until it returns `true` to request the
    /// idle coroutine (and, transitively, the calling worker loop)
    /// terminate.
    fn idle_tick(&self, scheduler: &Scheduler) -> bool;

    /// Wake a sleeping idle worker. Default is a no-op; the IOManager
    /// overrides it to write a byte to its wake pipe, but only when a
    /// worker is actually idle.
    fn tickle(&self, scheduler: &Scheduler) {
        let _ = scheduler;
    }

    /// Additional shutdown readiness beyond "no running flag, empty
    /// queue, no active workers" (IOManager adds "no pending events,
    /// no pending timers").
    fn extra_can_stop(&self, _scheduler: &Scheduler) -> bool {
        true
    }
}

thread_local! {
    static CURRENT_SCHEDULER: std::cell::RefCell<Option<Arc<Scheduler>>> =
        std::cell::RefCell::new(None);
}

pub fn current_scheduler() -> Option<Arc<Scheduler>> {
    CURRENT_SCHEDULER.with(|c| c.borrow().clone())
}

fn set_current_scheduler(s: Option<Arc<Scheduler>>) {
    CURRENT_SCHEDULER.with(|c| *c.borrow_mut() = s);
}

pub struct Scheduler {
    name: String,
    use_caller: bool,
    caller_tid: Option<i32>,
    n_workers: usize,
    stack_size: usize,
    workers: Mutex<Vec<WorkerThread>>,
    tasks: Mutex<VecDeque<QueuedTask>>,
    active_workers: AtomicSignedCounter,
    idle_workers: AtomicSignedCounter,
    running: AtomicBool,
    extension: RwLock<Option<Arc<dyn SchedulerExtension>>>,
    caller_sched_coroutine: Mutex<Option<Arc<Coroutine>>>,
}

impl Scheduler {
    /// `name` used as the worker thread name prefix. `n` must be
    /// >= 1. If `use_caller`, the constructing thread joins the
    /// worker set (so only `n - 1` extra threads are spawned by
    /// [`Scheduler::start`]) and a dedicated caller-scheduling
    /// coroutine is created immediately.
    pub fn new(n: usize, use_caller: bool, name: impl Into<String>) -> Arc<Scheduler> {
        assert!(n >= 1, "Scheduler requires at least one worker");
        if use_caller {
            assert!(
                current_scheduler().is_none(),
                "a use_caller scheduler is already attached to this thread"
            );
        }
        let sched = Arc::new(Scheduler {
            name: name.into(),
            use_caller,
            caller_tid: if use_caller { Some(kernel_tid()) } else { None },
            n_workers: n,
            stack_size: crate::config::DEFAULT_STACK_SIZE,
            workers: Mutex::new(Vec::new()),
            tasks: Mutex::new(VecDeque::new()),
            active_workers: AtomicSignedCounter::new(0),
            idle_workers: AtomicSignedCounter::new(0),
            running: AtomicBool::new(false),
            extension: RwLock::new(None),
            caller_sched_coroutine: Mutex::new(None),
        });
        if use_caller {
            set_current_scheduler(Some(sched.clone()));
            let caller_co = coroutine::current();
            // The caller-scheduling coroutine runs the same dispatch
            // loop as a worker, but on the constructing thread's own
            // stack via reset()-free direct use: we create a fresh
            // sub-coroutine rather than repurposing the root, since
            // the root must remain resumable as the thread's original
            // stack — root coroutines carry no entry callable.
            let _ = caller_co; // establishes root/current for this thread
            let sched2 = sched.clone();
            let loop_co = Coroutine::new(move || Scheduler::dispatch_loop(sched2), sched.stack_size);
            *sched.caller_sched_coroutine.lock().unwrap() = Some(loop_co);
        }
        sched
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn set_extension(&self, ext: Arc<dyn SchedulerExtension>) {
        *self.extension.write().unwrap() = Some(ext);
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn active_workers(&self) -> i64 {
        self.active_workers.get()
    }

    pub fn idle_workers(&self) -> i64 {
        self.idle_workers.get()
    }

    pub fn task_queue_is_empty(&self) -> bool {
        self.tasks.lock().unwrap().is_empty()
    }

    /// Default shutdown readiness: not running, no queued tasks, no
    /// worker mid-resume. IOManager's extension adds its own clauses.
    pub fn can_stop(&self) -> bool {
        !self.is_running()
            && self.task_queue_is_empty()
            && self.active_workers() == 0
            && self
                .extension
                .read()
                .unwrap()
                .as_ref()
                .map(|e| e.extra_can_stop(self))
                .unwrap_or(true)
    }

    pub fn tickle(&self) {
        if let Some(ext) = self.extension.read().unwrap().as_ref() {
            ext.tickle(self);
        }
    }

    /// Queue one task, optionally pinned to a worker's kernel tid.
    pub fn schedule(self: &Arc<Self>, task: Task, pin: Option<i32>) {
        let was_empty = {
            let mut tasks = self.tasks.lock().unwrap();
            let empty = tasks.is_empty();
            tasks.push_back(QueuedTask { task, pin });
            empty
        };
        if was_empty {
            self.tickle();
        }
    }

    /// Queue a batch of same-pin tasks atomically.
    pub fn schedule_range(self: &Arc<Self>, tasks: Vec<Task>, pin: Option<i32>) {
        if tasks.is_empty() {
            return;
        }
        let was_empty = {
            let mut q = self.tasks.lock().unwrap();
            let empty = q.is_empty();
            for t in tasks {
                q.push_back(QueuedTask { task: t, pin });
            }
            empty
        };
        if was_empty {
            self.tickle();
        }
    }

    /// Spawn worker threads and, if not already running, flip the
    /// running flag. No-op if already running.
    pub fn start(self: &Arc<Self>) {
        if self.running.swap(true, Ordering::SeqCst) {
            return;
        }
        let spawn_count = if self.use_caller {
            self.n_workers.saturating_sub(1)
        } else {
            self.n_workers
        };
        let mut workers = self.workers.lock().unwrap();
        for i in 0..spawn_count {
            let sched = self.clone();
            let thread_name = format!("{}-{}", self.name, i);
            workers.push(WorkerThread::spawn(thread_name, move |_tid| {
                set_current_scheduler(Some(sched.clone()));
                Scheduler::dispatch_loop(sched);
            }));
        }
    }

    /// Worker dispatch loop. Runs directly on the
    /// calling OS thread: promotes its root coroutine to the
    /// scheduler coroutine, builds the worker's one idle coroutine,
    /// then loops pulling tasks until told to stop.
    fn dispatch_loop(self: Arc<Self>) {
        let my_tid = kernel_tid();
        let sched_co = coroutine::current();
        coroutine::set_scheduler_coroutine(sched_co);
        crate::hook::set_hook_enabled(true);

        let idle_sched = self.clone();
        let idle_co = Coroutine::new(move || Scheduler::idle_entry(idle_sched), self.stack_size);

        loop {
            let next = self.pop_matching_task(my_tid);
            let task = match next {
                Some(t) => t,
                None => {
                    if idle_co.is_finished() {
                        break;
                    }
                    self.idle_workers.increment_and_fetch();
                    idle_co.sched_resume();
                    self.idle_workers.decrement_and_fetch();
                    if idle_co.is_finished() {
                        break;
                    }
                    continue;
                }
            };

            let co = match task {
                Task::Coroutine(co) => co,
                Task::Callable(cb) => Coroutine::new(cb, self.stack_size),
            };

            if !co.is_finished() {
                self.active_workers.increment_and_fetch();
                co.sched_resume();
                self.active_workers.decrement_and_fetch();
                match co.state() {
                    State::Ready => {
                        self.schedule(Task::Coroutine(co), None);
                    }
                    State::Hold | State::Exec | State::Init => {
                        // Holding on a waiter (channel/timer) that
                        // owns the next reference to this coroutine;
                        // nothing to requeue here.
                    }
                    State::Term | State::Except => {
                        // Last reference (besides whatever captured
                        // it) drops here.
                    }
                }
            }
        }
        coroutine::clear_scheduler_coroutine();
        set_current_scheduler(None);
    }

    /// Entry of the per-worker idle coroutine: delegate each tick to
    /// the installed extension (the reactor's `epoll_wait` pass) or a
    /// short sleep, yielding back to the dispatch loop every tick.
    fn idle_entry(self: Arc<Self>) {
        loop {
            if self.can_stop() {
                return;
            }
            let done = {
                let ext = self.extension.read().unwrap().clone();
                match ext {
                    Some(ext) => ext.idle_tick(&self),
                    None => {
                        std::thread::sleep(std::time::Duration::from_millis(5));
                        false
                    }
                }
            };
            if done {
                return;
            }
            // Hold (not a bare yield) so the worker can legally
            // `sched_resume()` this same coroutine again on its next
            // "no task" cycle instead of only ever using it once.
            Coroutine::yield_to_hold();
        }
    }

    fn pop_matching_task(&self, my_tid: i32) -> Option<Task> {
        let mut tasks = self.tasks.lock().unwrap();
        match tasks.front() {
            None => None,
            Some(q) => match q.pin {
                Some(pin) if pin != my_tid => {
                    drop(tasks);
                    self.tickle();
                    None
                }
                _ => tasks.pop_front().map(|q| q.task),
            },
        }
    }

    /// Stop accepting work: clears the running flag, wakes idle
    /// workers, drains the caller-scheduling coroutine if attached,
    /// then joins every worker thread.
    pub fn stop(self: &Arc<Self>) {
        self.running.store(false, Ordering::SeqCst);
        for _ in 0..self.n_workers {
            self.tickle();
        }
        if self.use_caller {
            self.tickle();
            if let Some(co) = self.caller_sched_coroutine.lock().unwrap().clone() {
                if !co.is_finished() {
                    coroutine::set_scheduler_coroutine(coroutine::current());
                    co.sched_resume();
                }
            }
        }
        let mut workers = self.workers.lock().unwrap();
        for w in workers.iter_mut() {
            w.join();
        }
        debug!("scheduler '{}' stopped", self.name);
    }

    pub fn caller_tid(&self) -> Option<i32> {
        self.caller_tid
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        if self.is_running() {
            warn!("scheduler '{}' dropped while still running", self.name);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn self_rescheduling_stays_on_one_worker() {
        let sched = Scheduler::new(6, false, "corio-test-sched");
        sched.start();
        let counter = Arc::new(AtomicUsize::new(5));
        let tids = Arc::new(Mutex::new(Vec::new()));

        fn step(sched: Arc<Scheduler>, counter: Arc<AtomicUsize>, tids: Arc<Mutex<Vec<i32>>>) {
            let my_tid = kernel_tid();
            tids.lock().unwrap().push(my_tid);
            if counter.fetch_sub(1, Ordering::SeqCst) > 1 {
                let sched2 = sched.clone();
                let counter2 = counter.clone();
                let tids2 = tids.clone();
                sched.schedule(
                    Task::Callable(Box::new(move || step(sched2, counter2, tids2))),
                    Some(my_tid),
                );
            }
        }

        let sched2 = sched.clone();
        let counter2 = counter.clone();
        let tids2 = tids.clone();
        sched.schedule(
            Task::Callable(Box::new(move || step(sched2, counter2, tids2))),
            None,
        );

        std::thread::sleep(std::time::Duration::from_millis(200));
        sched.stop();

        let tids = tids.lock().unwrap();
        assert_eq!(tids.len(), 5);
        assert!(tids.iter().all(|t| *t == tids[0]));
    }
}
