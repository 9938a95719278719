//! Stackful cooperative coroutines.
//!
//! Grounded on `original_source/easy/base/Fiber.{h,cc}` for the state
//! machine and on `mioco`'s and `cheme-coroutine-rs`'s use of the
//! `context` crate for machine-context save/restore. A
//! coroutine is a fixed-size guarded stack plus a saved
//! `context::Context`; resuming it swaps the running thread's stack
//! pointer onto the coroutine's, yielding swaps back.
//!
//! Handoff model: every time a coroutine is entered — either at its
//! very first resume (landing in [`trampoline`]) or at any later
//! resume (landing wherever its last `yield` suspended) — the
//! low-level `context::Transfer` we receive carries the *caller's*
//! saved context. We stash that as `return_ctx` so the next `yield`
//! knows exactly where to transfer back to, without needing to know
//! whether the caller was the root coroutine or a scheduler
//! coroutine.

use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;

use context::stack::ProtectedFixedSizeStack;
use context::{Context, Transfer};
use log::error;

use crate::atomic::AtomicCounter;
use crate::config::DEFAULT_STACK_SIZE;

/// Lifecycle state of a [`Coroutine`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    Init,
    Ready,
    Hold,
    Exec,
    Term,
    Except,
}

impl State {
    pub fn is_finished(self) -> bool {
        matches!(self, State::Term | State::Except)
    }
}

static NEXT_ID: AtomicCounter = AtomicCounter::new(1);

type Entry = Box<dyn FnOnce() + Send>;

struct CoroutineInner {
    id: u64,
    state: Cell<State>,
    /// `None` exactly when the coroutine is currently running (taken
    /// out for the duration of a resume/yield swap) or is the root.
    ctx: Cell<Option<Context>>,
    /// The context to transfer to on this coroutine's next yield.
    return_ctx: Cell<Option<Context>>,
    _stack: Option<ProtectedFixedSizeStack>,
    entry: RefCell<Option<Entry>>,
}

/// A stackful coroutine. Shared via `Arc`, since at any moment it may
/// be referenced by the stack currently running it, an enqueued task,
/// and a captured callback, so that an unpinned task can be handed
/// from one worker's queue to another's.
pub struct Coroutine(CoroutineInner);

// Only one OS thread ever touches a given coroutine's internals at a
// time: either the worker currently resuming it, or nobody while it
// sits suspended in a scheduler's task queue. The queue's own mutex
// establishes the happens-before edge across that hand-off, so the
// non-atomic `Cell`/`RefCell` fields never see concurrent access even
// though `Coroutine` itself crosses threads.
unsafe impl Send for Coroutine {}
unsafe impl Sync for Coroutine {}

impl fmt::Debug for Coroutine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Coroutine")
            .field("id", &self.0.id)
            .field("state", &self.0.state.get())
            .finish()
    }
}

thread_local! {
    static CURRENT: RefCell<Option<Arc<Coroutine>>> = RefCell::new(None);
    static ROOT: RefCell<Option<Arc<Coroutine>>> = RefCell::new(None);
    static SCHED_COROUTINE: RefCell<Option<Arc<Coroutine>>> = RefCell::new(None);
    // Keyed storage so a raw Transfer can be matched back to the Rc
    // that owns it during the handoff; entries are dropped once a
    // coroutine reaches Term/Except and its queue entry is released.
    static REGISTRY: RefCell<HashMap<u64, Arc<Coroutine>>> = RefCell::new(HashMap::new());
}

impl Coroutine {
    /// Allocate a new coroutine in `Init` state with a guarded stack.
    pub fn new(cb: impl FnOnce() + Send + 'static, stack_size: usize) -> Arc<Coroutine> {
        let size = if stack_size == 0 { DEFAULT_STACK_SIZE } else { stack_size };
        // Stack allocation failure is fatal: a coroutine runtime
        // cannot degrade gracefully without a stack.
        let stack = ProtectedFixedSizeStack::new(size)
            .unwrap_or_else(|e| panic!("failed to allocate {size}-byte coroutine stack: {e}"));
        let ctx = unsafe { Context::new(&stack, trampoline) };
        let id = NEXT_ID.fetch_add_one();
        let co = Arc::new(Coroutine(CoroutineInner {
            id,
            state: Cell::new(State::Init),
            ctx: Cell::new(Some(ctx)),
            return_ctx: Cell::new(None),
            _stack: Some(stack),
            entry: RefCell::new(Some(Box::new(cb))),
        }));
        REGISTRY.with(|r| r.borrow_mut().insert(id, co.clone()));
        co
    }

    fn new_root() -> Arc<Coroutine> {
        let id = NEXT_ID.fetch_add_one();
        Arc::new(Coroutine(CoroutineInner {
            id,
            state: Cell::new(State::Exec),
            ctx: Cell::new(None),
            return_ctx: Cell::new(None),
            _stack: None,
            entry: RefCell::new(None),
        }))
    }

    pub fn id(&self) -> u64 {
        self.0.id
    }

    pub fn state(&self) -> State {
        self.0.state.get()
    }

    pub fn is_finished(&self) -> bool {
        self.0.state.get().is_finished()
    }

    /// Re-initialize a finished (or never-run) coroutine with a new
    /// entry callable, reusing its stack.
    pub fn reset(&self, cb: impl FnOnce() + Send + 'static) {
        assert!(
            matches!(self.0.state.get(), State::Init | State::Term | State::Except),
            "reset() requires a finished or unstarted coroutine, found {:?}",
            self.0.state.get()
        );
        let stack = self.0._stack.as_ref().expect("sub-coroutine must have a stack");
        let ctx = unsafe { Context::new(stack, trampoline) };
        self.0.ctx.set(Some(ctx));
        self.0.return_ctx.set(None);
        *self.0.entry.borrow_mut() = Some(Box::new(cb));
        self.0.state.set(State::Init);
    }

    /// Resume this coroutine. Caller must currently be the root
    /// coroutine; callee must be `Init`, `Ready` or `Hold`.
    pub fn resume(self: &Arc<Self>) {
        let root = root_coroutine();
        assert!(
            Arc::ptr_eq(&current(), &root),
            "resume() called from a non-root coroutine; use sched_resume()"
        );
        self.enter()
    }

    /// Resume this coroutine, recorded as entered by the per-thread
    /// scheduler coroutine. Used by the dispatcher loop.
    pub fn sched_resume(self: &Arc<Self>) {
        let sched = SCHED_COROUTINE.with(|s| s.borrow().clone())
            .expect("sched_resume() requires a scheduler coroutine on this thread");
        assert!(
            Arc::ptr_eq(&current(), &sched),
            "sched_resume() called from outside the scheduler coroutine"
        );
        self.enter()
    }

    fn enter(self: &Arc<Self>) {
        assert!(
            matches!(self.0.state.get(), State::Init | State::Ready | State::Hold),
            "illegal resume of coroutine {} in state {:?}",
            self.0.id,
            self.0.state.get()
        );
        let caller = current();
        self.0.state.set(State::Exec);
        set_current(self.clone());
        let ctx = self.0.ctx.take().expect("coroutine has no saved context to resume");
        let transfer = unsafe { ctx.resume(0) };
        // We're back on the caller's stack: the coroutine yielded or
        // terminated and handed us its freshly suspended context.
        self.0.ctx.set(Some(transfer.context));
        set_current(caller);
    }

    /// Yield back to whoever last resumed this coroutine.
    pub fn r#yield(&self) {
        self.yield_now()
    }

    /// Same transfer as `yield`; kept as a distinct name for the
    /// call site that yields specifically to let a scheduler pick up
    /// other work, rather than a plain cooperative handoff.
    pub fn sched_yield(&self) {
        self.yield_now()
    }

    fn yield_now(&self) {
        assert!(
            matches!(self.0.state.get(), State::Exec | State::Hold),
            "yield() from coroutine {} in unexpected state {:?}",
            self.0.id,
            self.0.state.get()
        );
        let ctx = self.0.return_ctx.take().expect("no caller context recorded for yield");
        let transfer = unsafe { ctx.resume(0) };
        // Resumed again later; remember whoever resumed us this time
        // for the *next* yield.
        self.0.return_ctx.set(Some(transfer.context));
    }

    /// Mark `Hold`, then yield. Whether the caller conceptually wants
    /// sched-yield (a scheduler coroutine is attached and we are not
    /// it) or plain-yield, both reduce to the same transfer here (see
    /// module docs), so we simply yield.
    pub fn yield_to_hold() {
        let cur = current();
        cur.0.state.set(State::Hold);
        cur.yield_now();
    }

    /// Mark `Ready` so the scheduler re-enqueues it, without
    /// transferring control. Used by IOManager/Timer dispatch from a
    /// different stack than the coroutine's own.
    pub fn mark_ready(&self) {
        self.0.state.set(State::Ready);
    }
}

fn set_current(co: Arc<Coroutine>) {
    CURRENT.with(|c| *c.borrow_mut() = Some(co));
}

/// Returns the currently executing coroutine on this thread, lazily
/// creating the root coroutine if none has run yet.
pub fn current() -> Arc<Coroutine> {
    let existing = CURRENT.with(|c| c.borrow().clone());
    match existing {
        Some(co) => co,
        None => {
            let root = root_coroutine();
            set_current(root.clone());
            root
        }
    }
}

pub fn current_id() -> u64 {
    current().0.id
}

fn root_coroutine() -> Arc<Coroutine> {
    ROOT.with(|r| {
        let mut r = r.borrow_mut();
        if r.is_none() {
            *r = Some(Coroutine::new_root());
        }
        r.clone().unwrap()
    })
}

/// Install `co` as the per-thread scheduler coroutine (the coroutine
/// on whose stack the dispatcher loop runs). Called once per worker.
pub fn set_scheduler_coroutine(co: Arc<Coroutine>) {
    SCHED_COROUTINE.with(|s| *s.borrow_mut() = Some(co));
}

pub fn clear_scheduler_coroutine() {
    SCHED_COROUTINE.with(|s| *s.borrow_mut() = None);
}

pub fn forget(id: u64) {
    REGISTRY.with(|r| {
        r.borrow_mut().remove(&id);
    });
}

extern "C" fn trampoline(t: Transfer) -> ! {
    let co = current();
    co.0.return_ctx.set(Some(t.context));
    let cb = co
        .0
        .entry
        .borrow_mut()
        .take()
        .expect("trampoline entered without an entry callable");

    let result = panic::catch_unwind(AssertUnwindSafe(cb));
    match result {
        Ok(()) => co.0.state.set(State::Term),
        Err(payload) => {
            let msg = panic_message(&payload);
            error!(
                "coroutine {} terminated via panic: {msg}\n{:?}",
                co.0.id,
                std::backtrace::Backtrace::capture()
            );
            co.0.state.set(State::Except);
        }
    }

    let id = co.0.id;
    let return_ctx = co
        .0
        .return_ctx
        .take()
        .expect("no caller context recorded for final yield");
    // Release our strong reference before the final transfer: the
    // scheduler's task-queue entry (if any) is the only thing that
    // may still be keeping this coroutine alive.
    drop(co);
    forget(id);
    let _never: Transfer = unsafe { return_ctx.resume(0) };
    unreachable!("trampoline must never be resumed after its coroutine terminated");
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[test]
    fn resume_and_yield_roundtrip() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let log2 = log.clone();
        let co = Coroutine::new(
            move || {
                log2.lock().unwrap().push("before");
                Coroutine::yield_to_hold();
                log2.lock().unwrap().push("after");
            },
            0,
        );
        assert_eq!(co.state(), State::Init);
        co.resume();
        assert_eq!(co.state(), State::Hold);
        assert_eq!(*log.lock().unwrap(), vec!["before"]);
        co.resume();
        assert_eq!(co.state(), State::Term);
        assert_eq!(*log.lock().unwrap(), vec!["before", "after"]);
    }

    #[test]
    fn panic_in_entry_sets_except() {
        let co = Coroutine::new(
            || {
                panic!("boom");
            },
            0,
        );
        co.resume();
        assert_eq!(co.state(), State::Except);
    }

    #[test]
    fn reset_allows_reuse_of_a_finished_coroutine() {
        let co = Coroutine::new(|| {}, 0);
        co.resume();
        assert!(co.is_finished());
        let log = Arc::new(Mutex::new(false));
        let log2 = log.clone();
        co.reset(move || {
            *log2.lock().unwrap() = true;
        });
        assert_eq!(co.state(), State::Init);
        co.resume();
        assert!(*log.lock().unwrap());
    }
}
