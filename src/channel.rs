//! Per-descriptor readiness bookkeeping: `Channel` and the growable
//! table the IOManager indexes by fd.
//!
//! Grounded on `original_source/easy/base/IOManager.h`'s private
//! `FdContext` (per-event `EventContext` holding a scheduler pointer
//! plus either a coroutine or a callback). A fd never has more than
//! one waiter per event kind, and the read/write masks always track
//! what is actually registered with epoll.

use std::sync::Arc;

use crate::coroutine::Coroutine;
use crate::scheduler::{Scheduler, Task};
use crate::sync::SpinLock;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Event {
    Read,
    Write,
}

impl Event {
    pub fn bit(self) -> u8 {
        match self {
            Event::Read => 0b01,
            Event::Write => 0b10,
        }
    }
}

/// What to do when an event fires: resume a parked coroutine, or run
/// an arbitrary callback (e.g. a timer-driven retry).
pub enum Waiter {
    Coroutine(Arc<Coroutine>),
    Callback(Box<dyn FnOnce() + Send>),
}

struct EventCtx {
    scheduler: Option<Arc<Scheduler>>,
    waiter: Option<Waiter>,
}

impl EventCtx {
    fn empty() -> Self {
        EventCtx {
            scheduler: None,
            waiter: None,
        }
    }

    fn is_armed(&self) -> bool {
        self.waiter.is_some()
    }

    fn fire(&mut self) {
        if let (Some(sched), Some(waiter)) = (self.scheduler.take(), self.waiter.take()) {
            let task = match waiter {
                Waiter::Coroutine(co) => {
                    co.mark_ready();
                    Task::Coroutine(co)
                }
                Waiter::Callback(cb) => Task::Callable(cb),
            };
            sched.schedule(task, None);
        }
    }
}

/// Per-fd readiness record, guarded by a single spinlock.
pub struct Channel {
    fd: i32,
    inner: SpinLock<ChannelInner>,
}

struct ChannelInner {
    mask: u8,
    read: EventCtx,
    write: EventCtx,
}

impl Channel {
    pub fn new(fd: i32) -> Self {
        Channel {
            fd,
            inner: SpinLock::new(ChannelInner {
                mask: 0,
                read: EventCtx::empty(),
                write: EventCtx::empty(),
            }),
        }
    }

    pub fn fd(&self) -> i32 {
        self.fd
    }

    pub fn armed_mask(&self) -> u8 {
        self.inner.lock().mask
    }

    pub fn is_event_armed(&self, event: Event) -> bool {
        self.inner.lock().mask & event.bit() != 0
    }

    /// Arm `event` with `waiter` on `scheduler`. Returns `false` if
    /// already armed for this fd; caller is responsible for the
    /// kernel-level `epoll_ctl` call using the mask returned
    /// alongside.
    pub fn try_arm(&self, event: Event, scheduler: Arc<Scheduler>, waiter: Waiter) -> Result<u8, ()> {
        let mut inner = self.inner.lock();
        if inner.mask & event.bit() != 0 {
            return Err(());
        }
        inner.mask |= event.bit();
        let ctx = match event {
            Event::Read => &mut inner.read,
            Event::Write => &mut inner.write,
        };
        ctx.scheduler = Some(scheduler);
        ctx.waiter = Some(waiter);
        Ok(inner.mask)
    }

    /// Clear `event`'s waiter without firing it. Returns the new mask
    /// and whether anything was actually armed.
    pub fn disarm(&self, event: Event) -> (u8, bool) {
        let mut inner = self.inner.lock();
        let was_armed = inner.mask & event.bit() != 0;
        if was_armed {
            inner.mask &= !event.bit();
            let ctx = match event {
                Event::Read => &mut inner.read,
                Event::Write => &mut inner.write,
            };
            ctx.scheduler = None;
            ctx.waiter = None;
        }
        (inner.mask, was_armed)
    }

    /// Clear `event`'s bit and fire its waiter if any. Returns
    /// `(new_mask, fired)`.
    pub fn fire_event(&self, event: Event) -> (u8, bool) {
        let mut inner = self.inner.lock();
        let was_armed = inner.mask & event.bit() != 0;
        if was_armed {
            inner.mask &= !event.bit();
            let ctx = match event {
                Event::Read => &mut inner.read,
                Event::Write => &mut inner.write,
            };
            let fired = ctx.is_armed();
            ctx.fire();
            (inner.mask, fired)
        } else {
            (inner.mask, false)
        }
    }

    /// Fire every currently armed event, returning how many fired.
    pub fn fire_all(&self) -> usize {
        let mut inner = self.inner.lock();
        let mut fired = 0;
        if inner.mask & Event::Read.bit() != 0 {
            inner.mask &= !Event::Read.bit();
            inner.read.fire();
            fired += 1;
        }
        if inner.mask & Event::Write.bit() != 0 {
            inner.mask &= !Event::Write.bit();
            inner.write.fire();
            fired += 1;
        }
        fired
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheduler::Scheduler;

    #[test]
    fn double_arm_is_rejected() {
        let sched = Scheduler::new(1, false, "chan-test");
        let chan = Channel::new(5);
        assert!(chan
            .try_arm(Event::Read, sched.clone(), Waiter::Callback(Box::new(|| {})))
            .is_ok());
        assert!(chan
            .try_arm(Event::Read, sched.clone(), Waiter::Callback(Box::new(|| {})))
            .is_err());
        assert_eq!(chan.armed_mask(), Event::Read.bit());
    }

    #[test]
    fn cancel_clears_mask_and_fires_once() {
        let sched = Scheduler::new(1, false, "chan-test2");
        let chan = Channel::new(5);
        let fired = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let fired2 = fired.clone();
        chan.try_arm(
            Event::Write,
            sched,
            Waiter::Callback(Box::new(move || {
                fired2.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            })),
        )
        .unwrap();
        let (mask, did_fire) = chan.fire_event(Event::Write);
        assert!(did_fire);
        assert_eq!(mask, 0);
        let (_, did_fire_again) = chan.fire_event(Event::Write);
        assert!(!did_fire_again);
    }
}
