//! Edge-triggered epoll reactor. Implements [`SchedulerExtension`] so a
//! [`Scheduler`] that installs an [`IOManager`] gets `idle_tick`,
//! `tickle`, and `extra_can_stop` wired to `epoll_wait`, a self-pipe
//! wakeup, and the pending-events/timer counts respectively.
//!
//! Grounded on `original_source/easy/base/IOManager.{h,cc}`: one
//! epoll instance per manager, a non-blocking self-pipe registered
//! edge-triggered for the tickle wakeup, a growable `FdContext`
//! (here: [`Channel`]) table indexed by fd, and `onTimerInsertedAtFront`
//! reusing the same tickle path rather than a second special fd.

use std::os::unix::io::RawFd;
use std::sync::Arc;

use log::{debug, warn};
use nix::fcntl::{fcntl, FcntlArg, OFlag};
use nix::sys::epoll::{epoll_create1, epoll_ctl, epoll_wait, EpollCreateFlags, EpollEvent, EpollFlags, EpollOp};
use nix::unistd::{close, pipe, read, write};

use crate::atomic::AtomicSize;
use crate::channel::{Channel, Event, Waiter};
use crate::config::MAX_EPOLL_TIMEOUT_MS;
use crate::error::{CoreError, CoreResult};
use crate::fd::FdManager;
use crate::scheduler::{Scheduler, SchedulerExtension, Task};
use crate::sync::RwLock;
use crate::timer::TimerManager;

fn set_nonblocking(fd: RawFd) {
    if let Ok(flags) = fcntl(fd, FcntlArg::F_GETFL) {
        let flags = OFlag::from_bits_truncate(flags);
        let _ = fcntl(fd, FcntlArg::F_SETFL(flags | OFlag::O_NONBLOCK));
    }
}

fn flags_for_mask(mask: u8) -> EpollFlags {
    let mut flags = EpollFlags::EPOLLET;
    if mask & Event::Read.bit() != 0 {
        flags |= EpollFlags::EPOLLIN;
    }
    if mask & Event::Write.bit() != 0 {
        flags |= EpollFlags::EPOLLOUT;
    }
    flags
}

struct IOManagerCore {
    scheduler: Arc<Scheduler>,
    epoll_fd: RawFd,
    wake_r: RawFd,
    wake_w: RawFd,
    channels: RwLock<Vec<Option<Arc<Channel>>>>,
    pending_events: AtomicSize,
    timers: TimerManager,
    fds: FdManager,
}

impl IOManagerCore {
    fn wake(&self) {
        let _ = write(self.wake_w, &[1u8]);
    }

    fn drain_wake_pipe(&self) {
        let mut buf = [0u8; 64];
        loop {
            match read(self.wake_r, &mut buf) {
                Ok(n) if n > 0 => continue,
                _ => break,
            }
        }
    }

    fn lookup_channel(&self, fd: i32) -> Option<Arc<Channel>> {
        if fd < 0 {
            return None;
        }
        self.channels.read().unwrap().get(fd as usize).cloned().flatten()
    }

    fn get_or_create_channel(&self, fd: i32) -> Arc<Channel> {
        let idx = fd as usize;
        {
            let table = self.channels.read().unwrap();
            if let Some(Some(chan)) = table.get(idx) {
                return chan.clone();
            }
        }
        let mut table = self.channels.write().unwrap();
        if idx >= table.len() {
            table.resize(idx + 1, None);
        }
        table[idx].get_or_insert_with(|| Arc::new(Channel::new(fd))).clone()
    }

    fn sync_epoll(&self, fd: i32, mask: u8) {
        if mask == 0 {
            let _ = epoll_ctl(self.epoll_fd, EpollOp::EpollCtlDel, fd, &mut EpollEvent::empty());
        } else {
            let mut ev = EpollEvent::new(flags_for_mask(mask), fd as u64);
            if epoll_ctl(self.epoll_fd, EpollOp::EpollCtlMod, fd, &mut ev).is_err() {
                warn!("epoll_ctl(MOD) failed for fd {fd}");
            }
        }
    }

    fn handle_ready(&self, fd: i32, flags: EpollFlags) {
        let Some(channel) = self.lookup_channel(fd) else {
            return;
        };
        let mut fired = 0usize;
        if flags.intersects(EpollFlags::EPOLLIN | EpollFlags::EPOLLERR | EpollFlags::EPOLLHUP) {
            let (_, did_fire) = channel.fire_event(Event::Read);
            if did_fire {
                fired += 1;
            }
        }
        if flags.intersects(EpollFlags::EPOLLOUT | EpollFlags::EPOLLERR | EpollFlags::EPOLLHUP) {
            let (_, did_fire) = channel.fire_event(Event::Write);
            if did_fire {
                fired += 1;
            }
        }
        for _ in 0..fired {
            self.pending_events.decrement();
        }
        self.sync_epoll(fd, channel.armed_mask());
    }

    fn idle_tick(&self, scheduler: &Scheduler) -> bool {
        if scheduler.can_stop() {
            debug!("io_manager idle_tick: scheduler can stop, exiting idle coroutine");
            return true;
        }

        let timeout_ms = self
            .timers
            .next_timer_ms()
            .map(|ms| ms.clamp(0, MAX_EPOLL_TIMEOUT_MS as i64))
            .unwrap_or(MAX_EPOLL_TIMEOUT_MS as i64);

        let mut events = [EpollEvent::empty(); 64];
        let n = match epoll_wait(self.epoll_fd, &mut events, timeout_ms as isize) {
            Ok(n) => n,
            Err(nix::errno::Errno::EINTR) => 0,
            Err(e) => {
                warn!("epoll_wait failed: {e}");
                0
            }
        };

        for ev in &events[..n] {
            let fd = ev.data() as i32;
            if fd == self.wake_r {
                self.drain_wake_pipe();
                continue;
            }
            self.handle_ready(fd, ev.events());
        }

        for cb in self.timers.list_expired() {
            self.scheduler.schedule(Task::Callable(Box::new(move || cb())), None);
        }

        false
    }
}

impl Drop for IOManagerCore {
    fn drop(&mut self) {
        let _ = close(self.wake_r);
        let _ = close(self.wake_w);
        let _ = close(self.epoll_fd);
    }
}

/// Handle to the reactor. Cheaply `Clone`-able (wraps an `Arc`); the
/// clone installed as a [`SchedulerExtension`] shares the same epoll
/// instance, channel table, and timer set as the handle returned to
/// callers.
#[derive(Clone)]
pub struct IOManager {
    core: Arc<IOManagerCore>,
}

impl IOManager {
    /// Create a reactor and install it as `scheduler`'s extension.
    pub fn new(scheduler: Arc<Scheduler>) -> IOManager {
        let epoll_fd = epoll_create1(EpollCreateFlags::EPOLL_CLOEXEC).expect("epoll_create1 failed");
        let (wake_r, wake_w) = pipe().expect("pipe failed");
        set_nonblocking(wake_r);
        let mut wake_ev = EpollEvent::new(EpollFlags::EPOLLIN | EpollFlags::EPOLLET, wake_r as u64);
        epoll_ctl(epoll_fd, EpollOp::EpollCtlAdd, wake_r, &mut wake_ev).expect("epoll_ctl(wake) failed");

        let core = Arc::new(IOManagerCore {
            scheduler,
            epoll_fd,
            wake_r,
            wake_w,
            channels: RwLock::new(Vec::with_capacity(32)),
            pending_events: AtomicSize::new(0),
            timers: TimerManager::new(),
            fds: FdManager::new(),
        });

        let weak = Arc::downgrade(&core);
        core.timers.set_front_notifier(move || {
            if let Some(core) = weak.upgrade() {
                core.wake();
            }
        });

        let manager = IOManager { core };
        manager
            .core
            .scheduler
            .clone()
            .set_extension(Arc::new(manager.clone()) as Arc<dyn SchedulerExtension>);
        manager
    }

    pub fn scheduler(&self) -> &Arc<Scheduler> {
        &self.core.scheduler
    }

    pub fn fd_manager(&self) -> &FdManager {
        &self.core.fds
    }

    pub fn timers(&self) -> &TimerManager {
        &self.core.timers
    }

    /// Arm `event` on `fd` with `waiter`. Errs with
    /// [`CoreError::EventAlreadyArmed`] if `event` is already armed on
    /// this fd, or [`CoreError::EpollRegistration`] if the kernel call
    /// fails (the channel's arm is rolled back in that case).
    pub fn add_event(&self, fd: i32, event: Event, waiter: Waiter) -> CoreResult<()> {
        let channel = self.core.get_or_create_channel(fd);
        let prev_mask = channel.armed_mask();
        let new_mask = channel
            .try_arm(event, self.core.scheduler.clone(), waiter)
            .map_err(|_| CoreError::EventAlreadyArmed { fd, event })?;

        let op = if prev_mask == 0 {
            EpollOp::EpollCtlAdd
        } else {
            EpollOp::EpollCtlMod
        };
        let mut ev = EpollEvent::new(flags_for_mask(new_mask), fd as u64);
        if let Err(e) = epoll_ctl(self.core.epoll_fd, op, fd, &mut ev) {
            channel.disarm(event);
            return Err(CoreError::EpollRegistration {
                fd,
                source: std::io::Error::from_raw_os_error(e as i32),
            });
        }
        self.core.pending_events.increment();
        Ok(())
    }

    /// Fire `event`'s waiter immediately and unregister it (used by
    /// the hook layer's timeout path: a pending read/write is
    /// force-woken so the caller can report `ETIMEDOUT`).
    pub fn cancel_event(&self, fd: i32, event: Event) -> CoreResult<()> {
        let channel = self.core.lookup_channel(fd).ok_or(CoreError::NoDescriptorContext(fd))?;
        let (mask, fired) = channel.fire_event(event);
        if fired {
            self.core.pending_events.decrement();
        }
        self.core.sync_epoll(fd, mask);
        Ok(())
    }

    /// Unregister `event` without firing its waiter (plain
    /// unsubscribe, e.g. after the coroutine resumed through a
    /// different path).
    pub fn remove_event(&self, fd: i32, event: Event) -> CoreResult<()> {
        let channel = self.core.lookup_channel(fd).ok_or(CoreError::NoDescriptorContext(fd))?;
        let (mask, was_armed) = channel.disarm(event);
        if was_armed {
            self.core.pending_events.decrement();
        }
        self.core.sync_epoll(fd, mask);
        Ok(())
    }

    /// Fire every armed event on `fd`, drop it from epoll and the
    /// channel table, and forget its [`FdCtx`](crate::fd::FdCtx).
    /// Called on `close(2)`.
    pub fn cancel_all(&self, fd: i32) {
        if let Some(channel) = self.core.lookup_channel(fd) {
            let fired = channel.fire_all();
            for _ in 0..fired {
                self.core.pending_events.decrement();
            }
            let _ = epoll_ctl(self.core.epoll_fd, EpollOp::EpollCtlDel, fd, &mut EpollEvent::empty());
            let mut table = self.core.channels.write().unwrap();
            if (fd as usize) < table.len() {
                table[fd as usize] = None;
            }
        }
        self.core.fds.remove(fd);
    }
}

impl SchedulerExtension for IOManager {
    fn idle_tick(&self, scheduler: &Scheduler) -> bool {
        self.core.idle_tick(scheduler)
    }

    fn tickle(&self, scheduler: &Scheduler) {
        if scheduler.idle_workers() > 0 {
            self.core.wake();
        }
    }

    fn extra_can_stop(&self, _scheduler: &Scheduler) -> bool {
        self.core.pending_events.get() == 0 && !self.core.timers.has_timer()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::Waiter;
    use std::os::unix::io::AsRawFd;
    use std::os::unix::net::UnixStream;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[test]
    fn read_event_fires_when_peer_writes() {
        let sched = Scheduler::new(2, false, "io-test-read");
        let io = IOManager::new(sched.clone());
        sched.start();

        let (a, mut b) = UnixStream::pair().unwrap();
        a.set_nonblocking(true).unwrap();
        let fired = Arc::new(AtomicUsize::new(0));
        let fired2 = fired.clone();
        io.add_event(
            a.as_raw_fd(),
            Event::Read,
            Waiter::Callback(Box::new(move || {
                fired2.fetch_add(1, Ordering::SeqCst);
            })),
        )
        .unwrap();

        std::io::Write::write_all(&mut b, b"x").unwrap();
        std::thread::sleep(Duration::from_millis(100));
        sched.stop();

        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn double_add_event_is_rejected() {
        let sched = Scheduler::new(1, false, "io-test-dup");
        let io = IOManager::new(sched.clone());
        let (a, _b) = UnixStream::pair().unwrap();
        a.set_nonblocking(true).unwrap();
        io.add_event(a.as_raw_fd(), Event::Read, Waiter::Callback(Box::new(|| {})))
            .unwrap();
        let err = io
            .add_event(a.as_raw_fd(), Event::Read, Waiter::Callback(Box::new(|| {})))
            .unwrap_err();
        assert!(matches!(err, CoreError::EventAlreadyArmed { .. }));
    }

    #[test]
    fn cancel_all_clears_pending_events_for_can_stop() {
        let sched = Scheduler::new(1, false, "io-test-cancel");
        let io = IOManager::new(sched.clone());
        let (a, _b) = UnixStream::pair().unwrap();
        a.set_nonblocking(true).unwrap();
        io.add_event(a.as_raw_fd(), Event::Read, Waiter::Callback(Box::new(|| {})))
            .unwrap();
        assert!(!io.extra_can_stop(&sched));
        io.cancel_all(a.as_raw_fd());
        assert!(io.extra_can_stop(&sched));
    }
}
