//! Syscall hooks: drop-in `read`/`write`/`recvmsg`/`sendmsg`/`readv`/
//! `writev`/`accept`/`connect`/`close`/`sleep` (and friends) replacements
//! that convert a blocking call on a non-blocking socket into "attempt,
//! arm readiness, yield, retry", plus `fcntl`/`ioctl`/`setsockopt` hooks
//! that let calling code toggle the per-fd nonblocking/timeout state
//! the rest of this module reads.
//!
//! Grounded on `original_source/easy/base/hook.{h,cc}`'s `do_io`
//! template: hooking is per-thread (so library-internal, sync code
//! stays blocking), the runtime forces every socket fd into
//! `O_NONBLOCK` at the kernel level the moment [`FdCtx`] is created
//! (see `fd.rs`) while tracking the *user's* requested blocking mode
//! separately, and a conditional timer keyed off the coroutine's
//! handle cancels the wait once the per-fd timeout elapses.

use std::ffi::c_void;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::channel::{Event, Waiter};
use crate::coroutine::{self, Coroutine};
use crate::fd::{FdCtx, TimeoutKind};
use crate::io_manager::IOManager;

thread_local! {
    static HOOK_ENABLED: std::cell::Cell<bool> = const { std::cell::Cell::new(false) };
}

/// Enable or disable hooking on the calling OS thread. The dispatch
/// loop enables this for every worker before running coroutines;
/// threads outside the runtime (including the test harness) leave it
/// off and get plain pass-through libc semantics.
pub fn set_hook_enabled(enabled: bool) {
    HOOK_ENABLED.with(|c| c.set(enabled));
}

pub fn is_hook_enabled() -> bool {
    HOOK_ENABLED.with(|c| c.get())
}

static CURRENT_IO_MANAGER: std::sync::OnceLock<IOManager> = std::sync::OnceLock::new();

/// Bind the process-wide reactor the hooks arm events against. Called
/// once by the runtime bootstrap; a second call is a no-op.
pub fn install(io: IOManager) {
    let _ = CURRENT_IO_MANAGER.set(io);
}

fn current_io_manager() -> Option<IOManager> {
    CURRENT_IO_MANAGER.get().cloned()
}

fn last_errno() -> i32 {
    std::io::Error::last_os_error().raw_os_error().unwrap_or(0)
}

fn set_errno(code: i32) {
    unsafe {
        *libc::__errno_location() = code;
    }
}

fn would_block(err: i32) -> bool {
    err == libc::EAGAIN || err == libc::EWOULDBLOCK
}

/// Core retry loop shared by every blocking-IO hook. `attempt` should
/// perform exactly one raw syscall and return its libc-style result
/// (`-1` + errno on failure).
fn do_io(fd: i32, kind: TimeoutKind, mut attempt: impl FnMut() -> isize) -> isize {
    if !is_hook_enabled() {
        return attempt();
    }
    let Some(io) = current_io_manager() else {
        return attempt();
    };
    let Some(ctx) = io.fd_manager().get(fd, true) else {
        return attempt();
    };
    if ctx.is_closed() {
        set_errno(libc::EBADF);
        return -1;
    }
    if !ctx.is_socket() || ctx.is_user_nonblock() {
        return attempt();
    }

    let event = match kind {
        TimeoutKind::Recv => Event::Read,
        TimeoutKind::Send => Event::Write,
    };

    loop {
        let rc = attempt();
        if rc != -1 {
            return rc;
        }
        let err = last_errno();
        if err == libc::EINTR {
            continue;
        }
        if !would_block(err) {
            return -1;
        }

        let co = coroutine::current();
        let timed_out = Arc::new(AtomicBool::new(false));
        if io.add_event(fd, event, Waiter::Coroutine(co.clone())).is_err() {
            // Someone else is already waiting on this direction;
            // park without a fresh registration and let their wakeup
            // requeue us too.
            Coroutine::yield_to_hold();
            continue;
        }

        let timer = ctx.timeout(kind).map(|timeout_ms| {
            let timed_out2 = timed_out.clone();
            let io2 = io.clone();
            io.timers().add_conditional_timer(
                timeout_ms,
                move || {
                    timed_out2.store(true, Ordering::SeqCst);
                    let _ = io2.cancel_event(fd, event);
                },
                Arc::downgrade(&co),
                false,
            )
        });

        Coroutine::yield_to_hold();

        if let Some(t) = &timer {
            t.cancel();
        }
        if timed_out.load(Ordering::SeqCst) {
            set_errno(libc::ETIMEDOUT);
            return -1;
        }
    }
}

fn ensure_ctx(fd: i32) -> Option<Arc<FdCtx>> {
    current_io_manager().and_then(|io| io.fd_manager().get(fd, true))
}

/// # Safety
/// `buf` must be valid for `count` bytes as required by `read(2)`.
pub unsafe fn read(fd: i32, buf: *mut c_void, count: usize) -> isize {
    do_io(fd, TimeoutKind::Recv, || libc::read(fd, buf, count))
}

/// # Safety
/// `buf` must be valid for `count` bytes as required by `write(2)`.
pub unsafe fn write(fd: i32, buf: *const c_void, count: usize) -> isize {
    do_io(fd, TimeoutKind::Send, || libc::write(fd, buf, count))
}

/// # Safety
/// Same preconditions as `recv(2)`.
pub unsafe fn recv(fd: i32, buf: *mut c_void, len: usize, flags: i32) -> isize {
    do_io(fd, TimeoutKind::Recv, || libc::recv(fd, buf, len, flags))
}

/// # Safety
/// Same preconditions as `send(2)`.
pub unsafe fn send(fd: i32, buf: *const c_void, len: usize, flags: i32) -> isize {
    do_io(fd, TimeoutKind::Send, || libc::send(fd, buf, len, flags))
}

/// # Safety
/// Same preconditions as `recvmsg(2)`.
pub unsafe fn recvmsg(fd: i32, msg: *mut libc::msghdr, flags: i32) -> isize {
    do_io(fd, TimeoutKind::Recv, || libc::recvmsg(fd, msg, flags))
}

/// # Safety
/// Same preconditions as `sendmsg(2)`.
pub unsafe fn sendmsg(fd: i32, msg: *const libc::msghdr, flags: i32) -> isize {
    do_io(fd, TimeoutKind::Send, || libc::sendmsg(fd, msg, flags))
}

/// # Safety
/// Same preconditions as `readv(2)`.
pub unsafe fn readv(fd: i32, iov: *const libc::iovec, iovcnt: i32) -> isize {
    do_io(fd, TimeoutKind::Recv, || libc::readv(fd, iov, iovcnt))
}

/// # Safety
/// Same preconditions as `writev(2)`.
pub unsafe fn writev(fd: i32, iov: *const libc::iovec, iovcnt: i32) -> isize {
    do_io(fd, TimeoutKind::Send, || libc::writev(fd, iov, iovcnt))
}

/// # Safety
/// Same preconditions as `recvfrom(2)`.
pub unsafe fn recvfrom(
    fd: i32,
    buf: *mut c_void,
    len: usize,
    flags: i32,
    src_addr: *mut libc::sockaddr,
    addrlen: *mut libc::socklen_t,
) -> isize {
    do_io(fd, TimeoutKind::Recv, || {
        libc::recvfrom(fd, buf, len, flags, src_addr, addrlen)
    })
}

/// # Safety
/// Same preconditions as `sendto(2)`.
pub unsafe fn sendto(
    fd: i32,
    buf: *const c_void,
    len: usize,
    flags: i32,
    dest_addr: *const libc::sockaddr,
    addrlen: libc::socklen_t,
) -> isize {
    do_io(fd, TimeoutKind::Send, || {
        libc::sendto(fd, buf, len, flags, dest_addr, addrlen)
    })
}

/// # Safety
/// `addr`/`addrlen` must satisfy `accept(2)`'s preconditions.
pub unsafe fn accept(fd: i32, addr: *mut libc::sockaddr, addrlen: *mut libc::socklen_t) -> isize {
    let rc = do_io(fd, TimeoutKind::Recv, || {
        libc::accept(fd, addr, addrlen) as isize
    });
    if rc >= 0 {
        // New sockets inherit nothing from the listener's FdCtx; the
        // lazy probe in fd.rs will force O_NONBLOCK on first touch.
        let _ = ensure_ctx(rc as i32);
    }
    rc
}

/// # Safety
/// `addr` must point at `len` valid bytes as required by `connect(2)`.
pub unsafe fn connect(fd: i32, addr: *const libc::sockaddr, len: libc::socklen_t) -> isize {
    if !is_hook_enabled() {
        return libc::connect(fd, addr, len) as isize;
    }
    let Some(io) = current_io_manager() else {
        return libc::connect(fd, addr, len) as isize;
    };
    let Some(ctx) = io.fd_manager().get(fd, true) else {
        return libc::connect(fd, addr, len) as isize;
    };
    if !ctx.is_socket() || ctx.is_user_nonblock() {
        return libc::connect(fd, addr, len) as isize;
    }

    let rc = libc::connect(fd, addr, len) as i32;
    if rc == 0 {
        return 0;
    }
    let err = last_errno();
    if err != libc::EINPROGRESS {
        return -1;
    }

    let co = coroutine::current();
    if io.add_event(fd, Event::Write, Waiter::Coroutine(co.clone())).is_err() {
        set_errno(libc::EALREADY);
        return -1;
    }

    let timed_out = Arc::new(AtomicBool::new(false));
    let timed_out2 = timed_out.clone();
    let io2 = io.clone();
    let timer = io.timers().add_conditional_timer(
        crate::config::global().tcp_connect_timeout_ms,
        move || {
            timed_out2.store(true, Ordering::SeqCst);
            let _ = io2.cancel_event(fd, Event::Write);
        },
        Arc::downgrade(&co),
        false,
    );

    Coroutine::yield_to_hold();
    timer.cancel();

    if timed_out.load(Ordering::SeqCst) {
        set_errno(libc::ETIMEDOUT);
        return -1;
    }

    let mut so_err: libc::c_int = 0;
    let mut so_err_len = std::mem::size_of::<libc::c_int>() as libc::socklen_t;
    let rc = libc::getsockopt(
        fd,
        libc::SOL_SOCKET,
        libc::SO_ERROR,
        &mut so_err as *mut _ as *mut c_void,
        &mut so_err_len,
    );
    if rc != 0 {
        return -1;
    }
    if so_err != 0 {
        set_errno(so_err);
        return -1;
    }
    0
}

/// # Safety
/// Same preconditions as `fcntl(2)`. Only `F_SETFL`/`F_GETFL` observe
/// `user_nonblock`; every other `cmd` passes `arg` straight through.
pub unsafe fn fcntl(fd: i32, cmd: i32, arg: i32) -> i32 {
    if !is_hook_enabled() {
        return libc::fcntl(fd, cmd, arg);
    }
    match cmd {
        libc::F_SETFL => {
            let Some(ctx) = ensure_ctx(fd) else {
                return libc::fcntl(fd, cmd, arg);
            };
            if ctx.is_closed() || !ctx.is_socket() {
                return libc::fcntl(fd, cmd, arg);
            }
            ctx.set_user_nonblock(arg & libc::O_NONBLOCK != 0);
            let effective = if ctx.is_sys_nonblock() {
                arg | libc::O_NONBLOCK
            } else {
                arg & !libc::O_NONBLOCK
            };
            libc::fcntl(fd, cmd, effective)
        }
        libc::F_GETFL => {
            let real = libc::fcntl(fd, cmd, 0);
            let Some(ctx) = ensure_ctx(fd) else {
                return real;
            };
            if ctx.is_closed() || !ctx.is_socket() {
                return real;
            }
            if ctx.is_user_nonblock() {
                real | libc::O_NONBLOCK
            } else {
                real & !libc::O_NONBLOCK
            }
        }
        _ => libc::fcntl(fd, cmd, arg),
    }
}

/// # Safety
/// Same preconditions as `ioctl(2)`; `arg` must point at an `int` when
/// `request == FIONBIO`, as required by that request.
pub unsafe fn ioctl(fd: i32, request: libc::c_ulong, arg: *mut c_void) -> i32 {
    if is_hook_enabled() && request == libc::FIONBIO as libc::c_ulong && !arg.is_null() {
        if let Some(ctx) = ensure_ctx(fd) {
            if !ctx.is_closed() && ctx.is_socket() {
                let user_nonblock = *(arg as *const i32) != 0;
                ctx.set_user_nonblock(user_nonblock);
            }
        }
    }
    libc::ioctl(fd, request, arg)
}

/// # Safety
/// Same preconditions as `getsockopt(2)`.
pub unsafe fn getsockopt(
    fd: i32,
    level: i32,
    optname: i32,
    optval: *mut c_void,
    optlen: *mut libc::socklen_t,
) -> i32 {
    libc::getsockopt(fd, level, optname, optval, optlen)
}

/// # Safety
/// Same preconditions as `setsockopt(2)`.
pub unsafe fn setsockopt(
    fd: i32,
    level: i32,
    optname: i32,
    optval: *const c_void,
    optlen: libc::socklen_t,
) -> i32 {
    if is_hook_enabled()
        && level == libc::SOL_SOCKET
        && (optname == libc::SO_RCVTIMEO || optname == libc::SO_SNDTIMEO)
        && !optval.is_null()
        && optlen as usize >= std::mem::size_of::<libc::timeval>()
    {
        if let Some(ctx) = ensure_ctx(fd) {
            let tv = &*(optval as *const libc::timeval);
            let ms = (tv.tv_sec as u64) * 1000 + (tv.tv_usec as u64) / 1000;
            let kind = if optname == libc::SO_RCVTIMEO {
                TimeoutKind::Recv
            } else {
                TimeoutKind::Send
            };
            ctx.set_timeout(kind, ms);
        }
    }
    libc::setsockopt(fd, level, optname, optval, optlen)
}

/// # Safety
/// `fd` must be a descriptor the caller owns and will not use again.
pub unsafe fn close(fd: i32) -> i32 {
    if let Some(io) = current_io_manager() {
        io.cancel_all(fd);
    }
    libc::close(fd)
}

/// Yield the current coroutine for `ms` milliseconds via the shared
/// timer set instead of blocking the worker thread.
pub fn sleep_ms(ms: u64) {
    if !is_hook_enabled() {
        std::thread::sleep(std::time::Duration::from_millis(ms));
        return;
    }
    let Some(io) = current_io_manager() else {
        std::thread::sleep(std::time::Duration::from_millis(ms));
        return;
    };
    let co = coroutine::current();
    let scheduler = io.scheduler().clone();
    io.timers().add_timer(
        ms,
        move || {
            co.mark_ready();
            scheduler.schedule(crate::scheduler::Task::Coroutine(co.clone()), None);
        },
        false,
    );
    Coroutine::yield_to_hold();
}

/// # Safety
/// No additional preconditions beyond `usleep(3)`'s.
pub unsafe fn usleep(usec: libc::useconds_t) -> i32 {
    sleep_ms((usec as u64).div_ceil(1000));
    0
}

/// # Safety
/// No additional preconditions beyond `sleep(3)`'s.
pub unsafe fn sleep(seconds: u32) -> u32 {
    sleep_ms(seconds as u64 * 1000);
    0
}

/// # Safety
/// `req` must be valid for reads as required by `nanosleep(2)`; `rem`
/// is never written since no signal can interrupt a timer-driven wait.
pub unsafe fn nanosleep(req: *const libc::timespec, _rem: *mut libc::timespec) -> i32 {
    if req.is_null() {
        set_errno(libc::EFAULT);
        return -1;
    }
    let req = &*req;
    let ms = (req.tv_sec as u64) * 1000 + (req.tv_nsec as u64) / 1_000_000;
    sleep_ms(ms);
    0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hook_is_disabled_by_default_on_a_fresh_thread() {
        assert!(!is_hook_enabled());
        set_hook_enabled(true);
        assert!(is_hook_enabled());
        set_hook_enabled(false);
    }

    #[test]
    fn read_passes_through_when_hook_disabled() {
        set_hook_enabled(false);
        let (r, w) = nix::unistd::pipe().unwrap();
        nix::unistd::write(w, b"hi").unwrap();
        let mut buf = [0u8; 2];
        let n = unsafe { read(r, buf.as_mut_ptr() as *mut c_void, buf.len()) };
        assert_eq!(n, 2);
        assert_eq!(&buf, b"hi");
        let _ = nix::unistd::close(r);
        let _ = nix::unistd::close(w);
    }
}
