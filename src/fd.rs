//! Per-descriptor bookkeeping: `FdCtx` and the growable `FdManager`
//! table.
//!
//! Grounded on `original_source/easy/base/FdManager.{h,cc}`: a
//! descriptor's socket-ness and blocking mode are probed lazily on
//! first observation, the runtime's own non-blocking flag is tracked
//! separately from what the user asked for, and per-direction
//! timeouts default to "infinite".

use std::sync::Arc;

use crate::sync::{RwLock, SpinLock};

/// Sentinel meaning "no timeout" for `FdCtx` recv/send timeouts.
pub const TIMEOUT_INFINITE: u64 = u64::MAX;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeoutKind {
    Recv,
    Send,
}

/// Descriptor record populated lazily on first lookup.
#[derive(Debug)]
pub struct FdCtx {
    fd: i32,
    state: SpinLock<FdState>,
}

#[derive(Debug, Clone)]
struct FdState {
    is_init: bool,
    is_socket: bool,
    sys_nonblock: bool,
    user_nonblock: bool,
    is_closed: bool,
    recv_timeout_ms: u64,
    send_timeout_ms: u64,
}

impl Default for FdState {
    fn default() -> Self {
        FdState {
            is_init: false,
            is_socket: false,
            sys_nonblock: false,
            user_nonblock: false,
            is_closed: false,
            recv_timeout_ms: TIMEOUT_INFINITE,
            send_timeout_ms: TIMEOUT_INFINITE,
        }
    }
}

impl FdCtx {
    fn new(fd: i32) -> Self {
        let mut ctx = FdCtx {
            fd,
            state: SpinLock::new(FdState::default()),
        };
        ctx.init();
        ctx
    }

    /// Probe the descriptor via `fstat`; if it's a socket, force
    /// `O_NONBLOCK` on the kernel fd and record `sys_nonblock = true`.
    /// Non-sockets are left untouched.
    fn init(&mut self) {
        let mut st = self.state.lock();
        if st.is_init {
            return;
        }
        st.is_init = true;

        let mut stat: libc::stat = unsafe { std::mem::zeroed() };
        let rc = unsafe { libc::fstat(self.fd, &mut stat) };
        if rc != 0 {
            return;
        }
        let is_socket = (stat.st_mode & libc::S_IFMT) == libc::S_IFSOCK;
        st.is_socket = is_socket;

        if is_socket {
            let flags = unsafe { libc::fcntl(self.fd, libc::F_GETFL, 0) };
            if flags >= 0 && flags & libc::O_NONBLOCK == 0 {
                unsafe {
                    libc::fcntl(self.fd, libc::F_SETFL, flags | libc::O_NONBLOCK);
                }
            }
            st.sys_nonblock = true;
            st.user_nonblock = false;
        }
    }

    pub fn fd(&self) -> i32 {
        self.fd
    }

    pub fn is_socket(&self) -> bool {
        self.state.lock().is_socket
    }

    pub fn is_sys_nonblock(&self) -> bool {
        self.state.lock().sys_nonblock
    }

    pub fn is_user_nonblock(&self) -> bool {
        self.state.lock().user_nonblock
    }

    pub fn set_user_nonblock(&self, flag: bool) {
        self.state.lock().user_nonblock = flag;
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().is_closed
    }

    pub fn mark_closed(&self) {
        self.state.lock().is_closed = true;
    }

    pub fn set_timeout(&self, kind: TimeoutKind, ms: u64) {
        let mut st = self.state.lock();
        match kind {
            TimeoutKind::Recv => st.recv_timeout_ms = ms,
            TimeoutKind::Send => st.send_timeout_ms = ms,
        }
    }

    pub fn timeout(&self, kind: TimeoutKind) -> Option<u64> {
        let st = self.state.lock();
        let ms = match kind {
            TimeoutKind::Recv => st.recv_timeout_ms,
            TimeoutKind::Send => st.send_timeout_ms,
        };
        if ms == TIMEOUT_INFINITE {
            None
        } else {
            Some(ms)
        }
    }
}

/// Growable, rwlock-protected table of [`FdCtx`] indexed by fd.
pub struct FdManager {
    table: RwLock<Vec<Option<Arc<FdCtx>>>>,
}

impl Default for FdManager {
    fn default() -> Self {
        Self::new()
    }
}

impl FdManager {
    pub fn new() -> Self {
        FdManager {
            table: RwLock::new(Vec::new()),
        }
    }

    /// Look up the context for `fd`, optionally creating it lazily.
    pub fn get(&self, fd: i32, auto_create: bool) -> Option<Arc<FdCtx>> {
        if fd < 0 {
            return None;
        }
        let idx = fd as usize;
        {
            let table = self.table.read().unwrap();
            if idx < table.len() {
                if let Some(ctx) = &table[idx] {
                    return Some(ctx.clone());
                }
            } else if !auto_create {
                return None;
            }
        }
        if !auto_create {
            return None;
        }
        let mut table = self.table.write().unwrap();
        if idx >= table.len() {
            table.resize(idx + 1, None);
        }
        if table[idx].is_none() {
            table[idx] = Some(Arc::new(FdCtx::new(fd)));
        }
        table[idx].clone()
    }

    pub fn remove(&self, fd: i32) {
        if fd < 0 {
            return;
        }
        let idx = fd as usize;
        let mut table = self.table.write().unwrap();
        if idx < table.len() {
            table[idx] = None;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lookup_without_auto_create_returns_none() {
        let mgr = FdManager::new();
        assert!(mgr.get(3, false).is_none());
    }

    #[test]
    fn lazy_creation_then_removal() {
        let mgr = FdManager::new();
        let ctx = mgr.get(0, true).unwrap();
        assert_eq!(ctx.fd(), 0);
        assert!(mgr.get(0, false).is_some());
        mgr.remove(0);
        assert!(mgr.get(0, false).is_none());
    }

    #[test]
    fn timeouts_default_to_infinite() {
        let ctx = FdCtx::new(1);
        assert_eq!(ctx.timeout(TimeoutKind::Recv), None);
        ctx.set_timeout(TimeoutKind::Recv, 500);
        assert_eq!(ctx.timeout(TimeoutKind::Recv), Some(500));
    }
}
