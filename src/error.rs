//! Error types for the library's own (non-POSIX) API surface.
//!
//! Hooked syscalls (`src/hook.rs`) never use this type: they return
//! the raw `isize`/`-1` with `errno` set, so that intercepted code
//! cannot observe it is running under the runtime. `CoreError` covers
//! registration failures and other recoverable errors surfaced by the
//! library's direct Rust API: `add_event`, `cancel_event`, and
//! `FdManager` lookups.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum CoreError {
    #[error("event already armed for fd {fd} ({event:?})")]
    EventAlreadyArmed { fd: i32, event: crate::channel::Event },

    #[error("epoll_ctl failed while arming fd {fd}: {source}")]
    EpollRegistration { fd: i32, source: std::io::Error },

    #[error("descriptor {0} is closed")]
    DescriptorClosed(i32),

    #[error("descriptor {0} has no registered context")]
    NoDescriptorContext(i32),

    #[error("a scheduler using the caller thread is already active on this thread")]
    SchedulerAlreadyAttached,

    #[error("operation timed out")]
    TimedOut,

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub type CoreResult<T> = Result<T, CoreError>;
