//! Worker threads: named OS threads that run one scheduler dispatch
//! loop each and record their kernel-level thread id.
//!
//! Grounded on `original_source/easy/base/Thread.*` (named threads,
//! kernel tid) and on `mioco`'s per-thread `EventLoop` workers (its
//! old `src/thread.rs`).

use std::thread::{self, JoinHandle};

/// The kernel thread id (`gettid(2)`), distinct from any
/// process-wide allocator-assigned thread identity.
pub fn kernel_tid() -> i32 {
    unsafe { libc::syscall(libc::SYS_gettid) as i32 }
}

/// A spawned worker thread: carries its `JoinHandle` and the kernel
/// tid it reported once running (observed, not predicted, since the
/// kernel assigns it only after the thread starts).
pub struct WorkerThread {
    pub name: String,
    handle: Option<JoinHandle<()>>,
    tid: std::sync::Arc<std::sync::atomic::AtomicI32>,
}

impl WorkerThread {
    /// Spawn `name` running `body`; `body` is handed the worker's own
    /// kernel tid once it has started, matching the original's
    /// pattern of recording the tid from inside the thread itself.
    pub fn spawn(name: impl Into<String>, body: impl FnOnce(i32) + Send + 'static) -> Self {
        let name = name.into();
        let tid_slot = std::sync::Arc::new(std::sync::atomic::AtomicI32::new(0));
        let tid_slot2 = tid_slot.clone();
        let handle = thread::Builder::new()
            .name(name.clone())
            .spawn(move || {
                let tid = kernel_tid();
                tid_slot2.store(tid, std::sync::atomic::Ordering::SeqCst);
                body(tid);
            })
            .expect("failed to spawn worker thread");
        WorkerThread {
            name,
            handle: Some(handle),
            tid: tid_slot,
        }
    }

    pub fn tid(&self) -> i32 {
        self.tid.load(std::sync::atomic::Ordering::SeqCst)
    }

    pub fn join(&mut self) {
        if let Some(h) = self.handle.take() {
            let _ = h.join();
        }
    }
}

impl Drop for WorkerThread {
    fn drop(&mut self) {
        self.join();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;

    #[test]
    fn worker_reports_a_nonzero_kernel_tid() {
        let (tx, rx) = mpsc::channel();
        let mut w = WorkerThread::spawn("corio-test-worker", move |tid| {
            tx.send(tid).unwrap();
        });
        let tid = rx.recv().unwrap();
        assert!(tid > 0);
        w.join();
        assert_eq!(w.tid(), tid);
    }
}
