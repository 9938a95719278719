//! A coroutine's hooked `sleep` resumes via the timer set rather
//! than blocking a worker thread, and does so within the expected
//! window.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use corio::runtime::Runtime;

#[test]
fn sleep_resumes_after_roughly_the_requested_duration() {
    let rt = Runtime::new(1, false);
    let elapsed_ms = Arc::new(AtomicU64::new(0));
    let elapsed_ms2 = elapsed_ms.clone();

    let start = Instant::now();
    rt.spawn(move || {
        corio::sleep_ms(150);
        elapsed_ms2.store(start.elapsed().as_millis() as u64, Ordering::SeqCst);
    });

    std::thread::sleep(std::time::Duration::from_millis(400));
    rt.stop();

    let observed = elapsed_ms.load(Ordering::SeqCst);
    assert!(observed >= 140, "slept for only {observed}ms");
    assert!(observed <= 350, "slept for {observed}ms, expected close to 150ms");
}
