//! Stopping a caller-attached scheduler with no work queued joins
//! every worker promptly and leaves `can_stop()` true afterward.

use std::time::Instant;

use corio::config::MAX_EPOLL_TIMEOUT_MS;
use corio::scheduler::Scheduler;

#[test]
fn stop_with_no_work_joins_promptly() {
    let sched = Scheduler::new(3, true, "corio-stop-test");
    sched.start();

    let start = Instant::now();
    sched.stop();
    let elapsed = start.elapsed();

    assert!(
        elapsed.as_millis() as i64 <= 2 * MAX_EPOLL_TIMEOUT_MS as i64,
        "stop() took {elapsed:?}, expected to finish within 2x the idle poll timeout"
    );
    assert!(sched.can_stop());
}
