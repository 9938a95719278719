//! A hooked `connect` against an unroutable address times out
//! within the configured connect deadline instead of blocking the
//! worker thread for the kernel's full TCP connect timeout.

use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::Arc;
use std::time::Instant;

use corio::runtime::Runtime;

// 192.0.2.0/24 is reserved for documentation (RFC 5737) and never
// routed; connecting to it reliably stalls in SYN_SENT until our own
// timeout fires, rather than an immediate RST.
const BLACKHOLE: &str = "192.0.2.1:9";

#[test]
fn connect_times_out_within_the_configured_deadline() {
    std::env::set_var("CORIO_CONNECT_TIMEOUT_MS", "200");

    let rt = Runtime::new(1, false);
    let errno_slot = Arc::new(AtomicI32::new(0));
    let errno_slot2 = errno_slot.clone();
    let elapsed_slot = Arc::new(AtomicI32::new(-1));
    let elapsed_slot2 = elapsed_slot.clone();

    rt.spawn(move || {
        let sock = unsafe { libc::socket(libc::AF_INET, libc::SOCK_STREAM, 0) };
        assert!(sock >= 0);

        let addr: std::net::SocketAddr = BLACKHOLE.parse().unwrap();
        let (sockaddr, len) = to_sockaddr(&addr);

        let start = Instant::now();
        let rc = unsafe { corio::hook::connect(sock, &sockaddr as *const _ as *const libc::sockaddr, len) };
        elapsed_slot2.store(start.elapsed().as_millis() as i32, Ordering::SeqCst);

        if rc < 0 {
            errno_slot2.store(std::io::Error::last_os_error().raw_os_error().unwrap_or(0), Ordering::SeqCst);
        }
        unsafe {
            corio::hook::close(sock);
        }
    });

    std::thread::sleep(std::time::Duration::from_millis(600));
    rt.stop();

    let elapsed = elapsed_slot.load(Ordering::SeqCst);
    assert!(elapsed >= 0, "connect coroutine never completed");
    assert_eq!(errno_slot.load(Ordering::SeqCst), libc::ETIMEDOUT);
    assert!(elapsed < 500, "connect took {elapsed}ms, expected to time out near 200ms");
}

fn to_sockaddr(addr: &std::net::SocketAddr) -> (libc::sockaddr_in, libc::socklen_t) {
    match addr {
        std::net::SocketAddr::V4(v4) => {
            let sockaddr = libc::sockaddr_in {
                sin_family: libc::AF_INET as libc::sa_family_t,
                sin_port: v4.port().to_be(),
                sin_addr: libc::in_addr {
                    s_addr: u32::from_ne_bytes(v4.ip().octets()),
                },
                sin_zero: [0; 8],
            };
            (sockaddr, std::mem::size_of::<libc::sockaddr_in>() as libc::socklen_t)
        }
        _ => unreachable!("test only uses IPv4 addresses"),
    }
}
