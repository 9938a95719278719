//! TCP echo server driven by corio coroutines.
//!
//! The listener and accepted connections are plain `std::net` sockets
//! put into non-blocking mode; all reads/writes go through the hook
//! layer's raw wrappers so each coroutine appears to block while
//! actually yielding to the scheduler whenever the kernel would.

use std::net::TcpListener;
use std::os::unix::io::AsRawFd;

use corio::runtime::Runtime;

const DEFAULT_LISTEN_ADDR: &str = "127.0.0.1:5555";

fn main() {
    env_logger::init();

    let rt = Runtime::new(4, true);
    let listener = TcpListener::bind(DEFAULT_LISTEN_ADDR).expect("bind");
    listener.set_nonblocking(true).expect("set_nonblocking");
    println!(
        "listening for tcp echo connections on {}",
        listener.local_addr().unwrap()
    );
    let listen_fd = listener.as_raw_fd();

    rt.spawn(move || loop {
        let client_fd = unsafe { corio::hook::accept(listen_fd, std::ptr::null_mut(), std::ptr::null_mut()) };
        if client_fd < 0 {
            let err = std::io::Error::last_os_error();
            log::warn!("accept failed: {err}");
            continue;
        }
        let client_fd = client_fd as i32;

        std::thread::yield_now();
        let sched = corio::scheduler::current_scheduler();
        if let Some(sched) = sched {
            sched.schedule(
                corio::scheduler::Task::Callable(Box::new(move || handle_connection(client_fd))),
                None,
            );
        } else {
            handle_connection(client_fd);
        }
    });

    std::thread::sleep(std::time::Duration::from_secs(3600));
    rt.stop();
}

fn handle_connection(fd: i32) {
    let mut buf = [0u8; 16 * 1024];
    loop {
        let n = unsafe { corio::hook::read(fd, buf.as_mut_ptr() as *mut _, buf.len()) };
        if n <= 0 {
            break;
        }
        let mut written = 0usize;
        while written < n as usize {
            let rc = unsafe {
                corio::hook::write(
                    fd,
                    buf[written..n as usize].as_ptr() as *const _,
                    n as usize - written,
                )
            };
            if rc <= 0 {
                break;
            }
            written += rc as usize;
        }
    }
    unsafe {
        corio::hook::close(fd);
    }
}
