//! A coroutine accepts one connection on a listening socket via
//! the hook layer, echoes back what it reads, and a plain blocking
//! client on a separate OS thread observes its payload unchanged.

use std::io::{Read, Write};
use std::net::{TcpListener, TcpStream};
use std::os::unix::io::AsRawFd;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use corio::runtime::Runtime;

#[test]
fn echoes_one_connection_verbatim() {
    let listener = TcpListener::bind("127.0.0.1:0").expect("bind");
    listener.set_nonblocking(true).expect("nonblocking");
    let addr = listener.local_addr().unwrap();
    let listen_fd = listener.as_raw_fd();

    let rt = Runtime::new(2, false);
    let server_done = Arc::new(AtomicBool::new(false));
    let server_done2 = server_done.clone();

    rt.spawn(move || {
        let client_fd = unsafe { corio::hook::accept(listen_fd, std::ptr::null_mut(), std::ptr::null_mut()) };
        assert!(client_fd >= 0, "accept failed");
        let client_fd = client_fd as i32;

        let mut buf = [0u8; 64];
        let n = unsafe { corio::hook::read(client_fd, buf.as_mut_ptr() as *mut _, buf.len()) };
        assert!(n > 0);

        let mut written = 0usize;
        while written < n as usize {
            let rc = unsafe {
                corio::hook::write(
                    client_fd,
                    buf[written..n as usize].as_ptr() as *const _,
                    n as usize - written,
                )
            };
            assert!(rc > 0);
            written += rc as usize;
        }
        unsafe {
            corio::hook::close(client_fd);
        }
        server_done2.store(true, Ordering::SeqCst);
    });

    // Keep `listener` alive (and thus `listen_fd` valid) for the
    // duration of the accept, then hand connection duty entirely to
    // the raw fd the coroutine is driving.
    std::mem::forget(listener);

    let payload = b"hello from a blocking client";
    let client_thread = std::thread::spawn(move || {
        std::thread::sleep(std::time::Duration::from_millis(50));
        let mut stream = TcpStream::connect(addr).expect("connect");
        stream.write_all(payload).unwrap();
        let mut echoed = vec![0u8; payload.len()];
        stream.read_exact(&mut echoed).unwrap();
        echoed
    });

    let echoed = client_thread.join().unwrap();
    std::thread::sleep(std::time::Duration::from_millis(50));
    rt.stop();

    assert_eq!(&echoed, payload);
    assert!(server_done.load(Ordering::SeqCst));
}
