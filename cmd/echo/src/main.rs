//! Echo example
//!
//! A socketpair stands in for a network connection: a client thread
//! writes lines, a persistent read event on the server end echoes them
//! back, and a second read event on the client end prints the echoes.
//! SIGINT (ctrl-c) shuts the loop down cleanly through a signal event.

use revent::{Base, EventMask};
use std::os::unix::io::RawFd;
use std::thread;
use std::time::Duration;

fn socketpair() -> (RawFd, RawFd) {
    let mut fds = [0 as RawFd; 2];
    let rc = unsafe {
        libc::socketpair(
            libc::AF_UNIX,
            libc::SOCK_STREAM | libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC,
            0,
            fds.as_mut_ptr(),
        )
    };
    assert_eq!(rc, 0, "socketpair failed");
    (fds[0], fds[1])
}

fn read_all(fd: RawFd) -> Vec<u8> {
    let mut out = Vec::new();
    let mut buf = [0u8; 256];
    loop {
        let n = unsafe { libc::read(fd, buf.as_mut_ptr() as *mut libc::c_void, buf.len()) };
        if n <= 0 {
            break;
        }
        out.extend_from_slice(&buf[..n as usize]);
    }
    out
}

fn write_all(fd: RawFd, data: &[u8]) {
    let mut off = 0;
    while off < data.len() {
        let n = unsafe {
            libc::write(
                fd,
                data[off..].as_ptr() as *const libc::c_void,
                data.len() - off,
            )
        };
        if n <= 0 {
            break;
        }
        off += n as usize;
    }
}

fn main() {
    println!("=== revent echo example ===\n");

    let base = Base::new().expect("failed to create base");
    println!("backend: {}\n", base.backend_name());

    let (server, client) = socketpair();

    // server side: echo whatever arrives
    let echo = base.io_event(server, EventMask::READ | EventMask::PERSIST, |fd, _| {
        let data = read_all(fd);
        if !data.is_empty() {
            print!("server: got {:?}\n", String::from_utf8_lossy(&data));
            write_all(fd, &data);
        }
    });
    echo.add(None).unwrap();

    // client side: print the echoes, stop after the last one
    let b2 = base.clone();
    let replies = base.io_event(client, EventMask::READ | EventMask::PERSIST, move |fd, _| {
        let data = read_all(fd);
        for line in String::from_utf8_lossy(&data).lines() {
            println!("client: echoed {:?}", line);
            if line == "bye" {
                b2.loopbreak();
            }
        }
    });
    replies.add(None).unwrap();

    // ctrl-c ends the loop too
    let b3 = base.clone();
    let sigint = base.signal_event(libc::SIGINT, EventMask::PERSIST, move |_, _| {
        println!("\ninterrupted, shutting down");
        b3.loopbreak();
    });
    sigint.add(None).unwrap();

    let writer = thread::spawn(move || {
        for msg in ["hello\n", "echo loop\n", "bye\n"] {
            write_all(client, msg.as_bytes());
            thread::sleep(Duration::from_millis(100));
        }
    });

    base.dispatch().unwrap();
    writer.join().unwrap();

    let stats = base.stats();
    println!(
        "\nstats: {} backend waits, {} callbacks",
        stats.dispatches, stats.callbacks
    );

    drop(echo);
    drop(replies);
    drop(sigint);
    unsafe {
        libc::close(server);
        libc::close(client);
    }
}
