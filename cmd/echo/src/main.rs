//! spindle Echo Server
//!
//! TCP echo server written in blocking style: one fiber per connection,
//! with `hook::accept`/`read`/`write` parking the fiber on the I/O manager
//! whenever the socket is not ready.
//!
//! Usage:
//!     cargo build --release -p spindle-echo
//!     ./target/release/spindle-echo [port] [threads]
//!
//! Test with:
//!     echo "hello" | nc localhost 9999
//!     for i in $(seq 1 100); do echo "ping $i" | nc -q0 localhost 9999 & done

use socket2::{Domain, SockAddr, Socket, Type};
use spindle::{hook, IoManager, Schedule};
use std::net::SocketAddr;
use std::os::fd::{FromRawFd, IntoRawFd, RawFd};
use tracing::{debug, error, info, warn};

const BUF_SIZE: usize = 4096;

fn listen(addr: SocketAddr) -> std::io::Result<RawFd> {
    let fd = hook::socket(libc::AF_INET, libc::SOCK_STREAM | libc::SOCK_CLOEXEC, 0);
    if fd < 0 {
        return Err(std::io::Error::last_os_error());
    }
    let socket = unsafe { Socket::from_raw_fd(fd) };
    socket.set_reuse_address(true)?;
    socket.bind(&SockAddr::from(addr))?;
    socket.listen(1024)?;
    Ok(socket.into_raw_fd())
}

fn serve(fd: RawFd) {
    let mut buf = [0u8; BUF_SIZE];
    loop {
        let n = hook::read(fd, &mut buf);
        if n <= 0 {
            if n < 0 {
                debug!(fd, error = %std::io::Error::last_os_error(), "read failed");
            }
            break;
        }
        let mut sent = 0;
        while sent < n as usize {
            let w = hook::write(fd, &buf[sent..n as usize]);
            if w <= 0 {
                debug!(fd, error = %std::io::Error::last_os_error(), "write failed");
                hook::close(fd);
                return;
            }
            sent += w as usize;
        }
    }
    hook::close(fd);
}

fn accept_loop(lfd: RawFd) {
    let Some(iom) = IoManager::current() else {
        error!("accept loop outside an I/O manager");
        return;
    };
    loop {
        let (fd, peer) = hook::accept(lfd);
        if fd < 0 {
            warn!(error = %std::io::Error::last_os_error(), "accept failed");
            continue;
        }
        debug!(fd, peer = ?peer.and_then(|a| a.as_socket()), "accepted");
        iom.schedule_fn(move || serve(fd));
    }
}

fn main() {
    spindle::init_logging();

    let args: Vec<String> = std::env::args().collect();
    let port: u16 = args.get(1).and_then(|s| s.parse().ok()).unwrap_or(9999);
    let threads: usize = args
        .get(2)
        .and_then(|s| s.parse().ok())
        .unwrap_or_else(|| spindle::env_get("SPINDLE_THREADS", 2));

    let iom = match IoManager::new(threads, true, "echo") {
        Ok(iom) => iom,
        Err(e) => {
            error!(error = %e, "cannot start I/O manager");
            std::process::exit(1);
        }
    };

    iom.schedule_fn(move || {
        let addr = SocketAddr::from(([0, 0, 0, 0], port));
        match listen(addr) {
            Ok(lfd) => {
                info!(%addr, threads, "echo server listening");
                accept_loop(lfd);
            }
            Err(e) => error!(%addr, error = %e, "listen failed"),
        }
    });

    // The caller thread serves connections from here on
    iom.stop();
}
