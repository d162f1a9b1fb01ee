//! Cooperative blocking calls
//!
//! Each function here has the shape of its POSIX namesake: it returns the
//! syscall result, or -1 with `errno` set. On a thread with hooks enabled
//! and a running fiber, a call that would block parks the fiber on the
//! I/O manager instead of blocking the thread. Everywhere else the calls
//! go straight to the kernel.
//!
//! ```text
//!   read(fd) ─► op() ── EAGAIN ─► add_event(fd, READ, current fiber)
//!                 ▲                 [+ timer: ETIMEDOUT, cancel_event]
//!                 │                         │
//!                 └──── retry ◄── resumed ◄─┘  yield_to_hold
//! ```

mod fd_manager;
mod io;
mod sleep;
mod socket;

pub use fd_manager::{FdCtx, FdManager};
pub use io::{read, readv, recv, recvfrom, recvmsg, send, sendmsg, sendto, write, writev};
pub use sleep::{nanosleep, sleep, usleep};
pub use socket::{
    accept, close, connect, connect_with_timeout, fcntl_getfl, fcntl_setfl, getsockopt,
    ioctl_fionbio, set_timeout, setsockopt, socket,
};

use crate::fiber::Fiber;
use crate::iomanager::IoManager;
use crate::tls;
use nix::errno::Errno;
use spindle_core::Event;
use std::os::fd::RawFd;
use std::sync::atomic::{AtomicI32, AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;
use tracing::error;

/// Hooks active on the current thread
pub fn is_enabled() -> bool {
    tls::hook_enabled()
}

/// Toggle hooks for the current thread only
pub fn set_enabled(enabled: bool) {
    tls::set_hook_enabled(enabled);
}

const NO_TIMEOUT: u64 = u64::MAX;

fn connect_timeout_ms() -> &'static AtomicU64 {
    static CONNECT_TIMEOUT: OnceLock<AtomicU64> = OnceLock::new();
    CONNECT_TIMEOUT.get_or_init(|| {
        let ms = crate::config::global()
            .tcp_connect_timeout
            .map_or(NO_TIMEOUT, |d| u64::try_from(d.as_millis()).unwrap_or(NO_TIMEOUT));
        AtomicU64::new(ms)
    })
}

/// Timeout used by [`connect`]
pub fn connect_timeout() -> Option<Duration> {
    let ms = connect_timeout_ms().load(Ordering::Relaxed);
    (ms != NO_TIMEOUT).then(|| Duration::from_millis(ms))
}

pub fn set_connect_timeout(timeout: Option<Duration>) {
    let ms = timeout.map_or(NO_TIMEOUT, |d| u64::try_from(d.as_millis()).unwrap_or(NO_TIMEOUT));
    connect_timeout_ms().store(ms, Ordering::Relaxed);
}

/// Which socket timeout bounds a parked call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeoutKind {
    /// `SO_RCVTIMEO`
    Recv,
    /// `SO_SNDTIMEO`
    Send,
}

/// Shared between a parked call and its timeout timer; non-zero holds the
/// errno the call should fail with.
#[derive(Default)]
struct WaitState {
    cancelled: AtomicI32,
}

/// Park the current fiber until `event` fires on `fd` or `timeout_ms`
/// passes. `Err` carries the errno to fail with.
fn wait_for(iom: Arc<IoManager>, fd: RawFd, name: &'static str, event: Event, timeout_ms: Option<u64>) -> Result<(), Errno> {
    let state = Arc::new(WaitState::default());
    let timer = timeout_ms.map(|ms| {
        let weak_state = Arc::downgrade(&state);
        let weak_iom = Arc::downgrade(&iom);
        iom.add_condition_timer(
            ms,
            move || {
                let Some(state) = weak_state.upgrade() else {
                    return;
                };
                if state.cancelled.load(Ordering::Acquire) != 0 {
                    return;
                }
                state.cancelled.store(Errno::ETIMEDOUT as i32, Ordering::Release);
                if let Some(iom) = weak_iom.upgrade() {
                    iom.cancel_event(fd, event);
                }
            },
            Arc::downgrade(&state),
            false,
        )
    });

    if let Err(e) = iom.add_event(fd, event, None) {
        error!(fd, name, %event, error = %e, "cannot park on descriptor");
        if let Some(timer) = timer {
            timer.cancel();
        }
        return Err(Errno::EINVAL);
    }
    drop(iom);

    Fiber::yield_to_hold();

    if let Some(timer) = timer {
        timer.cancel();
    }
    match state.cancelled.load(Ordering::Acquire) {
        0 => Ok(()),
        errno => Err(Errno::from_raw(errno)),
    }
}

/// Run `op` with fiber-aware blocking.
///
/// Falls straight through to `op` when hooks are off, the descriptor is
/// unknown or not a socket, or the program put it in non-blocking mode.
pub(crate) fn do_io<F>(fd: RawFd, name: &'static str, event: Event, kind: TimeoutKind, mut op: F) -> isize
where
    F: FnMut() -> isize,
{
    if !is_enabled() {
        return op();
    }
    let Some(ctx) = FdManager::global().get(fd, false) else {
        return op();
    };
    if ctx.is_closed() {
        Errno::EBADF.set();
        return -1;
    }
    if !ctx.is_socket() || ctx.user_nonblock() {
        return op();
    }

    let timeout = ctx.timeout(kind);
    loop {
        let mut n = op();
        while n == -1 && Errno::last() == Errno::EINTR {
            n = op();
        }
        if n != -1 || Errno::last() != Errno::EAGAIN {
            return n;
        }

        let Some(iom) = IoManager::current() else {
            return n;
        };
        if !Fiber::can_yield() {
            return n;
        }
        if let Err(errno) = wait_for(iom, fd, name, event, timeout) {
            errno.set();
            return -1;
        }
        if ctx.is_closed() {
            Errno::EBADF.set();
            return -1;
        }
    }
}
