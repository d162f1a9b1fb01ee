//! Hooked socket lifecycle and descriptor control

use super::{connect_timeout, do_io, is_enabled, wait_for, FdManager, TimeoutKind};
use crate::fiber::Fiber;
use crate::iomanager::IoManager;
use nix::errno::Errno;
use nix::fcntl::{fcntl, FcntlArg, OFlag};
use socket2::SockAddr;
use spindle_core::Event;
use std::mem;
use std::os::fd::RawFd;
use std::time::Duration;
use tracing::debug;

fn nix_ret(res: nix::Result<libc::c_int>) -> libc::c_int {
    match res {
        Ok(v) => v,
        Err(errno) => {
            errno.set();
            -1
        }
    }
}

pub fn socket(domain: libc::c_int, ty: libc::c_int, protocol: libc::c_int) -> RawFd {
    let fd = unsafe { libc::socket(domain, ty, protocol) };
    if fd >= 0 && is_enabled() {
        FdManager::global().register(fd);
    }
    fd
}

/// `connect` bounded by [`connect_timeout`](super::connect_timeout)
pub fn connect(fd: RawFd, addr: &SockAddr) -> libc::c_int {
    connect_with_timeout(fd, addr, connect_timeout())
}

pub fn connect_with_timeout(fd: RawFd, addr: &SockAddr, timeout: Option<Duration>) -> libc::c_int {
    let raw = || unsafe { libc::connect(fd, addr.as_ptr(), addr.len()) };
    if !is_enabled() {
        return raw();
    }
    let Some(ctx) = FdManager::global().get(fd, false) else {
        Errno::EBADF.set();
        return -1;
    };
    if ctx.is_closed() {
        Errno::EBADF.set();
        return -1;
    }
    if !ctx.is_socket() || ctx.user_nonblock() {
        return raw();
    }

    let n = raw();
    if n == 0 || Errno::last() != Errno::EINPROGRESS {
        return n;
    }
    let Some(iom) = IoManager::current() else {
        return n;
    };
    if !Fiber::can_yield() {
        return n;
    }

    let timeout_ms = timeout.map(|d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX - 1));
    if let Err(errno) = wait_for(iom, fd, "connect", Event::WRITE, timeout_ms) {
        debug!(fd, %errno, "connect did not complete");
        errno.set();
        return -1;
    }

    let mut error: libc::c_int = 0;
    let mut len = mem::size_of::<libc::c_int>() as libc::socklen_t;
    let ret = unsafe {
        libc::getsockopt(fd, libc::SOL_SOCKET, libc::SO_ERROR, (&mut error as *mut libc::c_int).cast(), &mut len)
    };
    if ret == -1 {
        return -1;
    }
    if error == 0 {
        0
    } else {
        Errno::from_raw(error).set();
        -1
    }
}

/// `accept`; the peer address is returned alongside the new descriptor.
pub fn accept(fd: RawFd) -> (RawFd, Option<SockAddr>) {
    let mut peer = None;
    let n = do_io(fd, "accept", Event::READ, TimeoutKind::Recv, || {
        let res = unsafe {
            SockAddr::try_init(|storage, len| {
                let n = libc::accept4(fd, storage.cast(), len, libc::SOCK_CLOEXEC);
                if n < 0 {
                    Err(std::io::Error::last_os_error())
                } else {
                    Ok(n)
                }
            })
        };
        match res {
            Ok((n, addr)) => {
                peer = Some(addr);
                n as isize
            }
            Err(_) => -1,
        }
    });

    let fd = n as RawFd;
    if fd >= 0 && is_enabled() {
        FdManager::global().register(fd);
    }
    (fd, peer)
}

/// Wake everything parked on `fd`, forget it, then close it.
pub fn close(fd: RawFd) -> libc::c_int {
    if is_enabled() {
        if let Some(ctx) = FdManager::global().get(fd, false) {
            ctx.set_closed();
            if let Some(iom) = IoManager::current() {
                iom.cancel_all(fd);
            }
            FdManager::global().del(fd);
        }
    }
    unsafe { libc::close(fd) }
}

/// `fcntl(F_GETFL)` reporting the non-blocking mode the program chose
pub fn fcntl_getfl(fd: RawFd) -> libc::c_int {
    let flags = nix_ret(fcntl(fd, FcntlArg::F_GETFL));
    if flags == -1 || !is_enabled() {
        return flags;
    }
    match FdManager::global().get(fd, false) {
        Some(ctx) if !ctx.is_closed() && ctx.is_socket() => {
            if ctx.user_nonblock() {
                flags | libc::O_NONBLOCK
            } else {
                flags & !libc::O_NONBLOCK
            }
        }
        _ => flags,
    }
}

/// `fcntl(F_SETFL)`; on hooked sockets `O_NONBLOCK` is recorded, and the
/// kernel flag stays as the runtime needs it.
pub fn fcntl_setfl(fd: RawFd, flags: libc::c_int) -> libc::c_int {
    let mut flags = flags;
    if is_enabled() {
        if let Some(ctx) = FdManager::global().get(fd, false) {
            if !ctx.is_closed() && ctx.is_socket() {
                ctx.set_user_nonblock(flags & libc::O_NONBLOCK != 0);
                if ctx.sys_nonblock() {
                    flags |= libc::O_NONBLOCK;
                } else {
                    flags &= !libc::O_NONBLOCK;
                }
            }
        }
    }
    match nix_ret(fcntl(fd, FcntlArg::F_SETFL(OFlag::from_bits_truncate(flags)))) {
        -1 => -1,
        _ => 0,
    }
}

/// `ioctl(FIONBIO)`
pub fn ioctl_fionbio(fd: RawFd, on: bool) -> libc::c_int {
    if is_enabled() {
        if let Some(ctx) = FdManager::global().get(fd, false) {
            if !ctx.is_closed() && ctx.is_socket() {
                ctx.set_user_nonblock(on);
                if ctx.sys_nonblock() {
                    return 0;
                }
            }
        }
    }
    let mut arg = libc::c_int::from(on);
    unsafe { libc::ioctl(fd, libc::FIONBIO, &mut arg) }
}

/// `setsockopt`; `SO_RCVTIMEO`/`SO_SNDTIMEO` also bound parked calls.
///
/// # Safety
///
/// `optval` must point to `optlen` readable bytes laid out as `optname`
/// expects.
pub unsafe fn setsockopt(
    fd: RawFd,
    level: libc::c_int,
    optname: libc::c_int,
    optval: *const libc::c_void,
    optlen: libc::socklen_t,
) -> libc::c_int {
    let kind = match (level, optname) {
        (libc::SOL_SOCKET, libc::SO_RCVTIMEO) => Some(TimeoutKind::Recv),
        (libc::SOL_SOCKET, libc::SO_SNDTIMEO) => Some(TimeoutKind::Send),
        _ => None,
    };
    if let Some(kind) = kind {
        if is_enabled() && optlen as usize >= mem::size_of::<libc::timeval>() {
            if let Some(ctx) = FdManager::global().get(fd, false) {
                let tv = optval.cast::<libc::timeval>().read_unaligned();
                let d = Duration::from_secs(tv.tv_sec.max(0) as u64)
                    + Duration::from_micros(tv.tv_usec.max(0) as u64);
                ctx.set_timeout(kind, Some(d));
            }
        }
    }
    libc::setsockopt(fd, level, optname, optval, optlen)
}

/// # Safety
///
/// `optval` must be writable for `*optlen` bytes and `optlen` valid.
pub unsafe fn getsockopt(
    fd: RawFd,
    level: libc::c_int,
    optname: libc::c_int,
    optval: *mut libc::c_void,
    optlen: *mut libc::socklen_t,
) -> libc::c_int {
    libc::getsockopt(fd, level, optname, optval, optlen)
}

/// Set `SO_RCVTIMEO` or `SO_SNDTIMEO`; `None` waits forever.
pub fn set_timeout(fd: RawFd, kind: TimeoutKind, timeout: Option<Duration>) -> libc::c_int {
    let d = timeout.unwrap_or(Duration::ZERO);
    let tv = libc::timeval {
        tv_sec: d.as_secs().min(libc::time_t::MAX as u64) as libc::time_t,
        tv_usec: d.subsec_micros() as libc::suseconds_t,
    };
    let optname = match kind {
        TimeoutKind::Recv => libc::SO_RCVTIMEO,
        TimeoutKind::Send => libc::SO_SNDTIMEO,
    };
    unsafe {
        setsockopt(
            fd,
            libc::SOL_SOCKET,
            optname,
            (&tv as *const libc::timeval).cast(),
            mem::size_of::<libc::timeval>() as libc::socklen_t,
        )
    }
}
