//! Hooked read and write family

use super::{do_io, TimeoutKind};
use socket2::SockAddr;
use spindle_core::Event;
use std::io::{IoSlice, IoSliceMut};
use std::os::fd::RawFd;

pub fn read(fd: RawFd, buf: &mut [u8]) -> isize {
    do_io(fd, "read", Event::READ, TimeoutKind::Recv, || unsafe {
        libc::read(fd, buf.as_mut_ptr().cast(), buf.len())
    })
}

pub fn readv(fd: RawFd, bufs: &mut [IoSliceMut<'_>]) -> isize {
    let count = bufs.len().min(libc::c_int::MAX as usize) as libc::c_int;
    do_io(fd, "readv", Event::READ, TimeoutKind::Recv, || unsafe {
        libc::readv(fd, bufs.as_mut_ptr().cast(), count)
    })
}

pub fn recv(fd: RawFd, buf: &mut [u8], flags: libc::c_int) -> isize {
    do_io(fd, "recv", Event::READ, TimeoutKind::Recv, || unsafe {
        libc::recv(fd, buf.as_mut_ptr().cast(), buf.len(), flags)
    })
}

/// `recvfrom`; the sender address is returned alongside the byte count.
pub fn recvfrom(fd: RawFd, buf: &mut [u8], flags: libc::c_int) -> (isize, Option<SockAddr>) {
    let mut from = None;
    let n = do_io(fd, "recvfrom", Event::READ, TimeoutKind::Recv, || {
        let res = unsafe {
            SockAddr::try_init(|storage, len| {
                let n = libc::recvfrom(fd, buf.as_mut_ptr().cast(), buf.len(), flags, storage.cast(), len);
                if n < 0 {
                    Err(std::io::Error::last_os_error())
                } else {
                    Ok(n)
                }
            })
        };
        match res {
            Ok((n, addr)) => {
                from = Some(addr);
                n
            }
            Err(_) => -1,
        }
    });
    (n, from)
}

/// `recvmsg`; `msg` carries the caller's iovecs and control buffer.
pub fn recvmsg(fd: RawFd, msg: &mut libc::msghdr, flags: libc::c_int) -> isize {
    do_io(fd, "recvmsg", Event::READ, TimeoutKind::Recv, || unsafe {
        libc::recvmsg(fd, msg, flags)
    })
}

pub fn write(fd: RawFd, buf: &[u8]) -> isize {
    do_io(fd, "write", Event::WRITE, TimeoutKind::Send, || unsafe {
        libc::write(fd, buf.as_ptr().cast(), buf.len())
    })
}

pub fn writev(fd: RawFd, bufs: &[IoSlice<'_>]) -> isize {
    let count = bufs.len().min(libc::c_int::MAX as usize) as libc::c_int;
    do_io(fd, "writev", Event::WRITE, TimeoutKind::Send, || unsafe {
        libc::writev(fd, bufs.as_ptr().cast(), count)
    })
}

pub fn send(fd: RawFd, buf: &[u8], flags: libc::c_int) -> isize {
    do_io(fd, "send", Event::WRITE, TimeoutKind::Send, || unsafe {
        libc::send(fd, buf.as_ptr().cast(), buf.len(), flags)
    })
}

pub fn sendto(fd: RawFd, buf: &[u8], flags: libc::c_int, to: &SockAddr) -> isize {
    do_io(fd, "sendto", Event::WRITE, TimeoutKind::Send, || unsafe {
        libc::sendto(fd, buf.as_ptr().cast(), buf.len(), flags, to.as_ptr(), to.len())
    })
}

pub fn sendmsg(fd: RawFd, msg: &libc::msghdr, flags: libc::c_int) -> isize {
    do_io(fd, "sendmsg", Event::WRITE, TimeoutKind::Send, || unsafe {
        libc::sendmsg(fd, msg, flags)
    })
}
