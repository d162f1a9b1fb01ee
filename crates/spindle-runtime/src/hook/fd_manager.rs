//! Per-descriptor bookkeeping for the hooked calls

use nix::fcntl::{fcntl, FcntlArg, OFlag};
use nix::sys::stat::{fstat, SFlag};
use std::fmt;
use std::os::fd::RawFd;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, OnceLock, PoisonError, RwLock};
use std::time::Duration;
use tracing::trace;

use super::TimeoutKind;

const NO_TIMEOUT: u64 = u64::MAX;

/// What the hooks know about one descriptor
///
/// Sockets are switched to `O_NONBLOCK` in the kernel on first sight; the
/// non-blocking mode the program asked for is tracked separately so the
/// hooks can keep emulating blocking calls.
pub struct FdCtx {
    fd: RawFd,
    is_init: bool,
    is_socket: bool,
    sys_nonblock: bool,
    user_nonblock: AtomicBool,
    closed: AtomicBool,
    recv_timeout: AtomicU64,
    send_timeout: AtomicU64,
}

impl FdCtx {
    pub fn new(fd: RawFd) -> Self {
        let (is_init, is_socket) = match fstat(fd) {
            Ok(st) => {
                let kind = SFlag::from_bits_truncate(st.st_mode) & SFlag::S_IFMT;
                (true, kind == SFlag::S_IFSOCK)
            }
            Err(_) => (false, false),
        };

        let mut sys_nonblock = false;
        if is_socket {
            if let Ok(bits) = fcntl(fd, FcntlArg::F_GETFL) {
                let flags = OFlag::from_bits_truncate(bits);
                sys_nonblock = flags.contains(OFlag::O_NONBLOCK)
                    || fcntl(fd, FcntlArg::F_SETFL(flags | OFlag::O_NONBLOCK)).is_ok();
            }
        }

        trace!(fd, is_init, is_socket, sys_nonblock, "fd registered");
        Self {
            fd,
            is_init,
            is_socket,
            sys_nonblock,
            user_nonblock: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            recv_timeout: AtomicU64::new(NO_TIMEOUT),
            send_timeout: AtomicU64::new(NO_TIMEOUT),
        }
    }

    #[inline]
    pub fn fd(&self) -> RawFd {
        self.fd
    }

    /// `fstat` succeeded when the context was created
    #[inline]
    pub fn is_init(&self) -> bool {
        self.is_init
    }

    #[inline]
    pub fn is_socket(&self) -> bool {
        self.is_socket
    }

    /// The runtime put the descriptor in non-blocking mode
    #[inline]
    pub fn sys_nonblock(&self) -> bool {
        self.sys_nonblock
    }

    /// The program asked for non-blocking mode
    #[inline]
    pub fn user_nonblock(&self) -> bool {
        self.user_nonblock.load(Ordering::Acquire)
    }

    pub fn set_user_nonblock(&self, on: bool) {
        self.user_nonblock.store(on, Ordering::Release);
    }

    #[inline]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub(crate) fn set_closed(&self) {
        self.closed.store(true, Ordering::Release);
    }

    fn slot(&self, kind: TimeoutKind) -> &AtomicU64 {
        match kind {
            TimeoutKind::Recv => &self.recv_timeout,
            TimeoutKind::Send => &self.send_timeout,
        }
    }

    /// Timeout in milliseconds, `None` to wait forever
    pub fn timeout(&self, kind: TimeoutKind) -> Option<u64> {
        let ms = self.slot(kind).load(Ordering::Acquire);
        (ms != NO_TIMEOUT).then_some(ms)
    }

    /// A zero duration means no timeout, matching `SO_RCVTIMEO`
    pub fn set_timeout(&self, kind: TimeoutKind, timeout: Option<Duration>) {
        let ms = match timeout {
            Some(d) if !d.is_zero() => u64::try_from(d.as_millis()).unwrap_or(NO_TIMEOUT - 1).max(1),
            _ => NO_TIMEOUT,
        };
        self.slot(kind).store(ms, Ordering::Release);
    }
}

impl fmt::Debug for FdCtx {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FdCtx")
            .field("fd", &self.fd)
            .field("socket", &self.is_socket)
            .field("sys_nonblock", &self.sys_nonblock)
            .field("user_nonblock", &self.user_nonblock())
            .field("closed", &self.is_closed())
            .field("recv_timeout", &self.timeout(TimeoutKind::Recv))
            .field("send_timeout", &self.timeout(TimeoutKind::Send))
            .finish()
    }
}

/// Process-wide table of [`FdCtx`], indexed by descriptor
pub struct FdManager {
    table: RwLock<Vec<Option<Arc<FdCtx>>>>,
}

impl FdManager {
    fn new(size: usize) -> Self {
        Self {
            table: RwLock::new(vec![None; size]),
        }
    }

    pub fn global() -> &'static FdManager {
        static GLOBAL: OnceLock<FdManager> = OnceLock::new();
        GLOBAL.get_or_init(|| FdManager::new(crate::config::global().fd_table_size))
    }

    /// Look up `fd`, creating its context when `auto_create` is set.
    pub fn get(&self, fd: RawFd, auto_create: bool) -> Option<Arc<FdCtx>> {
        let idx = usize::try_from(fd).ok()?;
        {
            let table = self.table.read().unwrap_or_else(PoisonError::into_inner);
            match table.get(idx) {
                Some(Some(ctx)) => return Some(ctx.clone()),
                _ if !auto_create => return None,
                _ => {}
            }
        }

        let mut table = self.table.write().unwrap_or_else(PoisonError::into_inner);
        if idx >= table.len() {
            table.resize((idx * 3 / 2).max(idx + 1), None);
        }
        Some(table[idx].get_or_insert_with(|| Arc::new(FdCtx::new(fd))).clone())
    }

    /// Probe a descriptor the kernel just handed out, replacing any entry
    /// left behind by a close that bypassed the hooks.
    pub fn register(&self, fd: RawFd) -> Option<Arc<FdCtx>> {
        let idx = usize::try_from(fd).ok()?;
        let ctx = Arc::new(FdCtx::new(fd));
        let mut table = self.table.write().unwrap_or_else(PoisonError::into_inner);
        if idx >= table.len() {
            table.resize((idx * 3 / 2).max(idx + 1), None);
        }
        table[idx] = Some(ctx.clone());
        Some(ctx)
    }

    /// Forget `fd`; a later `get(fd, true)` probes it afresh.
    pub fn del(&self, fd: RawFd) {
        let Ok(idx) = usize::try_from(fd) else {
            return;
        };
        let mut table = self.table.write().unwrap_or_else(PoisonError::into_inner);
        if let Some(slot) = table.get_mut(idx) {
            *slot = None;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{pipe, socketpair};
    use std::os::fd::AsRawFd;

    #[test]
    fn test_socket_forced_nonblocking() {
        let (a, _b) = socketpair();
        let ctx = FdCtx::new(a.as_raw_fd());
        assert!(ctx.is_init());
        assert!(ctx.is_socket());
        assert!(ctx.sys_nonblock());
        assert!(!ctx.user_nonblock());

        let flags = OFlag::from_bits_truncate(fcntl(a.as_raw_fd(), FcntlArg::F_GETFL).unwrap());
        assert!(flags.contains(OFlag::O_NONBLOCK));
    }

    #[test]
    fn test_pipe_is_not_a_socket() {
        let (r, _w) = pipe();
        let ctx = FdCtx::new(r.as_raw_fd());
        assert!(ctx.is_init());
        assert!(!ctx.is_socket());
        assert!(!ctx.sys_nonblock());

        let flags = OFlag::from_bits_truncate(fcntl(r.as_raw_fd(), FcntlArg::F_GETFL).unwrap());
        assert!(!flags.contains(OFlag::O_NONBLOCK));
    }

    #[test]
    fn test_bad_fd_is_uninit() {
        let ctx = FdCtx::new(1 << 20);
        assert!(!ctx.is_init());
        assert!(!ctx.is_socket());
    }

    #[test]
    fn test_timeouts() {
        let (a, _b) = socketpair();
        let ctx = FdCtx::new(a.as_raw_fd());
        assert_eq!(ctx.timeout(TimeoutKind::Recv), None);

        ctx.set_timeout(TimeoutKind::Recv, Some(Duration::from_millis(250)));
        assert_eq!(ctx.timeout(TimeoutKind::Recv), Some(250));
        assert_eq!(ctx.timeout(TimeoutKind::Send), None);

        ctx.set_timeout(TimeoutKind::Recv, Some(Duration::ZERO));
        assert_eq!(ctx.timeout(TimeoutKind::Recv), None);
    }

    #[test]
    fn test_table_get_and_del() {
        let manager = FdManager::new(2);
        let (a, _b) = socketpair();
        let fd = a.as_raw_fd();

        assert!(manager.get(fd, false).is_none());
        let ctx = manager.get(fd, true).unwrap();
        assert!(Arc::ptr_eq(&ctx, &manager.get(fd, false).unwrap()));
        assert!(manager.table.read().unwrap().len() > fd as usize);

        manager.del(fd);
        assert!(manager.get(fd, false).is_none());
        assert!(manager.get(-1, true).is_none());
    }
}
