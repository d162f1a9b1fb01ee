//! Epoll-driven I/O manager
//!
//! [`IoManager`] is a scheduler whose idle fibers block in `epoll_wait`
//! instead of spinning. Each registered `(fd, event)` pair stores the task
//! to wake and the scheduler to wake it on; readiness, cancellation and
//! timer expiry all funnel back into `schedule`.
//!
//! Registrations are edge-triggered and one-shot: once an event fires it
//! is removed from the interest set and must be added again.
//!
//! ```text
//!   add_event(fd, READ, task) ─► epoll_ctl(ADD|MOD, EPOLLET|mask)
//!
//!   idle fiber:
//!     epoll_wait(min(next timer, max_timeout))
//!       ├─ tickle pipe readable ──► drain
//!       ├─ expired timers ────────► schedule_batch(callbacks)
//!       └─ fd ready ──────────────► rearm leftover mask, schedule(task)
//!     yield_to_hold ─► run loop picks up the new work
//! ```

use crate::config::{self, RuntimeConfig};
use crate::fiber::{Fiber, FiberBody};
use crate::scheduler::{self, Schedule, SchedulerCore, Task};
use crate::timer::{Timer, TimerListener, TimerManager};
use crate::tls;
use spindle_core::{Event, Result, RuntimeError};
use std::fmt;
use std::io;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock, Weak};
use tracing::{debug, error, trace, warn};

const EPOLLET: u32 = libc::EPOLLET as u32;
const EPOLLIN: u32 = libc::EPOLLIN as u32;
const EPOLLOUT: u32 = libc::EPOLLOUT as u32;
const EPOLLERR: u32 = libc::EPOLLERR as u32;
const EPOLLHUP: u32 = libc::EPOLLHUP as u32;

/// Pending wake-up: the task and the scheduler it goes back to
type Wakeup = (Option<Weak<dyn Schedule>>, Task);

#[derive(Default)]
struct EventContext {
    scheduler: Option<Weak<dyn Schedule>>,
    task: Option<Task>,
}

#[derive(Default)]
struct FdEvents {
    events: Event,
    read: EventContext,
    write: EventContext,
}

impl FdEvents {
    fn slot(&mut self, event: Event) -> &mut EventContext {
        if event == Event::READ {
            &mut self.read
        } else {
            &mut self.write
        }
    }

    /// Clear `event` and hand back what was waiting on it
    fn trigger(&mut self, event: Event) -> Option<Wakeup> {
        self.events -= event;
        let slot = self.slot(event);
        let scheduler = slot.scheduler.take();
        slot.task.take().map(|task| (scheduler, task))
    }
}

/// Per-descriptor registration state
#[derive(Default)]
struct FdContext {
    events: Mutex<FdEvents>,
}

impl FdContext {

    fn lock(&self) -> MutexGuard<'_, FdEvents> {
        self.events.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn op_name(op: libc::c_int) -> &'static str {
    match op {
        libc::EPOLL_CTL_ADD => "ADD",
        libc::EPOLL_CTL_MOD => "MOD",
        libc::EPOLL_CTL_DEL => "DEL",
        _ => "?",
    }
}

fn cvt(ret: libc::c_int) -> io::Result<libc::c_int> {
    if ret < 0 {
        Err(io::Error::last_os_error())
    } else {
        Ok(ret)
    }
}

/// Scheduler with epoll readiness and timers
pub struct IoManager {
    core: SchedulerCore,
    timers: TimerManager,
    epfd: OwnedFd,
    tickle_read: OwnedFd,
    tickle_write: OwnedFd,
    pending: AtomicUsize,
    contexts: RwLock<Vec<Arc<FdContext>>>,
    config: RuntimeConfig,
    this: Weak<IoManager>,
}

impl IoManager {
    /// Create and start an I/O manager using the global configuration.
    pub fn new(threads: usize, use_caller: bool, name: &str) -> Result<Arc<Self>> {
        Self::with_config(config::global().clone().threads(threads), use_caller, name)
    }

    /// Create and start an I/O manager.
    ///
    /// With `use_caller` the calling thread counts as one of
    /// `config.threads` and does its share of the work inside [`stop`](Self::stop).
    pub fn with_config(config: RuntimeConfig, use_caller: bool, name: &str) -> Result<Arc<Self>> {
        config.validate()?;

        let epfd = unsafe { OwnedFd::from_raw_fd(cvt(libc::epoll_create1(libc::EPOLL_CLOEXEC))?) };
        let mut fds = [0; 2];
        cvt(unsafe { libc::pipe2(fds.as_mut_ptr(), libc::O_NONBLOCK | libc::O_CLOEXEC) })?;
        let (tickle_read, tickle_write) =
            unsafe { (OwnedFd::from_raw_fd(fds[0]), OwnedFd::from_raw_fd(fds[1])) };
        epoll_ctl(&epfd, libc::EPOLL_CTL_ADD, tickle_read.as_raw_fd(), EPOLLIN | EPOLLET)?;

        let table = config.fd_table_size;
        let iom = Arc::new_cyclic(|weak: &Weak<IoManager>| {
            let this: Weak<dyn Schedule> = weak.clone();
            IoManager {
                core: SchedulerCore::new(name, config.threads, use_caller, config.stack_size, this),
                timers: TimerManager::new(),
                epfd,
                tickle_read,
                tickle_write,
                pending: AtomicUsize::new(0),
                contexts: RwLock::new((0..table).map(|_| Arc::default()).collect()),
                config,
                this: weak.clone(),
            }
        });

        let listener: Weak<dyn TimerListener> = iom.this.clone();
        iom.timers.set_listener(listener);
        if use_caller {
            tls::set_iomanager(Some(iom.this.clone()));
        }

        scheduler::start(iom.clone())?;
        debug!(iomanager = %name, epfd = iom.epfd.as_raw_fd(), "created");
        Ok(iom)
    }

    /// I/O manager driving the current thread
    pub fn current() -> Option<Arc<IoManager>> {
        tls::iomanager()
    }

    pub fn start(self: &Arc<Self>) -> Result<()> {
        scheduler::start(self.clone())
    }

    /// Wait for every registration and timer to drain, then join workers.
    pub fn stop(self: &Arc<Self>) {
        scheduler::stop(self.clone())
    }

    #[inline]
    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    #[inline]
    pub fn timer_manager(&self) -> &TimerManager {
        &self.timers
    }

    pub fn add_timer<F>(&self, ms: u64, cb: F, recurring: bool) -> Timer
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.timers.add_timer(ms, cb, recurring)
    }

    pub fn add_condition_timer<F, T>(&self, ms: u64, cb: F, cond: Weak<T>, recurring: bool) -> Timer
    where
        F: Fn() + Send + Sync + 'static,
        T: ?Sized + Send + Sync + 'static,
    {
        self.timers.add_condition_timer(ms, cb, cond, recurring)
    }

    /// Registered `(fd, event)` pairs not yet fired, cancelled or deleted
    #[inline]
    pub fn pending_event_count(&self) -> usize {
        self.pending.load(Ordering::Acquire)
    }

    fn context(&self, fd: RawFd, create: bool) -> Option<Arc<FdContext>> {
        let idx = usize::try_from(fd).ok()?;
        {
            let table = self.contexts.read().unwrap_or_else(PoisonError::into_inner);
            if let Some(ctx) = table.get(idx) {
                return Some(ctx.clone());
            }
        }
        if !create {
            return None;
        }
        let mut table = self.contexts.write().unwrap_or_else(PoisonError::into_inner);
        if idx >= table.len() {
            let len = (idx * 3 / 2).max(idx + 1);
            let start = table.len();
            table.extend((start..len).map(|_| Arc::default()));
            trace!(iomanager = %self.core.name(), len, "fd table grown");
        }
        Some(table[idx].clone())
    }

    fn ctl(&self, op: libc::c_int, fd: RawFd, events: u32) -> Result<()> {
        epoll_ctl(&self.epfd, op, fd, events)
    }

    /// Register interest in `event` on `fd`.
    ///
    /// When it fires, `cb` runs on the current scheduler (this manager if
    /// the caller is not on one); without `cb` the calling fiber is
    /// rescheduled instead and is expected to `yield_to_hold` right after.
    pub fn add_event(&self, fd: RawFd, event: Event, cb: Option<FiberBody>) -> Result<()> {
        if event != Event::READ && event != Event::WRITE {
            return Err(io::Error::new(io::ErrorKind::InvalidInput, "add_event takes exactly one of READ or WRITE").into());
        }
        if cb.is_none() && !Fiber::can_yield() {
            return Err(io::Error::new(io::ErrorKind::InvalidInput, "add_event without callback outside a fiber").into());
        }
        let ctx = self
            .context(fd, true)
            .ok_or_else(|| io::Error::from_raw_os_error(libc::EBADF))?;

        let mut state = ctx.lock();
        if state.events.intersects(event) {
            error!(fd, %event, registered = %state.events, "event already registered");
            return Err(RuntimeError::EventAlreadyRegistered { fd, event });
        }

        let op = if state.events.is_empty() {
            libc::EPOLL_CTL_ADD
        } else {
            libc::EPOLL_CTL_MOD
        };
        self.ctl(op, fd, EPOLLET | (state.events | event).bits())?;

        self.pending.fetch_add(1, Ordering::AcqRel);
        state.events |= event;
        let fallback: Weak<dyn Schedule> = self.this.clone();
        let slot = state.slot(event);
        slot.scheduler = Some(scheduler::current().map_or(fallback, |s| Arc::downgrade(&s)));
        slot.task = Some(match cb {
            Some(cb) => Task::Call(cb),
            None => Task::Fiber(Fiber::current()),
        });
        Ok(())
    }

    /// Drop a registration without waking its task.
    pub fn del_event(&self, fd: RawFd, event: Event) -> bool {
        let Some(ctx) = self.context(fd, false) else {
            return false;
        };
        let mut state = ctx.lock();
        if !state.events.intersects(event) {
            return false;
        }
        let left = state.events - event;
        if self.ctl(Self::rearm_op(left), fd, EPOLLET | left.bits()).is_err() {
            return false;
        }
        let removed = state.events & event;
        for e in [Event::READ, Event::WRITE] {
            if removed.contains(e) {
                *state.slot(e) = EventContext::default();
                self.pending.fetch_sub(1, Ordering::AcqRel);
            }
        }
        state.events = left;
        true
    }

    /// Drop a registration and wake its task as if the event had fired.
    pub fn cancel_event(&self, fd: RawFd, event: Event) -> bool {
        let Some(ctx) = self.context(fd, false) else {
            return false;
        };
        let mut state = ctx.lock();
        if !state.events.intersects(event) {
            return false;
        }
        let left = state.events - event;
        if self.ctl(Self::rearm_op(left), fd, EPOLLET | left.bits()).is_err() {
            return false;
        }
        let wakes = self.fire(&mut state, event);
        drop(state);
        self.dispatch(wakes);
        true
    }

    /// Deregister `fd` and wake every task waiting on it.
    pub fn cancel_all(&self, fd: RawFd) -> bool {
        let Some(ctx) = self.context(fd, false) else {
            return false;
        };
        let mut state = ctx.lock();
        if state.events.is_empty() {
            return false;
        }
        if self.ctl(libc::EPOLL_CTL_DEL, fd, 0).is_err() {
            return false;
        }
        let all = state.events;
        let wakes = self.fire(&mut state, all);
        drop(state);
        self.dispatch(wakes);
        true
    }

    fn rearm_op(left: Event) -> libc::c_int {
        if left.is_empty() {
            libc::EPOLL_CTL_DEL
        } else {
            libc::EPOLL_CTL_MOD
        }
    }

    fn fire(&self, state: &mut FdEvents, events: Event) -> Vec<Wakeup> {
        let mut wakes = Vec::with_capacity(2);
        for e in [Event::READ, Event::WRITE] {
            if events.contains(e) && state.events.contains(e) {
                wakes.extend(state.trigger(e));
                self.pending.fetch_sub(1, Ordering::AcqRel);
            }
        }
        wakes
    }

    fn dispatch(&self, wakes: Vec<Wakeup>) {
        for (sched, task) in wakes {
            match sched.and_then(|w| w.upgrade()) {
                Some(sched) => sched.schedule(task, None),
                None => warn!(iomanager = %self.core.name(), ?task, "target scheduler gone, wake-up dropped"),
            }
        }
    }

    fn drain_tickle(&self) {
        let mut buf = [0u8; 256];
        loop {
            let n = unsafe { libc::read(self.tickle_read.as_raw_fd(), buf.as_mut_ptr().cast(), buf.len()) };
            if n <= 0 {
                break;
            }
        }
    }

    fn handle_ready(&self, fd: RawFd, revents: u32) {
        let Some(ctx) = self.context(fd, false) else {
            return;
        };
        let mut state = ctx.lock();
        let mut revents = revents;
        if revents & (EPOLLERR | EPOLLHUP) != 0 {
            revents |= (EPOLLIN | EPOLLOUT) & state.events.bits();
        }
        let fired = Event::from_bits_truncate(revents) & state.events;
        if fired.is_empty() {
            return;
        }

        let left = state.events - fired;
        if self.ctl(Self::rearm_op(left), fd, EPOLLET | left.bits()).is_err() {
            return;
        }
        let wakes = self.fire(&mut state, fired);
        drop(state);
        self.dispatch(wakes);
    }
}

fn epoll_ctl(epfd: &OwnedFd, op: libc::c_int, fd: RawFd, events: u32) -> Result<()> {
    let mut ev = libc::epoll_event {
        events,
        u64: fd as u64,
    };
    let ret = unsafe { libc::epoll_ctl(epfd.as_raw_fd(), op, fd, &mut ev) };
    if ret < 0 {
        let source = io::Error::last_os_error();
        error!(fd, op = op_name(op), events, error = %source, "epoll_ctl failed");
        return Err(RuntimeError::Epoll {
            op: op_name(op),
            fd,
            source,
        });
    }
    Ok(())
}

impl Schedule for IoManager {
    fn core(&self) -> &SchedulerCore {
        &self.core
    }

    /// Write one byte to the tickle pipe if some thread is parked in
    /// `epoll_wait`.
    fn tickle(&self) {
        if !self.core.has_idle_threads() {
            return;
        }
        let n = unsafe { libc::write(self.tickle_write.as_raw_fd(), b"T".as_ptr().cast(), 1) };
        if n != 1 {
            let err = io::Error::last_os_error();
            if err.kind() != io::ErrorKind::WouldBlock {
                warn!(iomanager = %self.core.name(), error = %err, "tickle write failed");
            }
        }
    }

    fn stopping(&self) -> bool {
        !self.timers.has_timer() && self.pending_event_count() == 0 && self.core.base_stopping()
    }

    fn idle(&self) {
        debug!(iomanager = %self.core.name(), "idle");
        let max_events = self.config.max_events;
        let cap = u64::try_from(self.config.max_timeout.as_millis()).unwrap_or(u64::MAX).min(i32::MAX as u64);
        let mut events = vec![libc::epoll_event { events: 0, u64: 0 }; max_events];
        let mut expired = Vec::new();

        loop {
            if self.stopping() {
                debug!(iomanager = %self.core.name(), "idle exit");
                break;
            }

            let timeout = self.timers.next_timer_ms().map_or(cap, |ms| ms.min(cap));
            let n = loop {
                let ret = unsafe {
                    libc::epoll_wait(
                        self.epfd.as_raw_fd(),
                        events.as_mut_ptr(),
                        max_events as libc::c_int,
                        timeout as libc::c_int,
                    )
                };
                if ret >= 0 {
                    break ret as usize;
                }
                let err = io::Error::last_os_error();
                if err.raw_os_error() != Some(libc::EINTR) {
                    error!(iomanager = %self.core.name(), error = %err, "epoll_wait failed");
                    break 0;
                }
            };

            self.timers.list_expired_cb(&mut expired);
            if !expired.is_empty() {
                let tasks = expired.drain(..).map(|cb| Task::call(move || cb())).collect();
                self.schedule_batch(tasks);
            }

            for ev in &events[..n] {
                let (revents, data) = (ev.events, ev.u64);
                let fd = data as RawFd;
                if fd == self.tickle_read.as_raw_fd() {
                    self.drain_tickle();
                    continue;
                }
                self.handle_ready(fd, revents);
            }

            Fiber::yield_to_hold();
        }
    }

    fn on_thread_start(&self) {
        tls::set_iomanager(Some(self.this.clone()));
        if self.config.hook_enable {
            tls::set_hook_enabled(true);
        }
    }
}

impl TimerListener for IoManager {
    fn on_timer_inserted_at_front(&self) {
        self.tickle();
    }
}

impl fmt::Debug for IoManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IoManager")
            .field("scheduler", &self.core)
            .field("epfd", &self.epfd.as_raw_fd())
            .field("pending", &self.pending_event_count())
            .field("timers", &self.timers)
            .finish()
    }
}

impl Drop for IoManager {
    fn drop(&mut self) {
        let pending = self.pending_event_count();
        if pending > 0 {
            warn!(iomanager = %self.core.name(), pending, "dropped with registered events");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{raw_write, socketpair};
    use std::sync::mpsc;
    use std::time::Duration;

    fn quick(threads: usize) -> RuntimeConfig {
        RuntimeConfig::new()
            .threads(threads)
            .max_timeout(Duration::from_millis(50))
    }

    #[test]
    fn test_duplicate_registration_rejected() {
        let iom = IoManager::with_config(quick(1), true, "dup").unwrap();
        let (a, _b) = socketpair();
        let fd = a.as_raw_fd();

        iom.add_event(fd, Event::READ, Some(Box::new(|| {}))).unwrap();
        let err = iom.add_event(fd, Event::READ, Some(Box::new(|| {}))).unwrap_err();
        assert!(matches!(err, RuntimeError::EventAlreadyRegistered { event, .. } if event == Event::READ));
        assert_eq!(iom.pending_event_count(), 1);

        assert!(iom.del_event(fd, Event::READ));
        assert!(!iom.del_event(fd, Event::READ));
        assert_eq!(iom.pending_event_count(), 0);
        iom.stop();
    }

    #[test]
    fn test_cancel_all_fires_both_directions() {
        let iom = IoManager::with_config(quick(1), true, "cancel-all").unwrap();
        let (a, _b) = socketpair();
        let fd = a.as_raw_fd();
        let hits = Arc::new(AtomicUsize::new(0));

        for event in [Event::READ, Event::WRITE] {
            let hits = hits.clone();
            iom.add_event(fd, event, Some(Box::new(move || { hits.fetch_add(1, Ordering::SeqCst); })))
                .unwrap();
        }
        assert_eq!(iom.pending_event_count(), 2);
        assert!(iom.cancel_all(fd));
        assert!(!iom.cancel_all(fd));
        assert_eq!(iom.pending_event_count(), 0);

        iom.stop();
        assert_eq!(hits.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_cancel_event_wakes_one() {
        let iom = IoManager::with_config(quick(1), true, "cancel-one").unwrap();
        let (a, _b) = socketpair();
        let fd = a.as_raw_fd();
        let log = Arc::new(Mutex::new(Vec::new()));

        for (event, tag) in [(Event::READ, "read"), (Event::WRITE, "write")] {
            let log = log.clone();
            iom.add_event(fd, event, Some(Box::new(move || log.lock().unwrap().push(tag))))
                .unwrap();
        }
        assert!(iom.cancel_event(fd, Event::WRITE));
        assert_eq!(iom.pending_event_count(), 1);
        assert!(iom.del_event(fd, Event::READ));

        iom.stop();
        assert_eq!(*log.lock().unwrap(), vec!["write"]);
    }

    #[test]
    fn test_readiness_runs_callback() {
        let iom = IoManager::with_config(quick(2), false, "ready").unwrap();
        let (a, b) = socketpair();
        let (tx, rx) = mpsc::channel();

        iom.add_event(a.as_raw_fd(), Event::READ, Some(Box::new(move || tx.send(()).unwrap())))
            .unwrap();
        assert!(rx.recv_timeout(Duration::from_millis(100)).is_err());

        raw_write(&b, b"x");
        rx.recv_timeout(Duration::from_secs(2)).unwrap();
        assert_eq!(iom.pending_event_count(), 0);
        iom.stop();
    }

    #[test]
    fn test_fiber_parks_until_readable() {
        let iom = IoManager::with_config(quick(2), false, "park").unwrap();
        let (a, b) = socketpair();
        let (tx, rx) = mpsc::channel();
        let fd = a.as_raw_fd();

        iom.schedule_fn(move || {
            let iom = IoManager::current().unwrap();
            iom.add_event(fd, Event::READ, None).unwrap();
            drop(iom);
            Fiber::yield_to_hold();
            let mut buf = [0u8; 8];
            let n = unsafe { libc::read(fd, buf.as_mut_ptr().cast(), buf.len()) };
            tx.send(buf[..n as usize].to_vec()).unwrap();
        });

        std::thread::sleep(Duration::from_millis(50));
        raw_write(&b, b"ping");
        assert_eq!(rx.recv_timeout(Duration::from_secs(2)).unwrap(), b"ping");
        iom.stop();
        drop(a);
    }

    #[test]
    fn test_timer_fires_on_worker() {
        let iom = IoManager::with_config(quick(1), false, "timer").unwrap();
        let (tx, rx) = mpsc::channel();
        let tx = Mutex::new(tx);

        iom.add_timer(
            20,
            move || {
                let _ = tx.lock().unwrap().send(std::thread::current().name().map(String::from));
            },
            false,
        );
        let name = rx.recv_timeout(Duration::from_secs(2)).unwrap();
        assert_eq!(name.as_deref(), Some("timer_0"));
        iom.stop();
    }

    #[test]
    fn test_stop_waits_for_timers() {
        let iom = IoManager::with_config(quick(1), false, "drain").unwrap();
        let hits = Arc::new(AtomicUsize::new(0));
        let h = hits.clone();
        iom.add_timer(30, move || { h.fetch_add(1, Ordering::SeqCst); }, false);
        iom.stop();
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_fd_table_grows() {
        let iom = IoManager::with_config(quick(1).fd_table_size(2), true, "grow").unwrap();
        let (a, _b) = socketpair();
        let fd = a.as_raw_fd();
        assert!(fd >= 2);

        iom.add_event(fd, Event::WRITE, Some(Box::new(|| {}))).unwrap();
        let len = iom.contexts.read().unwrap().len();
        assert_eq!(len, (fd as usize * 3 / 2).max(fd as usize + 1));
        assert!(iom.del_event(fd, Event::WRITE));
        iom.stop();
    }

    #[test]
    fn test_rejects_invalid_config() {
        let err = IoManager::with_config(quick(0), false, "bad").unwrap_err();
        assert!(matches!(err, RuntimeError::Config(_)));
    }
}
