//! N:M fiber scheduler
//!
//! A scheduler owns a pool of OS threads and one task queue. Each thread
//! runs [`run`]: pull the first runnable entry, resume it, put it back if
//! it yielded `Ready`, and fall into the idle fiber when nothing is
//! runnable.
//!
//! ```text
//!   schedule(task, thread) ──► queue: [ (fiber|callback, affinity) ... ]
//!                                           │ scan under lock
//!          ┌────────────────────────────────┼──────────────────────┐
//!          ▼                                ▼                      ▼
//!   worker 0 run loop               worker 1 run loop     caller (use_caller)
//!   resume / idle fiber             resume / idle fiber   root fiber in stop()
//! ```
//!
//! [`Schedule`] is the extension seam: the plain [`Scheduler`] idles by
//! yielding, the I/O manager overrides `idle`, `tickle` and `stopping`.

use crate::fiber::{Fiber, FiberBody};
use crate::tls;
use spindle_core::{FiberState, Result, RuntimeError};
use std::collections::VecDeque;
use std::fmt;
use std::mem;
use std::ptr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::thread::{self, JoinHandle};
use tracing::{debug, error, info, trace, warn};

/// Unit of work accepted by a scheduler
pub enum Task {
    /// Resume an existing fiber
    Fiber(Arc<Fiber>),
    /// Run a callback on a scratch fiber
    Call(FiberBody),
}

impl Task {
    pub fn call<F>(f: F) -> Self
    where
        F: FnOnce() + Send + 'static,
    {
        Task::Call(Box::new(f))
    }
}

impl From<Arc<Fiber>> for Task {
    fn from(fiber: Arc<Fiber>) -> Self {
        Task::Fiber(fiber)
    }
}

impl fmt::Debug for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Task::Fiber(fiber) => write!(f, "Task::Fiber({})", fiber.id()),
            Task::Call(_) => f.write_str("Task::Call"),
        }
    }
}

struct ScheduleEntry {
    task: Task,
    /// Worker index the task is pinned to
    thread: Option<usize>,
}

/// State shared by every scheduler flavour
pub struct SchedulerCore {
    name: String,
    queue: Mutex<VecDeque<ScheduleEntry>>,
    threads: Mutex<Vec<JoinHandle<()>>>,
    /// Threads spawned by `start`, excluding the caller
    thread_count: usize,
    active: AtomicUsize,
    idle: AtomicUsize,
    stopping: AtomicBool,
    auto_stop: AtomicBool,
    /// Run loop of the calling thread in `use_caller` mode
    root_fiber: Option<Arc<Fiber>>,
    root_thread: Option<usize>,
    stack_size: usize,
}

impl SchedulerCore {
    /// `threads` counts the calling thread when `use_caller` is set.
    ///
    /// In `use_caller` mode this also binds the calling thread to the
    /// scheduler as worker 0; its run loop executes inside `stop`.
    pub fn new(
        name: &str,
        threads: usize,
        use_caller: bool,
        stack_size: usize,
        this: Weak<dyn Schedule>,
    ) -> Self {
        let threads = threads.max(1);
        let (thread_count, root_fiber, root_thread) = if use_caller {
            Fiber::current();
            let weak = this.clone();
            let root = Fiber::new(
                move || {
                    if let Some(sched) = weak.upgrade() {
                        run(sched, 0);
                    }
                },
                stack_size,
                true,
            );
            tls::set_scheduling_fiber(Arc::as_ptr(&root));
            tls::set_scheduler(Some(this));
            tls::set_worker_index(0);
            (threads - 1, Some(root), Some(0))
        } else {
            (threads, None, None)
        };

        Self {
            name: name.to_string(),
            queue: Mutex::new(VecDeque::new()),
            threads: Mutex::new(Vec::with_capacity(thread_count)),
            thread_count,
            active: AtomicUsize::new(0),
            idle: AtomicUsize::new(0),
            stopping: AtomicBool::new(true),
            auto_stop: AtomicBool::new(false),
            root_fiber,
            root_thread,
            stack_size,
        }
    }

    fn queue(&self) -> MutexGuard<'_, VecDeque<ScheduleEntry>> {
        self.queue.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn threads(&self) -> MutexGuard<'_, Vec<JoinHandle<()>>> {
        self.threads.lock().unwrap_or_else(PoisonError::into_inner)
    }

    #[inline]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Worker indices this scheduler runs on, caller included
    pub fn thread_ids(&self) -> std::ops::Range<usize> {
        let first = usize::from(self.root_thread.is_some());
        0..first + self.thread_count
    }

    #[inline]
    pub fn active_count(&self) -> usize {
        self.active.load(Ordering::Acquire)
    }

    #[inline]
    pub fn idle_count(&self) -> usize {
        self.idle.load(Ordering::Acquire)
    }

    #[inline]
    pub fn has_idle_threads(&self) -> bool {
        self.idle_count() > 0
    }

    #[inline]
    pub fn stack_size(&self) -> usize {
        self.stack_size
    }

    pub fn queued(&self) -> usize {
        self.queue().len()
    }

    /// Stop requested, queue drained and no thread running a task
    pub fn base_stopping(&self) -> bool {
        self.auto_stop.load(Ordering::Acquire)
            && self.stopping.load(Ordering::Acquire)
            && self.queue().is_empty()
            && self.active.load(Ordering::Acquire) == 0
    }

    /// Append tasks; true if the queue was empty before
    fn enqueue(&self, tasks: impl IntoIterator<Item = (Task, Option<usize>)>) -> bool {
        let mut q = self.queue();
        let was_empty = q.is_empty();
        q.extend(tasks.into_iter().map(|(task, thread)| ScheduleEntry { task, thread }));
        was_empty && !q.is_empty()
    }

    /// Remove the first entry runnable on worker `me`.
    ///
    /// The second value says another worker should be woken: an entry
    /// pinned elsewhere was skipped, or work remains behind the one taken.
    fn take_task(&self, me: usize) -> (Option<Task>, bool) {
        let mut q = self.queue();
        let mut tickle_me = false;
        let mut i = 0;
        while i < q.len() {
            let entry = &q[i];
            if entry.thread.is_some_and(|t| t != me) {
                tickle_me = true;
                i += 1;
                continue;
            }
            if let Task::Fiber(fiber) = &entry.task {
                if fiber.state() == FiberState::Exec || fiber.is_running() {
                    i += 1;
                    continue;
                }
            }
            if let Some(entry) = q.remove(i) {
                self.active.fetch_add(1, Ordering::AcqRel);
                tickle_me |= i < q.len();
                return (Some(entry.task), tickle_me);
            }
        }
        (None, tickle_me)
    }
}

impl fmt::Debug for SchedulerCore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Scheduler")
            .field("name", &self.name)
            .field("threads", &self.thread_count)
            .field("use_caller", &self.root_fiber.is_some())
            .field("active", &self.active_count())
            .field("idle", &self.idle_count())
            .field("queued", &self.queued())
            .field("stopping", &self.stopping.load(Ordering::Relaxed))
            .finish()
    }
}

impl Drop for SchedulerCore {
    fn drop(&mut self) {
        if let Some(root) = &self.root_fiber {
            if ptr::eq(tls::scheduling_fiber(), Arc::as_ptr(root)) {
                tls::set_scheduling_fiber(ptr::null());
            }
        }
    }
}

/// Scheduler behaviour
///
/// Implementors embed a [`SchedulerCore`] and may override the idle
/// strategy, the wake-up signal and the stop condition.
pub trait Schedule: Send + Sync + 'static {
    fn core(&self) -> &SchedulerCore;

    /// Wake an idle worker
    fn tickle(&self) {
        trace!(scheduler = %self.core().name(), "tickle");
    }

    /// True once the run loops may exit
    fn stopping(&self) -> bool {
        self.core().base_stopping()
    }

    /// Body of each worker's idle fiber; returning ends that worker
    fn idle(&self) {
        debug!(scheduler = %self.core().name(), "idle");
        while !self.stopping() {
            thread::yield_now();
            Fiber::yield_to_hold();
        }
    }

    /// Called on every thread as its run loop starts
    fn on_thread_start(&self) {}

    /// Enqueue a task, optionally pinned to a worker index
    fn schedule(&self, task: Task, thread: Option<usize>) {
        if self.core().enqueue([(task, thread)]) {
            self.tickle();
        }
    }

    /// Enqueue many unpinned tasks under one lock
    fn schedule_batch(&self, tasks: Vec<Task>) {
        if self.core().enqueue(tasks.into_iter().map(|t| (t, None))) {
            self.tickle();
        }
    }

    fn schedule_fn<F>(&self, f: F)
    where
        F: FnOnce() + Send + 'static,
        Self: Sized,
    {
        self.schedule(Task::call(f), None);
    }

    /// Move the running fiber onto this scheduler, on `thread` if given.
    fn switch_to(&self, thread: Option<usize>) {
        if let Some(cur) = tls::scheduler() {
            let same = ptr::addr_eq(Arc::as_ptr(&cur), self as *const Self);
            if same && (thread.is_none() || thread == tls::worker_index()) {
                return;
            }
        }
        if !Fiber::can_yield() {
            warn!(scheduler = %self.core().name(), "switch_to outside a fiber");
            return;
        }
        self.schedule(Task::Fiber(Fiber::current()), thread);
        Fiber::yield_to_hold();
    }
}

/// Scheduler driving the current thread
pub fn current() -> Option<Arc<dyn Schedule>> {
    tls::scheduler()
}

/// Worker index of the current thread
pub fn worker_index() -> Option<usize> {
    tls::worker_index()
}

/// Moves the running fiber onto another scheduler for a scope.
///
/// On drop the fiber goes back to whichever scheduler was driving it when
/// the guard was made.
#[must_use = "the fiber moves back when the guard is dropped"]
pub struct SchedulerSwitcher {
    caller: Option<Arc<dyn Schedule>>,
}

impl SchedulerSwitcher {
    pub fn new(target: Option<&dyn Schedule>) -> Self {
        let caller = current();
        if let Some(target) = target {
            target.switch_to(None);
        }
        Self { caller }
    }
}

impl Drop for SchedulerSwitcher {
    fn drop(&mut self) {
        if let Some(caller) = self.caller.take() {
            caller.switch_to(None);
        }
    }
}

/// Spawn the worker threads. Calling it again while running is a no-op.
pub fn start(sched: Arc<dyn Schedule>) -> Result<()> {
    let core = sched.core();
    let mut threads = core.threads();
    if !core.stopping.load(Ordering::Acquire) {
        return Ok(());
    }
    core.stopping.store(false, Ordering::Release);

    let first = usize::from(core.root_fiber.is_some());
    for index in first..first + core.thread_count {
        let worker = sched.clone();
        let handle = thread::Builder::new()
            .name(format!("{}_{}", core.name, index))
            .spawn(move || run(worker, index))
            .map_err(RuntimeError::ThreadSpawn)?;
        threads.push(handle);
    }
    info!(scheduler = %core.name, threads = core.thread_count, use_caller = first == 1, "started");
    Ok(())
}

/// Drain the queue and join every worker. Idempotent.
///
/// In `use_caller` mode the calling thread runs its share of the work
/// here, so it must be the thread that created the scheduler.
pub fn stop(sched: Arc<dyn Schedule>) {
    let core = sched.core();
    core.auto_stop.store(true, Ordering::Release);
    if let Some(root) = &core.root_fiber {
        if core.thread_count == 0 && matches!(root.state(), FiberState::Term | FiberState::Init) {
            core.stopping.store(true, Ordering::Release);
            if sched.stopping() {
                info!(scheduler = %core.name, "stopped");
                return;
            }
        }
    }

    core.stopping.store(true, Ordering::Release);
    for _ in 0..core.thread_count {
        sched.tickle();
    }

    if let Some(root) = &core.root_fiber {
        sched.tickle();
        if !root.state().is_terminated() && !sched.stopping() {
            let on_caller = tls::scheduler()
                .is_some_and(|cur| ptr::addr_eq(Arc::as_ptr(&cur), Arc::as_ptr(&sched)));
            if on_caller {
                root.call();
            } else {
                warn!(scheduler = %core.name, "stop() called off the caller thread, caller share skipped");
            }
        }
        if root.state().is_terminated() && ptr::eq(tls::scheduling_fiber(), Arc::as_ptr(root)) {
            tls::set_scheduling_fiber(ptr::null());
        }
    }

    let handles = mem::take(&mut *core.threads());
    for handle in handles {
        if handle.join().is_err() {
            error!(scheduler = %core.name, "worker thread panicked");
        }
    }
    info!(scheduler = %core.name, "stopped");
}

/// Worker run loop
fn run(sched: Arc<dyn Schedule>, index: usize) {
    let core = sched.core();
    tls::set_scheduler(Some(Arc::downgrade(&sched)));
    tls::set_worker_index(index);
    if core.root_thread != Some(index) {
        let main = Fiber::current();
        tls::set_scheduling_fiber(Arc::as_ptr(&main));
    }
    sched.on_thread_start();
    debug!(scheduler = %core.name, index, "run loop entered");

    let idle_fiber = {
        let sched = sched.clone();
        Fiber::new(move || sched.idle(), core.stack_size, false)
    };
    let mut cb_fiber: Option<Arc<Fiber>> = None;

    loop {
        let (task, tickle_me) = core.take_task(index);
        if tickle_me {
            sched.tickle();
        }

        match task {
            Some(Task::Fiber(fiber)) => {
                if !fiber.state().is_terminated() {
                    fiber.resume();
                    if fiber.state() == FiberState::Ready {
                        sched.schedule(Task::Fiber(fiber), None);
                    }
                }
                core.active.fetch_sub(1, Ordering::AcqRel);
            }
            Some(Task::Call(body)) => {
                let fiber = match cb_fiber.take() {
                    Some(fiber) if fiber.state().can_reset() => match fiber.reset_body(body) {
                        Ok(()) => fiber,
                        Err(e) => {
                            error!(scheduler = %core.name, error = %e, "scratch fiber reset failed");
                            core.active.fetch_sub(1, Ordering::AcqRel);
                            continue;
                        }
                    },
                    _ => Fiber::with_body(body, core.stack_size, false),
                };
                fiber.resume();
                match fiber.state() {
                    FiberState::Ready => sched.schedule(Task::Fiber(fiber), None),
                    state if state.is_terminated() => cb_fiber = Some(fiber),
                    // Parked: whoever captured it reschedules it
                    _ => {}
                }
                core.active.fetch_sub(1, Ordering::AcqRel);
            }
            None => {
                if idle_fiber.state().is_terminated() {
                    debug!(scheduler = %core.name, index, "idle fiber finished");
                    break;
                }
                core.idle.fetch_add(1, Ordering::AcqRel);
                idle_fiber.resume();
                core.idle.fetch_sub(1, Ordering::AcqRel);
            }
        }
    }
}

/// Scheduler whose idle workers simply yield
pub struct Scheduler {
    core: SchedulerCore,
}

impl Scheduler {
    /// `threads` includes the calling thread when `use_caller` is set.
    pub fn new(threads: usize, use_caller: bool, name: &str) -> Arc<Self> {
        Arc::new_cyclic(|weak: &Weak<Scheduler>| {
            let this: Weak<dyn Schedule> = weak.clone();
            Scheduler {
                core: SchedulerCore::new(name, threads, use_caller, 0, this),
            }
        })
    }

    /// Scheduler of any flavour driving the current thread
    pub fn current() -> Option<Arc<dyn Schedule>> {
        current()
    }

    pub fn start(self: &Arc<Self>) -> Result<()> {
        start(self.clone())
    }

    pub fn stop(self: &Arc<Self>) {
        stop(self.clone())
    }
}

impl Schedule for Scheduler {
    fn core(&self) -> &SchedulerCore {
        &self.core
    }
}

impl fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(&self.core, f)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::wait_until;
    use std::collections::HashSet;

    #[test]
    fn test_thousand_callbacks_on_four_workers() {
        let sched = Scheduler::new(4, false, "pool");
        sched.start().unwrap();

        let done = Arc::new(AtomicUsize::new(0));
        let inflight = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let workers = Arc::new(Mutex::new(HashSet::new()));
        for _ in 0..1000 {
            let (done, inflight, peak, workers) =
                (done.clone(), inflight.clone(), peak.clone(), workers.clone());
            sched.schedule_fn(move || {
                let now = inflight.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                workers.lock().unwrap().insert(worker_index());
                std::hint::black_box((0..1_000).sum::<u64>());
                inflight.fetch_sub(1, Ordering::SeqCst);
                done.fetch_add(1, Ordering::SeqCst);
            });
        }
        sched.stop();

        assert_eq!(done.load(Ordering::SeqCst), 1000);
        assert!(peak.load(Ordering::SeqCst) <= 4);
        let workers = workers.lock().unwrap();
        assert!(workers.iter().all(|w| matches!(w, Some(i) if *i < 4)));
        assert_eq!(sched.core().active_count(), 0);
    }

    #[test]
    fn test_use_caller_runs_work_in_stop() {
        let sched = Scheduler::new(1, true, "caller");
        sched.start().unwrap();

        let me = thread::current().id();
        let ran = Arc::new(Mutex::new(Vec::new()));
        for i in 0..10 {
            let ran = ran.clone();
            sched.schedule_fn(move || ran.lock().unwrap().push((i, thread::current().id())));
        }
        assert!(ran.lock().unwrap().is_empty());

        sched.stop();
        let ran = ran.lock().unwrap();
        assert_eq!(ran.len(), 10);
        assert!(ran.iter().all(|(_, id)| *id == me));
        assert_eq!(ran.iter().map(|(i, _)| *i).collect::<Vec<_>>(), (0..10).collect::<Vec<_>>());
    }

    #[test]
    fn test_stop_is_idempotent() {
        let pool = Scheduler::new(2, false, "idem-pool");
        pool.start().unwrap();
        pool.stop();
        pool.stop();

        let caller = Scheduler::new(2, true, "idem-caller");
        caller.start().unwrap();
        let hits = Arc::new(AtomicUsize::new(0));
        let h = hits.clone();
        caller.schedule_fn(move || { h.fetch_add(1, Ordering::SeqCst); });
        caller.stop();
        caller.stop();
        assert_eq!(hits.load(Ordering::SeqCst), 1);

        let never_started = Scheduler::new(1, false, "idle");
        never_started.stop();
    }

    #[test]
    fn test_ready_fiber_is_requeued() {
        let sched = Scheduler::new(2, false, "ready");
        sched.start().unwrap();

        let steps = Arc::new(AtomicUsize::new(0));
        let s = steps.clone();
        let fiber = Fiber::new(
            move || {
                for _ in 0..3 {
                    s.fetch_add(1, Ordering::SeqCst);
                    Fiber::yield_to_ready();
                }
            },
            0,
            false,
        );
        sched.schedule(fiber.clone().into(), None);
        sched.stop();

        assert_eq!(steps.load(Ordering::SeqCst), 3);
        assert_eq!(fiber.state(), FiberState::Term);
    }

    #[test]
    fn test_held_fiber_waits_for_reschedule() {
        let sched = Scheduler::new(2, false, "hold");
        sched.start().unwrap();

        let fiber = Fiber::new(Fiber::yield_to_hold, 0, false);
        sched.schedule(fiber.clone().into(), None);
        assert!(wait_until(|| fiber.state() == FiberState::Hold));

        sched.schedule(fiber.clone().into(), None);
        assert!(wait_until(|| fiber.state() == FiberState::Term));
        sched.stop();
    }

    #[test]
    fn test_affinity_pins_worker() {
        let sched = Scheduler::new(3, false, "pinned");
        sched.start().unwrap();

        let seen = Arc::new(Mutex::new(Vec::new()));
        for _ in 0..50 {
            let seen = seen.clone();
            sched.schedule(Task::call(move || seen.lock().unwrap().push(worker_index())), Some(1));
        }
        sched.stop();

        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 50);
        assert!(seen.iter().all(|w| *w == Some(1)));
    }

    #[test]
    fn test_switch_to_moves_fiber() {
        let sched = Scheduler::new(3, false, "switch");
        sched.start().unwrap();

        let seen = Arc::new(Mutex::new(Vec::new()));
        let s = seen.clone();
        let target = sched.clone();
        sched.schedule(
            Task::call(move || {
                target.switch_to(Some(2));
                s.lock().unwrap().push(worker_index());
                target.switch_to(Some(0));
                s.lock().unwrap().push(worker_index());
            }),
            Some(1),
        );
        assert!(wait_until(|| seen.lock().unwrap().len() == 2));
        sched.stop();

        assert_eq!(*seen.lock().unwrap(), vec![Some(2), Some(0)]);
    }

    fn running_on(sched: &Arc<Scheduler>) -> bool {
        current().is_some_and(|cur| ptr::addr_eq(Arc::as_ptr(&cur), Arc::as_ptr(sched)))
    }

    #[test]
    fn test_switcher_returns_to_caller() {
        let home = Scheduler::new(2, false, "home");
        let away = Scheduler::new(2, false, "away");
        home.start().unwrap();
        away.start().unwrap();

        let seen = Arc::new(Mutex::new(Vec::new()));
        let (s, h, a) = (seen.clone(), home.clone(), away.clone());
        home.schedule_fn(move || {
            {
                let _guard = SchedulerSwitcher::new(Some(a.as_ref()));
                s.lock().unwrap().push(("away", running_on(&a)));
            }
            s.lock().unwrap().push(("home", running_on(&h)));
        });
        assert!(wait_until(|| seen.lock().unwrap().len() == 2));
        home.stop();
        away.stop();

        assert_eq!(*seen.lock().unwrap(), vec![("away", true), ("home", true)]);
    }

    #[test]
    fn test_debug_dump() {
        let sched = Scheduler::new(2, false, "dump");
        let dump = format!("{:?}", sched);
        assert!(dump.contains("dump"));
        assert!(dump.contains("threads: 2"));
        assert_eq!(sched.core().thread_ids(), 0..2);
    }
}
