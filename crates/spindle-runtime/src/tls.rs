//! Thread-local runtime context
//!
//! Fibers migrate between worker threads, so a fiber that suspends on one
//! thread may resume on another. Every accessor here is `#[inline(never)]`
//! to keep the compiler from caching a thread-local address across a
//! context switch.

use crate::fiber::Fiber;
use crate::iomanager::IoManager;
use crate::scheduler::Schedule;
use spindle_core::constants::NO_WORKER;
use std::cell::{Cell, RefCell};
use std::ptr;
use std::sync::{Arc, Weak};

thread_local! {
    /// Fiber currently executing on this thread
    static CURRENT_FIBER: Cell<*const Fiber> = const { Cell::new(ptr::null()) };

    /// Fiber that scheduled fibers swap against (run loop context)
    static SCHEDULING_FIBER: Cell<*const Fiber> = const { Cell::new(ptr::null()) };

    /// Native context of this OS thread, created lazily
    static THREAD_MAIN_FIBER: RefCell<Option<Arc<Fiber>>> = const { RefCell::new(None) };

    /// Scheduler driving this thread
    static SCHEDULER: RefCell<Option<Weak<dyn Schedule>>> = const { RefCell::new(None) };

    /// I/O manager driving this thread
    static IOMANAGER: RefCell<Option<Weak<IoManager>>> = const { RefCell::new(None) };

    /// Worker index within the owning scheduler
    static WORKER_INDEX: Cell<usize> = const { Cell::new(NO_WORKER) };

    /// Syscall hooks active on this thread
    static HOOK_ENABLED: Cell<bool> = const { Cell::new(false) };
}

#[inline(never)]
pub(crate) fn current_fiber() -> *const Fiber {
    CURRENT_FIBER.with(|c| c.get())
}

#[inline(never)]
pub(crate) fn set_current_fiber(fiber: *const Fiber) {
    CURRENT_FIBER.with(|c| c.set(fiber));
}

#[inline(never)]
pub(crate) fn scheduling_fiber() -> *const Fiber {
    SCHEDULING_FIBER.with(|c| c.get())
}

#[inline(never)]
pub(crate) fn set_scheduling_fiber(fiber: *const Fiber) {
    SCHEDULING_FIBER.with(|c| c.set(fiber));
}

#[inline(never)]
pub(crate) fn thread_main_fiber_ptr() -> *const Fiber {
    THREAD_MAIN_FIBER.with(|c| c.borrow().as_ref().map_or(ptr::null(), Arc::as_ptr))
}

#[inline(never)]
pub(crate) fn set_thread_main_fiber(fiber: Arc<Fiber>) {
    THREAD_MAIN_FIBER.with(|c| *c.borrow_mut() = Some(fiber));
}

#[inline(never)]
pub(crate) fn scheduler() -> Option<Arc<dyn Schedule>> {
    SCHEDULER.with(|c| c.borrow().as_ref().and_then(Weak::upgrade))
}

#[inline(never)]
pub(crate) fn set_scheduler(sched: Option<Weak<dyn Schedule>>) {
    SCHEDULER.with(|c| *c.borrow_mut() = sched);
}

#[inline(never)]
pub(crate) fn iomanager() -> Option<Arc<IoManager>> {
    IOMANAGER.with(|c| c.borrow().as_ref().and_then(Weak::upgrade))
}

#[inline(never)]
pub(crate) fn set_iomanager(iom: Option<Weak<IoManager>>) {
    IOMANAGER.with(|c| *c.borrow_mut() = iom);
}

/// Worker index of this thread, `None` outside any scheduler
#[inline(never)]
pub fn worker_index() -> Option<usize> {
    let idx = WORKER_INDEX.with(|c| c.get());
    (idx != NO_WORKER).then_some(idx)
}

#[inline(never)]
pub(crate) fn set_worker_index(idx: usize) {
    WORKER_INDEX.with(|c| c.set(idx));
}

#[inline(never)]
pub(crate) fn hook_enabled() -> bool {
    HOOK_ENABLED.with(|c| c.get())
}

#[inline(never)]
pub(crate) fn set_hook_enabled(enabled: bool) {
    HOOK_ENABLED.with(|c| c.set(enabled));
}
