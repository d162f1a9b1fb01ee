//! Stackful coroutines
//!
//! A [`Fiber`] owns an mmap'd stack, a saved register context and a body
//! closure. Two switch protocols exist:
//!
//! - `resume` / `yield_*`: swap against the thread's scheduling fiber
//!   (the run loop). Used for every scheduled fiber.
//! - `call` / `back`: swap against the thread-main fiber. Used for the
//!   root fiber of a `use_caller` scheduler so the launching thread's own
//!   stack stays underneath it.
//!
//! Without a scheduler on the thread the scheduling fiber is the
//! thread-main fiber, so `resume` works standalone.

use crate::arch::{self, Context};
use crate::config;
use crate::memory::Stack;
use crate::tls;
use spindle_core::{FiberId, FiberState, Result, RuntimeError};
use std::any::Any;
use std::cell::UnsafeCell;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::ptr;
use std::sync::atomic::{AtomicBool, AtomicU8, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::{debug, error, trace};

/// Boxed fiber body
pub type FiberBody = Box<dyn FnOnce() + Send + 'static>;

static FIBER_COUNT: AtomicUsize = AtomicUsize::new(0);

/// A stackful coroutine
pub struct Fiber {
    id: FiberId,
    state: AtomicU8,
    /// Set while some thread is executing on this fiber's stack
    running: AtomicBool,
    ctx: UnsafeCell<Context>,
    /// `None` for thread-main fibers, which run on the OS thread stack
    stack: Option<Stack>,
    body: Mutex<Option<FiberBody>>,
    /// Finish with `back` (to thread-main) instead of swapping to the run loop
    use_caller: bool,
}

// `ctx` is only touched by the thread switching into or out of the fiber,
// which the `running` flag makes exclusive.
unsafe impl Send for Fiber {}
unsafe impl Sync for Fiber {}

impl Fiber {
    /// Create a fiber in `Init` state.
    ///
    /// `stack_size == 0` selects the configured default. A failed stack
    /// mapping aborts the process.
    pub fn new<F>(body: F, stack_size: usize, use_caller: bool) -> Arc<Fiber>
    where
        F: FnOnce() + Send + 'static,
    {
        Self::with_body(Box::new(body), stack_size, use_caller)
    }

    /// Same as [`Fiber::new`] for an already boxed body
    pub fn with_body(body: FiberBody, stack_size: usize, use_caller: bool) -> Arc<Fiber> {
        let size = if stack_size == 0 {
            config::global().stack_size
        } else {
            stack_size
        };
        let stack = match Stack::allocate(size) {
            Ok(stack) => stack,
            Err(e) => {
                error!(error = %e, "cannot continue without a fiber stack");
                std::process::abort();
            }
        };

        let fiber = Arc::new(Fiber {
            id: FiberId::next(),
            state: AtomicU8::new(FiberState::Init as u8),
            running: AtomicBool::new(false),
            ctx: UnsafeCell::new(Context::default()),
            stack: Some(stack),
            body: Mutex::new(Some(body)),
            use_caller,
        });
        FIBER_COUNT.fetch_add(1, Ordering::Relaxed);
        unsafe { fiber.init_context() };
        trace!(fiber = %fiber.id, size, "fiber created");
        fiber
    }

    /// The implicit fiber standing for an OS thread's native context
    fn thread_main() -> Fiber {
        FIBER_COUNT.fetch_add(1, Ordering::Relaxed);
        Fiber {
            id: FiberId::THREAD_MAIN,
            state: AtomicU8::new(FiberState::Exec as u8),
            running: AtomicBool::new(true),
            ctx: UnsafeCell::new(Context::default()),
            stack: None,
            body: Mutex::new(None),
            use_caller: false,
        }
    }

    /// # Safety
    ///
    /// The fiber must not be executing.
    unsafe fn init_context(&self) {
        if let Some(stack) = &self.stack {
            arch::init_context(
                &mut *self.ctx.get(),
                stack.top(),
                fiber_entry,
                self as *const Fiber as usize,
            );
        }
    }

    #[inline]
    pub fn id(&self) -> FiberId {
        self.id
    }

    #[inline]
    pub fn state(&self) -> FiberState {
        FiberState::from(self.state.load(Ordering::Acquire))
    }

    #[inline]
    pub(crate) fn set_state(&self, state: FiberState) {
        self.state.store(state as u8, Ordering::Release);
    }

    /// Some thread is still on this fiber's stack
    #[inline]
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Body still present (not started, or reset)
    pub fn has_body(&self) -> bool {
        self.body_slot().is_some()
    }

    fn body_slot(&self) -> MutexGuard<'_, Option<FiberBody>> {
        self.body.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Reuse this fiber's stack for a new body.
    ///
    /// Only valid in `Init`, `Term` or `Except`.
    pub fn reset<F>(&self, body: F) -> Result<()>
    where
        F: FnOnce() + Send + 'static,
    {
        self.reset_body(Box::new(body))
    }

    pub fn reset_body(&self, body: FiberBody) -> Result<()> {
        let found = self.state();
        if self.stack.is_none() || !found.can_reset() || self.running.load(Ordering::Acquire) {
            return Err(RuntimeError::InvalidState {
                expected: "INIT|TERM|EXCEPT",
                found,
            });
        }
        *self.body_slot() = Some(body);
        unsafe { self.init_context() };
        self.set_state(FiberState::Init);
        Ok(())
    }

    /// Switch from this thread's scheduling fiber into this fiber.
    ///
    /// Returns once the fiber yields or finishes. A fiber that yielded with
    /// `yield_to_hold` is left in `Hold`, one that used `yield_to_ready` in
    /// `Ready`.
    pub fn resume(&self) {
        self.switch_from(scheduling_target());
    }

    /// Switch from the thread-main fiber into this fiber.
    pub fn call(&self) {
        self.switch_from(ensure_thread_main());
    }

    fn switch_from(&self, from: *const Fiber) {
        if ptr::eq(from, self) {
            error!(fiber = %self.id, "fiber switching into itself");
            std::process::abort();
        }
        self.enter();
        let from = unsafe { &*from };
        from.set_state(FiberState::Hold);
        tls::set_current_fiber(self);
        unsafe { arch::context_switch(from.ctx.get(), self.ctx.get()) };

        // Back on `from`; `self` is off-CPU with its context saved.
        from.set_state(FiberState::Exec);
        self.running.store(false, Ordering::Release);
        let _ = self.state.compare_exchange(
            FiberState::Exec as u8,
            FiberState::Hold as u8,
            Ordering::AcqRel,
            Ordering::Acquire,
        );
    }

    fn enter(&self) {
        if self.running.swap(true, Ordering::AcqRel) {
            error!(fiber = %self.id, "fiber resumed while executing on another thread");
            std::process::abort();
        }
        let prev = FiberState::from(self.state.swap(FiberState::Exec as u8, Ordering::AcqRel));
        if prev.is_terminated() {
            error!(fiber = %self.id, state = %prev, "terminated fiber resumed");
            std::process::abort();
        }
    }

    /// Switch from this (running) fiber back to the scheduling fiber
    fn swap_out(&self) {
        let to = unsafe { &*scheduling_target() };
        tls::set_current_fiber(to);
        unsafe { arch::context_switch(self.ctx.get(), to.ctx.get()) };
    }

    /// Switch from this (running) fiber back to the thread-main fiber
    fn back(&self) {
        let to = tls::thread_main_fiber_ptr();
        if to.is_null() {
            error!(fiber = %self.id, "back() without a thread-main fiber");
            std::process::abort();
        }
        tls::set_current_fiber(to);
        unsafe { arch::context_switch(self.ctx.get(), (*to).ctx.get()) };
    }

    fn run_body(&self) {
        let body = self.body_slot().take();
        let outcome = match body {
            Some(body) => panic::catch_unwind(AssertUnwindSafe(body)),
            None => Ok(()),
        };
        match outcome {
            Ok(()) => self.set_state(FiberState::Term),
            Err(payload) => {
                error!(
                    fiber = %self.id,
                    reason = panic_message(payload.as_ref()),
                    "fiber body panicked"
                );
                self.set_state(FiberState::Except);
            }
        }
    }

    fn finish(&self) -> ! {
        if self.use_caller {
            self.back();
        } else {
            self.swap_out();
        }
        error!(fiber = %self.id, "finished fiber was switched back into");
        std::process::abort();
    }

    /// The fiber running on this thread, creating the thread-main fiber on
    /// first use.
    pub fn current() -> Arc<Fiber> {
        let mut cur = tls::current_fiber();
        if cur.is_null() {
            cur = ensure_thread_main();
        }
        // Every fiber pointer stored in TLS comes from a live `Arc`.
        unsafe {
            Arc::increment_strong_count(cur);
            Arc::from_raw(cur)
        }
    }

    /// Id of the running fiber, `FiberId::THREAD_MAIN` outside fibers
    pub fn current_id() -> FiberId {
        let cur = tls::current_fiber();
        if cur.is_null() {
            FiberId::THREAD_MAIN
        } else {
            unsafe { (*cur).id }
        }
    }

    /// True when running on a fiber that has somewhere to yield to
    pub fn can_yield() -> bool {
        current_yieldable().is_some()
    }

    /// Mark the running fiber `Ready` and switch to the scheduling fiber.
    ///
    /// No-op outside a yieldable fiber.
    pub fn yield_to_ready() {
        if let Some(cur) = current_yieldable() {
            let cur = unsafe { &*cur };
            cur.set_state(FiberState::Ready);
            cur.swap_out();
        }
    }

    /// Switch to the scheduling fiber; the resumer parks this fiber in
    /// `Hold` until something reschedules it.
    ///
    /// No-op outside a yieldable fiber.
    pub fn yield_to_hold() {
        if let Some(cur) = current_yieldable() {
            unsafe { (*cur).swap_out() };
        }
    }

    /// Number of fibers alive in the process, thread-main fibers included
    pub fn total() -> usize {
        FIBER_COUNT.load(Ordering::Relaxed)
    }
}

impl Drop for Fiber {
    fn drop(&mut self) {
        FIBER_COUNT.fetch_sub(1, Ordering::Relaxed);
        let state = self.state();
        if self.stack.is_some() && !state.can_reset() {
            debug!(fiber = %self.id, %state, "fiber dropped while suspended");
        }
    }
}

impl fmt::Debug for Fiber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Fiber")
            .field("id", &self.id)
            .field("state", &self.state())
            .field("use_caller", &self.use_caller)
            .finish()
    }
}

extern "C" fn fiber_entry(arg: usize) -> ! {
    // Kept alive by whoever resumed it for as long as it runs.
    let fiber = unsafe { &*(arg as *const Fiber) };
    fiber.run_body();
    fiber.finish()
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.as_str()
    } else {
        "<non-string panic payload>"
    }
}

fn ensure_thread_main() -> *const Fiber {
    let existing = tls::thread_main_fiber_ptr();
    if !existing.is_null() {
        return existing;
    }
    let main = Arc::new(Fiber::thread_main());
    let ptr = Arc::as_ptr(&main);
    tls::set_thread_main_fiber(main);
    if tls::current_fiber().is_null() {
        tls::set_current_fiber(ptr);
    }
    ptr
}

fn scheduling_target() -> *const Fiber {
    let sched = tls::scheduling_fiber();
    if sched.is_null() {
        ensure_thread_main()
    } else {
        sched
    }
}

fn current_yieldable() -> Option<*const Fiber> {
    let cur = tls::current_fiber();
    if cur.is_null()
        || ptr::eq(cur, tls::scheduling_fiber())
        || ptr::eq(cur, tls::thread_main_fiber_ptr())
    {
        None
    } else {
        Some(cur)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicBool;

    const STACK: usize = 64 * 1024;

    #[test]
    fn test_run_to_term() {
        let ran = Arc::new(AtomicBool::new(false));
        let flag = ran.clone();
        let fiber = Fiber::new(move || flag.store(true, Ordering::SeqCst), STACK, false);

        assert_eq!(fiber.state(), FiberState::Init);
        assert!(fiber.has_body());
        fiber.resume();
        assert!(ran.load(Ordering::SeqCst));
        assert_eq!(fiber.state(), FiberState::Term);
        assert!(!fiber.has_body());
    }

    #[test]
    fn test_yield_to_hold_and_resume() {
        let trace = Arc::new(Mutex::new(Vec::new()));
        let t = trace.clone();
        let fiber = Fiber::new(
            move || {
                t.lock().unwrap().push(1);
                Fiber::yield_to_hold();
                t.lock().unwrap().push(2);
                Fiber::yield_to_hold();
                t.lock().unwrap().push(3);
            },
            STACK,
            false,
        );

        fiber.resume();
        assert_eq!(fiber.state(), FiberState::Hold);
        assert_eq!(*trace.lock().unwrap(), vec![1]);
        fiber.resume();
        assert_eq!(*trace.lock().unwrap(), vec![1, 2]);
        fiber.resume();
        assert_eq!(fiber.state(), FiberState::Term);
        assert_eq!(*trace.lock().unwrap(), vec![1, 2, 3]);
    }

    #[test]
    fn test_yield_to_ready() {
        let fiber = Fiber::new(Fiber::yield_to_ready, STACK, false);
        fiber.resume();
        assert_eq!(fiber.state(), FiberState::Ready);
        fiber.resume();
        assert_eq!(fiber.state(), FiberState::Term);
    }

    #[test]
    fn test_panic_sets_except() {
        let fiber = Fiber::new(|| panic!("boom"), STACK, false);
        fiber.resume();
        assert_eq!(fiber.state(), FiberState::Except);
        // The resuming context keeps running normally
        assert!(Fiber::current().id().is_thread_main());
    }

    #[test]
    fn test_reset_reuses_stack() {
        let count = Arc::new(AtomicUsize::new(0));
        let c = count.clone();
        let fiber = Fiber::new(move || { c.fetch_add(1, Ordering::SeqCst); }, STACK, false);
        fiber.resume();

        let c = count.clone();
        fiber.reset(move || { c.fetch_add(10, Ordering::SeqCst); }).unwrap();
        assert_eq!(fiber.state(), FiberState::Init);
        fiber.resume();
        assert_eq!(fiber.state(), FiberState::Term);
        assert_eq!(count.load(Ordering::SeqCst), 11);
    }

    #[test]
    fn test_reset_rejects_suspended() {
        let fiber = Fiber::new(Fiber::yield_to_hold, STACK, false);
        fiber.resume();
        assert_eq!(fiber.state(), FiberState::Hold);
        assert!(fiber.reset(|| {}).is_err());
        fiber.resume();
        assert!(fiber.reset(|| {}).is_ok());
    }

    #[test]
    fn test_single_exec_per_thread() {
        let main = Fiber::current();
        let seen = Arc::new(Mutex::new(None));
        let s = seen.clone();
        let fiber = Fiber::new(
            move || {
                let me = Fiber::current();
                *s.lock().unwrap() = Some((me.state(), main.state(), me.id()));
            },
            STACK,
            false,
        );
        fiber.resume();

        let (inner, outer, id) = seen.lock().unwrap().take().unwrap();
        assert_eq!(inner, FiberState::Exec);
        assert_eq!(outer, FiberState::Hold);
        assert_eq!(id, fiber.id());
        assert_eq!(Fiber::current().state(), FiberState::Exec);
    }

    #[test]
    fn test_call_and_back() {
        let fiber = Fiber::new(|| {}, STACK, true);
        fiber.call();
        assert_eq!(fiber.state(), FiberState::Term);
    }

    #[test]
    fn test_current_id_outside_fiber() {
        std::thread::spawn(|| {
            assert!(Fiber::current_id().is_thread_main());
            assert!(!Fiber::can_yield());
            // Yielding off-fiber does nothing
            Fiber::yield_to_hold();
            Fiber::yield_to_ready();

            let main = Fiber::current();
            assert!(main.id().is_thread_main());
            assert_eq!(main.state(), FiberState::Exec);
            assert!(Arc::ptr_eq(&main, &Fiber::current()));
            assert!(!Fiber::can_yield());
        })
        .join()
        .unwrap();
    }
}
