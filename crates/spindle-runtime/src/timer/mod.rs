//! Deadline-ordered timers
//!
//! Timers live in a set ordered by `(deadline_ms, id)`; the monotonically
//! increasing id breaks ties between timers sharing a deadline in insertion
//! order. The manager does not run callbacks itself: whoever drives it
//! (the I/O manager's idle loop) calls [`TimerManager::list_expired_cb`] and
//! schedules what comes back.
//!
//! ```text
//!   add_timer ──► order: {(50,2) (50,3) (100,1) (200,4)}     now = 60
//!                           └── expired ──┘
//!   list_expired_cb ──► [cb2, cb3]   recurring ones re-inserted at now + period
//! ```

mod clock;

pub use clock::{Clock, ManualClock, MonotonicClock};

use spindle_core::constants::CLOCK_ROLLOVER_MS;
use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::mem;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, OnceLock, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard, Weak};
use tracing::warn;

/// Timer callback; recurring timers call it once per period
pub type TimerCallback = Arc<dyn Fn() + Send + Sync + 'static>;

/// Notified when an insertion produces a new earliest deadline, so a
/// waiter blocked on the old deadline can recompute its sleep.
pub trait TimerListener: Send + Sync {
    fn on_timer_inserted_at_front(&self);
}

struct TimerEntry {
    next: u64,
    period: u64,
    recurring: bool,
    cb: TimerCallback,
}

#[derive(Default)]
struct TimerQueue {
    order: BTreeSet<(u64, u64)>,
    entries: HashMap<u64, TimerEntry>,
    previous_ms: u64,
}

struct TimerShared {
    queue: RwLock<TimerQueue>,
    /// A front notification is outstanding until the next `next_timer_ms`
    tickled: AtomicBool,
    next_id: AtomicU64,
    clock: Arc<dyn Clock>,
    listener: OnceLock<Weak<dyn TimerListener>>,
}

impl TimerShared {
    fn read(&self) -> RwLockReadGuard<'_, TimerQueue> {
        self.queue.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, TimerQueue> {
        self.queue.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Insert `key` into the order; true if the listener must be told
    fn link(&self, q: &mut TimerQueue, key: (u64, u64)) -> bool {
        q.order.insert(key);
        q.order.first() == Some(&key)
            && self
                .tickled
                .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
    }

    fn notify_front(&self) {
        if let Some(listener) = self.listener.get().and_then(Weak::upgrade) {
            listener.on_timer_inserted_at_front();
        }
    }
}

/// Ordered collection of deadline-triggered callbacks
pub struct TimerManager {
    shared: Arc<TimerShared>,
}

impl TimerManager {
    pub fn new() -> Self {
        Self::with_clock(Arc::new(MonotonicClock::new()))
    }

    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            shared: Arc::new(TimerShared {
                queue: RwLock::new(TimerQueue::default()),
                tickled: AtomicBool::new(false),
                next_id: AtomicU64::new(1),
                clock,
                listener: OnceLock::new(),
            }),
        }
    }

    /// Install the front-insertion listener. Only the first call wins.
    pub fn set_listener(&self, listener: Weak<dyn TimerListener>) -> bool {
        self.shared.listener.set(listener).is_ok()
    }

    #[inline]
    pub fn now_ms(&self) -> u64 {
        self.shared.clock.now_ms()
    }

    /// Fire `cb` after `ms` milliseconds, and every `ms` after that if
    /// `recurring`.
    pub fn add_timer<F>(&self, ms: u64, cb: F, recurring: bool) -> Timer
    where
        F: Fn() + Send + Sync + 'static,
    {
        let shared = &self.shared;
        let id = shared.next_id.fetch_add(1, Ordering::Relaxed);
        let next = shared.clock.now_ms().saturating_add(ms);
        let entry = TimerEntry {
            next,
            period: ms,
            recurring,
            cb: Arc::new(cb),
        };

        let at_front = {
            let mut guard = shared.write();
            let q = &mut *guard;
            q.entries.insert(id, entry);
            shared.link(q, (next, id))
        };
        if at_front {
            shared.notify_front();
        }

        Timer {
            id,
            shared: Arc::downgrade(shared),
        }
    }

    /// Like [`add_timer`](Self::add_timer), but `cb` only runs if `cond`
    /// can still be upgraded when the timer fires.
    pub fn add_condition_timer<F, T>(&self, ms: u64, cb: F, cond: Weak<T>, recurring: bool) -> Timer
    where
        F: Fn() + Send + Sync + 'static,
        T: ?Sized + Send + Sync + 'static,
    {
        self.add_timer(
            ms,
            move || {
                if cond.upgrade().is_some() {
                    cb();
                }
            },
            recurring,
        )
    }

    /// Milliseconds until the earliest deadline: `None` when no timer is
    /// pending, `Some(0)` when one is already overdue.
    ///
    /// Also re-arms the front-insertion notification.
    pub fn next_timer_ms(&self) -> Option<u64> {
        self.shared.tickled.store(false, Ordering::Release);
        let q = self.shared.read();
        let &(next, _) = q.order.first()?;
        Some(next.saturating_sub(self.shared.clock.now_ms()))
    }

    pub fn has_timer(&self) -> bool {
        !self.shared.read().order.is_empty()
    }

    /// Pop every expired timer and append its callback to `out`.
    ///
    /// Recurring timers are pushed back with deadline `now + period`.
    /// A clock that went backwards by more than an hour expires everything.
    pub fn list_expired_cb(&self, out: &mut Vec<TimerCallback>) {
        let now = self.shared.clock.now_ms();
        if self.shared.read().order.is_empty() {
            return;
        }

        let mut guard = self.shared.write();
        let q = &mut *guard;
        let Some(&(first, _)) = q.order.first() else {
            return;
        };

        let rollover = now < q.previous_ms && now < q.previous_ms.saturating_sub(CLOCK_ROLLOVER_MS);
        q.previous_ms = now;
        if rollover {
            warn!(now, pending = q.order.len(), "clock rolled back, expiring all timers");
        } else if first > now {
            return;
        }

        let expired = if rollover {
            mem::take(&mut q.order)
        } else {
            let later = q.order.split_off(&(now.saturating_add(1), 0));
            mem::replace(&mut q.order, later)
        };

        out.reserve(expired.len());
        for (_, id) in expired {
            let Some(entry) = q.entries.get_mut(&id) else {
                continue;
            };
            out.push(entry.cb.clone());
            if entry.recurring {
                entry.next = now.saturating_add(entry.period);
                q.order.insert((entry.next, id));
            } else {
                q.entries.remove(&id);
            }
        }
    }
}

impl Default for TimerManager {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for TimerManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TimerManager")
            .field("pending", &self.shared.read().order.len())
            .finish()
    }
}

/// Handle to a timer registered with a [`TimerManager`]
///
/// Operations on a timer that already fired (one-shot), was cancelled, or
/// whose manager is gone return `false`.
#[derive(Clone)]
pub struct Timer {
    id: u64,
    shared: Weak<TimerShared>,
}

impl Timer {
    pub fn cancel(&self) -> bool {
        let Some(shared) = self.shared.upgrade() else {
            return false;
        };
        let mut q = shared.write();
        match q.entries.remove(&self.id) {
            Some(entry) => {
                q.order.remove(&(entry.next, self.id));
                true
            }
            None => false,
        }
    }

    /// Re-arm at `now + period`, keeping the period
    pub fn refresh(&self) -> bool {
        let Some(shared) = self.shared.upgrade() else {
            return false;
        };
        let mut guard = shared.write();
        let q = &mut *guard;
        let Some(entry) = q.entries.get_mut(&self.id) else {
            return false;
        };
        q.order.remove(&(entry.next, self.id));
        entry.next = shared.clock.now_ms().saturating_add(entry.period);
        q.order.insert((entry.next, self.id));
        true
    }

    /// Change the period to `ms`, counting from now or from the original
    /// start of the current period.
    pub fn reset(&self, ms: u64, from_now: bool) -> bool {
        let Some(shared) = self.shared.upgrade() else {
            return false;
        };
        let at_front = {
            let mut guard = shared.write();
            let q = &mut *guard;
            let Some(entry) = q.entries.get_mut(&self.id) else {
                return false;
            };
            if ms == entry.period && !from_now {
                return true;
            }
            q.order.remove(&(entry.next, self.id));
            let start = if from_now {
                shared.clock.now_ms()
            } else {
                entry.next.saturating_sub(entry.period)
            };
            entry.period = ms;
            entry.next = start.saturating_add(ms);
            let key = (entry.next, self.id);
            shared.link(q, key)
        };
        if at_front {
            shared.notify_front();
        }
        true
    }
}

impl fmt::Debug for Timer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Timer").field("id", &self.id).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Mutex;

    fn manual() -> (Arc<ManualClock>, TimerManager) {
        let clock = Arc::new(ManualClock::new(0));
        let tm = TimerManager::with_clock(clock.clone());
        (clock, tm)
    }

    fn fire(tm: &TimerManager) -> usize {
        let mut cbs = Vec::new();
        tm.list_expired_cb(&mut cbs);
        for cb in &cbs {
            cb();
        }
        cbs.len()
    }

    #[test]
    fn test_deadline_order_with_tie_break() {
        let (clock, tm) = manual();
        let log = Arc::new(Mutex::new(Vec::new()));
        for (label, ms) in [("a", 100), ("b", 50), ("c", 50), ("d", 200)] {
            let log = log.clone();
            tm.add_timer(ms, move || log.lock().unwrap().push(label), false);
        }

        clock.advance(60);
        assert_eq!(fire(&tm), 2);
        assert_eq!(*log.lock().unwrap(), vec!["b", "c"]);
        assert_eq!(tm.next_timer_ms(), Some(40));
        assert!(tm.has_timer());
    }

    #[test]
    fn test_recurring_fires_each_period() {
        let (clock, tm) = manual();
        let hits = Arc::new(AtomicUsize::new(0));
        let h = hits.clone();
        tm.add_timer(10, move || { h.fetch_add(1, Ordering::SeqCst); }, true);

        for _ in 0..3 {
            clock.advance(10);
            assert_eq!(fire(&tm), 1);
        }
        assert_eq!(hits.load(Ordering::SeqCst), 3);
        assert!(tm.has_timer());
        assert_eq!(tm.next_timer_ms(), Some(10));
    }

    #[test]
    fn test_condition_timer_dropped_token() {
        let (clock, tm) = manual();
        let hits = Arc::new(AtomicUsize::new(0));

        let token = Arc::new(());
        let h = hits.clone();
        tm.add_condition_timer(10, move || { h.fetch_add(1, Ordering::SeqCst); }, Arc::downgrade(&token), false);
        drop(token);

        let alive = Arc::new(());
        let h = hits.clone();
        tm.add_condition_timer(10, move || { h.fetch_add(100, Ordering::SeqCst); }, Arc::downgrade(&alive), false);

        clock.advance(10);
        assert_eq!(fire(&tm), 2);
        assert_eq!(hits.load(Ordering::SeqCst), 100);
    }

    #[test]
    fn test_next_timer_ms() {
        let (clock, tm) = manual();
        assert_eq!(tm.next_timer_ms(), None);
        tm.add_timer(25, || {}, false);
        assert_eq!(tm.next_timer_ms(), Some(25));
        clock.advance(30);
        assert_eq!(tm.next_timer_ms(), Some(0));
    }

    #[test]
    fn test_cancel_after_fire_fails() {
        let (clock, tm) = manual();
        let t = tm.add_timer(5, || {}, false);
        let c = tm.add_timer(5, || {}, false);
        assert!(c.cancel());
        assert!(!c.cancel());

        clock.advance(5);
        assert_eq!(fire(&tm), 1);
        assert!(!t.cancel());
        assert!(!t.refresh());
        assert!(!t.reset(10, true));
        assert!(!tm.has_timer());
    }

    #[test]
    fn test_refresh_pushes_deadline() {
        let (clock, tm) = manual();
        let t = tm.add_timer(100, || {}, false);
        clock.advance(60);
        assert!(t.refresh());
        assert_eq!(tm.next_timer_ms(), Some(100));
        clock.advance(99);
        assert_eq!(fire(&tm), 0);
        clock.advance(1);
        assert_eq!(fire(&tm), 1);
    }

    #[test]
    fn test_reset_from_start_and_from_now() {
        let (clock, tm) = manual();
        let t = tm.add_timer(100, || {}, false);
        assert!(t.reset(100, false));
        assert!(t.reset(30, false));
        assert_eq!(tm.next_timer_ms(), Some(30));

        clock.advance(10);
        assert!(t.reset(50, true));
        assert_eq!(tm.next_timer_ms(), Some(50));
    }

    #[test]
    fn test_clock_rollback_expires_everything() {
        let hour = 60 * 60 * 1000;
        let clock = Arc::new(ManualClock::new(10 * hour));
        let tm = TimerManager::with_clock(clock.clone());
        tm.add_timer(1_000, || {}, false);
        tm.add_timer(hour, || {}, false);
        assert_eq!(fire(&tm), 0);

        clock.set(8 * hour);
        assert_eq!(fire(&tm), 2);
        assert!(!tm.has_timer());
    }

    struct FrontCounter(AtomicUsize);

    impl TimerListener for FrontCounter {
        fn on_timer_inserted_at_front(&self) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn test_front_insertion_notifies_once_per_wait() {
        let (_clock, tm) = manual();
        let counter = Arc::new(FrontCounter(AtomicUsize::new(0)));
        let weak: Weak<dyn TimerListener> = Arc::downgrade(&counter) as Weak<dyn TimerListener>;
        assert!(tm.set_listener(weak));

        tm.add_timer(100, || {}, false);
        assert_eq!(counter.0.load(Ordering::SeqCst), 1);
        // Still outstanding: no second notification
        tm.add_timer(50, || {}, false);
        assert_eq!(counter.0.load(Ordering::SeqCst), 1);

        tm.next_timer_ms();
        tm.add_timer(500, || {}, false);
        assert_eq!(counter.0.load(Ordering::SeqCst), 1);
        tm.add_timer(10, || {}, false);
        assert_eq!(counter.0.load(Ordering::SeqCst), 2);
    }
}
