//! Hooked sleeps: park the fiber on a timer instead of the thread

use super::is_enabled;
use crate::fiber::Fiber;
use crate::iomanager::IoManager;
use crate::scheduler::{Schedule, Task};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

fn sleep_for(d: Duration) {
    if is_enabled() && Fiber::can_yield() {
        if let Some(iom) = IoManager::current() {
            let fiber = Mutex::new(Some(Fiber::current()));
            let weak = Arc::downgrade(&iom);
            let ms = u64::try_from(d.as_millis()).unwrap_or(u64::MAX);
            iom.add_timer(
                ms,
                move || {
                    let parked = fiber.lock().unwrap_or_else(PoisonError::into_inner).take();
                    if let (Some(iom), Some(fiber)) = (weak.upgrade(), parked) {
                        iom.schedule(Task::Fiber(fiber), None);
                    }
                },
                false,
            );
            drop(iom);
            Fiber::yield_to_hold();
            return;
        }
    }
    std::thread::sleep(d);
}

pub fn sleep(seconds: u32) -> u32 {
    sleep_for(Duration::from_secs(u64::from(seconds)));
    0
}

pub fn usleep(usec: u64) -> libc::c_int {
    sleep_for(Duration::from_micros(usec));
    0
}

/// Never interrupted, so `rem` is always zeroed on success.
pub fn nanosleep(req: &libc::timespec, rem: Option<&mut libc::timespec>) -> libc::c_int {
    if req.tv_sec < 0 || !(0..1_000_000_000).contains(&req.tv_nsec) {
        nix::errno::Errno::EINVAL.set();
        return -1;
    }
    sleep_for(Duration::new(req.tv_sec as u64, req.tv_nsec as u32));
    if let Some(rem) = rem {
        rem.tv_sec = 0;
        rem.tv_nsec = 0;
    }
    0
}
