//! Basic spindle example
//!
//! Runs fibers and callbacks on a scheduler whose calling thread joins the
//! pool, then exercises timers on an I/O manager.
//!
//! # Environment Variables
//!
//! - `SPINDLE_LOG=debug` - Set log level (error, warn, info, debug, trace)
//! - `SPINDLE_THREADS=4` - Threads for the I/O manager part

use spindle::{Fiber, IoManager, Schedule, Scheduler};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tracing::{debug, info};

// SPINDLE_LOG=debug cargo run -p spindle-basic
fn main() -> spindle::Result<()> {
    spindle::init_logging();
    println!("=== spindle Basic Example ===\n");

    // 3 threads, the caller being one of them
    let sched = Scheduler::new(3, true, "basic");
    sched.start()?;

    let completed = Arc::new(AtomicUsize::new(0));

    for i in 1..=3 {
        let c = completed.clone();
        let fiber = Fiber::new(
            move || {
                debug!("[fiber {}] started on {:?}", i, spindle::scheduler::worker_index());
                for j in 0..3 {
                    debug!("[fiber {}] iteration {}", i, j);
                    Fiber::yield_to_ready();
                }
                c.fetch_add(1, Ordering::SeqCst);
            },
            0,
            false,
        );
        println!("Scheduled fiber {} (ID={})", i, fiber.id());
        sched.schedule(fiber.into(), None);
    }

    // Hops from worker to worker
    let c = completed.clone();
    sched.schedule_fn(move || {
        let Some(sched) = Scheduler::current() else {
            return;
        };
        for target in [1, 2, 1] {
            sched.switch_to(Some(target));
            info!("[hopper] now on worker {:?}", spindle::scheduler::worker_index());
        }
        c.fetch_add(1, Ordering::SeqCst);
    });

    // Pinned to the caller thread, so it only runs once stop() lends it
    let c = completed.clone();
    sched.schedule(
        spindle::Task::call(move || {
            info!("[pinned] running on worker {:?}", spindle::scheduler::worker_index());
            c.fetch_add(1, Ordering::SeqCst);
        }),
        Some(0),
    );

    println!("\nStopping scheduler (caller thread drains its share)...\n");
    sched.stop();
    info!("{} task(s) completed", completed.load(Ordering::SeqCst));

    // Timers need an I/O manager
    let iom = IoManager::new(spindle::env_get("SPINDLE_THREADS", 2), false, "timers")?;
    let ticks = Arc::new(AtomicUsize::new(0));
    let t = ticks.clone();
    let ticker = iom.add_timer(
        100,
        move || {
            let n = t.fetch_add(1, Ordering::SeqCst) + 1;
            info!("[timer] tick {}", n);
        },
        true,
    );
    iom.add_timer(
        550,
        move || {
            if ticker.cancel() {
                info!("[timer] ticker cancelled");
            }
        },
        false,
    );
    iom.stop();
    println!("Ticker fired {} time(s)", ticks.load(Ordering::SeqCst));

    println!("\n=== Example Complete ===");
    Ok(())
}
