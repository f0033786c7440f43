//! Minimal scheduler demo: callbacks and yielding fibers

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use weft::{winfo, Scheduler, SchedulerExt};

fn main() {
    weft::log::init();

    let sched = Arc::new(Scheduler::new(3, true, "basic"));
    sched.start();

    let done = Arc::new(AtomicUsize::new(0));
    for i in 0..8 {
        let done = Arc::clone(&done);
        sched.schedule(move || {
            winfo!("task {} on worker {}", i, weft::current_worker());
            weft::yield_now();
            winfo!("task {} resumed on worker {}", i, weft::current_worker());
            done.fetch_add(1, Ordering::SeqCst);
        });
    }

    sched.stop();
    winfo!(
        "completed {} tasks, live fibers: {}",
        done.load(Ordering::SeqCst),
        weft::total_fibers()
    );
}
