//! Timer demo: one-shot, recurring and hooked sleep

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use weft::{winfo, IoManager, SchedulerExt};

fn main() {
    weft::log::init();

    let iom = IoManager::new(2, false, "timers");

    iom.timers()
        .add_timer(100, || winfo!("one-shot fired after 100 ms"), false);

    let ticks = Arc::new(AtomicUsize::new(0));
    let t = Arc::clone(&ticks);
    let ticker = iom.timers().add_timer(
        200,
        move || {
            winfo!("tick {}", t.fetch_add(1, Ordering::SeqCst) + 1);
        },
        true,
    );

    iom.schedule(|| {
        winfo!("sleeping 1 s without holding a worker");
        weft::hook::sleep(1);
        winfo!("awake");
    });

    std::thread::sleep(Duration::from_millis(1100));
    // A live recurring timer keeps the reactor from stopping
    ticker.cancel();
    iom.stop();
    winfo!("done after {} ticks", ticks.load(Ordering::SeqCst));
}
