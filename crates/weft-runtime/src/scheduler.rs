//! M:N fiber scheduler
//!
//! A `Scheduler` owns a run queue of tasks (fibers or plain
//! callbacks) and a pool of worker threads draining it. Tasks may be
//! pinned to a specific worker id; unpinned tasks run wherever a
//! worker picks them up first.
//!
//! With `use_caller` the constructing thread donates itself as one of
//! the workers: `start` arms a root fiber wrapping the worker loop,
//! and `stop` runs it on the caller until the queue drains.
//!
//! `SchedulerExt` is the extension seam: a wrapper embedding a
//! `Scheduler` overrides `tickle`, `idle` and `stopping` to plug in
//! its own wakeup transport and parking strategy (the epoll reactor
//! does exactly this), while `start`/`stop`/`schedule` come for free.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use weft_core::{wdebug, werror, winfo, FiberState, SpinLock};

use crate::fiber::Fiber;
use crate::tls;

/// Pin value meaning "any worker"
pub const ANY_WORKER: isize = -1;

pub(crate) enum Work {
    Fiber(Arc<Fiber>),
    Call(Box<dyn FnOnce() + Send + 'static>),
}

pub(crate) struct Task {
    pub(crate) work: Work,
    /// Worker id this task must run on, `ANY_WORKER` for no pin
    pub(crate) thread: isize,
}

/// Run queue plus worker-pool state
pub struct Scheduler {
    name: String,
    queue: SpinLock<VecDeque<Task>>,
    handles: SpinLock<Vec<JoinHandle<()>>>,
    /// Workers to spawn (the caller slot excluded under `use_caller`)
    thread_count: usize,
    active: AtomicUsize,
    idle: AtomicUsize,
    /// True before `start` and again after `stop` begins
    stopping: AtomicBool,
    auto_stop: AtomicBool,
    root_fiber: SpinLock<Option<Arc<Fiber>>>,
    use_caller: bool,
}

impl Scheduler {
    /// A scheduler running `threads` workers. With `use_caller` the
    /// calling thread counts as one of them and participates during
    /// `stop`.
    pub fn new(threads: usize, use_caller: bool, name: &str) -> Scheduler {
        assert!(threads > 0, "scheduler needs at least one worker");
        let thread_count = if use_caller { threads - 1 } else { threads };
        Scheduler {
            name: name.to_string(),
            queue: SpinLock::new(VecDeque::new()),
            handles: SpinLock::new(Vec::new()),
            thread_count,
            active: AtomicUsize::new(0),
            idle: AtomicUsize::new(0),
            stopping: AtomicBool::new(true),
            auto_stop: AtomicBool::new(false),
            root_fiber: SpinLock::new(None),
            use_caller,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Workers currently running a task
    pub fn active_count(&self) -> usize {
        self.active.load(Ordering::Acquire)
    }

    /// Workers currently parked in their idle fiber
    pub fn idle_count(&self) -> usize {
        self.idle.load(Ordering::Acquire)
    }

    /// Queue a task, reporting whether the queue was empty before
    pub(crate) fn enqueue(&self, task: Task) -> bool {
        let mut q = self.queue.lock();
        let was_empty = q.is_empty();
        q.push_back(task);
        was_empty
    }

    /// Queue a batch under one lock acquisition, reporting whether
    /// the queue was empty before
    pub(crate) fn enqueue_all(&self, tasks: Vec<Task>) -> bool {
        let mut q = self.queue.lock();
        let was_empty = q.is_empty();
        q.extend(tasks);
        was_empty
    }

    /// Everything drained and shutdown requested
    pub(crate) fn base_stopping(&self) -> bool {
        self.auto_stop.load(Ordering::Acquire)
            && self.stopping.load(Ordering::Acquire)
            && self.queue.lock().is_empty()
            && self.active.load(Ordering::Acquire) == 0
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        assert!(
            self.stopping.load(Ordering::Acquire),
            "scheduler {} dropped while running",
            self.name
        );
    }
}

impl std::fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scheduler")
            .field("name", &self.name)
            .field("threads", &self.thread_count)
            .field("use_caller", &self.use_caller)
            .field("queued", &self.queue.lock().len())
            .field("active", &self.active_count())
            .field("idle", &self.idle_count())
            .finish()
    }
}

impl SchedulerExt for Scheduler {
    fn core(&self) -> &Scheduler {
        self
    }
}

/// Extension seam for types embedding a [`Scheduler`].
///
/// Implementors provide `core`; the scheduling machinery is supplied
/// by default methods, and `tickle`/`idle`/`stopping`/`bind_thread`
/// are the override points for a custom wakeup transport.
pub trait SchedulerExt: Send + Sync + Sized + 'static {
    /// The embedded scheduler core
    fn core(&self) -> &Scheduler;

    /// Wake one parked worker. The plain scheduler's idle loop polls,
    /// so there is nothing to kick.
    fn tickle(&self) {
        wdebug!("scheduler {}: tickle", self.core().name);
    }

    /// Body of a worker's idle fiber: runs whenever the queue is
    /// empty and must yield back regularly so the queue is re-checked.
    fn idle(&self) {
        while !self.stopping() {
            Fiber::yield_hold();
        }
    }

    /// Whether workers may exit
    fn stopping(&self) -> bool {
        self.core().base_stopping()
    }

    /// Per-worker-thread setup before the run loop starts
    fn bind_thread(self: &Arc<Self>) {}

    /// Spawn the worker pool. Under `use_caller` this also arms the
    /// caller's root fiber; it runs during `stop`.
    fn start(self: &Arc<Self>) {
        let core = self.core();
        if !core.stopping.swap(false, Ordering::AcqRel) {
            return; // already started
        }
        winfo!(
            "scheduler {}: starting {} worker(s), use_caller={}",
            core.name,
            core.thread_count,
            core.use_caller
        );

        let mut handles = core.handles.lock();
        for i in 0..core.thread_count {
            let me = Arc::clone(self);
            let handle = std::thread::Builder::new()
                .name(format!("{}-{}", core.name, i))
                .spawn(move || run_worker(me, i as isize))
                .expect("failed to spawn scheduler worker");
            handles.push(handle);
        }
        drop(handles);

        if core.use_caller {
            let caller_id = core.thread_count as isize;
            let me = Arc::clone(self);
            let root = Fiber::new(move || run_worker(me, caller_id), 0, true);
            *core.root_fiber.lock() = Some(root);
            tls::set_current_scheduler(core as *const Scheduler as *const ());
            tls::set_current_worker(caller_id);
        }
    }

    /// Drain and shut down. Idempotent. Under `use_caller` the caller
    /// thread runs the root fiber here until the queue is empty.
    fn stop(self: &Arc<Self>) {
        let core = self.core();
        core.auto_stop.store(true, Ordering::Release);
        if core.stopping.swap(true, Ordering::AcqRel) {
            return; // never started, or already stopping
        }
        winfo!("scheduler {}: stopping", core.name);

        for _ in 0..core.thread_count {
            self.tickle();
        }

        let root = core.root_fiber.lock().take();
        if let Some(root) = root {
            self.tickle();
            if !self.stopping() && root.state().is_resumable() {
                root.resume();
            }
        }

        let handles: Vec<JoinHandle<()>> = core.handles.lock().drain(..).collect();
        for h in handles {
            if h.join().is_err() {
                werror!("scheduler {}: worker thread panicked", core.name);
            }
        }
    }

    /// Queue a callback for any worker
    fn schedule<F>(self: &Arc<Self>, f: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.schedule_call(Box::new(f), ANY_WORKER);
    }

    /// Queue a callback, optionally pinned to a worker id
    fn schedule_call(self: &Arc<Self>, f: Box<dyn FnOnce() + Send + 'static>, thread: isize) {
        let was_empty = self.core().enqueue(Task {
            work: Work::Call(f),
            thread,
        });
        if was_empty {
            self.tickle();
        }
    }

    /// Queue an existing fiber, optionally pinned to a worker id
    fn schedule_fiber(self: &Arc<Self>, fiber: Arc<Fiber>, thread: isize) {
        let was_empty = self.core().enqueue(Task {
            work: Work::Fiber(fiber),
            thread,
        });
        if was_empty {
            self.tickle();
        }
    }

    /// Queue a batch of callbacks under one lock acquisition
    fn schedule_batch(self: &Arc<Self>, fs: Vec<Box<dyn FnOnce() + Send + 'static>>) {
        if fs.is_empty() {
            return;
        }
        let tasks = fs
            .into_iter()
            .map(|f| Task {
                work: Work::Call(f),
                thread: ANY_WORKER,
            })
            .collect();
        let was_empty = self.core().enqueue_all(tasks);
        if was_empty {
            self.tickle();
        }
    }

    /// Move the current fiber onto this scheduler, optionally pinned
    /// to a worker id. No-op if it is already on the right worker.
    fn switch_to(self: &Arc<Self>, thread: isize) {
        let core = self.core();
        let here = core as *const Scheduler as *const ();
        if tls::current_scheduler() == here
            && (thread == ANY_WORKER || thread == tls::current_worker())
        {
            return;
        }
        let cur = Fiber::current();
        // A main fiber is a thread's native context; handing it to
        // another worker would resume a stack that thread still runs.
        assert!(
            !cur.is_main(),
            "scheduler {}: switch_to called outside a fiber",
            core.name
        );
        self.schedule_fiber(cur, thread);
        Fiber::yield_hold();
    }
}

/// Worker run loop. Runs on a spawned thread's main fiber, or inside
/// the caller's root fiber under `use_caller`.
pub(crate) fn run_worker<S: SchedulerExt>(sched: Arc<S>, worker: isize) {
    let core = sched.core();
    wdebug!("scheduler {}: worker {} up", core.name, worker);

    crate::hook::set_enabled(true);
    tls::set_current_scheduler(core as *const Scheduler as *const ());
    tls::set_current_worker(worker);
    sched.bind_thread();

    // The context running this loop is what fibers yield back to.
    tls::set_sched_fiber(Some(Fiber::current()));

    let idle_sched = Arc::clone(&sched);
    let idle_fiber = Fiber::new(move || idle_sched.idle(), 0, false);
    let mut carrier: Option<Arc<Fiber>> = None;

    loop {
        let mut claimed: Option<Task> = None;
        let mut tickle_me = false;
        {
            let mut q = core.queue.lock();
            let mut i = 0;
            while i < q.len() {
                let task = &q[i];
                if task.thread != ANY_WORKER && task.thread != worker {
                    // Pinned elsewhere; its worker owes a wakeup
                    tickle_me = true;
                    i += 1;
                    continue;
                }
                if let Work::Fiber(f) = &task.work {
                    if f.state() == FiberState::Executing {
                        i += 1;
                        continue;
                    }
                }
                claimed = q.remove(i);
                core.active.fetch_add(1, Ordering::AcqRel);
                break;
            }
            tickle_me = tickle_me || !q.is_empty();
        }
        if tickle_me {
            sched.tickle();
        }

        match claimed {
            Some(Task {
                work: Work::Fiber(fiber),
                ..
            }) => {
                if !fiber.state().is_done() {
                    fiber.resume();
                    match fiber.state() {
                        FiberState::Ready => sched.schedule_fiber(fiber, ANY_WORKER),
                        FiberState::Terminated | FiberState::Exception => {}
                        _ => fiber.set_state(FiberState::Hold),
                    }
                }
                core.active.fetch_sub(1, Ordering::AcqRel);
            }
            Some(Task {
                work: Work::Call(cb),
                ..
            }) => {
                let fiber = match carrier.take() {
                    Some(f) => {
                        f.reset(cb);
                        f
                    }
                    None => Fiber::new(cb, 0, false),
                };
                fiber.resume();
                match fiber.state() {
                    FiberState::Ready => sched.schedule_fiber(fiber, ANY_WORKER),
                    // Finished: keep it around and reuse the stack
                    FiberState::Terminated | FiberState::Exception => carrier = Some(fiber),
                    // Parked: whoever holds it will reschedule it
                    _ => fiber.set_state(FiberState::Hold),
                }
                core.active.fetch_sub(1, Ordering::AcqRel);
            }
            None => {
                if idle_fiber.state().is_done() {
                    break;
                }
                core.idle.fetch_add(1, Ordering::AcqRel);
                idle_fiber.resume();
                core.idle.fetch_sub(1, Ordering::AcqRel);
                if !idle_fiber.state().is_done() {
                    idle_fiber.set_state(FiberState::Hold);
                }
            }
        }
    }

    tls::set_sched_fiber(None);
    tls::set_current_scheduler(std::ptr::null());
    tls::set_current_worker(-1);
    wdebug!("scheduler {}: worker {} down", core.name, worker);
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::panic::{self, AssertUnwindSafe};
    use std::sync::atomic::AtomicUsize;
    use std::time::{Duration, Instant};

    fn wait_for(pred: impl Fn() -> bool) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while !pred() {
            assert!(Instant::now() < deadline, "timed out waiting for condition");
            std::thread::sleep(Duration::from_millis(1));
        }
    }

    #[test]
    fn callbacks_run_on_workers() {
        let sched = Arc::new(Scheduler::new(2, false, "cb-test"));
        sched.start();

        let count = Arc::new(AtomicUsize::new(0));
        for _ in 0..10 {
            let c = Arc::clone(&count);
            sched.schedule(move || {
                c.fetch_add(1, Ordering::SeqCst);
            });
        }
        wait_for(|| count.load(Ordering::SeqCst) == 10);
        sched.stop();
        assert_eq!(count.load(Ordering::SeqCst), 10);
    }

    #[test]
    fn use_caller_drains_on_stop() {
        let sched = Arc::new(Scheduler::new(1, true, "caller-test"));
        sched.start();

        let count = Arc::new(AtomicUsize::new(0));
        for _ in 0..5 {
            let c = Arc::clone(&count);
            sched.schedule(move || {
                c.fetch_add(1, Ordering::SeqCst);
            });
        }
        // No spawned workers: everything runs inside stop
        assert_eq!(count.load(Ordering::SeqCst), 0);
        sched.stop();
        assert_eq!(count.load(Ordering::SeqCst), 5);
    }

    #[test]
    fn stop_is_idempotent() {
        let sched = Arc::new(Scheduler::new(1, false, "stop-twice"));
        sched.start();
        sched.stop();
        sched.stop();
    }

    #[test]
    fn scheduled_fiber_resumes_after_yield() {
        let sched = Arc::new(Scheduler::new(1, false, "fiber-test"));
        sched.start();

        let count = Arc::new(AtomicUsize::new(0));
        let c = Arc::clone(&count);
        let fiber = Fiber::new(
            move || {
                c.fetch_add(1, Ordering::SeqCst);
                Fiber::yield_ready();
                c.fetch_add(1, Ordering::SeqCst);
            },
            0,
            false,
        );
        sched.schedule_fiber(fiber, ANY_WORKER);

        wait_for(|| count.load(Ordering::SeqCst) == 2);
        sched.stop();
    }

    #[test]
    fn drop_of_running_scheduler_panics() {
        let sched = Scheduler::new(1, false, "drop-live");
        sched.stopping.store(false, Ordering::Release);

        let prev = panic::take_hook();
        panic::set_hook(Box::new(|_| {}));
        let dropped = panic::catch_unwind(AssertUnwindSafe(move || drop(sched)));
        panic::set_hook(prev);
        assert!(dropped.is_err());
    }

    #[test]
    fn switch_to_outside_fiber_is_rejected() {
        let sched = Arc::new(Scheduler::new(1, false, "no-fiber"));
        sched.start();

        // This thread is not a worker, so the current "fiber" is its
        // native context and must not land on the run queue.
        let inner = Arc::clone(&sched);
        let prev = panic::take_hook();
        panic::set_hook(Box::new(|_| {}));
        let switched = panic::catch_unwind(AssertUnwindSafe(move || inner.switch_to(0)));
        panic::set_hook(prev);
        assert!(switched.is_err());

        sched.stop();
    }

    #[test]
    fn switch_to_pins_to_worker() {
        let sched = Arc::new(Scheduler::new(2, false, "pin-test"));
        sched.start();

        let seen = Arc::new(SpinLock::new(Vec::new()));
        let s = Arc::clone(&seen);
        let inner = Arc::clone(&sched);
        sched.schedule(move || {
            inner.switch_to(1);
            s.lock().push(tls::current_worker());
        });

        wait_for(|| !seen.lock().is_empty());
        sched.stop();
        assert_eq!(*seen.lock(), vec![1]);
    }

    #[test]
    fn pinned_callbacks_run_on_their_worker() {
        let sched = Arc::new(Scheduler::new(2, false, "pin-cb"));
        sched.start();

        let seen = Arc::new(SpinLock::new(Vec::new()));
        for _ in 0..4 {
            let s = Arc::clone(&seen);
            sched.schedule_call(
                Box::new(move || {
                    s.lock().push(tls::current_worker());
                }),
                0,
            );
        }
        wait_for(|| seen.lock().len() == 4);
        sched.stop();
        assert_eq!(*seen.lock(), vec![0, 0, 0, 0]);
    }
}
