//! Stackful fibers
//!
//! A `Fiber` owns a guard-paged stack, a saved register context and a
//! one-shot entry closure. Fibers move between OS threads only while
//! suspended; at any instant a fiber executes on at most one thread.
//!
//! Control flow is symmetric-coroutine style: `resume` switches from
//! the calling context into the fiber, and every yield (or the entry
//! finishing) switches back to the context that scheduling designated
//! for this thread: the scheduler's run-loop fiber, or the thread's
//! main fiber outside a scheduler.

use std::any::Any;
use std::backtrace::Backtrace;
use std::cell::UnsafeCell;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use weft_core::{werror, FiberState};

use crate::arch::{self, SavedContext};
use crate::config;
use crate::stack::Stack;
use crate::tls;

static NEXT_FIBER_ID: AtomicU64 = AtomicU64::new(1);
static FIBER_COUNT: AtomicU64 = AtomicU64::new(0);

type Entry = Box<dyn FnOnce() + Send + 'static>;

/// A stackful fiber
pub struct Fiber {
    id: u64,
    state: AtomicU64,
    ctx: UnsafeCell<SavedContext>,
    entry: UnsafeCell<Option<Entry>>,
    stack: Option<Stack>,
    /// Yields return to the thread's main fiber instead of the
    /// scheduling fiber. Set for a scheduler's caller-thread root
    /// fiber, which IS the scheduling fiber of its thread.
    run_on_caller: bool,
}

// Safety: `ctx` and `entry` are only touched by the thread currently
// resuming or running the fiber, and the scheduler hands a fiber to
// at most one worker at a time (Executing fibers are skipped in the
// claim loop). `state` is atomic.
unsafe impl Send for Fiber {}
unsafe impl Sync for Fiber {}

impl Fiber {
    /// Create a fiber running `entry` on a fresh stack.
    ///
    /// `stack_size == 0` uses the configured default. The entry runs
    /// on first `resume`; panics inside it are contained and recorded
    /// as `Exception`.
    pub fn new<F>(entry: F, stack_size: usize, run_on_caller: bool) -> Arc<Fiber>
    where
        F: FnOnce() + Send + 'static,
    {
        let size = if stack_size == 0 {
            config::config().stack_size
        } else {
            stack_size
        };
        let stack = Stack::alloc(size);
        let fiber = Arc::new(Fiber {
            id: NEXT_FIBER_ID.fetch_add(1, Ordering::Relaxed),
            state: AtomicU64::new(FiberState::Init as u64),
            ctx: UnsafeCell::new(SavedContext::zeroed()),
            entry: UnsafeCell::new(Some(Box::new(entry))),
            stack: Some(stack),
            run_on_caller,
        });
        FIBER_COUNT.fetch_add(1, Ordering::Relaxed);
        fiber.init_ctx();
        fiber
    }

    /// The main fiber of an OS thread: no stack of its own, already
    /// executing by definition.
    fn new_main() -> Fiber {
        FIBER_COUNT.fetch_add(1, Ordering::Relaxed);
        Fiber {
            id: NEXT_FIBER_ID.fetch_add(1, Ordering::Relaxed),
            state: AtomicU64::new(FiberState::Executing as u64),
            ctx: UnsafeCell::new(SavedContext::zeroed()),
            entry: UnsafeCell::new(None),
            stack: None,
            run_on_caller: false,
        }
    }

    fn init_ctx(self: &Arc<Self>) {
        let stack = match self.stack.as_ref() {
            Some(s) => s,
            None => panic!("fiber {}: main fibers have no entry context", self.id),
        };
        let arg = Arc::as_ptr(self) as usize;
        // Safety: ctx points into this fiber, stack top is mapped,
        // and fiber_main never returns.
        unsafe {
            arch::init_context(self.ctx.get(), stack.top(), fiber_main as usize, arg);
        }
    }

    /// Process-wide fiber id
    #[inline]
    pub fn id(&self) -> u64 {
        self.id
    }

    #[inline]
    pub fn state(&self) -> FiberState {
        FiberState::from(self.state.load(Ordering::Acquire) as u8)
    }

    #[inline]
    pub(crate) fn set_state(&self, s: FiberState) {
        self.state.store(s as u64, Ordering::Release);
    }

    /// Whether this is a thread's main fiber
    #[inline]
    pub fn is_main(&self) -> bool {
        self.stack.is_none()
    }

    /// Transfer control into this fiber until it yields or finishes.
    ///
    /// Resuming a fiber that is Executing, Terminated or Exception is
    /// a programming error.
    pub fn resume(self: &Arc<Self>) {
        let st = self.state();
        assert!(
            st.is_resumable(),
            "fiber {} resumed in state {}",
            self.id,
            st
        );
        let back = self.back_target();
        self.set_state(FiberState::Executing);
        tls::set_current_fiber(Some(Arc::clone(self)));
        // Safety: `back` is the context currently executing on this
        // thread; `self` holds a valid suspended (or fresh) context.
        unsafe {
            arch::switch_context(back.ctx.get(), self.ctx.get());
        }
        // Control returns here once the fiber suspends.
    }

    /// Re-arm a finished (or never-started) fiber with a new entry,
    /// reusing its stack. Only valid on non-main fibers in
    /// Init, Terminated or Exception state.
    pub fn reset(self: &Arc<Self>, entry: Entry) {
        assert!(!self.is_main(), "fiber {}: cannot reset a main fiber", self.id);
        let st = self.state();
        assert!(
            st.is_resettable(),
            "fiber {} reset in state {}",
            self.id,
            st
        );
        // Safety: the fiber is not running in any of the resettable
        // states, so this thread has exclusive access.
        unsafe {
            *self.entry.get() = Some(entry);
        }
        self.init_ctx();
        self.set_state(FiberState::Init);
    }

    /// Suspend the current fiber, marking it Ready so a scheduler
    /// puts it straight back on the run queue. No-op on main fibers.
    pub fn yield_ready() {
        if let Some(cur) = tls::current_fiber() {
            if !cur.is_main() {
                cur.set_state(FiberState::Ready);
                cur.switch_out();
            }
        }
    }

    /// Suspend the current fiber, marking it Hold. Something else
    /// (timer callback, fd event, explicit schedule) must make it
    /// runnable again. No-op on main fibers.
    pub fn yield_hold() {
        if let Some(cur) = tls::current_fiber() {
            if !cur.is_main() {
                cur.set_state(FiberState::Hold);
                cur.switch_out();
            }
        }
    }

    /// The fiber executing on this thread, lazily materializing the
    /// thread's main fiber on first use.
    pub fn current() -> Arc<Fiber> {
        if let Some(f) = tls::current_fiber() {
            return f;
        }
        let main = thread_main();
        tls::set_current_fiber(Some(Arc::clone(&main)));
        main
    }

    /// Id of the fiber executing on this thread, 0 if none yet
    pub fn current_id() -> u64 {
        tls::current_fiber().map(|f| f.id).unwrap_or(0)
    }

    /// Switch away from this (currently executing) fiber back to the
    /// thread's scheduling context.
    fn switch_out(self: &Arc<Self>) {
        let back = self.back_target();
        tls::set_current_fiber(Some(Arc::clone(&back)));
        // Safety: this fiber is executing on this thread; `back` is a
        // suspended context waiting for control.
        unsafe {
            arch::switch_context(self.ctx.get(), back.ctx.get());
        }
    }

    /// The context control returns to when this fiber stops running.
    fn back_target(&self) -> Arc<Fiber> {
        if !self.run_on_caller {
            if let Some(s) = tls::sched_fiber() {
                return s;
            }
        }
        thread_main()
    }

    #[cfg(test)]
    pub(crate) fn stack_top_addr(&self) -> usize {
        self.stack.as_ref().map(|s| s.top() as usize).unwrap_or(0)
    }
}

impl Drop for Fiber {
    fn drop(&mut self) {
        FIBER_COUNT.fetch_sub(1, Ordering::Relaxed);
    }
}

impl std::fmt::Debug for Fiber {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Fiber")
            .field("id", &self.id)
            .field("state", &self.state())
            .field("main", &self.is_main())
            .finish()
    }
}

/// Number of live fibers in the process, main fibers included
pub fn total_fibers() -> u64 {
    FIBER_COUNT.load(Ordering::Relaxed)
}

/// The thread's main fiber, created on first use
pub(crate) fn thread_main() -> Arc<Fiber> {
    if let Some(f) = tls::thread_fiber() {
        return f;
    }
    let f = Arc::new(Fiber::new_main());
    tls::set_thread_fiber(Some(Arc::clone(&f)));
    f
}

/// Every fiber starts (and finishes) here. Runs the entry under
/// `catch_unwind`, records the outcome, and switches back to the
/// scheduling context. Never returns to the trampoline.
extern "C" fn fiber_main(fiber: *const Fiber) {
    // Safety: the resuming frame holds an Arc borrow of this fiber
    // for as long as it is suspended, keeping the pointee alive.
    let fiber = unsafe { &*fiber };
    // Safety: only the executing thread touches the entry slot.
    let entry = unsafe { (*fiber.entry.get()).take() };
    match entry {
        Some(entry) => match panic::catch_unwind(AssertUnwindSafe(entry)) {
            Ok(()) => fiber.set_state(FiberState::Terminated),
            Err(payload) => {
                fiber.set_state(FiberState::Exception);
                werror!(
                    "fiber {} panicked: {} (live fibers: {})\n{}",
                    fiber.id,
                    panic_message(&payload),
                    total_fibers(),
                    Backtrace::force_capture()
                );
            }
        },
        None => fiber.set_state(FiberState::Terminated),
    }

    let back = fiber.back_target();
    tls::set_current_fiber(Some(Arc::clone(&back)));
    // Safety: final switch away; nothing ever resumes a fiber in a
    // done state, so this context is dead after the switch.
    unsafe {
        arch::switch_context(fiber.ctx.get(), back.ctx.get());
    }
    unreachable!("finished fiber {} was resumed", fiber.id);
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s
    } else {
        "non-string panic payload"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use weft_core::SpinLock;

    #[test]
    fn lifecycle_with_yield() {
        let steps = Arc::new(AtomicUsize::new(0));
        let s = Arc::clone(&steps);
        let fiber = Fiber::new(
            move || {
                s.fetch_add(1, Ordering::SeqCst);
                Fiber::yield_ready();
                s.fetch_add(1, Ordering::SeqCst);
            },
            0,
            false,
        );
        assert_eq!(fiber.state(), FiberState::Init);

        fiber.resume();
        assert_eq!(steps.load(Ordering::SeqCst), 1);
        assert_eq!(fiber.state(), FiberState::Ready);

        fiber.resume();
        assert_eq!(steps.load(Ordering::SeqCst), 2);
        assert_eq!(fiber.state(), FiberState::Terminated);
    }

    #[test]
    fn yield_hold_suspends() {
        let fiber = Fiber::new(
            || {
                Fiber::yield_hold();
            },
            0,
            false,
        );
        fiber.resume();
        assert_eq!(fiber.state(), FiberState::Hold);
        fiber.resume();
        assert_eq!(fiber.state(), FiberState::Terminated);
    }

    #[test]
    fn reset_reuses_stack() {
        let hits = Arc::new(AtomicUsize::new(0));
        let h = Arc::clone(&hits);
        let fiber = Fiber::new(
            move || {
                h.fetch_add(1, Ordering::SeqCst);
            },
            0,
            false,
        );
        let top = fiber.stack_top_addr();
        fiber.resume();
        assert_eq!(fiber.state(), FiberState::Terminated);

        let h = Arc::clone(&hits);
        fiber.reset(Box::new(move || {
            h.fetch_add(10, Ordering::SeqCst);
        }));
        assert_eq!(fiber.state(), FiberState::Init);
        assert_eq!(fiber.stack_top_addr(), top);

        fiber.resume();
        assert_eq!(hits.load(Ordering::SeqCst), 11);
        assert_eq!(fiber.state(), FiberState::Terminated);
    }

    #[test]
    fn panic_becomes_exception() {
        let prev = panic::take_hook();
        panic::set_hook(Box::new(|_| {}));
        let fiber = Fiber::new(
            || {
                panic!("boom");
            },
            0,
            false,
        );
        fiber.resume();
        panic::set_hook(prev);
        assert_eq!(fiber.state(), FiberState::Exception);
    }

    #[test]
    fn self_resume_is_rejected() {
        let prev = panic::take_hook();
        panic::set_hook(Box::new(|_| {}));
        let slot: Arc<SpinLock<Option<Arc<Fiber>>>> = Arc::new(SpinLock::new(None));
        let s = Arc::clone(&slot);
        let fiber = Fiber::new(
            move || {
                let me = s.lock().take().unwrap();
                me.resume(); // Executing: must assert
            },
            0,
            false,
        );
        *slot.lock() = Some(Arc::clone(&fiber));
        fiber.resume();
        panic::set_hook(prev);
        assert_eq!(fiber.state(), FiberState::Exception);
    }

    #[test]
    fn ids_and_counts() {
        let before = total_fibers();
        let a = Fiber::new(|| {}, 0, false);
        let b = Fiber::new(|| {}, 0, false);
        assert!(b.id() > a.id());
        assert!(total_fibers() >= before + 2);
        a.resume();
        b.resume();
        drop(a);
        drop(b);
        assert!(total_fibers() >= before);
    }

    #[test]
    fn current_id_inside_fiber() {
        let seen = Arc::new(AtomicU64::new(0));
        let s = Arc::clone(&seen);
        let fiber = Fiber::new(
            move || {
                s.store(Fiber::current_id(), Ordering::SeqCst);
            },
            0,
            false,
        );
        let id = fiber.id();
        fiber.resume();
        assert_eq!(seen.load(Ordering::SeqCst), id);
    }
}
