//! Thread-local runtime state
//!
//! Every thread that touches fibers carries:
//! - the fiber currently executing on it
//! - its "main fiber", the original OS-thread context
//! - its scheduling fiber, the run-loop context yields return to
//! - the scheduler it works for, the worker id, the hook flag, and a
//!   weak handle to the thread's reactor

use std::cell::{Cell, RefCell};
use std::sync::{Arc, Weak};

use crate::fiber::Fiber;
use crate::iomanager::IoManager;

thread_local! {
    static CURRENT_FIBER: RefCell<Option<Arc<Fiber>>> = const { RefCell::new(None) };
    static THREAD_FIBER: RefCell<Option<Arc<Fiber>>> = const { RefCell::new(None) };
    static SCHED_FIBER: RefCell<Option<Arc<Fiber>>> = const { RefCell::new(None) };
    static CURRENT_SCHEDULER: Cell<*const ()> = const { Cell::new(std::ptr::null()) };
    static CURRENT_WORKER: Cell<isize> = const { Cell::new(-1) };
    static HOOK_ENABLED: Cell<bool> = const { Cell::new(false) };
    static CURRENT_REACTOR: RefCell<Option<Weak<IoManager>>> = const { RefCell::new(None) };
}

pub(crate) fn current_fiber() -> Option<Arc<Fiber>> {
    CURRENT_FIBER.with(|c| c.borrow().clone())
}

pub(crate) fn set_current_fiber(f: Option<Arc<Fiber>>) {
    CURRENT_FIBER.with(|c| *c.borrow_mut() = f);
}

pub(crate) fn thread_fiber() -> Option<Arc<Fiber>> {
    THREAD_FIBER.with(|c| c.borrow().clone())
}

pub(crate) fn set_thread_fiber(f: Option<Arc<Fiber>>) {
    THREAD_FIBER.with(|c| *c.borrow_mut() = f);
}

pub(crate) fn sched_fiber() -> Option<Arc<Fiber>> {
    SCHED_FIBER.with(|c| c.borrow().clone())
}

pub(crate) fn set_sched_fiber(f: Option<Arc<Fiber>>) {
    SCHED_FIBER.with(|c| *c.borrow_mut() = f);
}

pub(crate) fn current_scheduler() -> *const () {
    CURRENT_SCHEDULER.with(|c| c.get())
}

pub(crate) fn set_current_scheduler(p: *const ()) {
    CURRENT_SCHEDULER.with(|c| c.set(p));
}

/// Logical id of the worker running this thread, -1 outside workers
pub fn current_worker() -> isize {
    CURRENT_WORKER.with(|c| c.get())
}

pub(crate) fn set_current_worker(id: isize) {
    CURRENT_WORKER.with(|c| c.set(id));
}

pub(crate) fn hook_enabled() -> bool {
    HOOK_ENABLED.with(|c| c.get())
}

pub(crate) fn set_hook_enabled(v: bool) {
    HOOK_ENABLED.with(|c| c.set(v));
}

pub(crate) fn current_reactor() -> Option<Weak<IoManager>> {
    CURRENT_REACTOR.with(|c| c.borrow().clone())
}

pub(crate) fn set_current_reactor(w: Option<Weak<IoManager>>) {
    CURRENT_REACTOR.with(|c| *c.borrow_mut() = w);
}
