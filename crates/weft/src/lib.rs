//! # weft
//!
//! A cooperative fiber runtime: stackful fibers with hand-written
//! context switching, an M:N scheduler, millisecond timers, an epoll
//! reactor and hooked blocking calls that park fibers instead of
//! blocking worker threads.
//!
//! ## Quick start
//!
//! ```no_run
//! use weft::{IoManager, SchedulerExt};
//!
//! let iom = IoManager::new(2, false, "main");
//! iom.schedule(|| {
//!     weft::hook::sleep_ms(100);
//!     println!("slept without blocking a worker");
//! });
//! iom.stop();
//! ```

pub use weft_core::log::{self, LogLevel};
pub use weft_core::{
    env_get, env_get_bool, env_get_opt, CancelToken, FiberState, SpinLock, WeftError, WeftResult,
};
pub use weft_core::{wdebug, werror, winfo, wtrace, wwarn};

pub use weft_runtime::config::{self, RuntimeConfig};
pub use weft_runtime::fiber::total_fibers;
pub use weft_runtime::hook;
pub use weft_runtime::timer::current_ms;
pub use weft_runtime::tls::current_worker;
pub use weft_runtime::{
    fd_manager, FdCtx, FdManager, Fiber, IoEvent, IoManager, Scheduler, SchedulerExt, TimeoutKind,
    Timer, TimerManager, TimerNotify, NO_TIMEOUT,
};

/// Yield the current fiber back to its scheduler, staying runnable
pub fn yield_now() {
    Fiber::yield_ready();
}
