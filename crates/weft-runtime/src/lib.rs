//! # weft-runtime
//!
//! The weft fiber runtime:
//! - Stackful fibers with hand-written context switching
//! - M:N scheduler over a pool of worker threads
//! - Millisecond timers with an ordered-set wheel
//! - epoll reactor (`IoManager`) driving fd readiness and timers
//! - Hooked blocking-call wrappers (`hook`) that park fibers instead
//!   of blocking worker threads

pub mod arch;
pub mod config;
pub mod fd_manager;
pub mod fiber;
pub mod hook;
pub mod iomanager;
pub mod scheduler;
pub mod stack;
pub mod timer;
pub mod tls;

// Re-exports
pub use config::RuntimeConfig;
pub use fd_manager::{fd_manager, FdCtx, FdManager, TimeoutKind, NO_TIMEOUT};
pub use fiber::Fiber;
pub use iomanager::{IoEvent, IoManager};
pub use scheduler::{Scheduler, SchedulerExt};
pub use timer::{Timer, TimerManager, TimerNotify};

/// errno of the most recent failed libc call on this thread
#[inline]
pub(crate) fn last_errno() -> i32 {
    std::io::Error::last_os_error().raw_os_error().unwrap_or(0)
}
