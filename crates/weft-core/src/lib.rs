//! # weft-core
//!
//! Core types for the weft fiber runtime.
//!
//! This crate is platform-agnostic and contains no OS-specific code.
//! The fibers, scheduler and reactor live in `weft-runtime`.
//!
//! ## Modules
//!
//! - `state` - Fiber lifecycle states
//! - `error` - Error types
//! - `spinlock` - Internal spinlock primitive
//! - `cancel` - Cancellation token for timed I/O operations
//! - `log` - Leveled stderr logging macros
//! - `env` - Environment variable utilities

pub mod cancel;
pub mod env;
pub mod error;
pub mod log;
pub mod spinlock;
pub mod state;

// Re-exports for convenience
pub use cancel::CancelToken;
pub use env::{env_get, env_get_bool, env_get_opt};
pub use error::{WeftError, WeftResult};
pub use spinlock::SpinLock;
pub use state::FiberState;
