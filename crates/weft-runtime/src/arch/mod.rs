//! Architecture-specific context switching
//!
//! Saves and restores callee-saved registers when control moves
//! between fibers. Only voluntary switches exist; a fiber always
//! reaches a switch point through `resume` or a yield.
//!
//! Each architecture defines its own `SavedContext` layout; the rest
//! of the runtime only relies on `zeroed()`, `init_context` and
//! `switch_context`.

cfg_if::cfg_if! {
    if #[cfg(target_arch = "x86_64")] {
        pub mod x86_64;
        pub use x86_64::{init_context, switch_context, SavedContext};
    } else if #[cfg(target_arch = "aarch64")] {
        pub mod aarch64;
        pub use aarch64::{init_context, switch_context, SavedContext};
    } else {
        compile_error!("Unsupported architecture");
    }
}
