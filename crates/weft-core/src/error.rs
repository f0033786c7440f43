//! Error types for the weft runtime
//!
//! Blocking-call wrappers in the hook layer report failures as
//! negative errno values, matching the syscalls they shadow. This
//! enum covers the remaining structured error paths (reactor
//! registration, configuration).

use core::fmt;

/// Result type for runtime operations
pub type WeftResult<T> = Result<T, WeftError>;

/// Errors that can occur in runtime operations
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WeftError {
    /// OS call failed with the given errno
    PlatformError(i32),

    /// Operation was applied to an object in the wrong state
    InvalidState(&'static str),
}

impl fmt::Display for WeftError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WeftError::PlatformError(code) => write!(f, "platform error: errno {}", code),
            WeftError::InvalidState(what) => write!(f, "invalid state: {}", what),
        }
    }
}

impl std::error::Error for WeftError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display() {
        assert_eq!(
            format!("{}", WeftError::PlatformError(9)),
            "platform error: errno 9"
        );
        assert_eq!(
            format!("{}", WeftError::InvalidState("negative fd")),
            "invalid state: negative fd"
        );
    }

    #[test]
    fn is_std_error() {
        fn takes_error(_: &dyn std::error::Error) {}
        takes_error(&WeftError::PlatformError(1));
    }
}
