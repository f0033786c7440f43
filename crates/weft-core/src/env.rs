//! Environment variable utilities
//!
//! Generic `env_get<T>` for parsing environment overrides with defaults.

use std::str::FromStr;

/// Get an environment variable parsed as `T`, or the default.
///
/// Unset and unparsable values both fall back to the default.
#[inline]
pub fn env_get<T>(key: &str, default: T) -> T
where
    T: FromStr,
{
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

/// Get an environment variable as a boolean.
///
/// "1", "true", "yes" and "on" (case-insensitive) count as true;
/// any other set value is false; unset returns the default.
#[inline]
pub fn env_get_bool(key: &str, default: bool) -> bool {
    match std::env::var(key) {
        Ok(val) => matches!(val.to_lowercase().as_str(), "1" | "true" | "yes" | "on"),
        Err(_) => default,
    }
}

/// Get an environment variable as `Some(T)` if set and parsable.
#[inline]
pub fn env_get_opt<T>(key: &str) -> Option<T>
where
    T: FromStr,
{
    std::env::var(key).ok().and_then(|v| v.parse().ok())
}
