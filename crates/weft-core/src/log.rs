//! Leveled stderr logging macros
//!
//! Thread-safe, optionally-flushing debug output for the runtime.
//!
//! # Environment Variables
//!
//! - `WEFT_LOG_LEVEL=<level>` - off, error, warn, info, debug, trace (or 0-5)
//! - `WEFT_LOG_FLUSH=1` - flush stderr after each line (crash debugging)
//!
//! # Usage
//!
//! ```ignore
//! use weft_core::{werror, winfo, wdebug};
//!
//! winfo!("worker {} started", id);
//! wdebug!("fiber {} state {:?}", id, state);
//! werror!("epoll_ctl failed: errno={}", errno);
//! ```

use std::io::Write;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};

/// Log levels, lowest to most verbose
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum LogLevel {
    Off = 0,
    Error = 1,
    Warn = 2,
    Info = 3,
    Debug = 4,
    Trace = 5,
}

impl LogLevel {
    fn parse(s: &str) -> LogLevel {
        match s.to_lowercase().as_str() {
            "off" | "0" => LogLevel::Off,
            "error" | "1" => LogLevel::Error,
            "warn" | "2" => LogLevel::Warn,
            "info" | "3" => LogLevel::Info,
            "debug" | "4" => LogLevel::Debug,
            "trace" | "5" => LogLevel::Trace,
            _ => LogLevel::Info,
        }
    }

    fn from_u8(v: u8) -> LogLevel {
        match v {
            0 => LogLevel::Off,
            1 => LogLevel::Error,
            2 => LogLevel::Warn,
            3 => LogLevel::Info,
            4 => LogLevel::Debug,
            _ => LogLevel::Trace,
        }
    }

    fn prefix(self) -> &'static str {
        match self {
            LogLevel::Off => "",
            LogLevel::Error => "[ERROR]",
            LogLevel::Warn => "[WARN ]",
            LogLevel::Info => "[INFO ]",
            LogLevel::Debug => "[DEBUG]",
            LogLevel::Trace => "[TRACE]",
        }
    }
}

static LOG_LEVEL: AtomicU8 = AtomicU8::new(LogLevel::Info as u8);
static FLUSH: AtomicBool = AtomicBool::new(false);
static INITIALIZED: AtomicBool = AtomicBool::new(false);

/// Initialize from environment variables.
///
/// Runs automatically on the first log call; call explicitly for
/// deterministic startup.
pub fn init() {
    if INITIALIZED.swap(true, Ordering::SeqCst) {
        return;
    }
    if let Ok(val) = std::env::var("WEFT_LOG_LEVEL") {
        LOG_LEVEL.store(LogLevel::parse(&val) as u8, Ordering::Relaxed);
    }
    if let Ok(val) = std::env::var("WEFT_LOG_FLUSH") {
        let flush = matches!(val.as_str(), "1" | "true" | "yes" | "on");
        FLUSH.store(flush, Ordering::Relaxed);
    }
}

/// Current log level
#[inline]
pub fn log_level() -> LogLevel {
    if !INITIALIZED.load(Ordering::Relaxed) {
        init();
    }
    LogLevel::from_u8(LOG_LEVEL.load(Ordering::Relaxed))
}

/// Set the log level programmatically
pub fn set_log_level(level: LogLevel) {
    INITIALIZED.store(true, Ordering::SeqCst);
    LOG_LEVEL.store(level as u8, Ordering::Relaxed);
}

/// Set flush mode programmatically
pub fn set_flush(enabled: bool) {
    FLUSH.store(enabled, Ordering::Relaxed);
}

/// Whether a given level would be emitted
#[inline]
pub fn level_enabled(level: LogLevel) -> bool {
    level as u8 <= log_level() as u8
}

#[doc(hidden)]
pub fn _log(level: LogLevel, args: std::fmt::Arguments<'_>) {
    if !level_enabled(level) {
        return;
    }
    let stderr = std::io::stderr();
    let mut out = stderr.lock();
    let _ = write!(out, "{} ", level.prefix());
    let _ = out.write_fmt(args);
    let _ = out.write_all(b"\n");
    if FLUSH.load(Ordering::Relaxed) {
        let _ = out.flush();
    }
}

/// Error level log
#[macro_export]
macro_rules! werror {
    ($($arg:tt)*) => {{
        $crate::log::_log($crate::log::LogLevel::Error, format_args!($($arg)*));
    }};
}

/// Warning level log
#[macro_export]
macro_rules! wwarn {
    ($($arg:tt)*) => {{
        $crate::log::_log($crate::log::LogLevel::Warn, format_args!($($arg)*));
    }};
}

/// Info level log
#[macro_export]
macro_rules! winfo {
    ($($arg:tt)*) => {{
        $crate::log::_log($crate::log::LogLevel::Info, format_args!($($arg)*));
    }};
}

/// Debug level log
#[macro_export]
macro_rules! wdebug {
    ($($arg:tt)*) => {{
        $crate::log::_log($crate::log::LogLevel::Debug, format_args!($($arg)*));
    }};
}

/// Trace level log (most verbose)
#[macro_export]
macro_rules! wtrace {
    ($($arg:tt)*) => {{
        $crate::log::_log($crate::log::LogLevel::Trace, format_args!($($arg)*));
    }};
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn level_ordering() {
        assert!(LogLevel::Error < LogLevel::Warn);
        assert!(LogLevel::Warn < LogLevel::Info);
        assert!(LogLevel::Info < LogLevel::Debug);
        assert!(LogLevel::Debug < LogLevel::Trace);
    }

    #[test]
    fn parse_names_and_digits() {
        assert_eq!(LogLevel::parse("trace"), LogLevel::Trace);
        assert_eq!(LogLevel::parse("2"), LogLevel::Warn);
        assert_eq!(LogLevel::parse("bogus"), LogLevel::Info);
    }

    #[test]
    fn macros_compile() {
        set_log_level(LogLevel::Off);
        werror!("e {}", 1);
        wwarn!("w");
        winfo!("i");
        wdebug!("d");
        wtrace!("t");
        assert!(!level_enabled(LogLevel::Error));
        set_log_level(LogLevel::Info);
    }
}
