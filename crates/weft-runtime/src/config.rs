//! Runtime configuration
//!
//! Library defaults with environment overrides, plus a process-global
//! copy that may be updated at runtime. Subsystems that cache a value
//! (the hook layer caches the connect timeout) register a change
//! listener once and re-cache on update.
//!
//! # Environment Variables
//!
//! - `WEFT_STACK_SIZE` - default fiber stack size in bytes
//! - `WEFT_CONNECT_TIMEOUT_MS` - hooked connect() timeout

use std::sync::{OnceLock, PoisonError, RwLock};

use weft_core::env::env_get;
use weft_core::SpinLock;

/// Default fiber stack size: 128 KiB
pub const DEFAULT_STACK_SIZE: usize = 128 * 1024;

/// Default hooked-connect timeout: 5 seconds
pub const DEFAULT_CONNECT_TIMEOUT_MS: u64 = 5000;

/// Runtime configuration with builder-style setters
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuntimeConfig {
    /// Stack size for fibers created with `stack_size == 0`
    pub stack_size: usize,
    /// Timeout applied by the hooked `connect`
    pub connect_timeout_ms: u64,
}

impl RuntimeConfig {
    /// Library defaults, no environment override
    pub fn new() -> Self {
        RuntimeConfig {
            stack_size: DEFAULT_STACK_SIZE,
            connect_timeout_ms: DEFAULT_CONNECT_TIMEOUT_MS,
        }
    }

    /// Defaults with environment overrides applied
    pub fn from_env() -> Self {
        RuntimeConfig {
            stack_size: env_get("WEFT_STACK_SIZE", DEFAULT_STACK_SIZE),
            connect_timeout_ms: env_get("WEFT_CONNECT_TIMEOUT_MS", DEFAULT_CONNECT_TIMEOUT_MS),
        }
    }

    pub fn stack_size(mut self, size: usize) -> Self {
        self.stack_size = size;
        self
    }

    pub fn connect_timeout_ms(mut self, ms: u64) -> Self {
        self.connect_timeout_ms = ms;
        self
    }

    /// Validate field ranges
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.stack_size < 16 * 1024 {
            return Err(ConfigError::InvalidValue("stack_size must be >= 16KB"));
        }
        if self.connect_timeout_ms == 0 {
            return Err(ConfigError::InvalidValue("connect_timeout_ms must be > 0"));
        }
        Ok(())
    }
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self::from_env()
    }
}

/// Configuration error
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    InvalidValue(&'static str),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::InvalidValue(msg) => write!(f, "invalid config: {}", msg),
        }
    }
}

impl std::error::Error for ConfigError {}

// ============================================================================
// Global config with change notification
// ============================================================================

type Listener = Box<dyn Fn(&RuntimeConfig, &RuntimeConfig) + Send + Sync>;

struct GlobalConfig {
    current: RwLock<RuntimeConfig>,
    listeners: SpinLock<Vec<Listener>>,
}

fn global() -> &'static GlobalConfig {
    static GLOBAL: OnceLock<GlobalConfig> = OnceLock::new();
    GLOBAL.get_or_init(|| GlobalConfig {
        current: RwLock::new(RuntimeConfig::from_env()),
        listeners: SpinLock::new(Vec::new()),
    })
}

/// Snapshot of the current global configuration
pub fn config() -> RuntimeConfig {
    global()
        .current
        .read()
        .unwrap_or_else(PoisonError::into_inner)
        .clone()
}

/// Replace the global configuration, notifying listeners with
/// (old, new) when the value actually changed.
pub fn update(new: RuntimeConfig) {
    let old = {
        let mut cur = global()
            .current
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        std::mem::replace(&mut *cur, new.clone())
    };
    if old != new {
        let listeners = global().listeners.lock();
        for l in listeners.iter() {
            l(&old, &new);
        }
    }
}

/// Register a change listener. Listeners run inline under `update`.
pub fn on_change<F>(f: F)
where
    F: Fn(&RuntimeConfig, &RuntimeConfig) + Send + Sync + 'static,
{
    global().listeners.lock().push(Box::new(f));
}
