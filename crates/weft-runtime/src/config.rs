//! Runtime configuration
//!
//! Two layers:
//!
//! - [`RuntimeConfig`]: a builder-pattern startup snapshot with
//!   compile-time defaults, `WEFT_*` environment overrides, and
//!   `validate()`. `apply()` publishes a validated snapshot into the
//!   runtime-mutable values below.
//! - [`ConfigVar`]: runtime-mutable cells with change listeners. The hook
//!   layer registers a listener so its cached connect timeout follows
//!   updates made after startup.
//!
//! | Option | Env | Default |
//! |---|---|---|
//! | workers | `WEFT_WORKERS` | machine parallelism |
//! | `fiber.stack_size` | `WEFT_STACK_SIZE` | 1 MiB |
//! | `tcp.connect.timeout` | `WEFT_CONNECT_TIMEOUT_MS` | 5000 ms |

use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, OnceLock};

use tracing::{info, warn};
use weft_core::error::RuntimeError;

pub const DEFAULT_STACK_SIZE: u64 = 1024 * 1024;
pub const DEFAULT_CONNECT_TIMEOUT_MS: u64 = 5000;
/// Smaller stacks overflow on the first non-trivial call chain.
pub const MIN_STACK_SIZE: u64 = 64 * 1024;
pub const MAX_WORKERS: usize = 256;

/// A `WEFT_*` override, if the variable is set and parses. Set-but-garbage
/// values are reported and ignored rather than silently falling back.
fn env_override<T: FromStr>(key: &str) -> Option<T> {
    let raw = std::env::var(key).ok()?;
    match raw.trim().parse() {
        Ok(v) => Some(v),
        Err(_) => {
            warn!(key, value = %raw, "unparsable environment override ignored");
            None
        }
    }
}

fn default_workers() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(2)
}

/// Startup configuration snapshot.
///
/// Start from `from_env()` (compile-time defaults plus environment
/// overrides) or `new()` (defaults only), adjust with the chained
/// setters, then `apply()` before bringing the runtime up.
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    /// Worker thread count for pools sized from this config.
    pub workers: usize,
    /// Default per-fiber stack in bytes (`fiber.stack_size`).
    pub stack_size: u64,
    /// Deadline for hooked `connect` in ms (`tcp.connect.timeout`).
    pub connect_timeout_ms: u64,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self::from_env()
    }
}

impl RuntimeConfig {
    /// Compile-time defaults, no environment involved.
    pub fn new() -> RuntimeConfig {
        RuntimeConfig {
            workers: default_workers(),
            stack_size: DEFAULT_STACK_SIZE,
            connect_timeout_ms: DEFAULT_CONNECT_TIMEOUT_MS,
        }
    }

    /// Defaults with `WEFT_WORKERS` / `WEFT_STACK_SIZE` /
    /// `WEFT_CONNECT_TIMEOUT_MS` applied on top.
    pub fn from_env() -> RuntimeConfig {
        RuntimeConfig {
            workers: env_override("WEFT_WORKERS").unwrap_or_else(default_workers),
            stack_size: env_override("WEFT_STACK_SIZE").unwrap_or(DEFAULT_STACK_SIZE),
            connect_timeout_ms: env_override("WEFT_CONNECT_TIMEOUT_MS")
                .unwrap_or(DEFAULT_CONNECT_TIMEOUT_MS),
        }
    }

    // Builder setters

    pub fn workers(mut self, n: usize) -> Self {
        self.workers = n;
        self
    }

    pub fn stack_size(mut self, bytes: u64) -> Self {
        self.stack_size = bytes;
        self
    }

    pub fn connect_timeout_ms(mut self, ms: u64) -> Self {
        self.connect_timeout_ms = ms;
        self
    }

    /// Check the snapshot against the runtime's hard limits.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.workers == 0 {
            return Err(ConfigError::InvalidValue("workers must be > 0"));
        }
        if self.workers > MAX_WORKERS {
            return Err(ConfigError::InvalidValue("workers must be <= 256"));
        }
        if self.stack_size < MIN_STACK_SIZE {
            return Err(ConfigError::InvalidValue("stack_size must be >= 64 KiB"));
        }
        if self.connect_timeout_ms == 0 {
            return Err(ConfigError::InvalidValue("connect timeout must be > 0"));
        }
        Ok(())
    }

    /// Validate, then publish into the runtime-mutable values. Nothing is
    /// published when validation fails.
    pub fn apply(&self) -> Result<(), ConfigError> {
        self.validate()?;
        fiber_stack_size().set(self.stack_size);
        tcp_connect_timeout().set(self.connect_timeout_ms);
        Ok(())
    }
}

/// Configuration error.
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

impl From<ConfigError> for RuntimeError {
    fn from(e: ConfigError) -> RuntimeError {
        match e {
            ConfigError::InvalidValue(msg) => RuntimeError::InvalidConfig(msg),
        }
    }
}

type Listener = Box<dyn Fn(u64, u64) + Send + Sync + 'static>;

/// A runtime-mutable configuration value with change observers.
pub struct ConfigVar {
    name: &'static str,
    value: AtomicU64,
    listeners: Mutex<Vec<Listener>>,
}

impl ConfigVar {
    fn new(name: &'static str, value: u64) -> ConfigVar {
        ConfigVar {
            name,
            value: AtomicU64::new(value),
            listeners: Mutex::new(Vec::new()),
        }
    }

    #[inline]
    pub fn get(&self) -> u64 {
        self.value.load(Ordering::Acquire)
    }

    /// Update the value and invoke every listener with (old, new).
    pub fn set(&self, new: u64) {
        let old = self.value.swap(new, Ordering::AcqRel);
        if old == new {
            return;
        }
        info!(var = self.name, old, new, "config value changed");
        for listener in self.listeners.lock().unwrap().iter() {
            listener(old, new);
        }
    }

    /// Register a change observer. It fires on every subsequent `set` that
    /// changes the value.
    pub fn on_change(&self, f: impl Fn(u64, u64) + Send + Sync + 'static) {
        self.listeners.lock().unwrap().push(Box::new(f));
    }

    pub fn name(&self) -> &'static str {
        self.name
    }
}

static FIBER_STACK_SIZE: OnceLock<ConfigVar> = OnceLock::new();
static TCP_CONNECT_TIMEOUT: OnceLock<ConfigVar> = OnceLock::new();

/// Default per-fiber stack size in bytes (`fiber.stack_size`).
pub fn fiber_stack_size() -> &'static ConfigVar {
    FIBER_STACK_SIZE.get_or_init(|| {
        ConfigVar::new("fiber.stack_size", RuntimeConfig::from_env().stack_size)
    })
}

/// Deadline for hooked `connect` in milliseconds (`tcp.connect.timeout`).
pub fn tcp_connect_timeout() -> &'static ConfigVar {
    TCP_CONNECT_TIMEOUT.get_or_init(|| {
        ConfigVar::new(
            "tcp.connect.timeout",
            RuntimeConfig::from_env().connect_timeout_ms,
        )
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicBool;
    use std::sync::Arc;

    #[test]
    fn test_from_env_is_valid() {
        let config = RuntimeConfig::from_env();
        assert!(config.workers >= 1);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_env_override_unset_is_none() {
        assert_eq!(env_override::<u64>("__WEFT_TEST_UNSET__"), None);
    }

    #[test]
    fn test_builder_chain() {
        let config = RuntimeConfig::new()
            .workers(8)
            .stack_size(2 * 1024 * 1024)
            .connect_timeout_ms(250);
        assert_eq!(config.workers, 8);
        assert_eq!(config.stack_size, 2 * 1024 * 1024);
        assert_eq!(config.connect_timeout_ms, 250);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_bounds() {
        assert!(RuntimeConfig::new().workers(0).validate().is_err());
        assert!(RuntimeConfig::new().workers(1000).validate().is_err());
        assert!(RuntimeConfig::new().stack_size(1024).validate().is_err());
        assert!(RuntimeConfig::new().connect_timeout_ms(0).validate().is_err());
    }

    #[test]
    fn test_apply_rejects_without_publishing() {
        // A marker no other test publishes; it must not leak through a
        // failed apply.
        let bad = RuntimeConfig::new().workers(0).connect_timeout_ms(987_654);
        assert!(bad.apply().is_err());
        assert_ne!(tcp_connect_timeout().get(), 987_654);
    }

    #[test]
    fn test_config_error_converts() {
        let err: RuntimeError = ConfigError::InvalidValue("workers must be > 0").into();
        assert!(matches!(err, RuntimeError::InvalidConfig(_)));
    }

    #[test]
    fn test_listener_fires_on_change() {
        let var = ConfigVar::new("test.var", 1);
        let seen = Arc::new(Mutex::new((0u64, 0u64)));
        let s = seen.clone();
        var.on_change(move |old, new| {
            *s.lock().unwrap() = (old, new);
        });

        var.set(2);
        assert_eq!(*seen.lock().unwrap(), (1, 2));
        assert_eq!(var.get(), 2);
    }

    #[test]
    fn test_listener_skipped_when_unchanged() {
        let var = ConfigVar::new("test.var", 7);
        let fired = Arc::new(AtomicBool::new(false));
        let f = fired.clone();
        var.on_change(move |_, _| f.store(true, Ordering::Relaxed));

        var.set(7);
        assert!(!fired.load(Ordering::Relaxed));
    }
}
