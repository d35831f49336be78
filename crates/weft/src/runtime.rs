//! Runtime facade
//!
//! A builder over the IoManager for applications that want one handle to
//! configure, start, and stop. Configuration rides on
//! [`config::RuntimeConfig`]: environment-seeded defaults, chained
//! setters, and validation before anything is published or started.

use std::ops::Deref;
use std::sync::Arc;

use weft_runtime::config::RuntimeConfig;
use weft_runtime::scheduler::DispatchExt;
use weft_runtime::{Dispatch, IoManager, Task};

use weft_core::RuntimeResult;

/// Configuration builder for a [`Runtime`].
pub struct RuntimeBuilder {
    config: RuntimeConfig,
    use_caller: bool,
    name: String,
}

impl Default for RuntimeBuilder {
    fn default() -> Self {
        RuntimeBuilder::new()
    }
}

impl RuntimeBuilder {
    /// Environment-seeded defaults (`WEFT_*`).
    pub fn new() -> RuntimeBuilder {
        RuntimeBuilder {
            config: RuntimeConfig::from_env(),
            use_caller: false,
            name: "weft".to_string(),
        }
    }

    /// Start from an explicit config snapshot instead of the environment.
    pub fn with_config(config: RuntimeConfig) -> RuntimeBuilder {
        RuntimeBuilder {
            config,
            use_caller: false,
            name: "weft".to_string(),
        }
    }

    /// Number of workers; defaults to the machine's parallelism.
    pub fn workers(mut self, n: usize) -> Self {
        self.config = self.config.workers(n);
        self
    }

    /// Make the building thread one of the workers; `stop` then drains
    /// the remaining work on that thread.
    pub fn use_caller(mut self, on: bool) -> Self {
        self.use_caller = on;
        self
    }

    /// Pool name; worker threads are named `{name}-{index}`.
    pub fn name(mut self, name: &str) -> Self {
        self.name = name.to_string();
        self
    }

    /// Override the default per-fiber stack size in bytes.
    pub fn stack_size(mut self, bytes: u64) -> Self {
        self.config = self.config.stack_size(bytes);
        self
    }

    /// Override the hooked `connect` deadline in milliseconds.
    pub fn connect_timeout_ms(mut self, ms: u64) -> Self {
        self.config = self.config.connect_timeout_ms(ms);
        self
    }

    /// Validate the config, publish it, and start the pool. An invalid
    /// config is rejected before anything is published or spawned.
    pub fn build(self) -> RuntimeResult<Runtime> {
        self.config.apply()?;
        let iom = IoManager::new(self.config.workers, self.use_caller, &self.name)?;
        Ok(Runtime { iom })
    }
}

/// A started IoManager with its configuration applied.
///
/// Dereferences to [`IoManager`], so every scheduler and reactor operation
/// is available directly.
pub struct Runtime {
    iom: Arc<IoManager>,
}

impl Runtime {
    /// Default-configured runtime.
    pub fn new() -> RuntimeResult<Runtime> {
        RuntimeBuilder::new().build()
    }

    pub fn builder() -> RuntimeBuilder {
        RuntimeBuilder::new()
    }

    /// Schedule a callback on the pool.
    pub fn spawn(&self, f: impl FnOnce() + Send + 'static) {
        self.iom.schedule(Task::call(f));
    }

    /// Schedule a callback pinned to one worker.
    pub fn spawn_on(&self, worker: usize, f: impl FnOnce() + Send + 'static) {
        self.iom.schedule(Task::call(f).with_affinity(worker));
    }

    /// The underlying reactor handle.
    pub fn io(&self) -> &Arc<IoManager> {
        &self.iom
    }

    /// Drain and join the pool.
    pub fn stop(&self) {
        self.iom.stop();
    }
}

impl Deref for Runtime {
    type Target = IoManager;

    fn deref(&self) -> &IoManager {
        &self.iom
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;
    use weft_core::RuntimeError;
    use weft_runtime::config;

    // Every build() publishes the process-wide config vars; serialize the
    // tests in this module so they observe their own snapshots.
    static CFG_LOCK: Mutex<()> = Mutex::new(());

    fn cfg_guard() -> std::sync::MutexGuard<'static, ()> {
        CFG_LOCK.lock().unwrap_or_else(|e| e.into_inner())
    }

    #[test]
    fn test_builder_runs_work() {
        let _g = cfg_guard();
        let rt = Runtime::builder()
            .workers(2)
            .name("rt-test")
            .build()
            .unwrap();

        let hits = Arc::new(AtomicUsize::new(0));
        for _ in 0..16 {
            let h = hits.clone();
            rt.spawn(move || {
                h.fetch_add(1, Ordering::SeqCst);
            });
        }
        rt.stop();
        assert_eq!(hits.load(Ordering::SeqCst), 16);
    }

    #[test]
    fn test_spawn_on_respects_affinity() {
        let _g = cfg_guard();
        let rt = Runtime::builder().workers(2).name("rt-pin").build().unwrap();

        let seen = Arc::new(AtomicUsize::new(usize::MAX));
        let s = seen.clone();
        rt.spawn_on(1, move || {
            s.store(
                weft_runtime::scheduler::current_worker_id().unwrap_or(usize::MAX),
                Ordering::SeqCst,
            );
        });
        rt.stop();
        assert_eq!(seen.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_invalid_config_is_rejected_before_start() {
        let _g = cfg_guard();
        let err = Runtime::builder().workers(0).name("rt-bad").build();
        assert!(matches!(err, Err(RuntimeError::InvalidConfig(_))));

        // Below the 64 KiB floor.
        let err = Runtime::builder().stack_size(1024).name("rt-tiny").build();
        assert!(matches!(err, Err(RuntimeError::InvalidConfig(_))));
    }

    #[test]
    fn test_builder_applies_config() {
        let _g = cfg_guard();
        let before = config::tcp_connect_timeout().get();
        let rt = Runtime::builder()
            .workers(1)
            .name("rt-cfg")
            .connect_timeout_ms(before + 111)
            .build()
            .unwrap();
        assert_eq!(config::tcp_connect_timeout().get(), before + 111);
        rt.stop();
        config::tcp_connect_timeout().set(before);
    }

    #[test]
    fn test_with_config_snapshot() {
        let _g = cfg_guard();
        let snapshot = RuntimeConfig::new().workers(1);
        let rt = RuntimeBuilder::with_config(snapshot)
            .name("rt-snap")
            .build()
            .unwrap();
        assert_eq!(rt.worker_count(), 1);
        rt.stop();
    }
}
