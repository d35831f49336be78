//! # weft-runtime
//!
//! The core of the weft coroutine runtime:
//!
//! - Architecture-specific context switching (hand-written assembly)
//! - mmap-backed fiber stacks with guard pages
//! - Stackful fibers with explicit resume/yield
//! - A worker-pool scheduler with affinity-aware dispatch
//! - A millisecond timer manager with conditional timers
//! - An edge-triggered epoll reactor (`IoManager`) that wakes fibers
//! - Transparent syscall interception turning blocking calls into
//!   cooperative suspension points
//!
//! The runtime is Linux-only: it leans on epoll, `dlsym(RTLD_NEXT)`, and a
//! self-pipe for cross-thread wakeup.

pub mod arch;
pub mod config;
pub mod fdreg;
pub mod fiber;
pub mod hook;
pub mod iomanager;
pub mod scheduler;
pub mod stack;
pub mod timer;
pub mod tls;

pub use fiber::{yield_hold, yield_ready, Fiber, FiberExt, ReturnTo};
pub use iomanager::{EventKind, IoManager};
pub use scheduler::{Dispatch, DispatchExt, Scheduler, Task};
pub use timer::{Clock, Timer, TimerManager};

cfg_if::cfg_if! {
    if #[cfg(not(target_os = "linux"))] {
        compile_error!("weft-runtime requires Linux (epoll, self-pipe, RTLD_NEXT)");
    }
}
