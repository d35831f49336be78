//! # weft
//!
//! A C10K-style stackful coroutine runtime: many lightweight fibers
//! multiplexed over a small worker pool, with blocking-looking I/O that
//! cooperates through an edge-triggered epoll reactor and a millisecond
//! timer wheel.
//!
//! ## Quick start
//!
//! ```ignore
//! use weft::{IoManager, Task, DispatchExt, net::TcpListener};
//!
//! fn main() -> weft::RuntimeResult<()> {
//!     let iom = IoManager::new(4, false, "echo")?;
//!     iom.schedule(Task::call(|| {
//!         let listener = TcpListener::bind("0.0.0.0:9900".parse().unwrap()).unwrap();
//!         loop {
//!             let (stream, peer) = listener.accept().unwrap();
//!             weft::spawn(move || {
//!                 let mut buf = [0u8; 4096];
//!                 // Looks blocking; parks the fiber, not the worker.
//!                 while let Ok(n) = stream.read(&mut buf) {
//!                     if n == 0 || stream.write_all(&buf[..n]).is_err() {
//!                         break;
//!                     }
//!                 }
//!                 let _ = peer;
//!             })
//!             .unwrap();
//!         }
//!     }));
//!     // ... iom.stop() on shutdown
//!     Ok(())
//! }
//! ```

pub mod bytes;
pub mod net;
pub mod runtime;

pub use bytes::{ByteBuf, Endian};
pub use runtime::{Runtime, RuntimeBuilder};
pub use weft_core::{FiberId, FiberState, RuntimeError, RuntimeResult};
pub use weft_runtime::config;
pub use weft_runtime::config::{ConfigError, RuntimeConfig};
pub use weft_runtime::fdreg;
pub use weft_runtime::hook;
pub use weft_runtime::scheduler::{self, current_worker_id};
pub use weft_runtime::{
    yield_hold, yield_ready, Clock, Dispatch, DispatchExt, EventKind, Fiber, FiberExt, IoManager,
    ReturnTo, Scheduler, Task, Timer, TimerManager,
};

/// Schedule a callback on the scheduler driving the current thread.
///
/// Usable from worker threads (and from fibers running on them); fails
/// with `NotStarted` elsewhere.
pub fn spawn(f: impl FnOnce() + Send + 'static) -> RuntimeResult<()> {
    let sched = scheduler::current().ok_or(RuntimeError::NotStarted)?;
    sched.schedule(Task::call(f));
    Ok(())
}

/// Yield the current fiber back to its dispatcher, staying runnable.
/// Outside a fiber this degrades to an OS-level yield.
pub fn yield_now() {
    yield_ready();
}

/// Sleep the current fiber for `ms` milliseconds.
///
/// Goes through the hooked `usleep`, so on a worker the fiber parks on a
/// timer while the worker keeps dispatching; anywhere else it is an
/// ordinary OS sleep.
pub fn sleep_ms(ms: u64) {
    unsafe {
        libc::usleep((ms * 1000) as libc::useconds_t);
    }
}
