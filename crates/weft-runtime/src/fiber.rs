//! Stackful fibers
//!
//! A fiber is a schedulable unit with its own guard-paged stack and a saved
//! register file. Control moves with explicit `resume` / `yield_hold` /
//! `yield_ready`; nothing suspends implicitly.
//!
//! Every fiber carries a return mode: when it yields or finishes, control
//! goes either to the thread's bootstrap fiber (`ReturnTo::Thread`) or to
//! the worker's dispatcher fiber (`ReturnTo::Dispatcher`). The second mode
//! exists for use-caller schedulers, where the dispatcher is itself a
//! stackful fiber distinct from the thread's original context.
//!
//! Mutation of the saved context and the entry slot goes through
//! `UnsafeCell`; the state machine serializes access (a fiber is resumed by
//! exactly one thread at a time, and reset only in a terminal state). The
//! `switching` flag covers the one hole in that story: a fiber that has
//! published a resumable state but whose register save is still in flight
//! must not be switched into from another worker.

use std::cell::UnsafeCell;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Mutex};

use tracing::{debug, error};
use weft_core::error::{RuntimeError, RuntimeResult};
use weft_core::{FiberId, FiberState};

use crate::arch::{self, SavedContext};
use crate::config;
use crate::stack::Stack;
use crate::tls;

/// Boxed fiber entry function.
pub type EntryFn = Box<dyn FnOnce() + Send + 'static>;

/// Where control lands when this fiber yields or finishes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReturnTo {
    /// The thread's bootstrap fiber (the thread's original context).
    Thread,
    /// The worker's dispatcher fiber.
    Dispatcher,
}

static LIVE_FIBERS: AtomicU64 = AtomicU64::new(0);

/// Count of fibers currently alive (bootstrap fibers included).
pub fn live_fibers() -> u64 {
    LIVE_FIBERS.load(Ordering::Relaxed)
}

/// A stackful cooperative task.
pub struct Fiber {
    id: FiberId,
    state: AtomicU8,
    return_to: ReturnTo,
    /// `None` only for bootstrap fibers.
    stack: Option<Stack>,
    ctx: UnsafeCell<SavedContext>,
    entry: UnsafeCell<Option<EntryFn>>,
    /// Set between publishing a resumable state and completing the
    /// register save; resumers and resetters wait for it to clear.
    switching: AtomicBool,
    fault: Mutex<Option<String>>,
}

// Safety: `ctx` and `entry` are only touched by the thread that currently
// owns the fiber's execution (enforced by the state machine, the
// resume/yield protocol, and the `switching` handshake); everything else
// is atomics or lock-guarded.
unsafe impl Send for Fiber {}
unsafe impl Sync for Fiber {}

impl Fiber {
    /// Create a fiber in INIT with its stack allocated.
    ///
    /// `stack_size == 0` uses the configured default (`fiber.stack_size`).
    pub fn new(
        entry: impl FnOnce() + Send + 'static,
        stack_size: usize,
        return_to: ReturnTo,
    ) -> RuntimeResult<Arc<Fiber>> {
        let size = if stack_size == 0 {
            config::fiber_stack_size().get() as usize
        } else {
            stack_size
        };
        let stack = Stack::new(size)?;

        let fiber = Arc::new(Fiber {
            id: FiberId::next(),
            state: AtomicU8::new(FiberState::Init as u8),
            return_to,
            stack: Some(stack),
            ctx: UnsafeCell::new(SavedContext::zeroed()),
            entry: UnsafeCell::new(Some(Box::new(entry))),
            switching: AtomicBool::new(false),
            fault: Mutex::new(None),
        });
        LIVE_FIBERS.fetch_add(1, Ordering::Relaxed);

        fiber.prime_context();
        debug!(fiber = %fiber.id, stack = size, "fiber created");
        Ok(fiber)
    }

    /// The bootstrap fiber of a thread: no heap stack, born RUNNING.
    pub(crate) fn new_bootstrap() -> Arc<Fiber> {
        LIVE_FIBERS.fetch_add(1, Ordering::Relaxed);
        Arc::new(Fiber {
            id: FiberId::BOOTSTRAP,
            state: AtomicU8::new(FiberState::Running as u8),
            return_to: ReturnTo::Thread,
            stack: None,
            ctx: UnsafeCell::new(SavedContext::zeroed()),
            entry: UnsafeCell::new(None),
            switching: AtomicBool::new(false),
            fault: Mutex::new(None),
        })
    }

    /// Point the saved context at the entry trampoline.
    ///
    /// Fibers only exist behind `Arc`, so `self`'s address is the stable
    /// argument the trampoline hands back to `fiber_main`.
    fn prime_context(&self) {
        let stack = match self.stack.as_ref() {
            Some(s) => s,
            None => return,
        };
        unsafe {
            arch::init_context(
                self.ctx.get(),
                stack.top(),
                fiber_main as usize,
                self as *const Fiber as usize,
            );
        }
    }

    #[inline]
    pub fn id(&self) -> FiberId {
        self.id
    }

    #[inline]
    pub fn state(&self) -> FiberState {
        FiberState::from(self.state.load(Ordering::Acquire))
    }

    #[inline]
    pub(crate) fn set_state(&self, s: FiberState) {
        self.state.store(s as u8, Ordering::Release);
    }

    #[inline]
    pub fn is_bootstrap(&self) -> bool {
        self.stack.is_none()
    }

    /// The panic message captured when the fiber FAULTED, if any.
    pub fn fault(&self) -> Option<String> {
        self.fault.lock().unwrap().clone()
    }

    /// The fiber currently running on this thread, lazily creating the
    /// thread's bootstrap fiber on first call.
    pub fn current() -> Arc<Fiber> {
        if let Some(f) = tls::current_fiber() {
            return f;
        }
        tls::bootstrap_fiber()
    }

    /// Reuse this fiber's stack and context for a new entry function.
    ///
    /// Allowed in INIT, DONE, and FAULTED.
    pub fn reset(&self, entry: impl FnOnce() + Send + 'static) -> RuntimeResult<()> {
        self.reset_boxed(Box::new(entry))
    }

    pub(crate) fn reset_boxed(&self, entry: EntryFn) -> RuntimeResult<()> {
        if self.stack.is_none() {
            return Err(RuntimeError::InvalidState("reset on bootstrap fiber"));
        }
        if !self.state().is_resettable() {
            return Err(RuntimeError::InvalidState("reset on live fiber"));
        }
        self.wait_switch_done();
        // Safety: terminal state + completed switch-out means no thread is
        // executing on this stack.
        unsafe {
            *self.entry.get() = Some(entry);
        }
        self.fault.lock().unwrap().take();
        self.prime_context();
        self.set_state(FiberState::Init);
        Ok(())
    }

    /// The fiber whose context this one saves into / yields back to.
    fn back_fiber(&self) -> RuntimeResult<Arc<Fiber>> {
        match self.return_to {
            ReturnTo::Thread => Ok(tls::bootstrap_fiber()),
            ReturnTo::Dispatcher => tls::dispatcher_fiber().ok_or(RuntimeError::InvalidState(
                "no dispatcher fiber on this thread",
            )),
        }
    }

    /// Wait until a concurrent switch-out has finished saving registers.
    /// The window is a handful of instructions; spinning is the right
    /// tool.
    #[inline]
    fn wait_switch_done(&self) {
        while self.switching.load(Ordering::Acquire) {
            core::hint::spin_loop();
        }
    }
}

impl Drop for Fiber {
    fn drop(&mut self) {
        LIVE_FIBERS.fetch_sub(1, Ordering::Relaxed);
    }
}

/// Arc-level fiber operations. `resume` needs a shared handle to install
/// as the thread's current fiber, so it lives on the handle type.
pub trait FiberExt {
    /// Transfer control from the caller's context into this fiber.
    ///
    /// Returns when the fiber yields or finishes. Fails with InvalidState
    /// when the target is RUNNING or DONE, or when the thread lacks the
    /// return-mode fiber this fiber will yield back to.
    fn resume(&self) -> RuntimeResult<()>;
}

impl FiberExt for Arc<Fiber> {
    fn resume(&self) -> RuntimeResult<()> {
        if self.stack.is_none() {
            return Err(RuntimeError::InvalidState("resume on bootstrap fiber"));
        }
        if !self.state().is_resumable() {
            return Err(RuntimeError::InvalidState("resume on RUNNING or DONE fiber"));
        }
        let back = self.back_fiber()?;
        self.wait_switch_done();

        self.set_state(FiberState::Running);
        tls::set_current(self.clone());
        // Safety: `back.ctx` is the save slot for the context executing
        // this call; `self.ctx` was primed by init_context or a completed
        // prior yield.
        unsafe {
            arch::context_switch(back.ctx.get(), self.ctx.get());
        }
        // The fiber yielded or finished; its register save is complete the
        // moment control arrives here.
        self.switching.store(false, Ordering::Release);
        tls::set_current(back);
        Ok(())
    }
}

/// Suspend the current fiber as SUSPENDED and return to its back context.
/// Something else must hold a handle and re-enqueue it. A bootstrap fiber
/// cannot yield; the call degrades to an OS-level yield.
pub fn yield_hold() {
    yield_with(FiberState::Suspended)
}

/// Suspend the current fiber as READY; the dispatcher re-enqueues it
/// automatically.
pub fn yield_ready() {
    yield_with(FiberState::Ready)
}

fn yield_with(state: FiberState) {
    let Some(cur) = tls::current_fiber() else {
        std::thread::yield_now();
        return;
    };
    if cur.is_bootstrap() {
        std::thread::yield_now();
        return;
    }
    let back = match cur.back_fiber() {
        Ok(b) => b,
        Err(e) => {
            error!(fiber = %cur.id(), "cannot yield: {}", e);
            return;
        }
    };

    // Order matters: mark the save in flight before the state becomes
    // visible as resumable. The resumer clears the mark.
    cur.switching.store(true, Ordering::Release);
    cur.set_state(state);
    tls::set_current(back.clone());
    // Safety: symmetric to resume(); we save into our own slot and restore
    // the context that resumed us.
    unsafe {
        arch::context_switch(cur.ctx.get(), back.ctx.get());
    }
    // Resumed: resume() has already reinstalled us as current.
}

/// Entry trampoline target; runs on the fiber's own stack.
extern "C" fn fiber_main(arg: usize) {
    // Safety: `arg` is the address of the Fiber being resumed; the resumer
    // holds an Arc for the whole time this frame is live.
    let fiber = unsafe { &*(arg as *const Fiber) };

    let entry = unsafe { (*fiber.entry.get()).take() };
    let outcome = match entry {
        Some(f) => panic::catch_unwind(AssertUnwindSafe(f)),
        None => Ok(()),
    };

    // Publish the terminal state with the switch guard held, as in
    // yield_with: FAULTED fibers are reset-and-resumable.
    fiber.switching.store(true, Ordering::Release);
    match outcome {
        Ok(()) => fiber.set_state(FiberState::Done),
        Err(payload) => {
            let msg = panic_message(payload.as_ref());
            let backtrace = std::backtrace::Backtrace::capture();
            error!(fiber = %fiber.id, %backtrace, "fiber entry panicked: {}", msg);
            *fiber.fault.lock().unwrap() = Some(msg);
            fiber.set_state(FiberState::Faulted);
        }
    }

    // Yield back as if completed; the dispatcher (or test harness) observes
    // the terminal state. This switch never returns: a reset fiber restarts
    // at the trampoline.
    match fiber.back_fiber() {
        Ok(back) => {
            tls::set_current(back.clone());
            unsafe {
                arch::context_switch(fiber.ctx.get(), back.ctx.get());
            }
            unreachable!("terminated fiber was switched back into");
        }
        Err(e) => {
            // No way back means the thread set itself up wrong; parking the
            // OS thread is the only option that does not corrupt a stack.
            error!(fiber = %fiber.id, "terminated fiber has no return context: {}", e);
            loop {
                std::thread::park();
            }
        }
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn test_resume_yield_resume() {
        let steps = Arc::new(Mutex::new(Vec::new()));
        let s = steps.clone();
        let fiber = Fiber::new(
            move || {
                s.lock().unwrap().push("first");
                yield_hold();
                s.lock().unwrap().push("second");
            },
            64 * 1024,
            ReturnTo::Thread,
        )
        .unwrap();

        assert_eq!(fiber.state(), FiberState::Init);
        fiber.resume().unwrap();
        assert_eq!(fiber.state(), FiberState::Suspended);
        assert_eq!(steps.lock().unwrap().as_slice(), &["first"]);

        fiber.resume().unwrap();
        assert_eq!(fiber.state(), FiberState::Done);
        assert_eq!(steps.lock().unwrap().as_slice(), &["first", "second"]);
    }

    #[test]
    fn test_resume_done_is_invalid() {
        let fiber = Fiber::new(|| {}, 64 * 1024, ReturnTo::Thread).unwrap();
        fiber.resume().unwrap();
        assert_eq!(fiber.state(), FiberState::Done);
        assert!(matches!(fiber.resume(), Err(RuntimeError::InvalidState(_))));
    }

    #[test]
    fn test_yield_ready_state() {
        let fiber = Fiber::new(
            || {
                yield_ready();
            },
            64 * 1024,
            ReturnTo::Thread,
        )
        .unwrap();
        fiber.resume().unwrap();
        assert_eq!(fiber.state(), FiberState::Ready);
        fiber.resume().unwrap();
        assert_eq!(fiber.state(), FiberState::Done);
    }

    #[test]
    fn test_reset_reuses_stack() {
        let hits = Arc::new(AtomicUsize::new(0));
        let h = hits.clone();
        let fiber = Fiber::new(
            move || {
                h.fetch_add(1, Ordering::Relaxed);
            },
            64 * 1024,
            ReturnTo::Thread,
        )
        .unwrap();
        let stack_before = fiber.stack.as_ref().map(|s| s.top() as usize);

        fiber.resume().unwrap();
        assert_eq!(fiber.state(), FiberState::Done);

        let h = hits.clone();
        fiber
            .reset(move || {
                h.fetch_add(10, Ordering::Relaxed);
            })
            .unwrap();
        assert_eq!(fiber.state(), FiberState::Init);
        assert_eq!(fiber.stack.as_ref().map(|s| s.top() as usize), stack_before);

        fiber.resume().unwrap();
        assert_eq!(hits.load(Ordering::Relaxed), 11);
    }

    #[test]
    fn test_reset_while_suspended_is_invalid() {
        let fiber = Fiber::new(
            || {
                yield_hold();
            },
            64 * 1024,
            ReturnTo::Thread,
        )
        .unwrap();
        fiber.resume().unwrap();
        assert_eq!(fiber.state(), FiberState::Suspended);
        assert!(fiber.reset(|| {}).is_err());
        // Drain it so the stack is not dropped mid-flight.
        fiber.resume().unwrap();
    }

    #[test]
    fn test_panic_faults_fiber_but_not_caller() {
        let fiber = Fiber::new(
            || {
                panic!("boom in fiber");
            },
            64 * 1024,
            ReturnTo::Thread,
        )
        .unwrap();
        fiber.resume().unwrap();
        assert_eq!(fiber.state(), FiberState::Faulted);
        assert!(fiber.fault().unwrap().contains("boom in fiber"));

        // FAULTED fibers can be reset and rerun on the same stack.
        fiber.reset(|| {}).unwrap();
        fiber.resume().unwrap();
        assert_eq!(fiber.state(), FiberState::Done);
        assert!(fiber.fault().is_none());
    }

    #[test]
    fn test_fibers_are_released_after_use() {
        // The global counter is shared across concurrently running tests,
        // so convergence is asserted through weak handles instead.
        let fibers: Vec<_> = (0..8)
            .map(|_| Fiber::new(|| {}, 32 * 1024, ReturnTo::Thread).unwrap())
            .collect();
        let weaks: Vec<_> = fibers.iter().map(Arc::downgrade).collect();
        for f in &fibers {
            f.resume().unwrap();
            assert_eq!(f.state(), FiberState::Done);
        }
        drop(fibers);
        assert!(weaks.iter().all(|w| w.upgrade().is_none()));
    }

    #[test]
    fn test_current_creates_bootstrap() {
        let cur = Fiber::current();
        assert!(cur.is_bootstrap() || cur.state() == FiberState::Running);
    }

    #[test]
    fn test_nested_call_depth_suspension() {
        // Yielding from deep inside a call chain is the whole point of
        // stackful fibers.
        fn level(n: usize) {
            if n == 0 {
                yield_hold();
            } else {
                level(n - 1);
            }
        }
        let fiber = Fiber::new(|| level(40), 256 * 1024, ReturnTo::Thread).unwrap();
        fiber.resume().unwrap();
        assert_eq!(fiber.state(), FiberState::Suspended);
        fiber.resume().unwrap();
        assert_eq!(fiber.state(), FiberState::Done);
    }
}
