//! Thread-local runtime registry
//!
//! Every OS thread participating in the runtime tracks:
//!
//! - the fiber currently executing on it (`current`)
//! - its bootstrap fiber, representing the thread's original context
//! - its dispatcher fiber, the one running the scheduler loop
//!   (on spawned workers this is the bootstrap fiber; on a use-caller
//!   thread it is a distinct stackful fiber)
//!
//! None of these borrows may be held across a context switch; accessors
//! clone the `Arc` out and drop the borrow immediately.

use std::cell::RefCell;
use std::sync::Arc;

use crate::fiber::Fiber;

thread_local! {
    static CURRENT: RefCell<Option<Arc<Fiber>>> = const { RefCell::new(None) };
    static BOOTSTRAP: RefCell<Option<Arc<Fiber>>> = const { RefCell::new(None) };
    static DISPATCHER: RefCell<Option<Arc<Fiber>>> = const { RefCell::new(None) };
}

/// The fiber currently running on this thread, if any.
#[inline]
pub fn current_fiber() -> Option<Arc<Fiber>> {
    CURRENT.with(|c| c.borrow().clone())
}

#[inline]
pub(crate) fn set_current(f: Arc<Fiber>) {
    CURRENT.with(|c| *c.borrow_mut() = Some(f));
}

/// This thread's bootstrap fiber, creating it on first use.
///
/// The bootstrap fiber owns no heap stack; it stands for the thread's
/// original context. Creating it also installs it as the current fiber
/// when the thread has none.
pub fn bootstrap_fiber() -> Arc<Fiber> {
    if let Some(f) = BOOTSTRAP.with(|c| c.borrow().clone()) {
        return f;
    }
    let boot = Fiber::new_bootstrap();
    BOOTSTRAP.with(|c| *c.borrow_mut() = Some(boot.clone()));
    CURRENT.with(|c| {
        let mut cur = c.borrow_mut();
        if cur.is_none() {
            *cur = Some(boot.clone());
        }
    });
    boot
}

/// This thread's dispatcher fiber, if a scheduler loop runs here.
#[inline]
pub fn dispatcher_fiber() -> Option<Arc<Fiber>> {
    DISPATCHER.with(|c| c.borrow().clone())
}

#[inline]
pub(crate) fn set_dispatcher(f: Arc<Fiber>) {
    DISPATCHER.with(|c| *c.borrow_mut() = Some(f));
}

#[inline]
pub(crate) fn clear_dispatcher() {
    DISPATCHER.with(|c| *c.borrow_mut() = None);
}

#[cfg(test)]
mod tests {
    use super::*;
    use weft_core::FiberId;

    #[test]
    fn test_bootstrap_is_lazy_and_stable() {
        let a = bootstrap_fiber();
        let b = bootstrap_fiber();
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(a.id(), FiberId::BOOTSTRAP);
    }

    #[test]
    fn test_bootstrap_becomes_current() {
        let boot = bootstrap_fiber();
        let cur = current_fiber().expect("bootstrap should install itself as current");
        assert!(Arc::ptr_eq(&boot, &cur));
    }
}
