//! Fiber identifiers
//!
//! Ids are assigned from a process-wide monotonic counter. Id 0 is reserved
//! for the per-thread bootstrap fiber (the thread's original context).

use core::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

static NEXT_FIBER_ID: AtomicU64 = AtomicU64::new(1);

/// Unique identifier of a fiber.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FiberId(u64);

impl FiberId {
    /// Id of every thread's bootstrap fiber.
    pub const BOOTSTRAP: FiberId = FiberId(0);

    /// Allocate the next id.
    pub fn next() -> FiberId {
        FiberId(NEXT_FIBER_ID.fetch_add(1, Ordering::Relaxed))
    }

    #[inline]
    pub fn as_u64(&self) -> u64 {
        self.0
    }

    #[inline]
    pub fn is_bootstrap(&self) -> bool {
        self.0 == 0
    }
}

impl fmt::Display for FiberId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ids_are_unique_and_monotonic() {
        let a = FiberId::next();
        let b = FiberId::next();
        let c = FiberId::next();
        assert!(a < b && b < c);
        assert!(!a.is_bootstrap());
    }

    #[test]
    fn test_bootstrap_id() {
        assert!(FiberId::BOOTSTRAP.is_bootstrap());
        assert_eq!(FiberId::BOOTSTRAP.as_u64(), 0);
    }
}
