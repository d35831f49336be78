//! Deadline timers
//!
//! An ordered set of absolute millisecond deadlines on a monotonic clock.
//! The owner (the IoManager's idle loop) polls `next_due_in` to size its
//! epoll timeout and calls `drain_expired` each tick; an insertion that
//! becomes the new earliest deadline fires a registered wake hook so the
//! poller recomputes its timeout. The `ticked` flag debounces that hook
//! between polls.
//!
//! Ordering key is `(deadline, id)`: deadline ascending with the unique id
//! as tiebreak, so equal deadlines drain in insertion order and any timer
//! can be found for cancellation in O(log n).
//!
//! If the clock is observed more than one hour behind the previous poll,
//! every live timer is treated as expired (clock rollover).

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, OnceLock, RwLock, Weak};

use tracing::warn;

/// Timer callback; periodic timers invoke it repeatedly.
pub type TimerFn = Arc<dyn Fn() + Send + Sync + 'static>;

const ROLLOVER_WINDOW_MS: u64 = 60 * 60 * 1000;

/// Millisecond clock. Monotonic in production; manual for tests that need
/// to move time (including backwards, to exercise rollover handling).
#[derive(Clone)]
pub struct Clock {
    manual: Option<Arc<AtomicU64>>,
}

impl Clock {
    /// CLOCK_MONOTONIC, in milliseconds.
    pub fn monotonic() -> Clock {
        Clock { manual: None }
    }

    /// A clock that only moves when told to.
    pub fn manual(start_ms: u64) -> Clock {
        Clock {
            manual: Some(Arc::new(AtomicU64::new(start_ms))),
        }
    }

    pub fn now_ms(&self) -> u64 {
        match &self.manual {
            Some(cell) => cell.load(Ordering::Acquire),
            None => {
                let mut ts = libc::timespec {
                    tv_sec: 0,
                    tv_nsec: 0,
                };
                unsafe {
                    libc::clock_gettime(libc::CLOCK_MONOTONIC, &mut ts);
                }
                ts.tv_sec as u64 * 1000 + ts.tv_nsec as u64 / 1_000_000
            }
        }
    }

    /// Set a manual clock. Ignored (with a warning) on a monotonic clock.
    pub fn set_ms(&self, ms: u64) {
        match &self.manual {
            Some(cell) => cell.store(ms, Ordering::Release),
            None => warn!("set_ms on a monotonic clock has no effect"),
        }
    }

    /// Advance a manual clock.
    pub fn advance_ms(&self, delta: u64) {
        if let Some(cell) = &self.manual {
            cell.fetch_add(delta, Ordering::AcqRel);
        } else {
            warn!("advance_ms on a monotonic clock has no effect");
        }
    }
}

struct TimerNode {
    id: u64,
    /// Shared with the handle so cancellation can locate the map key after
    /// periodic reinsertion or refresh.
    deadline: Arc<AtomicU64>,
    interval_ms: u64,
    periodic: bool,
    cb: TimerFn,
}

struct TimerSet {
    timers: BTreeMap<(u64, u64), TimerNode>,
    previous_ms: u64,
}

pub(crate) struct TimerCore {
    inner: RwLock<TimerSet>,
    /// Debounces the wake hook between `next_due_in` polls.
    ticked: AtomicBool,
    wake: OnceLock<Box<dyn Fn() + Send + Sync>>,
    clock: Clock,
    next_id: AtomicU64,
}

impl TimerCore {
    fn fire_wake(&self) {
        if let Some(wake) = self.wake.get() {
            wake();
        }
    }

    /// Insert a node, firing the wake hook when it becomes the earliest
    /// and no wakeup is already pending.
    fn insert(&self, deadline: u64, node: TimerNode) {
        let id = node.id;
        let at_front = {
            let mut inner = self.inner.write().unwrap();
            inner.timers.insert((deadline, id), node);
            inner.timers.keys().next() == Some(&(deadline, id))
        };
        if at_front && !self.ticked.swap(true, Ordering::SeqCst) {
            self.fire_wake();
        }
    }
}

/// The ordered deadline store. Embedded in the IoManager; usable on its
/// own with a manual clock for deterministic tests.
pub struct TimerManager {
    core: Arc<TimerCore>,
}

impl TimerManager {
    pub fn new(clock: Clock) -> TimerManager {
        let previous_ms = clock.now_ms();
        TimerManager {
            core: Arc::new(TimerCore {
                inner: RwLock::new(TimerSet {
                    timers: BTreeMap::new(),
                    previous_ms,
                }),
                ticked: AtomicBool::new(false),
                wake: OnceLock::new(),
                clock,
                next_id: AtomicU64::new(1),
            }),
        }
    }

    /// Register the front-insertion wake hook. One registration only.
    pub(crate) fn set_wake(&self, wake: impl Fn() + Send + Sync + 'static) {
        let _ = self.core.wake.set(Box::new(wake));
    }

    pub fn clock(&self) -> &Clock {
        &self.core.clock
    }

    /// Add a timer due in `interval_ms`. Periodic timers re-arm themselves
    /// on expiry with deadline = now + interval.
    pub fn add_timer(
        &self,
        interval_ms: u64,
        cb: impl Fn() + Send + Sync + 'static,
        periodic: bool,
    ) -> Timer {
        self.add_timer_fn(interval_ms, Arc::new(cb), periodic)
    }

    /// Add a timer whose callback is skipped unless `cond` still resolves
    /// to a live referent at firing time. This is how hooked I/O says
    /// "fire my timeout only if my caller is still waiting".
    pub fn add_conditional_timer<T: Send + Sync + 'static>(
        &self,
        interval_ms: u64,
        cb: impl Fn() + Send + Sync + 'static,
        cond: Weak<T>,
        periodic: bool,
    ) -> Timer {
        let cb: TimerFn = Arc::new(cb);
        let wrapped: TimerFn = Arc::new(move || {
            if cond.upgrade().is_some() {
                cb();
            }
        });
        self.add_timer_fn(interval_ms, wrapped, periodic)
    }

    fn add_timer_fn(&self, interval_ms: u64, cb: TimerFn, periodic: bool) -> Timer {
        let core = &self.core;
        let id = core.next_id.fetch_add(1, Ordering::Relaxed);
        let deadline = core.clock.now_ms() + interval_ms;
        let deadline_cell = Arc::new(AtomicU64::new(deadline));
        core.insert(
            deadline,
            TimerNode {
                id,
                deadline: deadline_cell.clone(),
                interval_ms,
                periodic,
                cb,
            },
        );
        Timer {
            id,
            deadline: deadline_cell,
            core: Arc::downgrade(core),
        }
    }

    /// Milliseconds until the earliest deadline: `u64::MAX` when the set is
    /// empty, 0 when it is already due. Clears the wake debounce so the
    /// next front insertion wakes the poller again.
    pub fn next_due_in(&self) -> u64 {
        self.core.ticked.store(false, Ordering::SeqCst);
        let inner = self.core.inner.read().unwrap();
        match inner.timers.keys().next() {
            None => u64::MAX,
            Some(&(deadline, _)) => {
                let now = self.core.clock.now_ms();
                deadline.saturating_sub(now)
            }
        }
    }

    /// Remove and return the callbacks of every timer with deadline <= now,
    /// re-arming periodic ones. On clock rollover the whole set drains.
    pub fn drain_expired(&self) -> Vec<TimerFn> {
        let now = self.core.clock.now_ms();
        {
            let inner = self.core.inner.read().unwrap();
            if inner.timers.is_empty() {
                return Vec::new();
            }
        }

        let mut inner = self.core.inner.write().unwrap();
        let rollover = now < inner.previous_ms.saturating_sub(ROLLOVER_WINDOW_MS);
        if rollover {
            warn!(
                previous_ms = inner.previous_ms,
                now_ms = now,
                live = inner.timers.len(),
                "clock moved backwards; expiring every live timer"
            );
        }
        inner.previous_ms = now;

        let first_due = inner.timers.keys().next().map(|&(deadline, _)| deadline);
        let expired = if rollover {
            std::mem::take(&mut inner.timers)
        } else {
            match first_due {
                Some(deadline) if deadline <= now => {
                    let rest = inner.timers.split_off(&(now + 1, 0));
                    std::mem::replace(&mut inner.timers, rest)
                }
                _ => return Vec::new(),
            }
        };

        let mut cbs = Vec::with_capacity(expired.len());
        for (_, node) in expired {
            cbs.push(node.cb.clone());
            if node.periodic {
                let next = now + node.interval_ms;
                node.deadline.store(next, Ordering::Release);
                inner.timers.insert((next, node.id), node);
            }
        }
        cbs
    }

    pub fn has_timer(&self) -> bool {
        !self.core.inner.read().unwrap().timers.is_empty()
    }

    pub fn timer_count(&self) -> usize {
        self.core.inner.read().unwrap().timers.len()
    }
}

/// Handle to a pending timer.
///
/// Holds no strong reference to the manager; operations on a timer whose
/// manager is gone report failure.
pub struct Timer {
    id: u64,
    deadline: Arc<AtomicU64>,
    core: Weak<TimerCore>,
}

impl Timer {
    /// Remove the timer before it fires. False when it already fired
    /// (non-periodic), was cancelled, or the manager is gone.
    pub fn cancel(&self) -> bool {
        let Some(core) = self.core.upgrade() else {
            return false;
        };
        let key = (self.deadline.load(Ordering::Acquire), self.id);
        let removed = core.inner.write().unwrap().timers.remove(&key).is_some();
        removed
    }

    /// Push the deadline out to now + interval, keeping the interval.
    pub fn refresh_deadline(&self) -> bool {
        let Some(core) = self.core.upgrade() else {
            return false;
        };
        let mut inner = core.inner.write().unwrap();
        let key = (self.deadline.load(Ordering::Acquire), self.id);
        let Some(node) = inner.timers.remove(&key) else {
            return false;
        };
        let next = core.clock.now_ms() + node.interval_ms;
        node.deadline.store(next, Ordering::Release);
        inner.timers.insert((next, node.id), node);
        true
    }

    /// Change the interval; the new deadline is measured from now
    /// (`from_now`) or from the timer's original start point.
    pub fn reset(&self, interval_ms: u64, from_now: bool) -> bool {
        let Some(core) = self.core.upgrade() else {
            return false;
        };
        let node = {
            let mut inner = core.inner.write().unwrap();
            let key = (self.deadline.load(Ordering::Acquire), self.id);
            let Some(mut node) = inner.timers.remove(&key) else {
                return false;
            };
            if node.interval_ms == interval_ms && !from_now {
                inner.timers.insert(key, node);
                return true;
            }
            let start = if from_now {
                core.clock.now_ms()
            } else {
                key.0.saturating_sub(node.interval_ms)
            };
            node.interval_ms = interval_ms;
            let next = start + interval_ms;
            node.deadline.store(next, Ordering::Release);
            node
        };
        // Reinsertion may create a new earliest deadline; go through the
        // wake-checking path.
        let deadline = node.deadline.load(Ordering::Acquire);
        core.insert(deadline, node);
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Mutex;

    fn counting_cb(counter: &Arc<AtomicUsize>) -> impl Fn() + Send + Sync + 'static {
        let c = counter.clone();
        move || {
            c.fetch_add(1, Ordering::Relaxed);
        }
    }

    #[test]
    fn test_drain_in_deadline_order() {
        let clock = Clock::manual(1_000);
        let mgr = TimerManager::new(clock.clone());
        let order = Arc::new(Mutex::new(Vec::new()));
        for (label, interval) in [("c", 30u64), ("a", 10), ("b", 20)] {
            let order = order.clone();
            mgr.add_timer(interval, move || order.lock().unwrap().push(label), false);
        }

        clock.advance_ms(50);
        for cb in mgr.drain_expired() {
            cb();
        }
        assert_eq!(order.lock().unwrap().as_slice(), &["a", "b", "c"]);
        assert!(!mgr.has_timer());
    }

    #[test]
    fn test_next_due_in() {
        let clock = Clock::manual(0);
        let mgr = TimerManager::new(clock.clone());
        assert_eq!(mgr.next_due_in(), u64::MAX);

        mgr.add_timer(100, || {}, false);
        assert_eq!(mgr.next_due_in(), 100);

        clock.advance_ms(40);
        assert_eq!(mgr.next_due_in(), 60);

        clock.advance_ms(100);
        assert_eq!(mgr.next_due_in(), 0);
    }

    #[test]
    fn test_cancel_prevents_fire() {
        let clock = Clock::manual(0);
        let mgr = TimerManager::new(clock.clone());
        let fired = Arc::new(AtomicUsize::new(0));
        let t = mgr.add_timer(10, counting_cb(&fired), false);

        assert!(t.cancel());
        assert!(!t.cancel());

        clock.advance_ms(100);
        assert!(mgr.drain_expired().is_empty());
        assert_eq!(fired.load(Ordering::Relaxed), 0);
    }

    #[test]
    fn test_periodic_rearms() {
        let clock = Clock::manual(0);
        let mgr = TimerManager::new(clock.clone());
        let fired = Arc::new(AtomicUsize::new(0));
        let t = mgr.add_timer(100, counting_cb(&fired), true);

        for _ in 0..10 {
            clock.advance_ms(100);
            for cb in mgr.drain_expired() {
                cb();
            }
        }
        assert_eq!(fired.load(Ordering::Relaxed), 10);
        assert!(mgr.has_timer());

        assert!(t.cancel());
        clock.advance_ms(1000);
        assert!(mgr.drain_expired().is_empty());
    }

    #[test]
    fn test_conditional_timer_skips_dead_condition() {
        let clock = Clock::manual(0);
        let mgr = TimerManager::new(clock.clone());
        let fired = Arc::new(AtomicUsize::new(0));

        let live = Arc::new(());
        mgr.add_conditional_timer(10, counting_cb(&fired), Arc::downgrade(&live), false);

        let dropped = Arc::new(());
        let weak = Arc::downgrade(&dropped);
        drop(dropped);
        mgr.add_conditional_timer(10, counting_cb(&fired), weak, false);

        clock.advance_ms(20);
        for cb in mgr.drain_expired() {
            cb();
        }
        assert_eq!(fired.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn test_rollover_expires_everything_in_insertion_order() {
        let clock = Clock::manual(10_000_000);
        let mgr = TimerManager::new(clock.clone());
        // Establish previous_ms at the high water mark.
        mgr.add_timer(1, || {}, false);
        clock.advance_ms(5);
        for cb in mgr.drain_expired() {
            cb();
        }

        let order = Arc::new(Mutex::new(Vec::new()));
        for i in 0..5 {
            let order = order.clone();
            mgr.add_timer(10_000, move || order.lock().unwrap().push(i), false);
        }

        // Jump back two hours: every timer fires exactly once, in
        // insertion order (identical deadlines tiebreak on id).
        clock.set_ms(10_000_000 - 2 * 60 * 60 * 1000);
        let cbs = mgr.drain_expired();
        assert_eq!(cbs.len(), 5);
        for cb in cbs {
            cb();
        }
        assert_eq!(order.lock().unwrap().as_slice(), &[0, 1, 2, 3, 4]);
        assert!(!mgr.has_timer());
        assert!(mgr.drain_expired().is_empty());
    }

    #[test]
    fn test_small_regression_is_not_rollover() {
        let clock = Clock::manual(10_000_000);
        let mgr = TimerManager::new(clock.clone());
        mgr.add_timer(1, || {}, false);
        clock.advance_ms(5);
        assert_eq!(mgr.drain_expired().len(), 1);

        mgr.add_timer(10_000, || {}, false);
        // Ten minutes backwards is within the rollover window.
        clock.set_ms(10_000_000 - 10 * 60 * 1000);
        assert!(mgr.drain_expired().is_empty());
        assert!(mgr.has_timer());
    }

    #[test]
    fn test_refresh_pushes_deadline_out() {
        let clock = Clock::manual(0);
        let mgr = TimerManager::new(clock.clone());
        let fired = Arc::new(AtomicUsize::new(0));
        let t = mgr.add_timer(100, counting_cb(&fired), false);

        clock.advance_ms(90);
        assert!(t.refresh_deadline());
        clock.advance_ms(50);
        // Old deadline (100) has passed but refresh moved it to 190.
        assert!(mgr.drain_expired().is_empty());

        clock.advance_ms(60);
        assert_eq!(mgr.drain_expired().len(), 1);
    }

    #[test]
    fn test_reset_interval() {
        let clock = Clock::manual(0);
        let mgr = TimerManager::new(clock.clone());
        let t = mgr.add_timer(100, || {}, false);

        assert!(t.reset(100, false)); // no-op shape
        assert!(t.reset(500, true));
        clock.advance_ms(200);
        assert!(mgr.drain_expired().is_empty());
        clock.advance_ms(301);
        assert_eq!(mgr.drain_expired().len(), 1);

        // Fired timers cannot be reset.
        assert!(!t.reset(100, true));
    }

    #[test]
    fn test_front_insert_wakes_once_until_polled() {
        let mgr = TimerManager::new(Clock::manual(0));
        let wakes = Arc::new(AtomicUsize::new(0));
        let w = wakes.clone();
        mgr.set_wake(move || {
            w.fetch_add(1, Ordering::Relaxed);
        });

        mgr.add_timer(100, || {}, false);
        assert_eq!(wakes.load(Ordering::Relaxed), 1);

        // Earlier than the current front, but a wake is already pending.
        mgr.add_timer(50, || {}, false);
        assert_eq!(wakes.load(Ordering::Relaxed), 1);

        // Polling clears the debounce; the next front insert wakes again.
        let _ = mgr.next_due_in();
        mgr.add_timer(10, || {}, false);
        assert_eq!(wakes.load(Ordering::Relaxed), 2);

        // Not at the front: no wake.
        let _ = mgr.next_due_in();
        mgr.add_timer(5_000, || {}, false);
        assert_eq!(wakes.load(Ordering::Relaxed), 2);
    }
}
