//! Readiness-driven scheduler extension
//!
//! `IoManager` is a `Scheduler` whose idle fiber runs an edge-triggered
//! epoll loop integrated with a `TimerManager`. Fibers (or callbacks)
//! register interest in `(fd, READ|WRITE)`; when readiness fires, the
//! registered party is pushed back onto the scheduler.
//!
//! Cross-thread wakeup uses a self-pipe whose read end sits in the epoll
//! set; `notify` writes one byte when at least one worker is parked in
//! `epoll_wait`.
//!
//! Construction failures (epoll, pipe, initial registration) are fatal:
//! no partially-built IoManager is ever returned.

use std::cell::RefCell;
use std::ops::Deref;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, RwLock, Weak};

use bitflags::bitflags;
use tracing::{debug, error, trace};
use weft_core::error::{RuntimeError, RuntimeResult};
use weft_core::sync::SpinLock;

use crate::fiber::{self, EntryFn, Fiber};
use crate::hook;
use crate::scheduler::{Dispatch, DispatchExt, Scheduler, Task};
use crate::timer::{Clock, Timer, TimerManager};
use crate::tls;

bitflags! {
    /// Readiness event kinds. Values match EPOLLIN / EPOLLOUT.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct EventKind: u32 {
        const READ = 0x1;
        const WRITE = 0x4;
    }
}

/// Capacity of one `epoll_wait` batch.
const EVENT_CAP: usize = 64;
/// Upper bound on the epoll timeout, so new timers and stop requests are
/// observed without busy-polling.
const MAX_TIMEOUT_MS: u64 = 3000;

/// What to run, and where, when a registered event fires.
struct EventSlot {
    scheduler: Weak<IoManager>,
    fiber: Option<Arc<Fiber>>,
    call: Option<EntryFn>,
}

impl EventSlot {
    const fn empty() -> EventSlot {
        EventSlot {
            scheduler: Weak::new(),
            fiber: None,
            call: None,
        }
    }

    fn take(&mut self) -> EventSlot {
        std::mem::replace(self, EventSlot::empty())
    }

    fn clear(&mut self) {
        *self = EventSlot::empty();
    }
}

struct FdEvents {
    registered: EventKind,
    read: EventSlot,
    write: EventSlot,
}

impl FdEvents {
    fn slot_mut(&mut self, kind: EventKind) -> &mut EventSlot {
        if kind == EventKind::READ {
            &mut self.read
        } else {
            &mut self.write
        }
    }
}

/// Per-fd registration state. The spin lock guards the `registered`
/// bitmask and both event slots; critical sections stay tiny and never
/// cross a suspension point.
pub struct FdContext {
    fd: libc::c_int,
    inner: SpinLock<FdEvents>,
}

impl FdContext {
    fn new(fd: libc::c_int) -> FdContext {
        FdContext {
            fd,
            inner: SpinLock::new(FdEvents {
                registered: EventKind::empty(),
                read: EventSlot::empty(),
                write: EventSlot::empty(),
            }),
        }
    }

    /// Currently registered kinds (for tests and introspection).
    pub fn registered(&self) -> EventKind {
        self.inner.lock().registered
    }
}

thread_local! {
    static CURRENT_IO: RefCell<Weak<IoManager>> = const { RefCell::new(Weak::new()) };
}

/// The epoll-driven scheduler. Dereferences to its embedded `Scheduler`.
pub struct IoManager {
    sched: Scheduler,
    timers: TimerManager,
    epfd: libc::c_int,
    pipe_r: libc::c_int,
    pipe_w: libc::c_int,
    pending: AtomicUsize,
    fd_contexts: RwLock<Vec<Arc<FdContext>>>,
    self_weak: Weak<IoManager>,
}

impl Deref for IoManager {
    type Target = Scheduler;

    fn deref(&self) -> &Scheduler {
        &self.sched
    }
}

impl IoManager {
    /// Build and start an IoManager with `worker_count` workers.
    pub fn new(worker_count: usize, use_caller: bool, name: &str) -> RuntimeResult<Arc<IoManager>> {
        Self::with_clock(worker_count, use_caller, name, Clock::monotonic())
    }

    /// As `new`, with an explicit timer clock (tests use a manual one).
    pub fn with_clock(
        worker_count: usize,
        use_caller: bool,
        name: &str,
        clock: Clock,
    ) -> RuntimeResult<Arc<IoManager>> {
        let epfd = unsafe { libc::epoll_create1(libc::EPOLL_CLOEXEC) };
        if epfd < 0 {
            return Err(RuntimeError::ResourceExhausted("epoll_create1"));
        }
        let mut pipe_fds = [0 as libc::c_int; 2];
        if unsafe { libc::pipe2(pipe_fds.as_mut_ptr(), libc::O_NONBLOCK | libc::O_CLOEXEC) } != 0 {
            hook::real_close(epfd);
            return Err(RuntimeError::ResourceExhausted("self-pipe"));
        }
        let (pipe_r, pipe_w) = (pipe_fds[0], pipe_fds[1]);

        let mut ev = libc::epoll_event {
            events: (libc::EPOLLIN | libc::EPOLLET) as u32,
            u64: pipe_r as u64,
        };
        if unsafe { libc::epoll_ctl(epfd, libc::EPOLL_CTL_ADD, pipe_r, &mut ev) } != 0 {
            hook::real_close(epfd);
            hook::real_close(pipe_r);
            hook::real_close(pipe_w);
            return Err(RuntimeError::ResourceExhausted("self-pipe epoll registration"));
        }

        let iom = Arc::new_cyclic(|weak| IoManager {
            sched: Scheduler::new(worker_count, use_caller, name),
            timers: TimerManager::new(clock),
            epfd,
            pipe_r,
            pipe_w,
            pending: AtomicUsize::new(0),
            fd_contexts: RwLock::new(Vec::new()),
            self_weak: weak.clone(),
        });

        iom.resize_contexts(32);
        // A timer inserted at the new front must shorten a parked worker's
        // epoll timeout.
        let weak = iom.self_weak.clone();
        iom.timers.set_wake(move || {
            if let Some(m) = weak.upgrade() {
                m.notify();
            }
        });

        iom.start()?;
        debug!(name, workers = worker_count, "iomanager started");
        Ok(iom)
    }

    /// The IoManager driving the current worker thread, if any.
    pub fn current() -> Option<Arc<IoManager>> {
        CURRENT_IO.with(|c| c.borrow().upgrade())
    }

    /// The embedded timer manager.
    pub fn timers(&self) -> &TimerManager {
        &self.timers
    }

    /// Registered events not yet fired or cancelled.
    pub fn pending_events(&self) -> usize {
        self.pending.load(Ordering::Acquire)
    }

    /// See `TimerManager::add_timer`; timer callbacks run as scheduler
    /// tasks on this IoManager.
    pub fn add_timer(
        &self,
        interval_ms: u64,
        cb: impl Fn() + Send + Sync + 'static,
        periodic: bool,
    ) -> Timer {
        self.timers.add_timer(interval_ms, cb, periodic)
    }

    /// See `TimerManager::add_conditional_timer`.
    pub fn add_conditional_timer<T: Send + Sync + 'static>(
        &self,
        interval_ms: u64,
        cb: impl Fn() + Send + Sync + 'static,
        cond: Weak<T>,
        periodic: bool,
    ) -> Timer {
        self.timers.add_conditional_timer(interval_ms, cb, cond, periodic)
    }

    fn resize_contexts(&self, len: usize) {
        let mut v = self.fd_contexts.write().unwrap();
        let mut fd = v.len() as libc::c_int;
        while (v.len()) < len {
            v.push(Arc::new(FdContext::new(fd)));
            fd += 1;
        }
    }

    /// Slot for `fd`, growing the table to 1.5x on demand.
    fn context_for(&self, fd: libc::c_int) -> Arc<FdContext> {
        let idx = fd as usize;
        {
            let v = self.fd_contexts.read().unwrap();
            if idx < v.len() {
                return v[idx].clone();
            }
        }
        self.resize_contexts(idx + idx / 2 + 1);
        self.fd_contexts.read().unwrap()[idx].clone()
    }

    /// Register interest in `(fd, kind)`.
    ///
    /// With a callback, readiness schedules the callback. Without one, the
    /// currently running fiber is parked in the slot; the caller is
    /// expected to `yield_hold` immediately after. Fails when `(fd, kind)`
    /// is already registered, or when there is neither a callback nor a
    /// suspendable running fiber.
    pub fn add_event(
        &self,
        fd: libc::c_int,
        kind: EventKind,
        cb: Option<EntryFn>,
    ) -> RuntimeResult<()> {
        if fd < 0 {
            return Err(RuntimeError::InvalidState("add_event on negative fd"));
        }
        if kind != EventKind::READ && kind != EventKind::WRITE {
            return Err(RuntimeError::InvalidState("add_event takes exactly one kind"));
        }
        let (slot_fiber, slot_call) = match cb {
            Some(call) => (None, Some(call)),
            None => {
                let fiber = tls::current_fiber()
                    .filter(|f| !f.is_bootstrap())
                    .ok_or(RuntimeError::InvalidState(
                        "add_event without callback requires a running fiber",
                    ))?;
                (Some(fiber), None)
            }
        };

        let ctx = self.context_for(fd);
        let mut ev = ctx.inner.lock();
        if ev.registered.contains(kind) {
            error!(fd, ?kind, "event already registered");
            return Err(RuntimeError::InvalidState("event already registered for fd"));
        }

        let op = if ev.registered.is_empty() {
            libc::EPOLL_CTL_ADD
        } else {
            libc::EPOLL_CTL_MOD
        };
        let mut epev = libc::epoll_event {
            events: libc::EPOLLET as u32 | ev.registered.bits() | kind.bits(),
            u64: fd as u64,
        };
        if unsafe { libc::epoll_ctl(self.epfd, op, fd, &mut epev) } != 0 {
            let err = RuntimeError::last_os_error();
            error!(fd, ?kind, op, "epoll_ctl failed: {}", err);
            return Err(err);
        }

        self.pending.fetch_add(1, Ordering::AcqRel);
        ev.registered |= kind;
        let slot = ev.slot_mut(kind);
        slot.scheduler = self.self_weak.clone();
        slot.fiber = slot_fiber;
        slot.call = slot_call;
        trace!(fd, ?kind, "event registered");
        Ok(())
    }

    /// Rescind interest in `(fd, kind)` without firing the registered
    /// party.
    pub fn del_event(&self, fd: libc::c_int, kind: EventKind) -> RuntimeResult<()> {
        let Some(ctx) = self.lookup(fd) else {
            return Err(RuntimeError::InvalidState("del_event on unknown fd"));
        };
        let mut ev = ctx.inner.lock();
        if !ev.registered.contains(kind) {
            return Err(RuntimeError::InvalidState("del_event on unregistered kind"));
        }
        self.epoll_update(fd, ev.registered - kind)?;
        ev.registered -= kind;
        ev.slot_mut(kind).clear();
        self.pending.fetch_sub(1, Ordering::AcqRel);
        Ok(())
    }

    /// Remove interest in `(fd, kind)` and fire the registered party now.
    /// Used for forced wakeup: timeouts and `close`.
    pub fn cancel_event(&self, fd: libc::c_int, kind: EventKind) -> RuntimeResult<()> {
        let Some(ctx) = self.lookup(fd) else {
            return Err(RuntimeError::InvalidState("cancel_event on unknown fd"));
        };
        let fired = {
            let mut ev = ctx.inner.lock();
            if !ev.registered.contains(kind) {
                return Err(RuntimeError::InvalidState("cancel_event on unregistered kind"));
            }
            self.epoll_update(fd, ev.registered - kind)?;
            ev.registered -= kind;
            self.pending.fetch_sub(1, Ordering::AcqRel);
            ev.slot_mut(kind).take()
        };
        self.dispatch_slot(fired);
        Ok(())
    }

    /// Fire and remove everything registered on `fd`.
    pub fn cancel_all(&self, fd: libc::c_int) -> RuntimeResult<()> {
        let Some(ctx) = self.lookup(fd) else {
            return Err(RuntimeError::InvalidState("cancel_all on unknown fd"));
        };
        let (read, write) = {
            let mut ev = ctx.inner.lock();
            if ev.registered.is_empty() {
                return Err(RuntimeError::InvalidState("cancel_all with nothing registered"));
            }
            self.epoll_update(fd, EventKind::empty())?;
            let read = ev.registered.contains(EventKind::READ).then(|| {
                self.pending.fetch_sub(1, Ordering::AcqRel);
                ev.read.take()
            });
            let write = ev.registered.contains(EventKind::WRITE).then(|| {
                self.pending.fetch_sub(1, Ordering::AcqRel);
                ev.write.take()
            });
            ev.registered = EventKind::empty();
            (read, write)
        };
        if let Some(slot) = read {
            self.dispatch_slot(slot);
        }
        if let Some(slot) = write {
            self.dispatch_slot(slot);
        }
        Ok(())
    }

    fn lookup(&self, fd: libc::c_int) -> Option<Arc<FdContext>> {
        if fd < 0 {
            return None;
        }
        let v = self.fd_contexts.read().unwrap();
        v.get(fd as usize).cloned()
    }

    /// Reprogram the kernel interest set for `fd` to `remaining`.
    fn epoll_update(&self, fd: libc::c_int, remaining: EventKind) -> RuntimeResult<()> {
        let op = if remaining.is_empty() {
            libc::EPOLL_CTL_DEL
        } else {
            libc::EPOLL_CTL_MOD
        };
        let mut epev = libc::epoll_event {
            events: libc::EPOLLET as u32 | remaining.bits(),
            u64: fd as u64,
        };
        if unsafe { libc::epoll_ctl(self.epfd, op, fd, &mut epev) } != 0 {
            let err = RuntimeError::last_os_error();
            error!(fd, op, "epoll_ctl failed: {}", err);
            return Err(err);
        }
        Ok(())
    }

    /// Schedule whatever a fired slot names, on whichever IoManager it
    /// names. The slot was cleared before this call, so no pending
    /// registration keeps the fiber (or its captures) alive past firing.
    fn dispatch_slot(&self, slot: EventSlot) {
        let Some(target) = slot.scheduler.upgrade() else {
            return;
        };
        if let Some(call) = slot.call {
            target.schedule(Task::call_boxed(call));
        } else if let Some(f) = slot.fiber {
            target.schedule(Task::fiber(f));
        }
    }

    /// Extended termination predicate, also reporting the next timer
    /// deadline to the idle loop.
    fn stopping_with(&self, next_timeout: &mut u64) -> bool {
        *next_timeout = self.timers.next_due_in();
        *next_timeout == u64::MAX
            && self.pending.load(Ordering::Acquire) == 0
            && self.sched.base_stopping()
    }

    /// The epoll loop run by every worker's idle fiber.
    fn idle_loop(&self) {
        let mut events: [libc::epoll_event; EVENT_CAP] = unsafe { std::mem::zeroed() };

        loop {
            let mut next_timeout = 0u64;
            if self.stopping_with(&mut next_timeout) {
                debug!(name = %self.sched.name(), "idle loop exiting");
                // Cascade the wakeup so sibling workers parked in
                // epoll_wait observe the stop without the full timeout.
                self.notify();
                break;
            }

            let timeout_ms = next_timeout.min(MAX_TIMEOUT_MS) as libc::c_int;
            let n = loop {
                let r = unsafe {
                    libc::epoll_wait(self.epfd, events.as_mut_ptr(), EVENT_CAP as libc::c_int, timeout_ms)
                };
                if r < 0 && hook::errno() == libc::EINTR {
                    continue;
                }
                break r;
            };

            // Expired timers dispatch before readiness events from the
            // same tick, so timer-driven cancellations win.
            let expired = self.timers.drain_expired();
            if !expired.is_empty() {
                trace!(count = expired.len(), "timers expired");
                let tasks = expired
                    .into_iter()
                    .map(|cb| Task::call(move || cb()))
                    .collect();
                self.schedule_all(tasks);
            }

            for ev in events.iter().take(n.max(0) as usize) {
                self.process_event(ev);
            }

            // Hand the worker back to its dispatcher to run what we just
            // scheduled; it re-enters this loop when the queue drains.
            fiber::yield_hold();
        }
    }

    fn process_event(&self, ev: &libc::epoll_event) {
        let fd = ev.u64 as libc::c_int;
        if fd == self.pipe_r {
            // Edge-triggered: drain until EAGAIN.
            let mut buf = [0u8; 64];
            while hook::real_read(self.pipe_r, buf.as_mut_ptr() as *mut libc::c_void, buf.len()) > 0 {}
            return;
        }

        let Some(ctx) = self.lookup(fd) else {
            return;
        };
        let (read_slot, write_slot) = {
            let mut state = ctx.inner.lock();
            let mut revents = ev.events as i32;
            if revents & (libc::EPOLLERR | libc::EPOLLHUP) != 0 {
                // Errors and hangups must wake both directions.
                revents |= libc::EPOLLIN | libc::EPOLLOUT;
            }
            let mut kinds = EventKind::empty();
            if revents & libc::EPOLLIN != 0 {
                kinds |= EventKind::READ;
            }
            if revents & libc::EPOLLOUT != 0 {
                kinds |= EventKind::WRITE;
            }
            let fired = kinds & state.registered;
            if fired.is_empty() {
                return;
            }
            if self.epoll_update(fd, state.registered - fired).is_err() {
                return;
            }
            // READ dispatches before WRITE for a single poll return.
            let read = fired.contains(EventKind::READ).then(|| {
                state.registered -= EventKind::READ;
                self.pending.fetch_sub(1, Ordering::AcqRel);
                state.read.take()
            });
            let write = fired.contains(EventKind::WRITE).then(|| {
                state.registered -= EventKind::WRITE;
                self.pending.fetch_sub(1, Ordering::AcqRel);
                state.write.take()
            });
            (read, write)
        };
        if let Some(slot) = read_slot {
            self.dispatch_slot(slot);
        }
        if let Some(slot) = write_slot {
            self.dispatch_slot(slot);
        }
    }
}

impl Dispatch for IoManager {
    fn scheduler(&self) -> &Scheduler {
        &self.sched
    }

    /// Wake one parked worker through the self-pipe. Skipped when no
    /// worker is idle: busy workers re-check the queue on their own.
    fn notify(&self) {
        if !self.sched.has_idle_workers() {
            return;
        }
        let byte = [b'T'];
        let n = hook::real_write(self.pipe_w, byte.as_ptr() as *const libc::c_void, 1);
        if n != 1 {
            // Pipe full means wakeups are already pending; anything else
            // is unexpected.
            trace!(n, "self-pipe write short");
        }
    }

    fn stopping(&self) -> bool {
        let mut unused = 0;
        self.stopping_with(&mut unused)
    }

    fn idle(&self) {
        self.idle_loop();
    }

    fn bind_worker(&self) {
        CURRENT_IO.with(|c| *c.borrow_mut() = self.self_weak.clone());
    }
}

impl Drop for IoManager {
    fn drop(&mut self) {
        // Workers hold strong references, so by the time this runs the
        // pool has been stopped and joined.
        hook::real_close(self.epfd);
        hook::real_close(self.pipe_r);
        hook::real_close(self.pipe_w);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    fn socketpair() -> (libc::c_int, libc::c_int) {
        let mut fds = [0 as libc::c_int; 2];
        let ret = unsafe {
            libc::socketpair(libc::AF_UNIX, libc::SOCK_STREAM, 0, fds.as_mut_ptr())
        };
        assert_eq!(ret, 0);
        (fds[0], fds[1])
    }

    fn close_pair(a: libc::c_int, b: libc::c_int) {
        hook::real_close(a);
        hook::real_close(b);
    }

    #[test]
    fn test_add_event_fires_once_on_readiness() {
        let iom = IoManager::new(1, false, "io-ready").unwrap();
        let (a, b) = socketpair();

        let hits = Arc::new(AtomicUsize::new(0));
        let h = hits.clone();
        iom.add_event(a, EventKind::READ, Some(Box::new(move || {
            h.fetch_add(1, Ordering::SeqCst);
        })))
        .unwrap();
        assert_eq!(iom.pending_events(), 1);

        let msg = b"x";
        let n = hook::real_write(b, msg.as_ptr() as *const libc::c_void, 1);
        assert_eq!(n, 1);

        std::thread::sleep(Duration::from_millis(300));
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert_eq!(iom.pending_events(), 0);
        let ctx = iom.lookup(a).unwrap();
        assert!(ctx.registered().is_empty());

        iom.stop();
        close_pair(a, b);
    }

    #[test]
    fn test_double_add_is_invalid_state() {
        let iom = IoManager::new(1, false, "io-dup").unwrap();
        let (a, b) = socketpair();

        iom.add_event(a, EventKind::READ, Some(Box::new(|| {}))).unwrap();
        let second = iom.add_event(a, EventKind::READ, Some(Box::new(|| {})));
        assert!(matches!(second, Err(RuntimeError::InvalidState(_))));

        // READ and WRITE registrations are independent.
        iom.add_event(a, EventKind::WRITE, Some(Box::new(|| {}))).unwrap();

        iom.cancel_all(a).unwrap();
        iom.stop();
        close_pair(a, b);
    }

    #[test]
    fn test_add_event_without_fiber_or_callback_is_invalid() {
        let iom = IoManager::new(1, false, "io-nofiber").unwrap();
        let (a, b) = socketpair();

        let res = iom.add_event(a, EventKind::READ, None);
        assert!(matches!(res, Err(RuntimeError::InvalidState(_))));
        assert_eq!(iom.pending_events(), 0);

        iom.stop();
        close_pair(a, b);
    }

    #[test]
    fn test_cancel_event_fires_without_readiness() {
        let iom = IoManager::new(1, false, "io-cancel").unwrap();
        let (a, b) = socketpair();

        let hits = Arc::new(AtomicUsize::new(0));
        let h = hits.clone();
        // No data on the pair, so READ readiness never occurs on its own.
        iom.add_event(a, EventKind::READ, Some(Box::new(move || {
            h.fetch_add(1, Ordering::SeqCst);
        })))
        .unwrap();

        iom.cancel_event(a, EventKind::READ).unwrap();
        std::thread::sleep(Duration::from_millis(200));
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert_eq!(iom.pending_events(), 0);
        assert!(iom.lookup(a).unwrap().registered().is_empty());

        iom.stop();
        close_pair(a, b);
    }

    #[test]
    fn test_del_event_does_not_fire() {
        let iom = IoManager::new(1, false, "io-del").unwrap();
        let (a, b) = socketpair();

        let hits = Arc::new(AtomicUsize::new(0));
        let h = hits.clone();
        iom.add_event(a, EventKind::READ, Some(Box::new(move || {
            h.fetch_add(1, Ordering::SeqCst);
        })))
        .unwrap();
        iom.del_event(a, EventKind::READ).unwrap();
        assert_eq!(iom.pending_events(), 0);

        let n = hook::real_write(b, b"x".as_ptr() as *const libc::c_void, 1);
        assert_eq!(n, 1);
        std::thread::sleep(Duration::from_millis(200));
        assert_eq!(hits.load(Ordering::SeqCst), 0);

        iom.stop();
        close_pair(a, b);
    }

    #[test]
    fn test_cancel_all_fires_both_kinds() {
        let iom = IoManager::new(1, false, "io-cancel-all").unwrap();
        let (a, b) = socketpair();

        let hits = Arc::new(AtomicUsize::new(0));
        for _ in 0..1 {
            let h = hits.clone();
            iom.add_event(a, EventKind::READ, Some(Box::new(move || {
                h.fetch_add(1, Ordering::SeqCst);
            })))
            .unwrap();
            let h = hits.clone();
            iom.add_event(a, EventKind::WRITE, Some(Box::new(move || {
                h.fetch_add(1, Ordering::SeqCst);
            })))
            .unwrap();
        }
        assert_eq!(iom.pending_events(), 2);

        iom.cancel_all(a).unwrap();
        std::thread::sleep(Duration::from_millis(200));
        assert_eq!(hits.load(Ordering::SeqCst), 2);
        assert_eq!(iom.pending_events(), 0);
        assert!(iom.lookup(a).unwrap().registered().is_empty());

        iom.stop();
        close_pair(a, b);
    }

    #[test]
    fn test_timer_callback_runs_on_pool() {
        let iom = IoManager::new(1, false, "io-timer").unwrap();
        let hits = Arc::new(AtomicUsize::new(0));
        let h = hits.clone();
        iom.add_timer(50, move || {
            h.fetch_add(1, Ordering::SeqCst);
        }, false);

        std::thread::sleep(Duration::from_millis(400));
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        iom.stop();
    }

    #[test]
    fn test_periodic_timer_cadence() {
        let iom = IoManager::new(1, false, "io-periodic").unwrap();
        let hits = Arc::new(AtomicUsize::new(0));
        let h = hits.clone();
        let timer = iom.add_timer(100, move || {
            h.fetch_add(1, Ordering::SeqCst);
        }, true);

        std::thread::sleep(Duration::from_millis(1050));
        timer.cancel();
        let seen = hits.load(Ordering::SeqCst);
        assert!((9..=11).contains(&seen), "expected ~10 firings, got {}", seen);

        std::thread::sleep(Duration::from_millis(250));
        assert_eq!(hits.load(Ordering::SeqCst), seen, "cancelled timer kept firing");
        iom.stop();
    }

    #[test]
    fn test_grows_context_table() {
        let iom = IoManager::new(1, false, "io-grow").unwrap();
        let (a, b) = socketpair();
        // Force a lookup well past the initial 32 slots.
        let target = 200.max(a + 1);
        let ctx = iom.context_for(target);
        assert_eq!(ctx.fd, target);
        assert!(iom.fd_contexts.read().unwrap().len() > target as usize);
        iom.stop();
        close_pair(a, b);
    }
}
