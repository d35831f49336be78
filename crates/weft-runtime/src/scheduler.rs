//! Fiber scheduler
//!
//! A `Scheduler` owns a pool of named worker threads over one FIFO ready
//! queue. Each worker runs the dispatch loop: take a task (skipping tasks
//! affined to other workers), resume its fiber or run its callback inside a
//! reusable callback fiber, and fall into the per-worker idle fiber when
//! the queue is empty.
//!
//! The `Dispatch` trait is the customization seam: the plain `Scheduler`
//! busy-yields in idle and has a no-op `notify`, while `IoManager`
//! overrides both with an epoll loop and a self-pipe wakeup, and extends
//! the `stopping` conjunction with its own conditions.
//!
//! With `use_caller`, the constructing thread becomes one of the workers:
//! a dispatcher fiber is created on it and `stop` drives that fiber until
//! the termination predicate holds.

use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle, ThreadId};

use tracing::{debug, error, warn};
use weft_core::error::{RuntimeError, RuntimeResult};
use weft_core::sync::Semaphore;
use weft_core::FiberState;

use crate::fiber::{self, EntryFn, Fiber, FiberExt, ReturnTo};
use crate::hook;
use crate::tls;

thread_local! {
    static WORKER_ID: Cell<usize> = const { Cell::new(usize::MAX) };
    static CURRENT_SCHED: RefCell<Option<Arc<dyn Dispatch>>> = const { RefCell::new(None) };
}

/// Worker index of the current thread, if it is a scheduler worker.
#[inline]
pub fn current_worker_id() -> Option<usize> {
    let id = WORKER_ID.with(|c| c.get());
    if id == usize::MAX {
        None
    } else {
        Some(id)
    }
}

/// The scheduler driving the current thread, if any.
#[inline]
pub fn current() -> Option<Arc<dyn Dispatch>> {
    CURRENT_SCHED.with(|c| c.borrow().clone())
}

/// A unit of work in the ready queue: a fiber handle or a callback, with an
/// optional worker affinity.
pub struct Task {
    pub(crate) fiber: Option<Arc<Fiber>>,
    pub(crate) call: Option<EntryFn>,
    pub(crate) affinity: Option<usize>,
}

impl Task {
    /// Schedule an existing fiber.
    pub fn fiber(f: Arc<Fiber>) -> Task {
        Task {
            fiber: Some(f),
            call: None,
            affinity: None,
        }
    }

    /// Schedule a callback; the dispatcher wraps it in a reusable fiber.
    pub fn call(f: impl FnOnce() + Send + 'static) -> Task {
        Task::call_boxed(Box::new(f))
    }

    pub(crate) fn call_boxed(f: EntryFn) -> Task {
        Task {
            fiber: None,
            call: Some(f),
            affinity: None,
        }
    }

    /// Restrict execution to the given worker index.
    pub fn with_affinity(mut self, worker: usize) -> Task {
        self.affinity = Some(worker);
        self
    }
}

/// Worker pool plus ready queue. See the module docs.
pub struct Scheduler {
    name: String,
    queue: Mutex<VecDeque<Task>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    /// Total workers, the caller included when `use_caller`.
    worker_count: usize,
    /// OS threads the scheduler spawns itself.
    spawned_count: usize,
    use_caller: bool,
    caller_thread: Option<ThreadId>,
    caller_dispatcher: Mutex<Option<Arc<Fiber>>>,
    active_workers: AtomicUsize,
    idle_workers: AtomicUsize,
    started: AtomicBool,
    stop_requested: AtomicBool,
    start_sem: Semaphore,
}

impl Scheduler {
    /// Create a scheduler with `worker_count` workers.
    ///
    /// With `use_caller`, the calling thread becomes the last worker
    /// (index `worker_count - 1`) and one fewer OS thread is spawned;
    /// `start` and `stop` must then run on this thread.
    pub fn new(worker_count: usize, use_caller: bool, name: &str) -> Scheduler {
        assert!(worker_count > 0, "scheduler needs at least one worker");
        let spawned_count = worker_count - use_caller as usize;
        Scheduler {
            name: name.to_string(),
            queue: Mutex::new(VecDeque::new()),
            workers: Mutex::new(Vec::new()),
            worker_count,
            spawned_count,
            use_caller,
            caller_thread: use_caller.then(|| thread::current().id()),
            caller_dispatcher: Mutex::new(None),
            active_workers: AtomicUsize::new(0),
            idle_workers: AtomicUsize::new(0),
            started: AtomicBool::new(false),
            stop_requested: AtomicBool::new(false),
            start_sem: Semaphore::new(0),
        }
    }

    #[inline]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[inline]
    pub fn worker_count(&self) -> usize {
        self.worker_count
    }

    #[inline]
    pub fn is_started(&self) -> bool {
        self.started.load(Ordering::Acquire)
    }

    #[inline]
    pub(crate) fn has_idle_workers(&self) -> bool {
        self.idle_workers.load(Ordering::Acquire) > 0
    }

    /// Push one task; returns whether the queue was empty before.
    pub(crate) fn push(&self, task: Task) -> bool {
        let mut q = self.queue.lock().unwrap();
        let was_empty = q.is_empty();
        q.push_back(task);
        was_empty
    }

    /// Push a batch; returns whether the queue was empty before.
    pub(crate) fn push_all(&self, tasks: Vec<Task>) -> bool {
        let mut q = self.queue.lock().unwrap();
        let was_empty = q.is_empty();
        q.extend(tasks);
        was_empty
    }

    /// Base termination predicate: stop requested, queue drained, and no
    /// worker mid-task. Subclasses extend this conjunction.
    pub(crate) fn base_stopping(&self) -> bool {
        self.stop_requested.load(Ordering::Acquire)
            && self.queue.lock().unwrap().is_empty()
            && self.active_workers.load(Ordering::Acquire) == 0
    }

    fn start_with(&self, this: Arc<dyn Dispatch>) -> RuntimeResult<()> {
        if self.started.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.stop_requested.store(false, Ordering::SeqCst);
        debug!(name = %self.name, workers = self.worker_count, "scheduler starting");

        {
            let mut workers = self.workers.lock().unwrap();
            for i in 0..self.spawned_count {
                let this = this.clone();
                let handle = thread::Builder::new()
                    .name(format!("{}-{}", self.name, i))
                    .spawn(move || worker_main(this, i))
                    .map_err(|_| RuntimeError::ResourceExhausted("worker thread spawn"))?;
                workers.push(handle);
            }
        }
        // Workers post once their thread-locals are wired up, so tasks
        // scheduled right after start() always find live dispatchers.
        for _ in 0..self.spawned_count {
            self.start_sem.wait();
        }

        if self.use_caller {
            if self.caller_thread != Some(thread::current().id()) {
                warn!(name = %self.name, "use_caller scheduler started off the caller thread");
            }
            CURRENT_SCHED.with(|c| *c.borrow_mut() = Some(this.clone()));
            let caller_id = self.spawned_count;
            let weak = Arc::downgrade(&this);
            let dispatcher = Fiber::new(
                move || {
                    if let Some(this) = weak.upgrade() {
                        caller_dispatch(this, caller_id);
                    }
                },
                0,
                ReturnTo::Thread,
            )?;
            *self.caller_dispatcher.lock().unwrap() = Some(dispatcher);
        }
        Ok(())
    }

    fn stop_with(&self, this: Arc<dyn Dispatch>) {
        if !self.started.load(Ordering::SeqCst) {
            return;
        }
        debug!(name = %self.name, "scheduler stopping");
        self.stop_requested.store(true, Ordering::SeqCst);

        if self.use_caller {
            if self.caller_thread != Some(thread::current().id()) {
                warn!(name = %self.name, "use_caller scheduler stopped off the caller thread");
            }
            // Drain remaining work on the caller thread: the dispatcher
            // fiber runs the full dispatch loop until stopping() holds.
            let dispatcher = self.caller_dispatcher.lock().unwrap().take();
            if let Some(dispatcher) = dispatcher {
                if let Err(e) = dispatcher.resume() {
                    error!(name = %self.name, "caller dispatcher failed: {}", e);
                }
            }
        }

        for _ in 0..self.spawned_count {
            this.notify();
        }

        let handles = std::mem::take(&mut *self.workers.lock().unwrap());
        for h in handles {
            let _ = h.join();
        }
        self.started.store(false, Ordering::SeqCst);
        debug!(name = %self.name, "scheduler stopped");
    }
}

/// Customization seam between the plain scheduler and its extensions.
///
/// Object safe: worker threads hold an `Arc<dyn Dispatch>` and drive
/// everything through it.
pub trait Dispatch: Send + Sync + 'static {
    /// The underlying scheduler state.
    fn scheduler(&self) -> &Scheduler;

    /// Wake one sleeping worker. No-op for the plain scheduler, whose idle
    /// fiber busy-yields.
    fn notify(&self) {}

    /// Termination predicate; extensions strengthen the conjunction.
    fn stopping(&self) -> bool {
        self.scheduler().base_stopping()
    }

    /// Body of the per-worker idle fiber.
    fn idle(&self) {
        while !self.stopping() {
            fiber::yield_hold();
        }
    }

    /// Per-worker thread-local setup hook.
    fn bind_worker(&self) {}

    /// Push a task; wakes a worker when the queue was previously empty.
    fn schedule(&self, task: Task) {
        if self.scheduler().push(task) {
            self.notify();
        }
    }

    /// Bulk push with a single wakeup.
    fn schedule_all(&self, tasks: Vec<Task>) {
        if tasks.is_empty() {
            return;
        }
        if self.scheduler().push_all(tasks) {
            self.notify();
        }
    }
}

impl Dispatch for Scheduler {
    fn scheduler(&self) -> &Scheduler {
        self
    }
}

/// `start` / `stop` need an owned handle to hand to worker threads, so
/// they live on the `Arc` handle rather than the scheduler itself.
pub trait DispatchExt {
    /// Spawn worker threads and begin dispatching. Idempotent while
    /// started.
    fn start(&self) -> RuntimeResult<()>;

    /// Request graceful termination, drain the queue, and join all
    /// workers. With `use_caller`, must run on the constructing thread.
    fn stop(&self);
}

impl<T: Dispatch> DispatchExt for Arc<T> {
    fn start(&self) -> RuntimeResult<()> {
        let this: Arc<dyn Dispatch> = self.clone();
        self.scheduler().start_with(this)
    }

    fn stop(&self) {
        let this: Arc<dyn Dispatch> = self.clone();
        self.scheduler().stop_with(this)
    }
}

/// Entry of a spawned worker thread: the dispatcher runs directly on the
/// thread's bootstrap context.
fn worker_main(this: Arc<dyn Dispatch>, worker_id: usize) {
    WORKER_ID.with(|c| c.set(worker_id));
    CURRENT_SCHED.with(|c| *c.borrow_mut() = Some(this.clone()));
    let boot = tls::bootstrap_fiber();
    tls::set_dispatcher(boot);
    this.bind_worker();
    hook::set_hook_enabled(true);
    this.scheduler().start_sem.post();

    dispatch_loop(&this, worker_id);

    tls::clear_dispatcher();
}

/// Body of the caller thread's dispatcher fiber.
fn caller_dispatch(this: Arc<dyn Dispatch>, worker_id: usize) {
    WORKER_ID.with(|c| c.set(worker_id));
    // The dispatcher fiber itself is this thread's dispatcher.
    tls::set_dispatcher(Fiber::current());
    this.bind_worker();
    let was_hooked = hook::hook_enabled();
    hook::set_hook_enabled(true);

    dispatch_loop(&this, worker_id);

    hook::set_hook_enabled(was_hooked);
    tls::clear_dispatcher();
    WORKER_ID.with(|c| c.set(usize::MAX));
}

/// The dispatch loop every worker runs; see module docs for the shape.
fn dispatch_loop(this: &Arc<dyn Dispatch>, worker_id: usize) {
    let sched = this.scheduler();

    let idle_this = this.clone();
    let idle = match Fiber::new(move || idle_this.idle(), 0, ReturnTo::Dispatcher) {
        Ok(f) => f,
        Err(e) => {
            error!(worker = worker_id, "cannot create idle fiber: {}", e);
            return;
        }
    };
    // Reusable carrier for callback tasks; replaced when its fiber
    // suspends and is owned elsewhere.
    let mut cb_fiber: Option<Arc<Fiber>> = None;

    loop {
        let mut notify_other = false;
        let mut task: Option<Task> = None;
        {
            let mut q = sched.queue.lock().unwrap();
            let mut i = 0;
            while i < q.len() {
                if let Some(w) = q[i].affinity {
                    if w != worker_id {
                        // Not ours; make sure its owner is awake.
                        notify_other = true;
                        i += 1;
                        continue;
                    }
                }
                if let Some(f) = &q[i].fiber {
                    if f.state() == FiberState::Running {
                        // Still winding down on another worker after a
                        // yield; retry later.
                        i += 1;
                        continue;
                    }
                }
                task = q.remove(i);
                sched.active_workers.fetch_add(1, Ordering::SeqCst);
                break;
            }
        }
        if notify_other {
            this.notify();
        }

        if let Some(task) = task {
            run_task(this, task, &mut cb_fiber);
            sched.active_workers.fetch_sub(1, Ordering::SeqCst);
            continue;
        }

        if idle.state() == FiberState::Done {
            debug!(worker = worker_id, "idle fiber finished; dispatcher exiting");
            break;
        }
        sched.idle_workers.fetch_add(1, Ordering::SeqCst);
        if let Err(e) = idle.resume() {
            error!(worker = worker_id, "idle fiber resume failed: {}", e);
            sched.idle_workers.fetch_sub(1, Ordering::SeqCst);
            break;
        }
        sched.idle_workers.fetch_sub(1, Ordering::SeqCst);
    }
}

fn run_task(this: &Arc<dyn Dispatch>, task: Task, cb_fiber: &mut Option<Arc<Fiber>>) {
    let affinity = task.affinity;

    if let Some(f) = task.fiber {
        if f.state().is_terminated() {
            return;
        }
        if let Err(e) = f.resume() {
            warn!(fiber = %f.id(), "task fiber resume failed: {}", e);
            return;
        }
        if f.state() == FiberState::Ready {
            let mut t = Task::fiber(f);
            t.affinity = affinity;
            this.schedule(t);
        }
        // SUSPENDED: some event or timer holds the handle and will
        // re-enqueue it. DONE/FAULTED: dropped here.
        return;
    }

    if let Some(call) = task.call {
        let f = match cb_fiber.take() {
            Some(f) => {
                if let Err(e) = f.reset_boxed(call) {
                    error!("callback fiber reset failed: {}", e);
                    return;
                }
                f
            }
            None => match Fiber::new(call, 0, ReturnTo::Dispatcher) {
                Ok(f) => f,
                Err(e) => {
                    error!("callback fiber allocation failed: {}", e);
                    return;
                }
            },
        };
        if let Err(e) = f.resume() {
            warn!(fiber = %f.id(), "callback fiber resume failed: {}", e);
            return;
        }
        match f.state() {
            FiberState::Ready => {
                let mut t = Task::fiber(f);
                t.affinity = affinity;
                this.schedule(t);
            }
            FiberState::Done | FiberState::Faulted => {
                // Keep the stack for the next callback.
                *cb_fiber = Some(f);
            }
            _ => {
                // Suspended mid-callback: the pending event owns it now; a
                // fresh carrier is allocated for the next callback.
            }
        }
    }
}
