//! Use-caller mode: the constructing thread doubles as a worker, and
//! `stop` drives its dispatcher fiber until everything drains.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use weft::{Dispatch, DispatchExt, IoManager, Task};

#[test]
fn use_caller_iomanager_drains_on_stop() {
    let caller = std::thread::current().id();
    let iom = IoManager::new(1, true, "uc-io").unwrap();

    let hits = Arc::new(AtomicUsize::new(0));
    let thread_seen = Arc::new(Mutex::new(None));

    for _ in 0..10 {
        let hits = hits.clone();
        let ts = thread_seen.clone();
        iom.schedule(Task::call(move || {
            // Cooperates even in caller mode: completion returns to the
            // caller's dispatcher fiber, not the thread's original context.
            weft::sleep_ms(20);
            hits.fetch_add(1, Ordering::SeqCst);
            *ts.lock().unwrap() = Some(std::thread::current().id());
        }));
    }

    // Nothing has run yet: the only worker is the caller itself.
    assert_eq!(hits.load(Ordering::SeqCst), 0);

    iom.stop();
    assert_eq!(hits.load(Ordering::SeqCst), 10);
    assert_eq!(*thread_seen.lock().unwrap(), Some(caller));
}

#[test]
fn spawn_from_inside_a_fiber() {
    let iom = IoManager::new(1, false, "uc-spawn").unwrap();
    let hits = Arc::new(AtomicUsize::new(0));

    let h = hits.clone();
    iom.schedule(Task::call(move || {
        let inner = h.clone();
        weft::spawn(move || {
            inner.fetch_add(1, Ordering::SeqCst);
        })
        .unwrap();
        h.fetch_add(1, Ordering::SeqCst);
    }));

    let start = std::time::Instant::now();
    while hits.load(Ordering::SeqCst) < 2 && start.elapsed().as_secs() < 3 {
        std::thread::sleep(std::time::Duration::from_millis(10));
    }
    assert_eq!(hits.load(Ordering::SeqCst), 2);
    iom.stop();
}
