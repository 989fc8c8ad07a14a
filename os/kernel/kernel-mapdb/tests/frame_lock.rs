use kernel_mapdb::{FrameLock, FrameState, Mapdb};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Barrier};
use std::{panic, thread};

/// Stand-in for a frame record: two counters that must always move together.
#[derive(Default)]
struct Ledger {
    derived: u64,
    revoked: u64,
}

#[test]
fn guard_unlocks_on_drop() {
    let lock = FrameLock::new(Ledger::default());
    {
        let mut g = lock.lock();
        g.derived = 3;
        assert!(lock.is_locked());
    }
    assert!(!lock.is_locked());
    assert_eq!(lock.lock().derived, 3);
}

#[test]
fn try_lock_fails_while_held() {
    let lock = FrameLock::new(FrameState::Implicit);
    let held = lock.try_lock();
    assert!(held.as_ref().is_some_and(|g| g.is_implicit()));
    assert!(lock.try_lock().is_none());
    drop(held);
    assert!(lock.try_lock().is_some());
}

#[test]
fn with_lock_returns_the_closure_result() {
    let lock = FrameLock::new(Ledger::default());
    let balance = lock.with_lock(|l| {
        l.derived += 2;
        l.revoked += 1;
        l.derived - l.revoked
    });
    assert_eq!(balance, 1);
    assert!(!lock.is_locked());
}

#[test]
fn exclusive_access_needs_no_locking() {
    let mut lock = FrameLock::new(Ledger::default());
    lock.get_mut().revoked = 9;
    assert!(!lock.is_locked());
    assert_eq!(lock.into_inner().revoked, 9);
}

#[test]
fn contended_updates_stay_consistent() {
    let threads = 8;
    let iters = 5_000;

    let lock = Arc::new(FrameLock::new(Ledger::default()));
    let inside = Arc::new(AtomicUsize::new(0));
    let start = Arc::new(Barrier::new(threads));

    let handles: Vec<_> = (0..threads)
        .map(|_| {
            let lock = Arc::clone(&lock);
            let inside = Arc::clone(&inside);
            let start = Arc::clone(&start);
            thread::spawn(move || {
                start.wait();
                for _ in 0..iters {
                    lock.with_lock(|l| {
                        let prev = inside.fetch_add(1, Ordering::SeqCst);
                        assert_eq!(prev, 0, "two holders at once");
                        assert_eq!(l.derived, l.revoked);
                        l.derived += 1;
                        l.revoked += 1;
                        inside.fetch_sub(1, Ordering::SeqCst);
                    });
                    thread::yield_now();
                }
            })
        })
        .collect();

    for h in handles {
        h.join().unwrap();
    }

    let total = lock.with_lock(|l| l.derived);
    assert_eq!(total, (threads * iters) as u64);
}

#[test]
fn panicking_holder_releases_the_lock() {
    let lock = FrameLock::new(Ledger::default());
    let res = panic::catch_unwind(panic::AssertUnwindSafe(|| {
        lock.with_lock(|l| {
            l.derived = 7;
            panic!("fault while holding a frame");
        });
    }));
    assert!(res.is_err());
    assert_eq!(lock.with_lock(|l| l.derived), 7);
}

#[test]
fn database_is_shareable_across_cpus() {
    fn shareable<T: Send + Sync>() {}
    shareable::<Mapdb>();
    shareable::<FrameLock<FrameState>>();
}
