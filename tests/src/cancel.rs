use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use filament::fiber;
use filament::fiber::FiberState;

/// Cancel delivered while a fiber sleeps wakes it up promptly; the sleep
/// reports the cancellation and the fiber runs to completion.
#[filament::test]
fn cancel_unblocks_sleeping_fiber() {
    let sleeper = fiber::start_proc(|| {
        // A day; only cancellation can end this in test time.
        assert!(!fiber::sleep(Duration::from_secs(86_400)));
        assert!(fiber::is_cancelled());
    });
    let handle = sleeper.fiber();

    assert!(fiber::sleep(Duration::from_millis(10)));
    let before = Instant::now();
    fiber::cancel(&handle);
    assert!(sleeper.join());
    assert!(before.elapsed() < Duration::from_millis(100));
    assert_eq!(handle.state(), FiberState::Stopped);
}

/// A fiber cancelled before it ever suspends observes the flag at its first
/// suspension point.
#[filament::test]
fn cancel_before_first_suspension() {
    let entered = Arc::new(AtomicBool::new(false));
    let worker = {
        let entered = Arc::clone(&entered);
        fiber::start_proc(move || {
            entered.store(true, Ordering::Relaxed);
            // Already cancelled: returns false without suspending.
            assert!(!fiber::suspend());
            assert!(!fiber::sleep(Duration::from_millis(1)));
        })
    };
    fiber::cancel(&worker.fiber());
    assert!(worker.join());
    assert!(entered.load(Ordering::Relaxed));
}

/// Cancelling a fiber blocked in join releases the joiner with `false`; the
/// join target is unaffected and can complete later.
#[filament::test]
fn cancel_releases_joiner() {
    let target = fiber::start_proc(|| {
        assert!(!fiber::suspend());
    });
    let target_handle = target.fiber();

    let joiner = {
        let target_handle = target_handle.clone();
        fiber::start(move || fiber::join(&target_handle))
    };
    let joiner_handle = joiner.fiber();

    // Let the joiner park in join() first.
    assert!(fiber::sleep(Duration::from_millis(1)));
    fiber::cancel(&joiner_handle);
    assert_eq!(joiner.join(), Some(false));

    // The target is still alive and joinable.
    assert_ne!(target_handle.state(), FiberState::Stopped);
    fiber::cancel(&target_handle);
    assert!(target.join());
}

/// A cancelled joiner gets `None` from the typed join handle.
#[filament::test]
fn cancelled_join_returns_none() {
    let blocker = fiber::start(|| {
        let cancelled = !fiber::suspend();
        if cancelled {
            -1
        } else {
            5
        }
    });
    let blocker_handle = blocker.fiber();

    let joiner = fiber::start(move || blocker.join());
    let joiner_handle = joiner.fiber();

    assert!(fiber::sleep(Duration::from_millis(1)));
    fiber::cancel(&joiner_handle);
    assert_eq!(joiner.join(), Some(None));

    fiber::cancel(&blocker_handle);
    // The blocker observed the cancel and stopped on its own.
    assert!(fiber::join(&blocker_handle));
    assert_eq!(blocker_handle.state(), FiberState::Stopped);
}

/// The cancellation flag is sticky.
#[filament::test]
fn cancel_is_sticky() {
    let worker = fiber::start_proc(|| {
        assert!(!fiber::sleep(Duration::from_secs(60)));
        assert!(!fiber::sleep(Duration::ZERO));
        assert!(!fiber::suspend());
        assert!(fiber::is_cancelled());
    });
    assert!(fiber::sleep(Duration::from_millis(5)));
    fiber::cancel(&worker.fiber());
    assert!(worker.join());
}

/// Cancelling a stopped fiber is a no-op.
#[filament::test]
fn cancel_stopped_is_noop() {
    let worker = fiber::start_proc(|| ());
    let handle = worker.fiber();
    assert!(worker.join());
    fiber::cancel(&handle);
    assert_eq!(handle.state(), FiberState::Stopped);
    assert!(!handle.is_cancelled());
}
