use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use filament::fiber;
use filament::fiber::FiberState;

#[filament::test]
fn immediate() {
    let jh = fiber::Builder::new().func(|| 69).start().unwrap();
    let res = jh.join();
    assert_eq!(res, Some(69));

    let jh = fiber::start(|| 420);
    let res = jh.join();
    assert_eq!(res, Some(420));
}

#[filament::test]
fn unit_immediate() {
    let jh = fiber::Builder::new().proc(|| ()).start().unwrap();
    assert!(jh.join());

    assert!(fiber::start_proc(|| ()).join());
}

#[filament::test]
fn immediate_with_attrs() {
    let jh = fiber::Builder::new()
        .name("boo")
        .priority(5)
        .unwrap()
        .stack_size(1024 * 1024)
        .func(|| fiber::current().name().to_string())
        .start()
        .unwrap();
    assert_eq!(jh.join().as_deref(), Some("boo"));
}

/// Two equal-priority fibers ping-pong one tick at a time, starting with
/// whichever was started first.
#[filament::test]
fn equal_priority_ping_pong() {
    let trace: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(vec![]));

    let spawn_counter = |tag: &'static str| {
        let trace = Arc::clone(&trace);
        fiber::start_proc(move || {
            for i in 0..5 {
                trace.lock().unwrap().push(format!("{}{}", tag, i));
                fiber::yield_now();
            }
        })
    };
    let a = spawn_counter("A");
    let b = spawn_counter("B");
    assert!(a.join());
    assert!(b.join());

    let expected: Vec<String> = (0..5)
        .flat_map(|i| vec![format!("A{}", i), format!("B{}", i)])
        .collect();
    assert_eq!(*trace.lock().unwrap(), expected);
}

/// The higher-priority fiber monopolizes the slots as long as it keeps
/// re-enqueueing itself.
#[filament::test]
fn priority_preemption_on_yield() {
    let trace: Arc<Mutex<Vec<&'static str>>> = Arc::new(Mutex::new(vec![]));
    let stop = Arc::new(AtomicBool::new(false));

    let low = {
        let trace = Arc::clone(&trace);
        let stop = Arc::clone(&stop);
        fiber::Builder::new()
            .name("low")
            .proc(move || {
                while !stop.load(Ordering::Relaxed) {
                    trace.lock().unwrap().push("L");
                    fiber::yield_now();
                }
            })
            .start()
            .unwrap()
    };
    let high = {
        let trace = Arc::clone(&trace);
        let stop = Arc::clone(&stop);
        fiber::Builder::new()
            .name("high")
            .priority(10)
            .unwrap()
            .proc(move || {
                for _ in 0..5 {
                    trace.lock().unwrap().push("H");
                    fiber::yield_now();
                }
                stop.store(true, Ordering::Relaxed);
            })
            .start()
            .unwrap()
    };

    assert!(high.join());
    assert!(low.join());

    let trace = trace.lock().unwrap();
    assert_eq!(&trace[..5], ["H", "H", "H", "H", "H"]);
}

/// Join blocks until the target completes, and completion is observable
/// from a third fiber before the join returns.
#[filament::test]
fn join_waits_for_completion() {
    let done = Arc::new(AtomicBool::new(false));

    let worker = {
        let done = Arc::clone(&done);
        fiber::start_proc(move || {
            assert!(fiber::sleep(Duration::from_millis(20)));
            done.store(true, Ordering::Relaxed);
        })
    };
    let observed_pending = {
        let done = Arc::clone(&done);
        fiber::start(move || !done.load(Ordering::Relaxed))
    };

    assert!(worker.join());
    assert!(done.load(Ordering::Relaxed));
    // The observer ran while the worker was still sleeping.
    assert_eq!(observed_pending.join(), Some(true));
}

#[filament::test]
fn join_after_stopped_returns_immediately() {
    let jh = fiber::start_proc(|| ());
    let handle = jh.fiber();
    assert!(jh.join());
    assert_eq!(handle.state(), FiberState::Stopped);
    // The rendezvous on a stopped fiber is a pass-through.
    assert!(fiber::join(&handle));
}

/// All fibers blocked in join on the same target are released in arrival
/// order.
#[filament::test]
fn joiners_release_in_fifo_order() {
    let target = fiber::start_proc(|| {
        assert!(fiber::sleep(Duration::from_millis(10)));
    });
    let target_handle = target.fiber();

    let order: Arc<Mutex<Vec<usize>>> = Arc::new(Mutex::new(vec![]));
    let joiners: Vec<_> = (0..3)
        .map(|i| {
            let order = Arc::clone(&order);
            let target_handle = target_handle.clone();
            fiber::start_proc(move || {
                assert!(fiber::join(&target_handle));
                order.lock().unwrap().push(i);
            })
        })
        .collect();

    assert!(target.join());
    for joiner in joiners {
        assert!(joiner.join());
    }
    assert_eq!(*order.lock().unwrap(), [0, 1, 2]);
}

#[filament::test]
fn suspend_until_resumed() {
    let released = Arc::new(AtomicBool::new(false));
    let worker = {
        let released = Arc::clone(&released);
        fiber::start_proc(move || {
            assert!(fiber::suspend());
            assert!(released.load(Ordering::Relaxed));
        })
    };
    let handle = worker.fiber();

    // Give the worker its first slot so it parks in suspend().
    assert!(fiber::sleep(Duration::from_millis(1)));
    assert_eq!(handle.state(), FiberState::Suspended);

    released.store(true, Ordering::Relaxed);
    fiber::resume(&handle);
    assert!(worker.join());
}

/// Resume is idempotent on ready and stopped fibers.
#[filament::test]
fn resume_is_idempotent() {
    let runs = Arc::new(AtomicUsize::new(0));
    let worker = {
        let runs = Arc::clone(&runs);
        fiber::start_proc(move || {
            runs.fetch_add(1, Ordering::Relaxed);
        })
    };
    let handle = worker.fiber();
    assert_eq!(handle.state(), FiberState::Ready);
    fiber::resume(&handle);
    fiber::resume(&handle);
    assert!(worker.join());
    assert_eq!(runs.load(Ordering::Relaxed), 1);

    assert_eq!(handle.state(), FiberState::Stopped);
    fiber::resume(&handle);
    assert_eq!(handle.state(), FiberState::Stopped);
}

/// An unhandled panic stops the fiber, releases the joiners and yields no
/// result value.
#[filament::test]
fn fiber_panic_releases_joiner() {
    let jh = fiber::start(|| -> i32 { panic!("boom") });
    assert_eq!(jh.join(), None);
}

#[filament::test]
fn current_identity() {
    assert_eq!(fiber::current(), fiber::current());
    // Cases run in a fiber of their own, distinct from the runtime's main
    // fiber which drives the runner.
    assert_ne!(fiber::current(), fiber::main_fiber());
    assert_eq!(fiber::main_fiber().name(), "main");
    let jh = fiber::start(fiber::current);
    let child = jh.fiber();
    assert_eq!(jh.join(), Some(child));
}
