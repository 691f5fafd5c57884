use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use filament::clock;
use filament::fiber;
use filament::fiber::{check_yield, YieldResult};

/// Sleep honors its duration against the monotonic clock, and other ready
/// fibers make progress in the meantime.
#[filament::test]
fn sleep_honors_duration() {
    let ticks = Arc::new(AtomicUsize::new(0));
    let ticker = {
        let ticks = Arc::clone(&ticks);
        fiber::start_proc(move || {
            while fiber::sleep(Duration::from_millis(5)) {
                ticks.fetch_add(1, Ordering::Relaxed);
            }
        })
    };

    let before = clock::monotonic();
    assert!(fiber::sleep(Duration::from_millis(50)));
    let after = clock::monotonic();
    assert!(after - before >= 0.050);

    // The ticker kept running while we slept.
    assert!(ticks.load(Ordering::Relaxed) > 0);

    let handle = ticker.fiber();
    fiber::cancel(&handle);
    assert!(ticker.join());
}

#[filament::test]
fn sleep_zero_yields() {
    assert_eq!(
        check_yield(|| fiber::sleep(Duration::ZERO)),
        YieldResult::Yielded(true)
    );
}

#[filament::test]
fn zero_sleep_runs_event_loop() {
    // Several zero-sleeps in a row must each take one trip through the
    // event loop and come back runnable.
    for _ in 0..10 {
        assert!(fiber::sleep(Duration::ZERO));
    }
}
