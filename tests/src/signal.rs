use std::time::Duration;

use filament::error::Error;
use filament::fiber;

/// A routed signal is delivered as a resume of the enabling fiber.
#[filament::test]
fn signal_resumes_enabler() {
    fiber::enable_signal(libc::SIGUSR2).unwrap();

    let kicker = fiber::start_proc(|| {
        assert!(fiber::sleep(Duration::from_millis(5)));
        unsafe { libc::kill(libc::getpid(), libc::SIGUSR2) };
    });

    // Parked until the event loop translates the signal into a resume.
    assert!(fiber::suspend());

    assert!(kicker.join());
    fiber::disable_signal(libc::SIGUSR2).unwrap();
}

/// Re-enabling replaces the previous route, disabling tears it down.
#[filament::test]
fn signal_route_lifecycle() {
    fiber::enable_signal(libc::SIGUSR1).unwrap();
    fiber::enable_signal(libc::SIGUSR1).unwrap();
    fiber::disable_signal(libc::SIGUSR1).unwrap();
    // Disabling an unknown signal is a no-op.
    fiber::disable_signal(libc::SIGWINCH).unwrap();
}

#[filament::test]
fn unroutable_signal_is_rejected() {
    let err = fiber::enable_signal(libc::SIGKILL).unwrap_err();
    assert!(matches!(err, Error::UnsupportedSignal(s) if s == libc::SIGKILL));
}
