use std::env;
use std::process::Command;

use filament::fiber;

/// Re-exec entry: initialize a runtime with no work fibers and suspend the
/// main fiber. Nothing can ever resume it, the runtime must detect this and
/// die with its fixed diagnostic.
pub fn provoke() -> ! {
    fiber::init().expect("fiber runtime failed to initialize");
    fiber::suspend();
    unreachable!("the deadlock detector must have fired");
}

/// Suspending with no other work fibers and no pending I/O aborts the
/// process within one scheduler tick.
#[filament::test]
fn deadlock_aborts_with_diagnostic() {
    let exe = env::current_exe().unwrap();
    let output = Command::new(exe)
        .env("FILAMENT_DEADLOCK_SCENARIO", "1")
        .output()
        .unwrap();

    assert_eq!(output.status.code(), Some(1));
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(
        stderr.contains("all fibers suspended and no pending IO"),
        "unexpected stderr: {}",
        stderr
    );
}
