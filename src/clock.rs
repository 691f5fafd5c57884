//! The `clock` module returns time values derived from the Posix / C
//! [CLOCK_GETTIME](http://pubs.opengroup.org/onlinepubs/9699919799/functions/clock_getres.html)
//! function.
//!
//! Functions returning seconds come as `f64`; functions with names followed
//! by "64" return a 64-bit number of nanoseconds.
//!
//! - [time()](fn.time.html) - Get the wall clock time in seconds
//! - [time64()](fn.time64.html) - Get the wall clock time in nanoseconds
//! - [monotonic()](fn.monotonic.html) - Get the monotonic time in seconds
//! - [monotonic64()](fn.monotonic64.html) - Get the monotonic time in nanoseconds

use std::time::Duration;

pub const INFINITY: Duration = Duration::from_secs(100 * 365 * 24 * 60 * 60);

const NANOS_PER_SEC: u64 = 1_000_000_000;

fn clock_gettime(clock: libc::clockid_t) -> u64 {
    let mut ts = libc::timespec {
        tv_sec: 0,
        tv_nsec: 0,
    };
    // Can only fail for an invalid clock id.
    let rc = unsafe { libc::clock_gettime(clock, &mut ts) };
    debug_assert_eq!(rc, 0);
    ts.tv_sec as u64 * NANOS_PER_SEC + ts.tv_nsec as u64
}

/// The wall clock time in seconds.
///
/// Derived from C function `clock_gettime(CLOCK_REALTIME)`.
/// This is the best function for knowing what the official time is, as
/// determined by the system administrator.
///
/// Return: seconds since epoch (1970-01-01 00:00:00), adjusted.
#[inline(always)]
pub fn time() -> f64 {
    time64() as f64 / NANOS_PER_SEC as f64
}

/// The wall clock time in nanoseconds since epoch.
///
/// See: [time()](fn.time.html)
#[inline(always)]
pub fn time64() -> u64 {
    clock_gettime(libc::CLOCK_REALTIME)
}

/// The monotonic time.
///
/// Derived from C function `clock_gettime(CLOCK_MONOTONIC)`.
/// Monotonic time is similar to wall clock time but is not affected by
/// changes to or from daylight saving time, or by changes done by a user.
/// This is the best function to use with benchmarks that need to calculate
/// elapsed time.
///
/// Return: seconds since an unspecified point in the past (boot, usually).
#[inline(always)]
pub fn monotonic() -> f64 {
    monotonic64() as f64 / NANOS_PER_SEC as f64
}

/// See: [monotonic()](fn.monotonic.html)
#[inline(always)]
pub fn monotonic64() -> u64 {
    clock_gettime(libc::CLOCK_MONOTONIC)
}
