//! Cooperative fiber runtime for Rust.
//!
//! This library multiplexes an arbitrary number of user-visible *fibers*
//! over OS threads so that exactly one of them executes at any instant,
//! together with an event loop that turns asynchronous I/O, timers and
//! signals into plain `resume` operations. It contains:
//!
//! - [Fibers: start/join/suspend/resume/yield, priorities, cancellation,
//!   condition variables](fiber)
//! - [CoIo: fd readiness waiting and nonblocking stream wrappers](coio)
//! - [Per-fiber tracebacks](traceback)
//! - [Monotonic and wall clocks](clock)
//! - [Logging](log) (see <https://docs.rs/log/>)
//! - [Error handling](error)
//!
//! The runtime is a process-wide singleton: [`fiber::init`] must be the
//! first call, it binds the calling thread as the main fiber and spawns the
//! idle fiber driving the event loop.
//!
//! ### Features
//!
//! - `traceback` - Per-function call-site records swapped with the running
//!   fiber (enabled by default)
//! - `test` - Enables the [`test`] attribute and the [`mod@test`] module used
//!   by the custom test runner

pub mod clock;
pub mod coio;
pub mod error;
pub mod fiber;
pub mod log;
#[cfg(feature = "test")]
pub mod test;
pub mod traceback;

/// A re-export of [linkme] crate used inside the #[`test`] macro attribute.
pub use linkme;

/// Mark a function as a test. This will add the function to the list of
/// tests in a special global section. The tests can be accessed using
/// [`test::test_cases`] or [`test::collect`] and are executed by the test
/// runner with the fiber runtime initialized.
///
/// # Example
/// ```no_run
/// #[filament::test]
/// fn my_test() {
///     assert!(true);
/// }
///
/// #[filament::test(should_panic)]
/// fn my_panicking_test() {
///     assert!(false);
/// }
/// ```
#[cfg(feature = "test")]
pub use filament_proc::test;

pub use error::Result;
pub type StdResult<T, E> = std::result::Result<T, E>;
