//! Scenario tests for the fiber runtime. Each `#[filament::test]` case is
//! registered into the shared distributed slice; `run.rs` executes them on
//! the main fiber of a live runtime.

pub mod cancel;
pub mod coio;
pub mod deadlock;
pub mod fiber;
pub mod signal;
pub mod sleep;
pub mod traceback;

pub use filament::test::test_cases;
