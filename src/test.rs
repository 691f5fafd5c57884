//! Internals used by the custom test runner to run tests that require a live
//! fiber runtime.
//!
//! Tests are declared with the [`#[filament::test]`](crate::test) attribute,
//! which registers them into the [`FILAMENT_TESTS`] distributed slice; the
//! runner initializes the runtime once and executes every case inside a
//! child fiber of its own.

use tester::{ShouldPanic, TestDesc, TestDescAndFn, TestFn, TestName, TestType};

#[derive(Clone)]
pub struct TestCase {
    name: &'static str,
    // TODO: Support functions returning `Result`
    f: fn(),
    should_panic: bool,
}

impl TestCase {
    pub const fn new(name: &'static str, f: fn(), should_panic: bool) -> Self {
        Self {
            name,
            f,
            should_panic,
        }
    }

    pub const fn name(&self) -> &'static str {
        self.name
    }

    pub fn run(&self) {
        (self.f)()
    }

    pub const fn should_panic(&self) -> bool {
        self.should_panic
    }
}

#[::linkme::distributed_slice]
pub static FILAMENT_TESTS: [TestCase] = [..];

/// All test cases registered in the current binary.
pub fn test_cases() -> &'static [TestCase] {
    &FILAMENT_TESTS
}

/// Adapter for driving the registered cases with the `tester` crate.
pub fn collect() -> Vec<TestDescAndFn> {
    FILAMENT_TESTS
        .iter()
        .map(|case| TestDescAndFn {
            desc: TestDesc {
                name: TestName::StaticTestName(case.name),
                ignore: false,
                should_panic: if case.should_panic {
                    ShouldPanic::Yes
                } else {
                    ShouldPanic::No
                },
                allow_fail: false,
                test_type: TestType::IntegrationTest,
            },
            testfn: TestFn::StaticTestFn(case.f),
        })
        .collect()
}
