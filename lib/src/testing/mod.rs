//! Test harness shared by every crate's test modules.
//!
//! Test bodies return a [`TestResult`] and use the `assert_*_test!` macros
//! so that a failure logs through klog and returns instead of unwinding.
//! [`define_test_suite!`] turns a list of such bodies into `#[test]`
//! functions.

use std::panic::{self, AssertUnwindSafe};
use std::process::{Command, Stdio};

mod assertions;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TestResult {
    Pass,
    Fail,
    Panic,
    Skipped,
}

impl TestResult {
    #[inline]
    pub fn is_pass(&self) -> bool {
        matches!(self, Self::Pass | Self::Skipped)
    }

    #[inline]
    pub fn is_failure(&self) -> bool {
        matches!(self, Self::Fail | Self::Panic)
    }
}

/// Run one test body, converting an escaped panic into `TestResult::Panic`.
pub fn run_single_test(name: &str, test_fn: fn() -> TestResult) -> TestResult {
    match panic::catch_unwind(AssertUnwindSafe(test_fn)) {
        Ok(result) => {
            if result.is_failure() {
                crate::klog_info!("TEST {}: {:?}", name, result);
            }
            result
        }
        Err(_) => {
            crate::klog_info!("TEST {}: panicked", name);
            TestResult::Panic
        }
    }
}

/// Environment variable naming the test a re-executed binary should run
/// as the child side of [`expect_abort`].
pub const ABORT_CHILD_ENV: &str = "LWKT_ABORT_CHILD";

/// Check that `body` takes the process down.
///
/// The test binary re-executes itself filtered to `test_name` with
/// [`ABORT_CHILD_ENV`] set; the child runs `body` and exits cleanly if it
/// returns or unwinds. Passes only when the child dies abnormally.
pub fn expect_abort(test_name: &str, body: impl FnOnce()) -> TestResult {
    if std::env::var(ABORT_CHILD_ENV).as_deref() == Ok(test_name) {
        let _ = panic::catch_unwind(AssertUnwindSafe(body));
        std::process::exit(0);
    }
    let exe = match std::env::current_exe() {
        Ok(exe) => exe,
        Err(err) => return crate::fail!("cannot locate test binary: {}", err),
    };
    let status = Command::new(exe)
        .arg(test_name)
        .arg("--test-threads=1")
        .env(ABORT_CHILD_ENV, test_name)
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status();
    match status {
        Ok(status) if !status.success() => TestResult::Pass,
        Ok(_) => crate::fail!("{}: child survived", test_name),
        Err(err) => crate::fail!("{}: child did not start: {}", test_name, err),
    }
}

#[macro_export]
macro_rules! pass {
    () => {
        $crate::testing::TestResult::Pass
    };
}

#[macro_export]
macro_rules! fail {
    () => {
        $crate::testing::TestResult::Fail
    };
    ($msg:expr) => {{
        $crate::klog_info!("TEST FAIL: {}", $msg);
        $crate::testing::TestResult::Fail
    }};
    ($fmt:expr, $($arg:tt)*) => {{
        $crate::klog_info!(concat!("TEST FAIL: ", $fmt), $($arg)*);
        $crate::testing::TestResult::Fail
    }};
}

/// Generate one `#[test]` per listed body, named `<suite>_<body>`.
#[macro_export]
macro_rules! define_test_suite {
    ($suite_name:ident, [$($test_fn:ident),* $(,)?]) => {
        $crate::paste::paste! {
            $(
                #[test]
                fn [<$suite_name _ $test_fn>]() {
                    let result = $crate::testing::run_single_test(
                        concat!(stringify!($suite_name), "::", stringify!($test_fn)),
                        $test_fn,
                    );
                    assert!(
                        result.is_pass(),
                        "{}::{} returned {:?}",
                        stringify!($suite_name),
                        stringify!($test_fn),
                        result
                    );
                }
            )*
        }
    };
}
