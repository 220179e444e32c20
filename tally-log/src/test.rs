//! Logging support for tests.

use tracing_subscriber::EnvFilter;

use crate::setup::CRATE_NAMES;

#[doc(hidden)]
pub fn __init_test() {
    let mut env_filter = EnvFilter::new("ERROR");

    // Add all internal crates with maximum log-level.
    for name in CRATE_NAMES {
        env_filter = env_filter.add_directive(format!("{name}=TRACE").parse().unwrap());
    }

    tracing_subscriber::fmt::fmt()
        .with_env_filter(env_filter)
        .with_target(true)
        .with_test_writer()
        .compact()
        .try_init()
        .ok();
}

/// Initialize the logger for testing.
///
/// This logs to the stdout registered by the Rust test runner, and only
/// captures logs from workspace crates.
///
/// # Example
///
/// ```
/// tally_log::init_test!();
/// ```
#[macro_export]
macro_rules! init_test {
    () => {
        $crate::test::__init_test();
    };
}
