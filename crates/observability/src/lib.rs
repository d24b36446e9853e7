//! Process-wide tracing setup shared by the `tally` binaries.

/// Initialize JSON logging on stdout, filtered by `RUST_LOG` (default `info`).
///
/// Safe to call multiple times; subsequent calls are no-ops.
pub fn init() {
    tracing::init();
}

pub mod tracing;

pub use self::tracing::{init_stderr, init_with_filter};
