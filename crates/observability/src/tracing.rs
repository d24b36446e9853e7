//! Tracing/logging initialization.

use tracing_subscriber::EnvFilter;
use tracing_subscriber::fmt::MakeWriter;

const DEFAULT_FILTER: &str = "info";

fn env_filter() -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER))
}

/// JSON logs on stdout, configurable via `RUST_LOG`.
pub fn init() {
    install(env_filter(), std::io::stdout);
}

/// JSON logs on stdout with an explicit filter directive (e.g. `"tally_device=debug"`).
///
/// An unparsable directive falls back to `RUST_LOG` / `info`.
pub fn init_with_filter(directives: &str) {
    let filter = EnvFilter::try_new(directives).unwrap_or_else(|_| env_filter());
    install(filter, std::io::stdout);
}

/// JSON logs on stderr, for tools whose stdout is machine-readable output.
pub fn init_stderr() {
    install(env_filter(), std::io::stderr);
}

fn install<W>(filter: EnvFilter, writer: W)
where
    W: for<'w> MakeWriter<'w> + Send + Sync + 'static,
{
    // A second initialization fails harmlessly.
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .json()
        .with_timer(tracing_subscriber::fmt::time::SystemTime)
        .with_target(false)
        .with_writer(writer)
        .try_init();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn repeated_initialization_is_harmless() {
        init();
        init_with_filter("tally_ledger=debug");
        init_stderr();
        ::tracing::info!("still logging");
    }
}
