//! Tracing subscriber setup for binaries and tests.
//!
//! `RUST_LOG` selects the filter (default `spiketab=info`);
//! `RUST_LOG_FORMAT=json` switches to JSON lines on stderr.

use tracing_subscriber::EnvFilter;

pub const DEFAULT_FILTER: &str = "spiketab=info";

/// Install the global subscriber. Later calls are no-ops.
pub fn init() {
    init_with_default(DEFAULT_FILTER);
}

/// Same as [`init`] with another fallback filter when `RUST_LOG` is unset.
pub fn init_with_default(default_filter: &str) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));

    let json = std::env::var("RUST_LOG_FORMAT")
        .map(|v| v.eq_ignore_ascii_case("json"))
        .unwrap_or(false);

    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(true)
        .with_thread_ids(true)
        .with_file(false)
        .with_line_number(false);

    if json {
        let _ = subscriber.json().try_init();
    } else {
        let _ = subscriber.try_init();
    }
}
