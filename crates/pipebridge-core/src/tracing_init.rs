//! Tracing/logging initialization.
//!
//! Standard output carries relayed bytes, so every layer writes to stderr.

use std::io;

use tracing_subscriber::layer::{Layer, SubscriberExt};
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, fmt};

/// Default filter for a run with or without `--verbose`.
pub const fn default_filter(verbose: bool) -> &'static str {
    if verbose {
        "pipebridge=debug,pipebridge_core=debug"
    } else {
        "pipebridge=warn,pipebridge_core=warn"
    }
}

/// Install the global subscriber for a relay process.
///
/// Every event goes to stderr: stdout is the relay's data channel and a
/// stray log line there would corrupt the byte stream. `RUST_LOG` wins over
/// `default_filter` when it parses.
pub fn init_tracing(default_filter: &str, log_json: bool) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));
    let output = if log_json {
        fmt::layer().json().with_writer(io::stderr).boxed()
    } else {
        fmt::layer().with_writer(io::stderr).boxed()
    };
    tracing_subscriber::registry().with(output).with(filter).init();
}
