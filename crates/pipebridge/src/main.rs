//! pipebridge
//!
//! Relays the process's stdin/stdout over a named pipe (a Unix socket on
//! Unix), or over a loopback socket reached through a bootstrap handshake.

mod config;

use anyhow::Context;
use clap::Parser;
use tracing::{debug, error};

use pipebridge_core::tracing_init::{default_filter, init_tracing};
use pipebridge_core::{Establisher, Relay, SystemDialer, Termination};

use crate::config::{Args, Config};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = Config::from(Args::parse());
    init_tracing(default_filter(config.verbose), config.log_json);

    let code = match run(&config).await {
        Ok(termination) => {
            debug!(?termination, "Session ended");
            0
        }
        Err(e) => {
            error!("{e:#}");
            1
        }
    };

    // The connection is already closed here. Exit explicitly so a stdin read
    // still parked on a blocking thread cannot hold the runtime open.
    std::process::exit(code);
}

async fn run(config: &Config) -> anyhow::Result<Termination> {
    debug!(
        version = env!("CARGO_PKG_VERSION"),
        address = %config.address,
        bootstrap = config.bootstrap,
        poll = config.poll,
        "Connecting"
    );

    let conn = Establisher::new(SystemDialer, config.poll)
        .with_poll_interval(config.poll_interval)
        .establish(&config.address, config.bootstrap)
        .await
        .with_context(|| format!("failed to connect to {}", config.address))?;
    debug!("Connected");

    let termination = Relay::new(conn, config.relay)
        .run(tokio::io::stdin(), tokio::io::stdout())
        .await
        .context("relay failed")?;
    Ok(termination)
}
