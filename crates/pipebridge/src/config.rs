//! Command-line arguments and the immutable run configuration.

use std::time::Duration;

use clap::Parser;
use pipebridge_core::RelayPolicy;

/// Relay stdin/stdout to a named pipe, or to a loopback socket announced
/// through a bootstrap handshake.
#[derive(Parser, Debug)]
#[command(name = "pipebridge")]
#[command(version, about)]
pub struct Args {
    /// Named pipe (Windows) or Unix socket path to connect to.
    pub address: String,

    /// Poll until the endpoint exists.
    #[arg(short = 'p', long)]
    pub poll: bool,

    /// Send a zero-length message to the pipe after EOF on stdin.
    #[arg(short = 's', long = "close-write")]
    pub close_write: bool,

    /// Terminate on EOF reading from the pipe, even if there is more data to write.
    #[arg(long, visible_alias = "ep")]
    pub terminate_on_pipe_eof: bool,

    /// Terminate on EOF reading from stdin, even if there is more data to read.
    #[arg(long, visible_alias = "ei")]
    pub terminate_on_stdin_eof: bool,

    /// Verbose output on stderr.
    #[arg(short = 'v', long)]
    pub verbose: bool,

    /// Treat the target as a bootstrap file socket (libassuan style): read a
    /// port and nonce from it, then connect to 127.0.0.1:<port>.
    #[arg(short = 'a', long = "assuan", visible_alias = "bootstrap")]
    pub bootstrap: bool,

    /// Delay between attempts while polling, in milliseconds.
    #[arg(long, default_value_t = 200, env = "PIPEBRIDGE_POLL_INTERVAL_MS")]
    pub poll_interval_ms: u64,

    /// Output logs as JSON (for structured log aggregation).
    #[arg(long, env = "PIPEBRIDGE_LOG_JSON")]
    pub log_json: bool,
}

/// Everything a run needs, fixed at startup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    pub address: String,
    pub poll: bool,
    pub poll_interval: Duration,
    pub bootstrap: bool,
    pub verbose: bool,
    pub log_json: bool,
    pub relay: RelayPolicy,
}

impl From<Args> for Config {
    fn from(args: Args) -> Self {
        Self {
            address: args.address,
            poll: args.poll,
            poll_interval: Duration::from_millis(args.poll_interval_ms),
            bootstrap: args.bootstrap,
            verbose: args.verbose,
            log_json: args.log_json,
            relay: RelayPolicy {
                close_write_on_stdin_eof: args.close_write,
                terminate_on_pipe_eof: args.terminate_on_pipe_eof,
                terminate_on_stdin_eof: args.terminate_on_stdin_eof,
            },
        }
    }
}

#[cfg(test)]
#[allow(clippy::panic, clippy::expect_used, clippy::unwrap_used)]
mod tests {
    use super::*;

    fn parse(argv: &[&str]) -> Result<Config, clap::Error> {
        Args::try_parse_from(std::iter::once("pipebridge").chain(argv.iter().copied()))
            .map(Config::from)
    }

    #[test]
    fn requires_exactly_one_address() {
        assert!(parse(&[]).is_err());
        assert!(parse(&["-p"]).is_err());
        assert!(parse(&["one", "two"]).is_err());
    }

    #[test]
    fn defaults() {
        let cfg = parse(&[r"\\.\pipe\docker_engine"]).unwrap();
        assert_eq!(cfg.address, r"\\.\pipe\docker_engine");
        assert!(!cfg.poll);
        assert!(!cfg.bootstrap);
        assert_eq!(cfg.poll_interval, Duration::from_millis(200));
        assert_eq!(cfg.relay, RelayPolicy::default());
    }

    #[test]
    fn short_flags_and_aliases() {
        let cfg = parse(&["-p", "-s", "--ep", "--ei", "-v", "-a", "/run/agent.sock"]).unwrap();
        assert!(cfg.poll);
        assert!(cfg.verbose);
        assert!(cfg.bootstrap);
        assert_eq!(
            cfg.relay,
            RelayPolicy {
                close_write_on_stdin_eof: true,
                terminate_on_pipe_eof: true,
                terminate_on_stdin_eof: true,
            }
        );
    }

    #[test]
    fn long_flags() {
        let cfg = parse(&[
            "--poll",
            "--close-write",
            "--terminate-on-pipe-eof",
            "--bootstrap",
            "--poll-interval-ms",
            "50",
            "target",
        ])
        .unwrap();
        assert!(cfg.poll);
        assert!(cfg.bootstrap);
        assert!(cfg.relay.close_write_on_stdin_eof);
        assert!(cfg.relay.terminate_on_pipe_eof);
        assert!(!cfg.relay.terminate_on_stdin_eof);
        assert_eq!(cfg.poll_interval, Duration::from_millis(50));
    }
}
