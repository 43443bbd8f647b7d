//! Stdio relay over one established connection.
//!
//! Two directions run as separate tasks:
//! - outbound: input (stdin) to the connection;
//! - inbound: the connection to output (stdout).
//!
//! Each direction reports to a supervisor, which decides when the session is
//! over, broadcasts shutdown, joins both tasks and closes the connection
//! exactly once. The connection cannot be half-closed from the far side, so
//! after end-of-stream the inbound direction keeps issuing zero-length reads
//! to notice when the connection is finally gone. A write that finds the
//! connection gone ends the session the same way.

use std::future::Future;
use std::sync::Arc;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

use crate::error::{Error, Result};
use crate::handle::DuplexHandle;

const BUF_SIZE: usize = 32 * 1024;

/// Shutdown behavior at end of stream.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RelayPolicy {
    /// After stdin EOF, send a zero-length write to signal no more data.
    pub close_write_on_stdin_eof: bool,
    /// End the session on connection EOF even if stdin is still open.
    pub terminate_on_pipe_eof: bool,
    /// End the session on stdin EOF even if the connection has more data.
    pub terminate_on_stdin_eof: bool,
}

/// Graceful way a session ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Termination {
    /// Stdin reached EOF and the policy says to stop right there.
    InputEof,
    /// The connection reached EOF and the policy says to stop right there.
    PipeEof,
    /// The connection reported broken pipe / not connected.
    PipeClosed,
    /// Both directions finished.
    Drained,
}

#[derive(Debug)]
enum Report {
    InputDone,
    InputEofTerminate,
    PipeEof,
    PipeClosed,
    Failed(Error),
}

/// One relay session between the standard streams and a connection.
#[derive(Debug)]
pub struct Relay {
    conn: Arc<DuplexHandle>,
    policy: RelayPolicy,
}

impl Relay {
    pub fn new(conn: DuplexHandle, policy: RelayPolicy) -> Self {
        Self {
            conn: Arc::new(conn),
            policy,
        }
    }

    /// Relay until a terminal condition, then close the connection.
    pub async fn run<I, O>(self, input: I, output: O) -> Result<Termination>
    where
        I: AsyncRead + Unpin + Send + 'static,
        O: AsyncWrite + Unpin + Send + 'static,
    {
        let (report_tx, mut report_rx) = mpsc::channel(4);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let outbound = spawn_direction(
            "outbound",
            pump_input(
                Arc::clone(&self.conn),
                input,
                self.policy,
                report_tx.clone(),
            ),
            shutdown_rx.clone(),
        );
        let inbound = spawn_direction(
            "inbound",
            pump_output(Arc::clone(&self.conn), output, self.policy, report_tx),
            shutdown_rx,
        );

        let outcome = supervise(self.policy, &mut report_rx).await;

        let _ = shutdown_tx.send(true);
        for task in [outbound, inbound] {
            if let Err(e) = task.await {
                warn!(error = %e, "Relay direction task failed");
            }
        }

        match (outcome, self.conn.close()) {
            (Ok(termination), Ok(())) => {
                debug!(?termination, "Relay finished");
                Ok(termination)
            }
            (Ok(_), Err(close)) => Err(close),
            (Err(e), Err(close)) => {
                warn!(error = %close, "Failed to close connection after relay error");
                Err(e)
            }
            (Err(e), Ok(())) => Err(e),
        }
    }
}

/// Decide the session outcome from direction reports. First terminal
/// condition wins.
async fn supervise(
    policy: RelayPolicy,
    reports: &mut mpsc::Receiver<Report>,
) -> Result<Termination> {
    let mut input_done = false;
    let mut pipe_eof = false;

    while let Some(report) = reports.recv().await {
        trace!(?report, "Relay report");
        match report {
            Report::InputEofTerminate => return Ok(Termination::InputEof),
            Report::InputDone => {
                input_done = true;
                if pipe_eof {
                    return Ok(Termination::Drained);
                }
            }
            Report::PipeEof if policy.terminate_on_pipe_eof => return Ok(Termination::PipeEof),
            Report::PipeEof => {
                pipe_eof = true;
                if input_done {
                    return Ok(Termination::Drained);
                }
            }
            Report::PipeClosed => return Ok(Termination::PipeClosed),
            Report::Failed(e) => return Err(e),
        }
    }

    Err(Error::Relay(
        "both directions stopped without reaching a terminal condition".into(),
    ))
}

fn spawn_direction<F>(
    name: &'static str,
    work: F,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    tokio::spawn(async move {
        tokio::select! {
            () = work => trace!(direction = name, "Direction finished"),
            _ = shutdown.changed() => trace!(direction = name, "Direction cancelled"),
        }
    })
}

async fn pump_input<I>(
    conn: Arc<DuplexHandle>,
    mut input: I,
    policy: RelayPolicy,
    reports: mpsc::Sender<Report>,
) where
    I: AsyncRead + Unpin,
{
    let report = match copy_input(&conn, &mut input).await {
        Ok(()) => {
            debug!("Copy from stdin to pipe finished");
            if policy.terminate_on_stdin_eof {
                Report::InputEofTerminate
            } else {
                if policy.close_write_on_stdin_eof {
                    // A zero-length message tells the peer no more data is
                    // coming. Streams without message framing ignore it.
                    if let Err(e) = conn.write(&[]).await {
                        debug!(error = %e, "Zero-length write after stdin EOF failed");
                    }
                }
                drop(input);
                Report::InputDone
            }
        }
        Err(e) if e.is_closed() => {
            debug!("Copy from stdin to pipe finished: pipe closed");
            Report::PipeClosed
        }
        Err(e) => Report::Failed(e),
    };
    let _ = reports.send(report).await;
}

async fn copy_input<I>(conn: &DuplexHandle, input: &mut I) -> Result<()>
where
    I: AsyncRead + Unpin,
{
    let mut buf = vec![0u8; BUF_SIZE];
    loop {
        let n = input
            .read(&mut buf)
            .await
            .map_err(|source| Error::Stdio {
                op: "read stdin",
                source,
            })?;
        if n == 0 {
            return Ok(());
        }
        conn.write_all(&buf[..n]).await?;
    }
}

async fn pump_output<O>(
    conn: Arc<DuplexHandle>,
    mut output: O,
    policy: RelayPolicy,
    reports: mpsc::Sender<Report>,
) where
    O: AsyncWrite + Unpin,
{
    match copy_output(&conn, &mut output).await {
        Ok(()) => {}
        Err(e) if e.is_closed() => {
            debug!("Copy from pipe to stdout finished: pipe closed");
            let _ = reports.send(Report::PipeClosed).await;
            return;
        }
        Err(e) => {
            let _ = reports.send(Report::Failed(e)).await;
            return;
        }
    }

    debug!("Copy from pipe to stdout finished");
    if reports.send(Report::PipeEof).await.is_err() || policy.terminate_on_pipe_eof {
        return;
    }

    if let Err(e) = output.shutdown().await {
        debug!(error = %e, "Failed to close stdout");
    }
    drop(output);

    let report = match probe_closed(&conn).await {
        Ok(()) => {
            debug!("Pipe closed");
            Report::PipeClosed
        }
        Err(e) => Report::Failed(e),
    };
    let _ = reports.send(report).await;
}

async fn copy_output<O>(conn: &DuplexHandle, output: &mut O) -> Result<()>
where
    O: AsyncWrite + Unpin,
{
    let mut buf = vec![0u8; BUF_SIZE];
    loop {
        let n = conn.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        output
            .write_all(&buf[..n])
            .await
            .map_err(stdout_error)?;
    }
    output.flush().await.map_err(stdout_error)
}

const fn stdout_error(source: std::io::Error) -> Error {
    Error::Stdio {
        op: "write stdout",
        source,
    }
}

/// Issue zero-length reads until the connection reports it is closed.
async fn probe_closed(conn: &DuplexHandle) -> Result<()> {
    loop {
        match conn.read(&mut []).await {
            Ok(_) => {}
            Err(e) if e.is_closed() => return Ok(()),
            Err(e) => return Err(e),
        }
    }
}
