//! Connection establishment: direct open, loopback socket, bootstrap
//! handshake.
//!
//! The bootstrap flow treats the first handle as a discovery channel only: it
//! announces a loopback port and a one-time nonce. The real connection is
//! the socket, authenticated by writing the nonce back as its first payload.

use std::future::Future;
use std::io;
use std::net::{Ipv4Addr, SocketAddr};
use std::time::Duration;

use tokio::net::TcpSocket;
use tokio::time::sleep;
use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::handle::DuplexHandle;
use crate::handshake::read_handshake;

/// Delay between attempts while polling for an endpoint.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(200);

/// Opens OS-level duplex handles.
pub trait Dialer: Send + Sync {
    /// Open a named endpoint. `NotFound` means it does not exist yet; on Unix
    /// `ConnectionRefused` means the socket file has no listener yet.
    fn open(&self, address: &str) -> impl Future<Output = io::Result<DuplexHandle>> + Send;

    /// Connect a stream socket bound to an ephemeral local port to
    /// `127.0.0.1:port`.
    fn connect_loopback(&self, port: u16)
    -> impl Future<Output = io::Result<DuplexHandle>> + Send;
}

/// Dialer backed by the operating system: Unix domain sockets or Windows
/// named pipes for [`Dialer::open`], IPv4 TCP for the loopback connect.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemDialer;

impl Dialer for SystemDialer {
    async fn open(&self, address: &str) -> io::Result<DuplexHandle> {
        open_endpoint(address).await
    }

    async fn connect_loopback(&self, port: u16) -> io::Result<DuplexHandle> {
        let socket = TcpSocket::new_v4()?;
        socket.bind(SocketAddr::from((Ipv4Addr::UNSPECIFIED, 0)))?;
        let stream = socket
            .connect(SocketAddr::from((Ipv4Addr::LOCALHOST, port)))
            .await?;
        Ok(DuplexHandle::from_stream(stream))
    }
}

#[cfg(unix)]
async fn open_endpoint(address: &str) -> io::Result<DuplexHandle> {
    let stream = tokio::net::UnixStream::connect(address).await?;
    Ok(DuplexHandle::from_stream(stream))
}

#[cfg(windows)]
#[allow(clippy::unused_async)]
async fn open_endpoint(address: &str) -> io::Result<DuplexHandle> {
    let pipe = tokio::net::windows::named_pipe::ClientOptions::new().open(address)?;
    Ok(DuplexHandle::from_stream(pipe))
}

/// Produces one ready-to-use [`DuplexHandle`] for a target address.
#[derive(Debug, Clone)]
pub struct Establisher<D = SystemDialer> {
    dialer: D,
    poll: bool,
    poll_interval: Duration,
}

impl<D: Dialer> Establisher<D> {
    pub const fn new(dialer: D, poll: bool) -> Self {
        Self {
            dialer,
            poll,
            poll_interval: DEFAULT_POLL_INTERVAL,
        }
    }

    #[must_use]
    pub const fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    /// Open `address` directly or through the bootstrap handshake.
    pub async fn establish(&self, address: &str, bootstrap: bool) -> Result<DuplexHandle> {
        if bootstrap {
            self.open_via_bootstrap(address).await
        } else {
            self.open_direct(address).await
        }
    }

    /// Open the endpoint, polling while it does not exist if enabled.
    pub async fn open_direct(&self, address: &str) -> Result<DuplexHandle> {
        loop {
            match self.dialer.open(address).await {
                Ok(handle) => return Ok(handle),
                Err(e) if self.poll && crate::error::is_not_listening(&e) => {
                    debug!(address, error = %e, "Endpoint not available yet, polling");
                    sleep(self.poll_interval).await;
                }
                Err(source) => {
                    return Err(Error::Open {
                        address: address.to_string(),
                        source,
                    });
                }
            }
        }
    }

    /// Connect to `127.0.0.1:port`, retrying transient failures if polling.
    pub async fn open_via_socket(&self, port: u32) -> Result<DuplexHandle> {
        let port = u16::try_from(port).map_err(|_| Error::InvalidPort(port))?;
        loop {
            match self.try_socket(port).await {
                Err(e) if self.poll && e.is_transient() => {
                    debug!(port, error = %e, "Loopback connect failed, retrying");
                    sleep(self.poll_interval).await;
                }
                result => return result,
            }
        }
    }

    async fn try_socket(&self, port: u16) -> Result<DuplexHandle> {
        self.dialer
            .connect_loopback(port)
            .await
            .map_err(|source| Error::Connect { port, source })
    }

    /// Run the bootstrap handshake and return the authenticated socket.
    ///
    /// A transient connect failure restarts from the discovery handle, since
    /// the announced port and nonce may have changed.
    pub async fn open_via_bootstrap(&self, address: &str) -> Result<DuplexHandle> {
        loop {
            let discovery = self.open_direct(address).await?;
            let handshake = match read_handshake(&discovery).await {
                Ok(handshake) => handshake,
                Err(e) => {
                    close_quietly(&discovery);
                    return Err(e);
                }
            };
            discovery.close()?;

            let conn = match self.try_socket(handshake.port).await {
                Ok(conn) => conn,
                Err(e) if self.poll && e.is_transient() => {
                    debug!(port = handshake.port, error = %e, "Rendezvous not ready, restarting handshake");
                    sleep(self.poll_interval).await;
                    continue;
                }
                Err(e) => return Err(e),
            };

            if let Err(e) = conn.write_all(&handshake.nonce).await {
                close_quietly(&conn);
                return Err(e);
            }
            debug!(port = handshake.port, "Authenticated rendezvous socket");
            return Ok(conn);
        }
    }
}

/// Close a handle on an error path where the first error wins.
fn close_quietly(handle: &DuplexHandle) {
    if let Err(e) = handle.close() {
        warn!(error = %e, "Failed to close handle after error");
    }
}
