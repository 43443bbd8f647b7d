//! Error types for the pipebridge core library.

use std::io;

use thiserror::Error;

/// Result type alias using the pipebridge [`Error`].
pub type Result<T> = std::result::Result<T, Error>;

/// Errors produced while establishing or relaying a connection.
#[derive(Debug, Error)]
pub enum Error {
    /// An I/O operation on an established handle failed.
    #[error("{op}: {source}")]
    Io {
        op: &'static str,
        #[source]
        source: io::Error,
    },

    /// Reading stdin or writing stdout failed.
    #[error("{op}: {source}")]
    Stdio {
        op: &'static str,
        #[source]
        source: io::Error,
    },

    /// Opening the target address failed.
    #[error("open {address}: {source}")]
    Open {
        address: String,
        #[source]
        source: io::Error,
    },

    /// The loopback socket connect failed.
    #[error("connect 127.0.0.1:{port}: {source}")]
    Connect {
        port: u16,
        #[source]
        source: io::Error,
    },

    /// Port outside `0..=65535`.
    #[error("invalid port value: {0}")]
    InvalidPort(u32),

    /// The bootstrap handshake data was malformed or truncated.
    #[error("handshake failed: {0}")]
    Handshake(String),

    /// Releasing the OS handle failed. The handle is unusable afterwards.
    #[error("close: {0}")]
    Close(#[source] io::Error),

    /// The relay supervisor lost track of its directions.
    #[error("relay error: {0}")]
    Relay(String),
}

impl Error {
    /// Wrap an I/O error with the name of the failing operation.
    pub const fn io(op: &'static str, source: io::Error) -> Self {
        Self::Io { op, source }
    }

    fn source_io(&self) -> Option<&io::Error> {
        match self {
            Self::Io { source, .. } | Self::Open { source, .. } | Self::Connect { source, .. } => {
                Some(source)
            }
            Self::Close(source) => Some(source),
            // Standard stream failures never classify as connection state.
            Self::Stdio { .. } | Self::InvalidPort(_) | Self::Handshake(_) | Self::Relay(_) => {
                None
            }
        }
    }

    /// The endpoint does not exist yet.
    pub fn is_not_found(&self) -> bool {
        self.source_io().is_some_and(is_not_found)
    }

    /// A connect failure that may resolve once the listener is bound.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Connect { .. }) && self.source_io().is_some_and(is_transient)
    }

    /// The connection is gone for good: broken pipe or not connected.
    pub fn is_closed(&self) -> bool {
        self.source_io().is_some_and(is_closed)
    }
}

/// Whether an OS error means the endpoint has not been created yet.
pub fn is_not_found(err: &io::Error) -> bool {
    err.kind() == io::ErrorKind::NotFound
}

/// Whether a direct open failed because nobody serves the address yet.
///
/// On Unix a socket file left behind by a dead listener refuses connections
/// instead of being absent, so it counts as not there yet as well.
pub fn is_not_listening(err: &io::Error) -> bool {
    is_not_found(err) || raw::is_stale_socket(err)
}

/// Whether an OS error is retry-eligible for the loopback connect.
pub fn is_transient(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::ConnectionRefused
            | io::ErrorKind::NetworkUnreachable
            | io::ErrorKind::TimedOut
    ) || raw::is_connection_refused(err)
}

/// Whether an OS error means the peer is gone and nothing more can arrive.
pub fn is_closed(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::BrokenPipe | io::ErrorKind::NotConnected | io::ErrorKind::ConnectionReset
    ) || raw::is_pipe_not_connected(err)
}

/// Raw Win32 codes that std does not map to a dedicated `ErrorKind`.
#[cfg(windows)]
mod raw {
    use std::io;

    const ERROR_PIPE_NOT_CONNECTED: i32 = 233;
    const ERROR_CONNECTION_REFUSED: i32 = 1225;

    pub fn is_pipe_not_connected(err: &io::Error) -> bool {
        err.raw_os_error() == Some(ERROR_PIPE_NOT_CONNECTED)
    }

    pub fn is_connection_refused(err: &io::Error) -> bool {
        err.raw_os_error() == Some(ERROR_CONNECTION_REFUSED)
    }

    pub const fn is_stale_socket(_err: &io::Error) -> bool {
        false
    }
}

#[cfg(not(windows))]
mod raw {
    use std::io;

    pub const fn is_pipe_not_connected(_err: &io::Error) -> bool {
        false
    }

    pub const fn is_connection_refused(_err: &io::Error) -> bool {
        false
    }

    pub fn is_stale_socket(err: &io::Error) -> bool {
        err.kind() == io::ErrorKind::ConnectionRefused
    }
}
