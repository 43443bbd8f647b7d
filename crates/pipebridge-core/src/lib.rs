//! pipebridge core library
//!
//! Relays a process's standard streams over one duplex connection:
//! - Waitable-event pool and async duplex handle over OS streams
//! - Connection establishment, direct or via the bootstrap handshake
//! - Two-direction relay with explicit shutdown ordering

pub mod connect;
pub mod error;
pub mod event;
pub mod handle;
pub mod handshake;
pub mod relay;
pub mod tracing_init;

pub use connect::{Dialer, Establisher, SystemDialer};
pub use error::{Error, Result};
pub use handle::{DuplexHandle, RawDuplex, StreamDuplex, Submission};
pub use handshake::{Handshake, NONCE_LEN};
pub use relay::{Relay, RelayPolicy, Termination};
