//! Bootstrap handshake parsing.
//!
//! The discovery handle carries an ASCII decimal port, a `\n`, then exactly
//! [`NONCE_LEN`] raw bytes. Bytes may arrive in arbitrary chunks, so parsing
//! is incremental.

use tracing::debug;

use crate::error::{Error, Result};
use crate::handle::DuplexHandle;

/// Length of the authentication nonce.
pub const NONCE_LEN: usize = 16;

/// Longest port line accepted before the data is considered malformed.
const MAX_PORT_LINE: usize = 32;

/// Port and nonce announced on the discovery handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Handshake {
    pub port: u16,
    pub nonce: [u8; NONCE_LEN],
}

#[derive(Debug)]
enum State {
    Port(Vec<u8>),
    Nonce { port: u16, nonce: Vec<u8> },
}

/// Incremental parser fed with whatever the discovery handle yields.
#[derive(Debug)]
pub struct HandshakeParser {
    state: State,
}

impl Default for HandshakeParser {
    fn default() -> Self {
        Self {
            state: State::Port(Vec::new()),
        }
    }
}

impl HandshakeParser {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed the next chunk. Returns the handshake once the nonce is
    /// complete; trailing bytes after the nonce are ignored.
    pub fn feed(&mut self, mut chunk: &[u8]) -> Result<Option<Handshake>> {
        while !chunk.is_empty() {
            match &mut self.state {
                State::Port(line) => {
                    if let Some(pos) = chunk.iter().position(|&b| b == b'\n') {
                        line.extend_from_slice(&chunk[..pos]);
                        check_line_len(line.len())?;
                        let port = parse_port(line)?;
                        chunk = &chunk[pos + 1..];
                        self.state = State::Nonce {
                            port,
                            nonce: Vec::with_capacity(NONCE_LEN),
                        };
                    } else {
                        line.extend_from_slice(chunk);
                        check_line_len(line.len())?;
                        return Ok(None);
                    }
                }
                State::Nonce { port, nonce } => {
                    let take = chunk.len().min(NONCE_LEN - nonce.len());
                    nonce.extend_from_slice(&chunk[..take]);
                    chunk = &chunk[take..];
                    if let Some(handshake) = complete(*port, nonce) {
                        return Ok(Some(handshake));
                    }
                }
            }
        }
        Ok(None)
    }

    /// The discovery stream ended. Fails with how far parsing got.
    pub fn finish(&self) -> Error {
        match &self.state {
            State::Port(line) => Error::Handshake(format!(
                "stream ended before the port line was terminated ({} bytes read)",
                line.len()
            )),
            State::Nonce { nonce, .. } => Error::Handshake(format!(
                "read incorrect number of bytes for nonce: expected {NONCE_LEN}, got {}",
                nonce.len()
            )),
        }
    }
}

fn check_line_len(len: usize) -> Result<()> {
    if len > MAX_PORT_LINE {
        return Err(Error::Handshake(format!(
            "port line exceeds {MAX_PORT_LINE} bytes"
        )));
    }
    Ok(())
}

fn parse_port(line: &[u8]) -> Result<u16> {
    let line = line.strip_suffix(b"\r").unwrap_or(line);
    let text = std::str::from_utf8(line)
        .map_err(|_| Error::Handshake(format!("port line is not ASCII: {line:02X?}")))?;
    text.parse::<u16>()
        .map_err(|e| Error::Handshake(format!("invalid port {text:?}: {e}")))
}

fn complete(port: u16, nonce: &[u8]) -> Option<Handshake> {
    let nonce: [u8; NONCE_LEN] = nonce.try_into().ok()?;
    Some(Handshake { port, nonce })
}

/// Read the handshake from the discovery handle.
pub async fn read_handshake(handle: &DuplexHandle) -> Result<Handshake> {
    let mut parser = HandshakeParser::new();
    let mut buf = [0u8; 64];
    loop {
        let n = handle.read(&mut buf).await?;
        if n == 0 {
            return Err(parser.finish());
        }
        if let Some(handshake) = parser.feed(&buf[..n])? {
            debug!(
                port = handshake.port,
                nonce = %hex::encode_upper(handshake.nonce),
                "Received bootstrap handshake"
            );
            return Ok(handshake);
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    const NONCE: [u8; NONCE_LEN] = *b"0123456789abcdef";

    fn wire(port: &str, nonce: &[u8]) -> Vec<u8> {
        let mut bytes = port.as_bytes().to_vec();
        bytes.push(b'\n');
        bytes.extend_from_slice(nonce);
        bytes
    }

    #[test]
    fn parses_in_one_chunk() {
        let mut parser = HandshakeParser::new();
        let got = parser.feed(&wire("4321", &NONCE)).unwrap().unwrap();
        assert_eq!(got.port, 4321);
        assert_eq!(got.nonce, NONCE);
    }

    #[test]
    fn parses_byte_by_byte() {
        let mut parser = HandshakeParser::new();
        let bytes = wire("65535", &NONCE);
        let (last, rest) = bytes.split_last().unwrap();
        for b in rest {
            assert!(parser.feed(std::slice::from_ref(b)).unwrap().is_none());
        }
        let got = parser.feed(std::slice::from_ref(last)).unwrap().unwrap();
        assert_eq!(got.port, 65535);
        assert_eq!(got.nonce, NONCE);
    }

    #[test]
    fn nonce_may_contain_newlines() {
        let nonce = [b'\n'; NONCE_LEN];
        let mut parser = HandshakeParser::new();
        let got = parser.feed(&wire("80", &nonce)).unwrap().unwrap();
        assert_eq!(got.port, 80);
        assert_eq!(got.nonce, nonce);
    }

    #[test]
    fn accepts_crlf_terminated_port() {
        let mut parser = HandshakeParser::new();
        let got = parser.feed(&wire("4321\r", &NONCE)).unwrap().unwrap();
        assert_eq!(got.port, 4321);
    }

    #[test]
    fn ignores_bytes_after_nonce() {
        let mut bytes = wire("4321", &NONCE);
        bytes.extend_from_slice(b"trailing");
        let mut parser = HandshakeParser::new();
        assert_eq!(parser.feed(&bytes).unwrap().unwrap().nonce, NONCE);
    }

    #[test]
    fn rejects_non_numeric_port() {
        let mut parser = HandshakeParser::new();
        let err = parser.feed(b"abc\n").unwrap_err();
        assert!(matches!(err, Error::Handshake(_)));
    }

    #[test]
    fn rejects_out_of_range_and_negative_ports() {
        for port in ["65536", "-1", "", "99999999"] {
            let mut parser = HandshakeParser::new();
            assert!(parser.feed(&wire(port, &NONCE)).is_err(), "port {port:?}");
        }
    }

    #[test]
    fn rejects_overlong_port_line() {
        let mut parser = HandshakeParser::new();
        assert!(parser.feed(&[b'1'; MAX_PORT_LINE + 1]).is_err());
    }

    #[test]
    fn short_nonce_reports_byte_count() {
        let mut parser = HandshakeParser::new();
        assert!(parser.feed(&wire("4321", &NONCE[..5])).unwrap().is_none());
        let msg = parser.finish().to_string();
        assert!(msg.contains("expected 16, got 5"), "{msg}");
    }

    #[test]
    fn missing_newline_reports_line_length() {
        let mut parser = HandshakeParser::new();
        assert!(parser.feed(b"43").unwrap().is_none());
        assert!(parser.finish().to_string().contains("2 bytes read"));
    }

    #[tokio::test]
    async fn reads_handshake_from_handle() {
        use tokio::io::AsyncWriteExt;

        let (local, mut remote) = tokio::io::duplex(64);
        let handle = DuplexHandle::from_stream(local);
        remote.write_all(b"4321\n0123").await.unwrap();
        remote.write_all(b"456789abcdef").await.unwrap();
        let got = read_handshake(&handle).await.unwrap();
        assert_eq!(got, Handshake { port: 4321, nonce: NONCE });
    }

    #[tokio::test]
    async fn stream_end_before_nonce_fails() {
        use tokio::io::AsyncWriteExt;

        let (local, mut remote) = tokio::io::duplex(64);
        let handle = DuplexHandle::from_stream(local);
        remote.write_all(b"4321\nabc").await.unwrap();
        drop(remote);
        let err = read_handshake(&handle).await.unwrap_err();
        assert!(err.to_string().contains("got 3"));
    }
}
