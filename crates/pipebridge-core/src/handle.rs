//! Async duplex handle over one OS-level stream.
//!
//! [`DuplexHandle`] turns the submit/pending/signal model of a [`RawDuplex`]
//! into plain `read`/`write`/`close` calls. A read and a write may run at the
//! same time from different tasks; each borrows its own [`Event`] and the
//! pool lock is never held while waiting.

use std::io;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::task::{Context, Poll, Waker};

use tokio::io::{AsyncRead, AsyncWrite, ReadBuf, ReadHalf, WriteHalf};
use tracing::trace;

use crate::error::{Error, Result};
use crate::event::{Event, EventPool};

/// Outcome of submitting a non-blocking operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Submission {
    /// Completed immediately, transferring this many bytes.
    Ready(usize),
    /// Not complete; the event will be signaled when resubmitting can make
    /// progress.
    Pending,
}

/// The OS primitive behind a [`DuplexHandle`].
///
/// Implementations must never block. A `Pending` submission arranges for the
/// given event to be signaled later; the handle then submits the same
/// operation again.
pub trait RawDuplex: Send + Sync + 'static {
    fn submit_read(&self, buf: &mut [u8], event: &Arc<Event>) -> io::Result<Submission>;

    fn submit_write(&self, buf: &[u8], event: &Arc<Event>) -> io::Result<Submission>;

    /// Release the OS handle. Called at most once.
    fn close(&self) -> io::Result<()>;
}

/// Duplex handle with blocking-style operations backed by non-blocking
/// submissions and a per-handle [`EventPool`].
pub struct DuplexHandle {
    raw: Box<dyn RawDuplex>,
    events: EventPool,
    closed: AtomicBool,
}

impl std::fmt::Debug for DuplexHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DuplexHandle")
            .field("events", &self.events)
            .field("closed", &self.closed)
            .finish_non_exhaustive()
    }
}

impl DuplexHandle {
    pub fn new(raw: impl RawDuplex) -> Self {
        Self {
            raw: Box::new(raw),
            events: EventPool::new(),
            closed: AtomicBool::new(false),
        }
    }

    /// Wrap any tokio stream (Unix socket, TCP stream, named pipe client).
    pub fn from_stream<S>(stream: S) -> Self
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        Self::new(StreamDuplex::new(stream))
    }

    pub const fn events(&self) -> &EventPool {
        &self.events
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    fn ensure_open(&self, op: &'static str) -> Result<()> {
        if self.is_closed() {
            return Err(Error::io(op, io::Error::from(io::ErrorKind::NotConnected)));
        }
        Ok(())
    }

    /// Read into `buf`. `Ok(0)` with a non-empty buffer is end of stream.
    ///
    /// A zero-length read is passed through to the backend; on message pipes
    /// it completes only when a message arrives or the pipe breaks.
    pub async fn read(&self, buf: &mut [u8]) -> Result<usize> {
        self.ensure_open("read")?;
        let borrowed = self.events.acquire();
        let event = borrowed.event();
        loop {
            match self.raw.submit_read(buf, event) {
                Ok(Submission::Ready(n)) => return Ok(n),
                Ok(Submission::Pending) => {
                    trace!(len = buf.len(), "read pending");
                    event.wait().await;
                }
                Err(e) => return Err(Error::io("read", e)),
            }
        }
    }

    /// Write from `buf`, returning how many bytes the backend accepted.
    ///
    /// Zero-length writes are submitted like any other write: on message
    /// pipes they tell the peer no more data is coming.
    pub async fn write(&self, buf: &[u8]) -> Result<usize> {
        self.ensure_open("write")?;
        let borrowed = self.events.acquire();
        let event = borrowed.event();
        loop {
            match self.raw.submit_write(buf, event) {
                Ok(Submission::Ready(n)) => return Ok(n),
                Ok(Submission::Pending) => {
                    trace!(len = buf.len(), "write pending");
                    event.wait().await;
                }
                Err(e) => return Err(Error::io("write", e)),
            }
        }
    }

    /// Write the whole buffer.
    pub async fn write_all(&self, mut buf: &[u8]) -> Result<()> {
        while !buf.is_empty() {
            let n = self.write(buf).await?;
            if n == 0 {
                return Err(Error::io("write", io::Error::from(io::ErrorKind::WriteZero)));
            }
            buf = &buf[n..];
        }
        Ok(())
    }

    /// Release the OS handle and every pooled event.
    ///
    /// Only the first call does anything. A failure from the OS is returned
    /// as [`Error::Close`] and must be treated as fatal.
    pub fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        let released = self.events.close();
        trace!(released, "released pooled events");
        self.raw.close().map_err(Error::Close)
    }
}

/// [`RawDuplex`] over a tokio stream, polled with the borrowed event as
/// waker.
///
/// The stream is split so a read and a write never contend on the same lock.
/// Zero-length writes are handed to the stream as is. Once a read has seen
/// end of stream the peer is gone, so a later zero-length read fails with
/// `NotConnected`; before that it stays pending until cancelled.
pub struct StreamDuplex<S> {
    reader: Mutex<Option<ReadHalf<S>>>,
    writer: Mutex<Option<WriteHalf<S>>>,
    read_eof: AtomicBool,
}

impl<S> StreamDuplex<S>
where
    S: AsyncRead + AsyncWrite,
{
    pub fn new(stream: S) -> Self {
        let (reader, writer) = tokio::io::split(stream);
        Self {
            reader: Mutex::new(Some(reader)),
            writer: Mutex::new(Some(writer)),
            read_eof: AtomicBool::new(false),
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

fn not_connected() -> io::Error {
    io::Error::from(io::ErrorKind::NotConnected)
}

impl<S> RawDuplex for StreamDuplex<S>
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    fn submit_read(&self, buf: &mut [u8], event: &Arc<Event>) -> io::Result<Submission> {
        let mut guard = lock(&self.reader);
        let reader = guard.as_mut().ok_or_else(not_connected)?;
        if buf.is_empty() {
            if self.read_eof.load(Ordering::Acquire) {
                return Err(not_connected());
            }
            return Ok(Submission::Pending);
        }
        let waker = Waker::from(Arc::clone(event));
        let mut cx = Context::from_waker(&waker);
        let mut read_buf = ReadBuf::new(buf);
        match Pin::new(reader).poll_read(&mut cx, &mut read_buf) {
            Poll::Ready(Ok(())) => {
                let n = read_buf.filled().len();
                if n == 0 {
                    self.read_eof.store(true, Ordering::Release);
                }
                Ok(Submission::Ready(n))
            }
            Poll::Ready(Err(e)) => Err(e),
            Poll::Pending => Ok(Submission::Pending),
        }
    }

    fn submit_write(&self, buf: &[u8], event: &Arc<Event>) -> io::Result<Submission> {
        let mut guard = lock(&self.writer);
        let writer = guard.as_mut().ok_or_else(not_connected)?;
        let waker = Waker::from(Arc::clone(event));
        let mut cx = Context::from_waker(&waker);
        match Pin::new(writer).poll_write(&mut cx, buf) {
            Poll::Ready(Ok(n)) => Ok(Submission::Ready(n)),
            Poll::Ready(Err(e)) => Err(e),
            Poll::Pending => Ok(Submission::Pending),
        }
    }

    fn close(&self) -> io::Result<()> {
        let reader = lock(&self.reader).take();
        let writer = lock(&self.writer).take();
        drop((reader, writer));
        Ok(())
    }
}
