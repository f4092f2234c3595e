//! Length-prefixed framed connection to a device.
//!
//! After the upgrade handshake the device link carries frames of the form:
//!
//! ```text
//! [length:u16 LE][payload: length - 2 bytes]
//! ```
//!
//! The length counts itself, so the smallest legal frame is 3 bytes.
//!
//! # Ownership
//!
//! A [`FramedConnection`] splits into one [`FrameReader`], owned by the
//! session's ingress loop, and one [`FrameWriter`], shared by every task
//! that writes to the device. The writer holds an async lock across the
//! header and payload writes so frames from concurrent writers never
//! interleave.
//!
//! [`FrameWriter::close`] cuts the write side without taking that lock: any
//! write in progress or queued behind it fails with
//! [`Error::ConnectionClosed`], even when the peer has stopped reading.

// ============================================================================
// Imports
// ============================================================================

use std::fmt;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::sync::{Mutex, watch};
use tracing::trace;

use crate::error::{Error, Result};
use crate::protocol::{LENGTH_PREFIX_LEN, MAX_FRAME_PAYLOAD};

use super::handshake::IncomingRequest;

// ============================================================================
// Types
// ============================================================================

/// Byte stream a device link runs over.
pub trait DeviceStream: AsyncRead + AsyncWrite + Send + 'static {}

impl<T> DeviceStream for T where T: AsyncRead + AsyncWrite + Send + 'static {}

type BoxedRead = Box<dyn AsyncRead + Send + Unpin>;
type BoxedWrite = Box<dyn AsyncWrite + Send + Unpin>;

// ============================================================================
// FramedConnection
// ============================================================================

/// A device link speaking length-prefixed frames.
pub struct FramedConnection {
    reader: FrameReader,
    writer: FrameWriter,
}

impl fmt::Debug for FramedConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FramedConnection").finish_non_exhaustive()
    }
}

impl FramedConnection {
    /// Wraps an already-upgraded byte stream.
    pub fn new<S>(stream: S) -> Self
    where
        S: DeviceStream + Unpin,
    {
        let (read, write): (ReadHalf<S>, WriteHalf<S>) = tokio::io::split(stream);
        Self {
            reader: FrameReader {
                inner: Box::new(read),
            },
            writer: FrameWriter {
                inner: Mutex::new(Box::new(write)),
                closed: watch::Sender::new(false),
            },
        }
    }

    /// Upgrades an HTTP request into a framed connection.
    ///
    /// # Errors
    ///
    /// See [`IncomingRequest::upgrade`]; nothing is claimed on failure.
    pub async fn upgrade(request: IncomingRequest) -> Result<Self> {
        let stream = request.upgrade().await?;
        Ok(Self::new(stream))
    }

    /// Reads one frame. See [`FrameReader::read_message`].
    pub async fn read_message(&mut self) -> Result<Vec<u8>> {
        self.reader.read_message().await
    }

    /// Writes one frame. See [`FrameWriter::write_message`].
    pub async fn write_message(&self, payload: &[u8]) -> Result<()> {
        self.writer.write_message(payload).await
    }

    /// Splits into the read side and the shared write side.
    #[must_use]
    pub fn into_split(self) -> (FrameReader, FrameWriter) {
        (self.reader, self.writer)
    }
}

// ============================================================================
// FrameReader
// ============================================================================

/// Read side of a device link.
pub struct FrameReader {
    inner: BoxedRead,
}

impl FrameReader {
    /// Blocks until one full frame has arrived and returns its payload.
    ///
    /// # Errors
    ///
    /// - [`Error::Framing`] if the length field is 2 or less
    /// - [`Error::Io`] if the stream fails or ends mid-frame
    pub async fn read_message(&mut self) -> Result<Vec<u8>> {
        let mut prefix = [0u8; LENGTH_PREFIX_LEN];
        self.inner.read_exact(&mut prefix).await?;

        let length = u16::from_le_bytes(prefix) as usize;
        if length <= LENGTH_PREFIX_LEN {
            return Err(Error::framing(format!("invalid frame length {length}")));
        }

        let mut payload = vec![0u8; length - LENGTH_PREFIX_LEN];
        self.inner.read_exact(&mut payload).await?;

        trace!(len = payload.len(), "Frame read");
        Ok(payload)
    }
}

// ============================================================================
// FrameWriter
// ============================================================================

/// Write side of a device link, safe to share between tasks.
pub struct FrameWriter {
    inner: Mutex<BoxedWrite>,
    /// Set once the link is cut; pending writes give up.
    closed: watch::Sender<bool>,
}

impl FrameWriter {
    /// Writes one frame; concurrent callers are serialized.
    ///
    /// Partial writes are retried until the whole frame is out.
    ///
    /// # Errors
    ///
    /// - [`Error::Framing`] if the payload does not fit in one frame
    /// - [`Error::ConnectionClosed`] if the writer is closed before the
    ///   frame is out
    /// - [`Error::Io`] if the stream fails
    pub async fn write_message(&self, payload: &[u8]) -> Result<()> {
        if payload.len() > MAX_FRAME_PAYLOAD {
            return Err(Error::framing(format!(
                "payload of {} bytes exceeds frame limit {MAX_FRAME_PAYLOAD}",
                payload.len()
            )));
        }

        // Bounded by the check above.
        let length = (payload.len() + LENGTH_PREFIX_LEN) as u16;

        let mut closed = self.closed.subscribe();
        tokio::select! {
            biased;
            () = wait_closed(&mut closed) => Err(Error::ConnectionClosed),
            written = self.write_frame(length, payload) => written,
        }
    }

    async fn write_frame(&self, length: u16, payload: &[u8]) -> Result<()> {
        let mut inner = self.inner.lock().await;
        inner.write_all(&length.to_le_bytes()).await?;
        inner.write_all(payload).await?;
        inner.flush().await?;

        trace!(len = payload.len(), "Frame written");
        Ok(())
    }

    /// Fails every pending and future write. Does not wait.
    pub fn close(&self) {
        self.closed.send_replace(true);
    }

    /// Returns `true` once [`close`](Self::close) has been called.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        *self.closed.borrow()
    }

    /// Closes the writer, then the write direction of the link.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Io`] if the shutdown fails.
    pub async fn shutdown(&self) -> Result<()> {
        self.close();
        self.inner.lock().await.shutdown().await?;
        Ok(())
    }
}

/// Resolves once the closed flag is set.
async fn wait_closed(rx: &mut watch::Receiver<bool>) {
    let _ = rx.wait_for(|closed| *closed).await;
}

// ============================================================================
// Tests
// ============================================================================
