//! Async stream transport
//!
//! Reads are built on the cancel-safe `AsyncReadExt::read`, buffered in a
//! [`FrameDecoder`], and bounded by a timeout. A timed-out read keeps whatever
//! partial data already arrived, so callers can poll a shutdown flag between
//! attempts without losing stream position.

use crate::error::{ProtocolError, Result};
use crate::message::{FrameDecoder, Message};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::trace;

const READ_CHUNK: usize = 64 * 1024;

/// Buffered, timeout-aware reader for one stream.
pub struct StreamReader<R> {
    reader: R,
    decoder: FrameDecoder,
    scratch: Box<[u8]>,
}

impl<R: AsyncRead + Unpin> StreamReader<R> {
    pub fn new(reader: R) -> Self {
        Self {
            reader,
            decoder: FrameDecoder::new(),
            scratch: vec![0u8; READ_CHUNK].into_boxed_slice(),
        }
    }

    /// One read attempt. `Ok(false)` means the timeout elapsed.
    async fn fill(&mut self, timeout: Duration) -> Result<bool> {
        match tokio::time::timeout(timeout, self.reader.read(&mut self.scratch)).await {
            Err(_) => Ok(false),
            Ok(Ok(0)) => Err(ProtocolError::ConnectionClosed),
            Ok(Ok(n)) => {
                self.decoder.extend(&self.scratch[..n]);
                Ok(true)
            }
            Ok(Err(e)) => Err(ProtocolError::Io(e)),
        }
    }

    /// Next control message, or `None` if `timeout` elapsed first.
    pub async fn poll_message(&mut self, timeout: Duration) -> Result<Option<Message>> {
        loop {
            if let Some(msg) = self.decoder.next_message()? {
                return Ok(Some(msg));
            }
            if !self.fill(timeout).await? {
                return Ok(None);
            }
        }
    }

    /// Next control message; a timeout is an error.
    pub async fn read_message(&mut self, timeout: Duration) -> Result<Message> {
        self.poll_message(timeout)
            .await?
            .ok_or(ProtocolError::Timeout {
                operation: "read message",
                duration_ms: timeout.as_millis() as u64,
            })
    }

    /// Wait until at least `n` raw bytes are buffered. `Ok(false)` on timeout.
    pub async fn poll_bytes(&mut self, n: usize, timeout: Duration) -> Result<bool> {
        while self.decoder.buffered() < n {
            if !self.fill(timeout).await? {
                return Ok(false);
            }
        }
        Ok(true)
    }

    /// Buffered raw bytes not yet consumed.
    pub fn buffered(&self) -> &[u8] {
        self.decoder.peek()
    }

    pub fn consume(&mut self, n: usize) {
        self.decoder.consume(n);
    }
}

/// Encode and write one control frame.
pub async fn write_message<W: AsyncWrite + Unpin>(writer: &mut W, msg: &Message) -> Result<()> {
    let frame = msg.encode()?;
    writer.write_all(&frame).await?;
    writer.flush().await?;
    trace!(kind = msg.name(), bytes = frame.len(), "sent frame");
    Ok(())
}
