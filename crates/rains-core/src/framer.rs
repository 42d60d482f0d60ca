//! Delimiter-based message framing over a byte stream.
//!
//! `Framer` turns one encoded message into a transmittable frame.
//! `Deframer` is the stream-bound cursor on the receiving side: it yields
//! one message per delimiter.
//!
//! Memory on the receive path is bounded by `max_frame`. A frame longer than
//! that is cut down to `max_frame + 1` bytes and the rest of it is discarded
//! up to the next delimiter. The receiver still sees an oversized buffer
//! (and can answer it), the head of the message is intact for token
//! recovery, and the peer cannot make us buffer an unbounded line.

use std::sync::Arc;

use bytes::{BufMut, Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt};

const READ_CHUNK: usize = 8 * 1024;

pub trait Framer: Send + Sync + 'static {
    /// Byte sequence terminating every frame.
    fn delimiter(&self) -> &[u8];

    /// Serialize a message into a frame.
    fn frame(&self, message: &[u8]) -> Result<Bytes, FrameError> {
        let delimiter = self.delimiter();
        if message.windows(delimiter.len()).any(|w| w == delimiter) {
            return Err(FrameError::DelimiterInPayload);
        }
        let mut out = BytesMut::with_capacity(message.len() + delimiter.len());
        out.put_slice(message);
        out.put_slice(delimiter);
        Ok(out.freeze())
    }
}

/// One message per line.
#[derive(Debug, Clone, Copy, Default)]
pub struct NewLineFramer;

impl Framer for NewLineFramer {
    fn delimiter(&self) -> &[u8] {
        b"\n"
    }
}

/// Receive-side cursor over a stream.
pub struct Deframer<R> {
    reader: R,
    framer: Arc<dyn Framer>,
    buf: BytesMut,
    max_frame: usize,
    /// Head of a frame that outgrew `max_frame`; the tail is being discarded.
    oversized: Option<BytesMut>,
    /// Bytes of `buf` already known not to start a delimiter.
    scanned: usize,
}

impl<R: AsyncRead + Unpin> Deframer<R> {
    pub fn new(reader: R, framer: Arc<dyn Framer>, max_frame: usize) -> Self {
        Self {
            reader,
            framer,
            buf: BytesMut::with_capacity(READ_CHUNK),
            max_frame,
            oversized: None,
            scanned: 0,
        }
    }

    /// Next complete frame without its delimiter.
    ///
    /// `Ok(None)` on a clean end of stream (no partial frame pending).
    pub async fn next_frame(&mut self) -> Result<Option<Bytes>, FrameError> {
        loop {
            if let Some(frame) = self.split_frame() {
                return Ok(Some(frame));
            }

            let n = self.reader.read_buf(&mut self.buf).await?;
            if n == 0 {
                if self.buf.is_empty() && self.oversized.is_none() {
                    return Ok(None);
                }
                return Err(FrameError::UnexpectedEof);
            }
        }
    }

    fn split_frame(&mut self) -> Option<Bytes> {
        let delimiter = self.framer.delimiter();
        let dlen = delimiter.len();

        if let Some(pos) = self.buf[self.scanned..]
            .windows(dlen)
            .position(|w| w == delimiter)
        {
            let end = self.scanned + pos;
            let mut frame = self.buf.split_to(end + dlen);
            frame.truncate(end);
            self.scanned = 0;

            if let Some(head) = self.oversized.take() {
                return Some(head.freeze());
            }
            if frame.len() > self.max_frame {
                frame.truncate(self.max_frame + 1);
            }
            return Some(frame.freeze());
        }

        // Keep the last dlen-1 bytes: they may be the start of a delimiter.
        let keep = dlen.saturating_sub(1).min(self.buf.len());
        if self.oversized.is_some() {
            let tail = self.buf.split_off(self.buf.len() - keep);
            self.buf = tail;
        } else if self.buf.len() > self.max_frame {
            let head = self.buf.split_to(self.max_frame + 1);
            self.oversized = Some(head);
            let keep = keep.min(self.buf.len());
            let tail = self.buf.split_off(self.buf.len() - keep);
            self.buf = tail;
        }
        self.scanned = self.buf.len() - keep.min(self.buf.len());
        None
    }
}

#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("message contains the frame delimiter")]
    DelimiterInPayload,

    #[error("stream ended inside a frame")]
    UnexpectedEof,
}
