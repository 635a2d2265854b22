//! Line framing for JSON messages
//!
//! Every channel the proxy speaks (agent stdio, application sockets) carries
//! one compact JSON value per line, terminated by `\n`. Nothing above this
//! module touches raw bytes.

use bytes::BytesMut;
use serde::Serialize;
use serde_json::Value;
use std::io;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::Mutex;
use tracing::{trace, warn};

use crate::config::defaults::DEFAULT_MAX_FRAME_BYTES;
use crate::error::CodecError;

const READ_CHUNK: usize = 4096;

/// Serialize a value as one frame (compact JSON plus `\n`)
///
/// serde_json escapes control characters inside strings, so the output
/// never contains a raw newline before the terminator.
pub fn encode_frame<T: Serialize + ?Sized>(value: &T) -> Result<Vec<u8>, CodecError> {
    let mut bytes = serde_json::to_vec(value)?;
    bytes.push(b'\n');
    Ok(bytes)
}

/// Reassembles frames from a byte stream
///
/// A single read may deliver zero, one or several complete lines plus a
/// trailing partial line; the partial line stays buffered for the next call.
pub struct FrameReader<R> {
    inner: R,
    buf: BytesMut,
    chunk: Vec<u8>,
    /// Bytes of `buf` already known to contain no newline
    scanned: usize,
    max_frame_bytes: usize,
    /// Dropping the tail of an oversized line until the next newline
    discarding: bool,
    eof: bool,
}

impl<R: AsyncRead + Unpin> FrameReader<R> {
    pub fn new(inner: R) -> Self {
        Self::with_limit(inner, DEFAULT_MAX_FRAME_BYTES)
    }

    pub fn with_limit(inner: R, max_frame_bytes: usize) -> Self {
        Self {
            inner,
            buf: BytesMut::with_capacity(8192),
            chunk: vec![0u8; READ_CHUNK],
            scanned: 0,
            max_frame_bytes,
            discarding: false,
            eof: false,
        }
    }

    /// Read the next JSON value
    ///
    /// `Ok(None)` means the peer closed the stream. Errors for which
    /// [`CodecError::is_recoverable`] holds only concern the offending line;
    /// the caller can keep reading.
    pub async fn read_message(&mut self) -> Result<Option<Value>, CodecError> {
        loop {
            if let Some(line_end) = self.find_newline() {
                let line = self.buf.split_to(line_end + 1);
                self.scanned = 0;

                if self.discarding {
                    self.discarding = false;
                    continue;
                }
                if line_end > self.max_frame_bytes {
                    warn!(
                        "Frame of {} bytes exceeds {} bytes, discarding",
                        line_end, self.max_frame_bytes
                    );
                    return Err(CodecError::FrameTooLarge {
                        limit: self.max_frame_bytes,
                    });
                }

                match parse_line(&line[..line_end]) {
                    Some(result) => return result.map(Some),
                    None => continue,
                }
            }

            if self.eof {
                if self.buf.is_empty() || self.discarding {
                    self.buf.clear();
                    return Ok(None);
                }
                // Final line without a terminator
                let rest = self.buf.split();
                self.scanned = 0;
                if rest.len() > self.max_frame_bytes {
                    return Err(CodecError::FrameTooLarge {
                        limit: self.max_frame_bytes,
                    });
                }
                match parse_line(&rest) {
                    Some(result) => return result.map(Some),
                    None => return Ok(None),
                }
            }

            if self.buf.len() > self.max_frame_bytes {
                warn!(
                    "Frame exceeds {} bytes without newline, discarding",
                    self.max_frame_bytes
                );
                self.buf.clear();
                self.scanned = 0;
                let already_reported = self.discarding;
                self.discarding = true;
                if !already_reported {
                    return Err(CodecError::FrameTooLarge {
                        limit: self.max_frame_bytes,
                    });
                }
            }

            match self.inner.read(&mut self.chunk).await {
                Ok(0) => {
                    trace!("Stream reached EOF");
                    self.eof = true;
                }
                Ok(n) => {
                    trace!("Read {} bytes", n);
                    self.buf.extend_from_slice(&self.chunk[..n]);
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => return Err(CodecError::Io(e)),
            }
        }
    }

    fn find_newline(&mut self) -> Option<usize> {
        match self.buf[self.scanned..].iter().position(|&b| b == b'\n') {
            Some(offset) => Some(self.scanned + offset),
            None => {
                self.scanned = self.buf.len();
                None
            }
        }
    }
}

/// Parse one line; `None` for blank lines
fn parse_line(bytes: &[u8]) -> Option<Result<Value, CodecError>> {
    let bytes = bytes.strip_suffix(b"\r").unwrap_or(bytes);
    let line = match std::str::from_utf8(bytes) {
        Ok(line) => line,
        Err(e) => {
            return Some(Err(CodecError::Malformed {
                reason: e.to_string(),
                line: String::from_utf8_lossy(bytes).into_owned(),
            }))
        }
    };

    if line.trim().is_empty() {
        return None;
    }

    Some(
        serde_json::from_str(line).map_err(|e| CodecError::Malformed {
            reason: e.to_string(),
            line: line.to_string(),
        }),
    )
}

/// Write half of a framed channel
///
/// Sends are serialized by an internal lock, so concurrent senders never
/// interleave bytes of two frames.
pub struct FrameWriter<W> {
    inner: Mutex<W>,
}

impl<W: AsyncWrite + Unpin> FrameWriter<W> {
    pub fn new(inner: W) -> Self {
        Self {
            inner: Mutex::new(inner),
        }
    }

    /// Serialize, write and flush one frame
    pub async fn send<T: Serialize + ?Sized>(&self, message: &T) -> Result<(), CodecError> {
        let frame = encode_frame(message)?;
        let mut writer = self.inner.lock().await;
        writer.write_all(&frame).await?;
        writer.flush().await?;
        Ok(())
    }

    /// Close the write direction
    pub async fn shutdown(&self) -> Result<(), CodecError> {
        let mut writer = self.inner.lock().await;
        writer.shutdown().await?;
        Ok(())
    }
}
