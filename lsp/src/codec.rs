//! JSON-RPC framing codec for LSP communication.
//!
//! LSP uses `Content-Length: N\r\n\r\n{json}` framing over stdin/stdout.
//! The synchronous functions here ([`parse_message`], [`serialize_message`],
//! [`parse_stream`]) hold no state between calls; [`StreamParser`] owns the
//! carry-over buffer for a byte stream that arrives in arbitrary pieces, and
//! [`FrameReader`]/[`FrameWriter`] adapt it to async readers and writers.

use std::collections::VecDeque;

use anyhow::{Context, Result, bail};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::message::{Message, ProtocolError};

/// Maximum frame size (64 MiB) to prevent unbounded memory allocation.
pub const MAX_FRAME_BYTES: usize = 64 * 1024 * 1024;

/// A header block without a separator is abandoned once it grows past this.
const MAX_HEADER_BYTES: usize = 8 * 1024;

const CONTENT_LENGTH_KEY: &str = "Content-Length:";

const SEPARATOR: &[u8] = b"\r\n\r\n";

const READ_CHUNK_BYTES: usize = 16 * 1024;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FrameError {
    #[error("invalid header line: {0:?}")]
    InvalidHeader(String),
    #[error("header block has no Content-Length")]
    MissingContentLength,
    #[error("missing header/body separator")]
    MissingSeparator,
    #[error("body is {actual} bytes but Content-Length declared {declared}")]
    LengthMismatch { declared: usize, actual: usize },
    #[error("Content-Length {0} exceeds maximum {MAX_FRAME_BYTES}")]
    TooLarge(usize),
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CodecError {
    #[error(transparent)]
    Frame(#[from] FrameError),
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
}

/// Extract the length from a `Content-Length: <n>` header line.
///
/// The key is matched case-sensitively; whitespace around the number is
/// tolerated.
pub fn parse_header_length(line: &str) -> Result<usize, FrameError> {
    let invalid = || FrameError::InvalidHeader(line.to_string());
    let value = line.strip_prefix(CONTENT_LENGTH_KEY).ok_or_else(invalid)?;
    value.trim().parse::<usize>().map_err(|_| invalid())
}

/// Find `Content-Length` in a header block, ignoring every other header.
fn header_block_length(block: &[u8]) -> Result<usize, FrameError> {
    let text = std::str::from_utf8(block)
        .map_err(|_| FrameError::InvalidHeader(String::from_utf8_lossy(block).into_owned()))?;
    for line in text.lines() {
        // Leftover bytes from a skipped frame may precede the key on the same line.
        if let Some(pos) = line.find(CONTENT_LENGTH_KEY) {
            return parse_header_length(&line[pos..]);
        }
    }
    Err(FrameError::MissingContentLength)
}

fn find_separator(bytes: &[u8]) -> Option<usize> {
    bytes.windows(SEPARATOR.len()).position(|w| w == SEPARATOR)
}

fn decode_body(body: &[u8]) -> Result<Message, ProtocolError> {
    let value: serde_json::Value =
        serde_json::from_slice(body).map_err(|e| ProtocolError::InvalidJson(e.to_string()))?;
    Message::from_value(value)
}

/// Parse exactly one complete frame.
///
/// The body must be exactly `Content-Length` bytes: a short or long body is
/// [`FrameError::LengthMismatch`], never a truncated message.
pub fn parse_message(raw: &[u8]) -> Result<Message, CodecError> {
    let sep = find_separator(raw).ok_or(FrameError::MissingSeparator)?;
    let declared = header_block_length(&raw[..sep])?;
    let body = &raw[sep + SEPARATOR.len()..];
    if body.len() != declared {
        return Err(FrameError::LengthMismatch {
            declared,
            actual: body.len(),
        }
        .into());
    }
    Ok(decode_body(body)?)
}

/// Encode a message as one frame. `Content-Length` counts bytes, not chars.
#[must_use]
pub fn serialize_message(message: &Message) -> String {
    let body = message.to_value().to_string();
    format!("Content-Length: {}\r\n\r\n{body}", body.len())
}

/// Result of one [`parse_stream`] pass.
#[derive(Debug)]
pub struct StreamParse<'a> {
    /// Complete messages in stream order.
    pub messages: Vec<Message>,
    /// Frames that were skipped; none of them stop the scan.
    pub rejected: Vec<CodecError>,
    /// Bytes of an incomplete trailing frame, to be prefixed to the next read.
    pub remaining: &'a [u8],
}

/// Parse every complete frame in `buffer`.
///
/// Never blocks and never fails for lack of data: an incomplete frame is
/// returned untouched in `remaining`. A header block without a usable
/// `Content-Length` is skipped and scanning resumes after it, and a body that
/// doesn't decode is dropped, so one corrupt frame can't stall the stream.
pub fn parse_stream(buffer: &[u8]) -> StreamParse<'_> {
    let mut messages = Vec::new();
    let mut rejected = Vec::new();
    let mut cursor = 0;

    while let Some(sep) = find_separator(&buffer[cursor..]) {
        let window = &buffer[cursor..];
        let body_start = sep + SEPARATOR.len();

        let declared = match header_block_length(&window[..sep]) {
            Ok(len) if len > MAX_FRAME_BYTES => Err(FrameError::TooLarge(len)),
            other => other,
        };
        let declared = match declared {
            Ok(len) => len,
            Err(e) => {
                tracing::warn!("Skipping malformed LSP header block: {e}");
                rejected.push(e.into());
                cursor += body_start;
                continue;
            }
        };

        if window.len() - body_start < declared {
            break;
        }

        let body = &window[body_start..body_start + declared];
        cursor += body_start + declared;
        match decode_body(body) {
            Ok(message) => messages.push(message),
            Err(e) => {
                tracing::warn!("Dropping undecodable LSP frame: {e}");
                rejected.push(e.into());
            }
        }
    }

    StreamParse {
        messages,
        rejected,
        remaining: &buffer[cursor..],
    }
}

/// Messages and rejections produced by one [`StreamParser::push`].
#[derive(Debug, Default)]
pub struct StreamBatch {
    pub messages: Vec<Message>,
    pub rejected: Vec<CodecError>,
}

/// Resumable wrapper around [`parse_stream`] that keeps the partial tail.
#[derive(Debug, Default)]
pub struct StreamParser {
    buffer: Vec<u8>,
}

impl StreamParser {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a chunk and return every frame it completed.
    pub fn push(&mut self, chunk: &[u8]) -> StreamBatch {
        self.buffer.extend_from_slice(chunk);
        let parsed = parse_stream(&self.buffer);
        let consumed = self.buffer.len() - parsed.remaining.len();
        let batch = StreamBatch {
            messages: parsed.messages,
            rejected: parsed.rejected,
        };
        self.buffer.drain(..consumed);

        // A separator that never arrives would otherwise grow the buffer forever.
        if self.buffer.len() > MAX_HEADER_BYTES && find_separator(&self.buffer).is_none() {
            tracing::warn!(
                bytes = self.buffer.len(),
                "Discarding LSP data with no header separator"
            );
            self.buffer.clear();
        }

        batch
    }

    /// Bytes held back waiting for the rest of a frame.
    #[must_use]
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }
}

/// Reads JSON-RPC messages from an async reader.
pub struct FrameReader<R> {
    reader: R,
    parser: StreamParser,
    ready: VecDeque<Message>,
    chunk: Vec<u8>,
}

impl<R: AsyncRead + Unpin> FrameReader<R> {
    pub fn new(reader: R) -> Self {
        Self {
            reader,
            parser: StreamParser::new(),
            ready: VecDeque::new(),
            chunk: vec![0; READ_CHUNK_BYTES],
        }
    }

    /// Read the next message.
    ///
    /// Returns `Ok(None)` on EOF at a frame boundary (clean shutdown).
    /// Returns `Err` on EOF in the middle of a frame or on an I/O error.
    /// Malformed frames are logged and skipped.
    pub async fn read_message(&mut self) -> Result<Option<Message>> {
        loop {
            if let Some(message) = self.ready.pop_front() {
                return Ok(Some(message));
            }

            let n = self
                .reader
                .read(&mut self.chunk)
                .await
                .context("reading LSP stream")?;
            if n == 0 {
                if self.parser.buffered() == 0 {
                    return Ok(None);
                }
                bail!(
                    "unexpected EOF with {} bytes of an incomplete frame",
                    self.parser.buffered()
                );
            }

            let batch = self.parser.push(&self.chunk[..n]);
            self.ready.extend(batch.messages);
        }
    }
}

/// Writes JSON-RPC messages to an async writer.
pub struct FrameWriter<W> {
    writer: W,
}

impl<W: AsyncWrite + Unpin> FrameWriter<W> {
    pub fn new(writer: W) -> Self {
        Self { writer }
    }

    /// Write one framed message and flush.
    pub async fn write_message(&mut self, message: &Message) -> Result<()> {
        let frame = serialize_message(message);
        self.writer
            .write_all(frame.as_bytes())
            .await
            .context("writing frame")?;
        self.writer.flush().await.context("flushing frame")?;
        Ok(())
    }

    pub fn into_inner(self) -> W {
        self.writer
    }
}
