//! NDJSON event codec for `codex exec --experimental-json` output.
//!
//! Wraps [`tokio_util::codec::LinesCodec`] with a maximum line length and
//! decodes every complete line into a [`ThreadEvent`]. Lines that are not
//! valid JSON, or whose JSON is not a supported event shape, are logged and
//! skipped; they never end the stream.
//!
//! [`EventCodec`] is the codec parameter for
//! [`tokio_util::codec::FramedRead`] over a child's stdout. [`LineDecoder`]
//! exposes the same framing for callers that receive byte chunks by other
//! means.

use bytes::BytesMut;
use tokio_util::codec::{Decoder, LinesCodec, LinesCodecError};
use tracing::{debug, warn};

use crate::event::{decode_event, ThreadEvent};
use crate::{AppError, Result};

/// Maximum line length accepted by the codec: 1 MiB.
pub const MAX_LINE_BYTES: usize = 1_048_576;

/// Line-framed decoder yielding [`ThreadEvent`]s.
///
/// # Decoder
///
/// `decode` keeps pulling lines out of `src` until one decodes to an event
/// or no complete line remains. `decode_eof` additionally treats a trailing
/// fragment without `\n` as a final line.
///
/// Over-long lines and lines that are not UTF-8 are discarded and reported
/// as a warning, so decoding itself never fails.
#[derive(Debug)]
pub struct EventCodec(LinesCodec);

impl EventCodec {
    /// Create a new `EventCodec` with the default [`MAX_LINE_BYTES`] limit.
    #[must_use]
    pub fn new() -> Self {
        Self(LinesCodec::new_with_max_length(MAX_LINE_BYTES))
    }
}

impl Default for EventCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl Decoder for EventCodec {
    type Item = ThreadEvent;
    type Error = AppError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>> {
        loop {
            match self.0.decode(src) {
                Ok(Some(line)) => {
                    if let Some(event) = parse_line(&line) {
                        return Ok(Some(event));
                    }
                }
                Ok(None) => return Ok(None),
                Err(LinesCodecError::MaxLineLengthExceeded) => {
                    warn!(
                        max_bytes = MAX_LINE_BYTES,
                        "event codec: line too long, skipping"
                    );
                }
                Err(LinesCodecError::Io(err)) => {
                    warn!(error = %err, "event codec: undecodable line, skipping");
                }
            }
        }
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>> {
        if let Some(event) = self.decode(src)? {
            return Ok(Some(event));
        }
        loop {
            match self.0.decode_eof(src) {
                Ok(Some(line)) => {
                    if let Some(event) = parse_line(&line) {
                        return Ok(Some(event));
                    }
                }
                Ok(None) => return Ok(None),
                Err(LinesCodecError::MaxLineLengthExceeded) => {
                    warn!(
                        max_bytes = MAX_LINE_BYTES,
                        "event codec: trailing line too long, skipping"
                    );
                }
                Err(LinesCodecError::Io(err)) => {
                    warn!(error = %err, "event codec: undecodable trailing line, skipping");
                }
            }
        }
    }
}

/// Parse one line into an event, logging and dropping anything unusable.
///
/// Returns `None` for blank lines, malformed JSON and unsupported shapes.
#[must_use]
pub fn parse_line(line: &str) -> Option<ThreadEvent> {
    let trimmed = line.trim();
    if trimmed.is_empty() {
        return None;
    }

    let value: serde_json::Value = match serde_json::from_str(trimmed) {
        Ok(value) => value,
        Err(err) => {
            warn!(error = %err, raw_line = trimmed, "event codec: malformed json, skipping line");
            return None;
        }
    };

    match decode_event(value) {
        Ok(event) => Some(event),
        Err(err) => {
            debug!(error = %err, raw_line = trimmed, "event codec: unsupported event, skipping line");
            None
        }
    }
}

/// Push-style decoder over arbitrary byte chunks.
///
/// Complete lines are decoded as soon as their `\n` arrives; the rest stays
/// buffered until the next [`feed`](Self::feed) or [`finish`](Self::finish).
#[derive(Debug, Default)]
pub struct LineDecoder {
    codec: EventCodec,
    buffer: BytesMut,
}

impl LineDecoder {
    /// Create an empty decoder.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Append `chunk` and return every event completed by it, in order.
    pub fn feed(&mut self, chunk: &[u8]) -> Vec<ThreadEvent> {
        self.buffer.extend_from_slice(chunk);
        let mut events = Vec::new();
        while let Ok(Some(event)) = self.codec.decode(&mut self.buffer) {
            events.push(event);
        }
        events
    }

    /// Bytes received after the last complete line.
    #[must_use]
    pub fn pending(&self) -> &[u8] {
        &self.buffer
    }

    /// Decode whatever remains as a final line (no trailing `\n` required).
    pub fn finish(mut self) -> Vec<ThreadEvent> {
        let mut events = Vec::new();
        while let Ok(Some(event)) = self.codec.decode_eof(&mut self.buffer) {
            events.push(event);
        }
        events
    }
}
