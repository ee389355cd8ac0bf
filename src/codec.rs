//! Server-sent-events framing for the answer stream.
//!
//! Every frame travels as one record: a single `data:` line carrying a JSON
//! object, followed by a blank line. Transport reads can end anywhere, so the
//! decoders here keep the unterminated tail and wait for more bytes.

use bytes::Bytes;
use serde::{Deserialize, Serialize};

const DATA_FIELD: &[u8] = b"data:";
const RECORD_SEPARATOR: &[u8] = b"\n\n";

/// One unit of the answer stream
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct StreamFrame {
    /// Text fragment, empty on the terminal frame
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub text: String,
    /// Set on the single terminal frame of an exchange
    #[serde(default)]
    pub done: bool,
}

impl StreamFrame {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            done: false,
        }
    }

    pub fn done() -> Self {
        Self {
            text: String::new(),
            done: true,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.done
    }
}

/// Encode one frame as a complete SSE record.
pub fn encode(frame: &StreamFrame) -> serde_json::Result<Bytes> {
    let mut record = b"data: ".to_vec();
    serde_json::to_writer(&mut record, frame)?;
    record.extend_from_slice(RECORD_SEPARATOR);
    Ok(Bytes::from(record))
}

/// Decode every complete record in `buffer`.
///
/// Returns the decoded frames and the unconsumed tail, which must be
/// prepended to the next read. Malformed records are logged and skipped.
/// Expects `\n` line endings; use [`FrameDecoder`] for raw transport reads.
pub fn decode(buffer: &[u8]) -> (Vec<StreamFrame>, &[u8]) {
    let (payloads, consumed) = split_records(buffer);
    let frames = payloads
        .iter()
        .filter_map(|payload| parse_frame(payload))
        .collect();
    (frames, &buffer[consumed..])
}

/// Split `buffer` into the `data` payloads of its complete records.
///
/// Returns the payloads and the number of bytes consumed. Records without a
/// `data` field (comments, keep-alives) are consumed but yield nothing.
pub fn split_records(buffer: &[u8]) -> (Vec<Vec<u8>>, usize) {
    split_from(buffer, 0)
}

/// Like [`split_records`], but the first separator search starts at `from`.
/// Bytes before `from` must be known not to start a separator.
fn split_from(buffer: &[u8], from: usize) -> (Vec<Vec<u8>>, usize) {
    let mut payloads = Vec::new();
    let mut consumed = 0;
    let mut search = from.min(buffer.len());

    while let Some(pos) = find_separator(&buffer[search..]) {
        let end = search + pos;
        if let Some(payload) = record_payload(&buffer[consumed..end]) {
            payloads.push(payload);
        }
        consumed = end + RECORD_SEPARATOR.len();
        search = consumed;
    }

    (payloads, consumed)
}

fn find_separator(haystack: &[u8]) -> Option<usize> {
    haystack
        .windows(RECORD_SEPARATOR.len())
        .position(|window| window == RECORD_SEPARATOR)
}

/// Join the `data` lines of one record. Multiple data lines are joined with
/// `\n`; other fields and `:` comments are ignored.
fn record_payload(record: &[u8]) -> Option<Vec<u8>> {
    let mut payload: Option<Vec<u8>> = None;

    for line in record.split(|b| *b == b'\n') {
        let Some(value) = line.strip_prefix(DATA_FIELD) else {
            continue;
        };
        let value = value.strip_prefix(b" ").unwrap_or(value);
        match payload.as_mut() {
            Some(existing) => {
                existing.push(b'\n');
                existing.extend_from_slice(value);
            }
            None => payload = Some(value.to_vec()),
        }
    }

    payload
}

fn parse_frame(payload: &[u8]) -> Option<StreamFrame> {
    match serde_json::from_slice::<StreamFrame>(payload) {
        Ok(frame) => Some(frame),
        Err(e) => {
            tracing::warn!(
                error = %e,
                payload = %String::from_utf8_lossy(payload),
                "Dropping malformed stream frame"
            );
            None
        }
    }
}

/// Incremental SSE record splitter over raw transport chunks.
///
/// Strips carriage returns so `\r\n` framed upstreams split the same way.
#[derive(Debug, Default)]
pub struct SseBuffer {
    buffer: Vec<u8>,
    /// Prefix of `buffer` already searched without finding a separator
    scanned: usize,
}

impl SseBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed a chunk and return the payloads of all records it completes.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<Vec<u8>> {
        self.buffer
            .extend(chunk.iter().copied().filter(|b| *b != b'\r'));

        let (payloads, consumed) = split_from(&self.buffer, self.scanned);
        self.buffer.drain(..consumed);
        // The last byte may be the first half of a separator
        self.scanned = self.buffer.len().saturating_sub(RECORD_SEPARATOR.len() - 1);
        payloads
    }

    /// Flush a trailing record that arrived without its blank line.
    pub fn finish(&mut self) -> Option<Vec<u8>> {
        let rest = std::mem::take(&mut self.buffer);
        self.scanned = 0;
        let trimmed = rest.strip_suffix(b"\n").unwrap_or(&rest);
        record_payload(trimmed)
    }

    /// Bytes waiting for the rest of their record
    pub fn pending(&self) -> usize {
        self.buffer.len()
    }
}

/// Stateful frame decoder owning the unconsumed remainder between reads.
#[derive(Debug, Default)]
pub struct FrameDecoder {
    records: SseBuffer,
    dropped: usize,
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed a transport chunk and return every frame it completes.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<StreamFrame> {
        let payloads = self.records.push(chunk);
        self.parse_all(payloads)
    }

    /// Decode whatever is left once the transport has closed.
    pub fn finish(&mut self) -> Vec<StreamFrame> {
        let payloads = self.records.finish().into_iter().collect();
        self.parse_all(payloads)
    }

    /// Number of malformed records skipped so far
    pub fn dropped(&self) -> usize {
        self.dropped
    }

    pub fn pending(&self) -> usize {
        self.records.pending()
    }

    fn parse_all(&mut self, payloads: Vec<Vec<u8>>) -> Vec<StreamFrame> {
        let mut frames = Vec::with_capacity(payloads.len());
        for payload in payloads {
            match parse_frame(&payload) {
                Some(frame) => frames.push(frame),
                None => self.dropped += 1,
            }
        }
        frames
    }
}
