//! Stream Framer
//!
//! Wire format between the gateway and its worker processes: newline-delimited
//! JSON, one message per line.
//!
//! # Frame Format
//!
//! ```text
//! {"type":"recognition_result","faces":[...]}\n
//! {"type":"response","answer":"..."}\n
//! ```
//!
//! Compact `serde_json` output never contains a raw `\n` (string contents are
//! escaped), so the terminator is unambiguous.
//!
//! # Decoding
//!
//! [`LineDecoder`] accepts byte chunks of any size and alignment and yields
//! complete lines in arrival order; the sequence of lines does not depend on
//! how the stream was chunked. [`FrameDecoder`] parses each line as JSON and
//! turns parse failures into [`Frame::Malformed`] items instead of errors, so
//! one bad line never stops the stream.
//!
//! # Limits
//!
//! A line that grows past the configured maximum before its terminator arrives
//! is discarded up to the next terminator and reported once.

use serde::{de::DeserializeOwned, Serialize};

use crate::error::FrameError;

/// Default maximum line size (10 MB)
pub const MAX_LINE_SIZE: usize = 10 * 1024 * 1024;

/// Minimum buffer capacity for decoder
const MIN_BUFFER_CAPACITY: usize = 4096;

/// Line terminator
const TERMINATOR: u8 = b'\n';

/// Longest raw-line preview carried in a decode error
const PREVIEW_LEN: usize = 256;

/// Encode a message as one JSON line, terminator included
///
/// # Errors
///
/// Returns `FrameError::Serialization` if JSON serialization fails.
pub fn encode<T: Serialize>(msg: &T) -> Result<Vec<u8>, FrameError> {
    let mut buf = serde_json::to_vec(msg)?;
    buf.push(TERMINATOR);
    Ok(buf)
}

/// Splits an arbitrarily chunked byte stream into complete lines
///
/// Holds a single pending buffer: bytes after the last terminator seen.
#[derive(Debug)]
pub struct LineDecoder {
    buffer: Vec<u8>,
    /// Start of the pending (not yet emitted) bytes
    read_pos: usize,
    /// Everything before this index has been scanned for a terminator
    scan_pos: usize,
    max_line: usize,
    /// Dropping an oversized line until its terminator shows up
    discarding: bool,
}

impl Default for LineDecoder {
    fn default() -> Self {
        Self::new()
    }
}

impl LineDecoder {
    /// Create a decoder with the default line limit
    #[must_use]
    pub fn new() -> Self {
        Self::with_max_line(MAX_LINE_SIZE)
    }

    /// Create a decoder with a custom line limit
    #[must_use]
    pub fn with_max_line(max_line: usize) -> Self {
        Self {
            buffer: Vec::with_capacity(MIN_BUFFER_CAPACITY),
            read_pos: 0,
            scan_pos: 0,
            max_line,
            discarding: false,
        }
    }

    /// Append a chunk of bytes
    pub fn push(&mut self, data: &[u8]) {
        // Compact buffer if we've consumed a lot
        if self.read_pos > self.buffer.len() / 2 && self.read_pos > MIN_BUFFER_CAPACITY {
            self.buffer.drain(..self.read_pos);
            self.scan_pos -= self.read_pos;
            self.read_pos = 0;
        }
        self.buffer.extend_from_slice(data);
    }

    /// Number of pending bytes not yet emitted as a line
    #[must_use]
    pub fn pending(&self) -> usize {
        self.buffer.len() - self.read_pos
    }

    /// Take the next complete line
    ///
    /// Returns:
    /// - `Some(Ok(line))` for a complete, non-empty line (terminator stripped)
    /// - `Some(Err(FrameError::LineTooLong))` once per oversized line
    /// - `Some(Err(FrameError::InvalidUtf8))` for a line that is not UTF-8
    /// - `None` if more data is needed
    pub fn next_line(&mut self) -> Option<Result<String, FrameError>> {
        loop {
            let Some(offset) = self.buffer[self.scan_pos..]
                .iter()
                .position(|&b| b == TERMINATOR)
            else {
                return self.check_pending_limit();
            };

            let start = self.read_pos;
            let end = self.scan_pos + offset;
            self.read_pos = end + 1;
            self.scan_pos = self.read_pos;

            if self.discarding {
                self.discarding = false;
                continue;
            }

            let len = end - start;
            if len > self.max_line {
                return Some(Err(FrameError::LineTooLong {
                    len,
                    max: self.max_line,
                }));
            }

            if let Some(line) = line_text(&self.buffer[start..end]) {
                return Some(line);
            }
            // Empty lines carry no message
        }
    }

    /// Flush the pending partial line at end of stream
    ///
    /// A final line without a terminator is still a line.
    pub fn finish(&mut self) -> Option<Result<String, FrameError>> {
        let remainder = if self.discarding {
            None
        } else {
            line_text(&self.buffer[self.read_pos..])
        };
        self.clear();
        remainder
    }

    /// Clear the buffer
    pub fn clear(&mut self) {
        self.buffer.clear();
        self.read_pos = 0;
        self.scan_pos = 0;
        self.discarding = false;
    }

    fn check_pending_limit(&mut self) -> Option<Result<String, FrameError>> {
        self.scan_pos = self.buffer.len();
        let pending = self.pending();

        if self.discarding {
            self.buffer.clear();
            self.read_pos = 0;
            self.scan_pos = 0;
            return None;
        }

        if pending > self.max_line {
            self.buffer.clear();
            self.read_pos = 0;
            self.scan_pos = 0;
            self.discarding = true;
            return Some(Err(FrameError::LineTooLong {
                len: pending,
                max: self.max_line,
            }));
        }

        None
    }
}

/// Convert raw line bytes to text, `None` for blank lines
fn line_text(bytes: &[u8]) -> Option<Result<String, FrameError>> {
    match std::str::from_utf8(bytes) {
        Ok(text) => {
            let trimmed = text.trim();
            (!trimmed.is_empty()).then(|| Ok(trimmed.to_string()))
        }
        Err(source) => Some(Err(FrameError::InvalidUtf8 {
            line: preview(String::from_utf8_lossy(bytes).trim()),
            source,
        })),
    }
}

/// One decoded line
#[derive(Debug, Clone, PartialEq)]
pub enum Frame<T> {
    /// The line parsed as a message
    Message(T),
    /// The line did not parse; processing continues with the next line
    Malformed {
        /// Raw line (truncated preview)
        line: String,
        /// Parse error description
        error: String,
    },
}

/// Decoder state machine turning a byte stream into parsed messages
#[derive(Debug, Default)]
pub struct FrameDecoder {
    lines: LineDecoder,
}

impl FrameDecoder {
    /// Create a decoder with the default line limit
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a decoder with a custom line limit
    #[must_use]
    pub fn with_max_line(max_line: usize) -> Self {
        Self {
            lines: LineDecoder::with_max_line(max_line),
        }
    }

    /// Append bytes to the buffer
    pub fn push(&mut self, data: &[u8]) {
        self.lines.push(data);
    }

    /// Try to decode the next message
    ///
    /// Returns `None` when more data is needed.
    pub fn next_frame<T: DeserializeOwned>(&mut self) -> Option<Frame<T>> {
        self.lines.next_line().map(parse_line)
    }

    /// Decode whatever partial line remains at end of stream
    pub fn finish<T: DeserializeOwned>(&mut self) -> Option<Frame<T>> {
        self.lines.finish().map(parse_line)
    }
}

fn parse_line<T: DeserializeOwned>(line: Result<String, FrameError>) -> Frame<T> {
    match line {
        Ok(line) => match serde_json::from_str(&line) {
            Ok(msg) => Frame::Message(msg),
            Err(e) => Frame::Malformed {
                line: preview(&line),
                error: e.to_string(),
            },
        },
        Err(FrameError::InvalidUtf8 { line, source }) => Frame::Malformed {
            line,
            error: source.to_string(),
        },
        Err(e) => Frame::Malformed {
            line: String::new(),
            error: e.to_string(),
        },
    }
}

/// Truncate a raw line for logging
#[must_use]
pub fn preview(line: &str) -> String {
    match line.char_indices().nth(PREVIEW_LEN) {
        Some((idx, _)) => format!("{}...", &line[..idx]),
        None => line.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use proptest::prelude::*;
    use serde::{Deserialize, Serialize};

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct TestMessage {
        content: String,
        number: u32,
    }

    fn drain_lines(decoder: &mut LineDecoder) -> Vec<String> {
        let mut out = Vec::new();
        while let Some(line) = decoder.next_line() {
            out.push(line.unwrap());
        }
        out
    }

    #[test]
    fn test_encode_appends_terminator() {
        let msg = TestMessage {
            content: "multi\nline".to_string(),
            number: 7,
        };
        let encoded = encode(&msg).unwrap();
        assert_eq!(encoded.last(), Some(&b'\n'));
        // Only the terminator is a raw newline
        assert_eq!(encoded.iter().filter(|&&b| b == b'\n').count(), 1);
    }

    #[test]
    fn test_partial_line_stays_pending() {
        let mut decoder = LineDecoder::new();
        decoder.push(b"{\"a\":");
        assert!(decoder.next_line().is_none());
        assert_eq!(decoder.pending(), 5);

        decoder.push(b"1}\n{\"b\"");
        assert_eq!(drain_lines(&mut decoder), vec!["{\"a\":1}".to_string()]);
        assert_eq!(decoder.pending(), 4);
    }

    #[test]
    fn test_multiple_lines_in_one_chunk() {
        let mut decoder = LineDecoder::new();
        decoder.push(b"one\ntwo\nthree\n");
        assert_eq!(drain_lines(&mut decoder), vec!["one", "two", "three"]);
        assert_eq!(decoder.pending(), 0);
    }

    #[test]
    fn test_empty_lines_are_filtered() {
        let mut decoder = LineDecoder::new();
        decoder.push(b"\n\nfirst\n   \n\r\nsecond\n\n");
        assert_eq!(drain_lines(&mut decoder), vec!["first", "second"]);
    }

    #[test]
    fn test_crlf_terminator_is_stripped() {
        let mut decoder = LineDecoder::new();
        decoder.push(b"{\"x\":1}\r\n");
        assert_eq!(drain_lines(&mut decoder), vec!["{\"x\":1}"]);
    }

    #[test]
    fn test_finish_flushes_unterminated_line() {
        let mut decoder = LineDecoder::new();
        decoder.push(b"done\nlast");
        assert_eq!(drain_lines(&mut decoder), vec!["done"]);
        assert_eq!(decoder.finish().unwrap().unwrap(), "last");
        assert!(decoder.finish().is_none());
    }

    #[test]
    fn test_oversized_line_reported_once_then_recovers() {
        let mut decoder = LineDecoder::with_max_line(8);
        decoder.push(b"0123456789");
        assert!(matches!(
            decoder.next_line(),
            Some(Err(FrameError::LineTooLong { max: 8, .. }))
        ));
        decoder.push(b"abcdef");
        assert!(decoder.next_line().is_none());
        decoder.push(b"ghi\nok\n");
        assert_eq!(drain_lines(&mut decoder), vec!["ok"]);
    }

    #[test]
    fn test_oversized_complete_line_is_reported() {
        let mut decoder = LineDecoder::with_max_line(4);
        decoder.push(b"toolong\nfine\n");
        assert!(matches!(
            decoder.next_line(),
            Some(Err(FrameError::LineTooLong { len: 7, max: 4 }))
        ));
        assert_eq!(drain_lines(&mut decoder), vec!["fine"]);
    }

    #[test]
    fn test_buffer_compaction_keeps_order() {
        let mut decoder = LineDecoder::new();
        let mut expected = Vec::new();
        let mut seen = Vec::new();
        for i in 0..2000 {
            let line = format!("line-{i:05}");
            decoder.push(line.as_bytes());
            decoder.push(b"\n");
            expected.push(line);
            if i % 3 == 0 {
                seen.extend(drain_lines(&mut decoder));
            }
        }
        seen.extend(drain_lines(&mut decoder));
        assert_eq!(seen, expected);
    }

    #[test]
    fn test_malformed_line_between_valid_messages() {
        let first = TestMessage {
            content: "first".to_string(),
            number: 1,
        };
        let second = TestMessage {
            content: "second".to_string(),
            number: 2,
        };

        let mut stream = encode(&first).unwrap();
        stream.extend_from_slice(b"2024-01-01 INFO worker ready\n");
        stream.extend(encode(&second).unwrap());

        let mut decoder = FrameDecoder::new();
        decoder.push(&stream);

        assert_eq!(decoder.next_frame(), Some(Frame::Message(first)));
        assert!(matches!(
            decoder.next_frame::<TestMessage>(),
            Some(Frame::Malformed { ref line, .. }) if line == "2024-01-01 INFO worker ready"
        ));
        assert_eq!(decoder.next_frame(), Some(Frame::Message(second)));
        assert_eq!(decoder.next_frame::<TestMessage>(), None);
    }

    #[test]
    fn test_invalid_utf8_line_is_malformed() {
        let mut decoder = FrameDecoder::new();
        decoder.push(b"{\"type\":\"response\",\"answer\":\"caf\xe9\"}\n");
        decoder.push(b"{\"type\":\"response\",\"answer\":\"ok\"}\n");

        match decoder.next_frame::<serde_json::Value>() {
            Some(Frame::Malformed { line, error }) => {
                assert!(line.starts_with("{\"type\":\"response\""));
                assert!(line.contains('\u{FFFD}'));
                assert!(error.contains("utf-8"));
            }
            other => panic!("expected a malformed frame, got {other:?}"),
        }
        assert_eq!(
            decoder.next_frame::<serde_json::Value>(),
            Some(Frame::Message(
                serde_json::json!({"type": "response", "answer": "ok"})
            ))
        );
    }

    #[test]
    fn test_invalid_utf8_tail_at_end_of_stream() {
        let mut lines = LineDecoder::new();
        lines.push(b"\xff\xfe");
        assert!(lines.next_line().is_none());
        assert!(matches!(
            lines.finish(),
            Some(Err(FrameError::InvalidUtf8 { .. }))
        ));
    }

    #[test]
    fn test_preview_truncates_long_lines() {
        let long = "x".repeat(1000);
        let shown = preview(&long);
        assert_eq!(shown.len(), PREVIEW_LEN + 3);
        assert!(shown.ends_with("..."));
        assert_eq!(preview("short"), "short");
    }

    fn message_strategy() -> impl Strategy<Value = TestMessage> {
        (any::<String>(), any::<u32>()).prop_map(|(content, number)| TestMessage { content, number })
    }

    proptest! {
        /// Property: decoding is independent of how the stream was chunked.
        #[test]
        fn prop_chunk_invariance(
            messages in prop::collection::vec(message_strategy(), 0..20),
            cuts in prop::collection::vec(any::<prop::sample::Index>(), 0..32),
        ) {
            let mut stream = Vec::new();
            for msg in &messages {
                stream.extend(encode(msg).unwrap());
            }

            let mut boundaries: Vec<usize> = cuts.iter().map(|c| c.index(stream.len() + 1)).collect();
            boundaries.push(0);
            boundaries.push(stream.len());
            boundaries.sort_unstable();
            boundaries.dedup();

            let mut decoder = FrameDecoder::new();
            let mut decoded = Vec::new();
            for window in boundaries.windows(2) {
                decoder.push(&stream[window[0]..window[1]]);
                while let Some(frame) = decoder.next_frame::<TestMessage>() {
                    match frame {
                        Frame::Message(msg) => decoded.push(msg),
                        Frame::Malformed { line, error } => {
                            prop_assert!(false, "unexpected malformed line {line}: {error}");
                        }
                    }
                }
            }

            prop_assert_eq!(decoded, messages);
        }
    }
}
