//! Incremental line splitting for Server-Sent-Events bodies.
//!
//! Network reads arrive at arbitrary byte boundaries. [`SseLineBuffer`] keeps
//! the unterminated tail between reads so that callers only ever see whole
//! lines, and so that multi-byte UTF-8 sequences cut in half by the transport
//! are reassembled before decoding.

use memchr::memchr;
use tracing::{debug, warn};

/// A complete, meaningful line from an SSE body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SseLine {
    /// The payload of a `data:` line, with the prefix and leading spaces removed.
    Data(String),
    /// The `data: [DONE]` terminator.
    Done,
    /// Any other field line (`event:`, `id:`, `retry:`).
    Field(String),
}

#[derive(Debug, Default)]
pub struct SseLineBuffer {
    pending: Vec<u8>,
}

impl SseLineBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a chunk and return every line it completed.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<SseLine> {
        self.pending.extend_from_slice(chunk);

        let mut lines = Vec::new();
        let mut consumed = 0;
        while let Some(offset) = memchr(b'\n', &self.pending[consumed..]) {
            let end = consumed + offset;
            let raw = &self.pending[consumed..end];
            consumed = end + 1;

            match std::str::from_utf8(raw) {
                Ok(text) => {
                    if let Some(line) = classify_line(text) {
                        lines.push(line);
                    }
                }
                Err(e) => warn!("Invalid UTF-8 in stream: {e}"),
            }
        }
        self.pending.drain(..consumed);
        lines
    }

    /// Bytes currently held back waiting for a newline.
    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    /// End of input. An unterminated trailing frame is incomplete and is
    /// dropped; the number of discarded bytes is returned.
    pub fn finish(&mut self) -> usize {
        let dropped = self.pending.len();
        if dropped > 0 {
            debug!(bytes = dropped, "discarding unterminated SSE tail");
        }
        self.pending.clear();
        dropped
    }
}

fn classify_line(raw: &str) -> Option<SseLine> {
    let line = raw.strip_suffix('\r').unwrap_or(raw);
    if line.is_empty() || line.starts_with(':') {
        return None;
    }

    if let Some(payload) = line.strip_prefix("data:") {
        let payload = payload.trim_start();
        if payload.trim_end() == "[DONE]" {
            return Some(SseLine::Done);
        }
        return Some(SseLine::Data(payload.to_string()));
    }

    Some(SseLine::Field(line.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    const STREAM: &str = concat!(
        ": keep-alive\n",
        "data: {\"choices\":[{\"delta\":{\"content\":\"Héllo\"}}]}\n",
        "\n",
        "event: message\n",
        "data:{\"choices\":[{\"delta\":{\"content\":\" wörld ✓\"}}]}\r\n",
        "\r\n",
        "data: [DONE]\n",
        "\n",
    );

    fn collect(chunks: &[&[u8]]) -> Vec<SseLine> {
        let mut buffer = SseLineBuffer::new();
        let mut lines = Vec::new();
        for chunk in chunks {
            lines.extend(buffer.push(chunk));
        }
        buffer.finish();
        lines
    }

    #[test]
    fn classifies_data_done_comments_and_fields() {
        let lines = collect(&[STREAM.as_bytes()]);
        assert_eq!(
            lines,
            vec![
                SseLine::Data(r#"{"choices":[{"delta":{"content":"Héllo"}}]}"#.into()),
                SseLine::Field("event: message".into()),
                SseLine::Data(r#"{"choices":[{"delta":{"content":" wörld ✓"}}]}"#.into()),
                SseLine::Done,
            ]
        );
    }

    #[test]
    fn output_is_independent_of_chunk_boundaries() {
        let bytes = STREAM.as_bytes();
        let expected = collect(&[bytes]);

        for size in 1..=bytes.len() {
            let chunks: Vec<&[u8]> = bytes.chunks(size).collect();
            assert_eq!(collect(&chunks), expected, "chunk size {size}");
        }

        for first in 0..bytes.len() {
            for second in first..bytes.len() {
                let chunks = [&bytes[..first], &bytes[first..second], &bytes[second..]];
                assert_eq!(collect(&chunks), expected, "splits at {first}/{second}");
            }
        }
    }

    #[test]
    fn holds_partial_line_until_newline_arrives() {
        let mut buffer = SseLineBuffer::new();
        assert!(buffer.push(b"data: {\"a\"").is_empty());
        assert_eq!(buffer.pending_len(), 10);
        let lines = buffer.push(b":1}\n");
        assert_eq!(lines, vec![SseLine::Data("{\"a\":1}".into())]);
        assert_eq!(buffer.pending_len(), 0);
    }

    #[test]
    fn finish_discards_unterminated_tail() {
        let mut buffer = SseLineBuffer::new();
        let lines = buffer.push(b"data: first\ndata: second");
        assert_eq!(lines, vec![SseLine::Data("first".into())]);
        assert_eq!(buffer.finish(), "data: second".len());
        assert_eq!(buffer.pending_len(), 0);
    }

    #[test]
    fn invalid_utf8_line_is_skipped() {
        let mut buffer = SseLineBuffer::new();
        let lines = buffer.push(b"data: \xff\xfe\ndata: ok\n");
        assert_eq!(lines, vec![SseLine::Data("ok".into())]);
    }
}
