//! Server-sent event framing for the streaming relay.
//!
//! Upstreams split events across network chunks at arbitrary byte offsets.
//! [`SseFramer`] re-frames the byte stream so that every relayed chunk is one
//! complete event, which lets the relay inspect `data:` payloads for content,
//! usage and the `[DONE]` marker.

use bytes::{Bytes, BytesMut};

pub const DONE_MARKER: &str = "[DONE]";

#[derive(Debug, Default)]
pub struct SseFramer {
    buf: BytesMut,
}

impl SseFramer {
    /// Appends `chunk` and returns every event completed by it, delimiter included.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<Bytes> {
        self.buf.extend_from_slice(chunk);
        let mut out = Vec::new();
        while let Some(end) = event_end(&self.buf) {
            out.push(self.buf.split_to(end).freeze());
        }
        out
    }

    /// Whatever is left once the upstream closed. May be an incomplete event.
    pub fn finish(&mut self) -> Option<Bytes> {
        if self.buf.iter().all(u8::is_ascii_whitespace) {
            self.buf.clear();
            return None;
        }
        Some(self.buf.split().freeze())
    }
}

/// Index just past the first blank-line delimiter (`\n\n` or `\r\n\r\n`).
fn event_end(buf: &[u8]) -> Option<usize> {
    let lf = buf.windows(2).position(|w| w == b"\n\n").map(|p| p + 2);
    let crlf = buf.windows(4).position(|w| w == b"\r\n\r\n").map(|p| p + 4);
    match (lf, crlf) {
        (Some(a), Some(b)) => Some(a.min(b)),
        (a, b) => a.or(b),
    }
}

/// Payloads of the `data:` lines of one event.
pub fn data_lines(event: &[u8]) -> Vec<&str> {
    let Ok(text) = std::str::from_utf8(event) else {
        return Vec::new();
    };
    text.lines()
        .filter_map(|line| line.strip_prefix("data:"))
        .map(str::trim)
        .filter(|d| !d.is_empty())
        .collect()
}

/// Terminal `event: error` carrying the standard error envelope.
pub fn error_event(envelope: &serde_json::Value) -> Bytes {
    Bytes::from(format!("event: error\ndata: {envelope}\n\n"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn split_event_is_reassembled() {
        let mut f = SseFramer::default();
        assert!(f.push(b"data: {\"a\":").is_empty());
        let events = f.push(b"1}\n\ndata: [DONE]\n\n");
        assert_eq!(events.len(), 2);
        assert_eq!(&events[0][..], b"data: {\"a\":1}\n\n");
        assert_eq!(data_lines(&events[1]), vec![DONE_MARKER]);
        assert_eq!(f.finish(), None);
    }

    #[test]
    fn crlf_delimiters() {
        let mut f = SseFramer::default();
        let events = f.push(b"data: x\r\n\r\ndata: y\r\n\r\n");
        assert_eq!(events.len(), 2);
        assert_eq!(data_lines(&events[1]), vec!["y"]);
    }

    #[test]
    fn trailing_partial_is_flushed() {
        let mut f = SseFramer::default();
        assert!(f.push(b"data: partial").is_empty());
        assert_eq!(f.finish().as_deref(), Some(&b"data: partial"[..]));
    }

    #[test]
    fn error_event_format() {
        let ev = error_event(&serde_json::json!({"error": {"code": 502}}));
        assert!(ev.starts_with(b"event: error\ndata: "));
        assert!(ev.ends_with(b"\n\n"));
    }
}
