//! Server-Sent-Events primitives shared by the transformer chain and the
//! proxy forwarder.
//!
//! Piping raw provider bytes straight into an Axum body stream without
//! parsing individual events is enough for a pure pass-through, but the
//! four-pass streaming contract requires per-event dialect transformation,
//! so this module exposes a real `SseEvent` type and a line-oriented
//! parser/encoder around the same byte-stream-in/byte-stream-out shape.

use bytes::Bytes;
use futures::stream::BoxStream;

/// One parsed SSE event. `event` is the `event:` field if present;
/// `data` is the concatenation of all `data:` lines, newline-joined, with
/// the trailing blank-line terminator stripped.
#[derive(Debug, Clone)]
pub struct SseEvent {
    pub event: Option<String>,
    pub data: String,
}

impl SseEvent {
    pub fn new(event: impl Into<String>, data: impl Into<String>) -> Self {
        SseEvent {
            event: Some(event.into()),
            data: data.into(),
        }
    }

    pub fn data_only(data: impl Into<String>) -> Self {
        SseEvent {
            event: None,
            data: data.into(),
        }
    }

    /// Parses the event's `data` field as JSON, if it looks like JSON at all
    /// (providers occasionally emit a bare `[DONE]` sentinel, which is not).
    pub fn json(&self) -> Option<serde_json::Value> {
        serde_json::from_str(&self.data).ok()
    }

    pub fn is_done_sentinel(&self) -> bool {
        self.data.trim() == "[DONE]"
    }

    pub fn encode(&self) -> Bytes {
        let mut out = String::new();
        if let Some(event) = &self.event {
            out.push_str("event: ");
            out.push_str(event);
            out.push('\n');
        }
        for line in self.data.split('\n') {
            out.push_str("data: ");
            out.push_str(line);
            out.push('\n');
        }
        out.push('\n');
        Bytes::from(out)
    }
}

/// Incremental line-buffered SSE parser. Fed raw byte chunks as they arrive
/// off the wire; yields zero or more complete events per chunk without
/// waiting for the whole stream.
#[derive(Debug, Default)]
pub struct SseDecoder {
    buf: String,
    pending_event: Option<String>,
    pending_data: Vec<String>,
}

impl SseDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn feed(&mut self, chunk: &[u8]) -> Vec<SseEvent> {
        self.buf.push_str(&String::from_utf8_lossy(chunk));
        let mut events = Vec::new();

        while let Some(pos) = self.buf.find('\n') {
            let line = self.buf[..pos].trim_end_matches('\r').to_string();
            self.buf.drain(..=pos);

            if line.is_empty() {
                if let Some(event) = self.flush_pending() {
                    events.push(event);
                }
                continue;
            }

            if let Some(rest) = line.strip_prefix("event:") {
                self.pending_event = Some(rest.trim_start().to_string());
            } else if let Some(rest) = line.strip_prefix("data:") {
                self.pending_data.push(rest.trim_start().to_string());
            }
            // Other SSE fields (`id:`, `retry:`, comments starting `:`) are
            // not part of this chain's contract and are dropped.
        }

        events
    }

    fn flush_pending(&mut self) -> Option<SseEvent> {
        if self.pending_data.is_empty() && self.pending_event.is_none() {
            return None;
        }
        let event = self.pending_event.take();
        let data = self.pending_data.join("\n");
        self.pending_data.clear();
        Some(SseEvent { event, data })
    }
}

pub type EventStream = BoxStream<'static, SseEvent>;
