//! Byte-level relay of a provider's event stream to a downstream client.
//!
//! Chunks are forwarded exactly as received. A side decoder reassembles the
//! line-oriented `event:`/`data:` framing so the final answer and upstream ids
//! can be persisted once the stream ends cleanly.

use axum::body::Body;
use axum::http::{HeaderValue, header};
use axum::response::Response;
use bytes::Bytes;
use futures_util::{Stream, StreamExt};
use serde::Deserialize;
use serde_json::{Value, json};
use std::convert::Infallible;
use tokio::sync::mpsc;

pub const RELAY_CHANNEL_CAPACITY: usize = 64;

pub type DownstreamSender = mpsc::Sender<Result<Bytes, Infallible>>;
pub type DownstreamReceiver = mpsc::Receiver<Result<Bytes, Infallible>>;

#[derive(Debug, thiserror::Error)]
pub enum RelayError {
    #[error("malformed event payload: {0}")]
    MalformedEvent(String),
    #[error("upstream stream failed: {0}")]
    Transport(String),
}

/// One `event:`/`data:` block terminated by a blank line.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SseFrame {
    pub event: Option<String>,
    pub data: String,
}

/// Incremental SSE line decoder.
///
/// Bytes are buffered until a full line is available, so a line (or a multi-byte
/// character) split across network chunks is decoded exactly once.
#[derive(Debug, Default)]
pub struct SseDecoder {
    buffer: Vec<u8>,
    event: Option<String>,
    data_lines: Vec<String>,
}

impl SseDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, chunk: &[u8]) -> Vec<SseFrame> {
        self.buffer.extend_from_slice(chunk);
        let mut frames = Vec::new();

        while let Some(pos) = self.buffer.iter().position(|b| *b == b'\n') {
            let raw: Vec<u8> = self.buffer.drain(..=pos).collect();
            let mut line = String::from_utf8_lossy(&raw[..raw.len() - 1]).into_owned();
            if line.ends_with('\r') {
                line.pop();
            }
            self.handle_line(&line, &mut frames);
        }

        frames
    }

    /// Flushes a trailing unterminated line and any pending frame.
    pub fn finish(&mut self) -> Vec<SseFrame> {
        let mut frames = Vec::new();
        if !self.buffer.is_empty() {
            let raw = std::mem::take(&mut self.buffer);
            let mut line = String::from_utf8_lossy(&raw).into_owned();
            if line.ends_with('\r') {
                line.pop();
            }
            self.handle_line(&line, &mut frames);
        }
        self.finish_frame(&mut frames);
        frames
    }

    fn handle_line(&mut self, line: &str, frames: &mut Vec<SseFrame>) {
        if line.is_empty() {
            self.finish_frame(frames);
            return;
        }
        if line.starts_with(':') {
            return;
        }
        if let Some(value) = line.strip_prefix("event:") {
            let value = value.trim_start();
            self.event = (!value.is_empty()).then(|| value.to_string());
            return;
        }
        if let Some(value) = line.strip_prefix("data:") {
            self.data_lines.push(value.strip_prefix(' ').unwrap_or(value).to_string());
            return;
        }
        if line == "data" {
            self.data_lines.push(String::new());
        }
    }

    fn finish_frame(&mut self, frames: &mut Vec<SseFrame>) {
        if self.event.is_none() && self.data_lines.is_empty() {
            return;
        }
        frames.push(SseFrame {
            event: self.event.take(),
            data: self.data_lines.join("\n"),
        });
        self.data_lines.clear();
    }
}

/// The provider events the relay consumes. Anything else decodes to `Unknown`.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum UpstreamEvent {
    #[serde(alias = "agent_message")]
    Message {
        #[serde(default)]
        answer: String,
        #[serde(default)]
        conversation_id: Option<String>,
        #[serde(default)]
        message_id: Option<String>,
    },
    MessageEnd {
        #[serde(default)]
        conversation_id: Option<String>,
        #[serde(default)]
        message_id: Option<String>,
        #[serde(default)]
        metadata: Option<Value>,
    },
    Error {
        #[serde(default)]
        message: Option<String>,
        #[serde(default)]
        code: Option<String>,
    },
    #[serde(other)]
    Unknown,
}

/// Decodes one frame. `Ok(None)` for frames that carry no payload.
///
/// The event name comes from the JSON `event` field; the SSE `event:` line fills
/// it in when the payload omits it.
pub fn decode_frame(frame: &SseFrame) -> Result<Option<UpstreamEvent>, RelayError> {
    let data = frame.data.trim();
    if data.is_empty() || data == "[DONE]" {
        return Ok(None);
    }
    let mut value: Value =
        serde_json::from_str(data).map_err(|e| RelayError::MalformedEvent(e.to_string()))?;
    if let (Some(obj), Some(name)) = (value.as_object_mut(), frame.event.as_ref()) {
        obj.entry("event")
            .or_insert_with(|| Value::String(name.clone()));
    }
    if value.get("event").is_none() {
        return Err(RelayError::MalformedEvent("missing event name".to_string()));
    }
    serde_json::from_value(value)
        .map(Some)
        .map_err(|e| RelayError::MalformedEvent(e.to_string()))
}

/// Answer text and first-seen upstream identifiers collected from a stream.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StreamAccumulator {
    pub answer: String,
    pub conversation_id: Option<String>,
    pub message_id: Option<String>,
    pub metadata: Option<Value>,
}

impl StreamAccumulator {
    pub fn apply(&mut self, event: &UpstreamEvent) {
        match event {
            UpstreamEvent::Message {
                answer,
                conversation_id,
                message_id,
            } => {
                self.answer.push_str(answer);
                self.note_ids(conversation_id, message_id);
            }
            UpstreamEvent::MessageEnd {
                conversation_id,
                message_id,
                metadata,
            } => {
                self.note_ids(conversation_id, message_id);
                if metadata.is_some() {
                    self.metadata = metadata.clone();
                }
            }
            UpstreamEvent::Error { .. } | UpstreamEvent::Unknown => {}
        }
    }

    fn note_ids(&mut self, conversation_id: &Option<String>, message_id: &Option<String>) {
        if self.conversation_id.is_none() {
            self.conversation_id = conversation_id.clone().filter(|s| !s.is_empty());
        }
        if self.message_id.is_none() {
            self.message_id = message_id.clone().filter(|s| !s.is_empty());
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamState {
    Open,
    Errored,
    Closed,
}

/// How a relayed stream ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamEnd {
    Completed,
    Errored(String),
    /// The downstream client went away; upstream reading stopped early.
    Cancelled,
}

#[derive(Debug, Clone)]
pub struct RelayOutcome {
    pub end: StreamEnd,
    pub accumulator: StreamAccumulator,
    pub chunks: u64,
    pub bytes: u64,
}

impl RelayOutcome {
    pub fn completed(&self) -> bool {
        self.end == StreamEnd::Completed
    }
}

/// `data: {"event": "error", "message": ...}` followed by a blank line.
pub fn error_event_bytes(message: &str) -> Bytes {
    let payload = json!({ "event": "error", "message": message });
    Bytes::from(format!("data: {payload}\n\n"))
}

/// Pipes `upstream` into `tx` chunk by chunk until the stream ends, fails, or
/// the receiver is dropped.
///
/// A transport failure writes one terminal error event downstream. An `error`
/// event sent by the provider is forwarded like any other bytes and marks the
/// stream as errored.
pub async fn relay_stream<S, E>(mut upstream: S, tx: &DownstreamSender) -> RelayOutcome
where
    S: Stream<Item = Result<Bytes, E>> + Unpin,
    E: std::fmt::Display,
{
    let mut decoder = SseDecoder::new();
    let mut accumulator = StreamAccumulator::default();
    let mut state = StreamState::Open;
    let mut provider_error: Option<String> = None;
    let mut chunks = 0u64;
    let mut bytes = 0u64;

    let end = loop {
        let next = tokio::select! {
            biased;
            _ = tx.closed() => break StreamEnd::Cancelled,
            next = upstream.next() => next,
        };

        match next {
            Some(Ok(chunk)) => {
                chunks += 1;
                bytes += chunk.len() as u64;
                let frames = decoder.push(&chunk);
                if tx.send(Ok(chunk)).await.is_err() {
                    break StreamEnd::Cancelled;
                }
                metrics::counter!("botrelay_relay_chunks_total").increment(1);
                for frame in frames {
                    consume_frame(&frame, &mut accumulator, &mut state, &mut provider_error);
                }
            }
            Some(Err(err)) => {
                let message = RelayError::Transport(err.to_string()).to_string();
                tracing::warn!(error = %message, "upstream stream failed mid-relay");
                state = StreamState::Errored;
                let _ = tx.send(Ok(error_event_bytes(&message))).await;
                break StreamEnd::Errored(message);
            }
            None => {
                for frame in decoder.finish() {
                    consume_frame(&frame, &mut accumulator, &mut state, &mut provider_error);
                }
                break match provider_error.take() {
                    Some(message) => StreamEnd::Errored(message),
                    None => StreamEnd::Completed,
                };
            }
        }
    };

    tracing::debug!(?state, ?end, chunks, bytes, "relay finished");
    let outcome_label = match &end {
        StreamEnd::Completed => "completed",
        StreamEnd::Errored(_) => "errored",
        StreamEnd::Cancelled => "cancelled",
    };
    metrics::counter!("botrelay_relay_streams_total", "outcome" => outcome_label).increment(1);

    RelayOutcome {
        end,
        accumulator,
        chunks,
        bytes,
    }
}

fn consume_frame(
    frame: &SseFrame,
    accumulator: &mut StreamAccumulator,
    state: &mut StreamState,
    provider_error: &mut Option<String>,
) {
    match decode_frame(frame) {
        Ok(Some(event)) => {
            if let UpstreamEvent::Error { message, code } = &event {
                let message = message
                    .clone()
                    .or_else(|| code.clone())
                    .unwrap_or_else(|| "upstream error".to_string());
                tracing::warn!(error = %message, "provider reported a stream error");
                *state = StreamState::Errored;
                provider_error.get_or_insert(message);
            }
            accumulator.apply(&event);
        }
        Ok(None) => {}
        Err(err) => {
            tracing::warn!(error = %err, event = ?frame.event, "skipping malformed stream event");
        }
    }
}

/// A response whose body drains `rx`, with the event-stream headers set.
pub fn sse_response(rx: DownstreamReceiver) -> Response {
    let body = Body::from_stream(tokio_stream::wrappers::ReceiverStream::new(rx));
    let mut response = Response::new(body);
    let headers = response.headers_mut();
    headers.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("text/event-stream"),
    );
    headers.insert(header::CACHE_CONTROL, HeaderValue::from_static("no-cache"));
    headers.insert(header::CONNECTION, HeaderValue::from_static("keep-alive"));
    response
}

/// A complete event-stream response holding a single error event.
pub fn sse_error_response(message: &str) -> Response {
    let (tx, rx) = mpsc::channel(1);
    let _ = tx.try_send(Ok(error_event_bytes(message)));
    sse_response(rx)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    const STREAM: &str = concat!(
        "data: {\"event\": \"message\", \"answer\": \"Hel\", \"conversation_id\": \"up1\", \"message_id\": \"m1\"}\n\n",
        ": keep-alive\n\n",
        "data: {\"event\": \"message\", \"answer\": \"lo, w\u{f6}rld \u{1f30d}\", \"conversation_id\": \"up1\", \"message_id\": \"m1\"}\n\n",
        "event: ping\n\n",
        "data: {\"event\": \"message_end\", \"conversation_id\": \"up1\", \"message_id\": \"m1\", \"metadata\": {\"usage\": {\"total_tokens\": 7}}}\n\n",
    );

    fn chunked(input: &[u8], size: usize) -> Vec<Bytes> {
        input
            .chunks(size)
            .map(Bytes::copy_from_slice)
            .collect()
    }

    async fn run(chunks: Vec<Result<Bytes, String>>) -> (RelayOutcome, Vec<u8>) {
        let (tx, mut rx): (DownstreamSender, DownstreamReceiver) =
            mpsc::channel(RELAY_CHANNEL_CAPACITY);
        let collector = tokio::spawn(async move {
            let mut out = Vec::new();
            while let Some(Ok(chunk)) = rx.recv().await {
                out.extend_from_slice(&chunk);
            }
            out
        });
        let outcome = relay_stream(futures_util::stream::iter(chunks), &tx).await;
        drop(tx);
        (outcome, collector.await.unwrap())
    }

    fn ok_chunks(chunks: Vec<Bytes>) -> Vec<Result<Bytes, String>> {
        chunks.into_iter().map(Ok).collect()
    }

    #[tokio::test]
    async fn accumulated_answer_is_independent_of_chunk_boundaries() {
        let (whole, whole_bytes) = run(ok_chunks(vec![Bytes::from_static(STREAM.as_bytes())])).await;
        assert!(whole.completed());
        assert_eq!(whole.accumulator.answer, "Hello, w\u{f6}rld \u{1f30d}");
        assert_eq!(whole.accumulator.conversation_id.as_deref(), Some("up1"));
        assert_eq!(whole.accumulator.message_id.as_deref(), Some("m1"));
        assert_eq!(whole_bytes, STREAM.as_bytes());

        for size in [1, 2, 3, 5, 7, 13, 64] {
            let (split, forwarded) = run(ok_chunks(chunked(STREAM.as_bytes(), size))).await;
            assert!(split.completed(), "chunk size {size}");
            assert_eq!(split.accumulator, whole.accumulator, "chunk size {size}");
            assert_eq!(forwarded, STREAM.as_bytes(), "chunk size {size}");
        }
    }

    #[tokio::test]
    async fn malformed_events_are_skipped() {
        let input = concat!(
            "data: {\"event\": \"message\", \"answer\": \"a\"}\n\n",
            "data: {not json\n\n",
            "data: {\"answer\": \"no event name\"}\n\n",
            "data: {\"event\": \"workflow_started\", \"data\": {}}\n\n",
            "data: {\"event\": \"message\", \"answer\": \"b\"}\n\n",
        );
        let (outcome, forwarded) = run(ok_chunks(vec![Bytes::from_static(input.as_bytes())])).await;
        assert!(outcome.completed());
        assert_eq!(outcome.accumulator.answer, "ab");
        assert_eq!(forwarded, input.as_bytes());
    }

    #[tokio::test]
    async fn event_line_names_payload_without_event_field() {
        let input = "event: message\ndata: {\"answer\": \"hi\"}\n\n";
        let (outcome, _) = run(ok_chunks(vec![Bytes::from_static(input.as_bytes())])).await;
        assert_eq!(outcome.accumulator.answer, "hi");
    }

    #[tokio::test]
    async fn trailing_frame_without_blank_line_is_flushed() {
        let input = "data: {\"event\": \"message\", \"answer\": \"tail\"}";
        let (outcome, _) = run(ok_chunks(vec![Bytes::from_static(input.as_bytes())])).await;
        assert!(outcome.completed());
        assert_eq!(outcome.accumulator.answer, "tail");
    }

    #[tokio::test]
    async fn transport_failure_appends_one_error_event() {
        let first = "data: {\"event\": \"message\", \"answer\": \"par\"}\n\n";
        let chunks = vec![
            Ok(Bytes::from_static(first.as_bytes())),
            Err("connection reset".to_string()),
            Ok(Bytes::from_static(b"data: {\"event\": \"message\", \"answer\": \"never\"}\n\n")),
        ];
        let (outcome, forwarded) = run(chunks).await;
        assert!(matches!(outcome.end, StreamEnd::Errored(ref m) if m.contains("connection reset")));
        assert_eq!(outcome.accumulator.answer, "par");

        let text = String::from_utf8(forwarded).unwrap();
        assert!(text.starts_with(first));
        let tail = &text[first.len()..];
        assert_eq!(tail.matches("\"event\":\"error\"").count(), 1);
        assert!(tail.ends_with("\n\n"));
        assert!(!text.contains("never"));
    }

    #[tokio::test]
    async fn provider_error_event_marks_stream_errored() {
        let input = concat!(
            "data: {\"event\": \"message\", \"answer\": \"x\"}\n\n",
            "data: {\"event\": \"error\", \"status\": 400, \"code\": \"invalid_param\", \"message\": \"bad\"}\n\n",
        );
        let (outcome, forwarded) = run(ok_chunks(vec![Bytes::from_static(input.as_bytes())])).await;
        assert_eq!(outcome.end, StreamEnd::Errored("bad".to_string()));
        assert_eq!(forwarded, input.as_bytes());
    }

    #[tokio::test]
    async fn dropped_receiver_stops_upstream_reads() {
        let pulled = Arc::new(AtomicUsize::new(0));
        let counter = pulled.clone();
        let upstream = futures_util::stream::iter(0..1000).map(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok::<_, String>(Bytes::from_static(b"data: {\"event\": \"message\", \"answer\": \"z\"}\n\n"))
        });

        let (tx, mut rx) = mpsc::channel(1);
        let reader = tokio::spawn(async move {
            let _ = rx.recv().await;
            drop(rx);
        });
        let outcome = relay_stream(Box::pin(upstream), &tx).await;
        reader.await.unwrap();

        assert_eq!(outcome.end, StreamEnd::Cancelled);
        assert!(pulled.load(Ordering::SeqCst) < 1000);
    }

    #[test]
    fn error_event_escapes_message() {
        let bytes = error_event_bytes("say \"no\"\nnow");
        let text = std::str::from_utf8(&bytes).unwrap();
        assert!(text.starts_with("data: "));
        assert!(text.ends_with("\n\n"));
        let payload: Value = serde_json::from_str(text["data: ".len()..].trim_end()).unwrap();
        assert_eq!(payload["event"], "error");
        assert_eq!(payload["message"], "say \"no\"\nnow");
    }

    #[test]
    fn decoder_handles_crlf_and_multi_line_data() {
        let mut decoder = SseDecoder::new();
        let frames = decoder.push(b"event: message\r\ndata: line1\r\ndata: line2\r\n\r\n");
        assert_eq!(
            frames,
            vec![SseFrame {
                event: Some("message".to_string()),
                data: "line1\nline2".to_string(),
            }]
        );
        assert!(decoder.finish().is_empty());
    }
}
