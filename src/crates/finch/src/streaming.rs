//! Streaming layer: SSE events and the per-thread callback registry
//!
//! Graph state must stay serializable, so event sinks never enter it.
//! Instead a process-wide registry maps `thread_id` to the sink of the run
//! currently streaming that thread; nodes look their sink up by the thread
//! id they carry in state. The HTTP handler registers the sink before the
//! producer task starts and removes it when the run finishes.
//!
//! The producer pushes frames into a bounded queue; the handler drains it
//! to the socket. Closing the channel is the termination sentinel. After a
//! client disconnect pushes become best-effort; the producer keeps running
//! so the final checkpoint and assistant row still land.

use dashmap::DashMap;
use flow_core::ToolCall;
use serde_json::{json, Value};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::debug;

/// Streamed deltas are re-chunked to at most this many characters
pub const MAX_CHUNK_CHARS: usize = 200;

/// Bounded event queue depth per run
pub const EVENT_QUEUE_DEPTH: usize = 256;

/// Server-sent event taxonomy
#[derive(Debug, Clone)]
pub enum SseEvent {
    /// OpenAI-style chunk envelope (opening role chunk, final finish chunk)
    Message(Value),
    /// Streamed assistant delta with accumulated content
    PartialAi {
        content: String,
        tool_calls: Option<Vec<ToolCall>>,
    },
    /// A tool finished executing
    OnToolEnd(Value),
    /// A tool produced output
    ToolResult(Value),
    /// The client must confirm a privileged tool before the run continues
    ApprovalRequired {
        thread_id: String,
        tool_calls: Value,
    },
    /// Terminal marker carrying the persisted message id; always the last
    /// non-error event of a run
    Complete { message_id: String },
    /// Terminal failure; closes the stream
    Error { error: String, kind: String },
    /// Optional tracing event (`phase`, `dispatch`, `aggregate`, ...)
    Trace { name: &'static str, data: Value },
}

impl SseEvent {
    pub fn name(&self) -> &str {
        match self {
            SseEvent::Message(_) => "message",
            SseEvent::PartialAi { .. } => "partial_ai",
            SseEvent::OnToolEnd(_) => "on_tool_end",
            SseEvent::ToolResult(_) => "tool_result",
            SseEvent::ApprovalRequired { .. } => "approval_required",
            SseEvent::Complete { .. } => "complete",
            SseEvent::Error { .. } => "error",
            SseEvent::Trace { name, .. } => name,
        }
    }

    pub fn data(&self) -> Value {
        match self {
            SseEvent::Message(data) => data.clone(),
            SseEvent::PartialAi {
                content,
                tool_calls,
            } => {
                let mut data = json!({ "content": content });
                if let Some(calls) = tool_calls {
                    data["tool_calls"] = serde_json::to_value(calls).unwrap_or(Value::Null);
                }
                data
            }
            SseEvent::OnToolEnd(data) | SseEvent::ToolResult(data) => data.clone(),
            SseEvent::ApprovalRequired {
                thread_id,
                tool_calls,
            } => json!({ "thread_id": thread_id, "tool_calls": tool_calls }),
            SseEvent::Complete { message_id } => {
                json!({ "type": "complete", "message_id": message_id })
            }
            SseEvent::Error { error, kind } => json!({ "error": error, "type": kind }),
            SseEvent::Trace { data, .. } => data.clone(),
        }
    }

    /// Wire framing: `event: <name>\ndata: <json>\n\n`
    pub fn to_frame(&self) -> String {
        format!("event: {}\ndata: {}\n\n", self.name(), self.data())
    }

    pub fn is_trace(&self) -> bool {
        matches!(self, SseEvent::Trace { .. })
    }
}

/// Per-run sink feeding the bounded event queue.
///
/// `send` is best-effort by design: a full queue (slow or gone consumer)
/// drops the frame with a log line rather than stalling the graph.
#[derive(Clone)]
pub struct EventSink {
    tx: mpsc::Sender<SseEvent>,
    trace_enabled: bool,
}

impl EventSink {
    pub fn new(tx: mpsc::Sender<SseEvent>, trace_enabled: bool) -> Self {
        Self { tx, trace_enabled }
    }

    pub fn send(&self, event: SseEvent) {
        if event.is_trace() && !self.trace_enabled {
            return;
        }
        if let Err(err) = self.tx.try_send(event) {
            debug!(error = %err, "event dropped (consumer gone or queue full)");
        }
    }

    pub fn trace(&self, name: &'static str, data: Value) {
        self.send(SseEvent::Trace { name, data });
    }
}

/// Process-wide `thread_id -> sink` registry
#[derive(Default, Clone)]
pub struct EventRegistry {
    inner: Arc<DashMap<String, EventSink>>,
}

impl EventRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Install the sink for a thread before its run starts.
    pub fn register(&self, thread_id: impl Into<String>, sink: EventSink) {
        self.inner.insert(thread_id.into(), sink);
    }

    pub fn remove(&self, thread_id: &str) {
        self.inner.remove(thread_id);
    }

    pub fn get(&self, thread_id: &str) -> Option<EventSink> {
        self.inner.get(thread_id).map(|entry| entry.clone())
    }

    /// Deliver to the thread's sink, if one is streaming.
    pub fn emit(&self, thread_id: &str, event: SseEvent) {
        if let Some(sink) = self.get(thread_id) {
            sink.send(event);
        }
    }

    pub fn trace(&self, thread_id: &str, name: &'static str, data: Value) {
        self.emit(thread_id, SseEvent::Trace { name, data });
    }
}

/// Split an oversized streamed token so no single frame exceeds
/// [`MAX_CHUNK_CHARS`]; splits respect char boundaries.
pub fn split_token_into_chunks(token: &str, max_chunk_size: usize) -> Vec<String> {
    if token.chars().count() <= max_chunk_size {
        return vec![token.to_string()];
    }
    let chars: Vec<char> = token.chars().collect();
    chars
        .chunks(max_chunk_size)
        .map(|chunk| chunk.iter().collect())
        .collect()
}

/// Opening chunk of the OpenAI-style message envelope
pub fn role_chunk() -> SseEvent {
    SseEvent::Message(json!({
        "choices": [{"delta": {"role": "assistant"}, "index": 0}]
    }))
}

/// Final chunk of the OpenAI-style message envelope
pub fn finish_chunk() -> SseEvent {
    SseEvent::Message(json!({
        "choices": [{"delta": {}, "finish_reason": "stop", "index": 0}]
    }))
}
