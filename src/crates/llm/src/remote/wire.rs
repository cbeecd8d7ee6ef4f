//! OpenAI-compatible wire format shared by the remote clients
//!
//! Both supported providers speak the `/chat/completions` dialect; they
//! differ only in which structured-output bindings they accept. The
//! conversion helpers here map [`flow_core`] messages and requests onto the
//! wire and back, and [`sse_chat_stream`] turns a streaming HTTP response
//! into a [`ChatStream`] of monotonic chunks.

use crate::config::RemoteLlmConfig;
use crate::error::LlmError;
use flow_core::llm::{ChatChunk, ChatRequest, ChatStream, ResponseFormat};
use flow_core::{GraphError, Message, MessageContent, MessageRole, ToolCall};
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

#[derive(Debug, Serialize)]
pub(crate) struct WireMessage {
    pub role: String,
    pub content: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

#[derive(Debug, Serialize)]
pub(crate) struct CompletionRequest {
    pub model: String,
    pub messages: Vec<WireMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
    pub stream: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub response_format: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tools: Option<Vec<Value>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_choice: Option<Value>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct CompletionResponse {
    pub choices: Vec<Choice>,
    pub usage: Option<WireUsage>,
    #[serde(default)]
    pub model: String,
}

#[derive(Debug, Deserialize)]
pub(crate) struct Choice {
    pub message: AssistantMessage,
    pub finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct AssistantMessage {
    pub content: Option<String>,
    #[serde(default)]
    pub tool_calls: Vec<WireToolCall>,
}

#[derive(Debug, Clone, Deserialize)]
pub(crate) struct WireToolCall {
    #[serde(default)]
    pub id: String,
    pub function: WireFunction,
}

#[derive(Debug, Clone, Deserialize)]
pub(crate) struct WireFunction {
    #[serde(default)]
    pub name: String,
    /// Arguments arrive as a JSON-encoded string
    #[serde(default)]
    pub arguments: String,
}

#[derive(Debug, Deserialize)]
pub(crate) struct WireUsage {
    #[serde(default)]
    pub prompt_tokens: u32,
    #[serde(default)]
    pub completion_tokens: u32,
    #[serde(default)]
    pub total_tokens: u32,
}

#[derive(Debug, Deserialize)]
struct StreamChunk {
    choices: Vec<StreamChoice>,
}

#[derive(Debug, Deserialize)]
struct StreamChoice {
    delta: StreamDelta,
    finish_reason: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct StreamDelta {
    content: Option<String>,
}

pub(crate) fn convert_messages(messages: &[Message]) -> Vec<WireMessage> {
    messages
        .iter()
        .map(|msg| WireMessage {
            role: match msg.role {
                MessageRole::System => "system".to_string(),
                MessageRole::Human => "user".to_string(),
                MessageRole::Assistant => "assistant".to_string(),
                MessageRole::Tool => "tool".to_string(),
            },
            content: flatten_content(&msg.content),
            tool_call_id: msg.tool_call_id.clone(),
            name: msg.name.clone(),
        })
        .collect()
}

fn flatten_content(content: &MessageContent) -> String {
    match content {
        MessageContent::Text(text) => text.clone(),
        MessageContent::Parts(parts) => parts
            .iter()
            .filter_map(|part| match part {
                flow_core::ContentPart::Text { text } => Some(text.as_str()),
                flow_core::ContentPart::ImageUrl { .. } => None,
            })
            .collect::<Vec<_>>()
            .join("\n"),
    }
}

/// Build the wire request. `supports_json_schema` controls whether a
/// [`ResponseFormat::JsonSchema`] binds natively or degrades to JSON mode.
pub(crate) fn build_request(
    config: &RemoteLlmConfig,
    request: &ChatRequest,
    stream: bool,
    supports_json_schema: bool,
) -> CompletionRequest {
    let response_format = match &request.response_format {
        ResponseFormat::Text => None,
        ResponseFormat::JsonObject => Some(json!({"type": "json_object"})),
        ResponseFormat::JsonSchema { name, schema } => {
            if supports_json_schema {
                Some(json!({
                    "type": "json_schema",
                    "json_schema": {"name": name, "schema": schema, "strict": true},
                }))
            } else {
                Some(json!({"type": "json_object"}))
            }
        }
    };
    let tools = if request.tools.is_empty() {
        None
    } else {
        Some(
            request
                .tools
                .iter()
                .map(|tool| {
                    json!({
                        "type": "function",
                        "function": {
                            "name": tool.name,
                            "description": tool.description,
                            "parameters": tool.parameters,
                        },
                    })
                })
                .collect(),
        )
    };
    let tool_choice = request
        .tool_choice
        .as_ref()
        .map(|name| json!({"type": "function", "function": {"name": name}}));

    CompletionRequest {
        model: config.model.clone(),
        messages: convert_messages(&request.messages),
        temperature: request.temperature,
        max_tokens: request.max_tokens,
        stream,
        response_format,
        tools,
        tool_choice,
    }
}

pub(crate) fn parse_tool_calls(calls: &[WireToolCall]) -> Option<Vec<ToolCall>> {
    if calls.is_empty() {
        return None;
    }
    Some(
        calls
            .iter()
            .map(|call| ToolCall {
                id: call.id.clone(),
                name: call.function.name.clone(),
                args: serde_json::from_str(&call.function.arguments)
                    .unwrap_or_else(|_| Value::String(call.function.arguments.clone())),
            })
            .collect(),
    )
}

/// Parse a `text/event-stream` completion response into chat chunks.
///
/// Frames are separated by blank lines; each data line carries one JSON
/// chunk, and `[DONE]` terminates the stream. Accumulated content grows
/// monotonically across the yielded chunks.
pub(crate) fn sse_chat_stream(response: reqwest::Response) -> ChatStream {
    let stream = async_stream::try_stream! {
        let mut bytes = response.bytes_stream();
        let mut buffer = String::new();
        let mut content = String::new();
        let mut finished = false;

        while let Some(chunk) = bytes.next().await {
            let chunk = chunk.map_err(|e| GraphError::Llm(e.to_string()))?;
            buffer.push_str(&String::from_utf8_lossy(&chunk));

            while let Some(pos) = buffer.find("\n\n") {
                let frame = buffer[..pos].to_string();
                buffer.drain(..pos + 2);

                for line in frame.lines() {
                    let Some(data) = line.strip_prefix("data:").map(str::trim) else {
                        continue;
                    };
                    if data == "[DONE]" {
                        finished = true;
                        yield ChatChunk {
                            delta: String::new(),
                            content: content.clone(),
                            tool_calls: None,
                            finished: true,
                        };
                        continue;
                    }
                    let parsed: StreamChunk = serde_json::from_str(data)
                        .map_err(|e| GraphError::Llm(format!("bad stream chunk: {e}")))?;
                    let Some(choice) = parsed.choices.first() else {
                        continue;
                    };
                    if let Some(delta) = &choice.delta.content {
                        if !delta.is_empty() {
                            content.push_str(delta);
                            yield ChatChunk {
                                delta: delta.clone(),
                                content: content.clone(),
                                tool_calls: None,
                                finished: false,
                            };
                        }
                    }
                    if choice.finish_reason.is_some() && !finished {
                        finished = true;
                        yield ChatChunk {
                            delta: String::new(),
                            content: content.clone(),
                            tool_calls: None,
                            finished: true,
                        };
                    }
                }
            }
        }
    };
    Box::pin(stream)
}

/// Surface non-2xx responses as typed API errors.
pub(crate) async fn check_status(response: reqwest::Response) -> Result<reqwest::Response, LlmError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let message = response.text().await.unwrap_or_default();
    Err(LlmError::Api {
        status: status.as_u16(),
        message,
    })
}
