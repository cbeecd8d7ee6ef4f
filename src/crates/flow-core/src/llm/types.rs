//! Request/response types shared by all chat providers

use crate::messages::{Message, ToolCall};
use futures::stream::Stream;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::pin::Pin;

/// Output constraint for a chat call
#[derive(Debug, Clone, PartialEq)]
pub enum ResponseFormat {
    /// Free-form text
    Text,
    /// Provider JSON mode: any syntactically valid JSON object
    JsonObject,
    /// Schema-constrained structured output
    JsonSchema { name: String, schema: Value },
}

/// A callable tool exposed to the model
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolDefinition {
    pub name: String,
    pub description: String,
    /// JSON Schema of the arguments object
    pub parameters: Value,
}

/// Chat call parameters
#[derive(Debug, Clone)]
pub struct ChatRequest {
    pub messages: Vec<Message>,
    pub temperature: Option<f32>,
    pub max_tokens: Option<u32>,
    pub response_format: ResponseFormat,
    pub tools: Vec<ToolDefinition>,
    /// Force the model to call this tool (structured output via tool calling)
    pub tool_choice: Option<String>,
}

impl ChatRequest {
    pub fn new(messages: Vec<Message>) -> Self {
        Self {
            messages,
            temperature: None,
            max_tokens: None,
            response_format: ResponseFormat::Text,
            tools: Vec::new(),
            tool_choice: None,
        }
    }

    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = Some(temperature);
        self
    }

    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = Some(max_tokens);
        self
    }

    pub fn with_response_format(mut self, format: ResponseFormat) -> Self {
        self.response_format = format;
        self
    }

    pub fn with_tools(mut self, tools: Vec<ToolDefinition>) -> Self {
        self.tools = tools;
        self
    }

    pub fn with_forced_tool(mut self, name: impl Into<String>) -> Self {
        self.tool_choice = Some(name.into());
        self
    }
}

/// Token accounting reported by the provider
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Usage {
    pub input_tokens: u32,
    pub output_tokens: u32,
    pub total_tokens: u32,
}

/// Complete (non-streaming) chat result
#[derive(Debug, Clone)]
pub struct ChatResponse {
    pub message: Message,
    pub usage: Option<Usage>,
    pub metadata: HashMap<String, Value>,
}

/// One streamed increment
#[derive(Debug, Clone)]
pub struct ChatChunk {
    /// Newly produced text
    pub delta: String,
    /// Content accumulated so far, monotonic across the stream
    pub content: String,
    pub tool_calls: Option<Vec<ToolCall>>,
    pub finished: bool,
}

/// Stream of chat chunks
pub type ChatStream =
    Pin<Box<dyn Stream<Item = crate::error::Result<ChatChunk>> + std::marker::Send>>;
