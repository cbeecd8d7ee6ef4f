//! Conversation message types
//!
//! Messages are the unit of conversational state. They flow through the graph
//! in the `messages` channel, are persisted by the checkpointer in a tagged
//! JSON form, and are converted to provider wire formats by the `llm` crate.
//!
//! The [`add_messages`] reducer defines how concurrent writes to a message
//! channel merge: values append in order, except that a message carrying an
//! id already present in the list replaces the existing entry in place. This
//! makes message appends idempotent across retried supersteps.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Role of a message sender
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageRole {
    System,
    Human,
    Assistant,
    Tool,
}

/// Individual part of a multimodal message
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentPart {
    Text { text: String },
    ImageUrl { url: String },
}

impl ContentPart {
    pub fn text(text: impl Into<String>) -> Self {
        Self::Text { text: text.into() }
    }

    pub fn image_url(url: impl Into<String>) -> Self {
        Self::ImageUrl { url: url.into() }
    }
}

/// Message content: plain text or multimodal parts
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MessageContent {
    Text(String),
    Parts(Vec<ContentPart>),
}

impl From<String> for MessageContent {
    fn from(s: String) -> Self {
        Self::Text(s)
    }
}

impl From<&str> for MessageContent {
    fn from(s: &str) -> Self {
        Self::Text(s.to_string())
    }
}

impl From<Vec<ContentPart>> for MessageContent {
    fn from(parts: Vec<ContentPart>) -> Self {
        Self::Parts(parts)
    }
}

/// A tool invocation proposed by an assistant message
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    pub id: String,
    pub name: String,
    pub args: Value,
}

/// Base message type for conversational state
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    /// Unique identifier; used by [`add_messages`] for de-duplication
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,

    pub role: MessageRole,

    pub content: MessageContent,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,

    /// Tool calls (assistant messages only)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_calls: Option<Vec<ToolCall>>,

    /// Id of the call this message answers (tool messages only)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
}

impl Message {
    pub fn new(role: MessageRole, content: impl Into<MessageContent>) -> Self {
        Self {
            id: Some(Uuid::new_v4().to_string()),
            role,
            content: content.into(),
            name: None,
            tool_calls: None,
            tool_call_id: None,
        }
    }

    pub fn system(content: impl Into<MessageContent>) -> Self {
        Self::new(MessageRole::System, content)
    }

    pub fn human(content: impl Into<MessageContent>) -> Self {
        Self::new(MessageRole::Human, content)
    }

    pub fn assistant(content: impl Into<MessageContent>) -> Self {
        Self::new(MessageRole::Assistant, content)
    }

    pub fn tool(content: impl Into<MessageContent>, tool_call_id: impl Into<String>) -> Self {
        Self {
            tool_call_id: Some(tool_call_id.into()),
            ..Self::new(MessageRole::Tool, content)
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    pub fn with_tool_calls(mut self, tool_calls: Vec<ToolCall>) -> Self {
        self.tool_calls = Some(tool_calls);
        self
    }

    /// Text content, if this is a plain text message
    pub fn text(&self) -> Option<&str> {
        match &self.content {
            MessageContent::Text(s) => Some(s),
            MessageContent::Parts(_) => None,
        }
    }

    /// Generate an id if the message does not carry one yet
    pub fn ensure_id(&mut self) {
        if self.id.is_none() {
            self.id = Some(Uuid::new_v4().to_string());
        }
    }
}

/// Merge two message lists: append, de-duplicating by id.
///
/// A right-hand message whose id matches an existing one replaces that entry
/// in place; everything else is appended in order. Messages without ids are
/// assigned one so later merges stay stable.
pub fn add_messages(left: Vec<Message>, right: Vec<Message>) -> Vec<Message> {
    let mut merged = left;
    for mut msg in right {
        msg.ensure_id();
        let id = msg.id.clone();
        match merged
            .iter()
            .position(|m| m.id.is_some() && m.id == id)
        {
            Some(idx) => merged[idx] = msg,
            None => merged.push(msg),
        }
    }
    merged
}

/// Last human message in a list, scanning from the end
pub fn last_human_text(messages: &[Message]) -> Option<&str> {
    messages
        .iter()
        .rev()
        .find(|m| m.role == MessageRole::Human)
        .and_then(|m| m.text())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_constructors() {
        let msg = Message::human("hello");
        assert_eq!(msg.role, MessageRole::Human);
        assert_eq!(msg.text(), Some("hello"));
        assert!(msg.id.is_some());

        let tool = Message::tool("done", "call-1");
        assert_eq!(tool.role, MessageRole::Tool);
        assert_eq!(tool.tool_call_id.as_deref(), Some("call-1"));
    }

    #[test]
    fn test_add_messages_appends() {
        let left = vec![Message::human("a")];
        let right = vec![Message::assistant("b"), Message::human("c")];
        let merged = add_messages(left, right);
        assert_eq!(merged.len(), 3);
        assert_eq!(merged[1].text(), Some("b"));
    }

    #[test]
    fn test_add_messages_replaces_by_id() {
        let left = vec![Message::human("draft").with_id("m1")];
        let right = vec![Message::human("final").with_id("m1")];
        let merged = add_messages(left, right);
        assert_eq!(merged.len(), 1);
        assert_eq!(merged[0].text(), Some("final"));
    }

    #[test]
    fn test_add_messages_assigns_missing_ids() {
        let mut msg = Message::human("x");
        msg.id = None;
        let merged = add_messages(vec![], vec![msg]);
        assert!(merged[0].id.is_some());
    }

    #[test]
    fn test_role_serialization() {
        let msg = Message::assistant("hi");
        let v = serde_json::to_value(&msg).unwrap();
        assert_eq!(v["role"], "assistant");
        let back: Message = serde_json::from_value(v).unwrap();
        assert_eq!(back.role, MessageRole::Assistant);
    }

    #[test]
    fn test_last_human_text() {
        let msgs = vec![
            Message::human("first"),
            Message::assistant("reply"),
            Message::human("second"),
        ];
        assert_eq!(last_human_text(&msgs), Some("second"));
        assert_eq!(last_human_text(&[]), None);
    }
}
