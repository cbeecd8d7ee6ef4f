//! The [`ChatModel`] trait

use super::types::{ChatRequest, ChatResponse, ChatStream};
use crate::error::Result;
use async_trait::async_trait;

/// Core trait for chat-based language models.
///
/// Implementations convert [`crate::messages::Message`] values to their wire
/// format, perform the call, and convert back. They must be `Send + Sync`;
/// graphs hold them as `Arc<dyn ChatModel>`.
#[async_trait]
pub trait ChatModel: std::marker::Send + Sync {
    /// Generate a complete response.
    async fn chat(&self, request: ChatRequest) -> Result<ChatResponse>;

    /// Stream the response token by token. The accumulated `content` of the
    /// yielded chunks is monotonic.
    async fn stream(&self, request: ChatRequest) -> Result<ChatStream>;

    /// Liveness probe; defaults to available.
    async fn is_available(&self) -> Result<bool> {
        Ok(true)
    }

    /// Clone into a boxed trait object.
    fn clone_box(&self) -> Box<dyn ChatModel>;
}

impl Clone for Box<dyn ChatModel> {
    fn clone(&self) -> Self {
        self.clone_box()
    }
}
