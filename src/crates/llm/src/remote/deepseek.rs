//! DeepSeek client (OpenAI-compatible)
//!
//! DeepSeek accepts JSON mode but not JSON-Schema structured output, so a
//! schema-constrained request degrades to `response_format = json_object`;
//! callers put the schema hint in the prompt.

use crate::config::RemoteLlmConfig;
use crate::remote::wire;
use async_trait::async_trait;
use flow_core::error::Result as GraphResult;
use flow_core::llm::{ChatModel, ChatRequest, ChatResponse, ChatStream, Usage};
use flow_core::{GraphError, Message, MessageContent, MessageRole};
use reqwest::Client;
use std::collections::HashMap;

#[derive(Clone)]
pub struct DeepseekClient {
    config: RemoteLlmConfig,
    client: Client,
}

impl DeepseekClient {
    pub fn new(config: RemoteLlmConfig) -> GraphResult<Self> {
        let client = Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|e| GraphError::Llm(format!("failed to build http client: {e}")))?;
        Ok(Self { config, client })
    }

    async fn post(&self, body: &wire::CompletionRequest) -> GraphResult<reqwest::Response> {
        let response = self
            .client
            .post(self.config.completions_url())
            .bearer_auth(&self.config.api_key)
            .json(body)
            .send()
            .await
            .map_err(crate::error::LlmError::from)?;
        Ok(wire::check_status(response).await?)
    }
}

#[async_trait]
impl ChatModel for DeepseekClient {
    async fn chat(&self, request: ChatRequest) -> GraphResult<ChatResponse> {
        let body = wire::build_request(&self.config, &request, false, false);
        let response: wire::CompletionResponse = self
            .post(&body)
            .await?
            .json()
            .await
            .map_err(|e| GraphError::Llm(format!("bad completion response: {e}")))?;

        let choice = response
            .choices
            .into_iter()
            .next()
            .ok_or_else(|| GraphError::Llm("completion had no choices".into()))?;

        let mut message = Message::new(
            MessageRole::Assistant,
            MessageContent::Text(choice.message.content.clone().unwrap_or_default()),
        );
        if let Some(tool_calls) = wire::parse_tool_calls(&choice.message.tool_calls) {
            message = message.with_tool_calls(tool_calls);
        }

        let usage = response.usage.map(|u| Usage {
            input_tokens: u.prompt_tokens,
            output_tokens: u.completion_tokens,
            total_tokens: u.total_tokens,
        });
        let mut metadata = HashMap::new();
        metadata.insert("model".to_string(), serde_json::json!(response.model));

        Ok(ChatResponse {
            message,
            usage,
            metadata,
        })
    }

    async fn stream(&self, request: ChatRequest) -> GraphResult<ChatStream> {
        let body = wire::build_request(&self.config, &request, true, false);
        let response = self.post(&body).await?;
        Ok(wire::sse_chat_stream(response))
    }

    fn clone_box(&self) -> Box<dyn ChatModel> {
        Box::new(self.clone())
    }
}
