//! Shared application context
//!
//! Everything a graph node needs beyond the state object: configuration,
//! the chat model, the checkpoint saver, the thread store, the retrieval
//! backends, and the event registry. Nodes receive it as an `Arc` captured
//! by their closures; effects flow through here, never through state.

use crate::config::Settings;
use crate::retrieval::{GraphService, SlotExtractor, SqlQueryService, VectorSearchService};
use crate::store::ThreadStore;
use crate::streaming::EventRegistry;
use flow_checkpoint::CheckpointSaver;
use flow_core::llm::ChatModel;
use std::sync::Arc;

pub struct AppContext {
    pub settings: Settings,
    pub model: Arc<dyn ChatModel>,
    pub saver: Arc<dyn CheckpointSaver>,
    pub threads: Arc<dyn ThreadStore>,
    pub sql: Arc<dyn SqlQueryService>,
    pub vector: Arc<dyn VectorSearchService>,
    pub kg: Arc<dyn GraphService>,
    pub slots: Arc<dyn SlotExtractor>,
    pub events: EventRegistry,
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use crate::config::Provider;
    use crate::retrieval::Unconfigured;
    use crate::store::MemoryThreadStore;
    use async_trait::async_trait;
    use flow_core::llm::{ChatChunk, ChatRequest, ChatResponse, ChatStream};
    use flow_core::{Message, Result as GraphResult};
    use parking_lot::Mutex;
    use std::collections::HashMap;
    use std::collections::VecDeque;

    /// Chat model that replays scripted responses (FIFO), then a default.
    #[derive(Clone, Default)]
    pub struct ScriptedModel {
        responses: Arc<Mutex<VecDeque<Message>>>,
        pub default_reply: String,
    }

    impl ScriptedModel {
        pub fn new(default_reply: impl Into<String>) -> Self {
            Self {
                responses: Arc::new(Mutex::new(VecDeque::new())),
                default_reply: default_reply.into(),
            }
        }

        pub fn push_response(&self, message: Message) {
            self.responses.lock().push_back(message);
        }

        fn next_message(&self) -> Message {
            self.responses
                .lock()
                .pop_front()
                .unwrap_or_else(|| Message::assistant(self.default_reply.clone()))
        }
    }

    #[async_trait]
    impl flow_core::llm::ChatModel for ScriptedModel {
        async fn chat(&self, _request: ChatRequest) -> GraphResult<ChatResponse> {
            Ok(ChatResponse {
                message: self.next_message(),
                usage: None,
                metadata: HashMap::new(),
            })
        }

        async fn stream(&self, _request: ChatRequest) -> GraphResult<ChatStream> {
            let text = match self.next_message().text() {
                Some(t) => t.to_string(),
                None => self.default_reply.clone(),
            };
            let stream = async_stream_chunks(text);
            Ok(stream)
        }

        fn clone_box(&self) -> Box<dyn flow_core::llm::ChatModel> {
            Box::new(self.clone())
        }
    }

    /// Split a reply into two chunks so accumulation is observable.
    fn async_stream_chunks(text: String) -> ChatStream {
        let mid = text.len() / 2;
        // split on a char boundary
        let mid = (0..=mid)
            .rev()
            .find(|i| text.is_char_boundary(*i))
            .unwrap_or(0);
        let (a, b) = text.split_at(mid);
        let chunks = vec![
            ChatChunk {
                delta: a.to_string(),
                content: a.to_string(),
                tool_calls: None,
                finished: false,
            },
            ChatChunk {
                delta: b.to_string(),
                content: text.clone(),
                tool_calls: None,
                finished: true,
            },
        ];
        Box::pin(futures::stream::iter(chunks.into_iter().map(Ok)))
    }

    /// Context wired for offline tests: scripted model, in-memory saver and
    /// store, unconfigured retrieval.
    pub fn offline_context() -> Arc<AppContext> {
        offline_context_with_model(ScriptedModel::new("scripted reply"))
    }

    pub fn offline_context_with_model(model: ScriptedModel) -> Arc<AppContext> {
        Arc::new(AppContext {
            settings: Settings::offline(Provider::Deepseek),
            model: Arc::new(model),
            saver: Arc::new(flow_checkpoint::InMemorySaver::new()),
            threads: Arc::new(MemoryThreadStore::new()),
            sql: Arc::new(Unconfigured),
            vector: Arc::new(Unconfigured),
            kg: Arc::new(Unconfigured),
            slots: Arc::new(Unconfigured),
            events: EventRegistry::new(),
        })
    }
}
