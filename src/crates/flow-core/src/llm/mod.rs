//! Provider-agnostic LLM interface
//!
//! The engine orchestrates LLM calls but does not speak to any provider
//! itself: the [`ChatModel`] trait is implemented by the `llm` crate (and by
//! test mocks). Structured output is expressed through
//! [`ResponseFormat`] / forced tool choice rather than provider flags, so a
//! planner can select a binding method without knowing the wire format.

mod traits;
mod types;

pub use traits::ChatModel;
pub use types::{
    ChatChunk, ChatRequest, ChatResponse, ChatStream, ResponseFormat, ToolDefinition, Usage,
};
