//! # llm: provider clients for finch
//!
//! Implementations of [`flow_core::llm::ChatModel`] for the supported chat
//! providers. Both speak the OpenAI `/chat/completions` dialect; they
//! differ in structured-output capability:
//!
//! | Client | JSON mode | JSON Schema |
//! |---|---|---|
//! | [`OpenAiClient`] | yes | yes (`response_format = json_schema`) |
//! | [`DeepseekClient`] | yes | degrades to JSON mode |
//!
//! Streaming uses the provider's `text/event-stream` protocol and yields
//! chunks whose accumulated content is monotonic, which the streaming layer
//! in the backend relies on.

pub mod config;
pub mod error;
pub mod remote;

pub use config::RemoteLlmConfig;
pub use error::{LlmError, Result};
pub use remote::{DeepseekClient, OpenAiClient};
