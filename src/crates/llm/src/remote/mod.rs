//! Remote provider clients

mod deepseek;
mod openai;
pub(crate) mod wire;

pub use deepseek::DeepseekClient;
pub use openai::OpenAiClient;
