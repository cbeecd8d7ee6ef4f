//! Provider configuration

use crate::error::{LlmError, Result};
use std::time::Duration;

fn default_timeout() -> Duration {
    Duration::from_secs(120)
}

/// Configuration for a remote, OpenAI-compatible chat provider.
#[derive(Debug, Clone)]
pub struct RemoteLlmConfig {
    pub api_key: String,
    /// Base URL including the version prefix, e.g. `https://api.deepseek.com/v1`
    pub base_url: String,
    pub model: String,
    pub timeout: Duration,
}

impl RemoteLlmConfig {
    pub fn new(
        api_key: impl Into<String>,
        base_url: impl Into<String>,
        model: impl Into<String>,
    ) -> Self {
        Self {
            api_key: api_key.into(),
            base_url: base_url.into(),
            model: model.into(),
            timeout: default_timeout(),
        }
    }

    /// Read credentials from the environment. The API key is required; base
    /// URL and model fall back to the given defaults.
    pub fn from_env(
        key_var: &str,
        base_url_var: &str,
        model_var: &str,
        default_base_url: &str,
        default_model: &str,
    ) -> Result<Self> {
        let api_key = std::env::var(key_var)
            .map_err(|_| LlmError::MissingConfig(key_var.to_string()))?;
        let base_url =
            std::env::var(base_url_var).unwrap_or_else(|_| default_base_url.to_string());
        let model = std::env::var(model_var).unwrap_or_else(|_| default_model.to_string());
        Ok(Self::new(api_key, base_url, model))
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// `{base_url}/chat/completions` with duplicate slashes avoided
    pub fn completions_url(&self) -> String {
        format!("{}/chat/completions", self.base_url.trim_end_matches('/'))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_completions_url() {
        let config = RemoteLlmConfig::new("k", "https://api.deepseek.com/v1/", "deepseek-chat");
        assert_eq!(
            config.completions_url(),
            "https://api.deepseek.com/v1/chat/completions"
        );
    }
}
