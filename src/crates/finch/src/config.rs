//! Environment-driven configuration

use crate::error::{AppError, Result};
use llm::RemoteLlmConfig;
use std::time::Duration;

/// Selected LLM provider
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Provider {
    Deepseek,
    OpenAi,
}

impl Provider {
    /// Whether the provider binds JSON-Schema structured output natively
    pub fn supports_json_schema(&self) -> bool {
        matches!(self, Provider::OpenAi)
    }
}

/// Planner structured-output binding mode
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlannerMethod {
    /// Pick per provider capability
    Auto,
    /// Single forced `submit_plan` tool wrapping the schema
    ToolCalling,
    JsonMode,
    JsonSchema,
    /// Skip the LLM, always use the deterministic fallback
    Disabled,
}

#[derive(Debug, Clone)]
pub struct Settings {
    pub provider: Provider,
    pub llm: RemoteLlmConfig,
    pub planner_method: PlannerMethod,
    pub pg_dsn: Option<String>,
    pub jwt_secret: Option<String>,
    pub cors_origins: Vec<String>,
    pub trace_events: bool,
    pub debug_graph_events: bool,
    pub worker_timeout: Duration,
    pub vector_min_score: f64,
    pub connection_max_age: Duration,
    pub host: String,
    pub port: u16,
}

impl Settings {
    /// Read configuration from the environment. A missing API key for the
    /// selected provider is a startup error; everything else has defaults.
    pub fn from_env() -> Result<Self> {
        let provider = match env_or("LLM_PROVIDER", "deepseek").to_lowercase().as_str() {
            "deepseek" => Provider::Deepseek,
            "openai" => Provider::OpenAi,
            other => {
                return Err(AppError::Config(format!("unknown LLM_PROVIDER '{other}'")));
            }
        };

        let llm = match provider {
            Provider::Deepseek => RemoteLlmConfig::from_env(
                "DEEPSEEK_API_KEY",
                "DEEPSEEK_BASE_URL",
                "DEEPSEEK_MODEL",
                "https://api.deepseek.com/v1",
                "deepseek-chat",
            ),
            Provider::OpenAi => RemoteLlmConfig::from_env(
                "OPENAI_API_KEY",
                "OPENAI_BASE_URL",
                "OPENAI_MODEL",
                "https://api.openai.com/v1",
                "gpt-4o-mini",
            ),
        }
        .map_err(|e| AppError::Config(e.to_string()))?;

        let planner_method = match env_or("STRUCTURED_PLANNER_METHOD", "auto")
            .to_lowercase()
            .as_str()
        {
            "auto" => PlannerMethod::Auto,
            "tool_calling" => PlannerMethod::ToolCalling,
            "json_mode" => PlannerMethod::JsonMode,
            "json_schema" => PlannerMethod::JsonSchema,
            "disabled" => PlannerMethod::Disabled,
            other => {
                return Err(AppError::Config(format!(
                    "unknown STRUCTURED_PLANNER_METHOD '{other}'"
                )));
            }
        };

        let cors_origins = env_or("CORS_ORIGINS", "*")
            .split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect();

        Ok(Self {
            provider,
            llm,
            planner_method,
            pg_dsn: std::env::var("PG_DSN").ok().filter(|s| !s.trim().is_empty()),
            jwt_secret: std::env::var("JWT_SECRET").ok(),
            cors_origins,
            trace_events: env_bool("TRACE_EVENTS"),
            debug_graph_events: env_bool("DEBUG_GRAPH_EVENTS"),
            worker_timeout: Duration::from_secs(env_u64("WORKER_TIMEOUT_SECS", 30)),
            vector_min_score: env_or("VECTOR_MIN_SCORE", "0.35")
                .parse()
                .map_err(|_| AppError::Config("VECTOR_MIN_SCORE must be a number".into()))?,
            connection_max_age: Duration::from_secs(env_u64("CONNECTION_MAX_AGE_SECS", 210)),
            host: env_or("HOST", "0.0.0.0"),
            port: env_or("PORT", "3001")
                .parse()
                .map_err(|_| AppError::Config("PORT must be a number".into()))?,
        })
    }

    /// Effective planner binding for the configured provider
    pub fn effective_planner_method(&self) -> PlannerMethod {
        match self.planner_method {
            PlannerMethod::Auto => {
                if self.provider.supports_json_schema() {
                    PlannerMethod::JsonSchema
                } else {
                    PlannerMethod::JsonMode
                }
            }
            other => other,
        }
    }
}

fn env_or(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_bool(key: &str) -> bool {
    std::env::var(key)
        .map(|v| matches!(v.to_lowercase().as_str(), "1" | "true" | "yes" | "on"))
        .unwrap_or(false)
}

fn env_u64(key: &str, default: u64) -> u64 {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

impl Settings {
    /// Offline settings for tests and examples: no database, no real
    /// provider endpoint.
    pub fn offline(provider: Provider) -> Self {
        Settings {
            provider,
            llm: RemoteLlmConfig::new("test-key", "http://localhost:9", "test-model"),
            planner_method: PlannerMethod::Auto,
            pg_dsn: None,
            jwt_secret: Some("secret".into()),
            cors_origins: vec!["*".into()],
            trace_events: true,
            debug_graph_events: false,
            worker_timeout: Duration::from_secs(5),
            vector_min_score: 0.35,
            connection_max_age: Duration::from_secs(210),
            host: "127.0.0.1".into(),
            port: 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_effective_planner_method_auto() {
        let mut settings = Settings::offline(Provider::OpenAi);
        assert_eq!(
            settings.effective_planner_method(),
            PlannerMethod::JsonSchema
        );
        settings.provider = Provider::Deepseek;
        assert_eq!(settings.effective_planner_method(), PlannerMethod::JsonMode);
        settings.planner_method = PlannerMethod::ToolCalling;
        assert_eq!(
            settings.effective_planner_method(),
            PlannerMethod::ToolCalling
        );
    }
}
