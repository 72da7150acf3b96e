//! # Planner Gateway
//!
//! Text generation behind two traits:
//! - `LlmProvider` talks to a chat-completion backend
//! - `SkillPlanner` turns an observation, an objective and the previous
//!   error into skill source code
//!
//! `LlmPlanner` joins the two: it renders the prompt, calls the provider and
//! pulls the code out of the reply.

pub mod llm;
pub mod openai;

pub use llm::{extract_code, LlmPlanner};
pub use openai::OpenAIProvider;

use crate::config::PlannerConfig;
use crate::error::{Error, ErrorKind};
use crate::fetch::ExampleTransaction;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;

// ============================================================================
// Core Types
// ============================================================================

/// A chat message in the conversation
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

/// Request parameters for a completion
#[derive(Debug, Clone, Default)]
pub struct CompletionRequest {
    pub messages: Vec<ChatMessage>,
    pub model: Option<String>,
    pub temperature: Option<f32>,
    pub max_tokens: Option<usize>,
    pub stop: Option<Vec<String>>,
}

impl CompletionRequest {
    pub fn new(messages: Vec<ChatMessage>) -> Self {
        Self {
            messages,
            ..Default::default()
        }
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }

    pub fn with_temperature(mut self, temp: f32) -> Self {
        self.temperature = Some(temp);
        self
    }

    pub fn with_max_tokens(mut self, max: usize) -> Self {
        self.max_tokens = Some(max);
        self
    }
}

/// Response from a completion request
#[derive(Debug, Clone)]
pub struct CompletionResponse {
    pub id: String,
    pub model: String,
    pub content: Option<String>,
    pub finish_reason: FinishReason,
    pub usage: Usage,
}

/// Why the model stopped; only `Stop` means the reply is complete
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FinishReason {
    Stop,
    Length,
    ContentFilter,
    Unknown,
}

/// Token usage information
#[derive(Debug, Clone, Default)]
pub struct Usage {
    pub prompt_tokens: usize,
    pub completion_tokens: usize,
    pub total_tokens: usize,
}

// ============================================================================
// Provider Trait
// ============================================================================

/// Error type for provider operations
#[derive(Debug)]
pub enum ProviderError {
    /// Network/connection error
    Network(String),
    /// API returned an error
    Api { status: u16, message: String },
    /// Failed to parse response
    Parse(String),
    /// Rate limited
    RateLimited { retry_after: Option<u64> },
    /// No api key, or the key was refused
    AuthenticationFailed,
    /// Other error
    Other(String),
}

impl std::fmt::Display for ProviderError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Network(e) => write!(f, "Network error: {}", e),
            Self::Api { status, message } => write!(f, "API error ({}): {}", status, message),
            Self::Parse(e) => write!(f, "Parse error: {}", e),
            Self::RateLimited { retry_after } => {
                write!(f, "Rate limited")?;
                if let Some(secs) = retry_after {
                    write!(f, " (retry after {}s)", secs)?;
                }
                Ok(())
            }
            Self::AuthenticationFailed => write!(f, "Authentication failed"),
            Self::Other(e) => write!(f, "{}", e),
        }
    }
}

impl std::error::Error for ProviderError {}

impl From<ProviderError> for Error {
    fn from(err: ProviderError) -> Self {
        let kind = match &err {
            ProviderError::Network(_) => ErrorKind::NetworkFailed,
            ProviderError::RateLimited { .. } => ErrorKind::RateLimited,
            ProviderError::AuthenticationFailed => ErrorKind::ProviderUnavailable,
            ProviderError::Api { status, .. } if *status >= 500 => ErrorKind::ProviderUnavailable,
            _ => ErrorKind::InferenceFailed,
        };
        Error::new(kind, err.to_string()).with_operation("planner::complete")
    }
}

/// A chat-completion backend
#[allow(async_fn_in_trait)]
pub trait LlmProvider: Send + Sync {
    /// Get the default model
    fn default_model(&self) -> &str;

    /// Send a completion request and get a full response
    async fn complete(&self, request: CompletionRequest) -> Result<CompletionResponse, ProviderError>;
}

/// Episode facts a planner may fold into later prompts
#[derive(Debug, Clone)]
pub enum ContextUpdate {
    Discovered(Vec<String>),
    Skills(Vec<String>),
    Examples {
        program_id: String,
        examples: Vec<ExampleTransaction>,
    },
    Reset,
}

/// Anything that writes skills
#[allow(async_fn_in_trait)]
pub trait SkillPlanner {
    /// Propose skill source for `objective`. `error` is the failure of the
    /// previous proposal, if any.
    async fn propose(&self, observation: &Value, objective: &str, error: Option<&str>) -> crate::error::Result<String>;

    /// Planners without context ignore updates
    fn update_context(&self, _update: ContextUpdate) {}
}

// ============================================================================
// Provider Configuration
// ============================================================================

/// Connection settings for an OpenAI-compatible endpoint
#[derive(Debug, Clone)]
pub struct ProviderConfig {
    pub api_key: Option<String>,
    pub base_url: String,
    pub default_model: String,
    pub headers: HashMap<String, String>,
    pub timeout_secs: u64,
}

impl ProviderConfig {
    pub fn openai(api_key: impl Into<String>) -> Self {
        Self {
            api_key: Some(api_key.into()),
            base_url: "https://api.openai.com/v1".into(),
            default_model: "gpt-4o".into(),
            headers: HashMap::new(),
            timeout_secs: 120,
        }
    }

    /// OpenRouter, which also wants attribution headers
    pub fn openrouter(api_key: impl Into<String>) -> Self {
        let mut headers = HashMap::new();
        headers.insert("HTTP-Referer".into(), "https://github.com/solana-voyager".into());
        headers.insert("X-Title".into(), "Solana Voyager".into());
        Self {
            api_key: Some(api_key.into()),
            base_url: "https://openrouter.ai/api/v1".into(),
            default_model: "openai/gpt-4o-mini".into(),
            headers,
            timeout_secs: 120,
        }
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.default_model = model.into();
        self
    }

    pub fn with_timeout(mut self, secs: u64) -> Self {
        self.timeout_secs = secs;
        self
    }
}

impl From<&PlannerConfig> for ProviderConfig {
    fn from(config: &PlannerConfig) -> Self {
        let base = if config.base_url.contains("openrouter.ai") {
            ProviderConfig::openrouter(config.api_key.clone().unwrap_or_default())
        } else {
            ProviderConfig::openai(config.api_key.clone().unwrap_or_default())
        };
        ProviderConfig {
            api_key: config.api_key.clone(),
            base_url: config.base_url.trim_end_matches('/').to_string(),
            ..base
        }
        .with_model(config.model.clone())
        .with_timeout(config.timeout_secs)
    }
}

// ============================================================================
// Usage Tracking
// ============================================================================

/// Tracks token usage across multiple calls
#[derive(Debug, Clone, Default)]
pub struct UsageTracker {
    pub total_calls: usize,
    pub total_prompt_tokens: usize,
    pub total_completion_tokens: usize,
    pub by_model: HashMap<String, Usage>,
}

impl UsageTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn track(&mut self, model: &str, usage: &Usage) {
        self.total_calls += 1;
        self.total_prompt_tokens += usage.prompt_tokens;
        self.total_completion_tokens += usage.completion_tokens;

        let entry = self.by_model.entry(model.to_string()).or_default();
        entry.prompt_tokens += usage.prompt_tokens;
        entry.completion_tokens += usage.completion_tokens;
        entry.total_tokens += usage.total_tokens;
    }

    pub fn total_tokens(&self) -> usize {
        self.total_prompt_tokens + self.total_completion_tokens
    }
}

// ============================================================================
// Tests
// ============================================================================
