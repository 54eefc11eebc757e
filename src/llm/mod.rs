mod gateway;
mod ollama;

use async_trait::async_trait;
use axum::body::Bytes;
use futures::stream::BoxStream;
use std::sync::Arc;
use std::time::Duration;

use crate::types::ChatMessage;

pub use gateway::GatewayProvider;
pub use ollama::OllamaProvider;

/// Result type for LLM operations
pub type LlmResult<T> = Result<T, LlmError>;

/// Raw body of a streamed completion, as delivered by the transport
pub type ByteStream = BoxStream<'static, LlmResult<Bytes>>;

/// Errors that can occur during LLM operations
#[derive(Debug, thiserror::Error)]
pub enum LlmError {
    #[error("API request failed: {0}")]
    ApiError(String),

    #[error("Request timed out after {0:?}")]
    Timeout(Duration),

    #[error("Invalid configuration: {0}")]
    ConfigError(String),

    #[error("Rate limit exceeded")]
    RateLimit,

    #[error("Insufficient credits on the model provider")]
    InsufficientCredits,

    #[error("Response parsing failed: {0}")]
    ParseError(String),
}

/// One-shot completion request
#[derive(Debug, Clone)]
pub struct GenerateRequest {
    /// Instructions sent as the system message
    pub system_prompt: Option<String>,
    /// The prompt text
    pub prompt: String,
    /// Images attached to the prompt, in order
    pub image_urls: Vec<String>,
    /// Maximum response length in tokens (provider-dependent)
    pub max_tokens: Option<u32>,
    pub temperature: Option<f32>,
    /// Timeout for the request
    pub timeout: Duration,
}

/// Streamed conversation request
#[derive(Debug, Clone)]
pub struct ChatRequest {
    pub system_prompt: String,
    pub messages: Vec<ChatMessage>,
    /// Timeout until the response headers arrive
    pub timeout: Duration,
}

/// Response from an LLM provider
#[derive(Debug, Clone)]
pub struct GenerateResponse {
    /// The generated text
    pub text: String,
    /// Provider-specific metadata (model used, tokens consumed, etc.)
    pub metadata: ResponseMetadata,
}

/// Metadata about the LLM response
#[derive(Debug, Clone)]
pub struct ResponseMetadata {
    /// Name of the provider (e.g., "gateway", "ollama")
    pub provider: String,
    /// Model name used
    pub model: String,
    /// Tokens consumed (if available)
    pub tokens_used: Option<u32>,
    /// Latency in milliseconds
    pub latency_ms: u64,
}

/// Trait that all LLM providers must implement
#[async_trait]
pub trait LlmProvider: Send + Sync {
    /// Generate a completion for the given prompt
    async fn generate(&self, request: GenerateRequest) -> LlmResult<GenerateResponse>;

    /// Open a streamed chat completion, returning the raw server-sent-event body
    async fn stream_chat(&self, _request: ChatRequest) -> LlmResult<ByteStream> {
        Err(LlmError::ConfigError(format!(
            "Provider '{}' does not support streamed chat",
            self.name()
        )))
    }

    /// Get the name of this provider
    fn name(&self) -> &str;

    /// Whether this provider supports vision/image inputs
    fn supports_vision(&self) -> bool {
        false
    }
}

/// Configuration for LLM providers
#[derive(Debug, Clone)]
pub struct LlmConfig {
    /// API key for the hosted OpenAI-compatible gateway
    pub gateway_api_key: Option<String>,
    /// Base URL of the gateway (without `/chat/completions`)
    pub gateway_url: String,
    /// Model requested from the gateway
    pub model: String,
    /// Ollama base URL (local vision fallback)
    pub ollama_base_url: Option<String>,
    /// Ollama model to use
    pub ollama_model: String,
    /// Default timeout for LLM requests
    pub default_timeout: Duration,
    /// Default max tokens for responses
    pub default_max_tokens: u32,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            gateway_api_key: None,
            gateway_url: "https://ai.gateway.lovable.dev/v1".to_string(),
            model: "google/gemini-2.5-flash".to_string(),
            ollama_base_url: None,
            ollama_model: "llava".to_string(),
            default_timeout: Duration::from_secs(30),
            default_max_tokens: 200,
        }
    }
}

fn non_empty_env(name: &str) -> Option<String> {
    std::env::var(name).ok().and_then(|value| {
        let trimmed = value.trim();
        (!trimmed.is_empty()).then(|| trimmed.to_string())
    })
}

impl LlmConfig {
    /// Load configuration from environment variables
    pub fn from_env() -> Self {
        let defaults = Self::default();

        Self {
            gateway_api_key: non_empty_env("AI_GATEWAY_API_KEY"),
            gateway_url: non_empty_env("AI_GATEWAY_URL").unwrap_or(defaults.gateway_url),
            model: non_empty_env("AI_MODEL").unwrap_or(defaults.model),
            ollama_base_url: non_empty_env("OLLAMA_BASE_URL"),
            ollama_model: non_empty_env("OLLAMA_MODEL").unwrap_or(defaults.ollama_model),
            default_timeout: std::env::var("LLM_TIMEOUT")
                .ok()
                .and_then(|s| s.parse().ok())
                .map(Duration::from_secs)
                .unwrap_or(defaults.default_timeout),
            default_max_tokens: std::env::var("LLM_MAX_TOKENS")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(defaults.default_max_tokens),
        }
    }

    /// Build the provider used for photo scoring and the guide chat.
    /// The hosted gateway wins over a local Ollama vision model.
    pub fn build_provider(&self) -> LlmResult<Arc<dyn LlmProvider>> {
        if let Some(api_key) = &self.gateway_api_key {
            let provider =
                GatewayProvider::new(self.gateway_url.clone(), api_key.clone(), self.model.clone())?;
            return Ok(Arc::new(provider));
        }

        if let Some(base_url) = &self.ollama_base_url {
            let provider = OllamaProvider::new(base_url.clone(), self.ollama_model.clone())?;
            if !provider.supports_vision() {
                return Err(LlmError::ConfigError(format!(
                    "Ollama model {} cannot compare photos. Use a vision model like llava or moondream.",
                    self.ollama_model
                )));
            }
            return Ok(Arc::new(provider));
        }

        Err(LlmError::ConfigError(
            "No LLM provider configured. Set AI_GATEWAY_API_KEY or OLLAMA_BASE_URL".to_string(),
        ))
    }
}
