//! LLM provider factory and dynamic dispatch.
//!
//! [`LlmProvider`] uses `impl Future` return types (RPITIT) and is therefore
//! not object-safe. [`LlmProviderEnum`] selects the backend at runtime while
//! keeping the async trait syntax.
//!
//! # Usage
//!
//! ```no_run
//! use lapbot_client::provider::{LlmConfig, LlmProviderEnum};
//! use lapbot_core::{LlmProviderType, LlmRequest};
//! use lapbot_core::traits::LlmProvider;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let config = LlmConfig::new(LlmProviderType::Gemini, "your-api-key");
//! let provider = LlmProviderEnum::from_config(&config)?;
//! println!("Using {} ({})", provider.name(), provider.model());
//! let text = provider.generate(&LlmRequest::new("Xin chào")).await?;
//! # Ok(())
//! # }
//! ```

use lapbot_core::error::AppError;
use lapbot_core::traits::LlmProvider;
use lapbot_core::{LlmProviderType, LlmRequest};

use crate::{GeminiClient, TogetherClient};

/// Settings needed to build a provider.
#[derive(Debug, Clone)]
pub struct LlmConfig {
    pub provider: LlmProviderType,
    pub api_key: String,
    /// Model override; `None` uses the provider default.
    pub model: Option<String>,
}

impl LlmConfig {
    pub fn new(provider: LlmProviderType, api_key: impl Into<String>) -> Self {
        Self {
            provider,
            api_key: api_key.into(),
            model: None,
        }
    }

    pub fn with_model(mut self, model: Option<String>) -> Self {
        self.model = model.filter(|m| !m.trim().is_empty());
        self
    }
}

/// Unified LLM provider wrapping the concrete clients.
#[derive(Clone)]
pub enum LlmProviderEnum {
    /// Google Gemini `generateContent`.
    Gemini(GeminiClient),
    /// Together AI chat completions.
    Together(TogetherClient),
}

impl LlmProviderEnum {
    /// Builds the provider selected by `config`.
    pub fn from_config(config: &LlmConfig) -> Result<Self, AppError> {
        let model = config.model.as_deref();
        match config.provider {
            LlmProviderType::Gemini => Self::gemini(&config.api_key, model),
            LlmProviderType::Together => Self::together(&config.api_key, model),
        }
    }

    pub fn gemini(api_key: &str, model: Option<&str>) -> Result<Self, AppError> {
        Ok(Self::Gemini(GeminiClient::new(api_key, model)?))
    }

    pub fn together(api_key: &str, model: Option<&str>) -> Result<Self, AppError> {
        Ok(Self::Together(TogetherClient::new(api_key, model)?))
    }

    /// The backend kind behind this provider.
    pub fn provider_type(&self) -> LlmProviderType {
        match self {
            Self::Gemini(_) => LlmProviderType::Gemini,
            Self::Together(_) => LlmProviderType::Together,
        }
    }
}

impl LlmProvider for LlmProviderEnum {
    fn name(&self) -> &'static str {
        match self {
            Self::Gemini(c) => c.name(),
            Self::Together(c) => c.name(),
        }
    }

    fn model(&self) -> &str {
        match self {
            Self::Gemini(c) => c.model(),
            Self::Together(c) => c.model(),
        }
    }

    async fn generate(&self, request: &LlmRequest) -> Result<String, AppError> {
        match self {
            Self::Gemini(c) => c.generate(request).await,
            Self::Together(c) => c.generate(request).await,
        }
    }
}
