//! Together AI chat-completions client.
//!
//! Together exposes an OpenAI-compatible `/v1/chat/completions` endpoint.
//! It is used to run Llama 3.3 as an alternative to Gemini.
//!
//! # Examples
//!
//! ```no_run
//! use lapbot_client::TogetherClient;
//! use lapbot_core::LlmRequest;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let client = TogetherClient::new("your-api-key", None)?;
//! let text = client.chat(&LlmRequest::new("Xin chào")).await?;
//! # Ok(())
//! # }
//! ```

use lapbot_core::config::DEFAULT_TOGETHER_MODEL;
use lapbot_core::error::{AppError, LlmErrorDetails, LlmErrorKind};
use lapbot_core::traits::LlmProvider;
use lapbot_core::{HttpConfig, LlmRequest};
use reqwest::Client;
use serde::{Deserialize, Serialize};

const PROVIDER: &str = "together";

/// Default chat completions endpoint.
pub const TOGETHER_ENDPOINT: &str = "https://api.together.xyz/v1/chat/completions";

/// HTTP client for Together's chat completions API.
#[derive(Clone)]
pub struct TogetherClient {
    client: Client,
    api_key: String,
    model: String,
    endpoint: String,
    timeout_secs: u64,
}

/// Request body for chat completions
#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<Message<'a>>,
    temperature: f32,
    #[serde(skip_serializing_if = "Option::is_none")]
    top_p: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    top_k: Option<u32>,
    max_tokens: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    response_format: Option<ResponseFormat>,
}

#[derive(Serialize)]
struct Message<'a> {
    role: &'static str,
    content: &'a str,
}

#[derive(Serialize)]
struct ResponseFormat {
    #[serde(rename = "type")]
    format_type: &'static str,
}

/// Response from chat completions
#[derive(Deserialize)]
struct ChatResponse {
    #[serde(default)]
    choices: Vec<Choice>,
}

#[derive(Deserialize)]
struct Choice {
    message: ChoiceMessage,
    #[allow(dead_code)]
    finish_reason: Option<String>,
}

#[derive(Deserialize)]
struct ChoiceMessage {
    content: Option<String>,
}

/// Error response from Together API
#[derive(Deserialize)]
struct TogetherError {
    error: TogetherErrorDetail,
}

#[derive(Deserialize)]
struct TogetherErrorDetail {
    message: String,
    #[serde(rename = "type")]
    #[allow(dead_code)]
    error_type: Option<String>,
}

/// Classify Together API error based on status code and message
fn classify_together_error(status_code: u16, message: &str) -> LlmErrorKind {
    match status_code {
        401 | 403 => LlmErrorKind::Authentication,
        402 => LlmErrorKind::QuotaExceeded,
        429 => {
            if message.contains("credit") || message.contains("quota") {
                LlmErrorKind::QuotaExceeded
            } else {
                LlmErrorKind::RateLimit
            }
        }
        500..=599 => LlmErrorKind::ServerError,
        _ => {
            if message.contains("API key") || message.contains("Unauthorized") {
                LlmErrorKind::Authentication
            } else if message.contains("rate limit") {
                LlmErrorKind::RateLimit
            } else {
                LlmErrorKind::Unknown
            }
        }
    }
}

impl<'a> ChatRequest<'a> {
    fn new(model: &'a str, request: &'a LlmRequest) -> Self {
        let mut messages = Vec::with_capacity(2);
        if let Some(system) = &request.system {
            messages.push(Message {
                role: "system",
                content: system,
            });
        }
        messages.push(Message {
            role: "user",
            content: &request.prompt,
        });

        let options = &request.options;
        Self {
            model,
            messages,
            temperature: options.temperature,
            top_p: options.top_p,
            top_k: options.top_k,
            max_tokens: options.max_output_tokens,
            response_format: options.json_output.then_some(ResponseFormat {
                format_type: "json_object",
            }),
        }
    }
}

impl ChatResponse {
    fn into_text(self) -> Result<String, AppError> {
        let text = self
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .unwrap_or_default();

        if text.trim().is_empty() {
            return Err(AppError::LlmError(LlmErrorDetails::new(
                PROVIDER,
                LlmErrorKind::EmptyOutput,
                "No completion text returned",
                200,
            )));
        }
        Ok(text)
    }
}

impl TogetherClient {
    /// Creates a client for `model`, or the default Llama model when `None`.
    pub fn new(api_key: &str, model: Option<&str>) -> Result<Self, AppError> {
        Self::with_config(api_key, model, None)
    }

    /// Creates a client with a custom endpoint.
    pub fn with_config(
        api_key: &str,
        model: Option<&str>,
        endpoint: Option<&str>,
    ) -> Result<Self, AppError> {
        if api_key.trim().is_empty() {
            return Err(AppError::ConfigError(
                "TOGETHER_API_KEY is empty".to_string(),
            ));
        }

        let http_config = HttpConfig::default();
        let client = Client::builder()
            .timeout(http_config.timeout)
            .build()
            .map_err(|e| AppError::ClientError(e.to_string()))?;

        Ok(Self {
            client,
            api_key: api_key.to_string(),
            model: model.unwrap_or(DEFAULT_TOGETHER_MODEL).to_string(),
            endpoint: endpoint.unwrap_or(TOGETHER_ENDPOINT).to_string(),
            timeout_secs: http_config.timeout.as_secs(),
        })
    }

    /// Sends one chat turn and returns the assistant message.
    pub async fn chat(&self, request: &LlmRequest) -> Result<String, AppError> {
        let body = ChatRequest::new(&self.model, request);

        let response = self
            .client
            .post(&self.endpoint)
            .header("Authorization", format!("Bearer {}", self.api_key))
            .header("Content-Type", "application/json")
            .json(&body)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    AppError::Timeout(self.timeout_secs)
                } else if e.is_connect() {
                    AppError::LlmError(LlmErrorDetails::new(
                        PROVIDER,
                        LlmErrorKind::NetworkError,
                        format!("Cannot connect to Together: {}", e),
                        0,
                    ))
                } else {
                    AppError::ClientError(e.to_string())
                }
            })?;

        let status = response.status();

        if !status.is_success() {
            let status_code = status.as_u16();
            let error_text = response.text().await.unwrap_or_default();

            let message = match serde_json::from_str::<TogetherError>(&error_text) {
                Ok(err) => err.error.message,
                Err(_) => format!("HTTP {}: {}", status_code, error_text),
            };

            let kind = classify_together_error(status_code, &message);
            tracing::debug!(status = status_code, ?kind, "Together call failed");

            return Err(AppError::LlmError(LlmErrorDetails::new(
                PROVIDER,
                kind,
                message,
                status_code,
            )));
        }

        let parsed: ChatResponse = response
            .json()
            .await
            .map_err(|e| AppError::ClientError(format!("Failed to parse response: {}", e)))?;

        parsed.into_text()
    }
}

impl LlmProvider for TogetherClient {
    fn name(&self) -> &'static str {
        PROVIDER
    }

    fn model(&self) -> &str {
        &self.model
    }

    async fn generate(&self, request: &LlmRequest) -> Result<String, AppError> {
        self.chat(request).await
    }
}
