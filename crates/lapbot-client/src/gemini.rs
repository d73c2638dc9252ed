//! Google Gemini text-generation client.
//!
//! Calls `models/{model}:generateContent` and returns the text of the first
//! candidate. The API key travels in the `x-goog-api-key` header, never in
//! the URL, so it does not end up in logs or proxies.

use lapbot_core::config::DEFAULT_GEMINI_MODEL;
use lapbot_core::error::{AppError, LlmErrorDetails, LlmErrorKind};
use lapbot_core::traits::LlmProvider;
use lapbot_core::{HttpConfig, LlmRequest};
use reqwest::Client;
use serde::{Deserialize, Serialize};

const PROVIDER: &str = "gemini";

/// Public Generative Language API endpoint.
pub const GEMINI_BASE_URL: &str = "https://generativelanguage.googleapis.com";

/// Harm categories sent with `BLOCK_NONE`.
const SAFETY_CATEGORIES: [&str; 4] = [
    "HARM_CATEGORY_HARASSMENT",
    "HARM_CATEGORY_HATE_SPEECH",
    "HARM_CATEGORY_SEXUALLY_EXPLICIT",
    "HARM_CATEGORY_DANGEROUS_CONTENT",
];

/// HTTP client for the Gemini `generateContent` API.
///
/// # Examples
///
/// ```no_run
/// use lapbot_client::GeminiClient;
/// use lapbot_core::LlmRequest;
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let client = GeminiClient::new("your-api-key", None)?;
/// let text = client.generate_text(&LlmRequest::new("Xin chào")).await?;
/// println!("{text}");
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct GeminiClient {
    client: Client,
    api_key: String,
    model: String,
    base_url: String,
    timeout_secs: u64,
}

/// Request body for `generateContent`
#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct GenerateRequest {
    contents: Vec<Content>,
    #[serde(skip_serializing_if = "Option::is_none")]
    system_instruction: Option<Content>,
    generation_config: GenerationConfig,
    safety_settings: Vec<SafetySetting>,
}

#[derive(Serialize, Deserialize, Default)]
struct Content {
    #[serde(skip_serializing_if = "Option::is_none")]
    role: Option<String>,
    #[serde(default)]
    parts: Vec<Part>,
}

#[derive(Serialize, Deserialize)]
struct Part {
    #[serde(default)]
    text: String,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct GenerationConfig {
    temperature: f32,
    #[serde(skip_serializing_if = "Option::is_none")]
    top_p: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    top_k: Option<u32>,
    max_output_tokens: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    response_mime_type: Option<&'static str>,
}

#[derive(Serialize)]
struct SafetySetting {
    category: &'static str,
    threshold: &'static str,
}

/// Response from `generateContent`
#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct GenerateResponse {
    #[serde(default)]
    candidates: Vec<Candidate>,
    prompt_feedback: Option<PromptFeedback>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct Candidate {
    content: Option<Content>,
    finish_reason: Option<String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct PromptFeedback {
    block_reason: Option<String>,
}

/// Error response from Gemini API
#[derive(Deserialize)]
struct GeminiError {
    error: GeminiErrorDetail,
}

#[derive(Deserialize)]
struct GeminiErrorDetail {
    message: String,
    #[allow(dead_code)]
    status: Option<String>,
}

/// Classify Gemini API error based on status code and message
fn classify_gemini_error(status_code: u16, message: &str) -> LlmErrorKind {
    match status_code {
        401 | 403 => LlmErrorKind::Authentication,
        429 => {
            if message.contains("quota") || message.contains("RESOURCE_EXHAUSTED") {
                LlmErrorKind::QuotaExceeded
            } else {
                LlmErrorKind::RateLimit
            }
        }
        500..=599 => LlmErrorKind::ServerError,
        _ => {
            if message.contains("API key") || message.contains("Unauthorized") {
                LlmErrorKind::Authentication
            } else if message.contains("rate") {
                LlmErrorKind::RateLimit
            } else if message.contains("quota") {
                LlmErrorKind::QuotaExceeded
            } else {
                LlmErrorKind::Unknown
            }
        }
    }
}

impl GenerateRequest {
    fn from_request(request: &LlmRequest) -> Self {
        let options = &request.options;
        Self {
            contents: vec![Content {
                role: Some("user".to_string()),
                parts: vec![Part {
                    text: request.prompt.clone(),
                }],
            }],
            system_instruction: request.system.as_ref().map(|system| Content {
                role: None,
                parts: vec![Part {
                    text: system.clone(),
                }],
            }),
            generation_config: GenerationConfig {
                temperature: options.temperature,
                top_p: options.top_p,
                top_k: options.top_k,
                max_output_tokens: options.max_output_tokens,
                response_mime_type: options.json_output.then_some("application/json"),
            },
            safety_settings: SAFETY_CATEGORIES
                .iter()
                .map(|&category| SafetySetting {
                    category,
                    threshold: "BLOCK_NONE",
                })
                .collect(),
        }
    }
}

impl GenerateResponse {
    /// Concatenated text of the first candidate.
    fn into_text(self) -> Result<String, AppError> {
        let block_reason = self.prompt_feedback.and_then(|f| f.block_reason);
        let Some(candidate) = self.candidates.into_iter().next() else {
            let message = match block_reason {
                Some(reason) => format!("Prompt blocked: {reason}"),
                None => "No candidates returned".to_string(),
            };
            return Err(empty_output(message));
        };

        let text: String = candidate
            .content
            .map(|c| c.parts.into_iter().map(|p| p.text).collect())
            .unwrap_or_default();

        if text.trim().is_empty() {
            let reason = candidate.finish_reason.unwrap_or_else(|| "UNKNOWN".into());
            return Err(empty_output(format!("Empty candidate (finish reason {reason})")));
        }
        Ok(text)
    }
}

fn empty_output(message: String) -> AppError {
    AppError::LlmError(LlmErrorDetails::new(
        PROVIDER,
        LlmErrorKind::EmptyOutput,
        message,
        200,
    ))
}

impl GeminiClient {
    /// Creates a client for `model`, or the default model when `None`.
    pub fn new(api_key: &str, model: Option<&str>) -> Result<Self, AppError> {
        let http_config = HttpConfig::default();
        Self::with_http_config(api_key, model, &http_config)
    }

    /// Creates a client with custom HTTP settings.
    pub fn with_http_config(
        api_key: &str,
        model: Option<&str>,
        http_config: &HttpConfig,
    ) -> Result<Self, AppError> {
        if api_key.trim().is_empty() {
            return Err(AppError::ConfigError(
                "GOOGLE_API_KEY is empty".to_string(),
            ));
        }

        let client = Client::builder()
            .timeout(http_config.timeout)
            .build()
            .map_err(|e| AppError::ClientError(e.to_string()))?;

        Ok(Self {
            client,
            api_key: api_key.to_string(),
            model: model.unwrap_or(DEFAULT_GEMINI_MODEL).to_string(),
            base_url: GEMINI_BASE_URL.to_string(),
            timeout_secs: http_config.timeout.as_secs(),
        })
    }

    /// Points the client at another host, e.g. a proxy.
    pub fn with_base_url(mut self, base_url: &str) -> Self {
        self.base_url = base_url.trim_end_matches('/').to_string();
        self
    }

    fn endpoint(&self) -> String {
        format!(
            "{}/v1beta/models/{}:generateContent",
            self.base_url, self.model
        )
    }

    /// Sends one prompt and returns the generated text.
    ///
    /// # Errors
    ///
    /// Returns `AppError::LlmError` with a classified [`LlmErrorKind`] when the
    /// API rejects the call or returns no text, `AppError::Timeout` when the
    /// request exceeds the configured timeout.
    pub async fn generate_text(&self, request: &LlmRequest) -> Result<String, AppError> {
        let body = GenerateRequest::from_request(request);

        let response = self
            .client
            .post(self.endpoint())
            .header("x-goog-api-key", self.api_key.clone())
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
                        format!("Connection failed: {}", e),
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

            let message = if let Ok(gemini_error) = serde_json::from_str::<GeminiError>(&error_text)
            {
                gemini_error.error.message
            } else {
                format!("HTTP {}: {}", status_code, error_text)
            };

            let kind = classify_gemini_error(status_code, &message);
            tracing::debug!(status = status_code, ?kind, "Gemini call failed");

            return Err(AppError::LlmError(LlmErrorDetails::new(
                PROVIDER,
                kind,
                message,
                status_code,
            )));
        }

        let parsed: GenerateResponse = response
            .json()
            .await
            .map_err(|e| AppError::ClientError(format!("Failed to parse response: {}", e)))?;

        parsed.into_text()
    }
}

// =============================================================================
// Trait Implementation: LlmProvider
// =============================================================================

impl LlmProvider for GeminiClient {
    fn name(&self) -> &'static str {
        PROVIDER
    }

    fn model(&self) -> &str {
        &self.model
    }

    async fn generate(&self, request: &LlmRequest) -> Result<String, AppError> {
        self.generate_text(request).await
    }
}
