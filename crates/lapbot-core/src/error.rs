use thiserror::Error;

/// Category of a failed LLM API call.
///
/// Both Gemini and Together failures are folded into these kinds so the
/// retry loop and the circuit breaker can treat providers uniformly.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LlmErrorKind {
    /// Authentication failure (401/403, invalid API key)
    Authentication,
    /// Rate limit exceeded (429)
    RateLimit,
    /// Quota or credits exhausted
    QuotaExceeded,
    /// Server error (5xx)
    ServerError,
    /// Network/connection error
    NetworkError,
    /// The model answered but produced no text (blocked or empty candidates)
    EmptyOutput,
    /// Unknown or unclassified error
    Unknown,
}

/// Structured error details from an LLM provider.
#[derive(Debug, Clone)]
pub struct LlmErrorDetails {
    /// Provider name (`gemini`, `together`).
    pub provider: &'static str,
    pub kind: LlmErrorKind,
    /// Message returned by the API, or a local description.
    pub message: String,
    /// HTTP status code, 0 when no response was received.
    pub status_code: u16,
}

impl LlmErrorDetails {
    pub fn new(
        provider: &'static str,
        kind: LlmErrorKind,
        message: impl Into<String>,
        status_code: u16,
    ) -> Self {
        Self {
            provider,
            kind,
            message: message.into(),
            status_code,
        }
    }

    /// Returns true for failures that resolve by waiting.
    pub fn is_transient(&self) -> bool {
        matches!(
            self.kind,
            LlmErrorKind::RateLimit
                | LlmErrorKind::ServerError
                | LlmErrorKind::NetworkError
                | LlmErrorKind::EmptyOutput
        )
    }
}

impl std::fmt::Display for LlmErrorDetails {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} API error (HTTP {}): {}",
            self.provider, self.status_code, self.message
        )
    }
}

/// Application-wide error type.
///
/// Library errors convert automatically through `#[from]`:
/// - `serde_json::Error` → `AppError::SerializationError`
/// - `csv::Error` → `AppError::CsvError`
/// - `std::io::Error` → `AppError::IoError`
///
/// # Examples
///
/// ```
/// use lapbot_core::error::AppError;
///
/// fn example() -> Result<(), AppError> {
///     Err(AppError::MissingColumn("content".to_string()))
/// }
/// assert!(example().is_err());
/// ```
#[derive(Error, Debug)]
pub enum AppError {
    /// HTTP request failed for a reason other than connectivity or timeout.
    #[error("API Client error: {0}")]
    ClientError(String),

    /// An LLM provider rejected or failed the call.
    #[error("LLM error: {0}")]
    LlmError(LlmErrorDetails),

    /// JSON serialization or deserialization failed.
    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    /// Reading or writing a CSV file failed.
    #[error("CSV error: {0}")]
    CsvError(#[from] csv::Error),

    /// Filesystem operation failed.
    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Invalid URL: {0}")]
    InvalidUrl(String),

    /// API answered successfully but without usable data.
    #[error("Empty response from API")]
    EmptyResponse,

    /// LLM output was valid JSON but did not have the expected shape.
    #[error("Malformed LLM response: {0}")]
    MalformedResponse(String),

    /// An HTML page lacks an element the crawler depends on.
    #[error("Unexpected page layout: {0}")]
    PageLayout(String),

    /// A required column is absent from the input dataset.
    #[error("Missing column: {0}")]
    MissingColumn(String),

    /// GraphQL endpoint returned an `errors` array.
    #[error("GraphQL error: {0}")]
    GraphQlError(String),

    #[error("Network error: {0}")]
    NetworkError(String),

    #[error("Request timed out after {0} seconds")]
    Timeout(u64),

    #[error("Rate limit exceeded. Please wait and try again.")]
    RateLimitExceeded,

    /// A provider call was refused because its circuit breaker is open.
    #[error("Circuit breaker '{0}' is open")]
    CircuitOpen(String),

    /// Configuration file or environment error.
    #[error("Configuration error: {0}")]
    ConfigError(String),

    /// Fallback for cases not covered above. Prefer a specific variant.
    #[error("Error: {0}")]
    Generic(String),
}

impl AppError {
    /// Returns a user-friendly error message suitable for CLI output.
    pub fn user_message(&self) -> String {
        match self {
            AppError::ClientError(msg) => {
                if msg.contains("timeout") || msg.contains("timed out") {
                    "Request timed out. The remote site may be slow or unreachable.\n   Try again later.".to_string()
                } else if msg.contains("connect") {
                    format!(
                        "Cannot connect: {}\n   Check your internet connection.",
                        msg
                    )
                } else {
                    format!("API error: {}", msg)
                }
            }
            AppError::LlmError(details) => match details.kind {
                LlmErrorKind::Authentication => match details.provider {
                    "together" => "Invalid Together API key.\n   Check your TOGETHER_API_KEY environment variable.".to_string(),
                    _ => "Invalid Gemini API key.\n   Check your GOOGLE_API_KEY environment variable.".to_string(),
                },
                LlmErrorKind::RateLimit => format!(
                    "{} rate limit reached.\n   Lower --rpm or --concurrency and resume; finished rows are kept.",
                    details.provider
                ),
                LlmErrorKind::QuotaExceeded => format!(
                    "{} quota exceeded.\n   Check the billing of your account.",
                    details.provider
                ),
                LlmErrorKind::ServerError => format!(
                    "{} server error (HTTP {}).\n   Please try again later.",
                    details.provider, details.status_code
                ),
                LlmErrorKind::NetworkError => format!(
                    "Network error connecting to {}: {}\n   Check your internet connection.",
                    details.provider, details.message
                ),
                LlmErrorKind::EmptyOutput => format!(
                    "{} returned no text. The prompt may have been blocked.",
                    details.provider
                ),
                LlmErrorKind::Unknown => format!("{} error: {}", details.provider, details.message),
            },
            AppError::MissingColumn(column) => format!(
                "Column '{}' not found in the input file.\n   Check the header row or pass the column name explicitly.",
                column
            ),
            AppError::CsvError(e) => format!("Cannot read or write CSV: {}", e),
            AppError::IoError(e) => format!("File error: {}", e),
            AppError::NetworkError(msg) => {
                format!("Network error: {}\n   Check your internet connection.", msg)
            }
            AppError::Timeout(secs) => format!(
                "Request timed out after {} seconds.\n   The server may be overloaded. Try again later.",
                secs
            ),
            AppError::RateLimitExceeded => {
                "Too many requests. Please wait a moment and try again.".to_string()
            }
            AppError::EmptyResponse => {
                "The API returned no data. The service may be temporarily unavailable.".to_string()
            }
            AppError::ConfigError(msg) => format!(
                "Configuration error: {}\n   Check your .env or lapbot.toml.",
                msg
            ),
            _ => self.to_string(),
        }
    }

    /// Returns true if the failed operation may succeed when repeated.
    ///
    /// # Examples
    ///
    /// ```
    /// use lapbot_core::error::AppError;
    ///
    /// assert!(AppError::Timeout(30).is_retryable());
    /// assert!(AppError::RateLimitExceeded.is_retryable());
    /// assert!(!AppError::MalformedResponse("missing keys".into()).is_retryable());
    /// ```
    pub fn is_retryable(&self) -> bool {
        match self {
            AppError::NetworkError(_)
            | AppError::Timeout(_)
            | AppError::RateLimitExceeded
            | AppError::EmptyResponse
            | AppError::ClientError(_) => true,
            AppError::LlmError(details) => details.is_transient(),
            _ => false,
        }
    }

    /// Returns true if the remote call itself failed, as opposed to a local
    /// file problem or an answer that was rejected after arriving.
    pub fn is_call_failure(&self) -> bool {
        matches!(
            self,
            AppError::LlmError(_)
                | AppError::NetworkError(_)
                | AppError::Timeout(_)
                | AppError::RateLimitExceeded
                | AppError::ClientError(_)
                | AppError::EmptyResponse
                | AppError::CircuitOpen(_)
        )
    }

    /// Returns true if this is a rate-limit signal from any source.
    pub fn is_rate_limit(&self) -> bool {
        match self {
            AppError::RateLimitExceeded => true,
            AppError::LlmError(details) => details.kind == LlmErrorKind::RateLimit,
            _ => false,
        }
    }

    /// Returns true if this error should count against the circuit breaker.
    ///
    /// Only service-side trouble trips the circuit. Bad keys, exhausted
    /// quota and malformed model output are not fixed by waiting.
    ///
    /// # Examples
    ///
    /// ```
    /// use lapbot_core::error::{AppError, LlmErrorDetails, LlmErrorKind};
    ///
    /// let err = AppError::NetworkError("connection reset".to_string());
    /// assert!(err.should_trip_circuit());
    ///
    /// let err = AppError::LlmError(LlmErrorDetails::new(
    ///     "gemini",
    ///     LlmErrorKind::Authentication,
    ///     "API key not valid",
    ///     400,
    /// ));
    /// assert!(!err.should_trip_circuit());
    /// ```
    pub fn should_trip_circuit(&self) -> bool {
        match self {
            AppError::NetworkError(_) | AppError::Timeout(_) | AppError::RateLimitExceeded => true,

            AppError::ClientError(msg) => {
                msg.contains("timeout")
                    || msg.contains("timed out")
                    || msg.contains("connect")
                    || msg.contains("connection")
            }

            // An empty candidate list is a content decision, not an outage
            AppError::LlmError(details) => matches!(
                details.kind,
                LlmErrorKind::RateLimit | LlmErrorKind::NetworkError | LlmErrorKind::ServerError
            ),

            AppError::SerializationError(_)
            | AppError::CsvError(_)
            | AppError::IoError(_)
            | AppError::InvalidUrl(_)
            | AppError::EmptyResponse
            | AppError::MalformedResponse(_)
            | AppError::PageLayout(_)
            | AppError::MissingColumn(_)
            | AppError::GraphQlError(_)
            | AppError::ConfigError(_)
            | AppError::CircuitOpen(_)
            | AppError::Generic(_) => false,
        }
    }
}
