//! Configuration types for lapbot components.
//!
//! Values come from three layers, last one wins:
//! defaults → `lapbot.toml` → environment / CLI flags.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use crate::circuit_breaker::CircuitBreakerConfig;
use crate::error::AppError;

// =============================================================================
// LLM Provider Configuration
// =============================================================================

/// LLM backend used by the enrichment tasks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LlmProviderType {
    /// Google Gemini `generateContent`.
    #[default]
    Gemini,
    /// Together AI chat completions (Llama 3.3).
    #[serde(alias = "llama")]
    Together,
}

impl LlmProviderType {
    /// Suffix appended to output file stems (`filled.csv` → `filled_gemini.csv`).
    pub fn output_suffix(&self) -> &'static str {
        match self {
            Self::Gemini => "gemini",
            Self::Together => "llama",
        }
    }
}

impl fmt::Display for LlmProviderType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Gemini => write!(f, "gemini"),
            Self::Together => write!(f, "together"),
        }
    }
}

impl FromStr for LlmProviderType {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "gemini" => Ok(Self::Gemini),
            "llama" | "together" => Ok(Self::Together),
            _ => Err(AppError::ConfigError(format!(
                "Unknown LLM provider: '{}'. Valid options: gemini, llama",
                s
            ))),
        }
    }
}

/// Default Gemini model for enrichment calls.
pub const DEFAULT_GEMINI_MODEL: &str = "gemini-2.5-flash";

/// Default Together model.
pub const DEFAULT_TOGETHER_MODEL: &str = "meta-llama/Llama-3.3-70B-Instruct-Turbo-Free";

// =============================================================================
// HTTP / Retry / Enrichment
// =============================================================================

/// HTTP client configuration for external API calls.
#[derive(Debug, Clone)]
pub struct HttpConfig {
    pub timeout: Duration,
    pub max_retries: u32,
    pub retry_base_delay: Duration,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            max_retries: 3,
            retry_base_delay: Duration::from_millis(500),
        }
    }
}

/// Retry schedule for a single LLM call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts per item, including the first one.
    pub max_attempts: u32,
    pub base_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_secs(2),
        }
    }
}

impl RetryPolicy {
    /// Delay before the attempt following `attempt` (0-based).
    ///
    /// Linear backoff: `base * (attempt + 1)`, with one extra step for
    /// rate limits.
    ///
    /// ```
    /// use std::time::Duration;
    /// use lapbot_core::RetryPolicy;
    ///
    /// let policy = RetryPolicy::default();
    /// assert_eq!(policy.delay_for(0, false), Duration::from_secs(2));
    /// assert_eq!(policy.delay_for(0, true), Duration::from_secs(4));
    /// assert_eq!(policy.delay_for(1, true), Duration::from_secs(6));
    /// ```
    pub fn delay_for(&self, attempt: u32, rate_limited: bool) -> Duration {
        let steps = if rate_limited { attempt + 2 } else { attempt + 1 };
        self.base_delay * steps
    }
}

/// Settings for [`crate::pipeline::EnrichPipeline`].
#[derive(Debug, Clone)]
pub struct EnrichConfig {
    /// Items in flight at the same time.
    pub concurrency: usize,
    /// Upper bound on call starts per minute across all workers.
    pub requests_per_minute: u32,
    /// Results buffered before they are appended to the output file.
    pub checkpoint_batch_size: usize,
    pub retry: RetryPolicy,
    pub circuit_breaker: CircuitBreakerConfig,
}

impl Default for EnrichConfig {
    fn default() -> Self {
        Self {
            concurrency: 2,
            requests_per_minute: 15,
            checkpoint_batch_size: 20,
            retry: RetryPolicy::default(),
            circuit_breaker: CircuitBreakerConfig::default(),
        }
    }
}

impl EnrichConfig {
    /// Defaults overridden by `LLM_CONCURRENCY`, `LLM_REQUESTS_PER_MINUTE`
    /// and the `CB_*` circuit breaker variables.
    pub fn from_env() -> Self {
        let mut config = Self {
            circuit_breaker: CircuitBreakerConfig::from_env(),
            ..Self::default()
        };
        if let Some(n) = std::env::var("LLM_CONCURRENCY")
            .ok()
            .and_then(|v| v.parse().ok())
        {
            config = config.with_concurrency(n);
        }
        if let Some(rpm) = std::env::var("LLM_REQUESTS_PER_MINUTE")
            .ok()
            .and_then(|v| v.parse().ok())
        {
            config = config.with_requests_per_minute(rpm);
        }
        config
    }

    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency.max(1);
        self
    }

    /// `0` disables spacing between calls.
    pub fn with_requests_per_minute(mut self, rpm: u32) -> Self {
        self.requests_per_minute = rpm;
        self
    }

    pub fn with_checkpoint_batch_size(mut self, size: usize) -> Self {
        self.checkpoint_batch_size = size.max(1);
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_circuit_breaker(mut self, config: CircuitBreakerConfig) -> Self {
        self.circuit_breaker = config;
        self
    }

    /// Minimum gap between two call starts.
    pub fn call_spacing(&self) -> Duration {
        if self.requests_per_minute == 0 {
            Duration::ZERO
        } else {
            Duration::from_secs(60) / self.requests_per_minute
        }
    }
}

// =============================================================================
// Crawling
// =============================================================================

/// Product page prefixes accepted by the variant crawler.
pub const DEFAULT_VALID_URL_PREFIXES: &[&str] = &["https://cellphones.com.vn/"];

/// Settings for [`crate::crawl::CrawlService`].
#[derive(Debug, Clone)]
pub struct CrawlConfig {
    /// Pages fetched in parallel by the variant crawler.
    pub concurrency: usize,
    /// Pause after each product page fetch.
    pub page_delay: Duration,
    /// Pause between comment pages.
    pub comment_page_delay: Duration,
    /// Retries of the same comment page after a timeout.
    pub max_page_retries: u32,
    /// Product ids per details query.
    pub detail_batch_size: usize,
    /// Rows buffered before an append.
    pub write_batch_size: usize,
    pub valid_url_prefixes: Vec<String>,
}

impl Default for CrawlConfig {
    fn default() -> Self {
        Self {
            concurrency: 2,
            page_delay: Duration::from_secs(2),
            comment_page_delay: Duration::from_millis(500),
            max_page_retries: 3,
            detail_batch_size: 50,
            write_batch_size: 20,
            valid_url_prefixes: DEFAULT_VALID_URL_PREFIXES
                .iter()
                .map(|s| s.to_string())
                .collect(),
        }
    }
}

impl CrawlConfig {
    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency.max(1);
        self
    }

    pub fn with_page_delay(mut self, delay: Duration) -> Self {
        self.page_delay = delay;
        self
    }

    pub fn with_comment_page_delay(mut self, delay: Duration) -> Self {
        self.comment_page_delay = delay;
        self
    }
}

// =============================================================================
// Config file (lapbot.toml)
// =============================================================================

/// Contents of `lapbot.toml`. Every table and key is optional.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct FileConfig {
    #[serde(default)]
    pub llm: LlmSection,
    #[serde(default)]
    pub enrich: EnrichSection,
    #[serde(default)]
    pub crawl: CrawlSection,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct LlmSection {
    pub provider: Option<LlmProviderType>,
    pub gemini_model: Option<String>,
    pub together_model: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct EnrichSection {
    pub concurrency: Option<usize>,
    pub requests_per_minute: Option<u32>,
    pub checkpoint_batch_size: Option<usize>,
    pub max_attempts: Option<u32>,
    pub retry_base_delay_ms: Option<u64>,
}

impl EnrichSection {
    /// Overlays the values present in the file onto `config`.
    pub fn apply(&self, mut config: EnrichConfig) -> EnrichConfig {
        if let Some(n) = self.concurrency {
            config = config.with_concurrency(n);
        }
        if let Some(rpm) = self.requests_per_minute {
            config = config.with_requests_per_minute(rpm);
        }
        if let Some(size) = self.checkpoint_batch_size {
            config = config.with_checkpoint_batch_size(size);
        }
        if let Some(attempts) = self.max_attempts {
            config.retry.max_attempts = attempts.max(1);
        }
        if let Some(ms) = self.retry_base_delay_ms {
            config.retry.base_delay = Duration::from_millis(ms);
        }
        config
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct CrawlSection {
    #[serde(default = "default_valid_url_prefixes")]
    pub valid_url_prefixes: Vec<String>,
    /// Listing pages scanned by `crawl urls`.
    #[serde(default)]
    pub listing_urls: Vec<String>,
    /// Listing read by `crawl tgdd`.
    pub tgdd_listing_url: Option<String>,
    #[serde(default = "default_page_delay_ms")]
    pub page_delay_ms: u64,
    #[serde(default = "default_crawl_concurrency")]
    pub concurrency: usize,
}

fn default_valid_url_prefixes() -> Vec<String> {
    DEFAULT_VALID_URL_PREFIXES
        .iter()
        .map(|s| s.to_string())
        .collect()
}

fn default_page_delay_ms() -> u64 {
    2000
}

fn default_crawl_concurrency() -> usize {
    2
}

impl Default for CrawlSection {
    fn default() -> Self {
        Self {
            valid_url_prefixes: default_valid_url_prefixes(),
            listing_urls: Vec::new(),
            tgdd_listing_url: None,
            page_delay_ms: default_page_delay_ms(),
            concurrency: default_crawl_concurrency(),
        }
    }
}

impl CrawlSection {
    pub fn to_crawl_config(&self) -> CrawlConfig {
        CrawlConfig {
            valid_url_prefixes: self.valid_url_prefixes.clone(),
            ..CrawlConfig::default()
        }
        .with_concurrency(self.concurrency)
        .with_page_delay(Duration::from_millis(self.page_delay_ms))
    }
}

pub const CONFIG_FILE_NAME: &str = "lapbot.toml";

/// `~/.config/lapbot` on Linux, the platform equivalent elsewhere.
pub fn default_config_dir() -> Option<PathBuf> {
    dirs::config_dir().map(|p| p.join("lapbot"))
}

pub fn default_config_path() -> Option<PathBuf> {
    default_config_dir().map(|p| p.join(CONFIG_FILE_NAME))
}

const DEFAULT_CONFIG_TEMPLATE: &str = r#"# lapbot configuration
# Command-line flags and environment variables take precedence.

[llm]
# provider = "gemini"      # or "llama"
# gemini_model = "gemini-2.5-flash"

[enrich]
concurrency = 2
requests_per_minute = 15
checkpoint_batch_size = 20
# max_attempts = 3
# retry_base_delay_ms = 2000

[crawl]
valid_url_prefixes = ["https://cellphones.com.vn/"]
listing_urls = ["https://cellphones.com.vn/laptop.html"]
# tgdd_listing_url = "https://www.thegioididong.com/laptop?c=44&o=13"
page_delay_ms = 2000
concurrency = 2
"#;

/// Loads `lapbot.toml`.
///
/// With no explicit path the default location is used and a commented
/// template is created there on first use; a missing default file is not
/// an error. An explicit path that does not exist is.
pub fn load_config(path: Option<PathBuf>) -> Result<Option<FileConfig>, AppError> {
    let using_default_path = path.is_none();
    let config_path = match path.or_else(default_config_path) {
        Some(p) => p,
        None => return Ok(None),
    };

    if !config_path.exists() {
        if !using_default_path {
            return Err(AppError::ConfigError(format!(
                "Config file not found: {}",
                config_path.display()
            )));
        }
        if let Err(e) = create_default_config(&config_path) {
            tracing::warn!(error = %e, "Could not create default config template");
            return Ok(None);
        }
    }

    let content = std::fs::read_to_string(&config_path).map_err(|e| {
        AppError::ConfigError(format!(
            "Failed to read config file '{}': {}",
            config_path.display(),
            e
        ))
    })?;

    let config: FileConfig = toml::from_str(&content).map_err(|e| {
        AppError::ConfigError(format!(
            "Invalid TOML in '{}': {}",
            config_path.display(),
            e
        ))
    })?;

    Ok(Some(config))
}

fn create_default_config(path: &Path) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(path, DEFAULT_CONFIG_TEMPLATE)?;
    tracing::info!(path = %path.display(), "Created default config template");
    Ok(())
}
