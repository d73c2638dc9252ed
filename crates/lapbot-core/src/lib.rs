//! lapbot Core - Domain types, enrichment engine and crawl orchestration.
//!
//! This crate provides the core functionality for lapbot, including:
//!
//! - **Enrichment engine**: [`EnrichPipeline`] runs any [`EnrichTask`] with a
//!   rate limit, bounded concurrency, retries, a circuit breaker and
//!   batched, resumable output
//! - **Tasks**: [`FillMissingTask`], [`IntentTask`], [`QuestionGenTask`]
//! - **Services**: [`EnrichService`] for the enrichment commands,
//!   [`CrawlService`] for the catalog crawls, [`TgddCrawler`] for the
//!   thegioididong page-source crawl
//! - **Data shaping**: CSV I/O in [`table`], record flattening in [`flatten`],
//!   HTML parsing in [`variants`]
//! - **Traits**: [`LlmProvider`], [`CatalogSource`], [`PageSource`] for dependency
//!   injection
//! - **Progress reporting**: [`ProgressReporter`] trait for decoupled logging/UI
//!
//! # Architecture
//!
//! Core performs no network I/O. LLM APIs and the product catalog are
//! reached through traits implemented in `lapbot-client`:
//!
//! - [`LlmProvider`] - text generation (Gemini, Together)
//! - [`CatalogSource`] - catalog GraphQL/REST endpoints
//! - [`PageSource`] - HTML pages
//!
//! # Example
//!
//! ```ignore
//! use lapbot_core::{EnrichConfig, EnrichService, TracingReporter};
//! use tokio_util::sync::CancellationToken;
//!
//! let service = EnrichService::new(provider, EnrichConfig::from_env());
//! let result = service
//!     .classify_intents(input, output, "content", &TracingReporter, CancellationToken::new())
//!     .await?;
//! println!("{} classified", result.stats.succeeded);
//! ```

pub mod checkpoint;
pub mod circuit_breaker;
pub mod cleaning;
pub mod config;
pub mod crawl;
pub mod enrich;
pub mod error;
pub mod fill_missing;
pub mod flatten;
pub mod intent;
pub mod json;
pub mod models;
pub mod pipeline;
pub mod progress;
pub mod question_gen;
pub mod rate_limit;
pub mod stats;
pub mod table;
pub mod tgdd;
pub mod traits;
pub mod variants;

// Circuit breaker
pub use circuit_breaker::{
    CircuitBreaker, CircuitBreakerConfig, CircuitBreakerError, CircuitBreakerStats, CircuitState,
};

// Configuration
pub use config::{
    CrawlConfig, EnrichConfig, FileConfig, HttpConfig, LlmProviderType, RetryPolicy,
    default_config_path, load_config,
};

// Error handling
pub use error::{AppError, LlmErrorDetails, LlmErrorKind};

// Domain models
pub use models::{GenerationOptions, LlmRequest, QaRecord, VariantRecord};

// Statistics
pub use stats::{CrawlStats, EnrichOutcome, EnrichResult, EnrichStats, EnrichStatus};

// Progress reporting
pub use progress::{CrawlEvent, PipelineEvent, ProgressReporter, SilentReporter, TracingReporter};

// Traits for dependency injection
pub use traits::{CatalogSource, LlmProvider, PageSource};

// Engine
pub use checkpoint::Checkpoint;
pub use pipeline::{CsvSink, EnrichPipeline, EnrichTask, ResultSink};
pub use rate_limit::RateLimiter;

// Tasks
pub use fill_missing::{FillMissingTask, FillRecord};
pub use intent::{IntentRecord, IntentTask};
pub use question_gen::{GeneratedQuestion, QuestionGenTask};

// Data shaping
pub use cleaning::{MissingColumn, missing_report};
pub use table::{Record, Table, ToRecord};

// Services (generic over trait implementations)
pub use crawl::CrawlService;
pub use tgdd::{StatusLog, TgddCrawler};
pub use enrich::{EnrichService, FillSummary, GenerationPlan, GenerationSummary};
