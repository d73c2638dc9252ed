//! Test utilities and mock implementations for integration tests.
//!
//! Provides in-memory implementations of [`LlmProvider`] and
//! [`CatalogSource`] so the services can be tested without network access.

use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use lapbot_core::traits::{CatalogSource, LlmProvider, PageSource};
use lapbot_core::{
    AppError, CircuitBreakerConfig, EnrichConfig, LlmRequest, PipelineEvent, ProgressReporter,
    RetryPolicy,
};
use serde_json::Value;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

// =============================================================================
// MockLlmProvider
// =============================================================================

type Responder = dyn Fn(&LlmRequest, usize) -> Result<String, AppError> + Send + Sync;

/// LLM provider answering through a closure.
///
/// The closure receives the request and the 0-based index of the call, so
/// tests can fail the first attempts and succeed later.
#[derive(Clone)]
pub struct MockLlmProvider {
    responder: Arc<Responder>,
    calls: Arc<AtomicUsize>,
    prompts: Arc<Mutex<Vec<String>>>,
    call_times: Arc<Mutex<Vec<Instant>>>,
    delay: Duration,
}

impl MockLlmProvider {
    pub fn new<F>(responder: F) -> Self
    where
        F: Fn(&LlmRequest, usize) -> Result<String, AppError> + Send + Sync + 'static,
    {
        Self {
            responder: Arc::new(responder),
            calls: Arc::new(AtomicUsize::new(0)),
            prompts: Arc::new(Mutex::new(Vec::new())),
            call_times: Arc::new(Mutex::new(Vec::new())),
            delay: Duration::ZERO,
        }
    }

    /// Returns the same text for every call.
    pub fn always(text: &str) -> Self {
        let text = text.to_string();
        Self::new(move |_, _| Ok(text.clone()))
    }

    /// Sleeps before answering, to simulate a slow API.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn prompts(&self) -> Vec<String> {
        self.prompts.lock().unwrap().clone()
    }

    /// Tokio instants at which each call started.
    pub fn call_times(&self) -> Vec<Instant> {
        self.call_times.lock().unwrap().clone()
    }
}

impl LlmProvider for MockLlmProvider {
    fn name(&self) -> &'static str {
        "mock"
    }

    fn model(&self) -> &str {
        "mock-model"
    }

    async fn generate(&self, request: &LlmRequest) -> Result<String, AppError> {
        let index = self.calls.fetch_add(1, Ordering::SeqCst);
        self.call_times.lock().unwrap().push(Instant::now());
        self.prompts.lock().unwrap().push(request.prompt.clone());
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        (self.responder)(request, index)
    }
}

/// Pipeline settings without rate limiting and with millisecond backoff.
pub fn fast_config() -> EnrichConfig {
    EnrichConfig::default()
        .with_requests_per_minute(0)
        .with_retry(RetryPolicy {
            max_attempts: 3,
            base_delay: Duration::from_millis(1),
        })
        .with_circuit_breaker(CircuitBreakerConfig {
            failure_threshold: 100,
            ..CircuitBreakerConfig::default()
        })
}

// =============================================================================
// RecordingReporter
// =============================================================================

/// Keeps pipeline events as short labels, plus the waits of open circuits.
#[derive(Clone, Default)]
pub struct RecordingReporter {
    events: Arc<Mutex<Vec<&'static str>>>,
    circuit_waits: Arc<Mutex<Vec<Duration>>>,
}

impl RecordingReporter {
    pub fn events(&self) -> Vec<&'static str> {
        self.events.lock().unwrap().clone()
    }

    pub fn count(&self, label: &str) -> usize {
        self.events().iter().filter(|e| **e == label).count()
    }

    pub fn circuit_waits(&self) -> Vec<Duration> {
        self.circuit_waits.lock().unwrap().clone()
    }
}

impl ProgressReporter for RecordingReporter {
    fn report(&self, event: PipelineEvent<'_>) {
        let label = match event {
            PipelineEvent::Started { .. } => "started",
            PipelineEvent::ItemFinished { .. } => "item_finished",
            PipelineEvent::RetryScheduled { .. } => "retry_scheduled",
            PipelineEvent::CircuitOpen { retry_after, .. } => {
                self.circuit_waits.lock().unwrap().push(retry_after);
                "circuit_open"
            }
            PipelineEvent::BatchFlushed { .. } => "batch_flushed",
            PipelineEvent::Finished { .. } => "finished",
        };
        self.events.lock().unwrap().push(label);
    }
}

// =============================================================================
// MockCatalogSource
// =============================================================================

/// Catalog backed by fixed JSON and HTML fixtures.
#[derive(Clone, Default)]
pub struct MockCatalogSource {
    pub products: Vec<Value>,
    /// Comment pages, page 1 first. Pages past the end are empty.
    pub comment_pages: Vec<Vec<Value>>,
    /// Timeouts to return for a page before it succeeds.
    pub comment_timeouts: Arc<Mutex<HashMap<u32, u32>>>,
    pub recommendations: HashMap<String, Vec<String>>,
    pub details: HashMap<String, Value>,
    /// Failures to return for a detail batch containing the id.
    pub detail_failures: Arc<Mutex<HashMap<String, u32>>>,
    /// Cancelled once a detail batch has been served.
    pub cancel_after_details: Option<CancellationToken>,
    /// HTML by url; unknown urls fail with a network error.
    pub pages: HashMap<String, String>,
    pub comment_requests: Arc<Mutex<Vec<u32>>>,
    pub page_requests: Arc<Mutex<Vec<String>>>,
}

impl MockCatalogSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_comment_timeouts(self, page: u32, count: u32) -> Self {
        self.comment_timeouts.lock().unwrap().insert(page, count);
        self
    }

    pub fn with_detail_failures(self, id: &str, count: u32) -> Self {
        self.detail_failures
            .lock()
            .unwrap()
            .insert(id.to_string(), count);
        self
    }
}

impl CatalogSource for MockCatalogSource {
    async fn fetch_products(&self) -> Result<Vec<Value>, AppError> {
        Ok(self.products.clone())
    }

    async fn fetch_comment_page(&self, page: u32) -> Result<Vec<Value>, AppError> {
        self.comment_requests.lock().unwrap().push(page);
        {
            let mut timeouts = self.comment_timeouts.lock().unwrap();
            if let Some(left) = timeouts.get_mut(&page) {
                if *left > 0 {
                    *left -= 1;
                    return Err(AppError::Timeout(30));
                }
            }
        }
        Ok(self
            .comment_pages
            .get(page as usize - 1)
            .cloned()
            .unwrap_or_default())
    }

    async fn fetch_recommendations(&self, product_id: &str) -> Result<Vec<String>, AppError> {
        self.recommendations
            .get(product_id)
            .cloned()
            .ok_or_else(|| AppError::NetworkError(format!("no recommendations for {product_id}")))
    }

    async fn fetch_products_by_ids(&self, ids: &[String]) -> Result<Vec<Value>, AppError> {
        {
            let mut failures = self.detail_failures.lock().unwrap();
            for id in ids {
                if let Some(left) = failures.get_mut(id) {
                    if *left > 0 {
                        *left -= 1;
                        return Err(AppError::NetworkError(format!("details of {id} failed")));
                    }
                }
            }
        }
        if let Some(token) = &self.cancel_after_details {
            token.cancel();
        }
        Ok(ids
            .iter()
            .filter_map(|id| self.details.get(id).cloned())
            .collect())
    }
}

impl PageSource for MockCatalogSource {
    async fn fetch_page(&self, url: &str) -> Result<String, AppError> {
        self.page_requests.lock().unwrap().push(url.to_string());
        self.pages
            .get(url)
            .cloned()
            .ok_or_else(|| AppError::NetworkError(format!("404 for {url}")))
    }
}

// =============================================================================
// Fixtures
// =============================================================================

pub fn write_file(path: &Path, content: &str) {
    std::fs::write(path, content).unwrap();
}
