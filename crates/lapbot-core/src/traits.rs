//! Trait definitions for external dependencies.
//!
//! Core logic talks to LLM APIs and the product catalog only through these
//! traits. `lapbot-client` provides the HTTP implementations; tests use
//! in-memory mocks.
//!
//! # Example
//!
//! ```
//! use lapbot_core::traits::LlmProvider;
//! use lapbot_core::{AppError, LlmRequest};
//!
//! async fn ask<P: LlmProvider>(provider: &P, question: &str) -> Result<String, AppError> {
//!     provider.generate(&LlmRequest::new(question)).await
//! }
//! ```

use std::future::Future;

use serde_json::Value;

use crate::{AppError, LlmRequest};

/// A text-generation backend.
pub trait LlmProvider: Send + Sync + Clone {
    /// Short provider name used in logs and error details (`gemini`, `together`).
    fn name(&self) -> &'static str;

    /// Model identifier sent with each request.
    fn model(&self) -> &str;

    /// Sends the request and returns the raw text of the first candidate.
    fn generate(
        &self,
        request: &LlmRequest,
    ) -> impl Future<Output = Result<String, AppError>> + Send;
}

/// Fetches web pages as text.
pub trait PageSource: Send + Sync + Clone {
    /// Raw HTML of a page.
    fn fetch_page(&self, url: &str) -> impl Future<Output = Result<String, AppError>> + Send;
}

/// Access to the e-commerce catalog being crawled.
///
/// Product and comment payloads are returned as raw JSON because their
/// attribute sets change from product to product; [`crate::flatten`] turns
/// them into rows.
pub trait CatalogSource: PageSource {
    /// Every laptop product listed in the catalog.
    fn fetch_products(&self) -> impl Future<Output = Result<Vec<Value>, AppError>> + Send;

    /// One page (1-based) of customer questions with their answers.
    fn fetch_comment_page(
        &self,
        page: u32,
    ) -> impl Future<Output = Result<Vec<Value>, AppError>> + Send;

    /// Ids of accessories recommended alongside `product_id`.
    fn fetch_recommendations(
        &self,
        product_id: &str,
    ) -> impl Future<Output = Result<Vec<String>, AppError>> + Send;

    /// Product details for a batch of ids.
    fn fetch_products_by_ids(
        &self,
        ids: &[String],
    ) -> impl Future<Output = Result<Vec<Value>, AppError>> + Send;
}
