//! HTTP client for thegioididong.com pages.
//!
//! The site serves its listing and product pages as server-rendered HTML,
//! so a plain GET with browser headers is enough.

use lapbot_core::HttpConfig;
use lapbot_core::error::AppError;
use lapbot_core::tgdd::TGDD_BASE_URL;
use lapbot_core::traits::PageSource;
use reqwest::header::{ACCEPT, ACCEPT_LANGUAGE, HeaderMap, HeaderValue, REFERER, USER_AGENT};
use reqwest::{Client, Url};

use crate::retry::RetryingHttp;

fn default_headers() -> HeaderMap {
    let mut headers = HeaderMap::new();
    headers.insert(
        ACCEPT,
        HeaderValue::from_static("text/html,application/xhtml+xml;q=0.9,*/*;q=0.8"),
    );
    headers.insert(ACCEPT_LANGUAGE, HeaderValue::from_static("vi-VN,vi;q=0.9,en;q=0.8"));
    headers.insert(REFERER, HeaderValue::from_static("https://www.thegioididong.com/"));
    headers.insert(
        USER_AGENT,
        HeaderValue::from_static(
            "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 \
             (KHTML, like Gecko) Chrome/124.0.0.0 Safari/537.36",
        ),
    );
    headers
}

/// Fetches thegioididong pages with retries.
#[derive(Clone)]
pub struct TgddClient {
    http: RetryingHttp,
}

impl TgddClient {
    pub fn new() -> Result<Self, AppError> {
        Self::with_config(HttpConfig::default())
    }

    pub fn with_config(http_config: HttpConfig) -> Result<Self, AppError> {
        let client = Client::builder()
            .timeout(http_config.timeout)
            .default_headers(default_headers())
            .build()
            .map_err(|e| AppError::ClientError(e.to_string()))?;
        Ok(Self {
            http: RetryingHttp::new(client, http_config),
        })
    }
}

impl PageSource for TgddClient {
    async fn fetch_page(&self, url: &str) -> Result<String, AppError> {
        let parsed = Url::parse(url).map_err(|_| AppError::InvalidUrl(url.to_string()))?;
        if !url.starts_with(TGDD_BASE_URL) {
            tracing::debug!(host = ?parsed.host_str(), "Fetching page outside thegioididong");
        }
        self.http.get_text(url).await
    }
}
