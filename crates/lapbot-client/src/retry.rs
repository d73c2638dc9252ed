//! Retrying HTTP transport shared by the catalog clients.
//!
//! Every attempt is classified into a [`Failure`]: throttling backs off
//! exponentially (or as told by `Retry-After`), transient faults back off
//! linearly, anything else fails at once. Callers can classify the body of
//! a 200 response too, which is how GraphQL `errors` become retryable.

use std::time::Duration;

use lapbot_core::HttpConfig;
use lapbot_core::error::AppError;
use reqwest::header::{HeaderMap, RETRY_AFTER};
use reqwest::{Client, RequestBuilder, StatusCode};
use tokio::time::sleep;

const MAX_RETRY_DELAY: Duration = Duration::from_secs(30);
const RATE_LIMIT_MAX_ATTEMPTS: u32 = 5;

/// Why an attempt did not produce a usable body.
#[derive(Debug)]
pub(crate) enum Failure {
    /// Throttled, optionally with the server's requested wait.
    RateLimited(Option<Duration>),
    /// Worth another attempt after a short pause.
    Transient(AppError),
    /// Retrying cannot help.
    Fatal(AppError),
}

impl Failure {
    /// Wait before the next attempt, or `None` to give up.
    fn delay(&self, attempt: u32, base: Duration) -> Option<Duration> {
        match self {
            Failure::RateLimited(Some(wait)) => Some(*wait),
            Failure::RateLimited(None) => {
                Some((base * 2_u32.saturating_pow(attempt)).min(MAX_RETRY_DELAY))
            }
            Failure::Transient(_) => Some(base * attempt),
            Failure::Fatal(_) => None,
        }
    }

    fn is_rate_limit(&self) -> bool {
        matches!(self, Failure::RateLimited(_))
    }

    pub(crate) fn into_error(self) -> AppError {
        match self {
            Failure::RateLimited(_) => AppError::RateLimitExceeded,
            Failure::Transient(e) | Failure::Fatal(e) => e,
        }
    }
}

/// Seconds from a `Retry-After` header.
fn retry_after(headers: &HeaderMap) -> Option<Duration> {
    headers
        .get(RETRY_AFTER)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse::<u64>().ok())
        .map(Duration::from_secs)
}

/// Classifies a non-success status.
fn status_failure(status: StatusCode, wait: Option<Duration>, url: &str) -> Failure {
    if status == StatusCode::TOO_MANY_REQUESTS {
        Failure::RateLimited(wait)
    } else if status.is_server_error() {
        Failure::Transient(AppError::ClientError(format!(
            "Server error: HTTP {}",
            status.as_u16()
        )))
    } else {
        Failure::Fatal(AppError::ClientError(format!(
            "HTTP {} from {}",
            status.as_u16(),
            url
        )))
    }
}

fn send_failure(error: &reqwest::Error, timeout: Duration) -> Failure {
    if error.is_timeout() {
        Failure::Transient(AppError::Timeout(timeout.as_secs()))
    } else if error.is_connect() {
        Failure::Transient(AppError::NetworkError(format!("Connection failed: {}", error)))
    } else {
        Failure::Fatal(AppError::ClientError(error.to_string()))
    }
}

/// A reqwest client plus the retry schedule from [`HttpConfig`].
#[derive(Clone)]
pub(crate) struct RetryingHttp {
    client: Client,
    config: HttpConfig,
}

impl RetryingHttp {
    pub(crate) fn new(client: Client, config: HttpConfig) -> Self {
        Self { client, config }
    }

    /// GETs `url` and returns the body text.
    pub(crate) async fn get_text(&self, url: &str) -> Result<String, AppError> {
        self.send(url, |client| client.get(url), Ok).await
    }

    /// Sends the request built by `build` until `accept` takes the body.
    ///
    /// Throttling is retried up to five attempts even when `max_retries`
    /// is lower. Transient failures use `max_retries`.
    pub(crate) async fn send<T, B, A>(
        &self,
        url: &str,
        build: B,
        accept: A,
    ) -> Result<T, AppError>
    where
        B: Fn(&Client) -> RequestBuilder,
        A: Fn(String) -> Result<T, Failure>,
    {
        let max_attempts = self.config.max_retries.max(1);
        let rate_limit_attempts = RATE_LIMIT_MAX_ATTEMPTS.max(max_attempts);
        let base_delay = self.config.retry_base_delay;

        let mut attempt = 1;
        loop {
            let failure = match self.attempt(url, &build).await {
                Ok(body) => match accept(body) {
                    Ok(value) => return Ok(value),
                    Err(failure) => failure,
                },
                Err(failure) => failure,
            };

            let limit = if failure.is_rate_limit() {
                rate_limit_attempts
            } else {
                max_attempts
            };
            match failure.delay(attempt, base_delay) {
                Some(delay) if attempt < limit => {
                    tracing::debug!(url, attempt, ?delay, ?failure, "Request failed, retrying");
                    sleep(delay).await;
                    attempt += 1;
                }
                _ => return Err(failure.into_error()),
            }
        }
    }

    async fn attempt<B>(&self, url: &str, build: &B) -> Result<String, Failure>
    where
        B: Fn(&Client) -> RequestBuilder,
    {
        let response = build(&self.client)
            .send()
            .await
            .map_err(|e| send_failure(&e, self.config.timeout))?;

        let status = response.status();
        if !status.is_success() {
            return Err(status_failure(status, retry_after(response.headers()), url));
        }

        response.text().await.map_err(|e| {
            Failure::Transient(AppError::NetworkError(format!("Body read failed: {e}")))
        })
    }
}
