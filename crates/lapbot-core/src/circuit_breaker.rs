//! Circuit breaker guarding LLM endpoints.
//!
//! When a provider starts failing (outage, throttling), hammering it with the
//! remaining rows only burns quota and retries. The breaker stops outgoing
//! calls for a recovery window and then lets a few probes through.
//!
//! ```text
//! CLOSED --[failure_threshold tripping failures]--> OPEN
//! OPEN   --[recovery timeout elapsed]-------------> HALF_OPEN
//! HALF_OPEN --[success_threshold successes]-------> CLOSED
//! HALF_OPEN --[any tripping failure]--------------> OPEN
//! ```
//!
//! Rate-limit failures stretch the recovery window by
//! `rate_limit_backoff_multiplier`, up to `max_recovery_timeout`.
//!
//! # Example
//!
//! ```ignore
//! use lapbot_core::circuit_breaker::{CircuitBreaker, CircuitBreakerConfig, CircuitBreakerError};
//!
//! let cb = CircuitBreaker::new("gemini", CircuitBreakerConfig::default());
//! match cb.call(|| provider.generate(&request)).await {
//!     Ok(text) => { /* parse */ }
//!     Err(CircuitBreakerError::Open { retry_after, .. }) => { /* wait */ }
//!     Err(CircuitBreakerError::Inner(e)) => { /* retry or give up */ }
//! }
//! ```

use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tokio::time::Instant;

use crate::error::AppError;

/// Current state of the circuit breaker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    /// Calls flow normally.
    Closed,
    /// Calls are rejected without reaching the provider.
    Open,
    /// A limited number of probe calls are allowed.
    HalfOpen,
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            CircuitState::Closed => "closed",
            CircuitState::Open => "open",
            CircuitState::HalfOpen => "half-open",
        };
        f.write_str(label)
    }
}

/// Configuration for circuit breaker behavior.
#[derive(Debug, Clone)]
pub struct CircuitBreakerConfig {
    /// Consecutive tripping failures before the circuit opens.
    pub failure_threshold: u32,
    /// Successful probes needed in half-open state to close again.
    pub success_threshold: u32,
    /// Base wait before an open circuit lets probes through.
    pub recovery_timeout: Duration,
    /// Factor applied to the recovery window on rate-limit failures.
    pub rate_limit_backoff_multiplier: f32,
    /// Upper bound for the stretched recovery window.
    pub max_recovery_timeout: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            success_threshold: 2,
            recovery_timeout: Duration::from_secs(30),
            rate_limit_backoff_multiplier: 2.0,
            max_recovery_timeout: Duration::from_secs(300),
        }
    }
}

impl CircuitBreakerConfig {
    /// Reads `CB_FAILURE_THRESHOLD`, `CB_SUCCESS_THRESHOLD` and
    /// `CB_RECOVERY_TIMEOUT_SECS`, falling back to defaults.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            failure_threshold: env_parse("CB_FAILURE_THRESHOLD")
                .unwrap_or(defaults.failure_threshold),
            success_threshold: env_parse("CB_SUCCESS_THRESHOLD")
                .unwrap_or(defaults.success_threshold),
            recovery_timeout: env_parse("CB_RECOVERY_TIMEOUT_SECS")
                .map(Duration::from_secs)
                .unwrap_or(defaults.recovery_timeout),
            ..defaults
        }
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|v| v.trim().parse().ok())
}

#[derive(Debug)]
struct BreakerState {
    state: CircuitState,
    consecutive_failures: u32,
    probe_successes: u32,
    opened_at: Option<Instant>,
    last_error: Option<String>,
    recovery_window: Duration,
}

impl BreakerState {
    fn closed(config: &CircuitBreakerConfig) -> Self {
        Self {
            state: CircuitState::Closed,
            consecutive_failures: 0,
            probe_successes: 0,
            opened_at: None,
            last_error: None,
            recovery_window: config.recovery_timeout,
        }
    }

    fn remaining_window(&self) -> Duration {
        match self.opened_at {
            Some(at) => self.recovery_window.saturating_sub(at.elapsed()),
            None => self.recovery_window,
        }
    }
}

/// Snapshot of a circuit breaker for logging and summaries.
#[derive(Debug, Clone)]
pub struct CircuitBreakerStats {
    pub name: String,
    pub state: CircuitState,
    /// Consecutive tripping failures in the current closed period.
    pub failure_count: u32,
    /// Successful probes while half-open.
    pub success_count: u32,
    pub last_error: Option<String>,
    /// Time left before probes are allowed, when open.
    pub time_until_half_open: Option<Duration>,
}

/// Error returned by [`CircuitBreaker::call`].
#[derive(Debug)]
pub enum CircuitBreakerError {
    /// The call was rejected without reaching the provider.
    Open { name: String, retry_after: Duration },
    /// The call ran and failed.
    Inner(AppError),
}

impl std::fmt::Display for CircuitBreakerError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CircuitBreakerError::Open { name, retry_after } => write!(
                f,
                "Circuit breaker '{}' is open. Retry after {} seconds.",
                name,
                retry_after.as_secs()
            ),
            CircuitBreakerError::Inner(e) => write!(f, "{}", e),
        }
    }
}

impl std::error::Error for CircuitBreakerError {}

/// Thread-safe circuit breaker, cheap to clone and share between workers.
#[derive(Clone)]
pub struct CircuitBreaker {
    name: String,
    config: CircuitBreakerConfig,
    shared: Arc<Mutex<BreakerState>>,
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        let shared = Arc::new(Mutex::new(BreakerState::closed(&config)));
        Self {
            name: name.into(),
            config,
            shared,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Current state, applying a pending Open → HalfOpen transition.
    pub fn state(&self) -> CircuitState {
        self.lock().state
    }

    pub fn stats(&self) -> CircuitBreakerStats {
        let guard = self.lock();
        CircuitBreakerStats {
            name: self.name.clone(),
            state: guard.state,
            failure_count: guard.consecutive_failures,
            success_count: guard.probe_successes,
            last_error: guard.last_error.clone(),
            time_until_half_open: (guard.state == CircuitState::Open)
                .then(|| guard.remaining_window()),
        }
    }

    /// Runs `operation` unless the circuit is open.
    ///
    /// Only errors for which [`AppError::should_trip_circuit`] holds are
    /// counted as failures; other errors pass through untouched.
    pub async fn call<F, T, Fut>(&self, operation: F) -> Result<T, CircuitBreakerError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, AppError>>,
    {
        {
            let guard = self.lock();
            if guard.state == CircuitState::Open {
                return Err(CircuitBreakerError::Open {
                    name: self.name.clone(),
                    retry_after: guard.remaining_window(),
                });
            }
        }

        match operation().await {
            Ok(value) => {
                self.record_success();
                Ok(value)
            }
            Err(e) => {
                if e.should_trip_circuit() {
                    self.record_failure(&e);
                }
                Err(CircuitBreakerError::Inner(e))
            }
        }
    }

    pub fn record_success(&self) {
        let mut guard = self.lock();
        match guard.state {
            CircuitState::Closed => guard.consecutive_failures = 0,
            CircuitState::HalfOpen => {
                guard.probe_successes += 1;
                if guard.probe_successes >= self.config.success_threshold {
                    tracing::info!(
                        circuit = %self.name,
                        probes = guard.probe_successes,
                        "Circuit breaker closed"
                    );
                    *guard = BreakerState::closed(&self.config);
                }
            }
            CircuitState::Open => {}
        }
    }

    pub fn record_failure(&self, error: &AppError) {
        let mut guard = self.lock();
        guard.last_error = Some(error.to_string());

        let should_open = match guard.state {
            CircuitState::Closed => {
                guard.consecutive_failures += 1;
                guard.consecutive_failures >= self.config.failure_threshold
            }
            CircuitState::HalfOpen => true,
            CircuitState::Open => false,
        };
        if !should_open {
            return;
        }

        if error.is_rate_limit() {
            let stretched = guard
                .recovery_window
                .mul_f32(self.config.rate_limit_backoff_multiplier);
            guard.recovery_window = stretched.min(self.config.max_recovery_timeout);
        }
        tracing::warn!(
            circuit = %self.name,
            failures = guard.consecutive_failures,
            recovery_secs = guard.recovery_window.as_secs(),
            error = %error,
            "Circuit breaker opened"
        );
        guard.state = CircuitState::Open;
        guard.opened_at = Some(Instant::now());
        guard.probe_successes = 0;
    }

    /// Forces the circuit back to closed.
    pub fn reset(&self) {
        let mut guard = self.lock();
        *guard = BreakerState::closed(&self.config);
        tracing::info!(circuit = %self.name, "Circuit breaker reset");
    }

    fn lock(&self) -> MutexGuard<'_, BreakerState> {
        // A panic while holding the lock leaves plain counters behind; keep going.
        let mut guard = self
            .shared
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if guard.state == CircuitState::Open && guard.remaining_window().is_zero() {
            tracing::info!(circuit = %self.name, "Circuit breaker half-open, probing");
            guard.state = CircuitState::HalfOpen;
            guard.probe_successes = 0;
        }
        guard
    }
}
