//! Rate-limited, checkpointed, parallel LLM enrichment.
//!
//! An [`EnrichTask`] describes one tool (how to key an input, what to ask
//! the model, how to verify the answer). [`EnrichPipeline`] runs any task
//! over a list of inputs:
//!
//! 1. inputs whose key is empty or already in the [`Checkpoint`] are skipped
//! 2. pending inputs run with bounded concurrency (`buffer_unordered`)
//! 3. each call waits for a [`RateLimiter`] slot and goes through a
//!    [`CircuitBreaker`]
//! 4. retryable errors back off linearly, others end the item at once
//! 5. results are appended to a [`ResultSink`] in batches, so an
//!    interrupted run loses at most one unflushed batch
//!
//! # Cancellation
//!
//! When the token fires, no new item starts, waits are interrupted, items
//! that already finished are flushed and the result is
//! [`EnrichStatus::Cancelled`]. Interrupted items are not checkpointed and
//! run again on resume.

use std::collections::HashSet;
use std::path::Path;

use chrono::Utc;
use futures::stream::{self, StreamExt};
use tokio_util::sync::CancellationToken;

use crate::checkpoint::{Checkpoint, normalize_key};
use crate::circuit_breaker::{CircuitBreaker, CircuitBreakerError};
use crate::config::EnrichConfig;
use crate::error::AppError;
use crate::models::LlmRequest;
use crate::progress::{PipelineEvent, ProgressReporter};
use crate::rate_limit::RateLimiter;
use crate::stats::{EnrichOutcome, EnrichResult, EnrichStats, EnrichStatus};
use crate::table::{CsvAppender, ToRecord};
use crate::traits::LlmProvider;

/// One enrichment tool.
pub trait EnrichTask: Send + Sync {
    type Input: Send + Sync;
    type Output: Send;

    /// Short name used in logs and progress events.
    fn name(&self) -> &'static str;

    /// Checkpoint key of an input. Compared after [`normalize_key`].
    fn key(&self, input: &Self::Input) -> String;

    fn build_request(&self, input: &Self::Input) -> LlmRequest;

    /// Verifies the shape of the model answer. Errors here are final.
    fn parse(&self, input: &Self::Input, raw: &str) -> Result<Self::Output, AppError>;

    /// Row written when the item finally fails. `None` writes nothing and
    /// leaves the item for a later run.
    fn fallback(&self, input: &Self::Input, error: &AppError) -> Option<Self::Output> {
        let _ = (input, error);
        None
    }
}

/// Destination for finished results.
pub trait ResultSink<O>: Send {
    /// Persists a batch, returning the number of rows written.
    fn write_batch(&mut self, batch: Vec<O>) -> Result<usize, AppError>;
}

/// Appends results to a CSV file, writing the header only for a new file.
pub struct CsvSink {
    appender: CsvAppender,
}

impl CsvSink {
    pub fn open<S: AsRef<str>>(path: &Path, header: &[S]) -> Result<Self, AppError> {
        Ok(Self {
            appender: CsvAppender::open(path, header)?,
        })
    }
}

impl<O: ToRecord> ResultSink<O> for CsvSink {
    fn write_batch(&mut self, batch: Vec<O>) -> Result<usize, AppError> {
        self.appender.append(&batch)
    }
}

enum ItemResult<O> {
    Success(O),
    Fallback(O),
    Failed,
    Cancelled,
}

/// Runs [`EnrichTask`]s against one LLM provider.
///
/// The rate limiter and circuit breaker live as long as the pipeline, so
/// consecutive runs on the same pipeline share their budget.
pub struct EnrichPipeline<P: LlmProvider> {
    provider: P,
    config: EnrichConfig,
    limiter: RateLimiter,
    breaker: CircuitBreaker,
}

impl<P: LlmProvider> EnrichPipeline<P> {
    pub fn new(provider: P, config: EnrichConfig) -> Self {
        let limiter = RateLimiter::per_minute(config.requests_per_minute);
        let breaker = CircuitBreaker::new(provider.name(), config.circuit_breaker.clone());
        Self {
            provider,
            config,
            limiter,
            breaker,
        }
    }

    pub fn provider(&self) -> &P {
        &self.provider
    }

    pub fn config(&self) -> &EnrichConfig {
        &self.config
    }

    pub fn circuit_breaker(&self) -> &CircuitBreaker {
        &self.breaker
    }

    /// Processes every pending input of `task` and appends results to `sink`.
    ///
    /// Keys of written results are added to `checkpoint`.
    ///
    /// # Errors
    ///
    /// Only sink failures abort the run. LLM failures are counted in the
    /// returned stats.
    pub async fn run<T, S, R>(
        &self,
        task: &T,
        inputs: Vec<T::Input>,
        checkpoint: &mut Checkpoint,
        sink: &mut S,
        reporter: &R,
        cancel: CancellationToken,
    ) -> Result<EnrichResult, AppError>
    where
        T: EnrichTask,
        S: ResultSink<T::Output>,
        R: ProgressReporter,
    {
        let started_at = Utc::now();
        let total = inputs.len();
        let mut stats = EnrichStats::new();

        let mut seen = HashSet::new();
        let mut pending = Vec::new();
        for input in inputs {
            let key = normalize_key(&task.key(&input));
            if key.is_empty() {
                stats.skipped_empty += 1;
            } else if checkpoint.contains(&key) || !seen.insert(key.clone()) {
                stats.skipped_done += 1;
            } else {
                pending.push((key, input));
            }
        }

        let pending_count = pending.len();
        reporter.report(PipelineEvent::Started {
            task: task.name(),
            total,
            pending: pending_count,
            skipped_done: stats.skipped_done,
            skipped_empty: stats.skipped_empty,
        });

        let batch_size = self.config.checkpoint_batch_size.max(1);
        let mut buffer: Vec<T::Output> = Vec::with_capacity(batch_size);
        let mut completed = 0usize;
        let mut was_cancelled = false;

        let cancel_ref = &cancel;
        let mut results = stream::iter(pending)
            .map(move |(key, input)| async move {
                let result = self
                    .process_item(task, &key, &input, reporter, cancel_ref)
                    .await;
                (key, result)
            })
            .buffer_unordered(self.config.concurrency.max(1));

        while let Some((key, result)) = results.next().await {
            let outcome = match result {
                ItemResult::Success(output) => {
                    buffer.push(output);
                    EnrichOutcome::Succeeded
                }
                ItemResult::Fallback(output) => {
                    buffer.push(output);
                    EnrichOutcome::Fallback
                }
                ItemResult::Failed => EnrichOutcome::Failed,
                ItemResult::Cancelled => {
                    was_cancelled = true;
                    continue;
                }
            };

            stats.record(outcome);
            if outcome != EnrichOutcome::Failed {
                checkpoint.insert(&key);
            }
            completed += 1;
            reporter.report(PipelineEvent::ItemFinished {
                task: task.name(),
                key: &key,
                outcome,
                completed,
                pending: pending_count,
            });

            if buffer.len() >= batch_size {
                Self::flush(task, sink, &mut buffer, &mut stats, reporter)?;
            }
        }

        Self::flush(task, sink, &mut buffer, &mut stats, reporter)?;

        let status = if was_cancelled || cancel.is_cancelled() {
            tracing::info!(
                task = task.name(),
                completed,
                pending = pending_count,
                "Run cancelled, finished rows were saved"
            );
            EnrichStatus::Cancelled
        } else {
            EnrichStatus::Completed
        };

        reporter.report(PipelineEvent::Finished {
            task: task.name(),
            stats: &stats,
            status,
        });

        Ok(EnrichResult {
            stats,
            status,
            started_at,
            finished_at: Utc::now(),
        })
    }

    fn flush<T, S, R>(
        task: &T,
        sink: &mut S,
        buffer: &mut Vec<T::Output>,
        stats: &mut EnrichStats,
        reporter: &R,
    ) -> Result<(), AppError>
    where
        T: EnrichTask,
        S: ResultSink<T::Output>,
        R: ProgressReporter,
    {
        if buffer.is_empty() {
            return Ok(());
        }
        let rows = sink.write_batch(std::mem::take(buffer))?;
        stats.rows_written += rows;
        reporter.report(PipelineEvent::BatchFlushed {
            task: task.name(),
            rows,
            total_written: stats.rows_written,
        });
        Ok(())
    }

    async fn process_item<T, R>(
        &self,
        task: &T,
        key: &str,
        input: &T::Input,
        reporter: &R,
        cancel: &CancellationToken,
    ) -> ItemResult<T::Output>
    where
        T: EnrichTask,
        R: ProgressReporter,
    {
        if cancel.is_cancelled() {
            return ItemResult::Cancelled;
        }

        let request = task.build_request(input);
        let max_attempts = self.config.retry.max_attempts.max(1);
        let mut last_error = None;

        for attempt in 0..max_attempts {
            let is_last = attempt + 1 >= max_attempts;

            tokio::select! {
                _ = cancel.cancelled() => return ItemResult::Cancelled,
                _ = self.limiter.acquire() => {}
            }

            let error = match self
                .breaker
                .call(|| self.provider.generate(&request))
                .await
            {
                Ok(raw) => {
                    return match task.parse(input, &raw) {
                        Ok(output) => ItemResult::Success(output),
                        Err(e) => {
                            tracing::warn!(
                                task = task.name(),
                                key,
                                error = %e,
                                "Model answer rejected"
                            );
                            Self::give_up(task, input, &e)
                        }
                    };
                }
                Err(CircuitBreakerError::Open { name, retry_after }) => {
                    reporter.report(PipelineEvent::CircuitOpen {
                        task: task.name(),
                        retry_after,
                    });
                    if !is_last {
                        tokio::select! {
                            _ = cancel.cancelled() => return ItemResult::Cancelled,
                            _ = tokio::time::sleep(retry_after) => {}
                        }
                    }
                    last_error = Some(AppError::CircuitOpen(name));
                    continue;
                }
                Err(CircuitBreakerError::Inner(e)) => e,
            };

            if is_last || !error.is_retryable() {
                last_error = Some(error);
                break;
            }

            let delay = self.config.retry.delay_for(attempt, error.is_rate_limit());
            let message = error.to_string();
            reporter.report(PipelineEvent::RetryScheduled {
                task: task.name(),
                key,
                attempt: attempt + 1,
                delay,
                error: &message,
            });
            last_error = Some(error);

            tokio::select! {
                _ = cancel.cancelled() => return ItemResult::Cancelled,
                _ = tokio::time::sleep(delay) => {}
            }
        }

        let error =
            last_error.unwrap_or_else(|| AppError::Generic("no attempt was made".to_string()));
        tracing::warn!(
            task = task.name(),
            key,
            error = %error,
            "Item failed"
        );
        Self::give_up(task, input, &error)
    }

    fn give_up<T: EnrichTask>(
        task: &T,
        input: &T::Input,
        error: &AppError,
    ) -> ItemResult<T::Output> {
        match task.fallback(input, error) {
            Some(output) => ItemResult::Fallback(output),
            None => ItemResult::Failed,
        }
    }
}
