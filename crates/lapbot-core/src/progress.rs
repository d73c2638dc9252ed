//! Progress reporting, decoupled from logging.
//!
//! Services emit events; the frontend decides how to show them. The CLI uses
//! [`TracingReporter`], tests and library callers usually [`SilentReporter`].

use std::time::Duration;

use crate::stats::{CrawlStats, EnrichOutcome, EnrichStats, EnrichStatus};

/// Events emitted by [`crate::pipeline::EnrichPipeline`].
#[derive(Debug, Clone)]
pub enum PipelineEvent<'a> {
    Started {
        task: &'a str,
        total: usize,
        pending: usize,
        skipped_done: usize,
        skipped_empty: usize,
    },
    ItemFinished {
        task: &'a str,
        key: &'a str,
        outcome: EnrichOutcome,
        completed: usize,
        pending: usize,
    },
    RetryScheduled {
        task: &'a str,
        key: &'a str,
        /// 1-based attempt that just failed.
        attempt: u32,
        delay: Duration,
        error: &'a str,
    },
    CircuitOpen {
        task: &'a str,
        retry_after: Duration,
    },
    BatchFlushed {
        task: &'a str,
        rows: usize,
        total_written: usize,
    },
    Finished {
        task: &'a str,
        stats: &'a EnrichStats,
        status: EnrichStatus,
    },
}

/// Events emitted by [`crate::crawl::CrawlService`].
#[derive(Debug, Clone)]
pub enum CrawlEvent<'a> {
    PageFetched {
        source: &'a str,
        page: usize,
        records: usize,
    },
    PageFailed {
        source: &'a str,
        target: &'a str,
        error: &'a str,
    },
    RowsWritten {
        source: &'a str,
        rows: usize,
        total: usize,
    },
    Finished {
        source: &'a str,
        stats: &'a CrawlStats,
    },
}

/// Receives progress events. Both methods default to doing nothing.
pub trait ProgressReporter: Send + Sync {
    fn report(&self, event: PipelineEvent<'_>) {
        let _ = event;
    }

    fn report_crawl(&self, event: CrawlEvent<'_>) {
        let _ = event;
    }
}

/// Drops every event.
#[derive(Debug, Default, Clone, Copy)]
pub struct SilentReporter;

impl ProgressReporter for SilentReporter {}

/// Forwards events to `tracing`.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingReporter;

impl ProgressReporter for TracingReporter {
    fn report(&self, event: PipelineEvent<'_>) {
        match event {
            PipelineEvent::Started {
                task,
                total,
                pending,
                skipped_done,
                skipped_empty,
            } => {
                tracing::info!(
                    task,
                    total,
                    pending,
                    skipped_done,
                    skipped_empty,
                    "Enrichment started"
                );
            }
            PipelineEvent::ItemFinished {
                task,
                key,
                outcome,
                completed,
                pending,
            } => {
                let outcome = outcome.as_str();
                // One line every 10 items keeps long runs readable
                if completed % 10 == 0 || completed == pending {
                    tracing::info!(task, completed, pending, "Progress");
                }
                tracing::debug!(task, key, outcome, "Item finished");
            }
            PipelineEvent::RetryScheduled {
                task,
                key,
                attempt,
                delay,
                error,
            } => {
                tracing::warn!(
                    task,
                    key,
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    error,
                    "Retrying LLM call"
                );
            }
            PipelineEvent::CircuitOpen { task, retry_after } => {
                tracing::warn!(
                    task,
                    retry_after_secs = retry_after.as_secs(),
                    "Circuit breaker open, waiting"
                );
            }
            PipelineEvent::BatchFlushed {
                task,
                rows,
                total_written,
            } => {
                tracing::info!(task, rows, total_written, "Checkpoint saved");
            }
            PipelineEvent::Finished {
                task,
                stats,
                status,
            } => {
                tracing::info!(
                    task,
                    status = status.as_str(),
                    succeeded = stats.succeeded,
                    fallback = stats.fallback,
                    failed = stats.failed,
                    skipped = stats.skipped(),
                    rows_written = stats.rows_written,
                    "Enrichment finished"
                );
            }
        }
    }

    fn report_crawl(&self, event: CrawlEvent<'_>) {
        match event {
            CrawlEvent::PageFetched {
                source,
                page,
                records,
            } => {
                tracing::info!(source, page, records, "Page fetched");
            }
            CrawlEvent::PageFailed {
                source,
                target,
                error,
            } => {
                tracing::warn!(source, target, error, "Fetch failed");
            }
            CrawlEvent::RowsWritten {
                source,
                rows,
                total,
            } => {
                tracing::info!(source, rows, total, "Rows written");
            }
            CrawlEvent::Finished { source, stats } => {
                tracing::info!(
                    source,
                    pages = stats.pages,
                    records = stats.records,
                    skipped = stats.skipped,
                    failed = stats.failed,
                    "Crawl finished"
                );
            }
        }
    }
}
