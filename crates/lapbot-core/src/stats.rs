//! Run statistics for enrichment and crawl jobs.

use chrono::{DateTime, Utc};
use std::time::Duration;

/// Outcome of processing a single item through the enrichment pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnrichOutcome {
    /// The model answered with a well-formed result.
    Succeeded,
    /// The item failed and a fallback row was written in its place.
    Fallback,
    /// The item failed and nothing was written; a later run retries it.
    Failed,
}

impl EnrichOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            EnrichOutcome::Succeeded => "succeeded",
            EnrichOutcome::Fallback => "fallback",
            EnrichOutcome::Failed => "failed",
        }
    }
}

/// Counters for one enrichment run.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct EnrichStats {
    pub succeeded: usize,
    pub fallback: usize,
    pub failed: usize,
    /// Inputs whose key was already in the checkpoint.
    pub skipped_done: usize,
    /// Inputs with an empty key.
    pub skipped_empty: usize,
    /// Rows handed to the sink.
    pub rows_written: usize,
}

impl EnrichStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&mut self, outcome: EnrichOutcome) {
        match outcome {
            EnrichOutcome::Succeeded => self.succeeded += 1,
            EnrichOutcome::Fallback => self.fallback += 1,
            EnrichOutcome::Failed => self.failed += 1,
        }
    }

    /// Items that reached the LLM in this run.
    pub fn processed(&self) -> usize {
        self.succeeded + self.fallback + self.failed
    }

    pub fn skipped(&self) -> usize {
        self.skipped_done + self.skipped_empty
    }

    pub fn total(&self) -> usize {
        self.processed() + self.skipped()
    }

    /// Adds another run's counters, for commands that run several rounds.
    pub fn merge(&mut self, other: &EnrichStats) {
        self.succeeded += other.succeeded;
        self.fallback += other.fallback;
        self.failed += other.failed;
        self.skipped_done += other.skipped_done;
        self.skipped_empty += other.skipped_empty;
        self.rows_written += other.rows_written;
    }
}

/// How an enrichment run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnrichStatus {
    Completed,
    Cancelled,
}

impl EnrichStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            EnrichStatus::Completed => "completed",
            EnrichStatus::Cancelled => "cancelled",
        }
    }
}

/// Summary returned by [`crate::pipeline::EnrichPipeline::run`].
#[derive(Debug, Clone)]
pub struct EnrichResult {
    pub stats: EnrichStats,
    pub status: EnrichStatus,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

impl EnrichResult {
    pub fn is_cancelled(&self) -> bool {
        self.status == EnrichStatus::Cancelled
    }

    pub fn elapsed(&self) -> Duration {
        (self.finished_at - self.started_at)
            .to_std()
            .unwrap_or_default()
    }
}

/// Counters for one crawl command.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct CrawlStats {
    /// Pages or API responses fetched.
    pub pages: usize,
    /// Rows written.
    pub records: usize,
    /// Inputs skipped because they were already crawled or filtered out.
    pub skipped: usize,
    pub failed: usize,
}

impl CrawlStats {
    pub fn new() -> Self {
        Self::default()
    }
}
