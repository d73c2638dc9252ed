//! Enrichment commands built on [`EnrichPipeline`].
//!
//! [`EnrichService`] owns one pipeline, so the rate limit and circuit
//! breaker are shared by everything it runs. Each method reads its input
//! file, resumes from what the output already holds and returns a summary.

use std::path::{Path, PathBuf};

use chrono::Utc;
use rand::SeedableRng;
use rand::rngs::StdRng;
use tokio_util::sync::CancellationToken;

use crate::checkpoint::Checkpoint;
use crate::config::EnrichConfig;
use crate::error::AppError;
use crate::fill_missing::{
    FILL_COLUMNS, FillMissingTask, apply_fills, collect_inputs, fills_path, load_fills,
};
use crate::intent::{IntentRecord, IntentTask, load_questions};
use crate::pipeline::{CsvSink, EnrichPipeline};
use crate::progress::ProgressReporter;
use crate::question_gen::{
    DEFAULT_BATCH_SIZE, DEFAULT_TARGET, QuestionGenTask, QuestionSink, load_laptops,
    plan_batches,
};
use crate::stats::{EnrichResult, EnrichStats, EnrichStatus};
use crate::table::{count_rows, read_table, write_table};
use crate::traits::LlmProvider;

/// Result of a fill-missing run.
#[derive(Debug, Clone)]
pub struct FillSummary {
    pub result: EnrichResult,
    /// Rows that had at least one empty cell.
    pub rows_with_missing: usize,
    /// Cells written into the output table, counting fills from earlier runs.
    pub cells_filled: usize,
    pub output: PathBuf,
    pub fills_file: PathBuf,
}

/// Target and sampling of a question generation run.
#[derive(Debug, Clone)]
pub struct GenerationPlan {
    /// Total rows wanted in the output file.
    pub target: usize,
    /// Questions requested per call.
    pub batch_size: usize,
    /// Seed for laptop sampling. `None` draws from system entropy.
    pub seed: Option<u64>,
}

impl Default for GenerationPlan {
    fn default() -> Self {
        Self {
            target: DEFAULT_TARGET,
            batch_size: DEFAULT_BATCH_SIZE,
            seed: None,
        }
    }
}

impl GenerationPlan {
    pub fn with_target(mut self, target: usize) -> Self {
        self.target = target;
        self
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = Some(seed);
        self
    }
}

/// Result of a question generation run.
#[derive(Debug, Clone)]
pub struct GenerationSummary {
    pub target: usize,
    /// Rows already in the output before this run.
    pub existing: usize,
    /// Rows written by this run.
    pub generated: usize,
    pub rounds: usize,
    /// Counters summed over all rounds.
    pub stats: EnrichStats,
    pub status: EnrichStatus,
}

impl GenerationSummary {
    pub fn total(&self) -> usize {
        self.existing + self.generated
    }

    pub fn reached_target(&self) -> bool {
        self.total() >= self.target
    }
}

/// Service running the enrichment tools against one LLM provider.
pub struct EnrichService<P: LlmProvider> {
    pipeline: EnrichPipeline<P>,
}

impl<P: LlmProvider> EnrichService<P> {
    pub fn new(provider: P, config: EnrichConfig) -> Self {
        Self {
            pipeline: EnrichPipeline::new(provider, config),
        }
    }

    pub fn pipeline(&self) -> &EnrichPipeline<P> {
        &self.pipeline
    }

    /// Fills empty cells of `input` and writes the completed table to
    /// `output`.
    ///
    /// Accepted answers go to the side file of `output` first (see
    /// [`fills_path`]), which is also the checkpoint. The merged table is
    /// written even when the run is cancelled.
    pub async fn fill_missing<R: ProgressReporter>(
        &self,
        input: &Path,
        output: &Path,
        key_column: &str,
        reporter: &R,
        cancel: CancellationToken,
    ) -> Result<FillSummary, AppError> {
        let mut table = read_table(input)?;
        if table.column_index(key_column).is_none() {
            tracing::warn!(
                column = key_column,
                "Key column not found, rows are keyed by index"
            );
        }

        let inputs = collect_inputs(&table, key_column);
        let rows_with_missing = inputs.len();
        tracing::info!(
            input = %input.display(),
            rows = table.len(),
            rows_with_missing,
            "Loaded dataset"
        );

        let fills_file = fills_path(output);
        let mut checkpoint = Checkpoint::load(&fills_file, FILL_COLUMNS[0]);
        let mut sink = CsvSink::open(&fills_file, &FILL_COLUMNS)?;
        let task = FillMissingTask::new(&table.headers);

        let result = self
            .pipeline
            .run(&task, inputs, &mut checkpoint, &mut sink, reporter, cancel)
            .await?;

        let fills = load_fills(&fills_file)?;
        let cells_filled = apply_fills(&mut table, &fills, key_column);
        write_table(output, &table)?;
        tracing::info!(
            output = %output.display(),
            cells_filled,
            "Wrote completed dataset"
        );

        Ok(FillSummary {
            result,
            rows_with_missing,
            cells_filled,
            output: output.to_path_buf(),
            fills_file,
        })
    }

    /// Classifies every question of `question_column` in `input`,
    /// appending to `output`. Questions already in `output` are skipped.
    pub async fn classify_intents<R: ProgressReporter>(
        &self,
        input: &Path,
        output: &Path,
        question_column: &str,
        reporter: &R,
        cancel: CancellationToken,
    ) -> Result<EnrichResult, AppError> {
        let questions = load_questions(input, question_column)?;
        tracing::info!(
            input = %input.display(),
            questions = questions.len(),
            "Loaded questions"
        );

        let mut checkpoint = Checkpoint::load(output, IntentRecord::COLUMNS[0]);
        let mut sink = CsvSink::open(output, &IntentRecord::COLUMNS)?;
        let task = IntentTask::new();

        self.pipeline
            .run(&task, questions, &mut checkpoint, &mut sink, reporter, cancel)
            .await
    }

    /// Generates labelled questions until `output` holds `plan.target`
    /// rows.
    ///
    /// Each round plans batches for the rows still missing. Rounds stop
    /// when the target is reached, when a round writes nothing, or on
    /// cancellation.
    pub async fn generate_questions<R: ProgressReporter>(
        &self,
        laptops: &Path,
        output: &Path,
        plan: &GenerationPlan,
        reporter: &R,
        cancel: CancellationToken,
    ) -> Result<GenerationSummary, AppError> {
        let laptops = load_laptops(laptops)?;
        let existing = count_rows(output)?;
        let mut rng = match plan.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };

        let mut summary = GenerationSummary {
            target: plan.target,
            existing,
            generated: 0,
            rounds: 0,
            stats: EnrichStats::new(),
            status: EnrichStatus::Completed,
        };
        if summary.reached_target() {
            tracing::info!(existing, target = plan.target, "Target already reached");
            return Ok(summary);
        }

        let mut sink = QuestionSink::open(output)?;
        let task = QuestionGenTask::new();
        let started_at = Utc::now();

        while !summary.reached_target() {
            let remaining = plan.target - summary.total();
            let batches = plan_batches(
                &laptops,
                remaining,
                plan.batch_size,
                summary.rounds,
                &mut rng,
            );
            tracing::info!(
                round = summary.rounds,
                remaining,
                batches = batches.len(),
                "Starting generation round"
            );

            let mut checkpoint = Checkpoint::new();
            let result = self
                .pipeline
                .run(&task, batches, &mut checkpoint, &mut sink, reporter, cancel.clone())
                .await?;

            summary.rounds += 1;
            summary.generated += result.stats.rows_written;
            summary.stats.merge(&result.stats);

            if result.is_cancelled() {
                summary.status = EnrichStatus::Cancelled;
                break;
            }
            if result.stats.rows_written == 0 {
                tracing::warn!(
                    round = summary.rounds,
                    "Round produced no questions, stopping"
                );
                break;
            }
        }

        tracing::info!(
            generated = summary.generated,
            total = summary.total(),
            target = summary.target,
            elapsed_secs = (Utc::now() - started_at).num_seconds(),
            "Question generation finished"
        );
        Ok(summary)
    }
}
