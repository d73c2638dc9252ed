//! Synthetic training question generator.
//!
//! Questions are requested in batches, each grounded in a few randomly
//! sampled laptops. The output file itself is the checkpoint: a run only
//! asks for the difference between the target and the rows already there.

use std::path::Path;

use rand::Rng;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use serde_json::Value;

use crate::error::AppError;
use crate::json::parse_llm_json;
use crate::models::{GenerationOptions, LlmRequest};
use crate::pipeline::{EnrichTask, ResultSink};
use crate::table::{CsvAppender, Record, ToRecord, is_missing_value, read_table};

pub const DEFAULT_TARGET: usize = 2000;
pub const DEFAULT_BATCH_SIZE: usize = 10;

/// Laptop columns shown to the model, in this order.
pub const PRIORITY_COLUMNS: [&str; 11] = [
    "name",
    "manufacturer",
    "cpu_model",
    "ram_storage",
    "storage_gb",
    "vga_type",
    "display_size",
    "refresh_rate",
    "root_price",
    "nhu_cau_su_dung",
    "product_weight",
];

const MIN_CONTEXT_LAPTOPS: usize = 3;
const MAX_CONTEXT_LAPTOPS: usize = 5;

/// One generated question with its intent flags.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GeneratedQuestion {
    pub question: String,
    pub recommend_budget: u8,
    pub recommend_usage: u8,
    pub tech_detail: u8,
}

impl GeneratedQuestion {
    pub const COLUMNS: [&'static str; 4] =
        ["question", "recommend_budget", "recommend_usage", "tech_detail"];
}

impl ToRecord for GeneratedQuestion {
    fn to_record(&self) -> Record {
        let mut record = Record::new();
        record.insert("question".into(), self.question.clone());
        record.insert("recommend_budget".into(), self.recommend_budget.to_string());
        record.insert("recommend_usage".into(), self.recommend_usage.to_string());
        record.insert("tech_detail".into(), self.tech_detail.to_string());
        record
    }
}

/// A laptop's priority specs, as `(column, value)` pairs.
pub type LaptopSpecs = Vec<(String, String)>;

/// Priority specs of every laptop in the file. Missing values are dropped.
pub fn load_laptops(path: &Path) -> Result<Vec<LaptopSpecs>, AppError> {
    let table = read_table(path)?;
    let indices: Vec<(&str, usize)> = PRIORITY_COLUMNS
        .iter()
        .filter_map(|column| table.column_index(column).map(|idx| (*column, idx)))
        .collect();

    Ok(table
        .rows
        .iter()
        .map(|row| {
            indices
                .iter()
                .filter_map(|(column, idx)| {
                    row.get(*idx)
                        .and_then(|cell| cell.as_deref())
                        .filter(|value| !is_missing_value(value))
                        .map(|value| (column.to_string(), value.to_string()))
                })
                .collect()
        })
        .collect())
}

/// Input of one generation call.
#[derive(Debug, Clone, PartialEq)]
pub struct QuestionBatch {
    pub id: String,
    pub count: usize,
    /// Empty when the dataset has fewer laptops than were drawn.
    pub laptops: Vec<LaptopSpecs>,
}

/// Splits `remaining` questions into batches with fresh random context.
pub fn plan_batches(
    laptops: &[LaptopSpecs],
    remaining: usize,
    batch_size: usize,
    round: usize,
    rng: &mut StdRng,
) -> Vec<QuestionBatch> {
    let batch_size = batch_size.max(1);
    let mut batches = Vec::new();
    let mut left = remaining;
    while left > 0 {
        let count = left.min(batch_size);
        let wanted = rng.gen_range(MIN_CONTEXT_LAPTOPS..=MAX_CONTEXT_LAPTOPS);
        let context = if laptops.len() < wanted {
            Vec::new()
        } else {
            laptops.choose_multiple(rng, wanted).cloned().collect()
        };
        batches.push(QuestionBatch {
            id: format!("round{}-batch{}", round, batches.len()),
            count,
            laptops: context,
        });
        left -= count;
    }
    batches
}

fn coerce_flag(value: &Value) -> Option<u8> {
    match value {
        Value::Bool(b) => Some(u8::from(*b)),
        Value::Number(n) => match n.as_f64()? {
            v if v == 0.0 => Some(0),
            v if v == 1.0 => Some(1),
            _ => None,
        },
        Value::String(s) => match s.trim().to_lowercase().as_str() {
            "0" | "false" => Some(0),
            "1" | "true" => Some(1),
            _ => None,
        },
        _ => None,
    }
}

fn parse_item(item: &Value) -> Option<GeneratedQuestion> {
    let object = item.as_object()?;
    let question = object.get("question")?.as_str()?.trim();
    if question.is_empty() {
        return None;
    }
    Some(GeneratedQuestion {
        question: question.to_string(),
        recommend_budget: coerce_flag(object.get("recommend_budget")?)?,
        recommend_usage: coerce_flag(object.get("recommend_usage")?)?,
        tech_detail: coerce_flag(object.get("tech_detail")?)?,
    })
}

/// Generates batches of labelled questions.
#[derive(Debug, Clone)]
pub struct QuestionGenTask {
    options: GenerationOptions,
}

impl Default for QuestionGenTask {
    fn default() -> Self {
        Self {
            options: GenerationOptions::creative(),
        }
    }
}

impl QuestionGenTask {
    pub fn new() -> Self {
        Self::default()
    }
}

const GENERATION_SYSTEM_PROMPT: &str = "You write realistic Vietnamese questions that \
shoppers ask a laptop store. Mix budget questions, use-case questions and \
specification questions, vary the tone, and mark each question with 0/1 flags \
recommend_budget, recommend_usage and tech_detail (several may be 1).";

impl EnrichTask for QuestionGenTask {
    type Input = QuestionBatch;
    type Output = Vec<GeneratedQuestion>;

    fn name(&self) -> &'static str {
        "question_gen"
    }

    fn key(&self, input: &QuestionBatch) -> String {
        input.id.clone()
    }

    fn build_request(&self, input: &QuestionBatch) -> LlmRequest {
        let context = if input.laptops.is_empty() {
            "No reference laptops; use common market models.".to_string()
        } else {
            input
                .laptops
                .iter()
                .enumerate()
                .map(|(i, specs)| {
                    let fields = specs
                        .iter()
                        .map(|(k, v)| format!("{}: {}", k, v))
                        .collect::<Vec<_>>()
                        .join("; ");
                    format!("{}. {}", i + 1, fields)
                })
                .collect::<Vec<_>>()
                .join("\n")
        };
        let prompt = format!(
            "Reference laptops:\n{}\n\nWrite exactly {} questions. Reply with JSON: \
             {{\"generated_data\": [{{\"question\": string, \"recommend_budget\": 0|1, \
             \"recommend_usage\": 0|1, \"tech_detail\": 0|1}}]}}",
            context, input.count
        );
        LlmRequest::new(prompt)
            .with_system(GENERATION_SYSTEM_PROMPT)
            .with_options(self.options.clone())
    }

    fn parse(&self, input: &QuestionBatch, raw: &str) -> Result<Vec<GeneratedQuestion>, AppError> {
        let value = parse_llm_json(raw)?;
        let items = value
            .get("generated_data")
            .and_then(Value::as_array)
            .ok_or_else(|| {
                AppError::MalformedResponse("'generated_data' is not a list".to_string())
            })?;

        let questions: Vec<GeneratedQuestion> = items.iter().filter_map(parse_item).collect();
        let skipped = items.len() - questions.len();
        if skipped > 0 {
            tracing::warn!(batch = input.id.as_str(), skipped, "Skipped malformed items");
        }
        Ok(questions.into_iter().take(input.count).collect())
    }
}

/// Appends generated batches to the question CSV, one row per question.
pub struct QuestionSink {
    appender: CsvAppender,
}

impl QuestionSink {
    pub fn open(path: &Path) -> Result<Self, AppError> {
        Ok(Self {
            appender: CsvAppender::open(path, &GeneratedQuestion::COLUMNS)?,
        })
    }
}

impl ResultSink<Vec<GeneratedQuestion>> for QuestionSink {
    fn write_batch(&mut self, batch: Vec<Vec<GeneratedQuestion>>) -> Result<usize, AppError> {
        let rows: Vec<GeneratedQuestion> = batch.into_iter().flatten().collect();
        self.appender.append(&rows)
    }
}
