//! Question intent classifier.
//!
//! Each customer question is cleaned up by the model, tagged with zero or
//! more intents from [`INTENTS`] and marked as kept or dropped. The result
//! is one row per question; resume is keyed on the original question text.

use std::path::Path;

use serde_json::Value;

use crate::error::AppError;
use crate::json::parse_llm_json;
use crate::models::{GenerationOptions, LlmRequest};
use crate::pipeline::EnrichTask;
use crate::table::{Record, ToRecord, read_table};

/// One entry of the intent catalog.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Intent {
    pub id: i64,
    pub name: &'static str,
    pub description: &'static str,
    pub keywords: &'static [&'static str],
}

pub const OTHER_INTENT_ID: i64 = -1;

pub const INTENTS: [Intent; 4] = [
    Intent {
        id: 0,
        name: "recommend_budget",
        description: "Recommendation within a price range",
        keywords: &["tầm giá", "ngân sách", "triệu", "dưới", "khoảng"],
    },
    Intent {
        id: 1,
        name: "recommend_usage",
        description: "Recommendation for a use case",
        keywords: &["học tập", "văn phòng", "chơi game", "đồ họa", "lập trình"],
    },
    Intent {
        id: 2,
        name: "tech_detail",
        description: "Question about technical specifications",
        keywords: &["cpu", "ram", "ssd", "màn hình", "pin", "card rời"],
    },
    Intent {
        id: OTHER_INTENT_ID,
        name: "other",
        description: "Not a what/which/yes-no question, or unrelated to the intents above",
        keywords: &[],
    },
];

/// Catalog name for an intent id.
pub fn intent_name(id: i64) -> Option<&'static str> {
    INTENTS.iter().find(|i| i.id == id).map(|i| i.name)
}

/// Default input column holding the question text.
pub const DEFAULT_QUESTION_COLUMN: &str = "content";

pub const MALFORMED_MARKER: &str = "ERROR_LLM_RESPONSE_MALFORMED";
pub const RETURNED_NONE_MARKER: &str = "ERROR_PROCESSING_RETURNED_NONE";
pub const EXCEPTION_MARKER: &str = "ERROR_PROCESSING_EXCEPTION";

const REQUIRED_KEYS: [&str; 4] = [
    "original_question",
    "keep_question",
    "corrected_question",
    "assigned_intent_id",
];

/// One classified question.
#[derive(Debug, Clone, PartialEq)]
pub struct IntentRecord {
    pub original_question: String,
    pub keep_question: i64,
    pub corrected_question: Option<String>,
    pub assigned_intent_id: Vec<i64>,
    pub assigned_intent_name: Vec<String>,
}

impl IntentRecord {
    pub const COLUMNS: [&'static str; 5] = [
        "original_question",
        "keep_question",
        "corrected_question",
        "assigned_intent_id",
        "assigned_intent_name",
    ];

    /// Row written when no usable answer was obtained.
    pub fn fallback(question: &str, marker: &str) -> Self {
        Self {
            original_question: question.to_string(),
            keep_question: 0,
            corrected_question: Some(marker.to_string()),
            assigned_intent_id: vec![OTHER_INTENT_ID],
            assigned_intent_name: vec!["other".to_string()],
        }
    }
}

impl ToRecord for IntentRecord {
    fn to_record(&self) -> Record {
        let mut record = Record::new();
        record.insert("original_question".into(), self.original_question.clone());
        record.insert("keep_question".into(), self.keep_question.to_string());
        record.insert(
            "corrected_question".into(),
            self.corrected_question.clone().unwrap_or_default(),
        );
        record.insert(
            "assigned_intent_id".into(),
            Value::from(self.assigned_intent_id.clone()).to_string(),
        );
        record.insert(
            "assigned_intent_name".into(),
            Value::from(self.assigned_intent_name.clone()).to_string(),
        );
        record
    }
}

/// Questions from `column` of the input file, in file order. Empty cells
/// become empty strings so the pipeline can count them.
pub fn load_questions(path: &Path, column: &str) -> Result<Vec<String>, AppError> {
    let table = read_table(path)?;
    let idx = table
        .column_index(column)
        .ok_or_else(|| AppError::MissingColumn(column.to_string()))?;
    Ok(table
        .rows
        .into_iter()
        .map(|mut row| row.get_mut(idx).and_then(Option::take).unwrap_or_default())
        .collect())
}

fn coerce_keep(value: &Value) -> i64 {
    match value {
        Value::Number(n) => n.as_i64().unwrap_or(0),
        Value::Bool(b) => i64::from(*b),
        Value::String(s) => s.trim().parse().unwrap_or(0),
        _ => 0,
    }
}

/// `[n, ...]` is kept as is, a bare integer is wrapped, anything else falls
/// back to `[-1]` for dropped questions and `[]` for kept ones.
fn coerce_intent_ids(value: &Value, keep: i64) -> Vec<i64> {
    match value {
        Value::Null => Vec::new(),
        Value::Array(items) => items.iter().filter_map(Value::as_i64).collect(),
        Value::Number(n) => match n.as_i64() {
            Some(id) => vec![id],
            None if keep == 0 => vec![OTHER_INTENT_ID],
            None => Vec::new(),
        },
        _ if keep == 0 => vec![OTHER_INTENT_ID],
        _ => Vec::new(),
    }
}

/// Classifies questions into [`INTENTS`].
#[derive(Debug, Clone)]
pub struct IntentTask {
    options: GenerationOptions,
}

impl Default for IntentTask {
    fn default() -> Self {
        Self {
            options: GenerationOptions::deterministic(),
        }
    }
}

impl IntentTask {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_options(mut self, options: GenerationOptions) -> Self {
        self.options = options;
        self
    }

    fn system_prompt() -> String {
        let catalog = INTENTS
            .iter()
            .map(|intent| {
                if intent.keywords.is_empty() {
                    format!("- {} ({}): {}", intent.id, intent.name, intent.description)
                } else {
                    format!(
                        "- {} ({}): {}. Typical words: {}",
                        intent.id,
                        intent.name,
                        intent.description,
                        intent.keywords.join(", ")
                    )
                }
            })
            .collect::<Vec<_>>()
            .join("\n");

        format!(
            "You review Vietnamese customer questions about laptops.\n\
             Keep a question (keep_question = 1) only if it is a what, which or yes/no \
             question matching at least one intent below; otherwise keep_question = 0 and \
             the intent list is [{other}].\n\
             Rewrite kept questions without greetings, typos or filler words.\n\
             Intents:\n{catalog}\n\
             Reply with a JSON object: {{\"original_question\": string, \"keep_question\": 0 or 1, \
             \"corrected_question\": string or null, \"assigned_intent_id\": list of ids}}.",
            other = OTHER_INTENT_ID,
            catalog = catalog
        )
    }
}

impl EnrichTask for IntentTask {
    type Input = String;
    type Output = IntentRecord;

    fn name(&self) -> &'static str {
        "intent"
    }

    fn key(&self, input: &String) -> String {
        input.clone()
    }

    fn build_request(&self, input: &String) -> LlmRequest {
        LlmRequest::new(format!("Question: \"{}\"", input))
            .with_system(Self::system_prompt())
            .with_options(self.options.clone())
    }

    fn parse(&self, input: &String, raw: &str) -> Result<IntentRecord, AppError> {
        let value = parse_llm_json(raw)?;
        let Some(object) = value.as_object() else {
            return Err(AppError::MalformedResponse(
                "expected a JSON object".to_string(),
            ));
        };

        let missing: Vec<&str> = REQUIRED_KEYS
            .iter()
            .copied()
            .filter(|key| !object.contains_key(*key))
            .collect();
        if !missing.is_empty() {
            return Err(AppError::MalformedResponse(format!(
                "missing keys: {}",
                missing.join(", ")
            )));
        }

        let keep_question = coerce_keep(&object["keep_question"]);
        let assigned_intent_id = coerce_intent_ids(&object["assigned_intent_id"], keep_question);
        let assigned_intent_name = assigned_intent_id
            .iter()
            .filter_map(|id| intent_name(*id))
            .map(str::to_string)
            .collect();

        if object["original_question"].as_str() != Some(input.as_str()) {
            tracing::debug!(question = input.as_str(), "Model altered original_question");
        }

        Ok(IntentRecord {
            original_question: input.clone(),
            keep_question,
            corrected_question: object["corrected_question"].as_str().map(str::to_string),
            assigned_intent_id,
            assigned_intent_name,
        })
    }

    fn fallback(&self, input: &String, error: &AppError) -> Option<IntentRecord> {
        // Exhausted or refused calls produced no answer at all
        let marker = match error {
            AppError::MalformedResponse(_) => MALFORMED_MARKER,
            AppError::SerializationError(_) => RETURNED_NONE_MARKER,
            e if e.is_call_failure() => RETURNED_NONE_MARKER,
            _ => EXCEPTION_MARKER,
        };
        Some(IntentRecord::fallback(input, marker))
    }
}
