//! Request and record types shared across crates.

use serde::{Deserialize, Serialize};

use crate::table::{Record, ToRecord};

/// Sampling parameters for one LLM call.
///
/// Providers map these onto their own request shape and ignore the fields
/// they do not support.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenerationOptions {
    pub temperature: f32,
    pub top_p: Option<f32>,
    pub top_k: Option<u32>,
    pub max_output_tokens: u32,
    /// Ask the provider for `application/json` output.
    pub json_output: bool,
}

impl Default for GenerationOptions {
    fn default() -> Self {
        Self {
            temperature: 0.2,
            top_p: None,
            top_k: None,
            max_output_tokens: 1024,
            json_output: false,
        }
    }
}

impl GenerationOptions {
    /// Low temperature JSON output, used for fill and classification.
    pub fn deterministic() -> Self {
        Self {
            temperature: 0.1,
            max_output_tokens: 1024,
            json_output: true,
            ..Self::default()
        }
    }

    /// Higher temperature with nucleus and top-k sampling, used for
    /// question generation.
    pub fn creative() -> Self {
        Self {
            temperature: 0.7,
            top_p: Some(0.95),
            top_k: Some(40),
            max_output_tokens: 4096,
            json_output: true,
        }
    }

    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = temperature;
        self
    }

    pub fn with_max_output_tokens(mut self, tokens: u32) -> Self {
        self.max_output_tokens = tokens;
        self
    }
}

/// A single prompt sent to an [`crate::traits::LlmProvider`].
#[derive(Debug, Clone, PartialEq)]
pub struct LlmRequest {
    /// Optional system instruction.
    pub system: Option<String>,
    pub prompt: String,
    pub options: GenerationOptions,
}

impl LlmRequest {
    pub fn new(prompt: impl Into<String>) -> Self {
        Self {
            system: None,
            prompt: prompt.into(),
            options: GenerationOptions::default(),
        }
    }

    pub fn with_system(mut self, system: impl Into<String>) -> Self {
        self.system = Some(system.into());
        self
    }

    pub fn with_options(mut self, options: GenerationOptions) -> Self {
        self.options = options;
        self
    }
}

/// One question/answer thread from the product comment API.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct QaRecord {
    pub comment_id: String,
    pub question: String,
    pub page_name: String,
    pub question_sent_from: String,
    pub question_created_at: String,
    pub product_id: String,
    pub page_url: String,
    pub customer_id: String,
    pub customer_fullname: String,
    pub answer_contents: String,
    pub answer_created_at: String,
    pub answerer_names: String,
    pub answerer_ids: String,
    pub is_admin: String,
}

impl QaRecord {
    pub const COLUMNS: [&'static str; 14] = [
        "comment_id",
        "question",
        "page_name",
        "question_sent_from",
        "question_created_at",
        "product_id",
        "page_url",
        "customer_id",
        "customer_fullname",
        "answer_contents",
        "answer_created_at",
        "answerer_names",
        "answerer_ids",
        "is_admin",
    ];
}

impl ToRecord for QaRecord {
    fn to_record(&self) -> Record {
        let values = [
            &self.comment_id,
            &self.question,
            &self.page_name,
            &self.question_sent_from,
            &self.question_created_at,
            &self.product_id,
            &self.page_url,
            &self.customer_id,
            &self.customer_fullname,
            &self.answer_contents,
            &self.answer_created_at,
            &self.answerer_names,
            &self.answerer_ids,
            &self.is_admin,
        ];
        Self::COLUMNS
            .iter()
            .zip(values)
            .map(|(column, value)| (column.to_string(), value.clone()))
            .collect()
    }
}

/// One color/configuration option scraped from a product page.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct VariantRecord {
    pub root_product_id: String,
    pub child_product_id: String,
    pub name: String,
    pub link: String,
    pub image: String,
    pub color: String,
    pub price: String,
    pub special_features: String,
    pub url: String,
}

impl VariantRecord {
    pub const COLUMNS: [&'static str; 9] = [
        "root_product_id",
        "child_product_id",
        "name",
        "link",
        "image",
        "color",
        "price",
        "special_features",
        "url",
    ];
}

impl ToRecord for VariantRecord {
    fn to_record(&self) -> Record {
        let values = [
            &self.root_product_id,
            &self.child_product_id,
            &self.name,
            &self.link,
            &self.image,
            &self.color,
            &self.price,
            &self.special_features,
            &self.url,
        ];
        Self::COLUMNS
            .iter()
            .zip(values)
            .map(|(column, value)| (column.to_string(), value.clone()))
            .collect()
    }
}
