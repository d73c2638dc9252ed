//! lapbot Client - HTTP clients for external APIs
//!
//! This crate provides HTTP clients for interacting with:
//!
//! - [`gemini`] - Google Gemini `generateContent`
//! - [`together`] - Together AI chat completions (Llama 3.3)
//! - [`cellphones`] - the CellphoneS product, question and recommendation APIs
//! - [`tgdd`] - thegioididong.com product pages
//!
//! # Overview
//!
//! The clients handle authentication, request building, response parsing,
//! and error handling for their respective APIs. They implement the
//! `lapbot_core` traits, so the services in core never see HTTP.

pub mod cellphones;
pub mod gemini;
pub mod provider;
mod retry;
pub mod tgdd;
pub mod together;

// Re-export main client types
pub use cellphones::{CellphonesClient, CellphonesEndpoints};
pub use gemini::GeminiClient;
pub use provider::{LlmConfig, LlmProviderEnum};
pub use tgdd::TgddClient;
pub use together::TogetherClient;
