//! Extraction results and token accounting.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::types::requirement::RequirementHash;

/// Token counts for one LLM call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
}

impl TokenUsage {
    pub fn new(prompt_tokens: u64, completion_tokens: u64) -> Self {
        Self {
            prompt_tokens,
            completion_tokens,
        }
    }

    /// Worst-case usage for a prompt, assuming ~4 characters per token and
    /// the full output allowance being used.
    pub fn estimate(prompt: &str, max_output_tokens: u32) -> Self {
        let chars = prompt.chars().count() as u64;
        Self {
            prompt_tokens: chars.div_ceil(4),
            completion_tokens: u64::from(max_output_tokens),
        }
    }

    pub fn total(&self) -> u64 {
        self.prompt_tokens + self.completion_tokens
    }
}

/// Output of a successful extraction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExtractionResult {
    /// Provider that served the call
    pub provider: String,
    pub model: String,

    /// Raw model output. Callers interpret it against the requirement set.
    pub content: String,

    pub usage: TokenUsage,
    pub cost: Decimal,

    /// Requirement set the extraction was run against
    pub requirement_hash: RequirementHash,

    pub extracted_at: DateTime<Utc>,
}

impl ExtractionResult {
    /// Parse the content as JSON, if the model produced JSON.
    pub fn as_json(&self) -> Option<serde_json::Value> {
        serde_json::from_str(self.content.trim()).ok()
    }
}
