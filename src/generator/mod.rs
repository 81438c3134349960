//! Structured-generation requests and response parsing.

pub mod openai;

use async_trait::async_trait;
use serde_json::Value;

use crate::error::ProviderError;

/// One validated entry from a generation response; its schema is owned by the prompt.
pub type StructuredEntry = Value;

/// Request envelope shared by the various providers.
#[derive(Debug, Clone, Copy)]
pub struct GenerationRequest<'a> {
    /// Fixed instruction context.
    pub system: &'a str,
    /// Retrieved chunk texts for this batch.
    pub user: &'a str,
    /// Sampling temperature.
    pub temperature: f32,
}

/// Trait implemented by concrete chat-completion providers.
#[async_trait]
pub trait GenerationProvider: Send + Sync {
    /// Returns the raw assistant text for `request`.
    async fn complete(&self, request: &GenerationRequest<'_>) -> Result<String, ProviderError>;
}

/// Default instruction for DFMEA generation over retrieved chunks.
pub const DEFAULT_SYSTEM_PROMPT: &str = "\
You are a DFMEA analyst with deep domain expertise in enterprise mobile computing hardware.

You are provided with raw structured text from two sources:
- SOURCE: knowledge_bank - entries from the DFMEA knowledge bank
- SOURCE: field_issues - real-world field failure reports containing the product type, fault_code, part_category (component) and fault_type

Correlate both sources and produce DFMEA entries as a JSON array. Each entry has:
- ID: auto-incremented integer starting from 1
- Product: product name from field_issues
- Subsystems: list of {Subsystem, Components: list of {Component, Function, FailureModes: list of {FailureMode, Effects: list of {Effect, Severity (1-10)}, Causes: list of {Cause, Occurrence (1-10), Detection (1-10), Controls Prevention (1-3 items), Controls Detection (1-3 items), Recommended Actions (1-3 items), RPN (Severity x Occurrence x Detection), linked_to_dfmea_kb (boolean)}}}}

RULES:
- Use only data from the chunked input text.
- Return pure valid JSON starting with '[' - no explanations, no markdown, no code fences.
- Return 1-3 DFMEA entries per batch.
- Create at least 50 percent of the entries as new failure modes inferred from field_issues.
- Numeric fields are integers; use [] for missing lists.
- Never leave Controls Prevention, Controls Detection or Recommended Actions empty.
- Stick to hardware issues and concrete DFMEA practice; avoid generic statements.";

/// Prefix placed before the joined chunk texts in the user message.
pub const USER_PREAMBLE: &str = "Here are relevant data chunks:\n\n";

/// Builds the user message for one batch of chunk texts.
pub fn user_message<S: AsRef<str>>(texts: &[S]) -> String {
    let mut message = String::from(USER_PREAMBLE);
    for (idx, text) in texts.iter().enumerate() {
        if idx > 0 {
            message.push_str("\n\n");
        }
        message.push_str(text.as_ref());
    }
    message
}

/// Why a response did not yield entries.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParseFailure {
    /// Not valid JSON after fence stripping.
    InvalidJson(String),
    /// Valid JSON, but not an array.
    NotAnArray,
    /// An empty array.
    Empty,
}

impl From<ParseFailure> for ProviderError {
    fn from(failure: ParseFailure) -> Self {
        let reason = match failure {
            ParseFailure::InvalidJson(err) => format!("response is not JSON: {err}"),
            ParseFailure::NotAnArray => "response is not a JSON array".to_string(),
            ParseFailure::Empty => "response is an empty JSON array".to_string(),
        };
        ProviderError::Malformed(reason)
    }
}

/// Removes an optional leading ```` ``` ```` fence (with an optional `json`
/// tag, any case) and an optional trailing fence.
pub fn strip_code_fences(raw: &str) -> &str {
    let mut text = raw.trim();
    if let Some(rest) = text.strip_prefix("```") {
        text = match rest.get(..4) {
            Some(tag) if tag.eq_ignore_ascii_case("json") => &rest[4..],
            _ => rest,
        };
        text = text.trim_start();
    }
    if let Some(rest) = text.strip_suffix("```") {
        text = rest.trim_end();
    }
    text
}

/// Parses a generation response into a non-empty list of entries.
pub fn parse_entries(raw: &str) -> Result<Vec<StructuredEntry>, ParseFailure> {
    let cleaned = strip_code_fences(raw);
    let value: Value =
        serde_json::from_str(cleaned).map_err(|err| ParseFailure::InvalidJson(err.to_string()))?;
    match value {
        Value::Array(entries) if entries.is_empty() => Err(ParseFailure::Empty),
        Value::Array(entries) => Ok(entries),
        _ => Err(ParseFailure::NotAnArray),
    }
}
