//! Graded sample results.

use serde::{Deserialize, Serialize};

/// Maximum number of characters kept in [`GradeResult::response_preview`].
pub const PREVIEW_CHARS: usize = 500;

/// A tool invocation observed in an agent reply.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    pub name: String,
    #[serde(default)]
    pub input: serde_json::Value,
}

impl ToolCall {
    pub fn new(name: impl Into<String>, input: serde_json::Value) -> Self {
        Self {
            name: name.into(),
            input,
        }
    }
}

/// How a sample was graded. Part of the cache fingerprint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GradingMode {
    Assertions,
    Judge,
}

/// The verdict for one (prompt, response) pair.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GradeResult {
    pub passed: bool,
    pub reasoning: String,
    pub response_preview: String,
    #[serde(default)]
    pub tool_calls: Vec<ToolCall>,
}

impl GradeResult {
    /// A failed grade for a sample that produced no gradable response.
    pub fn failed(reasoning: impl Into<String>) -> Self {
        Self {
            passed: false,
            reasoning: reasoning.into(),
            response_preview: String::new(),
            tool_calls: Vec::new(),
        }
    }
}

/// Truncate `response` to [`PREVIEW_CHARS`] characters, marking the cut.
pub fn preview(response: &str) -> String {
    if response.chars().count() <= PREVIEW_CHARS {
        return response.to_string();
    }
    let mut out: String = response.chars().take(PREVIEW_CHARS).collect();
    out.push_str("...");
    out
}
