//! Deterministic assertion checkers.
//!
//! Each checker inspects a response and returns `None` on success or a
//! failure message prefixed with the assertion kind. String checks compare
//! case-insensitively; `regex` runs against the raw response.

use std::collections::HashSet;

use regex::Regex;

use crate::domain::{Assertion, AssertionKind, ToolCall};

/// Reasoning reported when every assertion holds.
pub const ALL_PASSED: &str = "All assertions passed";

/// The response as seen by the checkers.
pub struct CheckInput<'a> {
    pub raw: &'a str,
    pub lower: String,
    pub tool_names: HashSet<&'a str>,
}

impl<'a> CheckInput<'a> {
    pub fn new(response: &'a str, tool_calls: &'a [ToolCall]) -> Self {
        Self {
            raw: response,
            lower: response.to_lowercase(),
            tool_names: tool_calls.iter().map(|tc| tc.name.as_str()).collect(),
        }
    }
}

/// Outcome of running a list of assertions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AssertionOutcome {
    pub passed: bool,
    pub reasoning: String,
}

pub fn check_contains(value: &str, input: &CheckInput<'_>) -> Option<String> {
    if input.lower.contains(&value.to_lowercase()) {
        None
    } else {
        Some(format!("contains: expected response to contain '{value}'"))
    }
}

pub fn check_not_contains(value: &str, input: &CheckInput<'_>) -> Option<String> {
    if input.lower.contains(&value.to_lowercase()) {
        Some(format!(
            "not_contains: expected response NOT to contain '{value}'"
        ))
    } else {
        None
    }
}

pub fn check_regex(value: &str, input: &CheckInput<'_>) -> Option<String> {
    match Regex::new(value) {
        Ok(re) if re.is_match(input.raw) => None,
        Ok(_) => Some(format!("regex: pattern '{value}' did not match")),
        Err(e) => Some(format!("regex: invalid pattern '{value}': {e}")),
    }
}

pub fn check_starts_with(value: &str, input: &CheckInput<'_>) -> Option<String> {
    if input.lower.trim_start().starts_with(&value.to_lowercase()) {
        None
    } else {
        Some(format!(
            "starts_with: expected response to start with '{value}'"
        ))
    }
}

pub fn check_ends_with(value: &str, input: &CheckInput<'_>) -> Option<String> {
    if input.lower.trim_end().ends_with(&value.to_lowercase()) {
        None
    } else {
        Some(format!("ends_with: expected response to end with '{value}'"))
    }
}

pub fn check_tool_called(value: &str, input: &CheckInput<'_>) -> Option<String> {
    if input.tool_names.contains(value) {
        None
    } else {
        Some(format!("tool_called: expected tool '{value}' to be called"))
    }
}

pub fn check_tool_not_called(value: &str, input: &CheckInput<'_>) -> Option<String> {
    if input.tool_names.contains(value) {
        Some(format!(
            "tool_not_called: expected tool '{value}' NOT to be called"
        ))
    } else {
        None
    }
}

/// Run a single assertion.
pub fn check(assertion: &Assertion, input: &CheckInput<'_>) -> Option<String> {
    let value = assertion.value.as_str();
    match assertion.kind {
        AssertionKind::Contains => check_contains(value, input),
        AssertionKind::NotContains => check_not_contains(value, input),
        AssertionKind::Regex => check_regex(value, input),
        AssertionKind::StartsWith => check_starts_with(value, input),
        AssertionKind::EndsWith => check_ends_with(value, input),
        AssertionKind::ToolCalled => check_tool_called(value, input),
        AssertionKind::ToolNotCalled => check_tool_not_called(value, input),
    }
}

/// Evaluate every assertion with AND semantics.
///
/// Failure messages are joined with `"; "` in assertion order.
pub fn run_assertions(
    response: &str,
    assertions: &[Assertion],
    tool_calls: &[ToolCall],
) -> AssertionOutcome {
    let input = CheckInput::new(response, tool_calls);
    let failures: Vec<String> = assertions
        .iter()
        .filter_map(|a| check(a, &input))
        .collect();

    if failures.is_empty() {
        AssertionOutcome {
            passed: true,
            reasoning: ALL_PASSED.to_string(),
        }
    } else {
        AssertionOutcome {
            passed: false,
            reasoning: failures.join("; "),
        }
    }
}
