//! Sample grading.
//!
//! A case with assertions is graded deterministically. Otherwise a judge
//! model compares the response to the expected behavior.

use std::sync::Arc;

use serde::Deserialize;
use serde_json::json;
use tracing::debug;

use crate::assertions::run_assertions;
use crate::domain::{preview, EvalCase, GradeResult, GradingMode, ToolCall};
use crate::model::{parse_structured, AgentReply, ModelCaller, ModelError};

/// Reasoning recorded when the judge reply is not a valid verdict.
pub const JUDGE_PARSE_FAILURE: &str = "Failed to parse judge output";

#[derive(Debug, Deserialize)]
struct Judgment {
    #[serde(rename = "pass")]
    passed: bool,
    #[serde(default)]
    reasoning: String,
}

/// JSON schema the judge reply must follow.
pub fn judge_schema() -> serde_json::Value {
    json!({
        "type": "object",
        "properties": {
            "pass": {
                "type": "boolean",
                "description": "Whether the response meets the expected behavior"
            },
            "reasoning": {
                "type": "string",
                "description": "One sentence explanation of the judgment"
            }
        },
        "required": ["pass", "reasoning"]
    })
}

/// Render tool calls as `- name: <json>` lines.
pub fn format_tool_calls(tool_calls: &[ToolCall]) -> String {
    if tool_calls.is_empty() {
        return "(no tools used)".to_string();
    }
    tool_calls
        .iter()
        .map(|call| {
            let input = serde_json::to_string_pretty(&call.input).unwrap_or_else(|_| "{}".into());
            format!("- {}: {}", call.name, input)
        })
        .collect::<Vec<_>>()
        .join("\n")
}

/// Build the rubric request sent to the judge.
pub fn judge_prompt(case: &EvalCase, reply: &AgentReply) -> String {
    format!(
        "You are grading an AI assistant's response against expected behavior.\n\
         \n\
         ## Prompt\n{prompt}\n\
         \n\
         ## Response\n{response}\n\
         \n\
         ## Tools used\n{tools}\n\
         \n\
         ## Expected behavior\n{expected}\n\
         \n\
         Decide whether the response meets the expected behavior. \
         Judge substance, not wording. Reply with JSON: \
         {{\"pass\": true|false, \"reasoning\": \"one sentence\"}}.",
        prompt = case.prompt.render(),
        response = reply.text,
        tools = format_tool_calls(&reply.tool_calls),
        expected = case.expected,
    )
}

pub fn grading_mode(case: &EvalCase) -> GradingMode {
    if case.assertions.is_empty() {
        GradingMode::Judge
    } else {
        GradingMode::Assertions
    }
}

/// Grades agent replies for eval cases.
#[derive(Clone)]
pub struct Grader {
    judge: Arc<dyn ModelCaller>,
}

impl Grader {
    pub fn new(judge: Arc<dyn ModelCaller>) -> Self {
        Self { judge }
    }

    /// Grade one reply.
    ///
    /// Only a failed judge call is an error; an unparseable judge reply is a
    /// failing grade.
    pub async fn grade(
        &self,
        case: &EvalCase,
        reply: &AgentReply,
    ) -> Result<GradeResult, ModelError> {
        let (passed, reasoning) = match grading_mode(case) {
            GradingMode::Assertions => {
                let outcome = run_assertions(&reply.text, &case.assertions, &reply.tool_calls);
                (outcome.passed, outcome.reasoning)
            }
            GradingMode::Judge => {
                let raw = self
                    .judge
                    .call_structured(&judge_prompt(case, reply), &judge_schema())
                    .await?;
                match parse_structured::<Judgment>(&raw) {
                    Ok(j) => (j.passed, j.reasoning),
                    Err(e) => {
                        debug!(eval = %case.id, error = %e, "judge output did not parse");
                        (false, JUDGE_PARSE_FAILURE.to_string())
                    }
                }
            }
        };

        Ok(GradeResult {
            passed,
            reasoning,
            response_preview: preview(&reply.text),
            tool_calls: reply.tool_calls.clone(),
        })
    }
}
