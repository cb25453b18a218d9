//! Model-backed instruction proposer.

use std::fmt::Write as _;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::debug;

use super::{InstructionProposer, ProposalContext};
use crate::domain::{Prompt, Result, SkilletError};
use crate::model::{strip_code_fences, CallOptions, ModelCaller};

/// Upper bound on proposed skill length, in lines.
pub const MAX_SKILL_LINES: usize = 50;

/// Style hints rotated across proposals to widen the search.
pub const TIPS: [&str; 9] = [
    "Be extremely terse - every word must earn its place",
    "Use imperatives: DO this, NEVER do that",
    "Focus on the trigger condition - when exactly should this activate?",
    "Emphasize what NOT to do - the assistant defaults to asking permission",
    "Use bullet points, not paragraphs",
    "Put the most important instruction first",
    "Add a concrete example of correct behavior",
    "Make the description more specific about when to trigger",
    "Use CAPS for critical words like IMMEDIATELY, NEVER, MUST",
];

fn clip(text: &str, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        text.to_string()
    } else {
        let head: String = text.chars().take(max_chars).collect();
        format!("{head}...")
    }
}

/// Render the proposal request for `context`.
pub fn proposal_prompt(context: &ProposalContext, max_lines: usize) -> String {
    let mut failures = String::new();
    for f in &context.failures {
        let _ = writeln!(
            failures,
            "- Prompt: {}\n  Expected: {}\n  Got: {}",
            f.prompt,
            f.expected,
            clip(&f.response_preview, 200)
        );
    }
    if failures.is_empty() {
        failures.push_str("No failures to report\n");
    }

    let mut history = String::new();
    for h in &context.history {
        let _ = writeln!(
            history,
            "- Score: {:.0}%\n  Instruction: {}",
            h.score,
            clip(&h.instruction, 100)
        );
    }
    if history.is_empty() {
        history.push_str("No previous attempts\n");
    }

    let mut examples = String::new();
    for ex in &context.examples {
        let _ = writeln!(
            examples,
            "- Input: {}\n  Expected: {}",
            ex.prompt.render(),
            ex.expected
        );
    }

    let tip = TIPS[context.proposal_index % TIPS.len()];

    format!(
        "Improve this skill so the assistant exhibits the expected behavior.\n\n\
         ## Current skill\n\n{current}\n\n\
         ## Failures\n\n{failures}\n\
         ## Previous attempts\n\n{history}\n\
         ## Examples\n\n{examples}\n\
         ## Constraints\n\n\
         - Keep the skill under {max_lines} lines\n\
         - Rewrite to be minimal instead of appending text\n\
         - Style tip: {tip}\n\n\
         Return ONLY the improved skill text (no explanation, no code fences).",
        current = context.current,
    )
}

/// Asks a model for an improved instruction.
pub struct ModelProposer {
    model: Arc<dyn ModelCaller>,
    max_lines: usize,
}

impl ModelProposer {
    pub fn new(model: Arc<dyn ModelCaller>) -> Self {
        Self {
            model,
            max_lines: MAX_SKILL_LINES,
        }
    }

    pub fn with_max_lines(mut self, max_lines: usize) -> Self {
        self.max_lines = max_lines.max(1);
        self
    }
}

#[async_trait]
impl InstructionProposer for ModelProposer {
    async fn propose(&self, context: &ProposalContext) -> Result<String> {
        let prompt = Prompt::Single(proposal_prompt(context, self.max_lines));
        let reply = self.model.call(&prompt, &CallOptions::default()).await?;

        let body = strip_code_fences(&reply.text);
        let proposal = body
            .lines()
            .take(self.max_lines)
            .collect::<Vec<_>>()
            .join("\n");
        if proposal.trim().is_empty() {
            return Err(SkilletError::Search(
                "proposer returned an empty instruction".to_string(),
            ));
        }
        debug!(lines = proposal.lines().count(), "proposed instruction");
        Ok(proposal)
    }
}
