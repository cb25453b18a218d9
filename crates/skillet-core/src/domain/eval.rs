//! Eval case definitions: prompts, expected behavior, and deterministic assertions.

use std::fmt;

use serde::{Deserialize, Serialize};

/// A prompt sent to the agent: either one message or an ordered conversation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Prompt {
    Single(String),
    Turns(Vec<String>),
}

impl Prompt {
    /// The user turns in order. A single prompt is one turn.
    pub fn turns(&self) -> Vec<&str> {
        match self {
            Prompt::Single(text) => vec![text.as_str()],
            Prompt::Turns(turns) => turns.iter().map(String::as_str).collect(),
        }
    }

    /// Render for a judge: multi-turn prompts become `Turn i: <text>` lines.
    pub fn render(&self) -> String {
        match self {
            Prompt::Single(text) => text.clone(),
            Prompt::Turns(turns) => turns
                .iter()
                .enumerate()
                .map(|(i, turn)| format!("Turn {}: {}", i + 1, turn))
                .collect::<Vec<_>>()
                .join("\n"),
        }
    }
}

impl From<&str> for Prompt {
    fn from(value: &str) -> Self {
        Prompt::Single(value.to_string())
    }
}

/// The predicate an [`Assertion`] applies to a response.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AssertionKind {
    Contains,
    NotContains,
    Regex,
    StartsWith,
    EndsWith,
    ToolCalled,
    ToolNotCalled,
}

impl AssertionKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            AssertionKind::Contains => "contains",
            AssertionKind::NotContains => "not_contains",
            AssertionKind::Regex => "regex",
            AssertionKind::StartsWith => "starts_with",
            AssertionKind::EndsWith => "ends_with",
            AssertionKind::ToolCalled => "tool_called",
            AssertionKind::ToolNotCalled => "tool_not_called",
        }
    }
}

impl fmt::Display for AssertionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A deterministic check on an agent response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Assertion {
    #[serde(rename = "type")]
    pub kind: AssertionKind,
    #[serde(default)]
    pub value: String,
}

impl Assertion {
    pub fn new(kind: AssertionKind, value: impl Into<String>) -> Self {
        Self {
            kind,
            value: value.into(),
        }
    }
}

/// A single test scenario for a skill.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EvalCase {
    /// Source path relative to the eval set root.
    pub id: String,

    /// Optional human-readable name.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,

    pub prompt: Prompt,

    /// Natural-language description of acceptable behavior.
    pub expected: String,

    /// When non-empty the case is graded deterministically instead of by a judge.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub assertions: Vec<Assertion>,

    /// Tool names offered to the agent for this case.
    #[serde(default, alias = "allowed_tools", skip_serializing_if = "Vec::is_empty")]
    pub tools: Vec<String>,
}

impl EvalCase {
    /// Create a judge-graded case.
    pub fn new(id: impl Into<String>, prompt: impl Into<Prompt>, expected: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: None,
            prompt: prompt.into(),
            expected: expected.into(),
            assertions: Vec::new(),
            tools: Vec::new(),
        }
    }

    /// Add an assertion, switching the case to deterministic grading.
    pub fn with_assertion(mut self, assertion: Assertion) -> Self {
        self.assertions.push(assertion);
        self
    }

    pub fn with_tool(mut self, name: impl Into<String>) -> Self {
        self.tools.push(name.into());
        self
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Label used in progress rows and reports.
    pub fn label(&self) -> &str {
        self.name.as_deref().unwrap_or(&self.id)
    }
}
