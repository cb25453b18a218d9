//! Model caller abstraction.
//!
//! Every backend implements [`ModelCaller`]: `call` runs the agent under test
//! and `call_structured` asks for a JSON body matching a schema (used by the
//! judge). The engine never interprets natural language itself.

pub mod anthropic;
pub mod scripted;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::domain::{Prompt, ToolCall};

pub use anthropic::{AnthropicConfig, AnthropicModelCaller};
pub use scripted::ScriptedModelCaller;

/// Per-call options for the agent under test.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CallOptions {
    /// Skill text installed as the system prompt. `None` runs the bare agent.
    pub system_prompt: Option<String>,
    /// Override of the backend's default token limit.
    pub max_tokens: Option<u32>,
    /// Tool names the agent may invoke.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tools: Vec<String>,
}

impl CallOptions {
    pub fn with_system_prompt(system_prompt: Option<&str>) -> Self {
        Self {
            system_prompt: system_prompt.map(str::to_string),
            ..Self::default()
        }
    }

    pub fn with_tools(mut self, tools: &[String]) -> Self {
        self.tools = tools.to_vec();
        self
    }
}

/// The agent's final text plus every tool invocation it made.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AgentReply {
    pub text: String,
    #[serde(default)]
    pub tool_calls: Vec<ToolCall>,
}

impl AgentReply {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            tool_calls: Vec::new(),
        }
    }

    pub fn with_tool_call(mut self, call: ToolCall) -> Self {
        self.tool_calls.push(call);
        self
    }
}

/// Errors from a model call.
#[derive(Debug, Clone, Error)]
pub enum ModelError {
    #[error("transport error: {0}")]
    Transport(String),

    #[error("model call timed out")]
    Timeout,

    #[error("rate limited or overloaded (status {status})")]
    Overloaded { status: u16 },

    /// The call completed but produced nothing to grade.
    #[error("model call returned no result")]
    EmptyResult,

    #[error("api error (status {status}): {message}")]
    Api { status: u16, message: String },

    #[error("unexpected response: {0}")]
    Protocol(String),

    #[error("model caller not configured: {0}")]
    Config(String),
}

impl ModelError {
    /// Whether retrying the same call may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            ModelError::Transport(_)
                | ModelError::Timeout
                | ModelError::Overloaded { .. }
                | ModelError::EmptyResult
        )
    }
}

impl From<reqwest::Error> for ModelError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            ModelError::Timeout
        } else if err.is_decode() {
            ModelError::Protocol(err.to_string())
        } else {
            ModelError::Transport(err.to_string())
        }
    }
}

/// Backend that runs prompts against a model.
#[async_trait]
pub trait ModelCaller: Send + Sync {
    /// Run the agent on `prompt`, one user turn at a time.
    async fn call(&self, prompt: &Prompt, options: &CallOptions) -> Result<AgentReply, ModelError>;

    /// Ask for a reply body conforming to `schema`. The body is returned raw;
    /// callers parse it with [`parse_structured`].
    async fn call_structured(
        &self,
        prompt: &str,
        schema: &serde_json::Value,
    ) -> Result<String, ModelError>;
}

/// Strip surrounding markdown code fences from model output.
pub fn strip_code_fences(text: &str) -> &str {
    let mut body = text.trim();
    for opener in ["```markdown", "```json", "```"] {
        if let Some(rest) = body.strip_prefix(opener) {
            body = rest.trim();
            break;
        }
    }
    if let Some(rest) = body.strip_suffix("```") {
        body = rest.trim();
    }
    body
}

/// Parse a structured reply, tolerating code fences around the JSON.
pub fn parse_structured<T: DeserializeOwned>(raw: &str) -> Result<T, serde_json::Error> {
    serde_json::from_str(strip_code_fences(raw))
}
