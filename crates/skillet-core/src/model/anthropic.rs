//! Anthropic Messages API client
//!
//! Runs multi-turn prompts by replaying the conversation one user turn at a
//! time and collecting every `tool_use` block the model emits.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::{AgentReply, CallOptions, ModelCaller, ModelError};
use crate::domain::{Prompt, ToolCall};

const API_VERSION: &str = "2023-06-01";

/// Anthropic client configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnthropicConfig {
    /// API base URL
    pub base_url: String,
    /// Model name used for agent and judge calls
    pub model: String,
    /// API key (required to make calls)
    #[serde(skip_serializing)]
    pub api_key: Option<String>,
    /// Default token limit per reply
    pub max_tokens: u32,
    /// Per-request timeout
    pub request_timeout: Duration,
}

impl Default for AnthropicConfig {
    fn default() -> Self {
        AnthropicConfig {
            base_url: std::env::var("SKILLET_API_URL")
                .unwrap_or_else(|_| "https://api.anthropic.com".to_string()),
            model: std::env::var("SKILLET_MODEL")
                .unwrap_or_else(|_| "claude-sonnet-4-20250514".to_string()),
            api_key: std::env::var("ANTHROPIC_API_KEY").ok(),
            max_tokens: 4096,
            request_timeout: Duration::from_secs(120),
        }
    }
}

impl AnthropicConfig {
    /// Create a new config from environment variables
    pub fn from_env() -> Self {
        Self::default()
    }

    pub fn with_model(mut self, model: &str) -> Self {
        self.model = model.to_string();
        self
    }

    pub fn with_api_key(mut self, key: &str) -> Self {
        self.api_key = Some(key.to_string());
        self
    }

    pub fn with_base_url(mut self, url: &str) -> Self {
        self.base_url = url.trim_end_matches('/').to_string();
        self
    }
}

#[derive(Debug, Serialize)]
struct MessagesRequest<'a> {
    model: &'a str,
    max_tokens: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    system: Option<&'a str>,
    messages: &'a [ApiMessage],
    #[serde(skip_serializing_if = "Vec::is_empty")]
    tools: Vec<ToolDefinition<'a>>,
}

impl<'a> MessagesRequest<'a> {
    fn new(model: &'a str, max_tokens: u32, system: Option<&'a str>, messages: &'a [ApiMessage]) -> Self {
        MessagesRequest {
            model,
            max_tokens,
            system,
            messages,
            tools: Vec::new(),
        }
    }

    fn with_tools(mut self, names: &'a [String]) -> Self {
        self.tools = names.iter().map(|name| ToolDefinition::named(name)).collect();
        self
    }
}

/// Tool declaration. Inputs are left open since calls are only recorded.
#[derive(Debug, Serialize)]
struct ToolDefinition<'a> {
    name: &'a str,
    description: String,
    input_schema: serde_json::Value,
}

impl<'a> ToolDefinition<'a> {
    fn named(name: &'a str) -> Self {
        ToolDefinition {
            name,
            description: format!("The {name} tool."),
            input_schema: serde_json::json!({"type": "object"}),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
struct ApiMessage {
    role: &'static str,
    content: String,
}

#[derive(Debug, Deserialize)]
struct MessagesResponse {
    #[serde(default)]
    content: Vec<ContentBlock>,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ContentBlock {
    Text {
        text: String,
    },
    ToolUse {
        name: String,
        #[serde(default)]
        input: serde_json::Value,
    },
    #[serde(other)]
    Other,
}

/// Model caller backed by the Anthropic Messages API.
pub struct AnthropicModelCaller {
    config: AnthropicConfig,
    http_client: reqwest::Client,
}

impl AnthropicModelCaller {
    pub fn new(config: AnthropicConfig) -> Result<Self, ModelError> {
        if config.api_key.is_none() {
            return Err(ModelError::Config("ANTHROPIC_API_KEY is not set".to_string()));
        }
        let http_client = reqwest::Client::builder()
            .user_agent(concat!("skillet/", env!("CARGO_PKG_VERSION")))
            .timeout(config.request_timeout)
            .build()
            .map_err(|e| ModelError::Config(e.to_string()))?;

        Ok(AnthropicModelCaller {
            config,
            http_client,
        })
    }

    /// Create client from environment variables
    pub fn from_env() -> Result<Self, ModelError> {
        Self::new(AnthropicConfig::from_env())
    }

    pub fn config(&self) -> &AnthropicConfig {
        &self.config
    }

    async fn send(&self, body: &MessagesRequest<'_>) -> Result<Vec<ContentBlock>, ModelError> {
        let url = format!("{}/v1/messages", self.config.base_url);

        let response = self
            .http_client
            .post(&url)
            .header("x-api-key", self.config.api_key.as_deref().unwrap_or_default())
            .header("anthropic-version", API_VERSION)
            .json(body)
            .send()
            .await?;

        let status = response.status();
        if status.as_u16() == 429 || status.is_server_error() {
            return Err(ModelError::Overloaded {
                status: status.as_u16(),
            });
        }
        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            return Err(ModelError::Api {
                status: status.as_u16(),
                message,
            });
        }

        let parsed: MessagesResponse = response.json().await?;
        debug!(blocks = parsed.content.len(), "messages api reply");
        Ok(parsed.content)
    }
}

fn collect_text(blocks: &[ContentBlock]) -> String {
    blocks
        .iter()
        .filter_map(|b| match b {
            ContentBlock::Text { text } => Some(text.as_str()),
            _ => None,
        })
        .collect::<Vec<_>>()
        .join("\n")
}

#[async_trait]
impl ModelCaller for AnthropicModelCaller {
    async fn call(&self, prompt: &Prompt, options: &CallOptions) -> Result<AgentReply, ModelError> {
        let max_tokens = options.max_tokens.unwrap_or(self.config.max_tokens);
        let mut history: Vec<ApiMessage> = Vec::new();
        let mut reply = AgentReply::default();

        for turn in prompt.turns() {
            history.push(ApiMessage {
                role: "user",
                content: turn.to_string(),
            });
            let body = MessagesRequest::new(
                &self.config.model,
                max_tokens,
                options.system_prompt.as_deref(),
                &history,
            )
            .with_tools(&options.tools);
            let blocks = self.send(&body).await?;

            for block in &blocks {
                if let ContentBlock::ToolUse { name, input } = block {
                    reply.tool_calls.push(ToolCall::new(name.clone(), input.clone()));
                }
            }
            let text = collect_text(&blocks);
            history.push(ApiMessage {
                role: "assistant",
                content: if text.is_empty() {
                    "(no text)".to_string()
                } else {
                    text.clone()
                },
            });
            reply.text = text;
        }

        if reply.text.trim().is_empty() && reply.tool_calls.is_empty() {
            return Err(ModelError::EmptyResult);
        }
        Ok(reply)
    }

    async fn call_structured(
        &self,
        prompt: &str,
        schema: &serde_json::Value,
    ) -> Result<String, ModelError> {
        let system = format!(
            "Respond with a single JSON object matching this schema and nothing else:\n{schema}"
        );
        let messages = [ApiMessage {
            role: "user",
            content: prompt.to_string(),
        }];
        let body = MessagesRequest::new(
            &self.config.model,
            self.config.max_tokens,
            Some(&system),
            &messages,
        );
        let blocks = self.send(&body).await?;
        let text = collect_text(&blocks);
        if text.trim().is_empty() {
            return Err(ModelError::EmptyResult);
        }
        Ok(text)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_key_is_a_config_error() {
        let config = AnthropicConfig {
            api_key: None,
            ..AnthropicConfig::default()
        };
        match AnthropicModelCaller::new(config) {
            Err(ModelError::Config(msg)) => assert!(msg.contains("ANTHROPIC_API_KEY")),
            Err(other) => panic!("expected config error, got {other:?}"),
            Ok(_) => panic!("expected config error"),
        }
    }

    #[test]
    fn base_url_trailing_slash_is_trimmed() {
        let config = AnthropicConfig::default().with_base_url("http://localhost:8080/");
        assert_eq!(config.base_url, "http://localhost:8080");
    }

    #[test]
    fn request_declares_offered_tools() {
        let messages = [ApiMessage {
            role: "user",
            content: "open a.rs".to_string(),
        }];
        let tools = vec!["Read".to_string(), "Write".to_string()];
        let body = MessagesRequest::new("m", 64, Some("skill"), &messages).with_tools(&tools);
        let json = serde_json::to_value(&body).unwrap();

        assert_eq!(json["tools"][0]["name"], "Read");
        assert_eq!(json["tools"][1]["name"], "Write");
        assert_eq!(json["tools"][0]["input_schema"]["type"], "object");
        assert_eq!(json["system"], "skill");
    }

    #[test]
    fn request_without_tools_omits_the_field() {
        let messages = [ApiMessage {
            role: "user",
            content: "hi".to_string(),
        }];
        let json = serde_json::to_value(MessagesRequest::new("m", 64, None, &messages)).unwrap();
        assert!(json.get("tools").is_none());
        assert!(json.get("system").is_none());
    }

    #[test]
    fn content_blocks_deserialize() {
        let body = r#"{"content": [
            {"type": "text", "text": "Reading the file."},
            {"type": "tool_use", "id": "t1", "name": "Read", "input": {"path": "a.rs"}},
            {"type": "thinking", "thinking": "hmm"}
        ]}"#;
        let parsed: MessagesResponse = serde_json::from_str(body).unwrap();
        assert_eq!(parsed.content.len(), 3);
        assert_eq!(collect_text(&parsed.content), "Reading the file.");
        assert!(matches!(parsed.content[1], ContentBlock::ToolUse { ref name, .. } if name == "Read"));
        assert!(matches!(parsed.content[2], ContentBlock::Other));
    }
}
