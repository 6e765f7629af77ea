//! Anthropic Messages API client

use anyhow::{Context, Result, anyhow};
use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;
use tracing::debug;

use super::{
    ChatBlock, ChatMessage, ChatMessageContent, ChatResponse, ChatRole, ModelClient, ModelRequest,
    ResponseBlock, StopReason,
};

pub const DEFAULT_BASE_URL: &str = "https://api.anthropic.com";
pub const DEFAULT_MODEL: &str = "claude-sonnet-4-5";

/// Anthropic Claude client
pub struct AnthropicClient {
    client: Client,
    api_key: String,
    base_url: String,
    model: String,
}

impl std::fmt::Debug for AnthropicClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AnthropicClient")
            .field("base_url", &self.base_url)
            .field("model", &self.model)
            .finish()
    }
}

impl AnthropicClient {
    pub fn new(api_key: String, model: Option<String>) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(120))
            .build()
            .context("Failed to build HTTP client")?;

        Ok(Self {
            client,
            api_key,
            base_url: DEFAULT_BASE_URL.to_string(),
            model: model.unwrap_or_else(|| DEFAULT_MODEL.to_string()),
        })
    }

    /// Set a custom base URL (for proxies or compatible endpoints)
    pub fn with_base_url(mut self, base_url: String) -> Self {
        self.base_url = base_url.trim_end_matches('/').to_string();
        self
    }

    /// Convert messages to Anthropic wire format. The API expects the
    /// conversation to open with a user turn, so leading assistant turns
    /// (e.g. a welcome message) are dropped.
    fn to_anthropic_messages(messages: &[ChatMessage]) -> Vec<AnthropicMessage> {
        messages
            .iter()
            .skip_while(|m| m.role == ChatRole::Assistant)
            .map(|m| {
                let content = match &m.content {
                    ChatMessageContent::Text(t) => AnthropicContent::Text(t.clone()),
                    ChatMessageContent::Blocks(blocks) => AnthropicContent::Blocks(
                        blocks
                            .iter()
                            .map(|b| match b {
                                ChatBlock::Text { text } => AnthropicBlock::Text { text: text.clone() },
                                ChatBlock::ToolCall { id, name, input } => AnthropicBlock::ToolUse {
                                    id: id.clone(),
                                    name: name.clone(),
                                    input: input.clone(),
                                },
                                ChatBlock::ToolResult { tool_call_id, content } => {
                                    AnthropicBlock::ToolResult {
                                        tool_use_id: tool_call_id.clone(),
                                        content: content.clone(),
                                    }
                                }
                            })
                            .collect(),
                    ),
                };
                AnthropicMessage {
                    role: m.role.to_string(),
                    content,
                }
            })
            .collect()
    }

    /// System prompt as separate blocks; the routing hint gets its own block
    fn system_blocks(request: &ModelRequest<'_>) -> Vec<SystemBlock> {
        let mut blocks = vec![SystemBlock::text(request.instructions)];
        if let Some(hint) = request.routing_hint {
            blocks.push(SystemBlock::text(&hint.render()));
        }
        blocks
    }

    fn from_anthropic_response(resp: AnthropicApiResponse) -> ChatResponse {
        let blocks = resp
            .content
            .into_iter()
            .filter_map(|b| match b {
                AnthropicBlock::Text { text } => Some(ResponseBlock::Text { text }),
                AnthropicBlock::ToolUse { id, name, input } => {
                    Some(ResponseBlock::ToolCall { id, name, input })
                }
                AnthropicBlock::ToolResult { .. } => None,
            })
            .collect();

        let stop_reason = match resp.stop_reason.as_deref() {
            Some("tool_use") => StopReason::ToolUse,
            Some("end_turn") => StopReason::EndTurn,
            Some("max_tokens") => StopReason::MaxTokens,
            _ => StopReason::Unknown,
        };

        ChatResponse { blocks, stop_reason }
    }
}

#[async_trait]
impl ModelClient for AnthropicClient {
    fn provider_name(&self) -> &str {
        "anthropic"
    }

    fn model(&self) -> &str {
        &self.model
    }

    async fn invoke(&self, request: ModelRequest<'_>) -> Result<ChatResponse> {
        let url = format!("{}/v1/messages", self.base_url);
        let messages = Self::to_anthropic_messages(request.messages);
        let model = request.params.model.as_deref().unwrap_or(&self.model);

        let mut body = serde_json::json!({
            "model": model,
            "max_tokens": request.params.max_tokens,
            "temperature": request.params.temperature,
            "system": Self::system_blocks(&request),
            "messages": messages,
        });

        if !request.tools.is_empty() {
            body["tools"] = serde_json::to_value(request.tools)?;
        }

        debug!(
            "Anthropic request: persona={}, model={}, messages={}, tools={}",
            request.persona,
            model,
            messages.len(),
            request.tools.len()
        );

        let response = self
            .client
            .post(&url)
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", "2023-06-01")
            .header("content-type", "application/json")
            .json(&body)
            .send()
            .await
            .context("Failed to send request to Anthropic API")?;

        let status = response.status();
        if !status.is_success() {
            let error_text = response
                .text()
                .await
                .unwrap_or_else(|_| "Unknown error".to_string());
            return Err(anyhow!(
                "Anthropic API request failed with status {}: {}",
                status,
                error_text
            ));
        }

        let api_response: AnthropicApiResponse = response
            .json()
            .await
            .context("Failed to parse Anthropic API response")?;

        debug!(
            "Anthropic response: blocks={}, stop_reason={:?}",
            api_response.content.len(),
            api_response.stop_reason
        );

        Ok(Self::from_anthropic_response(api_response))
    }
}

// ── Anthropic wire types ──

#[derive(Debug, Clone, Serialize)]
struct SystemBlock {
    #[serde(rename = "type")]
    kind: &'static str,
    text: String,
}

impl SystemBlock {
    fn text(text: &str) -> Self {
        Self {
            kind: "text",
            text: text.to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct AnthropicMessage {
    role: String,
    content: AnthropicContent,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
enum AnthropicContent {
    Text(String),
    Blocks(Vec<AnthropicBlock>),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum AnthropicBlock {
    Text {
        text: String,
    },
    ToolUse {
        id: String,
        name: String,
        input: Value,
    },
    ToolResult {
        tool_use_id: String,
        content: String,
    },
}

#[derive(Debug, Clone, Deserialize)]
struct AnthropicApiResponse {
    content: Vec<AnthropicBlock>,
    stop_reason: Option<String>,
}
