//! Model-invocation interface

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::personas::ModelParams;
use crate::routing::RoutingHint;
use crate::tools::ToolDefinition;
use crate::types::{Role, TranscriptTurn};

pub mod anthropic;

pub use anthropic::AnthropicClient;

/// Message role as seen by the model
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChatRole {
    User,
    Assistant,
}

impl From<Role> for ChatRole {
    fn from(role: Role) -> Self {
        match role {
            Role::User => Self::User,
            Role::Assistant => Self::Assistant,
        }
    }
}

/// A message in the model conversation
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: ChatRole,
    pub content: ChatMessageContent,
}

impl ChatMessage {
    pub fn text(role: ChatRole, text: impl Into<String>) -> Self {
        Self {
            role,
            content: ChatMessageContent::Text(text.into()),
        }
    }

    /// Replay a stored transcript as conversation history
    pub fn history(transcript: &[TranscriptTurn]) -> Vec<Self> {
        transcript
            .iter()
            .map(|turn| Self::text(turn.role.into(), turn.text.clone()))
            .collect()
    }
}

/// Content of a chat message, plain text or structured blocks
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ChatMessageContent {
    Text(String),
    Blocks(Vec<ChatBlock>),
}

/// A single block within a message
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum ChatBlock {
    Text { text: String },
    ToolCall { id: String, name: String, input: Value },
    ToolResult { tool_call_id: String, content: String },
}

/// Why the model stopped generating
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    EndTurn,
    ToolUse,
    MaxTokens,
    Unknown,
}

/// A block in the model's reply
#[derive(Debug, Clone, PartialEq)]
pub enum ResponseBlock {
    Text { text: String },
    ToolCall { id: String, name: String, input: Value },
}

/// Model reply: final text, capability calls, or both
#[derive(Debug, Clone)]
pub struct ChatResponse {
    pub blocks: Vec<ResponseBlock>,
    pub stop_reason: StopReason,
}

impl ChatResponse {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            blocks: vec![ResponseBlock::Text { text: text.into() }],
            stop_reason: StopReason::EndTurn,
        }
    }

    pub fn tool_call(id: impl Into<String>, name: impl Into<String>, input: Value) -> Self {
        Self {
            blocks: vec![ResponseBlock::ToolCall {
                id: id.into(),
                name: name.into(),
                input,
            }],
            stop_reason: StopReason::ToolUse,
        }
    }

    pub fn has_tool_calls(&self) -> bool {
        self.blocks
            .iter()
            .any(|b| matches!(b, ResponseBlock::ToolCall { .. }))
    }
}

/// Everything a model needs for one call
#[derive(Debug, Clone, Copy)]
pub struct ModelRequest<'a> {
    pub persona: &'a str,
    pub instructions: &'a str,
    pub messages: &'a [ChatMessage],
    pub tools: &'a [ToolDefinition],
    /// Structured side channel; clients must not fold it into user text
    pub routing_hint: Option<&'a RoutingHint>,
    pub params: &'a ModelParams,
}

/// Model-invocation collaborator
#[async_trait]
pub trait ModelClient: Send + Sync {
    /// Human-readable provider name (e.g. "anthropic")
    fn provider_name(&self) -> &str;

    /// Model used when a persona does not override it
    fn model(&self) -> &str;

    async fn invoke(&self, request: ModelRequest<'_>) -> Result<ChatResponse>;
}

impl std::fmt::Display for ChatRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::User => write!(f, "user"),
            Self::Assistant => write!(f, "assistant"),
        }
    }
}
