//! Model invocation loop with capability dispatch

use anyhow::anyhow;
use tracing::{debug, info, warn};

use crate::error::TurnError;
use crate::personas::PersonaDefinition;
use crate::provider::{
    ChatBlock, ChatMessage, ChatMessageContent, ChatRole, ModelClient, ModelRequest, ResponseBlock,
};
use crate::routing::RoutingHint;
use crate::tools::{CapabilityRegistry, ToolContext, ToolDefinition};

/// One persona's model loop for a single turn
pub(crate) struct ToolLoop<'a> {
    pub model: &'a dyn ModelClient,
    pub registry: &'a CapabilityRegistry,
    pub persona: &'a PersonaDefinition,
    pub instructions: &'a str,
    pub tools: &'a [ToolDefinition],
    pub hint: Option<&'a RoutingHint>,
}

impl ToolLoop<'_> {
    /// Call the model until it answers without capability calls, running
    /// requested capabilities in order. Returns the final text. Stops early
    /// once a delegation has completed; the delegate's answer replaces
    /// whatever the caller would have said.
    pub async fn run(
        &self,
        mut conversation: Vec<ChatMessage>,
        ctx: &mut ToolContext<'_>,
    ) -> Result<String, TurnError> {
        let max_iterations = self.persona.params.max_turns;
        let mut iterations = 0;

        loop {
            iterations += 1;
            if iterations > max_iterations {
                warn!(
                    "Tool loop for '{}' exceeded maximum iterations ({})",
                    self.persona.key, max_iterations
                );
                return Err(TurnError::Model(anyhow!(
                    "tool loop exceeded {max_iterations} iterations"
                )));
            }

            debug!("Tool loop iteration {} for '{}'", iterations, self.persona.key);

            let response = self
                .model
                .invoke(ModelRequest {
                    persona: &self.persona.key,
                    instructions: self.instructions,
                    messages: &conversation,
                    tools: self.tools,
                    routing_hint: self.hint,
                    params: &self.persona.params,
                })
                .await
                .map_err(TurnError::Model)?;

            let text = response
                .blocks
                .iter()
                .filter_map(|b| match b {
                    ResponseBlock::Text { text } => Some(text.as_str()),
                    ResponseBlock::ToolCall { .. } => None,
                })
                .collect::<Vec<_>>()
                .join("\n");

            if !response.has_tool_calls() {
                debug!(
                    "Tool loop for '{}' completed after {} iterations",
                    self.persona.key, iterations
                );
                return Ok(text);
            }

            let mut assistant_blocks = Vec::new();
            if !text.is_empty() {
                assistant_blocks.push(ChatBlock::Text { text: text.clone() });
            }
            let mut results = Vec::new();

            for block in response.blocks {
                let ResponseBlock::ToolCall { id, name, input } = block else {
                    continue;
                };
                info!("Persona '{}' calling capability {}", self.persona.key, name);
                assistant_blocks.push(ChatBlock::ToolCall {
                    id: id.clone(),
                    name: name.clone(),
                    input: input.clone(),
                });
                let content = self.registry.dispatch(&name, input, ctx).await;
                results.push(ChatBlock::ToolResult {
                    tool_call_id: id,
                    content,
                });
            }

            if let Some(record) = ctx.scratch.delegation() {
                debug!(
                    "'{}' delegated to '{}', ending its loop",
                    self.persona.key, record.persona
                );
                return Ok(text);
            }

            conversation.push(ChatMessage {
                role: ChatRole::Assistant,
                content: ChatMessageContent::Blocks(assistant_blocks),
            });
            conversation.push(ChatMessage {
                role: ChatRole::User,
                content: ChatMessageContent::Blocks(results),
            });
        }
    }
}
