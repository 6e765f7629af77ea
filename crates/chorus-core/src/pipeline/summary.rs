//! Rolling summary of long sessions

use anyhow::{Result, bail};
use tracing::{debug, info, warn};

use crate::config::SummaryConfig;
use crate::personas::{ModelParams, truncate_chars};
use crate::provider::{ChatMessage, ChatRole, ModelClient, ModelRequest, ResponseBlock};
use crate::types::{Role, Session, TranscriptTurn};

/// Persona key the summarizer's model calls are made under
pub const SUMMARIZER_KEY: &str = "conversation-summarizer";

const SUMMARIZER_INSTRUCTIONS: &str = "You condense chat history for an assistant that will \
     continue the conversation. Keep facts the user shared about themselves, the questions \
     they asked and what was already answered, plus anything still open. Write a few short \
     sentences in the language of the conversation. Reply with the summary only.";

/// Index of the first turn kept verbatim: the `keep`-th user message from the end
pub fn verbatim_start(transcript: &[TranscriptTurn], keep: usize) -> usize {
    if keep == 0 {
        return transcript.len();
    }
    transcript
        .iter()
        .enumerate()
        .rev()
        .filter(|(_, turn)| turn.role == Role::User)
        .nth(keep - 1)
        .map(|(i, _)| i)
        .unwrap_or(0)
}

/// Fold turns that left the verbatim window into the session summary.
/// Returns whether the summary moved. A failed model call keeps the previous
/// summary and boundary, so those turns are replayed verbatim.
pub async fn refresh(model: &dyn ModelClient, config: &SummaryConfig, session: &mut Session) -> bool {
    if !config.enabled || session.transcript.len() <= config.threshold {
        return false;
    }

    let previous = session.meta.conversation_summary.clone();
    let covered = match previous {
        Some(_) => session.meta.summarized_turns.min(session.transcript.len()),
        None => 0,
    };
    let cut = verbatim_start(&session.transcript, config.keep_recent);
    if cut <= covered {
        return false;
    }

    let turns = format_turns(&session.transcript[covered..cut], config.max_message_chars);
    let prompt = match &previous {
        Some(summary) => format!(
            "Summary so far:\n{summary}\n\nNew messages:\n{turns}\n\n\
             Update the summary so it covers both."
        ),
        None => format!("Summarize this conversation:\n\n{turns}"),
    };

    debug!("Summarizing turns {}..{} of session {}", covered, cut, session.id);
    match summarize(model, config, &prompt).await {
        Ok(summary) => {
            info!("Session {} summary now covers {} turns", session.id, cut);
            session.meta.conversation_summary = Some(summary);
            session.meta.summarized_turns = cut;
            true
        }
        Err(e) => {
            warn!("Could not summarize session {}: {:#}", session.id, e);
            false
        }
    }
}

async fn summarize(model: &dyn ModelClient, config: &SummaryConfig, prompt: &str) -> Result<String> {
    let params = ModelParams {
        model: None,
        temperature: config.temperature,
        max_turns: 1,
        max_tokens: config.max_tokens,
    };
    let messages = [ChatMessage::text(ChatRole::User, prompt)];
    let response = model
        .invoke(ModelRequest {
            persona: SUMMARIZER_KEY,
            instructions: SUMMARIZER_INSTRUCTIONS,
            messages: &messages,
            tools: &[],
            routing_hint: None,
            params: &params,
        })
        .await?;

    let text = response
        .blocks
        .iter()
        .filter_map(|b| match b {
            ResponseBlock::Text { text } => Some(text.as_str()),
            ResponseBlock::ToolCall { .. } => None,
        })
        .collect::<Vec<_>>()
        .join("\n");
    let text = text.trim();
    if text.is_empty() {
        bail!("summarizer returned no text");
    }
    Ok(text.to_string())
}

fn format_turns(turns: &[TranscriptTurn], max_chars: usize) -> String {
    turns
        .iter()
        .map(|turn| {
            let speaker = match turn.role {
                Role::User => "User",
                Role::Assistant => "Assistant",
            };
            format!("{speaker}: {}", truncate_chars(&turn.text, max_chars))
        })
        .collect::<Vec<_>>()
        .join("\n")
}
