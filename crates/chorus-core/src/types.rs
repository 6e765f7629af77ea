//! Core session and transcript types

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use uuid::Uuid;

use crate::store::ProfileMap;

/// Speaker of a transcript turn
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::User => write!(f, "user"),
            Self::Assistant => write!(f, "assistant"),
        }
    }
}

/// One entry of a session transcript
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TranscriptTurn {
    pub role: Role,
    pub text: String,
    pub timestamp: DateTime<Utc>,
    /// Persona that produced an assistant turn
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub persona: Option<String>,
}

impl TranscriptTurn {
    pub fn user(text: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            text: text.into(),
            timestamp: Utc::now(),
            persona: None,
        }
    }

    pub fn assistant(persona: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            text: text.into(),
            timestamp: Utc::now(),
            persona: Some(persona.into()),
        }
    }
}

/// Whether the session still gets suggested next steps appended to replies
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UserMode {
    #[default]
    Guided,
    Free,
}

/// Per-session bookkeeping that is not part of the user profile
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionMeta {
    #[serde(default)]
    pub user_mode: UserMode,
    #[serde(default)]
    pub suggestion_clicks: u32,
    #[serde(default)]
    pub user_turns: u32,
    /// Rolling summary of the transcript prefix no longer replayed verbatim
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub conversation_summary: Option<String>,
    /// Number of leading transcript turns covered by `conversation_summary`
    #[serde(default)]
    pub summarized_turns: usize,
}

/// A conversation session
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    pub id: String,
    /// Persona that answered last
    pub persona: String,
    pub transcript: Vec<TranscriptTurn>,
    pub profile: ProfileMap,
    #[serde(default)]
    pub meta: SessionMeta,
    /// Optimistic concurrency token; 0 until first persisted
    pub version: u64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Session {
    pub fn new(id: impl Into<String>, persona: impl Into<String>, now: DateTime<Utc>) -> Self {
        Self {
            id: id.into(),
            persona: persona.into(),
            transcript: Vec::new(),
            profile: ProfileMap::default(),
            meta: SessionMeta::default(),
            version: 0,
            created_at: now,
            updated_at: now,
        }
    }

    /// Create a session under a freshly generated id
    pub fn mint(persona: impl Into<String>, now: DateTime<Utc>) -> Self {
        Self::new(Uuid::new_v4().to_string(), persona, now)
    }

    /// Number of user messages in the (possibly trimmed) transcript
    pub fn exchange_count(&self) -> usize {
        self.transcript
            .iter()
            .filter(|t| t.role == Role::User)
            .count()
    }

    /// Text of the last `n` user turns, oldest first
    pub fn recent_user_messages(&self, n: usize) -> Vec<&str> {
        recent_user_messages(&self.transcript, n)
    }

    /// Keep only the newest `max` transcript entries
    pub fn trim_transcript(&mut self, max: usize) {
        if self.transcript.len() > max {
            let excess = self.transcript.len() - max;
            self.transcript.drain(..excess);
            self.meta.summarized_turns = self.meta.summarized_turns.saturating_sub(excess);
        }
    }

    /// What a persona sees of this session's past
    pub fn history(&self) -> History<'_> {
        History {
            turns: &self.transcript,
            summary: self.meta.conversation_summary.as_deref(),
            summarized: self.meta.summarized_turns,
        }
    }

    /// Whether the session has been idle for longer than `ttl`
    pub fn is_idle_expired(&self, ttl: Option<Duration>, now: DateTime<Utc>) -> bool {
        let Some(ttl) = ttl else {
            return false;
        };
        match chrono::Duration::from_std(ttl) {
            Ok(ttl) => self.updated_at + ttl <= now,
            Err(_) => false,
        }
    }
}

/// Borrowed view of a session's past: the full transcript plus the summary
/// standing in for its oldest turns
#[derive(Debug, Clone, Copy, Default)]
pub struct History<'a> {
    pub turns: &'a [TranscriptTurn],
    pub summary: Option<&'a str>,
    /// Leading turns replaced by `summary` when replaying
    pub summarized: usize,
}

impl<'a> History<'a> {
    /// History without a summary
    pub fn verbatim(turns: &'a [TranscriptTurn]) -> Self {
        Self {
            turns,
            summary: None,
            summarized: 0,
        }
    }

    /// Turns replayed to the model verbatim
    pub fn window(&self) -> &'a [TranscriptTurn] {
        match self.summary {
            Some(_) => &self.turns[self.summarized.min(self.turns.len())..],
            None => self.turns,
        }
    }
}

/// Text of the last `n` user turns in `transcript`, oldest first
pub fn recent_user_messages(transcript: &[TranscriptTurn], n: usize) -> Vec<&str> {
    let mut recent: Vec<&str> = transcript
        .iter()
        .rev()
        .filter(|t| t.role == Role::User)
        .take(n)
        .map(|t| t.text.as_str())
        .collect();
    recent.reverse();
    recent
}

/// Session ids are opaque but must be safe to log and key on
pub fn is_valid_session_id(id: &str) -> bool {
    !id.is_empty()
        && id.len() <= 128
        && id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
}
