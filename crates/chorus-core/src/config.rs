//! Runtime settings for the turn pipeline

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// How a request carrying only an entry path picks its persona
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RoutingMode {
    /// Invoke the routed persona directly
    #[default]
    Direct,
    /// Invoke the orchestrator with the routed persona as a hint
    Orchestrated,
}

/// When a session stops receiving suggested next steps
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SuggestionLifecycle {
    #[serde(default = "default_max_clicks")]
    pub max_clicks: u32,
    #[serde(default = "default_free_mode_after_turns")]
    pub free_mode_after_turns: u32,
    /// Appended once, on the turn the session switches to free mode
    #[serde(default)]
    pub transition_message: Option<String>,
}

fn default_max_clicks() -> u32 {
    3
}

fn default_free_mode_after_turns() -> u32 {
    4
}

impl Default for SuggestionLifecycle {
    fn default() -> Self {
        Self {
            max_clicks: default_max_clicks(),
            free_mode_after_turns: default_free_mode_after_turns(),
            transition_message: None,
        }
    }
}

/// When and how older transcript turns are folded into a rolling summary
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SummaryConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Transcript length above which older turns get summarized
    #[serde(default = "default_summary_threshold")]
    pub threshold: usize,
    /// User messages (and everything after the oldest of them) kept verbatim
    #[serde(default = "default_keep_recent")]
    pub keep_recent: usize,
    /// Per-message cut applied when feeding turns to the summarizer
    #[serde(default = "default_summary_message_chars")]
    pub max_message_chars: usize,
    #[serde(default = "default_summary_max_tokens")]
    pub max_tokens: u32,
    #[serde(default = "default_summary_temperature")]
    pub temperature: f32,
}

fn default_true() -> bool {
    true
}

fn default_summary_threshold() -> usize {
    10
}

fn default_keep_recent() -> usize {
    2
}

fn default_summary_message_chars() -> usize {
    800
}

fn default_summary_max_tokens() -> u32 {
    512
}

fn default_summary_temperature() -> f32 {
    0.3
}

impl Default for SummaryConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            threshold: default_summary_threshold(),
            keep_recent: default_keep_recent(),
            max_message_chars: default_summary_message_chars(),
            max_tokens: default_summary_max_tokens(),
            temperature: default_summary_temperature(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RuntimeConfig {
    /// Budget for a whole turn, delegated sub-turn included
    #[serde(default = "default_turn_timeout_secs")]
    pub turn_timeout_secs: u64,
    /// Default lifetime of profile writes; 0 keeps them forever
    #[serde(default = "default_profile_ttl_secs")]
    pub profile_ttl_secs: u64,
    /// Idle time after which a session is dropped; 0 disables
    #[serde(default = "default_session_ttl_secs")]
    pub session_ttl_secs: u64,
    #[serde(default = "default_max_transcript_turns")]
    pub max_transcript_turns: usize,
    #[serde(default)]
    pub routing_mode: RoutingMode,
    #[serde(default = "default_orchestrator")]
    pub orchestrator: String,
    #[serde(default)]
    pub suggestions: SuggestionLifecycle,
    #[serde(default)]
    pub summary: SummaryConfig,
}

fn default_turn_timeout_secs() -> u64 {
    120
}

fn default_profile_ttl_secs() -> u64 {
    14_400
}

fn default_session_ttl_secs() -> u64 {
    14_400
}

fn default_max_transcript_turns() -> usize {
    30
}

fn default_orchestrator() -> String {
    "orchestrator".to_string()
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            turn_timeout_secs: default_turn_timeout_secs(),
            profile_ttl_secs: default_profile_ttl_secs(),
            session_ttl_secs: default_session_ttl_secs(),
            max_transcript_turns: default_max_transcript_turns(),
            routing_mode: RoutingMode::default(),
            orchestrator: default_orchestrator(),
            suggestions: SuggestionLifecycle::default(),
            summary: SummaryConfig::default(),
        }
    }
}

impl RuntimeConfig {
    pub fn turn_timeout(&self) -> Duration {
        Duration::from_secs(self.turn_timeout_secs)
    }

    pub fn profile_ttl(&self) -> Option<Duration> {
        (self.profile_ttl_secs > 0).then(|| Duration::from_secs(self.profile_ttl_secs))
    }

    pub fn session_ttl(&self) -> Option<Duration> {
        (self.session_ttl_secs > 0).then(|| Duration::from_secs(self.session_ttl_secs))
    }
}
