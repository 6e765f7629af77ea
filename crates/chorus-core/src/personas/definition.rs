//! Persona records and their compiled, immutable definitions

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

use crate::error::{GENERIC_APOLOGY, RegistryError};

/// Whether a persona answers users or only delegates
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PersonaRole {
    #[default]
    Specialist,
    Orchestrator,
}

/// Model settings for one persona
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelParams {
    /// Overrides the client's default model
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    /// Upper bound on model calls within one turn
    #[serde(default = "default_max_turns")]
    pub max_turns: u32,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
}

fn default_temperature() -> f32 {
    0.7
}

fn default_max_turns() -> u32 {
    12
}

fn default_max_tokens() -> u32 {
    4096
}

impl Default for ModelParams {
    fn default() -> Self {
        Self {
            model: None,
            temperature: default_temperature(),
            max_turns: default_max_turns(),
            max_tokens: default_max_tokens(),
        }
    }
}

/// A titled group of fields in the rendered profile summary
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DisplayGroup {
    pub title: String,
    pub fields: Vec<String>,
}

/// How the profile summary is rendered into instructions
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProfileDisplay {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_profile_header")]
    pub header: String,
    /// Profile key -> label shown to the model
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
    #[serde(default)]
    pub groups: Vec<DisplayGroup>,
    /// Restrict the summary to these keys; empty shows everything enabled
    #[serde(default)]
    pub fields: Vec<String>,
    /// Language code -> display name, used for `preferred_language`
    #[serde(default)]
    pub language_names: BTreeMap<String, String>,
    #[serde(default = "default_list_separator")]
    pub list_separator: String,
}

fn default_true() -> bool {
    true
}

fn default_profile_header() -> String {
    "What you know about the user:".to_string()
}

fn default_list_separator() -> String {
    ", ".to_string()
}

impl Default for ProfileDisplay {
    fn default() -> Self {
        Self {
            enabled: true,
            header: default_profile_header(),
            labels: BTreeMap::new(),
            groups: Vec::new(),
            fields: Vec::new(),
            language_names: BTreeMap::new(),
            list_separator: default_list_separator(),
        }
    }
}

/// Window of recent user messages rendered into instructions
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecentWindow {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_recent_count")]
    pub count: usize,
    /// Characters per message before truncation
    #[serde(default = "default_recent_max_length")]
    pub max_length: usize,
    #[serde(default = "default_recent_header")]
    pub header: String,
}

fn default_recent_count() -> usize {
    2
}

fn default_recent_max_length() -> usize {
    150
}

fn default_recent_header() -> String {
    "The user's most recent messages:".to_string()
}

impl Default for RecentWindow {
    fn default() -> Self {
        Self {
            enabled: true,
            count: default_recent_count(),
            max_length: default_recent_max_length(),
            header: default_recent_header(),
        }
    }
}

/// Suggested-next-steps block appended to replies
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SuggestionPolicy {
    #[serde(default = "default_suggestion_header")]
    pub header: String,
    #[serde(default = "default_max_items")]
    pub max_items: usize,
    /// Items used when the model left the block out
    #[serde(default)]
    pub fallback: Vec<String>,
}

fn default_suggestion_header() -> String {
    "Next actions:".to_string()
}

fn default_max_items() -> usize {
    4
}

/// Output-shape rules as configured
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct OutputPolicyRecord {
    /// Regexes removed from replies
    #[serde(default)]
    pub forbidden_patterns: Vec<String>,
    #[serde(default)]
    pub suggestions: Option<SuggestionPolicy>,
    /// Shown when the persona produces nothing usable
    #[serde(default)]
    pub fallback_text: Option<String>,
}

/// Persona as written in configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PersonaRecord {
    pub key: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub role: PersonaRole,
    /// Base behavioral text
    #[serde(default)]
    pub instructions: String,
    /// Operational and privacy constraints
    #[serde(default)]
    pub constraints: String,
    /// Capability-usage policy
    #[serde(default)]
    pub tool_policy: String,
    #[serde(default)]
    pub capabilities: Vec<String>,
    #[serde(default)]
    pub model: ModelParams,
    #[serde(default)]
    pub display: ProfileDisplay,
    #[serde(default)]
    pub recent: RecentWindow,
    #[serde(default)]
    pub output: OutputPolicyRecord,
    #[serde(default)]
    pub welcome: Option<String>,
}

impl PersonaRecord {
    pub fn new(key: impl Into<String>, instructions: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            name: String::new(),
            description: String::new(),
            role: PersonaRole::Specialist,
            instructions: instructions.into(),
            constraints: String::new(),
            tool_policy: String::new(),
            capabilities: Vec::new(),
            model: ModelParams::default(),
            display: ProfileDisplay::default(),
            recent: RecentWindow::default(),
            output: OutputPolicyRecord::default(),
            welcome: None,
        }
    }
}

/// Compiled output policy
#[derive(Debug, Clone, Default)]
pub struct OutputPolicy {
    pub forbidden: Vec<Regex>,
    pub suggestions: Option<SuggestionPolicy>,
    pub fallback_text: Option<String>,
}

/// Immutable persona shared by every session
#[derive(Debug, Clone)]
pub struct PersonaDefinition {
    pub key: String,
    pub name: String,
    pub description: String,
    pub role: PersonaRole,
    /// Base text, constraints and tool policy, composed once at load
    pub instructions: String,
    pub capabilities: BTreeSet<String>,
    pub params: ModelParams,
    pub display: ProfileDisplay,
    pub recent: RecentWindow,
    pub policy: OutputPolicy,
    pub welcome: Option<String>,
}

impl PersonaDefinition {
    /// Validate a record and compose its instruction text
    pub fn from_record(record: PersonaRecord) -> Result<Self, RegistryError> {
        let key = record.key.trim().to_string();
        let invalid = |reason: &str| RegistryError::InvalidPersona {
            key: key.clone(),
            reason: reason.to_string(),
        };

        if key.is_empty() {
            return Err(invalid("key is empty"));
        }
        if record.instructions.trim().is_empty() {
            return Err(invalid("base instructions are empty"));
        }
        if !(0.0..=2.0).contains(&record.model.temperature) {
            return Err(invalid("temperature must be between 0.0 and 2.0"));
        }
        if record.model.max_turns == 0 {
            return Err(invalid("max_turns must be at least 1"));
        }

        let forbidden = record
            .output
            .forbidden_patterns
            .iter()
            .map(|p| Regex::new(p).map_err(|e| invalid(&format!("bad pattern '{p}': {e}"))))
            .collect::<Result<Vec<_>, _>>()?;

        let instructions =
            compose_instructions(&record.instructions, &record.constraints, &record.tool_policy);

        Ok(Self {
            name: if record.name.trim().is_empty() {
                key.clone()
            } else {
                record.name
            },
            key,
            description: record.description,
            role: record.role,
            instructions,
            capabilities: record
                .capabilities
                .into_iter()
                .map(|c| c.trim().to_string())
                .filter(|c| !c.is_empty())
                .collect(),
            params: record.model,
            display: record.display,
            recent: record.recent,
            policy: OutputPolicy {
                forbidden,
                suggestions: record.output.suggestions,
                fallback_text: record.output.fallback_text,
            },
            welcome: record.welcome,
        })
    }

    pub fn allows(&self, capability: &str) -> bool {
        self.capabilities.contains(capability)
    }

    pub fn is_orchestrator(&self) -> bool {
        self.role == PersonaRole::Orchestrator
    }

    /// Text returned when this persona produced nothing usable
    pub fn fallback_text(&self) -> &str {
        self.policy.fallback_text.as_deref().unwrap_or(GENERIC_APOLOGY)
    }
}

/// Join the instruction sections in their fixed order, skipping empty ones.
/// Later sections take precedence over general guidance in earlier ones.
pub fn compose_instructions(base: &str, constraints: &str, tool_policy: &str) -> String {
    [base, constraints, tool_policy]
        .iter()
        .map(|s| s.trim())
        .filter(|s| !s.is_empty())
        .collect::<Vec<_>>()
        .join("\n\n")
}
