//! Error kinds surfaced at component boundaries

use std::time::Duration;

use thiserror::Error;

/// The only text a user ever sees when a turn fails outright
pub const GENERIC_APOLOGY: &str =
    "Sorry, something went wrong while handling your message. Please try again in a moment.";

/// Session store failures
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("session '{0}' not found")]
    NotFound(String),

    #[error(
        "session '{session_id}' was modified concurrently (expected version {expected}, found {found})"
    )]
    Conflict {
        session_id: String,
        expected: u64,
        found: u64,
    },

    #[error("invalid session id '{0}'")]
    InvalidSessionId(String),

    #[error("session store backend error: {0}")]
    Backend(String),
}

impl StoreError {
    /// Conflicts and backend hiccups may succeed on a later attempt; a missing
    /// session or a malformed id will not.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Conflict { .. } | Self::Backend(_))
    }
}

impl From<rusqlite::Error> for StoreError {
    fn from(err: rusqlite::Error) -> Self {
        Self::Backend(err.to_string())
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(err: serde_json::Error) -> Self {
        Self::Backend(format!("serialization: {err}"))
    }
}

/// Capability and persona registry construction failures
#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("capability '{0}' is already registered")]
    DuplicateCapability(String),

    #[error("capability '{0}' not found")]
    UnknownCapability(String),

    #[error("persona '{0}' is already defined")]
    DuplicatePersona(String),

    #[error("invalid persona '{key}': {reason}")]
    InvalidPersona { key: String, reason: String },
}

/// Violations of the delegation protocol
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RoutingFault {
    #[error("persona '{0}' attempted to delegate to itself")]
    SelfDelegation(String),

    #[error("delegation target '{0}' is not a known persona")]
    UnknownTarget(String),

    #[error("delegation target '{0}' is an orchestrator")]
    OrchestratorTarget(String),

    #[error("delegation attempted from inside a delegated turn")]
    NestedDelegation,

    #[error("orchestrator finished without delegating")]
    NoDelegation,

    #[error("orchestrator attempted {0} delegations in one turn")]
    MultipleDelegations(usize),

    #[error("delegated turn for '{persona}' failed: {reason}")]
    DelegateFailed { persona: String, reason: String },
}

/// Turn-fatal failures
#[derive(Debug, Error)]
pub enum TurnError {
    #[error("message is empty")]
    EmptyMessage,

    #[error("no persona is available (default '{0}' is not defined)")]
    NoPersona(String),

    #[error("model invocation failed: {0:#}")]
    Model(anyhow::Error),

    #[error("turn exceeded its {0:?} budget")]
    Timeout(Duration),

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl TurnError {
    /// Text safe to show the end user
    pub fn user_message(&self) -> &'static str {
        GENERIC_APOLOGY
    }

    pub fn is_retryable(&self) -> bool {
        match self {
            Self::EmptyMessage | Self::NoPersona(_) => false,
            Self::Model(_) | Self::Timeout(_) => true,
            Self::Store(err) => err.is_transient(),
        }
    }
}
