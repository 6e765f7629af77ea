//! chorus-core - Multi-persona conversational runtime
//!
//! This crate provides:
//! - Capability registry with schema-validated dispatch and per-turn scratch writes
//! - Immutable persona definitions with composed instruction text
//! - Session store with a mergeable, expiring user profile (SQLite or in-memory)
//! - Deterministic path routing and single-hop persona delegation
//! - The turn pipeline tying the pieces together around a model client

pub mod collaborators;
pub mod config;
pub mod error;
pub mod fields;
pub mod personas;
pub mod pipeline;
pub mod provider;
pub mod routing;
pub mod store;
pub mod tools;
pub mod types;

// Re-export main types for convenience
pub use collaborators::{ConfigSource, EntryParams, ParamDecoder, ProfileSource};
pub use config::{RoutingMode, RuntimeConfig, SuggestionLifecycle, SummaryConfig};
pub use error::{RegistryError, RoutingFault, StoreError, TurnError};
pub use fields::{FieldCatalog, FieldSpec, FieldType};
pub use personas::{PersonaDefinition, PersonaRecord, PersonaRole, PersonaStore};
pub use pipeline::{SessionEntry, SessionOpening, TurnOutcome, TurnPipeline, TurnRequest};
pub use provider::{AnthropicClient, ModelClient, ModelRequest};
pub use routing::{PathMapping, PathRouter, RouteTableConfig, RoutingHint};
pub use store::{MemoryStore, ProfileMap, ProfileSnapshot, SessionStore, SqliteStore};
pub use tools::{CapabilityRegistry, ToolContext, ToolDefinition, ToolHandler};
pub use types::{History, Role, Session, TranscriptTurn};
