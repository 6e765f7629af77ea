//! Persona definitions, their store and instruction assembly

pub mod definition;
pub mod instructions;
pub mod store;

pub use definition::{
    DisplayGroup, ModelParams, OutputPolicy, OutputPolicyRecord, PersonaDefinition,
    PersonaRecord, PersonaRole, ProfileDisplay, RecentWindow, SuggestionPolicy,
    compose_instructions,
};
pub use instructions::{INTERNAL_MARKERS, effective_instructions, truncate_chars};
pub use store::PersonaStore;
