//! Capability registry and dispatch

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, warn};

use crate::collaborators::ProfileSource;
use crate::error::RegistryError;
use crate::fields::FieldCatalog;
use crate::personas::PersonaDefinition;
use crate::store::{ProfileSnapshot, ScratchBuffer};
use crate::types::History;

pub mod delegate;
pub mod profile;

pub use delegate::{DelegatedRequest, Delegator, RouteToPersonaTool};
pub use profile::{RefreshProfileTool, SaveUserInfoTool};

/// Capability results longer than this are cut before reaching the model
pub const MAX_TOOL_OUTPUT: usize = 100_000;

/// Capability as surfaced to the model
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolDefinition {
    pub name: String,
    pub description: String,
    pub input_schema: Value,
}

/// What a handler may see and touch while it runs
pub struct ToolContext<'a> {
    pub session_id: &'a str,
    /// Persona whose model requested the call
    pub persona: &'a PersonaDefinition,
    /// Read-only view of the session profile at turn start
    pub profile: &'a ProfileSnapshot,
    /// Session history before this turn
    pub history: History<'a>,
    /// The user message that started the turn
    pub message: &'a str,
    pub scratch: &'a mut ScratchBuffer,
    /// 0 for the outer turn, 1 inside a delegated sub-turn
    pub depth: u8,
    pub delegator: Option<&'a dyn Delegator>,
}

impl ToolContext<'_> {
    /// Current value for `key`, preferring writes staged earlier in this turn
    pub fn current_value(&self, key: &str) -> Option<&Value> {
        self.scratch
            .staged_value(key)
            .or_else(|| self.profile.get(key))
    }
}

/// Individual capability handler
#[async_trait]
pub trait ToolHandler: Send + Sync {
    fn name(&self) -> &str;
    fn description(&self) -> &str;
    fn input_schema(&self) -> Value;
    async fn execute(&self, input: Value, ctx: &mut ToolContext<'_>) -> Result<String>;
}

/// Immutable table of capabilities, built once and shared
pub struct CapabilityRegistry {
    tools: HashMap<String, Arc<dyn ToolHandler>>,
}

impl CapabilityRegistry {
    /// Create a new empty registry
    pub fn new() -> Self {
        Self {
            tools: HashMap::new(),
        }
    }

    /// Registry with the built-in capabilities
    pub fn with_builtins(
        catalog: Arc<FieldCatalog>,
        profile_source: Option<Arc<dyn ProfileSource>>,
    ) -> Result<Self, RegistryError> {
        let mut registry = Self::new();
        registry.register(Arc::new(SaveUserInfoTool::new(Arc::clone(&catalog))))?;
        registry.register(Arc::new(RouteToPersonaTool))?;
        if let Some(source) = profile_source {
            registry.register(Arc::new(RefreshProfileTool::new(source, catalog)))?;
        }
        Ok(registry)
    }

    /// Register a handler; names must be unique
    pub fn register(&mut self, handler: Arc<dyn ToolHandler>) -> Result<(), RegistryError> {
        let name = handler.name().to_string();
        if self.tools.contains_key(&name) {
            return Err(RegistryError::DuplicateCapability(name));
        }
        debug!("Registering capability: {}", name);
        self.tools.insert(name, handler);
        Ok(())
    }

    pub fn get(&self, name: &str) -> Result<Arc<dyn ToolHandler>, RegistryError> {
        self.tools
            .get(name)
            .cloned()
            .ok_or_else(|| RegistryError::UnknownCapability(name.to_string()))
    }

    /// Definitions for the capabilities `persona` declares, sorted by name
    pub fn list_for(&self, persona: &PersonaDefinition) -> Vec<ToolDefinition> {
        persona
            .capabilities
            .iter()
            .filter_map(|name| match self.tools.get(name) {
                Some(handler) => Some(ToolDefinition {
                    name: handler.name().to_string(),
                    description: handler.description().to_string(),
                    input_schema: handler.input_schema(),
                }),
                None => {
                    debug!(
                        "Persona '{}' declares unregistered capability '{}'",
                        persona.key, name
                    );
                    None
                }
            })
            .collect()
    }

    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.tools.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    /// Number of registered capabilities
    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }

    /// Run one capability call for the persona in `ctx`. Never fails: refusals,
    /// invalid parameters and handler errors come back as explanatory text, and
    /// any scratch writes from a failed call are discarded.
    pub async fn dispatch(&self, name: &str, input: Value, ctx: &mut ToolContext<'_>) -> String {
        debug!("Dispatching capability {} for persona {}", name, ctx.persona.key);

        if !ctx.persona.allows(name) {
            warn!("Persona '{}' called undeclared capability '{}'", ctx.persona.key, name);
            return format!("Error: capability '{name}' is not available here");
        }

        let handler = match self.get(name) {
            Ok(handler) => handler,
            Err(e) => {
                warn!("{}", e);
                return format!("Error: {e}");
            }
        };

        if let Err(reason) = validate_params(&handler.input_schema(), &input) {
            warn!("Rejected call to {}: {}", name, reason);
            return format!("Error: invalid parameters for '{name}': {reason}");
        }

        let checkpoint = ctx.scratch.checkpoint();
        match handler.execute(input, ctx).await {
            Ok(output) => {
                debug!("Capability {} succeeded", name);
                truncate_output(output)
            }
            Err(e) => {
                ctx.scratch.rollback(checkpoint);
                warn!("Capability {} failed: {:#}", name, e);
                format!("Error: {e:#}")
            }
        }
    }
}

impl Default for CapabilityRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Helper function to create a JSON schema for capability input
pub fn json_schema(properties: Value, required: Vec<&str>) -> Value {
    serde_json::json!({
        "type": "object",
        "properties": properties,
        "required": required,
    })
}

/// Check required properties and declared primitive types
pub fn validate_params(schema: &Value, input: &Value) -> Result<(), String> {
    let Some(object) = input.as_object() else {
        return Err("parameters must be a JSON object".to_string());
    };

    if let Some(required) = schema.get("required").and_then(Value::as_array) {
        for name in required.iter().filter_map(Value::as_str) {
            if object.get(name).is_none_or(Value::is_null) {
                return Err(format!("missing required parameter '{name}'"));
            }
        }
    }

    if let Some(properties) = schema.get("properties").and_then(Value::as_object) {
        for (name, value) in object {
            let Some(expected) = properties
                .get(name)
                .and_then(|p| p.get("type"))
                .and_then(Value::as_str)
            else {
                continue;
            };
            if value.is_null() {
                continue;
            }
            let ok = match expected {
                "string" => value.is_string(),
                "integer" => value.is_i64() || value.is_u64(),
                "number" => value.is_number(),
                "boolean" => value.is_boolean(),
                "array" => value.is_array(),
                "object" => value.is_object(),
                _ => true,
            };
            if !ok {
                return Err(format!("parameter '{name}' must be of type {expected}"));
            }
        }
    }

    Ok(())
}

fn truncate_output(mut output: String) -> String {
    if output.len() > MAX_TOOL_OUTPUT {
        let mut cut = MAX_TOOL_OUTPUT;
        while !output.is_char_boundary(cut) {
            cut -= 1;
        }
        output.truncate(cut);
        output.push_str("\n[Output truncated]");
    }
    output
}
