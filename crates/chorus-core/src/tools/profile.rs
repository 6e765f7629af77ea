//! Capabilities that stage user-profile writes

use anyhow::{Context, Result, anyhow, bail};
use async_trait::async_trait;
use serde_json::{Value, json};
use std::sync::Arc;
use tracing::debug;

use crate::collaborators::ProfileSource;
use crate::fields::{FieldCatalog, FieldType};
use crate::personas::instructions::SAVE_USER_INFO;
use crate::store::ProfileWrite;

use super::{ToolContext, ToolHandler, json_schema};

/// Profile key holding the external user id
pub const USER_ID_KEY: &str = "user_id";

/// Record a fact the user shared about themselves
pub struct SaveUserInfoTool {
    catalog: Arc<FieldCatalog>,
}

impl SaveUserInfoTool {
    pub fn new(catalog: Arc<FieldCatalog>) -> Self {
        Self { catalog }
    }
}

#[async_trait]
impl ToolHandler for SaveUserInfoTool {
    fn name(&self) -> &str {
        SAVE_USER_INFO
    }

    fn description(&self) -> &str {
        "Save a fact the user shared about themselves (name, age, city, interests, ...). \
         Call once per fact. Do not mention saving to the user."
    }

    fn input_schema(&self) -> Value {
        json_schema(
            json!({
                "field_name": {
                    "type": "string",
                    "description": "Field to save, e.g. name, age, city, interest"
                },
                "field_value": {
                    "description": "Value exactly as the user stated it"
                }
            }),
            vec!["field_name", "field_value"],
        )
    }

    async fn execute(&self, input: Value, ctx: &mut ToolContext<'_>) -> Result<String> {
        let field = input
            .get("field_name")
            .and_then(|v| v.as_str())
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .ok_or_else(|| anyhow!("Missing 'field_name' parameter"))?;
        let raw = input
            .get("field_value")
            .ok_or_else(|| anyhow!("Missing 'field_value' parameter"))?;

        let spec = self.catalog.resolve(field);
        if spec.is_some_and(|s| !s.enabled) {
            bail!("field '{}' is not collected", field);
        }
        let key = self.catalog.normalize(field);

        let (value, expiry) = match spec {
            Some(spec) => (spec.coerce(raw)?, spec.expiry()),
            None => match raw {
                Value::String(s) if !s.trim().is_empty() => (json!(s.trim()), Default::default()),
                Value::String(_) | Value::Null => bail!("'{}' cannot be empty", field),
                other => (other.clone(), Default::default()),
            },
        };

        if spec.is_some_and(|s| s.data_type == FieldType::List) {
            let existing = ctx.current_value(&key).and_then(Value::as_array);
            let incoming = value.as_array().map(Vec::as_slice).unwrap_or_default();
            if existing.is_some_and(|items| incoming.iter().all(|i| items.contains(i))) {
                debug!("{} already holds {:?}", key, incoming);
                return Ok(format!("'{key}' already includes that"));
            }
        }

        debug!("Staging {} = {} for session {}", key, value, ctx.session_id);
        ctx.scratch.stage(
            ProfileWrite::new(key.clone(), value)
                .with_expiry(expiry)
                .with_owner(ctx.persona.key.clone()),
        );
        Ok(format!("Saved '{key}'"))
    }
}

/// Re-fetch the user's external profile and stage it for merge
pub struct RefreshProfileTool {
    source: Arc<dyn ProfileSource>,
    catalog: Arc<FieldCatalog>,
}

impl RefreshProfileTool {
    pub fn new(source: Arc<dyn ProfileSource>, catalog: Arc<FieldCatalog>) -> Self {
        Self { source, catalog }
    }
}

#[async_trait]
impl ToolHandler for RefreshProfileTool {
    fn name(&self) -> &str {
        "refresh_profile"
    }

    fn description(&self) -> &str {
        "Reload the user's account data (points, level, saved items) when the user says it changed."
    }

    fn input_schema(&self) -> Value {
        json_schema(json!({}), vec![])
    }

    async fn execute(&self, _input: Value, ctx: &mut ToolContext<'_>) -> Result<String> {
        let user_id = ctx
            .profile
            .get(USER_ID_KEY)
            .and_then(Value::as_str)
            .ok_or_else(|| anyhow!("this session is not linked to a user account"))?
            .to_string();

        let raw = self
            .source
            .fetch_profile(&user_id)
            .await
            .with_context(|| format!("profile fetch failed for user {user_id}"))?;

        let writes = self.catalog.writes_from_map(&raw);
        let count = writes.len();
        let owner = ctx.persona.key.clone();
        ctx.scratch
            .stage_all(writes.into_iter().map(|w| w.with_owner(owner.clone())));

        debug!("Staged {} refreshed profile fields for user {}", count, user_id);
        Ok(format!("Refreshed {count} profile fields"))
    }
}
