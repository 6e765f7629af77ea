//! Single-hop delegation from an orchestrator persona to a specialist

use anyhow::{Result, anyhow};
use async_trait::async_trait;
use serde_json::{Value, json};
use tracing::{info, warn};

use crate::error::{RoutingFault, TurnError};
use crate::personas::PersonaDefinition;
use crate::routing::hint::strip_hint_markup;
use crate::store::{DelegationRecord, ProfileSnapshot};
use crate::types::History;

use super::{ToolContext, ToolHandler, json_schema};

pub const ROUTE_TO_PERSONA: &str = "route_to_persona";

/// Input for a delegated sub-turn
pub struct DelegatedRequest<'a> {
    pub session_id: &'a str,
    pub target: &'a PersonaDefinition,
    /// The user's own words, never the caller's rewording
    pub message: &'a str,
    /// Session history before this turn
    pub history: History<'a>,
    pub profile: &'a ProfileSnapshot,
}

/// Runs a full persona turn on behalf of the delegation capability
#[async_trait]
pub trait Delegator: Send + Sync {
    fn persona(&self, key: &str) -> Option<&PersonaDefinition>;

    fn persona_keys(&self) -> Vec<String>;

    async fn run_delegated(&self, request: DelegatedRequest<'_>) -> Result<DelegationRecord, TurnError>;
}

/// The delegation capability. Protocol checks happen here, before any sub-turn starts.
pub struct RouteToPersonaTool;

impl RouteToPersonaTool {
    fn reject(ctx: &mut ToolContext<'_>, fault: RoutingFault) -> anyhow::Error {
        warn!("Routing fault in session {}: {}", ctx.session_id, fault);
        ctx.scratch.record_fault(fault.clone());
        anyhow!(fault)
    }
}

#[async_trait]
impl ToolHandler for RouteToPersonaTool {
    fn name(&self) -> &str {
        ROUTE_TO_PERSONA
    }

    fn description(&self) -> &str {
        "Hand the user's message to the specialist persona best suited to answer it. \
         Call exactly once per turn."
    }

    fn input_schema(&self) -> Value {
        json_schema(
            json!({
                "persona": {
                    "type": "string",
                    "description": "Key of the persona that should answer"
                }
            }),
            vec!["persona"],
        )
    }

    async fn execute(&self, input: Value, ctx: &mut ToolContext<'_>) -> Result<String> {
        let attempt = ctx.scratch.note_delegation_attempt();
        let target_key = input
            .get("persona")
            .and_then(|v| v.as_str())
            .map(str::trim)
            .ok_or_else(|| anyhow!("Missing 'persona' parameter"))?
            .to_string();

        if ctx.depth > 0 {
            return Err(Self::reject(ctx, RoutingFault::NestedDelegation));
        }
        if attempt > 1 {
            return Err(Self::reject(ctx, RoutingFault::MultipleDelegations(attempt)));
        }
        if target_key == ctx.persona.key {
            return Err(Self::reject(ctx, RoutingFault::SelfDelegation(target_key)));
        }

        let Some(delegator) = ctx.delegator else {
            return Err(anyhow!("delegation is not available in this context"));
        };
        let Some(target) = delegator.persona(&target_key) else {
            let available = delegator.persona_keys().join(", ");
            let err = Self::reject(ctx, RoutingFault::UnknownTarget(target_key));
            return Err(err.context(format!("available personas: {available}")));
        };
        if target.is_orchestrator() {
            return Err(Self::reject(ctx, RoutingFault::OrchestratorTarget(target_key)));
        }

        // The target answers what the user said; a `message` argument from the caller is ignored
        let forwarded = match strip_hint_markup(ctx.message) {
            stripped if stripped.is_empty() => ctx.message.to_string(),
            stripped => stripped,
        };

        info!(
            "Delegating session {} from '{}' to '{}'",
            ctx.session_id, ctx.persona.key, target.key
        );

        let record = delegator
            .run_delegated(DelegatedRequest {
                session_id: ctx.session_id,
                target,
                message: &forwarded,
                history: ctx.history,
                profile: ctx.profile,
            })
            .await;

        match record {
            Ok(record) => {
                let output = record.output.clone();
                ctx.scratch.record_delegation(record);
                Ok(output)
            }
            Err(e) => Err(Self::reject(
                ctx,
                RoutingFault::DelegateFailed {
                    persona: target_key,
                    reason: e.to_string(),
                },
            )),
        }
    }
}
