//! Turn pipeline: load, build instructions, invoke model, postprocess,
//! reconcile transcript, persist

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::collaborators::{ConfigSource, EntryParams, ParamDecoder, ProfileSource};
use crate::config::{RoutingMode, RuntimeConfig};
use crate::error::{RoutingFault, StoreError, TurnError};
use crate::fields::FieldCatalog;
use crate::personas::{PersonaDefinition, PersonaStore, effective_instructions};
use crate::provider::{ChatMessage, ChatRole, ModelClient};
use crate::routing::{PathRouter, RouteMatch, RouteTableConfig, RoutingHint, normalize_path};
use crate::store::{
    DelegationRecord, Expiry, ProfileSnapshot, ProfileWrite, ScratchBuffer, SessionStore,
};
use crate::tools::profile::USER_ID_KEY;
use crate::tools::{CapabilityRegistry, DelegatedRequest, Delegator, ToolContext};
use crate::types::{
    History, Role, Session, TranscriptTurn, UserMode, is_valid_session_id, recent_user_messages,
};

pub mod postprocess;
pub mod suggestions;
pub mod summary;
mod tool_loop;

pub use postprocess::postprocess;

use tool_loop::ToolLoop;

/// Profile key recording the path a session was opened from
pub const ENTRY_PATH_KEY: &str = "entry_path";

/// Input to [`TurnPipeline::start_turn`]
#[derive(Debug, Clone, Default)]
pub struct TurnRequest {
    /// Existing session; a new one is minted when absent
    pub session_id: Option<String>,
    /// Explicit persona key; wins over `path`
    pub persona: Option<String>,
    /// Entry path to route on
    pub path: Option<String>,
    pub message: String,
    /// Profile facts known to the caller, merged before the turn runs
    pub caller_profile: BTreeMap<String, Value>,
    /// The message was sent by clicking a suggested next step
    pub from_suggestion: bool,
}

impl TurnRequest {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            ..Default::default()
        }
    }

    pub fn with_session(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = Some(session_id.into());
        self
    }

    pub fn with_persona(mut self, persona: impl Into<String>) -> Self {
        self.persona = Some(persona.into());
        self
    }

    pub fn with_path(mut self, path: impl Into<String>) -> Self {
        self.path = Some(path.into());
        self
    }

    pub fn with_profile(mut self, profile: BTreeMap<String, Value>) -> Self {
        self.caller_profile = profile;
        self
    }

    pub fn from_suggestion(mut self) -> Self {
        self.from_suggestion = true;
        self
    }
}

/// Result of a completed turn
#[derive(Debug, Clone)]
pub struct TurnOutcome {
    pub session_id: String,
    pub output: String,
    /// Persona whose answer the user sees
    pub persona: String,
    /// Set when an orchestrator handed the turn to this persona
    pub delegated_to: Option<String>,
    /// Non-expired profile after the turn
    pub profile: ProfileSnapshot,
    /// Routing fault that forced the fallback answer, if any
    pub fault: Option<RoutingFault>,
}

/// How a host opens a chat
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SessionEntry {
    /// Opaque parameter for the configured [`ParamDecoder`]
    #[serde(default)]
    pub encoded: Option<String>,
    #[serde(default)]
    pub user_id: Option<String>,
    #[serde(default)]
    pub path: Option<String>,
}

/// A freshly opened session
#[derive(Debug, Clone, Serialize)]
pub struct SessionOpening {
    pub session_id: String,
    pub persona: String,
    pub welcome: Option<String>,
    /// Number of profile entries seeded from the entry and profile source
    pub profile_fields: usize,
}

/// One persona's share of a turn
struct PersonaTurn<'a> {
    session_id: &'a str,
    persona: &'a PersonaDefinition,
    history: History<'a>,
    profile: &'a ProfileSnapshot,
    message: &'a str,
    hint: Option<&'a RoutingHint>,
    depth: u8,
}

/// Shared runtime. Registries are immutable; only the routing table can be swapped.
pub struct TurnPipeline {
    model: Arc<dyn ModelClient>,
    personas: Arc<PersonaStore>,
    capabilities: Arc<CapabilityRegistry>,
    catalog: Arc<FieldCatalog>,
    router: Arc<PathRouter>,
    store: Arc<dyn SessionStore>,
    profile_source: Option<Arc<dyn ProfileSource>>,
    decoder: Option<Arc<dyn ParamDecoder>>,
    config: RuntimeConfig,
}

impl TurnPipeline {
    pub fn new(
        model: Arc<dyn ModelClient>,
        personas: Arc<PersonaStore>,
        capabilities: Arc<CapabilityRegistry>,
        catalog: Arc<FieldCatalog>,
        router: Arc<PathRouter>,
        store: Arc<dyn SessionStore>,
    ) -> Self {
        Self {
            model,
            personas,
            capabilities,
            catalog,
            router,
            store,
            profile_source: None,
            decoder: None,
            config: RuntimeConfig::default(),
        }
    }

    pub fn with_config(mut self, config: RuntimeConfig) -> Self {
        self.config = config;
        self
    }

    /// Set the collaborator used to seed profiles in `open_session`
    pub fn with_profile_source(mut self, source: Arc<dyn ProfileSource>) -> Self {
        self.profile_source = Some(source);
        self
    }

    pub fn with_decoder(mut self, decoder: Arc<dyn ParamDecoder>) -> Self {
        self.decoder = Some(decoder);
        self
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    pub fn personas(&self) -> &PersonaStore {
        &self.personas
    }

    /// Run one user turn end to end. The time budget covers everything up to
    /// the final save, which runs to completion once started. On any error the
    /// stored session is left as it was.
    pub async fn start_turn(&self, request: TurnRequest) -> Result<TurnOutcome, TurnError> {
        if request.message.trim().is_empty() {
            return Err(TurnError::EmptyMessage);
        }

        let budget = self.config.turn_timeout();
        let (session, outcome) = match tokio::time::timeout(budget, self.run_turn(request)).await {
            Ok(result) => result?,
            Err(_) => {
                warn!("Turn timed out after {:?}", budget);
                return Err(TurnError::Timeout(budget));
            }
        };

        let version = self.store.save(&session).await?;
        debug!("Persisted session {} at version {}", session.id, version);
        Ok(outcome)
    }

    /// Everything before the save: returns the updated session and the answer
    async fn run_turn(&self, request: TurnRequest) -> Result<(Session, TurnOutcome), TurnError> {
        let now = Utc::now();
        let mut session = self.load_or_create(request.session_id.as_deref(), now).await?;
        summary::refresh(self.model.as_ref(), &self.config.summary, &mut session).await;

        let caller_writes = self.catalog.writes_from_map(&request.caller_profile);
        if !caller_writes.is_empty() {
            debug!(
                "Merging {} caller profile fields into session {}",
                caller_writes.len(),
                session.id
            );
            session
                .profile
                .apply_all(caller_writes, self.config.profile_ttl(), now);
        }

        let (persona, hint) = self.resolve_persona(&request, &session.persona)?;
        let switched = suggestions::advance(
            &mut session.meta,
            &self.config.suggestions,
            request.from_suggestion,
        );
        let guided = session.meta.user_mode == UserMode::Guided;
        let profile = session.profile.snapshot(now);

        info!(
            "Session {} turn {} handled by '{}'{}",
            session.id,
            session.meta.user_turns,
            persona.key,
            hint.as_ref()
                .map(|h| format!(" (hint: '{}')", h.persona))
                .unwrap_or_default()
        );

        let mut scratch = ScratchBuffer::new();
        let raw = self
            .run_persona(
                PersonaTurn {
                    session_id: &session.id,
                    persona,
                    history: session.history(),
                    profile: &profile,
                    message: &request.message,
                    hint: hint.as_ref(),
                    depth: 0,
                },
                &mut scratch,
            )
            .await?;

        // Reconcile: an accepted delegation replaces this persona's turn entirely
        let fault = routing_fault(persona, &scratch);
        let accepted = match (&fault, scratch.take_delegation()) {
            (None, Some(record)) => Some(record),
            (Some(fault), dropped) => {
                warn!("Routing fault in session {}: {}", session.id, fault);
                if let Some(record) = dropped {
                    debug!("Discarding delegated answer from '{}'", record.persona);
                }
                None
            }
            (None, None) => None,
        };

        let mut transcript = std::mem::take(&mut session.transcript);
        let (answered_by, raw_output, delegated_to) = match accepted {
            Some(record) => {
                scratch.stage_all(record.writes);
                let target = self.personas.get(&record.persona).unwrap_or(persona);
                transcript.extend(record.exchange);
                (target, record.output, Some(record.persona))
            }
            None => {
                transcript.push(TranscriptTurn::user(request.message.clone()));
                let text = if fault.is_some() && persona.is_orchestrator() {
                    persona.fallback_text().to_string()
                } else {
                    raw
                };
                (persona, text, None)
            }
        };

        let mut output = postprocess(answered_by, &raw_output, guided);
        if switched {
            if let Some(message) = &self.config.suggestions.transition_message {
                output.push_str("\n\n");
                output.push_str(message);
            }
        }

        if delegated_to.is_some() && transcript.last().is_some_and(|t| t.role == Role::Assistant) {
            transcript.pop();
        }
        transcript.push(TranscriptTurn::assistant(answered_by.key.clone(), output.clone()));

        session.transcript = transcript;
        session.persona = answered_by.key.clone();
        session
            .profile
            .apply_all(scratch.into_writes(), self.config.profile_ttl(), now);
        session.profile.prune(now);
        session.trim_transcript(self.config.max_transcript_turns);
        session.updated_at = now;

        let outcome = TurnOutcome {
            profile: session.profile.snapshot(now),
            session_id: session.id.clone(),
            output,
            persona: answered_by.key.clone(),
            delegated_to,
            fault,
        };
        Ok((session, outcome))
    }

    async fn run_persona(
        &self,
        turn: PersonaTurn<'_>,
        scratch: &mut ScratchBuffer,
    ) -> Result<String, TurnError> {
        let recent = recent_user_messages(turn.history.turns, turn.persona.recent.count);
        let instructions = effective_instructions(
            turn.persona,
            &self.catalog,
            turn.profile,
            turn.history.summary,
            &recent,
        );
        let tools = self.capabilities.list_for(turn.persona);

        let mut conversation = ChatMessage::history(turn.history.window());
        conversation.push(ChatMessage::text(ChatRole::User, turn.message));

        let mut ctx = ToolContext {
            session_id: turn.session_id,
            persona: turn.persona,
            profile: turn.profile,
            history: turn.history,
            message: turn.message,
            scratch,
            depth: turn.depth,
            delegator: Some(self),
        };

        ToolLoop {
            model: self.model.as_ref(),
            registry: &self.capabilities,
            persona: turn.persona,
            instructions: &instructions,
            tools: &tools,
            hint: turn.hint,
        }
        .run(conversation, &mut ctx)
        .await
    }

    async fn load_or_create(&self, id: Option<&str>, now: DateTime<Utc>) -> Result<Session, StoreError> {
        let Some(id) = id else {
            let session = Session::mint(String::new(), now);
            debug!("Minted session {}", session.id);
            return Ok(session);
        };
        if !is_valid_session_id(id) {
            return Err(StoreError::InvalidSessionId(id.to_string()));
        }

        match self.store.load(id).await? {
            Some(stale) if stale.is_idle_expired(self.config.session_ttl(), now) => {
                info!("Session {} expired after inactivity, starting fresh", id);
                // Same version, so the turn's save replaces the stale row
                let mut fresh = Session::new(id, String::new(), now);
                fresh.version = stale.version;
                Ok(fresh)
            }
            Some(session) => Ok(session),
            None => {
                debug!("Session {} not found, creating it", id);
                Ok(Session::new(id, String::new(), now))
            }
        }
    }

    /// Pick the persona for this turn and an optional routing hint
    fn resolve_persona(
        &self,
        request: &TurnRequest,
        session_persona: &str,
    ) -> Result<(&PersonaDefinition, Option<RoutingHint>), TurnError> {
        if let Some(key) = request.persona.as_deref() {
            let Some(persona) = self.personas.get(key) else {
                warn!("Unknown persona '{}' requested, using default", key);
                return Ok((self.default_persona()?, None));
            };
            if persona.is_orchestrator() {
                return Ok((persona, None));
            }
            if let Some(orchestrator) = self.orchestrator() {
                return Ok((orchestrator, Some(RoutingHint::explicit(key))));
            }
            return Ok((persona, None));
        }

        if let Some(path) = request.path.as_deref() {
            let routed = self.router.resolve(path);
            if let Some(orchestrator) = self.orchestrator() {
                let hint = RoutingHint::from_path(routed.persona, routed.path);
                return Ok((orchestrator, Some(hint)));
            }
            if let Some(persona) = self.personas.get(&routed.persona) {
                return Ok((persona, None));
            }
            warn!(
                "Path '{}' routes to undefined persona '{}', using default",
                routed.path, routed.persona
            );
            return Ok((self.default_persona()?, None));
        }

        match self.personas.get(session_persona) {
            Some(persona) => Ok((persona, None)),
            None => Ok((self.default_persona()?, None)),
        }
    }

    /// The orchestrator, when routing goes through it
    fn orchestrator(&self) -> Option<&PersonaDefinition> {
        match self.config.routing_mode {
            RoutingMode::Direct => None,
            RoutingMode::Orchestrated => {
                let found = self.personas.get(&self.config.orchestrator);
                if found.is_none() {
                    warn!(
                        "Orchestrator '{}' is not defined, routing directly",
                        self.config.orchestrator
                    );
                }
                found
            }
        }
    }

    fn default_persona(&self) -> Result<&PersonaDefinition, TurnError> {
        let key = self.router.default_persona();
        self.personas.get(&key).ok_or(TurnError::NoPersona(key))
    }

    /// Create a session for a host page, seeding its profile from the entry
    /// and the profile source. Decode and fetch failures fall back to defaults.
    pub async fn open_session(&self, entry: SessionEntry) -> Result<SessionOpening, TurnError> {
        let params = self.decode_entry(entry);
        let now = Utc::now();
        let ttl = self.config.profile_ttl();

        let persona = match params.path.as_deref() {
            Some(path) => {
                let routed = self.router.resolve(path);
                match self.personas.get(&routed.persona) {
                    Some(persona) => persona,
                    None => {
                        warn!("Path '{}' routes to undefined persona '{}'", path, routed.persona);
                        self.default_persona()?
                    }
                }
            }
            None => self.default_persona()?,
        };

        let mut session = Session::mint(persona.key.clone(), now);

        if let Some(user_id) = params.user_id.as_deref() {
            if let Some(source) = &self.profile_source {
                match source.fetch_profile(user_id).await {
                    Ok(raw) => {
                        let writes = self.catalog.writes_from_map(&raw);
                        debug!("Seeding {} profile fields for user {}", writes.len(), user_id);
                        session.profile.apply_all(writes, ttl, now);
                    }
                    Err(e) => warn!("Profile fetch failed for user {}: {:#}", user_id, e),
                }
            }
            session.profile.apply(
                ProfileWrite::new(USER_ID_KEY, json!(user_id)).with_expiry(Expiry::Never),
                ttl,
                now,
            );
        }
        if let Some(path) = params.path.as_deref() {
            session.profile.apply(
                ProfileWrite::new(ENTRY_PATH_KEY, json!(normalize_path(path)))
                    .with_expiry(Expiry::Never),
                ttl,
                now,
            );
        }

        if let Some(welcome) = &persona.welcome {
            session
                .transcript
                .push(TranscriptTurn::assistant(persona.key.clone(), welcome.clone()));
        }

        self.store.save(&session).await?;
        info!("Opened session {} with persona '{}'", session.id, persona.key);

        Ok(SessionOpening {
            profile_fields: session.profile.len(),
            session_id: session.id,
            persona: persona.key.clone(),
            welcome: persona.welcome.clone(),
        })
    }

    fn decode_entry(&self, entry: SessionEntry) -> EntryParams {
        let mut params = EntryParams {
            user_id: entry.user_id,
            path: entry.path,
        };
        let Some(encoded) = entry.encoded.filter(|e| !e.trim().is_empty()) else {
            return params;
        };
        match &self.decoder {
            Some(decoder) => match decoder.decode(&encoded) {
                Ok(decoded) => {
                    params.user_id = decoded.user_id.or(params.user_id);
                    params.path = decoded.path.or(params.path);
                }
                Err(e) => warn!("Could not decode entry parameter: {:#}", e),
            },
            None => warn!("Entry parameter supplied but no decoder is configured"),
        }
        params
    }

    /// Non-expired profile of an existing session
    pub async fn get_profile(&self, session_id: &str) -> Result<ProfileSnapshot, StoreError> {
        let session = self.load_existing(session_id).await?;
        Ok(session.profile.snapshot(Utc::now()))
    }

    pub async fn get_transcript(&self, session_id: &str) -> Result<Vec<TranscriptTurn>, StoreError> {
        Ok(self.load_existing(session_id).await?.transcript)
    }

    /// Drop a session; returns whether it existed
    pub async fn expire_session(&self, session_id: &str) -> Result<bool, StoreError> {
        if !is_valid_session_id(session_id) {
            return Err(StoreError::InvalidSessionId(session_id.to_string()));
        }
        let existed = self.store.delete(session_id).await?;
        info!("Expired session {} (existed: {})", session_id, existed);
        Ok(existed)
    }

    /// Remove expired profile entries and idle sessions from the store
    pub async fn purge_expired(&self) -> Result<usize, StoreError> {
        let now = Utc::now();
        let idle_before = self
            .config
            .session_ttl()
            .and_then(|ttl| chrono::Duration::from_std(ttl).ok())
            .map(|ttl| now - ttl);
        self.store.purge_expired(now, idle_before).await
    }

    pub fn route(&self, path: &str) -> RouteMatch {
        self.router.resolve(path)
    }

    pub fn reload_routes(&self, table: &RouteTableConfig) {
        self.router.reload(table);
    }

    pub fn reload_routes_from(&self, source: &dyn ConfigSource) -> anyhow::Result<()> {
        let table = source.route_table()?;
        self.router.reload(&table);
        Ok(())
    }

    async fn load_existing(&self, id: &str) -> Result<Session, StoreError> {
        if !is_valid_session_id(id) {
            return Err(StoreError::InvalidSessionId(id.to_string()));
        }
        match self.store.load(id).await? {
            Some(session) if !session.is_idle_expired(self.config.session_ttl(), Utc::now()) => {
                Ok(session)
            }
            _ => Err(StoreError::NotFound(id.to_string())),
        }
    }
}

/// Protocol violation that voids this turn's delegation, if any
fn routing_fault(persona: &PersonaDefinition, scratch: &ScratchBuffer) -> Option<RoutingFault> {
    let attempts = scratch.delegation_attempts();
    if attempts > 1 {
        return Some(RoutingFault::MultipleDelegations(attempts));
    }
    if let Some(fault) = scratch.faults().first() {
        return Some(fault.clone());
    }
    if persona.is_orchestrator() && scratch.delegation().is_none() {
        return Some(RoutingFault::NoDelegation);
    }
    None
}

#[async_trait]
impl Delegator for TurnPipeline {
    fn persona(&self, key: &str) -> Option<&PersonaDefinition> {
        self.personas.get(key)
    }

    fn persona_keys(&self) -> Vec<String> {
        self.personas.keys().to_vec()
    }

    async fn run_delegated(&self, request: DelegatedRequest<'_>) -> Result<DelegationRecord, TurnError> {
        let mut scratch = ScratchBuffer::new();
        let output = self
            .run_persona(
                PersonaTurn {
                    session_id: request.session_id,
                    persona: request.target,
                    history: request.history,
                    profile: request.profile,
                    message: request.message,
                    hint: None,
                    depth: 1,
                },
                &mut scratch,
            )
            .await?;

        Ok(DelegationRecord {
            persona: request.target.key.clone(),
            exchange: vec![
                TranscriptTurn::user(request.message),
                TranscriptTurn::assistant(request.target.key.clone(), output.clone()),
            ],
            output,
            writes: scratch.into_writes(),
        })
    }
}
