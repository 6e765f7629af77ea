use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{anyhow, bail};
use async_trait::async_trait;
use chrono::Utc;
use serde_json::{Value, json};

use chorus_core::personas::SuggestionPolicy;
use chorus_core::pipeline::summary::SUMMARIZER_KEY;
use chorus_core::provider::{ChatBlock, ChatMessageContent, ChatResponse, ResponseBlock, StopReason};
use chorus_core::routing::HintSource;
use chorus_core::store::{ProfileEntry, ProfileWrite};
use chorus_core::tools::json_schema;
use chorus_core::*;

const ROUTER_FALLBACK: &str = "I couldn't find the right helper for that. Could you rephrase?";

// ─── Scripted model ─────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
struct Call {
    hint: Option<String>,
    hint_source: Option<HintSource>,
    last_message: String,
    /// Messages sent, history included
    message_count: usize,
    instructions: String,
}

#[derive(Default)]
struct ScriptedModel {
    scripts: Mutex<HashMap<String, VecDeque<ChatResponse>>>,
    calls: Mutex<Vec<(String, Call)>>,
}

impl ScriptedModel {
    fn script(self, persona: &str, responses: Vec<ChatResponse>) -> Self {
        self.scripts
            .lock()
            .unwrap()
            .insert(persona.to_string(), responses.into());
        self
    }

    fn calls_for(&self, persona: &str) -> Vec<Call> {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter(|(p, _)| p == persona)
            .map(|(_, c)| c.clone())
            .collect()
    }
}

#[async_trait]
impl ModelClient for ScriptedModel {
    fn provider_name(&self) -> &str {
        "scripted"
    }

    fn model(&self) -> &str {
        "scripted-1"
    }

    async fn invoke(&self, request: ModelRequest<'_>) -> anyhow::Result<ChatResponse> {
        let last_message = match request.messages.last().map(|m| &m.content) {
            Some(ChatMessageContent::Text(text)) => text.clone(),
            Some(ChatMessageContent::Blocks(blocks)) => blocks
                .iter()
                .filter_map(|b| match b {
                    ChatBlock::ToolResult { content, .. } => Some(content.as_str()),
                    _ => None,
                })
                .collect::<Vec<_>>()
                .join("\n"),
            None => String::new(),
        };
        self.calls.lock().unwrap().push((
            request.persona.to_string(),
            Call {
                hint: request.routing_hint.map(|h| h.persona.clone()),
                hint_source: request.routing_hint.map(|h| h.source.clone()),
                last_message,
                message_count: request.messages.len(),
                instructions: request.instructions.to_string(),
            },
        ));
        self.scripts
            .lock()
            .unwrap()
            .get_mut(request.persona)
            .and_then(VecDeque::pop_front)
            .ok_or_else(|| anyhow!("no scripted response left for '{}'", request.persona))
    }
}

/// Writes the session behind the pipeline's back while the turn is running
struct MeddlingModel {
    store: MemoryStore,
    session_id: String,
}

#[async_trait]
impl ModelClient for MeddlingModel {
    fn provider_name(&self) -> &str {
        "meddling"
    }

    fn model(&self) -> &str {
        "meddling-1"
    }

    async fn invoke(&self, _request: ModelRequest<'_>) -> anyhow::Result<ChatResponse> {
        let session = match self.store.load(&self.session_id).await? {
            Some(session) => session,
            None => Session::new(self.session_id.clone(), "faq", Utc::now()),
        };
        self.store.save(&session).await?;
        Ok(ChatResponse::text("done"))
    }
}

struct SlowModel;

#[async_trait]
impl ModelClient for SlowModel {
    fn provider_name(&self) -> &str {
        "slow"
    }

    fn model(&self) -> &str {
        "slow-1"
    }

    async fn invoke(&self, _request: ModelRequest<'_>) -> anyhow::Result<ChatResponse> {
        tokio::time::sleep(Duration::from_secs(3)).await;
        Ok(ChatResponse::text("too late"))
    }
}

/// Takes longer to save than a whole turn is allowed to run
#[derive(Clone)]
struct SlowSaveStore {
    inner: MemoryStore,
    delay: Duration,
}

#[async_trait]
impl SessionStore for SlowSaveStore {
    async fn load(&self, id: &str) -> Result<Option<Session>, StoreError> {
        self.inner.load(id).await
    }

    async fn save(&self, session: &Session) -> Result<u64, StoreError> {
        tokio::time::sleep(self.delay).await;
        self.inner.save(session).await
    }

    async fn delete(&self, id: &str) -> Result<bool, StoreError> {
        self.inner.delete(id).await
    }

    async fn purge_expired(
        &self,
        now: chrono::DateTime<Utc>,
        idle_before: Option<chrono::DateTime<Utc>>,
    ) -> Result<usize, StoreError> {
        self.inner.purge_expired(now, idle_before).await
    }
}

// ─── Collaborators ──────────────────────────────────────────────────────────

struct FlakyLookup;

#[async_trait]
impl ToolHandler for FlakyLookup {
    fn name(&self) -> &str {
        "flaky_lookup"
    }

    fn description(&self) -> &str {
        "Look up the user's tier"
    }

    fn input_schema(&self) -> Value {
        json_schema(json!({}), vec![])
    }

    async fn execute(&self, _input: Value, ctx: &mut ToolContext<'_>) -> anyhow::Result<String> {
        ctx.scratch.stage(ProfileWrite::new("user_level", json!("gold")));
        bail!("points service unavailable")
    }
}

struct StaticDecoder;

impl ParamDecoder for StaticDecoder {
    fn decode(&self, param: &str) -> anyhow::Result<EntryParams> {
        match param {
            "token-42" => Ok(EntryParams {
                user_id: Some("42".into()),
                path: Some("/rewards/history".into()),
            }),
            _ => Err(anyhow!("bad padding")),
        }
    }
}

struct StaticProfiles;

#[async_trait]
impl ProfileSource for StaticProfiles {
    async fn fetch_profile(&self, user_id: &str) -> anyhow::Result<BTreeMap<String, Value>> {
        match user_id {
            "42" => Ok(BTreeMap::from([
                ("name".to_string(), json!("Sara")),
                ("city".to_string(), json!("Tabriz")),
            ])),
            _ => Err(anyhow!("user service returned 503")),
        }
    }
}

// ─── Harness ────────────────────────────────────────────────────────────────

fn personas() -> PersonaStore {
    let mut orchestrator =
        PersonaRecord::new("orchestrator", "Never answer yourself. Route every message.");
    orchestrator.role = PersonaRole::Orchestrator;
    orchestrator.capabilities = vec!["route_to_persona".into()];
    orchestrator.output.fallback_text = Some(ROUTER_FALLBACK.into());

    let mut rewards = PersonaRecord::new("rewards", "You explain reward points.");
    rewards.capabilities = vec!["save_user_info".into(), "flaky_lookup".into()];

    let mut faq = PersonaRecord::new("faq", "You answer general questions.");
    faq.capabilities = vec!["save_user_info".into()];
    faq.welcome = Some("Hi! Ask me anything.".into());

    let mut guide = PersonaRecord::new("guide", "You walk new users through the app.");
    guide.output.suggestions = Some(SuggestionPolicy {
        header: "Next actions:".into(),
        max_items: 2,
        fallback: vec![
            "Ask about points".into(),
            "Browse rewards".into(),
            "Talk to support".into(),
        ],
    });

    let broken = PersonaRecord::new("broken", "   ");

    PersonaStore::load(vec![orchestrator, rewards, faq, guide, broken])
}

fn routes() -> RouteTableConfig {
    RouteTableConfig {
        default: "faq".into(),
        paths: vec![
            PathMapping::new("/rewards/*", "rewards"),
            PathMapping::new("/faq", "faq"),
            PathMapping::new("/guide", "guide"),
        ],
    }
}

fn pipeline_with(model: Arc<dyn ModelClient>, store: impl SessionStore + 'static, config: RuntimeConfig) -> TurnPipeline {
    let catalog = Arc::new(FieldCatalog::standard());
    let mut registry = CapabilityRegistry::with_builtins(Arc::clone(&catalog), None).unwrap();
    registry.register(Arc::new(FlakyLookup)).unwrap();

    TurnPipeline::new(
        model,
        Arc::new(personas()),
        Arc::new(registry),
        catalog,
        Arc::new(PathRouter::new(&routes())),
        Arc::new(store),
    )
    .with_config(config)
}

fn scripted(model: ScriptedModel, config: RuntimeConfig) -> (TurnPipeline, Arc<ScriptedModel>, MemoryStore) {
    let model = Arc::new(model);
    let store = MemoryStore::new();
    let pipeline = pipeline_with(model.clone(), store.clone(), config);
    (pipeline, model, store)
}

fn orchestrated() -> RuntimeConfig {
    RuntimeConfig {
        routing_mode: RoutingMode::Orchestrated,
        ..Default::default()
    }
}

fn route_call(id: &str, persona: &str) -> ResponseBlock {
    ResponseBlock::ToolCall {
        id: id.into(),
        name: "route_to_persona".into(),
        input: json!({ "persona": persona }),
    }
}

fn save_call(field: &str, value: Value) -> ChatResponse {
    ChatResponse::tool_call(
        "save_1",
        "save_user_info",
        json!({ "field_name": field, "field_value": value }),
    )
}

// ─── Routing ────────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_path_routes_new_session_to_rewards() {
    let model = ScriptedModel::default().script(
        "rewards",
        vec![
            ChatResponse::text("You have 120 points."),
            ChatResponse::text("They expire in March."),
        ],
    );
    let (pipeline, _, _) = scripted(model, RuntimeConfig::default());

    let outcome = pipeline
        .start_turn(TurnRequest::new("How many points do I have?").with_path("/rewards/history"))
        .await
        .unwrap();
    assert_eq!(outcome.persona, "rewards");
    assert_eq!(outcome.output, "You have 120 points.");
    assert!(outcome.delegated_to.is_none());

    let transcript = pipeline.get_transcript(&outcome.session_id).await.unwrap();
    assert_eq!(transcript.len(), 2);
    assert_eq!(transcript[0].role, Role::User);
    assert_eq!(transcript[1].persona.as_deref(), Some("rewards"));

    // follow-up without a path stays with the session's persona
    let next = pipeline
        .start_turn(TurnRequest::new("When do they expire?").with_session(&outcome.session_id))
        .await
        .unwrap();
    assert_eq!(next.persona, "rewards");
    assert_eq!(pipeline.get_transcript(&next.session_id).await.unwrap().len(), 4);
}

#[tokio::test]
async fn test_unknown_explicit_persona_falls_back_to_default() {
    let model = ScriptedModel::default().script("faq", vec![ChatResponse::text("Hello!")]);
    let (pipeline, _, _) = scripted(model, RuntimeConfig::default());

    let outcome = pipeline
        .start_turn(TurnRequest::new("hi").with_persona("astrologer"))
        .await
        .unwrap();
    assert_eq!(outcome.persona, "faq");
}

#[tokio::test]
async fn test_malformed_persona_record_is_skipped() {
    let model = ScriptedModel::default().script("faq", vec![ChatResponse::text("Hello!")]);
    let (pipeline, _, _) = scripted(model, RuntimeConfig::default());

    assert!(!pipeline.personas().contains("broken"));
    let outcome = pipeline
        .start_turn(TurnRequest::new("hi").with_persona("broken"))
        .await
        .unwrap();
    assert_eq!(outcome.persona, "faq");
}

// ─── Delegation ─────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_orchestrator_with_hint_delegates_elsewhere() {
    let model = ScriptedModel::default()
        .script(
            "orchestrator",
            vec![ChatResponse::tool_call(
                "call_1",
                "route_to_persona",
                json!({ "persona": "faq", "message": "What are your opening hours?" }),
            )],
        )
        .script("faq", vec![ChatResponse::text("We are open 9 to 5.")]);
    let (pipeline, model, _) = scripted(model, orchestrated());

    let outcome = pipeline
        .start_turn(TurnRequest::new("What are your opening hours?").with_path("/rewards/history"))
        .await
        .unwrap();
    assert_eq!(outcome.persona, "faq");
    assert_eq!(outcome.delegated_to.as_deref(), Some("faq"));
    assert_eq!(outcome.output, "We are open 9 to 5.");
    assert!(outcome.fault.is_none());

    let routed = model.calls_for("orchestrator");
    assert_eq!(routed.len(), 1);
    assert_eq!(routed[0].hint.as_deref(), Some("rewards"));
    assert_eq!(routed[0].last_message, "What are your opening hours?");

    let answered = model.calls_for("faq");
    assert_eq!(answered.len(), 1);
    assert!(answered[0].hint.is_none());

    let transcript = pipeline.get_transcript(&outcome.session_id).await.unwrap();
    assert_eq!(transcript.len(), 2);
    assert_eq!(transcript[1].persona.as_deref(), Some("faq"));
    assert!(transcript.iter().all(|t| t.persona.as_deref() != Some("orchestrator")));
}

#[tokio::test]
async fn test_self_delegation_rejected_without_sub_turn() {
    let model = ScriptedModel::default().script(
        "orchestrator",
        vec![
            ChatResponse::tool_call("call_1", "route_to_persona", json!({ "persona": "orchestrator" })),
            ChatResponse::text("Routing you now..."),
        ],
    );
    let (pipeline, model, _) = scripted(model, orchestrated());

    let outcome = pipeline
        .start_turn(TurnRequest::new("Tell me about rewards").with_path("/rewards/history"))
        .await
        .unwrap();
    assert_eq!(
        outcome.fault,
        Some(RoutingFault::SelfDelegation("orchestrator".into()))
    );
    assert_eq!(outcome.output, ROUTER_FALLBACK);
    assert!(model.calls_for("rewards").is_empty());
    assert!(model.calls_for("faq").is_empty());

    let second = &model.calls_for("orchestrator")[1];
    assert!(second.last_message.contains("delegate to itself"));

    let transcript = pipeline.get_transcript(&outcome.session_id).await.unwrap();
    assert!(transcript.iter().all(|t| !t.text.contains("Routing you now")));
}

#[tokio::test]
async fn test_orchestrator_answering_directly_is_a_fault() {
    let model = ScriptedModel::default().script(
        "orchestrator",
        vec![ChatResponse::text("Points expire yearly.")],
    );
    let (pipeline, _, _) = scripted(model, orchestrated());

    let outcome = pipeline
        .start_turn(TurnRequest::new("Do points expire?").with_path("/rewards/history"))
        .await
        .unwrap();
    assert_eq!(outcome.fault, Some(RoutingFault::NoDelegation));
    assert_eq!(outcome.output, ROUTER_FALLBACK);

    let transcript = pipeline.get_transcript(&outcome.session_id).await.unwrap();
    assert_eq!(transcript.len(), 2);
    assert!(transcript.iter().all(|t| !t.text.contains("Points expire")));
}

#[tokio::test]
async fn test_delegated_writes_merged_only_when_accepted() {
    let accepted = ScriptedModel::default()
        .script(
            "orchestrator",
            vec![ChatResponse::tool_call("c1", "route_to_persona", json!({ "persona": "faq" }))],
        )
        .script(
            "faq",
            vec![
                save_call("name", json!("Sara")),
                ChatResponse::text("Nice to meet you, Sara."),
            ],
        );
    let (pipeline, _, _) = scripted(accepted, orchestrated());
    let outcome = pipeline
        .start_turn(TurnRequest::new("I'm Sara").with_path("/faq"))
        .await
        .unwrap();
    assert_eq!(outcome.profile.get("user_name"), Some(&json!("Sara")));

    let rejected = ScriptedModel::default()
        .script(
            "orchestrator",
            vec![ChatResponse {
                blocks: vec![route_call("c1", "faq"), route_call("c2", "rewards")],
                stop_reason: StopReason::ToolUse,
            }],
        )
        .script(
            "faq",
            vec![
                save_call("name", json!("Sara")),
                ChatResponse::text("Nice to meet you, Sara."),
            ],
        );
    let (pipeline, model, _) = scripted(rejected, orchestrated());
    let outcome = pipeline
        .start_turn(TurnRequest::new("I'm Sara").with_path("/faq"))
        .await
        .unwrap();
    assert_eq!(outcome.fault, Some(RoutingFault::MultipleDelegations(2)));
    assert_eq!(outcome.output, ROUTER_FALLBACK);
    assert!(outcome.profile.get("user_name").is_none());
    assert!(model.calls_for("rewards").is_empty());
}

#[tokio::test]
async fn test_delegation_keeps_the_users_own_words() {
    let asked = "Hey, when are you guys open on weekdays?";
    let model = ScriptedModel::default()
        .script(
            "orchestrator",
            vec![ChatResponse::tool_call(
                "call_1",
                "route_to_persona",
                json!({ "persona": "faq", "message": "opening hours" }),
            )],
        )
        .script("faq", vec![ChatResponse::text("Weekdays 9 to 5.")]);
    let (pipeline, model, _) = scripted(model, orchestrated());

    let outcome = pipeline
        .start_turn(TurnRequest::new(asked).with_path("/faq"))
        .await
        .unwrap();
    assert_eq!(outcome.delegated_to.as_deref(), Some("faq"));

    assert_eq!(model.calls_for("faq")[0].last_message, asked);
    let transcript = pipeline.get_transcript(&outcome.session_id).await.unwrap();
    assert_eq!(transcript.len(), 2);
    assert_eq!(transcript[0].text, asked);
    assert_eq!(transcript[1].text, "Weekdays 9 to 5.");
}

#[tokio::test]
async fn test_failed_delegate_falls_back_without_its_writes() {
    let model = ScriptedModel::default()
        .script(
            "orchestrator",
            vec![
                ChatResponse::tool_call("c1", "route_to_persona", json!({ "persona": "rewards" })),
                ChatResponse::text("Something went wrong over there."),
            ],
        )
        // saves a fact, then has nothing left to say
        .script("rewards", vec![save_call("name", json!("Sara"))]);
    let (pipeline, model, _) = scripted(model, orchestrated());

    let outcome = pipeline
        .start_turn(TurnRequest::new("I'm Sara, how many points do I have?").with_path("/rewards/balance"))
        .await
        .unwrap();
    match &outcome.fault {
        Some(RoutingFault::DelegateFailed { persona, reason }) => {
            assert_eq!(persona, "rewards");
            assert!(reason.contains("no scripted response left"));
        }
        other => panic!("expected a failed delegate, got {other:?}"),
    }
    assert_eq!(outcome.output, ROUTER_FALLBACK);
    assert_eq!(outcome.persona, "orchestrator");
    assert!(outcome.delegated_to.is_none());
    assert!(outcome.profile.get("user_name").is_none());

    // the orchestrator was told, and got one more chance to respond
    let routed = model.calls_for("orchestrator");
    assert_eq!(routed.len(), 2);
    assert!(routed[1].last_message.starts_with("Error:"));

    let transcript = pipeline.get_transcript(&outcome.session_id).await.unwrap();
    assert_eq!(transcript.len(), 2);
    assert_eq!(transcript[0].role, Role::User);
    assert_eq!(transcript[0].text, "I'm Sara, how many points do I have?");
    assert_eq!(transcript[1].text, ROUTER_FALLBACK);
    assert_eq!(transcript[1].persona.as_deref(), Some("orchestrator"));
}

#[tokio::test]
async fn test_explicit_persona_is_a_hint_when_orchestrated() {
    let model = ScriptedModel::default()
        .script(
            "orchestrator",
            vec![ChatResponse::tool_call("c1", "route_to_persona", json!({ "persona": "rewards" }))],
        )
        .script("rewards", vec![ChatResponse::text("Redeem from the shop tab.")]);
    let (pipeline, model, _) = scripted(model, orchestrated());

    let outcome = pipeline
        .start_turn(TurnRequest::new("How do I redeem?").with_persona("rewards"))
        .await
        .unwrap();
    assert_eq!(outcome.persona, "rewards");
    assert_eq!(outcome.delegated_to.as_deref(), Some("rewards"));

    let routed = model.calls_for("orchestrator");
    assert_eq!(routed[0].hint.as_deref(), Some("rewards"));
    assert_eq!(routed[0].hint_source, Some(HintSource::Explicit));
    assert!(model.calls_for("rewards")[0].hint.is_none());
}

#[tokio::test]
async fn test_explicit_persona_is_direct_otherwise() {
    let model = ScriptedModel::default().script("rewards", vec![ChatResponse::text("Shop tab.")]);
    let (pipeline, model, _) = scripted(model, RuntimeConfig::default());

    let outcome = pipeline
        .start_turn(TurnRequest::new("How do I redeem?").with_persona("rewards"))
        .await
        .unwrap();
    assert_eq!(outcome.persona, "rewards");
    assert!(model.calls_for("orchestrator").is_empty());
    assert!(model.calls_for("rewards")[0].hint.is_none());
}

// ─── Profile ────────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_list_facts_across_turns_are_unioned() {
    let model = ScriptedModel::default().script(
        "faq",
        vec![
            save_call("interest", json!("reading")),
            ChatResponse::text("Reading is great."),
            save_call("interests", json!("chess, reading")),
            ChatResponse::text("Chess too!"),
        ],
    );
    let (pipeline, model, _) = scripted(model, RuntimeConfig::default());

    let first = pipeline
        .start_turn(TurnRequest::new("I like reading").with_path("/faq"))
        .await
        .unwrap();
    pipeline
        .start_turn(TurnRequest::new("I also like chess and reading").with_session(&first.session_id))
        .await
        .unwrap();

    let profile = pipeline.get_profile(&first.session_id).await.unwrap();
    assert_eq!(profile.get("user_interests"), Some(&json!(["reading", "chess"])));

    // the second turn saw the first turn's fact in its instructions
    let calls = model.calls_for("faq");
    assert!(calls[2].instructions.contains("reading"));
}

#[tokio::test]
async fn test_failing_capability_leaves_no_write() {
    let model = ScriptedModel::default().script(
        "rewards",
        vec![
            ChatResponse::tool_call("t1", "flaky_lookup", json!({})),
            ChatResponse::text("I can't reach the points service right now."),
        ],
    );
    let (pipeline, model, _) = scripted(model, RuntimeConfig::default());

    let outcome = pipeline
        .start_turn(TurnRequest::new("What's my tier?").with_path("/rewards/tier"))
        .await
        .unwrap();
    assert!(!outcome.output.is_empty());
    assert!(outcome.profile.get("user_level").is_none());

    let calls = model.calls_for("rewards");
    assert!(calls[1].last_message.contains("points service unavailable"));
}

#[tokio::test]
async fn test_caller_profile_visible_to_turn() {
    let model = ScriptedModel::default().script("faq", vec![ChatResponse::text("Hi Reza.")]);
    let (pipeline, model, _) = scripted(model, RuntimeConfig::default());

    let profile = BTreeMap::from([
        ("full_name".to_string(), json!("Reza")),
        ("age".to_string(), json!("۲۵")),
    ]);
    let outcome = pipeline
        .start_turn(TurnRequest::new("hello").with_profile(profile))
        .await
        .unwrap();
    assert_eq!(outcome.profile.get("user_name"), Some(&json!("Reza")));
    assert_eq!(outcome.profile.get("user_age"), Some(&json!(25)));
    assert!(model.calls_for("faq")[0].instructions.contains("Reza"));
}

#[tokio::test]
async fn test_expired_fields_excluded_from_profile() {
    let (pipeline, _, store) = scripted(ScriptedModel::default(), RuntimeConfig::default());
    let now = Utc::now();

    let mut session = Session::new("s-expiry", "faq", now);
    session.profile.insert_raw(
        "user_name",
        ProfileEntry {
            value: json!("Sara"),
            expires_at: None,
            owner: None,
            updated_at: now,
        },
    );
    session.profile.insert_raw(
        "user_location",
        ProfileEntry {
            value: json!("Tabriz"),
            expires_at: Some(now - chrono::Duration::minutes(1)),
            owner: Some("faq".into()),
            updated_at: now - chrono::Duration::hours(5),
        },
    );
    store.save(&session).await.unwrap();

    let profile = pipeline.get_profile("s-expiry").await.unwrap();
    assert_eq!(profile.get("user_name"), Some(&json!("Sara")));
    assert!(profile.get("user_location").is_none());
}

// ─── Sessions ───────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_stale_persist_is_a_conflict() {
    let store = MemoryStore::new();
    let model = Arc::new(MeddlingModel {
        store: store.clone(),
        session_id: "s-race".into(),
    });
    let pipeline = pipeline_with(model, store.clone(), RuntimeConfig::default());

    let err = pipeline
        .start_turn(TurnRequest::new("hello").with_session("s-race"))
        .await
        .unwrap_err();
    assert!(matches!(err, TurnError::Store(StoreError::Conflict { .. })));
    assert!(err.is_retryable());
    assert!(pipeline.get_transcript("s-race").await.unwrap().is_empty());
}

#[tokio::test]
async fn test_timeout_persists_nothing() {
    let store = MemoryStore::new();
    let config = RuntimeConfig {
        turn_timeout_secs: 1,
        ..Default::default()
    };
    let pipeline = pipeline_with(Arc::new(SlowModel), store.clone(), config);

    let err = pipeline
        .start_turn(TurnRequest::new("hello").with_session("s-slow"))
        .await
        .unwrap_err();
    assert!(matches!(err, TurnError::Timeout(_)));
    assert_eq!(err.user_message(), chorus_core::error::GENERIC_APOLOGY);
    assert!(matches!(
        pipeline.get_transcript("s-slow").await,
        Err(StoreError::NotFound(_))
    ));
    assert!(store.is_empty().await);
}

#[tokio::test]
async fn test_slow_save_outlives_turn_budget() {
    let store = MemoryStore::new();
    let slow = SlowSaveStore {
        inner: store.clone(),
        delay: Duration::from_millis(1500),
    };
    let model = Arc::new(ScriptedModel::default().script("faq", vec![ChatResponse::text("Hello!")]));
    let config = RuntimeConfig {
        turn_timeout_secs: 1,
        ..Default::default()
    };
    let pipeline = pipeline_with(model, slow, config);

    let outcome = pipeline
        .start_turn(TurnRequest::new("hi").with_session("s-slow-save"))
        .await
        .unwrap();
    assert_eq!(outcome.output, "Hello!");

    let stored = store.load("s-slow-save").await.unwrap().unwrap();
    assert_eq!(stored.version, 1);
    assert_eq!(stored.transcript.len(), 2);
}

#[tokio::test]
async fn test_idle_session_survives_failed_turn() {
    let (pipeline, _, store) = scripted(ScriptedModel::default(), RuntimeConfig::default());
    let now = Utc::now();

    let mut idle = Session::new("s-idle", "rewards", now - chrono::Duration::hours(5));
    idle.updated_at = now - chrono::Duration::hours(5);
    idle.transcript.push(TranscriptTurn::user("old question"));
    idle.transcript.push(TranscriptTurn::assistant("rewards", "old answer"));
    store.save(&idle).await.unwrap();

    let err = pipeline
        .start_turn(TurnRequest::new("hello again").with_session("s-idle"))
        .await
        .unwrap_err();
    assert!(matches!(err, TurnError::Model(_)));

    let kept = store.load("s-idle").await.unwrap().unwrap();
    assert_eq!(kept.version, 1);
    assert_eq!(kept.transcript.len(), 2);
}

#[tokio::test]
async fn test_idle_session_restarts_in_place() {
    let model = ScriptedModel::default().script("faq", vec![ChatResponse::text("Welcome back.")]);
    let (pipeline, _, store) = scripted(model, RuntimeConfig::default());
    let now = Utc::now();

    let mut idle = Session::new("s-idle", "rewards", now - chrono::Duration::hours(5));
    idle.updated_at = now - chrono::Duration::hours(5);
    idle.transcript.push(TranscriptTurn::user("old question"));
    idle.transcript.push(TranscriptTurn::assistant("rewards", "old answer"));
    store.save(&idle).await.unwrap();

    let outcome = pipeline
        .start_turn(TurnRequest::new("hello again").with_session("s-idle"))
        .await
        .unwrap();
    assert_eq!(outcome.persona, "faq");

    let fresh = store.load("s-idle").await.unwrap().unwrap();
    assert_eq!(fresh.version, 2);
    assert_eq!(fresh.transcript.len(), 2);
    assert_eq!(fresh.transcript[0].text, "hello again");
}

#[tokio::test]
async fn test_model_failure_is_turn_fatal() {
    let (pipeline, _, store) = scripted(ScriptedModel::default(), RuntimeConfig::default());
    let err = pipeline
        .start_turn(TurnRequest::new("hello").with_session("s-fail"))
        .await
        .unwrap_err();
    assert!(matches!(err, TurnError::Model(_)));
    assert!(!err.user_message().contains("scripted"));
    assert!(store.is_empty().await);
}

#[tokio::test]
async fn test_rejects_bad_input() {
    let (pipeline, _, _) = scripted(ScriptedModel::default(), RuntimeConfig::default());
    assert!(matches!(
        pipeline.start_turn(TurnRequest::new("   ")).await,
        Err(TurnError::EmptyMessage)
    ));
    assert!(matches!(
        pipeline
            .start_turn(TurnRequest::new("hi").with_session("../../etc"))
            .await,
        Err(TurnError::Store(StoreError::InvalidSessionId(_)))
    ));
}

#[tokio::test]
async fn test_expire_session() {
    let model = ScriptedModel::default().script("faq", vec![ChatResponse::text("Hello!")]);
    let (pipeline, _, _) = scripted(model, RuntimeConfig::default());

    let outcome = pipeline.start_turn(TurnRequest::new("hi")).await.unwrap();
    assert!(pipeline.expire_session(&outcome.session_id).await.unwrap());
    assert!(!pipeline.expire_session(&outcome.session_id).await.unwrap());
    assert!(matches!(
        pipeline.get_profile(&outcome.session_id).await,
        Err(StoreError::NotFound(_))
    ));
}

// ─── Suggestions ────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_suggestions_bounded_then_free_mode() {
    let model = ScriptedModel::default().script(
        "guide",
        vec![
            ChatResponse::text("Welcome aboard."),
            ChatResponse::text("Sure.\n\nNext actions:\n1) Something"),
        ],
    );
    let config = RuntimeConfig {
        suggestions: SuggestionLifecycle {
            max_clicks: 3,
            free_mode_after_turns: 1,
            transition_message: Some("You can now ask me anything.".into()),
        },
        ..Default::default()
    };
    let (pipeline, _, _) = scripted(model, config);

    let first = pipeline
        .start_turn(TurnRequest::new("start").with_path("/guide"))
        .await
        .unwrap();
    assert_eq!(
        first.output,
        "Welcome aboard.\n\nNext actions:\n1) Ask about points\n2) Browse rewards"
    );

    let second = pipeline
        .start_turn(TurnRequest::new("ok").with_session(&first.session_id))
        .await
        .unwrap();
    assert_eq!(second.output, "Sure.\n\nYou can now ask me anything.");

    let transcript = pipeline.get_transcript(&first.session_id).await.unwrap();
    assert_eq!(transcript[3].text, second.output);
}

// ─── Summaries ──────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_long_session_replays_summary_instead_of_old_turns() {
    let model = ScriptedModel::default()
        .script(
            "faq",
            (1..=5)
                .map(|i| ChatResponse::text(format!("answer {i}")))
                .collect(),
        )
        .script(
            SUMMARIZER_KEY,
            vec![
                ChatResponse::text("The user asked two questions about opening hours."),
                ChatResponse::text("The user asked three questions about opening hours."),
            ],
        );
    let config = RuntimeConfig {
        summary: SummaryConfig {
            threshold: 4,
            keep_recent: 1,
            ..Default::default()
        },
        ..Default::default()
    };
    let (pipeline, model, store) = scripted(model, config);

    let first = pipeline
        .start_turn(TurnRequest::new("question 1").with_path("/faq"))
        .await
        .unwrap();
    let id = first.session_id;
    for i in 2..=3 {
        pipeline
            .start_turn(TurnRequest::new(format!("question {i}")).with_session(&id))
            .await
            .unwrap();
    }
    assert!(model.calls_for(SUMMARIZER_KEY).is_empty());

    // six stored turns: the first two exchanges are folded away
    pipeline
        .start_turn(TurnRequest::new("question 4").with_session(&id))
        .await
        .unwrap();
    let fourth = &model.calls_for("faq")[3];
    assert_eq!(fourth.message_count, 3);
    assert!(fourth.instructions.contains("<<<conversation-summary>>>"));
    assert!(fourth.instructions.contains("two questions about opening hours"));

    let summarized = store.load(&id).await.unwrap().unwrap();
    assert_eq!(summarized.meta.summarized_turns, 4);
    assert_eq!(summarized.transcript.len(), 8);

    // the next turn only sends the exchange that just left the window
    pipeline
        .start_turn(TurnRequest::new("question 5").with_session(&id))
        .await
        .unwrap();
    let prompts = model.calls_for(SUMMARIZER_KEY);
    assert_eq!(prompts.len(), 2);
    assert!(prompts[0].last_message.contains("User: question 1"));
    assert!(prompts[1].last_message.contains("Summary so far:\nThe user asked two questions"));
    assert!(prompts[1].last_message.contains("User: question 3\nAssistant: answer 3"));
    assert!(!prompts[1].last_message.contains("question 2"));

    let session = store.load(&id).await.unwrap().unwrap();
    assert_eq!(
        session.meta.conversation_summary.as_deref(),
        Some("The user asked three questions about opening hours.")
    );
    assert_eq!(session.meta.summarized_turns, 6);
    assert!(!first.output.is_empty());
}

#[tokio::test]
async fn test_summarizer_failure_keeps_full_history() {
    let model = ScriptedModel::default().script("faq", vec![ChatResponse::text("Sure.")]);
    let config = RuntimeConfig {
        summary: SummaryConfig {
            threshold: 2,
            ..Default::default()
        },
        ..Default::default()
    };
    let (pipeline, model, store) = scripted(model, config);

    let mut session = Session::new("s-long", "faq", Utc::now());
    for i in 0..3 {
        session.transcript.push(TranscriptTurn::user(format!("q{i}")));
        session.transcript.push(TranscriptTurn::assistant("faq", format!("a{i}")));
    }
    store.save(&session).await.unwrap();

    pipeline
        .start_turn(TurnRequest::new("q3").with_session("s-long"))
        .await
        .unwrap();
    assert_eq!(model.calls_for(SUMMARIZER_KEY).len(), 1);
    let call = &model.calls_for("faq")[0];
    assert_eq!(call.message_count, 7);
    assert!(!call.instructions.contains("<<<conversation-summary>>>"));

    let stored = store.load("s-long").await.unwrap().unwrap();
    assert!(stored.meta.conversation_summary.is_none());
    assert_eq!(stored.meta.summarized_turns, 0);
}

// ─── Opening sessions ───────────────────────────────────────────────────────

#[tokio::test]
async fn test_open_session_seeds_profile() {
    let (pipeline, _, _) = scripted(ScriptedModel::default(), RuntimeConfig::default());
    let pipeline = pipeline
        .with_decoder(Arc::new(StaticDecoder))
        .with_profile_source(Arc::new(StaticProfiles));

    let opening = pipeline
        .open_session(SessionEntry {
            encoded: Some("token-42".into()),
            ..Default::default()
        })
        .await
        .unwrap();
    assert_eq!(opening.persona, "rewards");
    assert!(opening.welcome.is_none());

    let profile = pipeline.get_profile(&opening.session_id).await.unwrap();
    assert_eq!(profile.get("user_id"), Some(&json!("42")));
    assert_eq!(profile.get("entry_path"), Some(&json!("/rewards/history")));
    assert_eq!(profile.get("user_name"), Some(&json!("Sara")));
    assert_eq!(profile.get("user_location"), Some(&json!("Tabriz")));
}

#[tokio::test]
async fn test_open_session_falls_back_on_collaborator_failure() {
    let (pipeline, _, _) = scripted(ScriptedModel::default(), RuntimeConfig::default());
    let pipeline = pipeline
        .with_decoder(Arc::new(StaticDecoder))
        .with_profile_source(Arc::new(StaticProfiles));

    let opening = pipeline
        .open_session(SessionEntry {
            encoded: Some("garbage".into()),
            user_id: Some("7".into()),
            path: None,
        })
        .await
        .unwrap();
    assert_eq!(opening.persona, "faq");
    assert_eq!(opening.welcome.as_deref(), Some("Hi! Ask me anything."));

    let profile = pipeline.get_profile(&opening.session_id).await.unwrap();
    assert_eq!(profile.len(), 1);
    assert_eq!(profile.get("user_id"), Some(&json!("7")));

    let transcript = pipeline.get_transcript(&opening.session_id).await.unwrap();
    assert_eq!(transcript.len(), 1);
    assert_eq!(transcript[0].role, Role::Assistant);
}

#[tokio::test]
async fn test_reload_routes_applies_to_next_turn() {
    let model = ScriptedModel::default().script("guide", vec![ChatResponse::text("Let's go.")]);
    let (pipeline, _, _) = scripted(model, RuntimeConfig::default());
    assert_eq!(pipeline.route("/rewards/history").persona, "rewards");

    pipeline.reload_routes(&RouteTableConfig {
        default: "faq".into(),
        paths: vec![PathMapping::new("/rewards/*", "guide")],
    });
    let outcome = pipeline
        .start_turn(TurnRequest::new("hi").with_path("/rewards/history"))
        .await
        .unwrap();
    assert_eq!(outcome.persona, "guide");
}
