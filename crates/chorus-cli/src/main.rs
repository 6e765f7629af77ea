use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde_json::Value;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use chorus_core::{
    AnthropicClient, CapabilityRegistry, PathRouter, PersonaStore, SqliteStore, TurnOutcome,
    TurnPipeline, TurnRequest,
};

mod config;

use config::ChorusConfig;

#[derive(Parser)]
#[command(name = "chorus")]
#[command(version)]
#[command(about = "Chorus - a multi-persona conversational runtime")]
struct Cli {
    /// Path to config file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Enable debug logging
    #[arg(short, long, global = true)]
    debug: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize config directory and default config
    Init,

    /// Send one message and print the reply
    Ask {
        /// The message to send
        message: String,

        #[command(flatten)]
        target: TurnTarget,

        /// Caller-supplied profile field, e.g. `--field age=25` (repeatable)
        #[arg(long = "field", value_parser = parse_field)]
        fields: Vec<(String, String)>,

        /// Mark the message as a clicked suggestion
        #[arg(long)]
        suggestion: bool,
    },

    /// Interactive conversation on one session
    Chat {
        #[command(flatten)]
        target: TurnTarget,
    },

    /// Show which persona an entry path routes to
    Route {
        path: String,
    },

    /// List loaded personas
    Personas,

    /// Print a session's current profile
    Profile {
        session: String,
    },

    /// Print a session's transcript
    Transcript {
        session: String,
    },

    /// Delete a session
    Forget {
        session: String,
    },

    /// Drop expired profile fields and idle sessions
    Purge,

    /// Show current configuration (secrets masked)
    Config,
}

#[derive(clap::Args, Clone, Default)]
struct TurnTarget {
    /// Continue an existing session
    #[arg(short, long)]
    session: Option<String>,

    /// Talk to this persona directly
    #[arg(short, long)]
    persona: Option<String>,

    /// Entry path used for routing
    #[arg(long)]
    path: Option<String>,
}

fn parse_field(s: &str) -> Result<(String, String), String> {
    let (key, value) = s
        .split_once('=')
        .ok_or_else(|| format!("expected key=value, got '{s}'"))?;
    if key.trim().is_empty() {
        return Err(format!("empty field name in '{s}'"));
    }
    Ok((key.trim().to_string(), value.trim().to_string()))
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = if cli.debug { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(filter))
        .with_writer(std::io::stderr)
        .init();

    match cli.command {
        Commands::Init => cmd_init().await,
        Commands::Config => cmd_config(&cli.config),
        Commands::Ask {
            message,
            target,
            fields,
            suggestion,
        } => cmd_ask(&cli.config, message, target, fields, suggestion).await,
        Commands::Chat { target } => cmd_chat(&cli.config, target).await,
        Commands::Route { path } => cmd_route(&cli.config, &path),
        Commands::Personas => cmd_personas(&cli.config),
        Commands::Profile { session } => cmd_profile(&cli.config, &session).await,
        Commands::Transcript { session } => cmd_transcript(&cli.config, &session).await,
        Commands::Forget { session } => cmd_forget(&cli.config, &session).await,
        Commands::Purge => cmd_purge(&cli.config).await,
    }
}

/// Wire the runtime from configuration
fn build_pipeline(cfg: &ChorusConfig) -> Result<TurnPipeline> {
    let anthropic = &cfg.provider.anthropic;
    if anthropic.api_key.is_empty() || anthropic.api_key.contains("${") {
        warn!("Anthropic API key is not set; model calls will fail. Export ANTHROPIC_API_KEY.");
    }
    let model = AnthropicClient::new(anthropic.api_key.clone(), anthropic.model.clone())?
        .with_base_url(anthropic.base_url.clone());
    info!("Model client initialized (model: {})", chorus_core::ModelClient::model(&model));

    let personas = PersonaStore::from_source(cfg).context("Failed to load personas")?;
    if personas.is_empty() {
        warn!("No personas loaded; every turn will fail");
    }

    let catalog = Arc::new(cfg.field_catalog());
    let capabilities = CapabilityRegistry::with_builtins(Arc::clone(&catalog), None)?;
    let router = PathRouter::new(&cfg.routing);

    let db_path = cfg.db_path();
    if let Some(parent) = db_path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create {}", parent.display()))?;
    }
    let store = SqliteStore::open(&db_path)
        .with_context(|| format!("Failed to open session store at {}", db_path.display()))?;
    info!("Session store opened at {}", db_path.display());

    Ok(TurnPipeline::new(
        Arc::new(model),
        Arc::new(personas),
        Arc::new(capabilities),
        catalog,
        Arc::new(router),
        Arc::new(store),
    )
    .with_config(cfg.runtime.clone()))
}

async fn cmd_init() -> Result<()> {
    let config_dir = config::config_dir();
    tokio::fs::create_dir_all(&config_dir)
        .await
        .with_context(|| format!("Failed to create config dir: {}", config_dir.display()))?;

    let config_path = config_dir.join("config.toml");
    if config_path.exists() {
        warn!("Config already exists at {}", config_path.display());
    } else {
        let default_config = include_str!("../../../config/default.toml");
        tokio::fs::write(&config_path, default_config).await?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            tokio::fs::set_permissions(&config_path, std::fs::Permissions::from_mode(0o600))
                .await?;
        }
        info!("Created default config at {}", config_path.display());
    }

    let persona_dir = config_dir.join("personas");
    tokio::fs::create_dir_all(&persona_dir).await?;

    println!("Chorus initialized at {}", config_dir.display());
    println!(
        "Edit {} to configure personas and routes.",
        config_path.display()
    );
    Ok(())
}

fn cmd_config(config_path: &Option<PathBuf>) -> Result<()> {
    let cfg = ChorusConfig::load(config_path)?;
    println!("{}", toml::to_string_pretty(&cfg.masked())?);
    Ok(())
}

async fn cmd_ask(
    config_path: &Option<PathBuf>,
    message: String,
    target: TurnTarget,
    fields: Vec<(String, String)>,
    suggestion: bool,
) -> Result<()> {
    let cfg = ChorusConfig::load(config_path)?;
    let pipeline = build_pipeline(&cfg)?;

    let profile: BTreeMap<String, Value> = fields
        .into_iter()
        .map(|(k, v)| (k, Value::String(v)))
        .collect();
    let mut request = target.request(message).with_profile(profile);
    if suggestion {
        request = request.from_suggestion();
    }

    match pipeline.start_turn(request).await {
        Ok(outcome) => {
            print_outcome(&outcome);
            eprintln!("session: {}", outcome.session_id);
            Ok(())
        }
        Err(e) => {
            warn!("Turn failed: {:#}", e);
            println!("{}", e.user_message());
            Err(e.into())
        }
    }
}

async fn cmd_chat(config_path: &Option<PathBuf>, target: TurnTarget) -> Result<()> {
    let cfg = ChorusConfig::load(config_path)?;
    let pipeline = build_pipeline(&cfg)?;

    let mut session = target.session.clone();
    let mut stdin = BufReader::new(tokio::io::stdin()).lines();
    let mut stdout = tokio::io::stdout();

    println!("Type a message. Commands: /profile, /reload, /quit");
    loop {
        stdout.write_all(b"> ").await?;
        stdout.flush().await?;

        let Some(line) = stdin.next_line().await? else {
            break;
        };
        let line = line.trim();
        match line {
            "" => continue,
            "/quit" | "/exit" => break,
            "/profile" => {
                match &session {
                    Some(id) => print_json(&pipeline.get_profile(id).await?)?,
                    None => println!("(no session yet)"),
                }
                continue;
            }
            "/reload" => {
                match ChorusConfig::load(config_path)
                    .and_then(|fresh| pipeline.reload_routes_from(&fresh))
                {
                    Ok(()) => println!("Routes reloaded."),
                    Err(e) => println!("Reload failed: {:#}", e),
                }
                continue;
            }
            _ => {}
        }

        let mut request = TurnTarget {
            session: session.clone(),
            ..target.clone()
        }
        .request(line.to_string());
        // Routing inputs only apply to the first turn; later turns follow the session
        if session.is_some() {
            request.path = None;
        }

        match pipeline.start_turn(request).await {
            Ok(outcome) => {
                print_outcome(&outcome);
                session = Some(outcome.session_id);
            }
            Err(e) => {
                warn!("Turn failed: {:#}", e);
                println!("{}", e.user_message());
            }
        }
    }

    if let Some(id) = session {
        println!("session: {id}");
    }
    Ok(())
}

fn cmd_route(config_path: &Option<PathBuf>, path: &str) -> Result<()> {
    let cfg = ChorusConfig::load(config_path)?;
    let router = PathRouter::new(&cfg.routing);
    let decision = router.resolve(path);
    match decision.pattern {
        Some(pattern) => println!("{} -> {} (matched {})", decision.path, decision.persona, pattern),
        None => println!("{} -> {} (default)", decision.path, decision.persona),
    }
    Ok(())
}

fn cmd_personas(config_path: &Option<PathBuf>) -> Result<()> {
    let cfg = ChorusConfig::load(config_path)?;
    let personas = PersonaStore::from_source(&cfg)?;
    for persona in personas.iter() {
        let capabilities: Vec<&str> = persona.capabilities.iter().map(String::as_str).collect();
        println!(
            "{:<16} {:<12} {}",
            persona.key,
            format!("{:?}", persona.role).to_lowercase(),
            capabilities.join(", ")
        );
        if !persona.description.is_empty() {
            println!("{:<16} {}", "", persona.description);
        }
    }
    Ok(())
}

async fn cmd_profile(config_path: &Option<PathBuf>, session: &str) -> Result<()> {
    let cfg = ChorusConfig::load(config_path)?;
    let pipeline = build_pipeline(&cfg)?;
    print_json(&pipeline.get_profile(session).await?)
}

async fn cmd_transcript(config_path: &Option<PathBuf>, session: &str) -> Result<()> {
    let cfg = ChorusConfig::load(config_path)?;
    let pipeline = build_pipeline(&cfg)?;
    for turn in pipeline.get_transcript(session).await? {
        let who = match &turn.persona {
            Some(persona) => format!("{} ({})", turn.role, persona),
            None => turn.role.to_string(),
        };
        println!("[{}] {}: {}", turn.timestamp.format("%Y-%m-%d %H:%M:%S"), who, turn.text);
    }
    Ok(())
}

async fn cmd_forget(config_path: &Option<PathBuf>, session: &str) -> Result<()> {
    let cfg = ChorusConfig::load(config_path)?;
    let pipeline = build_pipeline(&cfg)?;
    if pipeline.expire_session(session).await? {
        println!("Session {session} deleted.");
    } else {
        println!("No session {session}.");
    }
    Ok(())
}

async fn cmd_purge(config_path: &Option<PathBuf>) -> Result<()> {
    let cfg = ChorusConfig::load(config_path)?;
    let pipeline = build_pipeline(&cfg)?;
    let removed = pipeline.purge_expired().await?;
    println!("Removed {removed} expired entries.");
    Ok(())
}

impl TurnTarget {
    fn request(self, message: String) -> TurnRequest {
        let mut request = TurnRequest::new(message);
        request.session_id = self.session;
        request.persona = self.persona;
        request.path = self.path;
        request
    }
}

fn print_outcome(outcome: &TurnOutcome) {
    println!("{}", outcome.output);
    match (&outcome.delegated_to, &outcome.fault) {
        (_, Some(fault)) => eprintln!("  [{}: routing fault: {}]", outcome.persona, fault),
        (Some(target), None) => eprintln!("  [delegated to {}]", target),
        (None, None) => eprintln!("  [{}]", outcome.persona),
    }
}

fn print_json(value: &impl serde::Serialize) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
