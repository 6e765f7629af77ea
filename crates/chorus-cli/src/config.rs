use anyhow::{Context, Result};
use chorus_core::{
    ConfigSource, FieldCatalog, FieldSpec, PersonaRecord, RouteTableConfig, RuntimeConfig,
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChorusConfig {
    /// Directory of persona files (`*.yaml`, `*.yml`, `*.toml`), one persona each
    #[serde(default)]
    pub persona_dir: Option<String>,
    #[serde(default)]
    pub runtime: RuntimeConfig,
    pub provider: ProviderConfig,
    #[serde(default)]
    pub routing: RouteTableConfig,
    #[serde(default)]
    pub store: StoreConfig,
    /// Profile field catalog; empty uses the built-in catalog
    #[serde(default)]
    pub fields: Vec<FieldSpec>,
    #[serde(default)]
    pub personas: Vec<PersonaRecord>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderConfig {
    pub anthropic: AnthropicConfig,
}

#[derive(Clone, Serialize, Deserialize)]
pub struct AnthropicConfig {
    pub api_key: String,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default = "default_base_url")]
    pub base_url: String,
}

impl std::fmt::Debug for AnthropicConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AnthropicConfig")
            .field("api_key", &mask_secret(&self.api_key))
            .field("model", &self.model)
            .field("base_url", &self.base_url)
            .finish()
    }
}

fn default_base_url() -> String {
    chorus_core::provider::anthropic::DEFAULT_BASE_URL.to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    #[serde(default = "default_db_path")]
    pub db_path: String,
}

fn default_db_path() -> String {
    "~/.chorus/sessions.db".to_string()
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            db_path: default_db_path(),
        }
    }
}

/// Mask a secret for Debug output and `chorus config`.
/// First 3 and last 4 chars for keys longer than 7 chars, otherwise "***".
pub fn mask_secret(s: &str) -> String {
    if s.is_empty() {
        return "(empty)".to_string();
    }
    let chars: Vec<char> = s.chars().collect();
    if chars.len() > 7 {
        let prefix: String = chars[..3].iter().collect();
        let suffix: String = chars[chars.len() - 4..].iter().collect();
        format!("{}...{}", prefix, suffix)
    } else {
        "***".to_string()
    }
}

pub fn config_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".chorus")
}

impl ChorusConfig {
    pub fn load(custom_path: &Option<PathBuf>) -> Result<Self> {
        let path = custom_path
            .clone()
            .unwrap_or_else(|| config_dir().join("config.toml"));

        // Refuse group/other-readable config files; they may hold keys
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            if let Ok(metadata) = std::fs::metadata(&path) {
                let mode = metadata.permissions().mode();
                if mode & 0o077 != 0 {
                    return Err(anyhow::anyhow!(
                        "Config file {:?} has overly permissive permissions ({:o}). \
                         It may contain secrets. Fix with: chmod 600 {:?}",
                        path,
                        mode & 0o777,
                        path
                    ));
                }
            }
        }

        let content = std::fs::read_to_string(&path).with_context(|| {
            format!(
                "Failed to read config at {}. Run `chorus init` first.",
                path.display()
            )
        })?;

        let mut config = Self::parse(&content)
            .with_context(|| format!("Failed to parse config at {}", path.display()))?;

        // Relative persona directories are resolved next to the config file
        if let Some(dir) = &config.persona_dir {
            let dir = expand_home(dir);
            if dir.is_relative() {
                if let Some(parent) = path.parent() {
                    config.persona_dir = Some(parent.join(dir).display().to_string());
                }
            }
        }

        Ok(config)
    }

    /// Parse config text after `${VAR}` expansion
    pub fn parse(content: &str) -> Result<Self> {
        let expanded = expand_env_vars(content);
        let config: Self = toml::from_str(&expanded)?;

        if config.provider.anthropic.api_key.starts_with("sk-ant-") {
            warn!(
                "API key is hardcoded in config file. For security, use environment variables: api_key = \"${{ANTHROPIC_API_KEY}}\""
            );
        }

        Ok(config)
    }

    pub fn field_catalog(&self) -> FieldCatalog {
        if self.fields.is_empty() {
            FieldCatalog::standard()
        } else {
            FieldCatalog::new(self.fields.clone())
        }
    }

    pub fn db_path(&self) -> PathBuf {
        expand_home(&self.store.db_path)
    }

    /// Copy safe to print
    pub fn masked(&self) -> Self {
        let mut copy = self.clone();
        copy.provider.anthropic.api_key = mask_secret(&self.provider.anthropic.api_key);
        copy
    }
}

impl ConfigSource for ChorusConfig {
    fn persona_records(&self) -> Result<Vec<PersonaRecord>> {
        let mut records = self.personas.clone();
        if let Some(dir) = &self.persona_dir {
            records.extend(load_persona_dir(&expand_home(dir))?);
        }
        Ok(records)
    }

    fn route_table(&self) -> Result<RouteTableConfig> {
        Ok(self.routing.clone())
    }
}

/// Read every persona file in `dir`, sorted by file name.
/// Files that fail to parse are skipped with a warning.
fn load_persona_dir(dir: &Path) -> Result<Vec<PersonaRecord>> {
    if !dir.exists() {
        warn!("Persona directory {} does not exist", dir.display());
        return Ok(Vec::new());
    }

    let mut paths: Vec<PathBuf> = std::fs::read_dir(dir)
        .with_context(|| format!("Failed to read persona directory {}", dir.display()))?
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|p| p.is_file())
        .collect();
    paths.sort();

    let mut records = Vec::new();
    for path in paths {
        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or_default()
            .to_ascii_lowercase();
        let parsed = match ext.as_str() {
            "yaml" | "yml" => read_persona_file(&path, |s| Ok(serde_yml::from_str(s)?)),
            "toml" => read_persona_file(&path, |s| Ok(toml::from_str(s)?)),
            _ => continue,
        };
        match parsed {
            Ok(record) => {
                debug!("Loaded persona '{}' from {}", record.key, path.display());
                records.push(record);
            }
            Err(e) => warn!("Skipping persona file {}: {:#}", path.display(), e),
        }
    }
    Ok(records)
}

fn read_persona_file(
    path: &Path,
    parse: impl Fn(&str) -> Result<PersonaRecord>,
) -> Result<PersonaRecord> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read {}", path.display()))?;
    parse(&expand_env_vars(&content))
}

pub fn expand_home(s: &str) -> PathBuf {
    if let Some(rest) = s.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    PathBuf::from(s)
}

/// Environment variables that may be expanded in config files.
/// Anything else is left as written.
const ALLOWED_ENV_VARS: &[&str] = &[
    "ANTHROPIC_API_KEY",
    "CHORUS_MODEL",
    "CHORUS_PERSONA_DIR",
    "HOME",
    "USER",
];

fn expand_env_vars(s: &str) -> String {
    let mut result = s.to_string();
    let mut pos = 0;
    while pos < result.len() {
        let Some(start) = result[pos..].find("${") else {
            break;
        };
        let abs_start = pos + start;
        let Some(end) = result[abs_start..].find('}') else {
            break;
        };
        let var_name = result[abs_start + 2..abs_start + end].to_string();

        if !ALLOWED_ENV_VARS.contains(&var_name.as_str()) {
            warn!(
                "Skipping expansion of unrecognized env var '{}' in config (not in allowlist)",
                var_name
            );
            pos = abs_start + end + 1;
            continue;
        }

        let value = std::env::var(&var_name).unwrap_or_default();
        let value_len = value.len();
        result = format!(
            "{}{}{}",
            &result[..abs_start],
            value,
            &result[abs_start + end + 1..]
        );
        pos = abs_start + value_len;
    }
    result
}
