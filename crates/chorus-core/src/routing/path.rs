//! Deterministic entry-path routing

use glob::Pattern;
use serde::{Deserialize, Serialize};
use std::sync::{Arc, RwLock};
use tracing::{debug, info, warn};

/// One configured path -> persona mapping
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PathMapping {
    /// Exact path, `/foo/*`, `/foo*`, or any glob
    #[serde(alias = "path")]
    pub pattern: String,
    #[serde(alias = "agent")]
    pub persona: String,
    #[serde(default)]
    pub description: String,
}

impl PathMapping {
    pub fn new(pattern: impl Into<String>, persona: impl Into<String>) -> Self {
        Self {
            pattern: pattern.into(),
            persona: persona.into(),
            description: String::new(),
        }
    }
}

/// Routing table as supplied by configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RouteTableConfig {
    #[serde(default = "default_persona", alias = "default_agent")]
    pub default: String,
    #[serde(default, alias = "mappings")]
    pub paths: Vec<PathMapping>,
}

fn default_persona() -> String {
    "orchestrator".to_string()
}

impl Default for RouteTableConfig {
    fn default() -> Self {
        Self {
            default: default_persona(),
            paths: Vec::new(),
        }
    }
}

#[derive(Debug)]
enum Matcher {
    Exact(String),
    Glob(Pattern),
}

#[derive(Debug)]
struct CompiledRoute {
    mapping: PathMapping,
    matcher: Matcher,
    literal_len: usize,
}

impl CompiledRoute {
    fn is_exact(&self) -> bool {
        matches!(self.matcher, Matcher::Exact(_))
    }

    fn matches(&self, path: &str) -> bool {
        match &self.matcher {
            Matcher::Exact(exact) => exact == path,
            Matcher::Glob(pattern) => pattern.matches(path),
        }
    }
}

/// A routing decision
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouteMatch {
    pub persona: String,
    pub path: String,
    /// Pattern that matched; `None` means the default was used
    pub pattern: Option<String>,
}

/// Compiled, ordered routing table. Immutable once built.
#[derive(Debug)]
pub struct RoutingTable {
    routes: Vec<CompiledRoute>,
    default: String,
}

impl RoutingTable {
    /// Compile and order mappings: exact before wildcard, then longer literal
    /// prefix first, then declaration order. Invalid patterns are skipped.
    pub fn compile(config: &RouteTableConfig) -> Self {
        let mut routes: Vec<CompiledRoute> = config
            .paths
            .iter()
            .filter_map(|mapping| {
                let pattern = normalize_path(&mapping.pattern);
                let wildcard = pattern.find(['*', '?', '[']);
                let matcher = match wildcard {
                    None => Matcher::Exact(pattern.clone()),
                    Some(_) => match Pattern::new(&pattern) {
                        Ok(glob) => Matcher::Glob(glob),
                        Err(e) => {
                            warn!("Skipping path mapping '{}': {}", mapping.pattern, e);
                            return None;
                        }
                    },
                };
                Some(CompiledRoute {
                    literal_len: wildcard.unwrap_or(pattern.len()),
                    mapping: mapping.clone(),
                    matcher,
                })
            })
            .collect();

        // stable sort keeps declaration order on ties
        routes.sort_by(|a, b| {
            b.is_exact()
                .cmp(&a.is_exact())
                .then(b.literal_len.cmp(&a.literal_len))
        });

        Self {
            routes,
            default: config.default.clone(),
        }
    }

    pub fn resolve(&self, path: &str) -> RouteMatch {
        let path = normalize_path(path);
        match self.routes.iter().find(|r| r.matches(&path)) {
            Some(route) => {
                debug!(
                    "Path '{}' matched '{}' -> persona '{}'",
                    path, route.mapping.pattern, route.mapping.persona
                );
                RouteMatch {
                    persona: route.mapping.persona.clone(),
                    path,
                    pattern: Some(route.mapping.pattern.clone()),
                }
            }
            None => {
                debug!("Path '{}' has no mapping -> default '{}'", path, self.default);
                RouteMatch {
                    persona: self.default.clone(),
                    path,
                    pattern: None,
                }
            }
        }
    }

    pub fn route(&self, path: &str) -> String {
        self.resolve(path).persona
    }

    pub fn default_persona(&self) -> &str {
        &self.default
    }

    /// Mappings in match order
    pub fn mappings(&self) -> Vec<PathMapping> {
        self.routes.iter().map(|r| r.mapping.clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.routes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }
}

/// Shared router whose table can be swapped atomically while turns are in flight
#[derive(Debug)]
pub struct PathRouter {
    table: RwLock<Arc<RoutingTable>>,
}

impl PathRouter {
    pub fn new(config: &RouteTableConfig) -> Self {
        let table = RoutingTable::compile(config);
        info!(
            "PathRouter: {} mappings, default persona '{}'",
            table.len(),
            table.default
        );
        Self {
            table: RwLock::new(Arc::new(table)),
        }
    }

    /// Current table; callers keep a consistent view even if a reload happens
    pub fn snapshot(&self) -> Arc<RoutingTable> {
        let guard = self.table.read().unwrap_or_else(|poisoned| {
            warn!("Routing table lock was poisoned, recovering");
            poisoned.into_inner()
        });
        Arc::clone(&guard)
    }

    pub fn route(&self, path: &str) -> String {
        self.snapshot().route(path)
    }

    pub fn resolve(&self, path: &str) -> RouteMatch {
        self.snapshot().resolve(path)
    }

    pub fn default_persona(&self) -> String {
        self.snapshot().default_persona().to_string()
    }

    /// Replace the whole table in one step
    pub fn reload(&self, config: &RouteTableConfig) {
        let table = Arc::new(RoutingTable::compile(config));
        info!("PathRouter: reloaded {} mappings", table.len());
        let mut guard = self.table.write().unwrap_or_else(|poisoned| {
            warn!("Routing table lock was poisoned, recovering");
            poisoned.into_inner()
        });
        *guard = table;
    }
}

/// Trim, drop query string and fragment, and ensure a leading slash
pub fn normalize_path(path: &str) -> String {
    let path = path.trim();
    let path = path.split(['?', '#']).next().unwrap_or_default();
    if path.starts_with('/') {
        path.to_string()
    } else {
        format!("/{path}")
    }
}
