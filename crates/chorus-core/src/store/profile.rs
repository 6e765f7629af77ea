//! Mergeable user profile with per-entry expiry

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::time::Duration;

/// Read-only view of the non-expired profile values
pub type ProfileSnapshot = BTreeMap<String, Value>;

/// A stored profile value
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProfileEntry {
    pub value: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,
    /// Persona that last wrote the entry
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub owner: Option<String>,
    pub updated_at: DateTime<Utc>,
}

impl ProfileEntry {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }
}

/// Lifetime requested for a write
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Expiry {
    /// Use the runtime's default profile TTL
    #[default]
    Default,
    Never,
    After(Duration),
}

/// A pending profile mutation, staged by a capability or caller
#[derive(Debug, Clone, PartialEq)]
pub struct ProfileWrite {
    pub key: String,
    pub value: Value,
    pub expiry: Expiry,
    pub owner: Option<String>,
}

impl ProfileWrite {
    pub fn new(key: impl Into<String>, value: Value) -> Self {
        Self {
            key: key.into(),
            value,
            expiry: Expiry::Default,
            owner: None,
        }
    }

    pub fn with_expiry(mut self, expiry: Expiry) -> Self {
        self.expiry = expiry;
        self
    }

    pub fn with_owner(mut self, owner: impl Into<String>) -> Self {
        self.owner = Some(owner.into());
        self
    }
}

/// Profile map keyed by normalized field name
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ProfileMap {
    entries: BTreeMap<String, ProfileEntry>,
}

impl ProfileMap {
    /// Non-expired entry for `key`
    pub fn get(&self, key: &str, now: DateTime<Utc>) -> Option<&ProfileEntry> {
        self.entries.get(key).filter(|e| !e.is_expired(now))
    }

    pub fn value(&self, key: &str, now: DateTime<Utc>) -> Option<&Value> {
        self.get(key, now).map(|e| &e.value)
    }

    /// Merge one write: lists are unioned in order without duplicates, scalars
    /// overwrite. An expired entry counts as absent.
    pub fn apply(&mut self, write: ProfileWrite, default_ttl: Option<Duration>, now: DateTime<Utc>) {
        let expires_at = match write.expiry {
            Expiry::Default => default_ttl.and_then(|ttl| expiry_after(now, ttl)),
            Expiry::Never => None,
            Expiry::After(ttl) => expiry_after(now, ttl),
        };

        let value = match self.get(&write.key, now) {
            Some(existing) if existing.value.is_array() => union(&existing.value, write.value),
            _ => match write.value {
                Value::Array(items) => Value::Array(dedup(items)),
                other => other,
            },
        };

        self.entries.insert(
            write.key,
            ProfileEntry {
                value,
                expires_at,
                owner: write.owner,
                updated_at: now,
            },
        );
    }

    pub fn apply_all(
        &mut self,
        writes: impl IntoIterator<Item = ProfileWrite>,
        default_ttl: Option<Duration>,
        now: DateTime<Utc>,
    ) {
        for write in writes {
            self.apply(write, default_ttl, now);
        }
    }

    /// Flat map of every visible value
    pub fn snapshot(&self, now: DateTime<Utc>) -> ProfileSnapshot {
        self.entries
            .iter()
            .filter(|(_, e)| !e.is_expired(now))
            .map(|(k, e)| (k.clone(), e.value.clone()))
            .collect()
    }

    /// Physically drop expired entries, returning how many were removed
    pub fn prune(&mut self, now: DateTime<Utc>) -> usize {
        let before = self.entries.len();
        self.entries.retain(|_, e| !e.is_expired(now));
        before - self.entries.len()
    }

    pub fn remove(&mut self, key: &str) -> Option<ProfileEntry> {
        self.entries.remove(key)
    }

    /// Insert a stored entry as-is, bypassing merge rules
    pub fn insert_raw(&mut self, key: impl Into<String>, entry: ProfileEntry) {
        self.entries.insert(key.into(), entry);
    }

    /// Every stored entry, expired ones included
    pub fn entries(&self) -> impl Iterator<Item = (&String, &ProfileEntry)> {
        self.entries.iter()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

fn expiry_after(now: DateTime<Utc>, ttl: Duration) -> Option<DateTime<Utc>> {
    chrono::Duration::from_std(ttl)
        .ok()
        .and_then(|ttl| now.checked_add_signed(ttl))
}

fn union(existing: &Value, incoming: Value) -> Value {
    let mut items = match existing {
        Value::Array(items) => items.clone(),
        other => vec![other.clone()],
    };
    let incoming = match incoming {
        Value::Array(items) => items,
        other => vec![other],
    };
    for item in incoming {
        if !items.contains(&item) {
            items.push(item);
        }
    }
    Value::Array(items)
}

fn dedup(items: Vec<Value>) -> Vec<Value> {
    let mut out: Vec<Value> = Vec::with_capacity(items.len());
    for item in items {
        if !out.contains(&item) {
            out.push(item);
        }
    }
    out
}
