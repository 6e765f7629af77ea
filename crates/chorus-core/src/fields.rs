//! Catalog of known profile fields and name normalization

use anyhow::{Result, anyhow, bail};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::time::Duration;
use tracing::debug;

use crate::store::{Expiry, ProfileWrite};

/// Value shape of a profile field
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FieldType {
    #[default]
    Text,
    Integer,
    List,
}

/// A known profile field
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FieldSpec {
    pub name: String,
    /// Profile key; defaults to `name`
    #[serde(default)]
    pub normalized: Option<String>,
    #[serde(default)]
    pub description: String,
    #[serde(default, rename = "type")]
    pub data_type: FieldType,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub aliases: Vec<String>,
    #[serde(default)]
    pub min: Option<i64>,
    #[serde(default)]
    pub max: Option<i64>,
    /// 0 keeps the value forever
    #[serde(default)]
    pub ttl_secs: Option<u64>,
}

fn default_true() -> bool {
    true
}

impl FieldSpec {
    pub fn new(name: impl Into<String>, data_type: FieldType) -> Self {
        Self {
            name: name.into(),
            normalized: None,
            description: String::new(),
            data_type,
            enabled: true,
            aliases: Vec::new(),
            min: None,
            max: None,
            ttl_secs: None,
        }
    }

    pub fn with_aliases(mut self, aliases: &[&str]) -> Self {
        self.aliases = aliases.iter().map(|a| a.to_string()).collect();
        self
    }

    pub fn with_range(mut self, min: i64, max: i64) -> Self {
        self.min = Some(min);
        self.max = Some(max);
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn key(&self) -> &str {
        self.normalized.as_deref().unwrap_or(&self.name)
    }

    pub fn expiry(&self) -> Expiry {
        match self.ttl_secs {
            None => Expiry::Default,
            Some(0) => Expiry::Never,
            Some(secs) => Expiry::After(Duration::from_secs(secs)),
        }
    }

    /// Coerce a raw value into this field's shape
    pub fn coerce(&self, value: &Value) -> Result<Value> {
        match self.data_type {
            FieldType::Text => match value {
                Value::String(s) if s.trim().is_empty() => bail!("'{}' cannot be empty", self.name),
                Value::String(s) => Ok(Value::String(s.trim().to_string())),
                Value::Null => bail!("'{}' cannot be empty", self.name),
                other => Ok(Value::String(other.to_string())),
            },
            FieldType::Integer => {
                let number = match value {
                    Value::Number(n) => n.as_i64(),
                    Value::String(s) => parse_integer(s),
                    _ => None,
                }
                .ok_or_else(|| anyhow!("'{}' must be a whole number", self.name))?;
                if self.min.is_some_and(|min| number < min) || self.max.is_some_and(|max| number > max) {
                    bail!(
                        "'{}' must be between {} and {}",
                        self.name,
                        self.min.map_or("-".to_string(), |v| v.to_string()),
                        self.max.map_or("-".to_string(), |v| v.to_string())
                    );
                }
                Ok(Value::from(number))
            }
            FieldType::List => {
                let items: Vec<Value> = match value {
                    Value::Array(items) => items.clone(),
                    Value::String(s) => s
                        .split([',', '،'])
                        .map(str::trim)
                        .filter(|s| !s.is_empty())
                        .map(|s| Value::String(s.to_string()))
                        .collect(),
                    Value::Null => Vec::new(),
                    other => vec![other.clone()],
                };
                if items.is_empty() {
                    bail!("'{}' needs at least one item", self.name);
                }
                Ok(Value::Array(items))
            }
        }
    }
}

/// Lookup table from any field name or alias to its spec
#[derive(Debug, Clone, Default)]
pub struct FieldCatalog {
    fields: Vec<FieldSpec>,
    index: HashMap<String, usize>,
}

impl FieldCatalog {
    pub fn new(fields: Vec<FieldSpec>) -> Self {
        let mut index = HashMap::new();
        for (i, field) in fields.iter().enumerate() {
            let names = std::iter::once(field.name.as_str())
                .chain(std::iter::once(field.key()))
                .chain(field.aliases.iter().map(String::as_str));
            for name in names {
                index.entry(fold(name)).or_insert(i);
            }
        }
        Self { fields, index }
    }

    /// The fields every deployment starts with
    pub fn standard() -> Self {
        Self::new(vec![
            FieldSpec::new("user_name", FieldType::Text)
                .with_aliases(&["name", "full_name"])
                .with_description("What the user wants to be called"),
            FieldSpec::new("user_age", FieldType::Integer)
                .with_aliases(&["age"])
                .with_range(1, 120)
                .with_description("Age in years"),
            FieldSpec::new("user_location", FieldType::Text)
                .with_aliases(&["location", "city", "province"])
                .with_description("City or region"),
            FieldSpec::new("user_occupation", FieldType::Text)
                .with_aliases(&["occupation", "job"])
                .with_description("Job or field of study"),
            FieldSpec::new("user_interests", FieldType::List)
                .with_aliases(&["interest", "interests", "hobby", "hobbies"])
                .with_description("Topics the user cares about"),
            FieldSpec::new("preferred_language", FieldType::Text)
                .with_aliases(&["language", "language_preference"])
                .with_description("Language code for replies"),
            FieldSpec::new("user_phone", FieldType::Text).with_aliases(&["phone", "phone_number"]),
            FieldSpec::new("user_gender", FieldType::Text).with_aliases(&["gender"]),
            FieldSpec::new("user_score", FieldType::Integer).with_aliases(&["score"]),
            FieldSpec::new("user_level", FieldType::Text).with_aliases(&["level"]),
            FieldSpec::new("user_achievements", FieldType::List).with_aliases(&["achievements"]),
        ])
    }

    pub fn resolve(&self, name: &str) -> Option<&FieldSpec> {
        self.index.get(&fold(name)).map(|&i| &self.fields[i])
    }

    /// Profile key for any incoming field name. Unknown names become `user_<name>`.
    pub fn normalize(&self, name: &str) -> String {
        if let Some(spec) = self.resolve(name) {
            return spec.key().to_string();
        }
        let folded = fold(name);
        if folded.starts_with("user_") {
            folded
        } else {
            format!("user_{folded}")
        }
    }

    /// Whether a profile key may be shown and written
    pub fn is_enabled(&self, key: &str) -> bool {
        self.resolve(key).is_none_or(|spec| spec.enabled)
    }

    pub fn enabled_fields(&self) -> impl Iterator<Item = &FieldSpec> {
        self.fields.iter().filter(|f| f.enabled)
    }

    pub fn fields(&self) -> &[FieldSpec] {
        &self.fields
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// Turn an externally supplied flat map into profile writes. Empty values,
    /// disabled fields and values that fail coercion are skipped.
    pub fn writes_from_map(&self, raw: &BTreeMap<String, Value>) -> Vec<ProfileWrite> {
        let mut writes = Vec::new();
        for (name, value) in raw {
            if value.is_null() || value.as_str().is_some_and(|s| s.trim().is_empty()) {
                continue;
            }
            let write = match self.resolve(name) {
                Some(spec) if !spec.enabled => {
                    debug!("Skipping disabled profile field '{}'", name);
                    continue;
                }
                Some(spec) => match spec.coerce(value) {
                    Ok(coerced) => ProfileWrite::new(spec.key(), coerced).with_expiry(spec.expiry()),
                    Err(e) => {
                        debug!("Skipping profile field '{}': {}", name, e);
                        continue;
                    }
                },
                None => ProfileWrite::new(self.normalize(name), value.clone()),
            };
            writes.push(write);
        }
        writes
    }
}

fn fold(name: &str) -> String {
    name.trim().to_lowercase().replace([' ', '-'], "_")
}

/// Parse an integer written with ASCII, Persian or Arabic-Indic digits
pub fn parse_integer(text: &str) -> Option<i64> {
    let ascii: String = text
        .trim()
        .chars()
        .map(|c| match c {
            '\u{06F0}'..='\u{06F9}' => char::from(b'0' + (c as u32 - 0x06F0) as u8),
            '\u{0660}'..='\u{0669}' => char::from(b'0' + (c as u32 - 0x0660) as u8),
            other => other,
        })
        .collect();
    ascii.parse().ok()
}
