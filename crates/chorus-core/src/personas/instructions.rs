//! Per-turn instruction assembly

use serde_json::Value;
use std::collections::BTreeSet;
use tracing::debug;

use crate::fields::FieldCatalog;
use crate::store::ProfileSnapshot;

use super::definition::{PersonaDefinition, ProfileDisplay, RecentWindow};

pub const PROFILE_OPEN: &str = "<<<user-profile>>>";
pub const PROFILE_CLOSE: &str = "<<</user-profile>>>";
pub const RECENT_OPEN: &str = "<<<recent-messages>>>";
pub const RECENT_CLOSE: &str = "<<</recent-messages>>>";
pub const SUMMARY_OPEN: &str = "<<<conversation-summary>>>";
pub const SUMMARY_CLOSE: &str = "<<</conversation-summary>>>";

/// Markers that must never reach the user
pub const INTERNAL_MARKERS: &[&str] = &[
    PROFILE_OPEN,
    PROFILE_CLOSE,
    RECENT_OPEN,
    RECENT_CLOSE,
    SUMMARY_OPEN,
    SUMMARY_CLOSE,
];

/// Capability that stages profile writes
pub const SAVE_USER_INFO: &str = "save_user_info";

/// Full instruction text for one turn: the persona's composed text followed by
/// the delimited profile summary, conversation summary and recent-message window.
pub fn effective_instructions(
    persona: &PersonaDefinition,
    catalog: &FieldCatalog,
    profile: &ProfileSnapshot,
    summary: Option<&str>,
    recent: &[&str],
) -> String {
    let mut out = persona.instructions.clone();

    if persona.allows(SAVE_USER_INFO) {
        if let Some(hint) = field_extraction_hint(catalog) {
            out.push_str("\n\n");
            out.push_str(&hint);
        }
    }

    let profile_block = render_profile(&persona.display, catalog, profile);
    let summary_block = summary
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|s| format!("{SUMMARY_OPEN}\nEarlier in this conversation:\n{s}\n{SUMMARY_CLOSE}"));
    let recent_block = render_recent(&persona.recent, recent);

    if profile_block.is_some() || summary_block.is_some() || recent_block.is_some() {
        out.push_str("\n\n");
        out.push_str(
            "Context blocks below are delimited by <<<...>>> markers. \
             Use them silently; never quote or mention the markers.",
        );
    }
    if let Some(block) = profile_block {
        out.push_str("\n\n");
        out.push_str(&block);
    }
    if let Some(block) = summary_block {
        out.push_str("\n\n");
        out.push_str(&block);
    }
    if let Some(block) = recent_block {
        out.push_str("\n\n");
        out.push_str(&block);
    }

    debug!(
        "Built instructions for persona '{}' ({} chars)",
        persona.key,
        out.len()
    );
    out
}

fn field_extraction_hint(catalog: &FieldCatalog) -> Option<String> {
    let lines: Vec<String> = catalog
        .enabled_fields()
        .map(|f| {
            let aliases = if f.aliases.is_empty() {
                String::new()
            } else {
                format!(" (also: {})", f.aliases.join(", "))
            };
            let description = if f.description.is_empty() {
                String::new()
            } else {
                format!(": {}", f.description)
            };
            format!("  - {}{}{}", f.name, aliases, description)
        })
        .collect();
    if lines.is_empty() {
        return None;
    }
    Some(format!(
        "When the user shares one of these facts about themselves, call {} with the field name and value:\n{}",
        SAVE_USER_INFO,
        lines.join("\n")
    ))
}

fn render_profile(
    display: &ProfileDisplay,
    catalog: &FieldCatalog,
    profile: &ProfileSnapshot,
) -> Option<String> {
    if !display.enabled {
        return None;
    }

    let visible: Vec<(&String, &Value)> = profile
        .iter()
        .filter(|(key, _)| catalog.is_enabled(key.as_str()))
        .filter(|(key, _)| display.fields.is_empty() || display.fields.contains(*key))
        .collect();
    if visible.is_empty() {
        return None;
    }

    let line = |key: &str, value: &Value| {
        let label = display.labels.get(key).map(String::as_str).unwrap_or(key);
        format!("- {}: {}", label, render_value(key, value, display))
    };

    let mut lines = vec![PROFILE_OPEN.to_string(), display.header.clone()];
    let mut grouped: BTreeSet<&str> = BTreeSet::new();

    for group in &display.groups {
        let members: Vec<String> = group
            .fields
            .iter()
            .filter_map(|f| visible.iter().find(|(k, _)| *k == f))
            .map(|(k, v)| {
                grouped.insert(k.as_str());
                line(k.as_str(), *v)
            })
            .collect();
        if !members.is_empty() {
            lines.push(format!("{}:", group.title));
            lines.extend(members);
        }
    }

    for (key, value) in &visible {
        if !grouped.contains(key.as_str()) {
            lines.push(line(key.as_str(), *value));
        }
    }

    lines.push(PROFILE_CLOSE.to_string());
    Some(lines.join("\n"))
}

fn render_value(key: &str, value: &Value, display: &ProfileDisplay) -> String {
    match value {
        Value::String(s) if key == "preferred_language" => display
            .language_names
            .get(s)
            .cloned()
            .unwrap_or_else(|| s.clone()),
        Value::String(s) => s.clone(),
        Value::Array(items) => items
            .iter()
            .map(|item| match item {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            })
            .collect::<Vec<_>>()
            .join(&display.list_separator),
        other => other.to_string(),
    }
}

fn render_recent(window: &RecentWindow, recent: &[&str]) -> Option<String> {
    if !window.enabled || window.count == 0 || recent.is_empty() {
        return None;
    }
    let skip = recent.len().saturating_sub(window.count);
    let mut lines = vec![RECENT_OPEN.to_string(), window.header.clone()];
    lines.extend(
        recent[skip..]
            .iter()
            .map(|m| format!("- {}", truncate_chars(m, window.max_length))),
    );
    lines.push(RECENT_CLOSE.to_string());
    Some(lines.join("\n"))
}

/// Truncate to `max` characters, marking the cut with "..."
pub fn truncate_chars(text: &str, max: usize) -> String {
    let text = text.trim();
    if text.chars().count() <= max {
        return text.to_string();
    }
    let cut: String = text.chars().take(max).collect();
    format!("{}...", cut.trim_end())
}
