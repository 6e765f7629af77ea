//! Reply clean-up before a reply reaches the user

use regex::Regex;
use std::sync::OnceLock;

use crate::personas::{INTERNAL_MARKERS, PersonaDefinition, SuggestionPolicy};
use crate::routing::strip_hint_markup;

fn item_prefix() -> &'static Regex {
    static PREFIX: OnceLock<Regex> = OnceLock::new();
    PREFIX.get_or_init(|| {
        Regex::new(r"^\s*(?:\d+\s*[\).\-:]|[۰-۹]+\s*[\).\-:]|[-*•])\s*").expect("list prefix pattern")
    })
}

fn blank_runs() -> &'static Regex {
    static RUNS: OnceLock<Regex> = OnceLock::new();
    RUNS.get_or_init(|| Regex::new(r"\n[ \t]*\n(?:[ \t]*\n)+").expect("blank line pattern"))
}

/// Apply `persona`'s output policy to raw model text. In guided mode the
/// suggested-next-steps block is made present and bounded; otherwise it is
/// removed. Never returns an empty string.
pub fn postprocess(persona: &PersonaDefinition, raw: &str, guided: bool) -> String {
    let mut text = raw.to_string();
    for marker in INTERNAL_MARKERS {
        text = text.replace(*marker, "");
    }
    text = strip_hint_markup(&text);

    for pattern in &persona.policy.forbidden {
        text = pattern.replace_all(&text, "").into_owned();
    }

    if let Some(policy) = &persona.policy.suggestions {
        text = shape_suggestions(&text, policy, guided);
    }

    let text = blank_runs().replace_all(&text, "\n\n").trim().to_string();
    if text.is_empty() {
        persona.fallback_text().to_string()
    } else {
        text
    }
}

fn shape_suggestions(text: &str, policy: &SuggestionPolicy, guided: bool) -> String {
    let (body, items, rest) = split_suggestions(text, &policy.header);

    if !guided {
        return join_nonempty(&[body.trim_end(), rest.trim()]);
    }

    let items: Vec<String> = if items.is_empty() {
        policy.fallback.clone()
    } else {
        items
    };
    if items.is_empty() || policy.max_items == 0 {
        return join_nonempty(&[body.trim_end(), rest.trim()]);
    }

    let block = std::iter::once(policy.header.clone())
        .chain(
            items
                .iter()
                .take(policy.max_items)
                .enumerate()
                .map(|(i, item)| format!("{}) {}", i + 1, item)),
        )
        .collect::<Vec<_>>()
        .join("\n");

    join_nonempty(&[body.trim_end(), rest.trim(), block.as_str()])
}

/// Split into text before the block, the block's items, and any text after it
fn split_suggestions<'t>(text: &'t str, header: &str) -> (&'t str, Vec<String>, &'t str) {
    let Some((start, end)) = find_header(text, header) else {
        return (text, Vec::new(), "");
    };
    let body = &text[..start];
    let after_header = &text[end..];

    let mut items = Vec::new();
    let mut consumed = 0;
    for line in after_header.split_inclusive('\n') {
        let trimmed = line.trim();
        if trimmed.is_empty() {
            if items.is_empty() {
                consumed += line.len();
                continue;
            }
            break;
        }
        let item = item_prefix().replace(trimmed, "").trim().to_string();
        if !item.is_empty() {
            items.push(item);
        }
        consumed += line.len();
    }

    (body, items, &after_header[consumed..])
}

fn find_header(text: &str, header: &str) -> Option<(usize, usize)> {
    let header = header.trim_end_matches(':').trim();
    if header.is_empty() {
        return None;
    }
    let pattern = format!(r"(?i){}\s*:?", regex::escape(header));
    let re = Regex::new(&pattern).ok()?;
    re.find(text).map(|m| (m.start(), m.end()))
}

fn join_nonempty(parts: &[&str]) -> String {
    parts
        .iter()
        .filter(|p| !p.is_empty())
        .copied()
        .collect::<Vec<_>>()
        .join("\n\n")
}
