//! Routing hints passed to the model beside, never inside, the user message

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::sync::OnceLock;

/// Where a hint came from
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "lowercase")]
pub enum HintSource {
    /// Resolved by the path router from this entry path
    Path(String),
    /// Named directly by the caller
    Explicit,
}

/// Single-turn suggestion of which persona should answer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoutingHint {
    pub persona: String,
    pub source: HintSource,
}

impl RoutingHint {
    pub fn from_path(persona: impl Into<String>, path: impl Into<String>) -> Self {
        Self {
            persona: persona.into(),
            source: HintSource::Path(path.into()),
        }
    }

    pub fn explicit(persona: impl Into<String>) -> Self {
        Self {
            persona: persona.into(),
            source: HintSource::Explicit,
        }
    }

    /// Text for model clients that only accept instruction blocks
    pub fn render(&self) -> String {
        match &self.source {
            HintSource::Path(path) => format!(
                "Routing hint: the user opened the chat from '{}', which usually belongs to the \
                 '{}' persona. Prefer it unless the message clearly belongs elsewhere.",
                path, self.persona
            ),
            HintSource::Explicit => format!(
                "Routing hint: the caller asked for the '{}' persona. Prefer it unless the \
                 message clearly belongs elsewhere.",
                self.persona
            ),
        }
    }
}

fn markup() -> &'static Regex {
    static MARKUP: OnceLock<Regex> = OnceLock::new();
    MARKUP.get_or_init(|| {
        Regex::new(r"(?i)\[\s*routing[-_ ]hint\s*:[^\]]*\]|\(\s*reference id\s*:[^)]*\)")
            .expect("routing markup pattern")
    })
}

/// Remove hint or citation markup a model may echo back into a message
pub fn strip_hint_markup(message: &str) -> String {
    markup().replace_all(message, "").trim().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_render_path_hint() {
        let hint = RoutingHint::from_path("rewards", "/rewards/history");
        let text = hint.render();
        assert!(text.contains("/rewards/history"));
        assert!(text.contains("'rewards'"));
    }

    #[test]
    fn test_render_explicit_hint() {
        assert!(RoutingHint::explicit("faq").render().contains("caller asked for the 'faq'"));
    }

    #[test]
    fn test_strip_hint_markup() {
        assert_eq!(strip_hint_markup("hello [routing-hint: faq]"), "hello");
        assert_eq!(strip_hint_markup("see (Reference ID: 12) here"), "see  here");
        assert_eq!(strip_hint_markup("plain"), "plain");
    }

    #[test]
    fn test_hint_serde() {
        let hint = RoutingHint::from_path("rewards", "/r");
        let json = serde_json::to_value(&hint).unwrap();
        assert_eq!(json["source"]["kind"], "path");
        assert_eq!(json["source"]["value"], "/r");
    }
}
