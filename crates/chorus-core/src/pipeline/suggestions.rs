//! Guided/free lifecycle of suggested next steps

use tracing::info;

use crate::config::SuggestionLifecycle;
use crate::types::{SessionMeta, UserMode};

/// Count this turn and decide whether the session leaves guided mode.
/// Returns `true` only on the turn that makes the switch.
pub fn advance(meta: &mut SessionMeta, policy: &SuggestionLifecycle, from_suggestion: bool) -> bool {
    let prior_turns = meta.user_turns;
    meta.user_turns = meta.user_turns.saturating_add(1);
    if from_suggestion {
        meta.suggestion_clicks = meta.suggestion_clicks.saturating_add(1);
    }

    if meta.user_mode == UserMode::Free {
        return false;
    }

    let switch = meta.suggestion_clicks >= policy.max_clicks
        || prior_turns >= policy.free_mode_after_turns;
    if switch {
        info!(
            "Switching session to free mode (turns={}, clicks={})",
            meta.user_turns, meta.suggestion_clicks
        );
        meta.user_mode = UserMode::Free;
    }
    switch
}
