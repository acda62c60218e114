//! Prompt builders — pure functions from typed inputs to `{system, user}`
//! string pairs.
//!
//! Builders never read state; the caller (the processor) assembles every
//! input, already filtered for visibility and context windows. This keeps
//! the builders trivially testable and the visibility rules in one place.

mod ceremony;
mod extraction;
mod persona;
mod response;

pub use ceremony::{PendingValidation, build_daily_ceremony_message};
pub use extraction::{
    build_fast_scan_prompt, build_item_match_prompt, build_item_update_prompt,
};
pub use persona::{
    build_description_check_prompt, build_persona_explore_prompt,
    build_persona_generation_prompt,
};
pub use response::{
    ConversationLine, ResponsePromptInput, build_ei_heartbeat_prompt, build_heartbeat_prompt,
    build_response_prompt,
};

/// The output of every builder.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PromptPair {
    pub system: String,
    pub user: String,
}

/// The exact token a persona replies with to stay silent. Checked verbatim
/// (after trim) by the queue processor.
pub const NO_MESSAGE: &str = "No Message";

/// Cap a text block for prompt injection, cutting on a char boundary.
pub fn truncate_for_prompt(text: &str, max: usize) -> String {
    if text.chars().count() <= max {
        return text.to_string();
    }
    let cut: String = text.chars().take(max.saturating_sub(1)).collect();
    format!("{cut}…")
}

// ── Tests ─────────────────────────────────────────────────────────────────────
