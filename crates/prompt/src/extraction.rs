//! Three-step extraction prompts: blind scan, match, update.

use ei_state::schema::{DataKind, Message, Role};

use crate::{PromptPair, truncate_for_prompt};

fn kind_noun(kind: DataKind) -> &'static str {
    match kind {
        DataKind::Fact => "biographical facts",
        DataKind::Trait => "behavioral traits or patterns",
        DataKind::Topic => "topics of interest",
        DataKind::Person => "people in the human's life",
        DataKind::Quote => "memorable quotes",
    }
}

fn render_chunk(messages: &[&Message]) -> String {
    if messages.is_empty() {
        return "(empty)".to_string();
    }
    messages
        .iter()
        .map(|m| {
            let who = match m.role {
                Role::Human => "Human",
                Role::System => "Companion",
            };
            format!("{who}: {}", truncate_for_prompt(&m.content, 600))
        })
        .collect::<Vec<_>>()
        .join("\n")
}

/// Step 1 — blind scan. Deliberately does not show existing items so the
/// model reports what the conversation actually says rather than anchoring
/// on what is already known. Persona names are listed so they are never
/// proposed as people.
pub fn build_fast_scan_prompt(
    kind: DataKind,
    messages: &[&Message],
    persona_names: &[String],
) -> PromptPair {
    let system = format!(
        "You scan a conversation chunk for {noun}. Report only what the text \
         supports; do not invent or embellish.\n\
         Respond only with valid JSON:\n\
         {{\"mentioned\": [\"name\", …], \"new_items\": [{{\"name\": \"…\", \
         \"value\": \"…\", \"confidence\": \"high\"|\"medium\"|\"low\"}}]}}\n\
         `mentioned` lists items of this kind the chunk refers to; `new_items` \
         are candidates worth recording. Empty arrays are a valid answer.",
        noun = kind_noun(kind),
    );

    let filter = if persona_names.is_empty() {
        String::new()
    } else {
        format!(
            "\n\nThese are AI companion personas, not people in the human's \
             life — never report them: {}",
            persona_names.join(", ")
        )
    };

    let user = format!(
        "CONVERSATION CHUNK:\n{chunk}{filter}",
        chunk = render_chunk(messages),
    );

    PromptPair { system, user }
}

/// Step 2 — match one candidate against the existing items of its kind.
pub fn build_item_match_prompt(
    kind: DataKind,
    candidate: &serde_json::Value,
    existing: &[(String, String)],
) -> PromptPair {
    let system = format!(
        "You decide whether a newly scanned candidate is the same underlying \
         {noun_singular} as one already on file. Nicknames, rephrasings, and \
         partial names can still be the same item; different people or facts \
         that merely share a word are not.\n\
         Respond only with valid JSON:\n\
         {{\"match_id\": \"<id>\"|null, \"confidence\": 0.0–1.0}}",
        noun_singular = kind.label(),
    );

    let existing_block = if existing.is_empty() {
        "(none on file)".to_string()
    } else {
        existing
            .iter()
            .map(|(id, summary)| format!("- [{id}] {}", truncate_for_prompt(summary, 200)))
            .collect::<Vec<_>>()
            .join("\n")
    };

    let user = format!(
        "CANDIDATE:\n{candidate}\n\nEXISTING ITEMS:\n{existing_block}",
        candidate = serde_json::to_string_pretty(candidate).unwrap_or_default(),
    );

    PromptPair { system, user }
}

/// Step 3 — update an existing item or create a new one from the chunk.
/// Also harvests memorable quotes; the handler verifies each quote by exact
/// substring search before storing it.
pub fn build_item_update_prompt(
    kind: DataKind,
    existing: Option<&serde_json::Value>,
    messages: &[&Message],
    persona_name: &str,
) -> PromptPair {
    let level_fields = match kind {
        DataKind::Topic | DataKind::Person => {
            ", \"exposure_impact\": \"high\"|\"medium\"|\"low\"|\"none\", \
             \"level_ideal\": 0.0–1.0"
        }
        _ => "",
    };
    let extra_fields = match kind {
        DataKind::Fact => ", \"confidence\": 0.0–1.0",
        DataKind::Trait => ", \"strength\": 0.0–1.0",
        DataKind::Person => ", \"relationship\": \"…\"",
        _ => "",
    };

    let system = format!(
        "You are {persona_name}, updating one {noun_singular} of the human's \
         record from a conversation chunk. Produce the complete item as it \
         should now read, preserving anything the chunk does not contradict.\n\
         Respond only with valid JSON:\n\
         {{\"name\": \"…\", \"description\": \"…\", \"sentiment\": -1.0–1.0\
         {extra_fields}{level_fields}, \
         \"quotes\": [{{\"text\": \"<exact words from the chunk>\", \
         \"reason\": \"…\"}}]}}\n\
         Quote text must be copied verbatim — paraphrases are discarded. An \
         empty quotes array is fine.",
        noun_singular = kind.label(),
    );

    let existing_block = match existing {
        Some(value) => format!(
            "EXISTING ITEM:\n{}",
            serde_json::to_string_pretty(value).unwrap_or_default()
        ),
        None => "EXISTING ITEM: (none — this is a new item)".to_string(),
    };

    let user = format!(
        "{existing_block}\n\nCONVERSATION CHUNK:\n{chunk}",
        chunk = render_chunk(messages),
    );

    PromptPair { system, user }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
