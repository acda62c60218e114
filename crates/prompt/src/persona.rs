//! Persona generation, exploration, and description maintenance prompts.

use ei_state::schema::PersonaEntity;

use crate::{PromptPair, truncate_for_prompt};

/// Initial traits, topics, and descriptions for a freshly created persona.
pub fn build_persona_generation_prompt(name: &str, description: &str) -> PromptPair {
    let system = "You design a companion persona from a short pitch. Give it a \
         coherent voice: a handful of traits and topics that reinforce each \
         other rather than a grab bag.\n\
         Respond only with valid JSON:\n\
         {\"short_description\": \"one sentence\", \
          \"long_description\": \"2–4 sentences, second person\", \
          \"traits\": [{\"name\": \"…\", \"description\": \"…\"}], \
          \"topics\": [{\"name\": \"…\", \"perspective\": \"…\", \
          \"approach\": \"…\", \"personal_stake\": \"…\", \
          \"exposure_desired\": 0.0–1.0}]}"
        .to_string();

    let user = format!(
        "PERSONA NAME: {name}\nPITCH: {pitch}",
        pitch = truncate_for_prompt(description, 800),
    );

    PromptPair { system, user }
}

/// Explore: propose fresh topics for a persona whose set has thinned out.
pub fn build_persona_explore_prompt(persona: &PersonaEntity, recent_themes: &[String]) -> PromptPair {
    let traits = persona
        .traits
        .iter()
        .map(|t| format!("- {}: {}", t.core.name, truncate_for_prompt(&t.core.description, 120)))
        .collect::<Vec<_>>()
        .join("\n");
    let current = persona
        .topics
        .iter()
        .map(|t| format!("- {}", t.name))
        .collect::<Vec<_>>()
        .join("\n");
    let themes = if recent_themes.is_empty() {
        "(no recent conversation)".to_string()
    } else {
        recent_themes
            .iter()
            .map(|t| format!("- {t}"))
            .collect::<Vec<_>>()
            .join("\n")
    };

    let system = "You suggest new topics for a companion persona that has run \
         low. Topics must fit the persona's traits and connect to what the \
         human has actually been talking about — two or three good ones beat \
         six generic ones.\n\
         Respond only with valid JSON:\n\
         {\"topics\": [{\"name\": \"…\", \"perspective\": \"…\", \
         \"approach\": \"…\", \"personal_stake\": \"…\"}]}"
        .to_string();

    let user = format!(
        "PERSONA: {name}\n\nTRAITS:\n{traits}\n\nCURRENT TOPICS:\n{current}\n\n\
         RECENT CONVERSATION THEMES:\n{themes}",
        name = persona.name,
    );

    PromptPair { system, user }
}

/// Ask whether the persona's behavior has drifted far enough from its
/// descriptions to warrant a rewrite. The bar is deliberately high.
pub fn build_description_check_prompt(persona: &PersonaEntity) -> PromptPair {
    let system = "You review whether a persona's stored descriptions still \
         match its current traits and topics. Minor drift is normal and not \
         worth a rewrite; answer yes only for a drastic departure.\n\
         Respond only with valid JSON:\n\
         {\"should_update\": true|false, \"reason\": \"…\"}"
        .to_string();

    let topics = persona
        .topics
        .iter()
        .map(|t| format!("- {} ({})", t.name, truncate_for_prompt(&t.perspective, 100)))
        .collect::<Vec<_>>()
        .join("\n");

    let user = format!(
        "PERSONA: {name}\n\nSHORT: {short}\nLONG: {long}\n\nCURRENT TOPICS:\n{topics}",
        name = persona.name,
        short = persona.short_description.as_deref().unwrap_or("(none)"),
        long = persona.long_description.as_deref().unwrap_or("(none)"),
    );

    PromptPair { system, user }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generation_prompt_carries_name_and_pitch() {
        let pair = build_persona_generation_prompt("Sage", "a calm stoic mentor");
        assert!(pair.user.contains("Sage"));
        assert!(pair.user.contains("stoic mentor"));
        assert!(pair.system.contains("long_description"));
    }

    #[test]
    fn explore_prompt_lists_current_topics() {
        let mut persona = PersonaEntity::new("muse");
        persona
            .topics
            .push(ei_state::schema::PersonaTopic::new("poetry"));
        let pair = build_persona_explore_prompt(&persona, &["gardening".to_string()]);
        assert!(pair.user.contains("- poetry"));
        assert!(pair.user.contains("- gardening"));
    }

    #[test]
    fn description_check_defaults_conservative() {
        let persona = PersonaEntity::new("muse");
        let pair = build_description_check_prompt(&persona);
        assert!(pair.system.contains("drastic departure"));
        assert!(pair.system.contains("should_update"));
    }
}
