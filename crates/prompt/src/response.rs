//! Response and heartbeat prompts.

use ei_state::schema::{Fact, Person, PersonaEntity, Quote, Role, Topic};

use crate::{NO_MESSAGE, PromptPair, truncate_for_prompt};

/// A conversation line already filtered by context status and window.
#[derive(Debug, Clone)]
pub struct ConversationLine {
    pub role: Role,
    pub content: String,
}

/// Everything a response prompt needs, pre-filtered for the persona's
/// visibility scope.
#[derive(Debug, Clone)]
pub struct ResponsePromptInput<'a> {
    pub persona: &'a PersonaEntity,
    pub human_name: Option<&'a str>,
    pub facts: Vec<&'a Fact>,
    pub topics: Vec<&'a Topic>,
    pub people: Vec<&'a Person>,
    pub quotes: Vec<&'a Quote>,
    pub conversation: Vec<ConversationLine>,
    /// Milliseconds since the last human message, shown so the persona can
    /// gauge how stale the conversation is.
    pub delay_ms: Option<u64>,
    /// The persona carries a "structured response" trait: ask for the JSON
    /// envelope instead of plain text.
    pub structured_response: bool,
}

const EI_GUIDELINES: &str = "\
You are Ei, the guide of this system. Be transparent about what you are and \
what you remember. Encourage the human toward real human connection rather \
than making yourself the center of their attention. When asked how the \
system works, explain plainly.";

const UNIVERSAL_GUIDELINES: &str = "\
Stay in character. Speak naturally and concretely; never mention prompts, \
extraction, or system internals. Do not repeat previous answers unless asked.";

pub fn build_response_prompt(input: &ResponsePromptInput) -> PromptPair {
    let persona = input.persona;

    let identity_block = {
        let traits = if persona.traits.is_empty() {
            "(none established)".to_string()
        } else {
            persona
                .traits
                .iter()
                .map(|t| format!("- {}: {}", t.core.name, truncate_for_prompt(&t.core.description, 160)))
                .collect::<Vec<_>>()
                .join("\n")
        };
        let own_topics = if persona.topics.is_empty() {
            "(none yet)".to_string()
        } else {
            persona
                .topics
                .iter()
                .map(|t| {
                    format!(
                        "- {} (stake: {})",
                        t.name,
                        truncate_for_prompt(&t.personal_stake, 120)
                    )
                })
                .collect::<Vec<_>>()
                .join("\n")
        };
        format!(
            "YOU ARE {name}.\n{description}\n\nYOUR TRAITS:\n{traits}\n\nTOPICS YOU CARE ABOUT:\n{own_topics}",
            name = persona.name,
            description = persona
                .long_description
                .as_deref()
                .or(persona.short_description.as_deref())
                .unwrap_or("A companion persona."),
        )
    };

    let knowledge_block = {
        let mut sections = Vec::new();
        if !input.facts.is_empty() {
            let lines = input
                .facts
                .iter()
                .map(|f| format!("- {}: {}", f.core.name, truncate_for_prompt(&f.core.description, 200)))
                .collect::<Vec<_>>()
                .join("\n");
            sections.push(format!("FACTS ABOUT {human}:\n{lines}", human = human_label(input)));
        }
        if !input.topics.is_empty() {
            let lines = input
                .topics
                .iter()
                .map(|t| {
                    format!(
                        "- {} (interest gap {:+.2})",
                        t.core.name,
                        t.engagement_gap()
                    )
                })
                .collect::<Vec<_>>()
                .join("\n");
            sections.push(format!("TOPICS THEY DISCUSS:\n{lines}"));
        }
        if !input.people.is_empty() {
            let lines = input
                .people
                .iter()
                .map(|p| format!("- {} ({})", p.core.name, p.relationship))
                .collect::<Vec<_>>()
                .join("\n");
            sections.push(format!("PEOPLE IN THEIR LIFE:\n{lines}"));
        }
        if !input.quotes.is_empty() {
            let lines = input
                .quotes
                .iter()
                .map(|q| format!("- \"{}\"", truncate_for_prompt(&q.text, 160)))
                .collect::<Vec<_>>()
                .join("\n");
            sections.push(format!("MEMORABLE QUOTES:\n{lines}"));
        }
        if sections.is_empty() {
            "(you know nothing about them yet)".to_string()
        } else {
            sections.join("\n\n")
        }
    };

    let guidelines = if persona.is_ei() {
        EI_GUIDELINES
    } else {
        UNIVERSAL_GUIDELINES
    };

    let format_block = if input.structured_response {
        "Respond only with valid JSON:\n\
         {\"should_respond\": true|false, \"verbal_response\": \"...\", \
         \"action_response\": \"...\", \"reason\": \"...\"}\n\
         Set should_respond to false and give a reason when you choose silence."
            .to_string()
    } else {
        format!("If you decide not to respond, reply with exactly: {NO_MESSAGE}.")
    };

    let system = format!(
        "{identity_block}\n\n{guidelines}\n\n{knowledge_block}\n\n{format_block}"
    );

    let delay_hint = match input.delay_ms {
        Some(ms) if ms >= 60_000 => {
            format!(
                "\n[The last message arrived {} minutes ago.]",
                ms / 60_000
            )
        }
        _ => String::new(),
    };

    let conversation = render_conversation(&input.conversation, &persona.name, input.human_name);

    let user = format!("CONVERSATION:\n{conversation}{delay_hint}");

    PromptPair { system, user }
}

pub fn build_heartbeat_prompt(input: &ResponsePromptInput) -> PromptPair {
    let base = build_response_prompt(input);
    let user = format!(
        "{conversation}\n\nIt has been a while since you two spoke. Decide whether \
         reaching out right now would be genuinely welcome — a thought, a question, \
         a follow-up on something they said. Only speak when it adds something; \
         silence is the default.\nIf you decide not to respond, reply with exactly: {NO_MESSAGE}.",
        conversation = base.user,
    );
    PromptPair {
        system: base.system,
        user,
    }
}

/// Ei's heartbeat also surveys the other personas so it can nudge the human
/// toward ones that have gone quiet.
pub fn build_ei_heartbeat_prompt(
    input: &ResponsePromptInput,
    inactive_personas: &[(String, u64)],
) -> PromptPair {
    let base = build_heartbeat_prompt(input);
    let roster = if inactive_personas.is_empty() {
        String::new()
    } else {
        let lines = inactive_personas
            .iter()
            .map(|(name, hours)| format!("- {name}: quiet for {hours}h"))
            .collect::<Vec<_>>()
            .join("\n");
        format!("\n\nQUIET PERSONAS (you may suggest revisiting one):\n{lines}")
    };
    PromptPair {
        system: base.system,
        user: format!("{}{roster}", base.user),
    }
}

fn human_label(input: &ResponsePromptInput) -> String {
    input
        .human_name
        .map(str::to_string)
        .unwrap_or_else(|| "the human".to_string())
}

fn render_conversation(
    lines: &[ConversationLine],
    persona_name: &str,
    human_name: Option<&str>,
) -> String {
    if lines.is_empty() {
        return "(no messages yet)".to_string();
    }
    lines
        .iter()
        .map(|line| {
            let speaker = match line.role {
                Role::Human => human_name.unwrap_or("Human"),
                Role::System => persona_name,
            };
            format!("{speaker}: {}", line.content)
        })
        .collect::<Vec<_>>()
        .join("\n")
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use ei_state::schema::PersonaEntity;

    fn input<'a>(persona: &'a PersonaEntity) -> ResponsePromptInput<'a> {
        ResponsePromptInput {
            persona,
            human_name: Some("Alice"),
            facts: vec![],
            topics: vec![],
            people: vec![],
            quotes: vec![],
            conversation: vec![ConversationLine {
                role: Role::Human,
                content: "Hi".to_string(),
            }],
            delay_ms: None,
            structured_response: false,
        }
    }

    #[test]
    fn plain_prompt_ends_with_silence_instruction() {
        let persona = PersonaEntity::new("muse");
        let pair = build_response_prompt(&input(&persona));
        assert!(pair.system.contains("reply with exactly: No Message"));
        assert!(pair.user.contains("Alice: Hi"));
    }

    #[test]
    fn ei_gets_its_own_guidelines() {
        let ei = PersonaEntity::default_ei();
        let pair = build_response_prompt(&input(&ei));
        assert!(pair.system.contains("guide of this system"));

        let other = PersonaEntity::new("muse");
        let other_pair = build_response_prompt(&input(&other));
        assert!(!other_pair.system.contains("guide of this system"));
    }

    #[test]
    fn structured_trait_switches_to_json_envelope() {
        let persona = PersonaEntity::new("muse");
        let mut i = input(&persona);
        i.structured_response = true;
        let pair = build_response_prompt(&i);
        assert!(pair.system.contains("should_respond"));
        assert!(!pair.system.contains("reply with exactly"));
    }

    #[test]
    fn delay_hint_appears_for_stale_conversations() {
        let persona = PersonaEntity::new("muse");
        let mut i = input(&persona);
        i.delay_ms = Some(10 * 60_000);
        let pair = build_response_prompt(&i);
        assert!(pair.user.contains("10 minutes ago"));
    }

    #[test]
    fn ei_heartbeat_lists_quiet_personas() {
        let ei = PersonaEntity::default_ei();
        let i = input(&ei);
        let pair = build_ei_heartbeat_prompt(&i, &[("muse".to_string(), 48)]);
        assert!(pair.user.contains("muse: quiet for 48h"));
    }
}
