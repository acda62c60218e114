//! Persona response and heartbeat handlers.

use chrono::Utc;
use serde::Deserialize;
use tracing::{debug, info};

use ei_state::schema::{ContextStatus, Message};

use crate::events::ProcessorEvent;
use crate::handlers::{HandlerCtx, extraction};
use crate::parse::extract_json;
use crate::queue_processor::LlmOutcome;

/// The JSON envelope personas with a "structured response" trait reply in.
#[derive(Debug, Deserialize)]
struct StructuredEnvelope {
    should_respond: bool,
    #[serde(default)]
    verbal_response: Option<String>,
    #[serde(default)]
    action_response: Option<String>,
    #[serde(default)]
    reason: Option<String>,
}

fn has_structured_trait(ctx: &HandlerCtx, persona: &str) -> bool {
    ctx.state
        .persona_get(persona)
        .map(|p| {
            p.traits
                .iter()
                .any(|t| t.core.name.eq_ignore_ascii_case("structured response"))
        })
        .unwrap_or(false)
}

fn bump_heartbeat(ctx: &mut HandlerCtx, persona: &str) {
    let _ = ctx.state.persona_update(persona, |p| {
        p.last_heartbeat = Some(Utc::now());
    });
}

pub fn handle_persona_response(
    ctx: &mut HandlerCtx,
    persona: &str,
    outcome: LlmOutcome,
) -> anyhow::Result<()> {
    ctx.processing.remove(&persona.to_ascii_lowercase());

    let (content, truncated) = match outcome {
        LlmOutcome::Silence => {
            debug!(persona, "persona chose silence");
            bump_heartbeat(ctx, persona);
            return Ok(());
        }
        LlmOutcome::Text { content, truncated } => (content, truncated),
        other => anyhow::bail!("response handler got {other:?}"),
    };

    if content.is_empty() {
        // An echo-only reply strips down to nothing; treat as silence.
        bump_heartbeat(ctx, persona);
        return Ok(());
    }

    if has_structured_trait(ctx, persona) {
        if let Some(envelope) = extract_json(&content).and_then(|v| {
            serde_json::from_value::<StructuredEnvelope>(v).ok()
        }) {
            return deliver_structured(ctx, persona, envelope);
        }
        // Envelope expected but absent: fall through and deliver as text.
    }

    if truncated {
        debug!(persona, "delivering truncated response");
    }
    append_reply(ctx, persona, content)?;
    extraction::enqueue_extraction_scans(ctx, persona);
    Ok(())
}

fn deliver_structured(
    ctx: &mut HandlerCtx,
    persona: &str,
    envelope: StructuredEnvelope,
) -> anyhow::Result<()> {
    if !envelope.should_respond {
        bump_heartbeat(ctx, persona);
        if let Some(reason) = envelope.reason.filter(|r| !r.is_empty()) {
            let mut note = Message::system(format!(
                "[{persona} chose not to respond because: {reason}]"
            ));
            note.context_status = ContextStatus::Never;
            ctx.state.messages_append(persona, note)?;
            ctx.emit(ProcessorEvent::MessageAdded {
                persona: persona.to_string(),
            });
        }
        return Ok(());
    }

    let text = match (envelope.verbal_response, envelope.action_response) {
        (Some(verbal), Some(action)) if !action.is_empty() => format!("{verbal}\n\n{action}"),
        (Some(verbal), _) => verbal,
        (None, Some(action)) => action,
        (None, None) => return Ok(()),
    };
    if text.is_empty() {
        return Ok(());
    }
    append_reply(ctx, persona, text)?;
    extraction::enqueue_extraction_scans(ctx, persona);
    Ok(())
}

fn append_reply(ctx: &mut HandlerCtx, persona: &str, content: String) -> anyhow::Result<()> {
    info!(persona, len = content.len(), "persona response delivered");
    ctx.state.messages_append(persona, Message::system(content))?;
    ctx.emit(ProcessorEvent::MessageAdded {
        persona: persona.to_string(),
    });
    Ok(())
}

/// Heartbeat check: the persona decided whether to reach out. Silence only
/// bumps `last_heartbeat`; a message is delivered like a normal reply.
pub fn handle_heartbeat(
    ctx: &mut HandlerCtx,
    persona: &str,
    outcome: LlmOutcome,
) -> anyhow::Result<()> {
    ctx.processing.remove(&persona.to_ascii_lowercase());
    bump_heartbeat(ctx, persona);

    match outcome {
        LlmOutcome::Silence => Ok(()),
        LlmOutcome::Text { content, .. } if !content.is_empty() => {
            info!(persona, "heartbeat produced a message");
            append_reply(ctx, persona, content)
        }
        LlmOutcome::Text { .. } => Ok(()),
        other => anyhow::bail!("heartbeat handler got {other:?}"),
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handlers::testing::Harness;
    use ei_state::schema::{ItemCore, PersonaEntity, Role, TraitItem};

    fn text(content: &str) -> LlmOutcome {
        LlmOutcome::Text {
            content: content.to_string(),
            truncated: false,
        }
    }

    fn structured_persona() -> PersonaEntity {
        let mut persona = PersonaEntity::new("muse");
        persona.traits.push(TraitItem {
            core: ItemCore::new("Structured Response", "answers in envelopes"),
            strength: None,
        });
        persona
    }

    #[test]
    fn reply_is_appended_and_extraction_queued() -> anyhow::Result<()> {
        let mut harness = Harness::new();
        harness
            .state
            .messages_append("ei", ei_state::schema::Message::human("hi"))?;
        harness.gate.note_human_message("ei");

        let mut ctx = harness.ctx();
        handle_persona_response(&mut ctx, "ei", text("good to hear from you"))?;

        let messages = harness.state.messages("ei");
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[1].role, Role::System);
        assert!(harness.state.queue_len() > 0, "extraction scans queued");
        Ok(())
    }

    #[test]
    fn silence_bumps_heartbeat_and_appends_nothing() -> anyhow::Result<()> {
        let mut harness = Harness::new();
        let mut ctx = harness.ctx();
        handle_persona_response(&mut ctx, "ei", LlmOutcome::Silence)?;

        assert!(harness.state.messages("ei").is_empty());
        assert!(harness.state.persona_get("ei").unwrap().last_heartbeat.is_some());
        assert_eq!(harness.state.queue_len(), 0, "silence closes no pair");
        Ok(())
    }

    #[test]
    fn echo_only_reply_reads_as_silence() -> anyhow::Result<()> {
        let mut harness = Harness::new();
        let mut ctx = harness.ctx();
        handle_persona_response(&mut ctx, "ei", text(""))?;
        assert!(harness.state.messages("ei").is_empty());
        Ok(())
    }

    #[test]
    fn structured_refusal_with_reason_leaves_hidden_note() -> anyhow::Result<()> {
        let mut harness = Harness::new();
        harness.state.persona_add(structured_persona())?;

        let envelope =
            r#"{"should_respond": false, "reason": "they asked me to stay out of this"}"#;
        let mut ctx = harness.ctx();
        handle_persona_response(&mut ctx, "muse", text(envelope))?;

        let messages = harness.state.messages("muse");
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].context_status, ContextStatus::Never);
        assert!(messages[0].content.contains("chose not to respond because"));
        Ok(())
    }

    #[test]
    fn structured_acceptance_delivers_verbal_response() -> anyhow::Result<()> {
        let mut harness = Harness::new();
        harness.state.persona_add(structured_persona())?;

        let envelope = r#"{"should_respond": true, "verbal_response": "gladly"}"#;
        let mut ctx = harness.ctx();
        handle_persona_response(&mut ctx, "muse", text(envelope))?;

        let messages = harness.state.messages("muse");
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].content, "gladly");
        assert_eq!(messages[0].context_status, ContextStatus::Default);
        Ok(())
    }

    #[test]
    fn heartbeat_message_is_delivered_and_stamped() -> anyhow::Result<()> {
        let mut harness = Harness::new();
        let mut ctx = harness.ctx();
        handle_heartbeat(&mut ctx, "ei", text("been thinking about you"))?;

        assert_eq!(harness.state.messages("ei").len(), 1);
        assert!(harness.state.persona_get("ei").unwrap().last_heartbeat.is_some());
        Ok(())
    }

    #[test]
    fn heartbeat_silence_only_stamps() -> anyhow::Result<()> {
        let mut harness = Harness::new();
        let mut ctx = harness.ctx();
        handle_heartbeat(&mut ctx, "ei", LlmOutcome::Silence)?;

        assert!(harness.state.messages("ei").is_empty());
        assert!(harness.state.persona_get("ei").unwrap().last_heartbeat.is_some());
        Ok(())
    }
}
