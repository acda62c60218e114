//! Persona lifecycle handlers: generation, exploration, description checks,
//! the ceremony exposure phase, and the system-wide decay tick.

use chrono::Utc;
use serde::Deserialize;
use tracing::{debug, info};

use ei_state::levels;
use ei_state::schema::{
    ItemCore, PersonaEntity, PersonaTopic, Priority, QueueItem, Request, TraitItem,
};
use ei_state::StateManager;

use crate::events::ProcessorEvent;
use crate::handlers::HandlerCtx;

/// Below this many topics (after Expire) the ceremony runs Explore.
pub const LOW_TOPIC_THRESHOLD: usize = 3;

/// Exposure defaults for topics added by Explore: fresh but not urgent.
const EXPLORE_EXPOSURE_DESIRED: f32 = 0.4;
const EXPLORE_EXPOSURE_CURRENT: f32 = 0.1;

// ── Generation ────────────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct GenerationResult {
    #[serde(default)]
    short_description: Option<String>,
    #[serde(default)]
    long_description: Option<String>,
    #[serde(default)]
    traits: Vec<GeneratedTrait>,
    #[serde(default)]
    topics: Vec<GeneratedTopic>,
}

#[derive(Debug, Deserialize)]
struct GeneratedTrait {
    name: String,
    #[serde(default)]
    description: String,
}

#[derive(Debug, Deserialize)]
struct GeneratedTopic {
    name: String,
    #[serde(default)]
    perspective: String,
    #[serde(default)]
    approach: String,
    #[serde(default)]
    personal_stake: String,
    #[serde(default)]
    exposure_desired: Option<f32>,
}

pub fn handle_persona_generation(
    ctx: &mut HandlerCtx,
    name: &str,
    description: &str,
    value: serde_json::Value,
) -> anyhow::Result<()> {
    let generated: GenerationResult = serde_json::from_value(value)
        .map_err(|err| anyhow::anyhow!("generation result: {err}"))?;

    if ctx.state.persona_get(name).is_some() {
        // Regeneration after a drastic departure: only the descriptions are
        // rewritten; the persona keeps its evolved traits and topics.
        ctx.state.persona_update(name, |p| {
            if let Some(short) = &generated.short_description {
                p.short_description = Some(short.clone());
            }
            if let Some(long) = &generated.long_description {
                p.long_description = Some(long.clone());
            }
        })?;
        info!(persona = name, "descriptions regenerated");
        ctx.emit(ProcessorEvent::PersonaUpdated(name.to_string()));
        return Ok(());
    }

    let mut persona = PersonaEntity::new(name);
    persona.short_description = generated
        .short_description
        .or_else(|| Some(description.to_string()));
    persona.long_description = generated.long_description;
    persona.heartbeat_delay_ms = ctx.config.runtime.heartbeat_delay_ms;
    persona.context_window_ms = ctx.config.runtime.context_window_ms;
    persona.traits = generated
        .traits
        .into_iter()
        .map(|t| TraitItem {
            core: ItemCore::new(t.name, t.description),
            strength: None,
        })
        .collect();
    persona.topics = generated
        .topics
        .into_iter()
        .map(|t| {
            let mut topic = PersonaTopic::new(t.name);
            topic.perspective = t.perspective;
            topic.approach = t.approach;
            topic.personal_stake = t.personal_stake;
            topic.exposure_desired = levels::clamp_unit(t.exposure_desired.unwrap_or(0.5));
            topic
        })
        .collect();

    info!(persona = name, traits = persona.traits.len(), topics = persona.topics.len(), "persona generated");
    ctx.state.persona_add(persona)?;
    ctx.emit(ProcessorEvent::PersonaAdded(name.to_string()));
    Ok(())
}

// ── Explore ───────────────────────────────────────────────────────────────────

#[derive(Debug, Deserialize, Default)]
struct ExploreResult {
    #[serde(default)]
    topics: Vec<GeneratedTopic>,
}

pub fn handle_persona_explore(
    ctx: &mut HandlerCtx,
    persona: &str,
    value: serde_json::Value,
) -> anyhow::Result<()> {
    let explored: ExploreResult = serde_json::from_value(value).unwrap_or_default();

    let added = {
        let mut added = 0usize;
        ctx.state.persona_update(persona, |p| {
            for generated in explored.topics {
                let duplicate = p
                    .topics
                    .iter()
                    .any(|t| t.name.eq_ignore_ascii_case(&generated.name));
                if duplicate {
                    continue;
                }
                let mut topic = PersonaTopic::new(generated.name);
                topic.perspective = generated.perspective;
                topic.approach = generated.approach;
                topic.personal_stake = generated.personal_stake;
                topic.exposure_desired = levels::clamp_unit(
                    generated.exposure_desired.unwrap_or(EXPLORE_EXPOSURE_DESIRED),
                );
                topic.exposure_current = EXPLORE_EXPOSURE_CURRENT;
                p.topics.push(topic);
                added += 1;
            }
        })?;
        added
    };

    info!(persona, added, "explore phase added topics");
    ctx.emit(ProcessorEvent::PersonaUpdated(persona.to_string()));

    // Ceremony chain: Explore → Descriptions.
    ctx.state.queue_enqueue(QueueItem::new(
        Priority::Low,
        Request::DescriptionCheck {
            persona: persona.to_string(),
        },
    ));
    Ok(())
}

// ── Description check ─────────────────────────────────────────────────────────

#[derive(Debug, Deserialize, Default)]
struct DescriptionCheckResult {
    #[serde(default)]
    should_update: bool,
}

pub fn handle_description_check(
    ctx: &mut HandlerCtx,
    persona: &str,
    value: serde_json::Value,
) -> anyhow::Result<()> {
    // Any ambiguity reads as "no": the default is to leave descriptions be.
    let check: DescriptionCheckResult = serde_json::from_value(value).unwrap_or_default();
    if !check.should_update {
        debug!(persona, "descriptions unchanged");
        return Ok(());
    }

    let pitch = ctx
        .state
        .persona_get(persona)
        .and_then(|p| p.long_description.clone().or_else(|| p.short_description.clone()))
        .unwrap_or_else(|| persona.to_string());

    info!(persona, "description regeneration queued");
    ctx.state.queue_enqueue(QueueItem::new(
        Priority::Low,
        Request::PersonaGeneration {
            name: persona.to_string(),
            description: pitch,
        },
    ));
    Ok(())
}

// ── Ceremony: exposure → decay → expire → (explore | descriptions) ────────────

#[derive(Debug, Deserialize, Default)]
struct ExposureScan {
    #[serde(default)]
    mentioned: Vec<String>,
}

pub fn handle_ceremony_exposure(
    ctx: &mut HandlerCtx,
    persona: &str,
    value: serde_json::Value,
) -> anyhow::Result<()> {
    let scan: ExposureScan = serde_json::from_value(value).unwrap_or_default();
    let now = Utc::now();

    let mut remaining = 0usize;
    let mut expired = 0usize;
    ctx.state.persona_update(persona, |p| {
        // Exposure: topics the recent conversation touched jump to "high".
        for topic in &mut p.topics {
            if scan
                .mentioned
                .iter()
                .any(|name| name.eq_ignore_ascii_case(&topic.name))
            {
                topic.exposure_current = 0.8;
                topic.last_updated = now;
            }
        }
        // Decay: everything cools by the hours since it was last touched.
        for topic in &mut p.topics {
            topic.exposure_current =
                levels::decay_since(topic.exposure_current, topic.last_updated, now);
            topic.last_updated = now;
        }
        // Expire: cold and unwanted topics go.
        let before = p.topics.len();
        p.topics
            .retain(|t| !levels::should_expire(t.exposure_current, t.exposure_desired));
        expired = before - p.topics.len();
        remaining = p.topics.len();
    })?;

    info!(persona, expired, remaining, "ceremony exposure/decay/expire done");
    ctx.emit(ProcessorEvent::PersonaUpdated(persona.to_string()));

    let next = if remaining < LOW_TOPIC_THRESHOLD {
        Request::PersonaExplore {
            persona: persona.to_string(),
        }
    } else {
        Request::DescriptionCheck {
            persona: persona.to_string(),
        }
    };
    ctx.state.queue_enqueue(QueueItem::new(Priority::Low, next));
    Ok(())
}

// ── Hourly decay tick ─────────────────────────────────────────────────────────

/// System-wide decay: human topics and people, plus every persona's topics.
/// Runs on the scheduler's hourly tick, not inside any ceremony.
pub fn apply_decay_tick(state: &mut StateManager) {
    let now = Utc::now();

    let mut topics = state.human().topics.clone();
    for topic in &mut topics {
        topic.level_current = levels::decay_since(topic.level_current, topic.core.last_updated, now);
    }
    for topic in topics {
        state.human_topic_upsert(topic);
    }

    let mut people = state.human().people.clone();
    for person in &mut people {
        person.level_current =
            levels::decay_since(person.level_current, person.core.last_updated, now);
    }
    for person in people {
        state.human_person_upsert(person);
    }

    let names: Vec<String> = state
        .persona_list(true)
        .iter()
        .map(|p| p.name.clone())
        .collect();
    for name in names {
        let _ = state.persona_update(&name, |p| {
            for topic in &mut p.topics {
                topic.exposure_current =
                    levels::decay_since(topic.exposure_current, topic.last_updated, now);
                topic.last_updated = now;
            }
        });
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
