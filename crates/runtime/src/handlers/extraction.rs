//! The three-step extraction pipeline: blind scan → match → update, plus the
//! frequency gate that decides when a scan is worth an LLM call.

use std::collections::HashMap;

use serde::Deserialize;
use serde_json::json;
use tracing::{debug, info, warn};
use uuid::Uuid;

use ei_state::levels;
use ei_state::schema::{
    DataKind, Fact, ItemCore, Person, Priority, Quote, QuoteOrigin, QueueItem, Request, Role,
    Speaker, Topic, TraitItem, Validation,
};
use ei_state::{DataRecord, is_global_write};

use crate::handlers::{EmbedTask, HandlerCtx};

/// Most messages a single scan will look at.
const SCAN_CHUNK_LIMIT: usize = 20;

// ── Frequency gate ────────────────────────────────────────────────────────────

/// Per (persona × kind) extraction counters.
///
/// Facts and traits saturate over time, so their scans are gated: until the
/// first extraction of a type there is no "last extract" to measure from and
/// every pair qualifies; after that the type needs
/// `messages_since >= max(floor, total_extractions)` — sparser the richer
/// the record gets. Topics and people qualify on every message pair.
#[derive(Debug, Default)]
pub struct ExtractionGate {
    messages_since: HashMap<(String, DataKind), u32>,
    totals: HashMap<(String, DataKind), u32>,
}

impl ExtractionGate {
    pub fn note_human_message(&mut self, persona: &str) {
        for kind in DataKind::EXTRACTABLE {
            *self
                .messages_since
                .entry((persona.to_ascii_lowercase(), kind))
                .or_insert(0) += 1;
        }
    }

    pub fn should_extract(&self, persona: &str, kind: DataKind, floor: u32) -> bool {
        match kind {
            DataKind::Topic | DataKind::Person => true,
            DataKind::Fact | DataKind::Trait => {
                let key = (persona.to_ascii_lowercase(), kind);
                let total = self.totals.get(&key).copied().unwrap_or(0);
                if total == 0 {
                    return true;
                }
                let since = self.messages_since.get(&key).copied().unwrap_or(0);
                since >= floor.max(total)
            }
            DataKind::Quote => false,
        }
    }

    pub fn note_extraction(&mut self, persona: &str, kind: DataKind) {
        let key = (persona.to_ascii_lowercase(), kind);
        self.messages_since.insert(key.clone(), 0);
        *self.totals.entry(key).or_insert(0) += 1;
    }
}

/// On message-pair closure: enqueue a Step-1 scan per qualifying data kind.
pub fn enqueue_extraction_scans(ctx: &mut HandlerCtx, persona: &str) {
    let floor = ctx.config.runtime.extraction_floor;
    for kind in DataKind::EXTRACTABLE {
        if !ctx.gate.should_extract(persona, kind, floor) {
            continue;
        }
        let message_ids: Vec<Uuid> = ctx
            .state
            .messages_unextracted(persona, kind, Some(SCAN_CHUNK_LIMIT))
            .iter()
            .map(|m| m.id)
            .collect();
        if message_ids.is_empty() {
            continue;
        }
        debug!(persona, kind = kind.label(), chunk = message_ids.len(), "scan queued");
        ctx.gate.note_extraction(persona, kind);
        ctx.state.queue_enqueue(QueueItem::new(
            Priority::Low,
            Request::FastScan {
                persona: persona.to_string(),
                kind,
                message_ids,
            },
        ));
    }
}

// ── Step 1: scan ──────────────────────────────────────────────────────────────

#[derive(Debug, Deserialize, Default)]
struct ScanResult {
    #[serde(default)]
    mentioned: Vec<String>,
    #[serde(default)]
    new_items: Vec<ScanCandidate>,
}

#[derive(Debug, Deserialize, Clone)]
struct ScanCandidate {
    name: String,
    #[serde(default)]
    value: Option<String>,
    #[serde(default)]
    confidence: Option<String>,
}

pub fn handle_fast_scan(
    ctx: &mut HandlerCtx,
    persona: &str,
    kind: DataKind,
    message_ids: &[Uuid],
    value: serde_json::Value,
) -> anyhow::Result<()> {
    let result: ScanResult = serde_json::from_value(value).unwrap_or_default();

    // Persona names must never become people (or anything else).
    let persona_names: Vec<String> = ctx
        .state
        .persona_list(true)
        .iter()
        .flat_map(|p| {
            std::iter::once(p.name.to_ascii_lowercase())
                .chain(p.aliases.iter().map(|a| a.to_ascii_lowercase()))
        })
        .collect();
    let candidates: Vec<ScanCandidate> = result
        .new_items
        .into_iter()
        .filter(|c| !persona_names.contains(&c.name.to_ascii_lowercase()))
        .collect();
    let mentioned: Vec<String> = result
        .mentioned
        .into_iter()
        .filter(|n| !persona_names.contains(&n.to_ascii_lowercase()))
        .collect();

    if candidates.is_empty() && mentioned.is_empty() {
        // Confident "nothing here": this chunk is done for this kind.
        ctx.state.messages_mark_extracted(persona, message_ids, kind)?;
        return Ok(());
    }

    for candidate in &candidates {
        let confidence = candidate
            .confidence
            .as_deref()
            .unwrap_or("medium")
            .to_ascii_lowercase();
        let payload = json!({
            "name": candidate.name,
            "value": candidate.value,
            "confidence": confidence,
        });
        if confidence == "low" {
            debug!(persona, name = %candidate.name, "low-confidence candidate parked for validation");
            ctx.state.queue_enqueue(QueueItem::new(
                Priority::Low,
                Request::EiValidation {
                    kind,
                    item_id: None,
                    summary: format!(
                        "{}: {} — {}",
                        kind.label(),
                        candidate.name,
                        candidate.value.as_deref().unwrap_or("(no detail)")
                    ),
                    proposed_by: persona.to_string(),
                    candidate: Some(payload),
                },
            ));
        } else {
            ctx.state.queue_enqueue(QueueItem::new(
                Priority::Low,
                Request::ItemMatch {
                    persona: persona.to_string(),
                    kind,
                    candidate: payload,
                    message_ids: message_ids.to_vec(),
                },
            ));
        }
    }

    // Known items that merely came up again skip Step 2.
    for name in &mentioned {
        if candidates
            .iter()
            .any(|c| c.name.eq_ignore_ascii_case(name))
        {
            continue;
        }
        if let Some(existing_id) = find_item_id_by_name(ctx, kind, name) {
            ctx.state.queue_enqueue(QueueItem::new(
                Priority::Low,
                Request::ItemUpdate {
                    persona: persona.to_string(),
                    kind,
                    existing_id: Some(existing_id),
                    candidate: json!({ "name": name }),
                    message_ids: message_ids.to_vec(),
                },
            ));
        }
    }

    Ok(())
}

fn find_item_id_by_name(ctx: &HandlerCtx, kind: DataKind, name: &str) -> Option<Uuid> {
    let human = ctx.state.human();
    let matches = |core: &ItemCore| core.name.eq_ignore_ascii_case(name);
    match kind {
        DataKind::Fact => human.facts.iter().find(|i| matches(i.core())).map(|i| i.id()),
        DataKind::Trait => human.traits.iter().find(|i| matches(i.core())).map(|i| i.id()),
        DataKind::Topic => human.topics.iter().find(|i| matches(i.core())).map(|i| i.id()),
        DataKind::Person => human.people.iter().find(|i| matches(i.core())).map(|i| i.id()),
        DataKind::Quote => None,
    }
}

// ── Step 2: match ─────────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct MatchResult {
    #[serde(default)]
    match_id: Option<String>,
    #[serde(default)]
    confidence: Option<f32>,
}

pub fn handle_item_match(
    ctx: &mut HandlerCtx,
    persona: &str,
    kind: DataKind,
    candidate: &serde_json::Value,
    message_ids: &[Uuid],
    value: serde_json::Value,
) -> anyhow::Result<()> {
    let result: MatchResult = serde_json::from_value(value)
        .map_err(|err| anyhow::anyhow!("match result: {err}"))?;

    // Only accept ids that actually exist; a hallucinated id means "new".
    let existing_id = result
        .match_id
        .as_deref()
        .and_then(|raw| raw.parse::<Uuid>().ok())
        .filter(|id| find_item_exists(ctx, kind, *id));

    debug!(
        persona,
        kind = kind.label(),
        matched = existing_id.is_some(),
        confidence = result.confidence.unwrap_or(0.0),
        "match step resolved"
    );

    ctx.state.queue_enqueue(QueueItem::new(
        Priority::Low,
        Request::ItemUpdate {
            persona: persona.to_string(),
            kind,
            existing_id,
            candidate: candidate.clone(),
            message_ids: message_ids.to_vec(),
        },
    ));
    Ok(())
}

fn find_item_exists(ctx: &HandlerCtx, kind: DataKind, id: Uuid) -> bool {
    let human = ctx.state.human();
    match kind {
        DataKind::Fact => human.facts.iter().any(|i| i.id() == id),
        DataKind::Trait => human.traits.iter().any(|i| i.id() == id),
        DataKind::Topic => human.topics.iter().any(|i| i.id() == id),
        DataKind::Person => human.people.iter().any(|i| i.id() == id),
        DataKind::Quote => false,
    }
}

// ── Step 3: update ────────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct UpdateResult {
    name: String,
    #[serde(default)]
    description: String,
    #[serde(default)]
    sentiment: f32,
    #[serde(default)]
    confidence: Option<f32>,
    #[serde(default)]
    strength: Option<f32>,
    #[serde(default)]
    relationship: Option<String>,
    #[serde(default)]
    exposure_impact: Option<String>,
    #[serde(default)]
    level_ideal: Option<f32>,
    #[serde(default)]
    quotes: Vec<QuoteCandidate>,
}

#[derive(Debug, Deserialize)]
struct QuoteCandidate {
    text: String,
    #[serde(default)]
    #[allow(dead_code)]
    reason: Option<String>,
}

pub fn handle_item_update(
    ctx: &mut HandlerCtx,
    persona_name: &str,
    kind: DataKind,
    existing_id: Option<Uuid>,
    message_ids: &[Uuid],
    value: serde_json::Value,
) -> anyhow::Result<()> {
    let update: UpdateResult = serde_json::from_value(value)
        .map_err(|err| anyhow::anyhow!("update result: {err}"))?;

    let persona = ctx
        .state
        .persona_get(persona_name)
        .ok_or_else(|| anyhow::anyhow!("unknown persona {persona_name}"))?;
    let persona_is_ei = persona.is_ei();
    let default_groups: Vec<String> = persona
        .group_primary
        .clone()
        .map(|g| vec![g])
        .unwrap_or_default();

    let (item_id, item_groups, text_changed) = match kind {
        DataKind::Fact => {
            let existing = existing_id
                .and_then(|id| ctx.state.human().facts.iter().find(|f| f.id() == id))
                .cloned();
            let mut fact = existing.unwrap_or_else(|| Fact {
                core: new_core(&update, persona_name, &default_groups),
                confidence: 0.5,
                validated: Validation::None,
                validated_date: None,
            });
            let changed = apply_core(&mut fact.core, &update);
            if let Some(confidence) = update.confidence {
                fact.confidence = levels::clamp_unit(confidence);
            }
            let out = (fact.id(), fact.core.persona_groups.clone(), changed);
            ctx.state.human_fact_upsert(fact);
            out
        }
        DataKind::Trait => {
            let existing = existing_id
                .and_then(|id| ctx.state.human().traits.iter().find(|t| t.id() == id))
                .cloned();
            let mut item = existing.unwrap_or_else(|| TraitItem {
                core: new_core(&update, persona_name, &default_groups),
                strength: None,
            });
            let changed = apply_core(&mut item.core, &update);
            if let Some(strength) = update.strength {
                item.strength = Some(levels::clamp_unit(strength));
            }
            let out = (item.id(), item.core.persona_groups.clone(), changed);
            ctx.state.human_trait_upsert(item);
            out
        }
        DataKind::Topic => {
            let existing = existing_id
                .and_then(|id| ctx.state.human().topics.iter().find(|t| t.id() == id))
                .cloned();
            let mut topic = existing.unwrap_or_else(|| Topic {
                core: new_core(&update, persona_name, &default_groups),
                level_current: 0.0,
                level_ideal: 0.5,
            });
            let changed = apply_core(&mut topic.core, &update);
            apply_levels(
                &mut topic.level_current,
                &mut topic.level_ideal,
                &update,
            );
            let out = (topic.id(), topic.core.persona_groups.clone(), changed);
            ctx.state.human_topic_upsert(topic);
            out
        }
        DataKind::Person => {
            let existing = existing_id
                .and_then(|id| ctx.state.human().people.iter().find(|p| p.id() == id))
                .cloned();
            let mut person = existing.unwrap_or_else(|| Person {
                core: new_core(&update, persona_name, &default_groups),
                relationship: String::new(),
                level_current: 0.0,
                level_ideal: 0.5,
            });
            let changed = apply_core(&mut person.core, &update);
            if let Some(relationship) = &update.relationship {
                person.relationship = relationship.clone();
            }
            apply_levels(
                &mut person.level_current,
                &mut person.level_ideal,
                &update,
            );
            let out = (person.id(), person.core.persona_groups.clone(), changed);
            ctx.state.human_person_upsert(person);
            out
        }
        DataKind::Quote => anyhow::bail!("quotes are not extracted directly"),
    };

    info!(
        persona = persona_name,
        kind = kind.label(),
        item = %item_id,
        new = existing_id.is_none(),
        "item updated"
    );

    // A global write by a non-Ei persona needs the human's sign-off.
    if is_global_write(&item_groups) && !persona_is_ei {
        ctx.state.queue_enqueue(QueueItem::new(
            Priority::Low,
            Request::EiValidation {
                kind,
                item_id: Some(item_id),
                summary: format!("{}: {} (shared with everyone)", kind.label(), update.name),
                proposed_by: persona_name.to_string(),
                candidate: None,
            },
        ));
    }

    store_quotes(ctx, persona_name, item_id, &item_groups, message_ids, &update.quotes);

    ctx.state
        .messages_mark_extracted(persona_name, message_ids, kind)?;

    if text_changed {
        ctx.pending_embeds.push(EmbedTask {
            kind,
            item_id,
            text: format!("{} {}", update.name, update.description),
        });
    }

    Ok(())
}

fn new_core(update: &UpdateResult, persona_name: &str, groups: &[String]) -> ItemCore {
    let mut core = ItemCore::new(update.name.clone(), update.description.clone());
    core.learned_by = Some(persona_name.to_string());
    core.persona_groups = groups.to_vec();
    core
}

/// Returns true when name or description actually changed (embedding must be
/// recomputed).
fn apply_core(core: &mut ItemCore, update: &UpdateResult) -> bool {
    let changed = core.name != update.name || core.description != update.description;
    core.name = update.name.clone();
    core.description = update.description.clone();
    core.sentiment = levels::clamp_sentiment(update.sentiment);
    changed
}

fn apply_levels(current: &mut f32, ideal: &mut f32, update: &UpdateResult) {
    if let Some(label) = update.exposure_impact.as_deref() {
        if let Some(mapped) = levels::exposure_label_value(label) {
            // Labels replace the level; they never compose with it.
            *current = mapped;
        }
    }
    if let Some(wanted) = update.level_ideal {
        *ideal = levels::clamp_unit(wanted);
    }
}

/// Verify each quote candidate by exact substring search over the analyzed
/// messages. Paraphrases find nothing and are discarded.
fn store_quotes(
    ctx: &mut HandlerCtx,
    persona_name: &str,
    item_id: Uuid,
    item_groups: &[String],
    message_ids: &[Uuid],
    candidates: &[QuoteCandidate],
) {
    for candidate in candidates {
        let text = candidate.text.trim();
        if text.is_empty() {
            continue;
        }

        let located = message_ids.iter().find_map(|id| {
            let message = ctx.state.message_get(persona_name, *id)?;
            let byte_start = message.content.find(text)?;
            // Stored positions are character offsets; find() returns bytes.
            let start = message.content[..byte_start].chars().count();
            Some((message.id, message.role, message.timestamp, start))
        });

        let Some((message_id, role, timestamp, start)) = located else {
            warn!(persona = persona_name, "quote not found verbatim — discarded");
            continue;
        };

        let quote = Quote {
            id: Uuid::new_v4(),
            message_id,
            data_item_ids: vec![item_id],
            persona_groups: item_groups.to_vec(),
            text: text.to_string(),
            speaker: match role {
                Role::Human => Speaker::human(),
                Role::System => Speaker::Persona(persona_name.to_string()),
            },
            timestamp,
            start: Some(start),
            end: Some(start + text.chars().count()),
            created_at: chrono::Utc::now(),
            created_by: QuoteOrigin::Extraction,
        };
        ctx.state.human_quote_add(quote);
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
