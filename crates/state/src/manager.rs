//! `StateManager` — the in-memory authoritative state.
//!
//! All mutation flows through the methods here: they stamp `last_updated`,
//! enforce the invariants (alias uniqueness, archived-only removal, slot
//! budgets, queue/restore interaction), and keep the queue ordered. Callers
//! never hold `&mut` into the state across a suspension point; they re-read
//! through the manager after every await.

use chrono::Utc;
use serde_json::json;
use tracing::{debug, info, warn};
use uuid::Uuid;

use ei_storage::{CheckpointRecord, StorageBackend};

use crate::StateError;
use crate::schema::{
    AUTO_SLOTS, CheckpointKind, CheckpointMeta, DataKind, DataRecord, Fact, FullState,
    HumanEntity, HumanSettings, MANUAL_SLOTS, Message, Person, PersonaEntity, Priority, Quote,
    QueueItem, Request, Role, STATE_VERSION, Topic, TraitItem,
};

/// Default attempts before a failing queue item is dropped. Tunable per
/// installation via [`StateManager::set_queue_attempt_cap`].
pub const MAX_ATTEMPTS: u32 = 3;

/// Result of `queue_fail`: the item either stays queued for another attempt
/// or has exhausted its budget and is gone.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailOutcome {
    Retained { attempts: u32 },
    Dropped,
}

/// What a checkpoint captures: everything except the live queue and the
/// checkpoint registry itself.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
struct CheckpointBlob {
    version: u32,
    human: HumanEntity,
    personas: std::collections::BTreeMap<String, PersonaEntity>,
    messages: std::collections::BTreeMap<String, Vec<Message>>,
    settings: HumanSettings,
}

#[derive(Debug)]
pub struct StateManager {
    state: FullState,
    attempt_cap: u32,
}

impl Default for StateManager {
    fn default() -> Self {
        Self {
            state: FullState::default(),
            attempt_cap: MAX_ATTEMPTS,
        }
    }
}

impl StateManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Attempts a queue item gets before `queue_fail` drops it. Applied from
    /// the runtime config at startup.
    pub fn set_queue_attempt_cap(&mut self, cap: u32) {
        self.attempt_cap = cap.max(1);
    }

    pub fn queue_attempt_cap(&self) -> u32 {
        self.attempt_cap
    }

    /// Load persisted state or seed the defaults (empty human, default Ei
    /// persona with primary group "General" and wildcard visibility).
    pub async fn initialize(storage: &dyn StorageBackend) -> Result<Self, StateError> {
        match storage.load().await? {
            Some(blob) => {
                let state: FullState = serde_json::from_value(blob)
                    .map_err(|err| StateError::Invariant(format!("state blob: {err}")))?;
                info!(
                    personas = state.personas.len(),
                    queued = state.queue.items.len(),
                    "state loaded"
                );
                Ok(Self {
                    state,
                    attempt_cap: MAX_ATTEMPTS,
                })
            }
            None => {
                info!("no persisted state — seeding defaults");
                Ok(Self::new())
            }
        }
    }

    pub async fn persist(&self, storage: &dyn StorageBackend) -> Result<(), StateError> {
        let blob = serde_json::to_value(&self.state)
            .map_err(|err| StateError::Invariant(format!("serialize state: {err}")))?;
        storage.save(&blob).await?;
        Ok(())
    }

    // ── Human ─────────────────────────────────────────────────────────────────

    pub fn human(&self) -> &HumanEntity {
        &self.state.human
    }

    fn touch_human(&mut self) {
        self.state.human.last_updated = Some(Utc::now());
    }

    pub fn human_fact_upsert(&mut self, mut fact: Fact) {
        fact.confidence = crate::levels::clamp_unit(fact.confidence);
        Self::normalize_core(fact.core_mut());
        upsert_by_id(&mut self.state.human.facts, fact);
        self.touch_human();
    }

    pub fn human_trait_upsert(&mut self, mut item: TraitItem) {
        item.strength = item.strength.map(crate::levels::clamp_unit);
        Self::normalize_core(item.core_mut());
        upsert_by_id(&mut self.state.human.traits, item);
        self.touch_human();
    }

    pub fn human_topic_upsert(&mut self, mut topic: Topic) {
        topic.level_current = crate::levels::clamp_unit(topic.level_current);
        topic.level_ideal = crate::levels::clamp_unit(topic.level_ideal);
        Self::normalize_core(topic.core_mut());
        upsert_by_id(&mut self.state.human.topics, topic);
        self.touch_human();
    }

    pub fn human_person_upsert(&mut self, mut person: Person) {
        person.level_current = crate::levels::clamp_unit(person.level_current);
        person.level_ideal = crate::levels::clamp_unit(person.level_ideal);
        Self::normalize_core(person.core_mut());
        upsert_by_id(&mut self.state.human.people, person);
        self.touch_human();
    }

    fn normalize_core(core: &mut crate::schema::ItemCore) {
        core.sentiment = crate::levels::clamp_sentiment(core.sentiment);
        core.last_updated = Utc::now();
    }

    pub fn human_fact_remove(&mut self, id: Uuid) -> Result<(), StateError> {
        remove_by_id(&mut self.state.human.facts, id)?;
        self.touch_human();
        Ok(())
    }

    pub fn human_trait_remove(&mut self, id: Uuid) -> Result<(), StateError> {
        remove_by_id(&mut self.state.human.traits, id)?;
        self.touch_human();
        Ok(())
    }

    pub fn human_topic_remove(&mut self, id: Uuid) -> Result<(), StateError> {
        remove_by_id(&mut self.state.human.topics, id)?;
        self.touch_human();
        Ok(())
    }

    pub fn human_person_remove(&mut self, id: Uuid) -> Result<(), StateError> {
        remove_by_id(&mut self.state.human.people, id)?;
        self.touch_human();
        Ok(())
    }

    /// Add a quote unless an identical span of the same message is already
    /// stored. Returns `false` when skipped as a duplicate.
    pub fn human_quote_add(&mut self, quote: Quote) -> bool {
        let duplicate = self.state.human.quotes.iter().any(|q| {
            q.message_id == quote.message_id && q.start == quote.start && q.end == quote.end
        });
        if duplicate {
            debug!(message = %quote.message_id, "duplicate quote span skipped");
            return false;
        }
        self.state.human.quotes.push(quote);
        self.touch_human();
        true
    }

    pub fn human_quote_update(&mut self, quote: Quote) -> Result<(), StateError> {
        let slot = self
            .state
            .human
            .quotes
            .iter_mut()
            .find(|q| q.id == quote.id)
            .ok_or_else(|| StateError::NotFound(quote.id.to_string()))?;
        *slot = quote;
        self.touch_human();
        Ok(())
    }

    pub fn human_quote_remove(&mut self, id: Uuid) -> Result<(), StateError> {
        let before = self.state.human.quotes.len();
        self.state.human.quotes.retain(|q| q.id != id);
        if self.state.human.quotes.len() == before {
            return Err(StateError::NotFound(id.to_string()));
        }
        self.touch_human();
        Ok(())
    }

    // ── Settings ──────────────────────────────────────────────────────────────

    pub fn settings(&self) -> &HumanSettings {
        &self.state.settings
    }

    pub fn settings_update(&mut self, apply: impl FnOnce(&mut HumanSettings)) {
        apply(&mut self.state.settings);
        self.touch_human();
    }

    // ── Personas ──────────────────────────────────────────────────────────────

    pub fn persona_list(&self, include_archived: bool) -> Vec<&PersonaEntity> {
        self.state
            .personas
            .values()
            .filter(|p| include_archived || !p.is_archived)
            .collect()
    }

    pub fn persona_get(&self, name_or_alias: &str) -> Option<&PersonaEntity> {
        self.state
            .personas
            .values()
            .find(|p| p.matches_name(name_or_alias))
    }

    pub fn persona_add(&mut self, persona: PersonaEntity) -> Result<(), StateError> {
        for alias in persona.aliases.iter().chain(std::iter::once(&persona.name)) {
            if let Some(existing) = self.persona_get(alias) {
                if existing.id != persona.id {
                    return Err(StateError::Invariant(format!(
                        "alias '{alias}' already belongs to persona '{}'",
                        existing.name
                    )));
                }
            }
        }
        self.state.messages.entry(persona.name.clone()).or_default();
        info!(persona = %persona.name, "persona added");
        self.state.personas.insert(persona.name.clone(), persona);
        Ok(())
    }

    /// Mutate a persona in place; stamps `last_updated`. Alias collisions
    /// introduced by the mutation are rejected and the change rolled back.
    pub fn persona_update(
        &mut self,
        name: &str,
        apply: impl FnOnce(&mut PersonaEntity),
    ) -> Result<(), StateError> {
        let key = self
            .persona_get(name)
            .map(|p| p.name.clone())
            .ok_or_else(|| StateError::NotFound(name.to_string()))?;

        let mut updated = self.state.personas[&key].clone();
        apply(&mut updated);
        updated.last_updated = Utc::now();

        if updated.name != key {
            // Renames would orphan the message thread and every `learned_by`
            // reference; identity stays uuid + aliases instead.
            return Err(StateError::Invariant(
                "persona rename is not supported; add an alias instead".to_string(),
            ));
        }

        for alias in &updated.aliases {
            if let Some(other) = self.persona_get(alias) {
                if other.id != updated.id {
                    return Err(StateError::Invariant(format!(
                        "alias '{alias}' already belongs to persona '{}'",
                        other.name
                    )));
                }
            }
        }

        self.state.personas.insert(key, updated);
        Ok(())
    }

    /// Remove a persona and its thread. Only archived personas may go.
    pub fn persona_remove(&mut self, name: &str) -> Result<PersonaEntity, StateError> {
        let key = self
            .persona_get(name)
            .map(|p| p.name.clone())
            .ok_or_else(|| StateError::NotFound(name.to_string()))?;
        if !self.state.personas[&key].is_archived {
            return Err(StateError::Invariant(format!(
                "persona '{key}' must be archived before deletion"
            )));
        }
        self.state.messages.remove(&key);
        let removed = self
            .state
            .personas
            .remove(&key)
            .ok_or_else(|| StateError::NotFound(key.clone()))?;
        info!(persona = %key, "persona removed");
        Ok(removed)
    }

    pub fn persona_archive(&mut self, name: &str) -> Result<(), StateError> {
        self.persona_update(name, |p| {
            p.is_archived = true;
            p.archived_date = Some(Utc::now());
        })
    }

    pub fn persona_unarchive(&mut self, name: &str) -> Result<(), StateError> {
        self.persona_update(name, |p| {
            p.is_archived = false;
            p.archived_date = None;
        })
    }

    pub fn persona_pause(
        &mut self,
        name: &str,
        until: Option<chrono::DateTime<Utc>>,
    ) -> Result<(), StateError> {
        self.persona_update(name, |p| {
            p.is_paused = true;
            p.pause_until = until;
        })
    }

    pub fn persona_unpause(&mut self, name: &str) -> Result<(), StateError> {
        self.persona_update(name, |p| {
            p.is_paused = false;
            p.pause_until = None;
        })
    }

    // ── Messages ──────────────────────────────────────────────────────────────

    pub fn messages(&self, persona: &str) -> &[Message] {
        self.persona_get(persona)
            .and_then(|p| self.state.messages.get(&p.name))
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    pub fn message_get(&self, persona: &str, id: Uuid) -> Option<&Message> {
        self.messages(persona).iter().find(|m| m.id == id)
    }

    pub fn messages_append(&mut self, persona: &str, message: Message) -> Result<Uuid, StateError> {
        let key = self
            .persona_get(persona)
            .map(|p| p.name.clone())
            .ok_or_else(|| StateError::NotFound(persona.to_string()))?;
        let id = message.id;
        self.state.messages.entry(key).or_default().push(message);
        Ok(id)
    }

    pub fn messages_set_status(
        &mut self,
        persona: &str,
        id: Uuid,
        status: crate::schema::ContextStatus,
    ) -> Result<(), StateError> {
        let message = self
            .thread_mut(persona)?
            .iter_mut()
            .find(|m| m.id == id)
            .ok_or_else(|| StateError::NotFound(id.to_string()))?;
        message.context_status = status;
        Ok(())
    }

    pub fn messages_set_read(&mut self, persona: &str, ids: &[Uuid]) -> Result<(), StateError> {
        let thread = self.thread_mut(persona)?;
        for message in thread.iter_mut() {
            if ids.contains(&message.id) {
                message.read = true;
            }
        }
        Ok(())
    }

    pub fn messages_mark_all_read(&mut self, persona: &str) -> Result<(), StateError> {
        for message in self.thread_mut(persona)? {
            message.read = true;
        }
        Ok(())
    }

    pub fn messages_delete(&mut self, persona: &str, ids: &[Uuid]) -> Result<(), StateError> {
        let thread = self.thread_mut(persona)?;
        thread.retain(|m| !ids.contains(&m.id));
        Ok(())
    }

    /// Messages not yet extracted for `kind`, oldest first.
    pub fn messages_unextracted(
        &self,
        persona: &str,
        kind: DataKind,
        limit: Option<usize>,
    ) -> Vec<&Message> {
        let iter = self
            .messages(persona)
            .iter()
            .filter(|m| !m.extracted(kind));
        match limit {
            Some(n) => iter.take(n).collect(),
            None => iter.collect(),
        }
    }

    pub fn messages_mark_extracted(
        &mut self,
        persona: &str,
        ids: &[Uuid],
        kind: DataKind,
    ) -> Result<(), StateError> {
        let thread = self.thread_mut(persona)?;
        for message in thread.iter_mut() {
            if ids.contains(&message.id) {
                message.set_extracted(kind);
            }
        }
        Ok(())
    }

    /// Remove every trailing unanswered human message (recall). Returns the
    /// removed messages in insertion order.
    pub fn messages_clear_pending(&mut self, persona: &str) -> Result<Vec<Message>, StateError> {
        let thread = self.thread_mut(persona)?;
        let first_pending = thread
            .iter()
            .rposition(|m| m.role == Role::System)
            .map(|i| i + 1)
            .unwrap_or(0);
        Ok(thread.split_off(first_pending))
    }

    fn thread_mut(&mut self, persona: &str) -> Result<&mut Vec<Message>, StateError> {
        let key = self
            .persona_get(persona)
            .map(|p| p.name.clone())
            .ok_or_else(|| StateError::NotFound(persona.to_string()))?;
        Ok(self.state.messages.entry(key).or_default())
    }

    // ── Queue ─────────────────────────────────────────────────────────────────

    pub fn queue_enqueue(&mut self, item: QueueItem) -> Uuid {
        let id = item.id;
        debug!(item = %id, step = item.request.label(), priority = ?item.priority, "enqueued");
        self.state.queue.items.push(item);
        id
    }

    /// Highest-priority runnable item: priority desc, then FIFO by
    /// `created_at`. Parked validation records are never returned.
    pub fn queue_peek_highest(&self) -> Option<&QueueItem> {
        self.queue_peek_highest_where(|_| true)
    }

    /// Like [`queue_peek_highest`](Self::queue_peek_highest) but skipping
    /// items the predicate rejects (e.g. items inside a rate-limit backoff
    /// window).
    pub fn queue_peek_highest_where(
        &self,
        runnable: impl Fn(&QueueItem) -> bool,
    ) -> Option<&QueueItem> {
        self.state
            .queue
            .items
            .iter()
            .filter(|i| !i.request.is_parked() && runnable(i))
            .max_by(|a, b| {
                a.priority
                    .cmp(&b.priority)
                    .then(b.created_at.cmp(&a.created_at))
                    .then(b.id.cmp(&a.id))
            })
    }

    pub fn queue_get(&self, id: Uuid) -> Option<&QueueItem> {
        self.state.queue.items.iter().find(|i| i.id == id)
    }

    pub fn queue_mark_attempt(&mut self, id: Uuid) {
        if let Some(item) = self.state.queue.items.iter_mut().find(|i| i.id == id) {
            item.attempts += 1;
            item.last_attempt = Some(Utc::now());
        }
    }

    pub fn queue_complete(&mut self, id: Uuid) -> Result<(), StateError> {
        let before = self.state.queue.items.len();
        self.state.queue.items.retain(|i| i.id != id);
        if self.state.queue.items.len() == before {
            return Err(StateError::NotFound(id.to_string()));
        }
        Ok(())
    }

    /// Record a failure. The item stays queued until its attempt budget is
    /// exhausted, then it is dropped with a dead-letter log line.
    pub fn queue_fail(&mut self, id: Uuid, error: &str) -> FailOutcome {
        let Some(pos) = self.state.queue.items.iter().position(|i| i.id == id) else {
            return FailOutcome::Dropped;
        };
        let item = &mut self.state.queue.items[pos];
        if item.attempts >= self.attempt_cap {
            let dropped = self.state.queue.items.remove(pos);
            warn!(
                item = %dropped.id,
                step = dropped.request.label(),
                attempts = dropped.attempts,
                error,
                "queue item dropped after exhausting attempts"
            );
            FailOutcome::Dropped
        } else {
            debug!(item = %id, attempts = item.attempts, error, "queue item failed — will retry");
            FailOutcome::Retained {
                attempts: item.attempts,
            }
        }
    }

    pub fn queue_pause(&mut self) {
        self.state.queue.paused = true;
    }

    pub fn queue_resume(&mut self) {
        self.state.queue.paused = false;
    }

    pub fn queue_is_paused(&self) -> bool {
        self.state.queue.paused
    }

    pub fn queue_len(&self) -> usize {
        self.state.queue.items.len()
    }

    pub fn queue_clear(&mut self) {
        self.state.queue.items.retain(|i| i.request.is_parked());
    }

    /// Drop every queued request touching `persona`. Parked validation
    /// records survive; they belong to Ei's ceremony, not the persona's work.
    pub fn queue_clear_for(&mut self, persona: &str) {
        self.state.queue.items.retain(|i| {
            i.request.is_parked()
                || i.request
                    .persona()
                    .is_none_or(|p| !p.eq_ignore_ascii_case(persona))
        });
    }

    /// Drop queued (not yet started) response requests for a persona — a new
    /// human message supersedes them.
    pub fn queue_supersede_responses(&mut self, persona: &str, except: Option<Uuid>) {
        self.state.queue.items.retain(|i| {
            if except == Some(i.id) {
                return true;
            }
            !matches!(&i.request, Request::PersonaResponse { persona: p, .. }
                if p.eq_ignore_ascii_case(persona))
        });
    }

    pub fn queue_validations(&self) -> Vec<&QueueItem> {
        self.state
            .queue
            .items
            .iter()
            .filter(|i| i.request.is_parked())
            .collect()
    }

    /// Remove and return up to `max` pending validation records, oldest first.
    pub fn queue_take_validations(&mut self, max: usize) -> Vec<QueueItem> {
        let mut taken = Vec::new();
        let mut kept = Vec::with_capacity(self.state.queue.items.len());
        let mut items = std::mem::take(&mut self.state.queue.items);
        items.sort_by_key(|i| i.created_at);
        for item in items {
            if item.request.is_parked() && taken.len() < max {
                taken.push(item);
            } else {
                kept.push(item);
            }
        }
        self.state.queue.items = kept;
        taken
    }

    // ── Checkpoints ───────────────────────────────────────────────────────────

    pub fn checkpoint_list(&self) -> &[CheckpointMeta] {
        &self.state.checkpoints
    }

    /// Create a checkpoint. Auto checkpoints rotate through slots 0–9 (the
    /// oldest is evicted); manual ones take the requested slot in 10–14, or
    /// the first free one, failing with `CheckpointFull` when all five are
    /// occupied.
    pub async fn checkpoint_create(
        &mut self,
        storage: &dyn StorageBackend,
        slot: Option<u8>,
        name: Option<String>,
        kind: CheckpointKind,
    ) -> Result<CheckpointMeta, StateError> {
        let slot = match kind {
            CheckpointKind::Auto => {
                let taken: Vec<u8> = self
                    .state
                    .checkpoints
                    .iter()
                    .filter(|c| c.kind == CheckpointKind::Auto)
                    .map(|c| c.slot)
                    .collect();
                match AUTO_SLOTS.clone().find(|s| !taken.contains(s)) {
                    Some(free) => free,
                    None => {
                        // All auto slots taken — evict the oldest.
                        let oldest = self
                            .state
                            .checkpoints
                            .iter()
                            .filter(|c| c.kind == CheckpointKind::Auto)
                            .min_by_key(|c| c.created_at)
                            .map(|c| (c.id, c.slot))
                            .ok_or_else(|| StateError::Invariant("auto slots".into()))?;
                        self.checkpoint_delete(storage, oldest.0).await?;
                        oldest.1
                    }
                }
            }
            CheckpointKind::Manual => {
                let requested = slot;
                let taken: Vec<u8> = self
                    .state
                    .checkpoints
                    .iter()
                    .filter(|c| c.kind == CheckpointKind::Manual)
                    .map(|c| c.slot)
                    .collect();
                match requested {
                    Some(s) if !MANUAL_SLOTS.contains(&s) => {
                        return Err(StateError::Invariant(format!(
                            "manual checkpoint slot {s} out of range 10–14"
                        )));
                    }
                    Some(s) if taken.contains(&s) => return Err(StateError::CheckpointFull),
                    Some(s) => s,
                    None => MANUAL_SLOTS
                        .clone()
                        .find(|s| !taken.contains(s))
                        .ok_or(StateError::CheckpointFull)?,
                }
            }
        };

        let meta = CheckpointMeta {
            id: Uuid::new_v4(),
            name: name.unwrap_or_else(|| format!("checkpoint {}", Utc::now().format("%Y-%m-%d %H:%M"))),
            slot,
            kind,
            created_at: Utc::now(),
        };

        let blob = CheckpointBlob {
            version: STATE_VERSION,
            human: self.state.human.clone(),
            personas: self.state.personas.clone(),
            messages: self.state.messages.clone(),
            settings: self.state.settings.clone(),
        };

        let record = CheckpointRecord {
            id: meta.id.to_string(),
            meta: serde_json::to_value(&meta)
                .map_err(|err| StateError::Invariant(err.to_string()))?,
            blob: serde_json::to_value(&blob)
                .map_err(|err| StateError::Invariant(err.to_string()))?,
        };
        storage.put_checkpoint(&record).await?;

        info!(checkpoint = %meta.id, slot = meta.slot, kind = ?meta.kind, "checkpoint created");
        self.state.checkpoints.push(meta.clone());
        Ok(meta)
    }

    /// Restore a checkpoint, replacing the human, personas, messages, and
    /// settings wholesale. Refused while unpaused work remains in the queue;
    /// the caller must abort in-flight work first.
    pub async fn checkpoint_restore(
        &mut self,
        storage: &dyn StorageBackend,
        id: Uuid,
    ) -> Result<(), StateError> {
        if !self.state.queue.items.is_empty() && !self.state.queue.paused {
            return Err(StateError::Invariant(
                "queue must be empty or paused before restore".to_string(),
            ));
        }
        if !self.state.checkpoints.iter().any(|c| c.id == id) {
            return Err(StateError::NotFound(id.to_string()));
        }

        let record = storage.get_checkpoint(&id.to_string()).await?;
        let blob: CheckpointBlob = serde_json::from_value(record.blob)
            .map_err(|err| StateError::Invariant(format!("checkpoint blob: {err}")))?;

        self.state.human = blob.human;
        self.state.personas = blob.personas;
        self.state.messages = blob.messages;
        self.state.settings = blob.settings;
        info!(checkpoint = %id, "checkpoint restored");
        Ok(())
    }

    pub async fn checkpoint_delete(
        &mut self,
        storage: &dyn StorageBackend,
        id: Uuid,
    ) -> Result<(), StateError> {
        let before = self.state.checkpoints.len();
        self.state.checkpoints.retain(|c| c.id != id);
        if self.state.checkpoints.len() == before {
            return Err(StateError::NotFound(id.to_string()));
        }
        storage.delete_checkpoint(&id.to_string()).await?;
        Ok(())
    }

    // ── Snapshots for frontends ───────────────────────────────────────────────

    pub fn snapshot(&self) -> serde_json::Value {
        serde_json::to_value(&self.state).unwrap_or_else(|_| json!({}))
    }
}

// ── Bucket helpers ────────────────────────────────────────────────────────────

fn upsert_by_id<T: DataRecord>(bucket: &mut Vec<T>, item: T) {
    match bucket.iter_mut().find(|existing| existing.id() == item.id()) {
        Some(slot) => *slot = item,
        None => bucket.push(item),
    }
}

fn remove_by_id<T: DataRecord>(bucket: &mut Vec<T>, id: Uuid) -> Result<(), StateError> {
    let before = bucket.len();
    bucket.retain(|item| item.id() != id);
    if bucket.len() == before {
        return Err(StateError::NotFound(id.to_string()));
    }
    Ok(())
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{ContextStatus, ItemCore, Validation};
    use ei_storage::MemoryStorage;

    fn manager_with_persona(name: &str) -> StateManager {
        let mut manager = StateManager::new();
        manager
            .persona_add(PersonaEntity::new(name))
            .expect("persona added");
        manager
    }

    #[test]
    fn seeds_default_ei() {
        let manager = StateManager::new();
        let ei = manager.persona_get("ei").expect("ei exists");
        assert_eq!(ei.groups_visible, vec!["*".to_string()]);
    }

    #[test]
    fn alias_lookup_is_case_insensitive() {
        let mut manager = manager_with_persona("Muse");
        manager
            .persona_update("Muse", |p| p.aliases.push("m".to_string()))
            .unwrap();
        assert!(manager.persona_get("muse").is_some());
        assert!(manager.persona_get("M").is_some());
    }

    #[test]
    fn duplicate_alias_rejected() {
        let mut manager = manager_with_persona("muse");
        manager
            .persona_update("muse", |p| p.aliases.push("shadow".to_string()))
            .unwrap();

        let mut other = PersonaEntity::new("sage");
        other.aliases.push("shadow".to_string());
        assert!(matches!(
            manager.persona_add(other),
            Err(StateError::Invariant(_))
        ));
    }

    #[test]
    fn persona_remove_requires_archive() {
        let mut manager = manager_with_persona("muse");
        assert!(matches!(
            manager.persona_remove("muse"),
            Err(StateError::Invariant(_))
        ));
        manager.persona_archive("muse").unwrap();
        assert!(manager.persona_remove("muse").is_ok());
        assert!(manager.persona_get("muse").is_none());
    }

    #[test]
    fn mutation_stamps_last_updated() {
        let mut manager = manager_with_persona("muse");
        let before = manager.persona_get("muse").unwrap().last_updated;
        std::thread::sleep(std::time::Duration::from_millis(2));
        manager
            .persona_update("muse", |p| p.is_paused = true)
            .unwrap();
        assert!(manager.persona_get("muse").unwrap().last_updated > before);
    }

    #[test]
    fn upsert_replaces_by_id() {
        let mut manager = StateManager::new();
        let fact = Fact {
            core: ItemCore::new("Birthday", "May 26, 1984"),
            confidence: 0.9,
            validated: Validation::None,
            validated_date: None,
        };
        let id = fact.core.id;
        manager.human_fact_upsert(fact.clone());

        let mut updated = fact;
        updated.core.description = "May 26".to_string();
        manager.human_fact_upsert(updated);

        assert_eq!(manager.human().facts.len(), 1);
        assert_eq!(manager.human().facts[0].core.id, id);
        assert_eq!(manager.human().facts[0].core.description, "May 26");
        assert!(manager.human().last_updated.is_some());
    }

    #[test]
    fn sentiment_is_clamped_on_upsert() {
        let mut manager = StateManager::new();
        let mut topic = Topic {
            core: ItemCore::new("Cooking", ""),
            level_current: 2.0,
            level_ideal: -1.0,
        };
        topic.core.sentiment = 5.0;
        manager.human_topic_upsert(topic);
        let stored = &manager.human().topics[0];
        assert_eq!(stored.core.sentiment, 1.0);
        assert_eq!(stored.level_current, 1.0);
        assert_eq!(stored.level_ideal, 0.0);
    }

    #[test]
    fn duplicate_quote_span_skipped() {
        let mut manager = StateManager::new();
        let message_id = Uuid::new_v4();
        let quote = Quote {
            id: Uuid::new_v4(),
            message_id,
            data_item_ids: vec![],
            persona_groups: vec![],
            text: "so it goes".to_string(),
            speaker: crate::schema::Speaker::human(),
            timestamp: Utc::now(),
            start: Some(4),
            end: Some(14),
            created_at: Utc::now(),
            created_by: crate::schema::QuoteOrigin::Extraction,
        };
        assert!(manager.human_quote_add(quote.clone()));
        let mut again = quote;
        again.id = Uuid::new_v4();
        assert!(!manager.human_quote_add(again));
        assert_eq!(manager.human().quotes.len(), 1);
    }

    #[test]
    fn queue_orders_priority_then_fifo() {
        let mut manager = manager_with_persona("muse");
        let mut low = QueueItem::new(
            Priority::Low,
            Request::PersonaExplore {
                persona: "muse".to_string(),
            },
        );
        low.created_at = Utc::now() - chrono::Duration::seconds(30);
        let mut normal_old = QueueItem::new(
            Priority::Normal,
            Request::HeartbeatCheck {
                persona: "muse".to_string(),
            },
        );
        normal_old.created_at = Utc::now() - chrono::Duration::seconds(20);
        let normal_new = QueueItem::new(
            Priority::Normal,
            Request::HeartbeatCheck {
                persona: "muse".to_string(),
            },
        );

        let low_id = manager.queue_enqueue(low);
        let old_id = manager.queue_enqueue(normal_old);
        let _new_id = manager.queue_enqueue(normal_new);

        assert_eq!(manager.queue_peek_highest().unwrap().id, old_id);
        manager.queue_complete(old_id).unwrap();
        assert_ne!(manager.queue_peek_highest().unwrap().id, low_id);
    }

    #[test]
    fn parked_validations_never_dispatch() {
        let mut manager = StateManager::new();
        manager.queue_enqueue(QueueItem::new(
            Priority::High,
            Request::EiValidation {
                kind: DataKind::Fact,
                item_id: None,
                summary: "low-confidence birthday".to_string(),
                proposed_by: "muse".to_string(),
                candidate: None,
            },
        ));
        assert!(manager.queue_peek_highest().is_none());
        assert_eq!(manager.queue_validations().len(), 1);
    }

    #[test]
    fn queue_fail_drops_after_budget() {
        let mut manager = manager_with_persona("muse");
        let id = manager.queue_enqueue(QueueItem::new(
            Priority::Low,
            Request::PersonaExplore {
                persona: "muse".to_string(),
            },
        ));
        for _ in 0..MAX_ATTEMPTS {
            manager.queue_mark_attempt(id);
        }
        assert_eq!(manager.queue_fail(id, "boom"), FailOutcome::Dropped);
        assert_eq!(manager.queue_len(), 0);
    }

    #[test]
    fn queue_fail_honors_configured_cap() {
        let mut manager = manager_with_persona("muse");
        manager.set_queue_attempt_cap(1);
        let id = manager.queue_enqueue(QueueItem::new(
            Priority::Low,
            Request::PersonaExplore {
                persona: "muse".to_string(),
            },
        ));
        manager.queue_mark_attempt(id);
        assert_eq!(manager.queue_fail(id, "boom"), FailOutcome::Dropped);
        assert_eq!(manager.queue_len(), 0);
    }

    #[test]
    fn supersession_leaves_other_work() {
        let mut manager = manager_with_persona("muse");
        manager.queue_enqueue(QueueItem::new(
            Priority::High,
            Request::PersonaResponse {
                persona: "muse".to_string(),
                cutoff: Utc::now(),
            },
        ));
        manager.queue_enqueue(QueueItem::new(
            Priority::Low,
            Request::FastScan {
                persona: "muse".to_string(),
                kind: DataKind::Fact,
                message_ids: vec![],
            },
        ));
        manager.queue_supersede_responses("muse", None);
        assert_eq!(manager.queue_len(), 1);
    }

    #[test]
    fn clear_pending_returns_trailing_human_messages() {
        let mut manager = manager_with_persona("muse");
        manager
            .messages_append("muse", Message::human("one"))
            .unwrap();
        manager
            .messages_append("muse", Message::system("reply"))
            .unwrap();
        manager
            .messages_append("muse", Message::human("two"))
            .unwrap();
        manager
            .messages_append("muse", Message::human("three"))
            .unwrap();

        let pending = manager.messages_clear_pending("muse").unwrap();
        assert_eq!(
            pending.iter().map(|m| m.content.as_str()).collect::<Vec<_>>(),
            vec!["two", "three"]
        );
        assert_eq!(manager.messages("muse").len(), 2);
    }

    #[test]
    fn unextracted_respects_flags_and_limit() {
        let mut manager = manager_with_persona("muse");
        let first = manager
            .messages_append("muse", Message::human("a"))
            .unwrap();
        manager
            .messages_append("muse", Message::human("b"))
            .unwrap();
        manager
            .messages_mark_extracted("muse", &[first], DataKind::Fact)
            .unwrap();

        assert_eq!(manager.messages_unextracted("muse", DataKind::Fact, None).len(), 1);
        assert_eq!(manager.messages_unextracted("muse", DataKind::Topic, None).len(), 2);
        assert_eq!(
            manager
                .messages_unextracted("muse", DataKind::Topic, Some(1))
                .len(),
            1
        );
    }

    #[tokio::test]
    async fn checkpoint_roundtrip_restores_messages() -> anyhow::Result<()> {
        let storage = MemoryStorage::new();
        let mut manager = manager_with_persona("muse");
        manager.messages_append("muse", Message::human("first"))?;

        let meta = manager
            .checkpoint_create(&storage, Some(10), Some("before".into()), CheckpointKind::Manual)
            .await?;

        manager.messages_append("muse", Message::human("second"))?;
        assert_eq!(manager.messages("muse").len(), 2);

        manager.checkpoint_restore(&storage, meta.id).await?;
        assert_eq!(manager.messages("muse").len(), 1);
        assert_eq!(manager.messages("muse")[0].content, "first");
        Ok(())
    }

    #[tokio::test]
    async fn manual_slots_fill_then_fail() -> anyhow::Result<()> {
        let storage = MemoryStorage::new();
        let mut manager = StateManager::new();
        for _ in 0..5 {
            manager
                .checkpoint_create(&storage, None, None, CheckpointKind::Manual)
                .await?;
        }
        let result = manager
            .checkpoint_create(&storage, None, None, CheckpointKind::Manual)
            .await;
        assert!(matches!(result, Err(StateError::CheckpointFull)));
        Ok(())
    }

    #[tokio::test]
    async fn auto_slots_evict_oldest() -> anyhow::Result<()> {
        let storage = MemoryStorage::new();
        let mut manager = StateManager::new();
        let mut first = None;
        for i in 0..11 {
            let meta = manager
                .checkpoint_create(&storage, None, None, CheckpointKind::Auto)
                .await?;
            if i == 0 {
                first = Some(meta.id);
            }
        }
        assert_eq!(
            manager
                .checkpoint_list()
                .iter()
                .filter(|c| c.kind == CheckpointKind::Auto)
                .count(),
            10
        );
        assert!(!manager.checkpoint_list().iter().any(|c| Some(c.id) == first));
        Ok(())
    }

    #[tokio::test]
    async fn restore_refused_with_active_queue() -> anyhow::Result<()> {
        let storage = MemoryStorage::new();
        let mut manager = manager_with_persona("muse");
        let meta = manager
            .checkpoint_create(&storage, None, None, CheckpointKind::Auto)
            .await?;
        manager.queue_enqueue(QueueItem::new(
            Priority::Normal,
            Request::HeartbeatCheck {
                persona: "muse".to_string(),
            },
        ));
        assert!(matches!(
            manager.checkpoint_restore(&storage, meta.id).await,
            Err(StateError::Invariant(_))
        ));
        manager.queue_pause();
        manager.checkpoint_restore(&storage, meta.id).await?;
        Ok(())
    }

    #[tokio::test]
    async fn persist_then_initialize_roundtrips() -> anyhow::Result<()> {
        let storage = MemoryStorage::new();
        let mut manager = manager_with_persona("muse");
        manager.messages_append("muse", Message::human("hello"))?;
        manager.persist(&storage).await?;

        let reloaded = StateManager::initialize(&storage).await?;
        assert_eq!(reloaded.messages("muse").len(), 1);
        assert!(reloaded.persona_get("ei").is_some());
        Ok(())
    }

    #[test]
    fn set_status_and_read_flags() {
        let mut manager = manager_with_persona("muse");
        let id = manager
            .messages_append("muse", Message::human("keep me"))
            .unwrap();
        manager
            .messages_set_status("muse", id, ContextStatus::Always)
            .unwrap();
        manager.messages_set_read("muse", &[id]).unwrap();
        let message = manager.message_get("muse", id).unwrap();
        assert_eq!(message.context_status, ContextStatus::Always);
        assert!(message.read);
    }
}
