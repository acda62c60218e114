//! The processor — binds state, queue, transport, storage, and scheduler
//! behind the frontend API.
//!
//! One cooperative tick loop drives everything: autosave, scheduled jobs,
//! heartbeat eligibility, and queue dispatch. The only true concurrency is
//! the in-flight LLM call, which runs on its own task and reports back
//! through a completion channel. Frontend methods lock the same core the
//! tick loop uses, so handler code never races user mutations.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use tokio::sync::{Mutex, broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use ei_config::{AppConfig, Operation};
use ei_llm::LlmTransport;
use ei_prompt::{
    ConversationLine, PendingValidation, PromptPair, ResponsePromptInput,
    build_daily_ceremony_message, build_description_check_prompt, build_ei_heartbeat_prompt,
    build_fast_scan_prompt, build_heartbeat_prompt, build_item_match_prompt,
    build_item_update_prompt, build_persona_explore_prompt, build_persona_generation_prompt,
    build_response_prompt,
};
use ei_state::schema::{
    CheckpointKind, CheckpointMeta, ContextStatus, DataKind, HumanSettings, Message,
    PersonaEntity, Priority, QueueItem, Request, Role,
};
use ei_state::{
    DataRecord, EI_PERSONA, Fact, FailOutcome, Person, Quote, StateError, StateManager, Topic,
    TraitItem, effective_scope,
};
use ei_storage::StorageBackend;

use crate::events::{ProcessorEvent, QueueActivity};
use crate::handlers::{self, EmbedTask, ExtractionGate, HandlerCtx};
use crate::queue_processor::{Completion, LlmOutcome, PreparedCall, QueueProcessor, WorkError};
use crate::scheduler::{Scheduler, ceremony_due, heartbeat_eligible};

/// Optional embedding service: text in, vector out (or `None` when the
/// backend is unavailable).
pub type EmbedFn = Arc<dyn Fn(String) -> BoxFuture<'static, Option<Vec<f32>>> + Send + Sync>;

const TICK_INTERVAL: Duration = Duration::from_millis(100);
const PROMPT_FACT_LIMIT: usize = 25;
const PROMPT_TOPIC_LIMIT: usize = 15;
const PROMPT_PEOPLE_LIMIT: usize = 15;
const PROMPT_QUOTE_LIMIT: usize = 10;
const CEREMONY_BATCH: usize = 5;

/// Patch applied by `update_persona`. `None` fields are left untouched.
#[derive(Debug, Clone, Default)]
pub struct PersonaPatch {
    pub short_description: Option<String>,
    pub long_description: Option<String>,
    pub model: Option<Option<String>>,
    pub group_primary: Option<Option<String>>,
    pub groups_visible: Option<Vec<String>>,
    pub heartbeat_delay_ms: Option<u64>,
    pub context_window_ms: Option<u64>,
    pub is_dynamic: Option<bool>,
    pub add_alias: Option<String>,
    pub remove_alias: Option<String>,
}

struct Core {
    state: StateManager,
    queue: QueueProcessor,
    scheduler: Scheduler,
    gate: ExtractionGate,
    /// Personas with a response/heartbeat queued or in flight.
    processing: HashSet<String>,
    /// Not-before times for rate-limited items.
    backoff: HashMap<Uuid, DateTime<Utc>>,
    /// Ei's daily confirmations are out and unanswered.
    ceremony_awaiting: bool,
    /// The validation batch the ceremony message covers.
    pending_ceremony: Vec<QueueItem>,
    pending_embeds: Vec<EmbedTask>,
    active_persona: String,
    embed_fn: Option<EmbedFn>,
    started: bool,
}

pub struct Processor {
    core: Arc<Mutex<Core>>,
    events: broadcast::Sender<ProcessorEvent>,
    storage: Arc<dyn StorageBackend>,
    config: AppConfig,
    completions_tx: mpsc::UnboundedSender<Completion>,
    completions_rx: Mutex<Option<mpsc::UnboundedReceiver<Completion>>>,
    shutdown: watch::Sender<bool>,
    tick_handle: Mutex<Option<JoinHandle<()>>>,
}

impl Processor {
    pub fn new(
        config: AppConfig,
        transport: Arc<dyn LlmTransport>,
        storage: Arc<dyn StorageBackend>,
    ) -> Self {
        let (events, _) = broadcast::channel(256);
        let (completions_tx, completions_rx) = mpsc::unbounded_channel();
        let (shutdown, _) = watch::channel(false);
        Self {
            core: Arc::new(Mutex::new(Core {
                state: StateManager::new(),
                queue: QueueProcessor::new(transport),
                scheduler: Scheduler::new(),
                gate: ExtractionGate::default(),
                processing: HashSet::new(),
                backoff: HashMap::new(),
                ceremony_awaiting: false,
                pending_ceremony: Vec::new(),
                pending_embeds: Vec::new(),
                active_persona: EI_PERSONA.to_string(),
                embed_fn: None,
                started: false,
            })),
            events,
            storage,
            config,
            completions_tx,
            completions_rx: Mutex::new(Some(completions_rx)),
            shutdown,
            tick_handle: Mutex::new(None),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ProcessorEvent> {
        self.events.subscribe()
    }

    pub async fn set_embed_fn(&self, embed: EmbedFn) {
        self.core.lock().await.embed_fn = Some(embed);
    }

    fn emit(&self, event: ProcessorEvent) {
        let _ = self.events.send(event);
    }

    // ── Lifecycle ─────────────────────────────────────────────────────────────

    /// Load (or seed) state and start the tick loop. Load failure is fatal.
    pub async fn start(&self) -> anyhow::Result<()> {
        {
            let mut core = self.core.lock().await;
            if core.started {
                anyhow::bail!("processor already started");
            }
            core.state = StateManager::initialize(self.storage.as_ref()).await?;
            core.state
                .set_queue_attempt_cap(self.config.runtime.queue_attempt_cap);
            core.started = true;
        }

        let rx = self
            .completions_rx
            .lock()
            .await
            .take()
            .ok_or_else(|| anyhow::anyhow!("processor cannot be restarted"))?;

        let handle = tokio::spawn(tick_loop(
            self.core.clone(),
            self.events.clone(),
            self.storage.clone(),
            self.config.clone(),
            self.completions_tx.clone(),
            rx,
            self.shutdown.subscribe(),
        ));
        *self.tick_handle.lock().await = Some(handle);
        info!("processor started");
        Ok(())
    }

    pub async fn stop(&self) {
        let _ = self.shutdown.send(true);
        {
            let mut core = self.core.lock().await;
            core.queue.abort();
        }
        if let Some(handle) = self.tick_handle.lock().await.take() {
            let _ = handle.await;
        }
        info!("processor stopped");
    }

    /// Abort in-flight work, flush state, fire the sync hook, and stop.
    pub async fn save_and_exit(&self) -> anyhow::Result<()> {
        self.emit(ProcessorEvent::SaveAndExitStart);
        {
            let mut core = self.core.lock().await;
            core.queue.abort();
            core.state.persist(self.storage.as_ref()).await?;
        }
        self.emit(ProcessorEvent::StatePersisted);
        if self.config.sync.username.is_some() {
            // Remote sync transport is a frontend concern; the core records
            // the intent so the frontend can act on it.
            info!("sync configured — state flushed for remote sync");
        }
        self.emit(ProcessorEvent::SaveAndExitFinish);
        self.stop().await;
        Ok(())
    }

    // ── Personas ──────────────────────────────────────────────────────────────

    pub async fn get_persona_list(&self, include_archived: bool) -> Vec<PersonaEntity> {
        let core = self.core.lock().await;
        core.state
            .persona_list(include_archived)
            .into_iter()
            .cloned()
            .collect()
    }

    pub async fn get_persona(&self, name: &str) -> Option<PersonaEntity> {
        self.core.lock().await.state.persona_get(name).cloned()
    }

    /// Queue LLM generation of a new persona. The persona appears (and
    /// `PersonaAdded` fires) when generation completes.
    pub async fn create_persona(&self, name: &str, description: &str) -> Result<(), StateError> {
        let mut core = self.core.lock().await;
        if core.state.persona_get(name).is_some() {
            return Err(StateError::Invariant(format!(
                "persona '{name}' already exists"
            )));
        }
        core.state.queue_enqueue(QueueItem::new(
            Priority::Normal,
            Request::PersonaGeneration {
                name: name.to_string(),
                description: description.to_string(),
            },
        ));
        Ok(())
    }

    pub async fn update_persona(&self, name: &str, patch: PersonaPatch) -> Result<(), StateError> {
        let mut core = self.core.lock().await;
        core.state.persona_update(name, |p| {
            if let Some(short) = patch.short_description {
                p.short_description = Some(short);
            }
            if let Some(long) = patch.long_description {
                p.long_description = Some(long);
            }
            if let Some(model) = patch.model {
                p.model = model;
            }
            if let Some(primary) = patch.group_primary {
                p.group_primary = primary;
            }
            if let Some(visible) = patch.groups_visible {
                p.groups_visible = visible;
            }
            if let Some(delay) = patch.heartbeat_delay_ms {
                p.heartbeat_delay_ms = delay;
            }
            if let Some(window) = patch.context_window_ms {
                p.context_window_ms = window;
            }
            if let Some(dynamic) = patch.is_dynamic {
                p.is_dynamic = dynamic;
            }
            if let Some(alias) = patch.add_alias {
                if !p.aliases.iter().any(|a| a.eq_ignore_ascii_case(&alias)) {
                    p.aliases.push(alias);
                }
            }
            if let Some(alias) = patch.remove_alias {
                p.aliases.retain(|a| !a.eq_ignore_ascii_case(&alias));
            }
        })?;
        drop(core);
        self.emit(ProcessorEvent::PersonaUpdated(name.to_string()));
        Ok(())
    }

    pub async fn archive_persona(&self, name: &str) -> Result<(), StateError> {
        let mut core = self.core.lock().await;
        core.state.persona_archive(name)?;
        core.state.queue_clear_for(name);
        drop(core);
        self.emit(ProcessorEvent::PersonaUpdated(name.to_string()));
        Ok(())
    }

    pub async fn unarchive_persona(&self, name: &str) -> Result<(), StateError> {
        self.core.lock().await.state.persona_unarchive(name)?;
        self.emit(ProcessorEvent::PersonaUpdated(name.to_string()));
        Ok(())
    }

    /// Delete a persona; only archived personas may go.
    pub async fn delete_persona(&self, name: &str) -> Result<(), StateError> {
        let removed = {
            let mut core = self.core.lock().await;
            core.state.queue_clear_for(name);
            core.state.persona_remove(name)?
        };
        self.emit(ProcessorEvent::PersonaRemoved(removed.name));
        Ok(())
    }

    pub async fn set_active_persona(&self, name: &str) -> Result<(), StateError> {
        let mut core = self.core.lock().await;
        let persona = core
            .state
            .persona_get(name)
            .ok_or_else(|| StateError::NotFound(name.to_string()))?;
        if persona.is_archived {
            return Err(StateError::Invariant(format!(
                "persona '{name}' is archived"
            )));
        }
        core.active_persona = persona.name.clone();
        Ok(())
    }

    pub async fn get_active_persona(&self) -> String {
        self.core.lock().await.active_persona.clone()
    }

    pub async fn pause_persona(
        &self,
        name: &str,
        until: Option<DateTime<Utc>>,
    ) -> Result<(), StateError> {
        self.core.lock().await.state.persona_pause(name, until)?;
        self.emit(ProcessorEvent::PersonaUpdated(name.to_string()));
        Ok(())
    }

    pub async fn resume_persona(&self, name: &str) -> Result<(), StateError> {
        self.core.lock().await.state.persona_unpause(name)?;
        self.emit(ProcessorEvent::PersonaUpdated(name.to_string()));
        Ok(())
    }

    /// Queue a heartbeat check right now, regardless of the idle timer.
    pub async fn poke_persona(&self, name: &str) -> Result<(), StateError> {
        let mut core = self.core.lock().await;
        let target = core
            .state
            .persona_get(name)
            .map(|p| p.name.clone())
            .ok_or_else(|| StateError::NotFound(name.to_string()))?;
        core.processing.insert(target.to_ascii_lowercase());
        core.state.queue_enqueue(QueueItem::new(
            Priority::Normal,
            Request::HeartbeatCheck { persona: target },
        ));
        Ok(())
    }

    // ── Messages ──────────────────────────────────────────────────────────────

    /// Append a human message and queue a response. A message to an archived
    /// persona is an invariant error. Any not-yet-started response for the
    /// persona is superseded and an in-flight one aborted — the new request's
    /// context will include both messages.
    pub async fn send_message(&self, persona: &str, content: &str) -> Result<(), StateError> {
        let mut core = self.core.lock().await;
        let target = core
            .state
            .persona_get(persona)
            .ok_or_else(|| StateError::NotFound(persona.to_string()))?;
        if target.is_archived {
            return Err(StateError::Invariant(format!(
                "persona '{persona}' is archived"
            )));
        }
        let target_name = target.name.clone();
        let target_is_ei = target.is_ei();

        // A reply to Ei's pending daily confirmations is also the
        // validation verdict.
        if target_is_ei && core.ceremony_awaiting {
            resolve_ceremony_reply(&mut core, content);
        }

        core.state
            .messages_append(&target_name, Message::human(content))?;
        core.gate.note_human_message(&target_name);
        let _ = self.events.send(ProcessorEvent::MessageAdded {
            persona: target_name.clone(),
        });

        // Supersede: abort an in-flight response and drop queued ones. The
        // in-flight check must read the queue entry before supersession
        // removes it.
        let in_flight_response = core
            .queue
            .current_item()
            .and_then(|id| core.state.queue_get(id))
            .map(|i| {
                matches!(&i.request, Request::PersonaResponse { persona: p, .. }
                    if p.eq_ignore_ascii_case(&target_name))
            })
            .unwrap_or(false);
        core.state.queue_supersede_responses(&target_name, None);
        if in_flight_response {
            core.queue.abort();
        }

        core.state.queue_enqueue(QueueItem::new(
            Priority::High,
            Request::PersonaResponse {
                persona: target_name.clone(),
                cutoff: Utc::now(),
            },
        ));
        let _ = self.events.send(ProcessorEvent::MessageQueued {
            persona: target_name,
        });
        Ok(())
    }

    pub async fn get_messages(&self, persona: &str) -> Vec<Message> {
        self.core.lock().await.state.messages(persona).to_vec()
    }

    pub async fn set_message_context_status(
        &self,
        persona: &str,
        id: Uuid,
        status: ContextStatus,
    ) -> Result<(), StateError> {
        self.core
            .lock()
            .await
            .state
            .messages_set_status(persona, id, status)
    }

    pub async fn delete_messages(&self, persona: &str, ids: &[Uuid]) -> Result<(), StateError> {
        self.core.lock().await.state.messages_delete(persona, ids)
    }

    pub async fn mark_all_messages_read(&self, persona: &str) -> Result<(), StateError> {
        self.core.lock().await.state.messages_mark_all_read(persona)
    }

    /// Abort the persona's current response, remove its unanswered human
    /// messages, and return them (newline-joined) for the input box.
    pub async fn recall_pending_messages(&self, persona: &str) -> Result<String, StateError> {
        let mut core = self.core.lock().await;
        let target = core
            .state
            .persona_get(persona)
            .map(|p| p.name.clone())
            .ok_or_else(|| StateError::NotFound(persona.to_string()))?;

        if let Some(current) = core.queue.current_item() {
            let is_this_persona = core
                .state
                .queue_get(current)
                .and_then(|i| i.request.persona().map(str::to_string))
                .map(|p| p.eq_ignore_ascii_case(&target))
                .unwrap_or(false);
            if is_this_persona {
                core.queue.abort();
            }
        }
        core.state.queue_supersede_responses(&target, None);

        let pending = core.state.messages_clear_pending(&target)?;
        Ok(pending
            .into_iter()
            .map(|m| m.content)
            .collect::<Vec<_>>()
            .join("\n"))
    }

    // ── Human data ────────────────────────────────────────────────────────────

    pub async fn get_human(&self) -> ei_state::HumanEntity {
        self.core.lock().await.state.human().clone()
    }

    pub async fn upsert_fact(&self, fact: Fact) {
        let mut core = self.core.lock().await;
        note_embed_if_changed(
            &mut core,
            DataKind::Fact,
            fact.id(),
            &fact.core.name,
            &fact.core.description,
        );
        core.state.human_fact_upsert(fact);
        drop(core);
        self.emit(ProcessorEvent::HumanUpdated);
    }

    pub async fn upsert_trait(&self, item: TraitItem) {
        let mut core = self.core.lock().await;
        note_embed_if_changed(
            &mut core,
            DataKind::Trait,
            item.id(),
            &item.core.name,
            &item.core.description,
        );
        core.state.human_trait_upsert(item);
        drop(core);
        self.emit(ProcessorEvent::HumanUpdated);
    }

    pub async fn upsert_topic(&self, topic: Topic) {
        let mut core = self.core.lock().await;
        note_embed_if_changed(
            &mut core,
            DataKind::Topic,
            topic.id(),
            &topic.core.name,
            &topic.core.description,
        );
        core.state.human_topic_upsert(topic);
        drop(core);
        self.emit(ProcessorEvent::HumanUpdated);
    }

    pub async fn upsert_person(&self, person: Person) {
        let mut core = self.core.lock().await;
        note_embed_if_changed(
            &mut core,
            DataKind::Person,
            person.id(),
            &person.core.name,
            &person.core.description,
        );
        core.state.human_person_upsert(person);
        drop(core);
        self.emit(ProcessorEvent::HumanUpdated);
    }

    pub async fn remove_human_item(&self, kind: DataKind, id: Uuid) -> Result<(), StateError> {
        {
            let mut core = self.core.lock().await;
            match kind {
                DataKind::Fact => core.state.human_fact_remove(id)?,
                DataKind::Trait => core.state.human_trait_remove(id)?,
                DataKind::Topic => core.state.human_topic_remove(id)?,
                DataKind::Person => core.state.human_person_remove(id)?,
                DataKind::Quote => core.state.human_quote_remove(id)?,
            }
        }
        self.emit(ProcessorEvent::HumanUpdated);
        Ok(())
    }

    pub async fn add_quote(&self, quote: Quote) -> bool {
        let added = self.core.lock().await.state.human_quote_add(quote);
        if added {
            self.emit(ProcessorEvent::HumanUpdated);
        }
        added
    }

    pub async fn update_quote(&self, quote: Quote) -> Result<(), StateError> {
        self.core.lock().await.state.human_quote_update(quote)?;
        self.emit(ProcessorEvent::HumanUpdated);
        Ok(())
    }

    pub async fn update_settings(&self, apply: impl FnOnce(&mut HumanSettings)) {
        self.core.lock().await.state.settings_update(apply);
        self.emit(ProcessorEvent::HumanUpdated);
    }

    // ── Queue & checkpoints ───────────────────────────────────────────────────

    pub async fn pause_queue(&self) {
        self.core.lock().await.state.queue_pause();
        self.emit(ProcessorEvent::QueueStateChanged(QueueActivity::Paused));
    }

    pub async fn resume_queue(&self) {
        self.core.lock().await.state.queue_resume();
        self.emit(ProcessorEvent::QueueStateChanged(QueueActivity::Idle));
    }

    pub async fn clear_queue(&self) {
        let mut core = self.core.lock().await;
        core.queue.abort();
        core.state.queue_clear();
        core.processing.clear();
        core.backoff.clear();
    }

    /// Abort whatever is currently at the LLM and drop its queue entry.
    pub async fn abort_current_operation(&self) {
        let mut core = self.core.lock().await;
        if let Some(current) = core.queue.current_item() {
            let _ = core.state.queue_complete(current);
            core.queue.abort();
        }
    }

    pub async fn create_checkpoint(
        &self,
        slot: Option<u8>,
        name: Option<String>,
    ) -> Result<CheckpointMeta, StateError> {
        self.emit(ProcessorEvent::CheckpointStart);
        let meta = {
            let mut core = self.core.lock().await;
            core.state
                .checkpoint_create(self.storage.as_ref(), slot, name, CheckpointKind::Manual)
                .await?
        };
        self.emit(ProcessorEvent::CheckpointCreated(meta.clone()));
        Ok(meta)
    }

    /// Restore a checkpoint. In-flight work is aborted first; the call still
    /// fails while unpaused items sit in the queue.
    pub async fn restore_checkpoint(&self, id: Uuid) -> Result<(), StateError> {
        let mut core = self.core.lock().await;
        core.queue.abort();
        core.state
            .checkpoint_restore(self.storage.as_ref(), id)
            .await?;
        core.processing.clear();
        core.backoff.clear();
        core.pending_ceremony.clear();
        core.ceremony_awaiting = false;
        Ok(())
    }

    pub async fn delete_checkpoint(&self, id: Uuid) -> Result<(), StateError> {
        let mut core = self.core.lock().await;
        core.state
            .checkpoint_delete(self.storage.as_ref(), id)
            .await
    }

    pub async fn list_checkpoints(&self) -> Vec<CheckpointMeta> {
        self.core.lock().await.state.checkpoint_list().to_vec()
    }

    /// Queue depth (including parked validations) and in-flight state, for
    /// status displays.
    pub async fn queue_status(&self) -> (usize, bool) {
        let core = self.core.lock().await;
        (core.state.queue_len(), core.queue.is_busy())
    }

    // ── One-shot ──────────────────────────────────────────────────────────────

    /// AI-assist for UI fields: raw prompts in, `OneShotReturned` out.
    pub async fn submit_one_shot(&self, guid: &str, system: &str, user: &str) {
        let mut core = self.core.lock().await;
        let mut item = QueueItem::new(
            Priority::High,
            Request::OneShot {
                guid: guid.to_string(),
                system: system.to_string(),
                user: user.to_string(),
            },
        );
        item.system = Some(system.to_string());
        item.user = Some(user.to_string());
        core.state.queue_enqueue(item);
    }
}

// ── Embedding bookkeeping ─────────────────────────────────────────────────────

fn note_embed_if_changed(
    core: &mut Core,
    kind: DataKind,
    id: Uuid,
    name: &str,
    description: &str,
) {
    let human = core.state.human();
    let existing_text = match kind {
        DataKind::Fact => human
            .facts
            .iter()
            .find(|i| i.id() == id)
            .map(|i| (i.core().name.clone(), i.core().description.clone())),
        DataKind::Trait => human
            .traits
            .iter()
            .find(|i| i.id() == id)
            .map(|i| (i.core().name.clone(), i.core().description.clone())),
        DataKind::Topic => human
            .topics
            .iter()
            .find(|i| i.id() == id)
            .map(|i| (i.core().name.clone(), i.core().description.clone())),
        DataKind::Person => human
            .people
            .iter()
            .find(|i| i.id() == id)
            .map(|i| (i.core().name.clone(), i.core().description.clone())),
        DataKind::Quote => None,
    };

    // Recompute only when the semantic text actually changed; slider nudges
    // must not burn embedding calls.
    let changed = match existing_text {
        Some((old_name, old_description)) => old_name != name || old_description != description,
        None => true,
    };
    if changed {
        core.pending_embeds.push(EmbedTask {
            kind,
            item_id: id,
            text: format!("{name} {description}"),
        });
    }
}

// ── Tick loop ─────────────────────────────────────────────────────────────────

#[allow(clippy::too_many_arguments)]
async fn tick_loop(
    core: Arc<Mutex<Core>>,
    events: broadcast::Sender<ProcessorEvent>,
    storage: Arc<dyn StorageBackend>,
    config: AppConfig,
    completions_tx: mpsc::UnboundedSender<Completion>,
    mut completions_rx: mpsc::UnboundedReceiver<Completion>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut interval = tokio::time::interval(TICK_INTERVAL);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
            Some(completion) = completions_rx.recv() => {
                handle_completion(&core, &events, &config, completion).await;
            }
            _ = interval.tick() => {
                tick_once(&core, &events, &storage, &config, &completions_tx).await;
            }
        }
    }
    debug!("tick loop stopped");
}

async fn tick_once(
    core: &Arc<Mutex<Core>>,
    events: &broadcast::Sender<ProcessorEvent>,
    storage: &Arc<dyn StorageBackend>,
    config: &AppConfig,
    completions_tx: &mpsc::UnboundedSender<Completion>,
) {
    let mut guard = core.lock().await;
    let core_ref = &mut *guard;

    // 1. Autosave.
    let autosave_interval = Duration::from_secs(
        core_ref
            .state
            .settings()
            .autosave_secs
            .unwrap_or(config.schedule.autosave_secs),
    );
    if core_ref.scheduler.autosave_due(autosave_interval) {
        match core_ref.state.persist(storage.as_ref()).await {
            Ok(()) => {
                let _ = core_ref
                    .state
                    .checkpoint_create(storage.as_ref(), None, None, CheckpointKind::Auto)
                    .await;
                let _ = events.send(ProcessorEvent::StatePersisted);
            }
            Err(err) => {
                // Non-fatal: report and retry soon.
                warn!(%err, "autosave failed");
                core_ref.scheduler.autosave_retry_soon(autosave_interval);
                let _ = events.send(ProcessorEvent::Error {
                    code: "autosave_failed".to_string(),
                    message: err.to_string(),
                });
            }
        }
    }

    // 2. Scheduled jobs: hourly decay, daily ceremony.
    let decay_interval = Duration::from_secs(config.schedule.decay_interval_hours.max(1) * 3600);
    if core_ref.scheduler.decay_due(decay_interval) {
        handlers::apply_decay_tick(&mut core_ref.state);
        debug!("decay tick applied");
    }

    if core_ref.scheduler.ceremony_check_due() {
        let settings = core_ref.state.settings();
        let timezone = settings
            .timezone
            .clone()
            .unwrap_or_else(|| config.schedule.timezone.clone());
        let ceremony_time = settings
            .ceremony_time
            .clone()
            .unwrap_or_else(|| config.schedule.ceremony_time.clone());
        let last = settings.last_ceremony_date.clone();
        if let Some(today) = ceremony_due(Utc::now(), &timezone, &ceremony_time, last.as_deref()) {
            run_daily_ceremony(core_ref, events, today);
        }
    }

    // 3. Heartbeat eligibility.
    sweep_heartbeats(core_ref);

    // 4. Dispatch the highest-priority runnable item.
    if !core_ref.state.queue_is_paused() && !core_ref.queue.is_busy() {
        dispatch_next(core_ref, events, config, completions_tx);
    }

    // 5. One pending embedding per tick, computed outside the lock.
    let embed_job = core_ref.embed_fn.clone().and_then(|f| {
        core_ref
            .pending_embeds
            .pop()
            .map(|task| (f, task))
    });
    if core_ref.embed_fn.is_none() {
        core_ref.pending_embeds.clear();
    }
    drop(guard);

    if let Some((embed, task)) = embed_job {
        let vector = embed(task.text.clone()).await;
        if let Some(vector) = vector {
            let mut guard = core.lock().await;
            apply_embedding(&mut guard.state, task.kind, task.item_id, vector);
        }
    }
}

fn apply_embedding(state: &mut StateManager, kind: DataKind, id: Uuid, vector: Vec<f32>) {
    let human = state.human();
    match kind {
        DataKind::Fact => {
            if let Some(mut item) = human.facts.iter().find(|i| i.id() == id).cloned() {
                item.core.embedding = Some(vector);
                state.human_fact_upsert(item);
            }
        }
        DataKind::Trait => {
            if let Some(mut item) = human.traits.iter().find(|i| i.id() == id).cloned() {
                item.core.embedding = Some(vector);
                state.human_trait_upsert(item);
            }
        }
        DataKind::Topic => {
            if let Some(mut item) = human.topics.iter().find(|i| i.id() == id).cloned() {
                item.core.embedding = Some(vector);
                state.human_topic_upsert(item);
            }
        }
        DataKind::Person => {
            if let Some(mut item) = human.people.iter().find(|i| i.id() == id).cloned() {
                item.core.embedding = Some(vector);
                state.human_person_upsert(item);
            }
        }
        DataKind::Quote => {}
    }
}

// ── Heartbeats ────────────────────────────────────────────────────────────────

fn sweep_heartbeats(core: &mut Core) {
    let now = Utc::now();

    // Lapsed timed pauses lift first.
    let lapsed: Vec<String> = core
        .state
        .persona_list(true)
        .iter()
        .filter(|p| p.is_paused && p.pause_until.is_some_and(|until| until <= now))
        .map(|p| p.name.clone())
        .collect();
    for name in lapsed {
        let _ = core.state.persona_unpause(&name);
    }

    let candidates: Vec<(String, bool)> = core
        .state
        .persona_list(false)
        .iter()
        .map(|p| (p.name.clone(), p.is_ei()))
        .collect();

    for (name, is_ei) in candidates {
        let Some(persona) = core.state.persona_get(&name) else {
            continue;
        };
        let last_message = core.state.messages(&name).last().map(|m| m.timestamp);
        let last_activity = match (last_message, persona.last_heartbeat) {
            (Some(m), Some(h)) => Some(m.max(h)),
            (Some(m), None) => Some(m),
            (None, h) => h,
        };
        let processing = core.processing.contains(&name.to_ascii_lowercase());
        let awaiting = is_ei && core.ceremony_awaiting;

        if !heartbeat_eligible(persona, last_activity, now, processing, awaiting) {
            continue;
        }
        core.processing.insert(name.to_ascii_lowercase());
        debug!(persona = %name, "heartbeat eligible");
        core.state.queue_enqueue(QueueItem::new(
            Priority::Normal,
            Request::HeartbeatCheck { persona: name },
        ));
    }
}

// ── Dispatch ──────────────────────────────────────────────────────────────────

fn dispatch_next(
    core: &mut Core,
    events: &broadcast::Sender<ProcessorEvent>,
    config: &AppConfig,
    completions_tx: &mpsc::UnboundedSender<Completion>,
) {
    let now = Utc::now();
    let backoff = core.backoff.clone();
    let Some(item) = core
        .state
        .queue_peek_highest_where(|i| backoff.get(&i.id).is_none_or(|until| *until <= now))
        .cloned()
    else {
        return;
    };

    let Some(call) = prepare_call(core, &item, config) else {
        // Unpreparable (persona vanished, malformed payload): drop it.
        warn!(item = %item.id, step = item.request.label(), "item could not be prepared — dropping");
        let _ = core.state.queue_complete(item.id);
        return;
    };

    core.state.queue_mark_attempt(item.id);
    if let Err(err) = core.queue.start(call, completions_tx.clone()) {
        warn!(%err, "dispatch raced a busy slot");
        return;
    }

    let _ = events.send(ProcessorEvent::QueueStateChanged(QueueActivity::Busy));
    if let Request::PersonaResponse { persona, .. } = &item.request {
        core.processing.insert(persona.to_ascii_lowercase());
        let _ = events.send(ProcessorEvent::MessageProcessing {
            persona: persona.clone(),
        });
    }
    debug!(item = %item.id, step = item.request.label(), "dispatched");
}

/// Build the prompts for a queue item just-in-time, from live state.
fn prepare_call(core: &Core, item: &QueueItem, config: &AppConfig) -> Option<PreparedCall> {
    let state = &core.state;

    let (pair, echo_guard, model, operation) = match &item.request {
        Request::PersonaResponse { persona, cutoff } => {
            let entity = state.persona_get(persona)?;
            let input = response_input(state, entity, Some(*cutoff));
            let echo = input
                .conversation
                .iter()
                .rev()
                .find(|l| l.role == Role::Human)
                .map(|l| l.content.clone());
            let pair = build_response_prompt(&input);
            (pair, echo, entity.model.clone(), Operation::Response)
        }
        Request::HeartbeatCheck { persona } => {
            let entity = state.persona_get(persona)?;
            let input = response_input(state, entity, None);
            let pair = if entity.is_ei() {
                let quiet = quiet_personas(state);
                build_ei_heartbeat_prompt(&input, &quiet)
            } else {
                build_heartbeat_prompt(&input)
            };
            (pair, None, entity.model.clone(), Operation::Response)
        }
        Request::FastScan {
            persona,
            kind,
            message_ids,
        } => {
            let messages = collect_messages(state, persona, message_ids);
            let names = all_persona_names(state);
            let pair = build_fast_scan_prompt(*kind, &messages, &names);
            (pair, None, None, Operation::Concept)
        }
        Request::ItemMatch {
            kind, candidate, ..
        } => {
            let existing = existing_summaries(state, *kind);
            let pair = build_item_match_prompt(*kind, candidate, &existing);
            (pair, None, None, Operation::Concept)
        }
        Request::ItemUpdate {
            persona,
            kind,
            existing_id,
            message_ids,
            ..
        } => {
            let existing = existing_id.and_then(|id| existing_item_json(state, *kind, id));
            let messages = collect_messages(state, persona, message_ids);
            let pair = build_item_update_prompt(*kind, existing.as_ref(), &messages, persona);
            (pair, None, None, Operation::Concept)
        }
        Request::PersonaGeneration { name, description } => {
            let pair = build_persona_generation_prompt(name, description);
            (pair, None, None, Operation::Generation)
        }
        Request::PersonaExplore { persona } => {
            let entity = state.persona_get(persona)?;
            let themes: Vec<String> = {
                let mut topics: Vec<&Topic> = state.human().topics.iter().collect();
                topics.sort_by(|a, b| b.level_current.total_cmp(&a.level_current));
                topics
                    .iter()
                    .take(5)
                    .map(|t| t.core.name.clone())
                    .collect()
            };
            let pair = build_persona_explore_prompt(entity, &themes);
            (pair, None, None, Operation::Generation)
        }
        Request::DescriptionCheck { persona } => {
            let entity = state.persona_get(persona)?;
            let pair = build_description_check_prompt(entity);
            (pair, None, None, Operation::Generation)
        }
        Request::CeremonyExposure { persona } => {
            let recent: Vec<&Message> = {
                let thread = state.messages(persona);
                let start = thread.len().saturating_sub(20);
                thread[start..].iter().collect()
            };
            let names = all_persona_names(state);
            let pair = build_fast_scan_prompt(DataKind::Topic, &recent, &names);
            (pair, None, None, Operation::Concept)
        }
        Request::OneShot { system, user, .. } => {
            let pair = PromptPair {
                system: system.clone(),
                user: user.clone(),
            };
            (pair, None, None, Operation::Concept)
        }
        Request::EiValidation { .. } => return None,
    };

    Some(PreparedCall {
        item_id: item.id,
        kind: item.request.response_kind(),
        system: item.system.clone().unwrap_or(pair.system),
        user: item.user.clone().unwrap_or(pair.user),
        echo_guard,
        model,
        operation,
    })
}

fn response_input<'a>(
    state: &'a StateManager,
    persona: &'a PersonaEntity,
    cutoff: Option<DateTime<Utc>>,
) -> ResponsePromptInput<'a> {
    let scope = effective_scope(persona);
    let human = state.human();

    let mut facts: Vec<&Fact> = human
        .facts
        .iter()
        .filter(|f| scope.can_read(&f.core.persona_groups))
        .collect();
    facts.sort_by(|a, b| b.core.last_updated.cmp(&a.core.last_updated));
    facts.truncate(PROMPT_FACT_LIMIT);

    let mut topics: Vec<&Topic> = human
        .topics
        .iter()
        .filter(|t| scope.can_read(&t.core.persona_groups))
        .collect();
    topics.sort_by(|a, b| b.engagement_gap().total_cmp(&a.engagement_gap()));
    topics.truncate(PROMPT_TOPIC_LIMIT);

    let mut people: Vec<&Person> = human
        .people
        .iter()
        .filter(|p| scope.can_read(&p.core.persona_groups))
        .collect();
    people.sort_by(|a, b| b.core.last_updated.cmp(&a.core.last_updated));
    people.truncate(PROMPT_PEOPLE_LIMIT);

    let mut quotes: Vec<&Quote> = human
        .quotes
        .iter()
        .filter(|q| scope.can_read(&q.persona_groups))
        .collect();
    quotes.sort_by(|a, b| b.created_at.cmp(&a.created_at));
    quotes.truncate(PROMPT_QUOTE_LIMIT);

    let now = Utc::now();
    let window_start = now - chrono::Duration::milliseconds(persona.context_window_ms as i64);
    let conversation: Vec<ConversationLine> = state
        .messages(&persona.name)
        .iter()
        .filter(|m| cutoff.is_none_or(|cut| m.timestamp <= cut))
        .filter(|m| match m.context_status {
            ContextStatus::Always => true,
            ContextStatus::Never => false,
            ContextStatus::Default => m.timestamp >= window_start,
        })
        .map(|m| ConversationLine {
            role: m.role,
            content: m.content.clone(),
        })
        .collect();

    let delay_ms = state
        .messages(&persona.name)
        .iter()
        .rev()
        .find(|m| m.role == Role::Human)
        .map(|m| (now - m.timestamp).num_milliseconds().max(0) as u64);

    let structured_response = persona
        .traits
        .iter()
        .any(|t| t.core.name.eq_ignore_ascii_case("structured response"));

    ResponsePromptInput {
        persona,
        human_name: human.settings.display_name.as_deref(),
        facts,
        topics,
        people,
        quotes,
        conversation,
        delay_ms,
        structured_response,
    }
}

fn quiet_personas(state: &StateManager) -> Vec<(String, u64)> {
    let now = Utc::now();
    state
        .persona_list(false)
        .iter()
        .filter(|p| !p.is_ei())
        .filter_map(|p| {
            let last = state.messages(&p.name).last()?.timestamp;
            let hours = (now - last).num_hours();
            (hours >= 24).then(|| (p.name.clone(), hours as u64))
        })
        .collect()
}

fn collect_messages<'a>(
    state: &'a StateManager,
    persona: &str,
    ids: &[Uuid],
) -> Vec<&'a Message> {
    state
        .messages(persona)
        .iter()
        .filter(|m| ids.contains(&m.id))
        .collect()
}

fn all_persona_names(state: &StateManager) -> Vec<String> {
    state
        .persona_list(true)
        .iter()
        .map(|p| p.name.clone())
        .collect()
}

fn existing_summaries(state: &StateManager, kind: DataKind) -> Vec<(String, String)> {
    let human = state.human();
    let summarize = |core: &ei_state::ItemCore| {
        (
            core.id.to_string(),
            format!("{} — {}", core.name, core.description),
        )
    };
    match kind {
        DataKind::Fact => human.facts.iter().map(|i| summarize(i.core())).collect(),
        DataKind::Trait => human.traits.iter().map(|i| summarize(i.core())).collect(),
        DataKind::Topic => human.topics.iter().map(|i| summarize(i.core())).collect(),
        DataKind::Person => human.people.iter().map(|i| summarize(i.core())).collect(),
        DataKind::Quote => Vec::new(),
    }
}

fn existing_item_json(state: &StateManager, kind: DataKind, id: Uuid) -> Option<serde_json::Value> {
    let human = state.human();
    match kind {
        DataKind::Fact => human
            .facts
            .iter()
            .find(|i| i.id() == id)
            .and_then(|i| serde_json::to_value(i).ok()),
        DataKind::Trait => human
            .traits
            .iter()
            .find(|i| i.id() == id)
            .and_then(|i| serde_json::to_value(i).ok()),
        DataKind::Topic => human
            .topics
            .iter()
            .find(|i| i.id() == id)
            .and_then(|i| serde_json::to_value(i).ok()),
        DataKind::Person => human
            .people
            .iter()
            .find(|i| i.id() == id)
            .and_then(|i| serde_json::to_value(i).ok()),
        DataKind::Quote => None,
    }
}

// ── Completion handling ───────────────────────────────────────────────────────

async fn handle_completion(
    core: &Arc<Mutex<Core>>,
    events: &broadcast::Sender<ProcessorEvent>,
    config: &AppConfig,
    completion: Completion,
) {
    let mut guard = core.lock().await;
    let core_ref = &mut *guard;
    let item_id = completion.item_id;
    core_ref.queue.finish(item_id);

    let Some(item) = core_ref.state.queue_get(item_id).cloned() else {
        // Superseded or cleared while in flight — nothing to do.
        debug!(item = %item_id, "completion for a removed item ignored");
        emit_idle_if_quiet(core_ref, events);
        return;
    };

    if let Some(persona) = item.request.persona() {
        core_ref.processing.remove(&persona.to_ascii_lowercase());
    }

    match completion.result {
        Ok(outcome) => {
            let mut ctx = HandlerCtx {
                state: &mut core_ref.state,
                events,
                config,
                gate: &mut core_ref.gate,
                processing: &mut core_ref.processing,
                pending_embeds: &mut core_ref.pending_embeds,
            };
            match handlers::dispatch(&mut ctx, &item.request, outcome) {
                Ok(()) => {
                    let _ = core_ref.state.queue_complete(item_id);
                }
                Err(err) => {
                    warn!(item = %item_id, step = item.request.label(), %err, "handler failed");
                    let outcome = core_ref.state.queue_fail(item_id, &err.to_string());
                    if outcome == FailOutcome::Dropped {
                        let _ = events.send(ProcessorEvent::Error {
                            code: "handler_failed".to_string(),
                            message: err.to_string(),
                        });
                    }
                }
            }
        }
        Err(WorkError::Aborted) => {
            // Swallowed: a superseded or recalled request re-runs only if it
            // still sits in the queue with attempts to spare.
            let cap = core_ref.state.queue_attempt_cap();
            let attempts = core_ref
                .state
                .queue_get(item_id)
                .map(|i| i.attempts)
                .unwrap_or(cap);
            if attempts >= cap {
                let _ = core_ref.state.queue_fail(item_id, "aborted repeatedly");
            }
            debug!(item = %item_id, "aborted");
        }
        Err(WorkError::RateLimited { retry_after_secs }) => {
            let attempts = core_ref
                .state
                .queue_get(item_id)
                .map(|i| i.attempts)
                .unwrap_or(1);
            let outcome = core_ref.state.queue_fail(item_id, "rate limited");
            if let FailOutcome::Retained { .. } = outcome {
                // Exponential backoff within the attempt budget.
                let factor = 1u64 << attempts.saturating_sub(1).min(4);
                let delay = retry_after_secs.max(1) * factor;
                core_ref
                    .backoff
                    .insert(item_id, Utc::now() + chrono::Duration::seconds(delay as i64));
                debug!(item = %item_id, delay, "rate limited — backing off");
            }
        }
        Err(WorkError::JsonParse(snippet)) => {
            let _ = core_ref.state.queue_fail(item_id, "json parse failure");
            let _ = events.send(ProcessorEvent::Error {
                code: "json_parse".to_string(),
                message: format!("{}: {snippet}", item.request.label()),
            });
        }
        Err(WorkError::Truncated) => {
            let _ = core_ref.state.queue_fail(item_id, "truncated");
        }
        Err(WorkError::Transport(message)) => {
            let _ = core_ref.state.queue_fail(item_id, &message);
            if matches!(item.request, Request::PersonaResponse { .. }) {
                // A failed response generation is user-visible: no message
                // appears, so say why.
                let _ = events.send(ProcessorEvent::Error {
                    code: "response_failed".to_string(),
                    message,
                });
            }
        }
    }

    emit_idle_if_quiet(core_ref, events);
}

fn emit_idle_if_quiet(core: &mut Core, events: &broadcast::Sender<ProcessorEvent>) {
    if core.queue.is_busy() {
        return;
    }
    let activity = if core.state.queue_is_paused() {
        QueueActivity::Paused
    } else {
        QueueActivity::Idle
    };
    let _ = events.send(ProcessorEvent::QueueStateChanged(activity));
}

// ── Daily ceremony ────────────────────────────────────────────────────────────

fn run_daily_ceremony(
    core: &mut Core,
    events: &broadcast::Sender<ProcessorEvent>,
    today: String,
) {
    info!(%today, "daily ceremony starting");
    core.state
        .settings_update(|s| s.last_ceremony_date = Some(today));

    // Persona ceremonies, alphabetical; Ei's own ritual is the validation
    // batch below.
    let names: Vec<(String, bool)> = core
        .state
        .persona_list(false)
        .iter()
        .filter(|p| p.is_dynamic && !p.is_ei())
        .map(|p| (p.name.clone(), p.topics.is_empty()))
        .collect();
    for (name, topicless) in names {
        let request = if topicless {
            Request::PersonaExplore {
                persona: name.clone(),
            }
        } else {
            Request::CeremonyExposure {
                persona: name.clone(),
            }
        };
        core.state
            .queue_enqueue(QueueItem::new(Priority::Low, request));
    }

    // Batched confirmations for the human, at most five per day.
    let batch = core.state.queue_take_validations(CEREMONY_BATCH);
    if batch.is_empty() {
        return;
    }
    let pending: Vec<PendingValidation> = batch
        .iter()
        .enumerate()
        .filter_map(|(i, item)| match &item.request {
            Request::EiValidation {
                summary,
                proposed_by,
                ..
            } => Some(PendingValidation {
                index: i + 1,
                summary: summary.clone(),
                proposed_by: proposed_by.clone(),
            }),
            _ => None,
        })
        .collect();

    let text = build_daily_ceremony_message(&pending);
    if core
        .state
        .messages_append(EI_PERSONA, Message::system(text))
        .is_ok()
    {
        let _ = events.send(ProcessorEvent::MessageAdded {
            persona: EI_PERSONA.to_string(),
        });
    }
    core.pending_ceremony = batch;
    core.ceremony_awaiting = true;
}

/// Interpret the human's reply to the daily confirmations. Lenient keyword
/// matching: "keep 1", "drop 2", "move 3", or "keep all" / "drop all".
/// Items the reply does not address go back in the queue for the next
/// ceremony.
fn resolve_ceremony_reply(core: &mut Core, reply: &str) {
    let reply = reply.to_ascii_lowercase();
    let batch = std::mem::take(&mut core.pending_ceremony);
    core.ceremony_awaiting = false;

    for (i, item) in batch.into_iter().enumerate() {
        let index = i + 1;
        let Request::EiValidation {
            kind,
            item_id,
            proposed_by,
            candidate,
            ..
        } = item.request.clone()
        else {
            continue;
        };

        let verdict = if reply.contains(&format!("keep {index}")) || reply.contains("keep all") {
            Some(Verdict::Keep)
        } else if reply.contains(&format!("drop {index}"))
            || reply.contains(&format!("delete {index}"))
            || reply.contains("drop all")
        {
            Some(Verdict::Drop)
        } else if reply.contains(&format!("move {index}")) || reply.contains("move all") {
            Some(Verdict::Move)
        } else {
            None
        };

        match verdict {
            Some(Verdict::Keep) => match item_id {
                Some(id) => {
                    if kind == DataKind::Fact {
                        let fact = core.state.human().facts.iter().find(|f| f.id() == id).cloned();
                        if let Some(mut fact) = fact {
                            fact.validated = ei_state::Validation::Human;
                            fact.validated_date = Some(Utc::now());
                            core.state.human_fact_upsert(fact);
                        }
                    }
                    // Keeping a global item global needs no group change.
                }
                None => {
                    if let Some(candidate) = candidate {
                        // A confirmed low-confidence candidate enters the
                        // normal match/update pipeline.
                        core.state.queue_enqueue(QueueItem::new(
                            Priority::Low,
                            Request::ItemMatch {
                                persona: proposed_by,
                                kind,
                                candidate,
                                message_ids: Vec::new(),
                            },
                        ));
                    }
                }
            },
            Some(Verdict::Move) => {
                if let Some(id) = item_id {
                    let primary = core
                        .state
                        .persona_get(&proposed_by)
                        .and_then(|p| p.group_primary.clone())
                        .unwrap_or_else(|| ei_state::GENERAL_GROUP.to_string());
                    move_item_groups(&mut core.state, kind, id, vec![primary]);
                }
            }
            Some(Verdict::Drop) => {
                if let Some(id) = item_id {
                    let _ = match kind {
                        DataKind::Fact => core.state.human_fact_remove(id),
                        DataKind::Trait => core.state.human_trait_remove(id),
                        DataKind::Topic => core.state.human_topic_remove(id),
                        DataKind::Person => core.state.human_person_remove(id),
                        DataKind::Quote => core.state.human_quote_remove(id),
                    };
                }
            }
            None => {
                // Unaddressed: ask again next ceremony.
                core.state.queue_enqueue(item);
            }
        }
    }
}

enum Verdict {
    Keep,
    Move,
    Drop,
}

fn move_item_groups(state: &mut StateManager, kind: DataKind, id: Uuid, groups: Vec<String>) {
    let human = state.human();
    match kind {
        DataKind::Fact => {
            if let Some(mut item) = human.facts.iter().find(|i| i.id() == id).cloned() {
                item.core.persona_groups = groups;
                state.human_fact_upsert(item);
            }
        }
        DataKind::Trait => {
            if let Some(mut item) = human.traits.iter().find(|i| i.id() == id).cloned() {
                item.core.persona_groups = groups;
                state.human_trait_upsert(item);
            }
        }
        DataKind::Topic => {
            if let Some(mut item) = human.topics.iter().find(|i| i.id() == id).cloned() {
                item.core.persona_groups = groups;
                state.human_topic_upsert(item);
            }
        }
        DataKind::Person => {
            if let Some(mut item) = human.people.iter().find(|i| i.id() == id).cloned() {
                item.core.persona_groups = groups;
                state.human_person_upsert(item);
            }
        }
        DataKind::Quote => {
            if let Some(mut quote) = human.quotes.iter().find(|q| q.id == id).cloned() {
                quote.persona_groups = groups;
                let _ = state.human_quote_update(quote);
            }
        }
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use ei_llm::ScriptedTransport;
    use ei_state::schema::{ItemCore, PersonaTopic, Validation};

    fn test_core() -> Core {
        Core {
            state: StateManager::new(),
            queue: QueueProcessor::new(Arc::new(ScriptedTransport::new())),
            scheduler: Scheduler::new(),
            gate: ExtractionGate::default(),
            processing: HashSet::new(),
            backoff: HashMap::new(),
            ceremony_awaiting: false,
            pending_ceremony: Vec::new(),
            pending_embeds: Vec::new(),
            active_persona: EI_PERSONA.to_string(),
            embed_fn: None,
            started: true,
        }
    }

    fn validation_item(kind: DataKind, item_id: Option<Uuid>, proposed_by: &str) -> QueueItem {
        QueueItem::new(
            Priority::Low,
            Request::EiValidation {
                kind,
                item_id,
                summary: "something to confirm".to_string(),
                proposed_by: proposed_by.to_string(),
                candidate: None,
            },
        )
    }

    #[test]
    fn daily_ceremony_batches_validations_and_queues_persona_work() {
        let (events, _rx) = broadcast::channel(64);
        let mut core = test_core();

        let mut persona = PersonaEntity::new("muse");
        persona.topics.push(PersonaTopic::new("poetry"));
        core.state.persona_add(persona).unwrap();

        for _ in 0..7 {
            core.state
                .queue_enqueue(validation_item(DataKind::Fact, None, "muse"));
        }

        run_daily_ceremony(&mut core, &events, "2026-08-01".to_string());

        assert!(core.ceremony_awaiting);
        assert_eq!(core.pending_ceremony.len(), 5, "batched at five");
        assert_eq!(core.state.queue_validations().len(), 2, "rest stay parked");
        assert_eq!(
            core.state.settings().last_ceremony_date.as_deref(),
            Some("2026-08-01")
        );

        let ceremony_message = core.state.messages(EI_PERSONA).last().unwrap();
        assert!(ceremony_message.content.contains("Daily confirmations"));

        // muse has topics, so its ceremony starts at the exposure phase.
        let queued = core.state.queue_peek_highest().unwrap();
        assert_eq!(queued.request.label(), "ceremony_exposure");
    }

    #[test]
    fn ceremony_does_not_rerun_same_day() {
        let (events, _rx) = broadcast::channel(64);
        let mut core = test_core();
        let today = Utc::now().format("%Y-%m-%d").to_string();
        run_daily_ceremony(&mut core, &events, today);
        let last = core.state.settings().last_ceremony_date.clone();
        assert!(ceremony_due(Utc::now(), "UTC", "00:00", last.as_deref()).is_none());
    }

    #[test]
    fn ceremony_reply_keep_validates_fact() {
        let mut core = test_core();
        let fact = Fact {
            core: ItemCore::new("Birthday", "May 26"),
            confidence: 0.4,
            validated: Validation::None,
            validated_date: None,
        };
        let fact_id = fact.core.id;
        core.state.human_fact_upsert(fact);

        core.pending_ceremony = vec![validation_item(DataKind::Fact, Some(fact_id), "muse")];
        core.ceremony_awaiting = true;

        resolve_ceremony_reply(&mut core, "keep 1 please");

        assert!(!core.ceremony_awaiting);
        let stored = &core.state.human().facts[0];
        assert_eq!(stored.validated, Validation::Human);
        assert!(stored.validated_date.is_some());
    }

    #[test]
    fn ceremony_reply_drop_removes_item() {
        let mut core = test_core();
        let fact = Fact {
            core: ItemCore::new("Wrong guess", ""),
            confidence: 0.2,
            validated: Validation::None,
            validated_date: None,
        };
        let fact_id = fact.core.id;
        core.state.human_fact_upsert(fact);

        core.pending_ceremony = vec![validation_item(DataKind::Fact, Some(fact_id), "muse")];
        resolve_ceremony_reply(&mut core, "drop 1");

        assert!(core.state.human().facts.is_empty());
    }

    #[test]
    fn ceremony_reply_move_rescopes_to_proposer_group() {
        let mut core = test_core();
        let mut persona = PersonaEntity::new("muse");
        persona.group_primary = Some("Private".to_string());
        core.state.persona_add(persona).unwrap();

        let fact = Fact {
            core: ItemCore::new("Quiet thing", ""),
            confidence: 0.8,
            validated: Validation::None,
            validated_date: None,
        };
        let fact_id = fact.core.id;
        core.state.human_fact_upsert(fact);

        core.pending_ceremony = vec![validation_item(DataKind::Fact, Some(fact_id), "muse")];
        resolve_ceremony_reply(&mut core, "move 1");

        assert_eq!(
            core.state.human().facts[0].core.persona_groups,
            vec!["Private".to_string()]
        );
    }

    #[test]
    fn unaddressed_validations_return_to_queue() {
        let mut core = test_core();
        core.pending_ceremony = vec![
            validation_item(DataKind::Fact, None, "muse"),
            validation_item(DataKind::Topic, None, "muse"),
        ];
        resolve_ceremony_reply(&mut core, "keep 1");

        assert_eq!(core.state.queue_validations().len(), 1, "item 2 re-parked");
    }

    #[test]
    fn heartbeat_sweep_enqueues_for_idle_persona() {
        let mut core = test_core();
        let mut persona = PersonaEntity::new("muse");
        persona.heartbeat_delay_ms = 1;
        core.state.persona_add(persona).unwrap();
        core.state
            .messages_append("muse", Message::human("long ago"))
            .unwrap();
        // Timestamps are "now"; a 1ms threshold lapses immediately.
        std::thread::sleep(std::time::Duration::from_millis(5));

        sweep_heartbeats(&mut core);

        let item = core.state.queue_peek_highest().expect("heartbeat queued");
        assert_eq!(item.request.label(), "heartbeat_check");
        // Marked processing, so the next sweep does not double-queue.
        sweep_heartbeats(&mut core);
        assert_eq!(core.state.queue_len(), 1);
    }

    #[test]
    fn lapsed_timed_pause_is_lifted() {
        let mut core = test_core();
        let mut persona = PersonaEntity::new("muse");
        persona.is_paused = true;
        persona.pause_until = Some(Utc::now() - chrono::Duration::seconds(1));
        core.state.persona_add(persona).unwrap();

        sweep_heartbeats(&mut core);
        assert!(!core.state.persona_get("muse").unwrap().is_paused);
    }

    #[test]
    fn note_embed_skips_unchanged_text() {
        let mut core = test_core();
        let fact = Fact {
            core: ItemCore::new("Birthday", "May 26"),
            confidence: 0.9,
            validated: Validation::None,
            validated_date: None,
        };
        core.state.human_fact_upsert(fact.clone());

        note_embed_if_changed(&mut core, DataKind::Fact, fact.core.id, "Birthday", "May 26");
        assert!(core.pending_embeds.is_empty(), "same text, no recompute");

        note_embed_if_changed(&mut core, DataKind::Fact, fact.core.id, "Birthday", "May 26, 1984");
        assert_eq!(core.pending_embeds.len(), 1);
    }
}
