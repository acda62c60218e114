//! Data model — human knowledge, personas, messages, queue, checkpoints.
//!
//! Everything here is plain serde data. Mutation goes through
//! [`crate::StateManager`], which stamps `last_updated` and enforces the
//! invariants; the shapes themselves carry no behavior beyond small
//! accessors.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// The default visibility group. An item with no groups is treated as if it
/// were tagged `["General"]`.
pub const GENERAL_GROUP: &str = "General";

/// Reserved wildcard group meaning "all groups". Only the Ei persona carries
/// it; users must never be able to type it in.
pub const WILDCARD_GROUP: &str = "*";

/// Name of the built-in guide persona.
pub const EI_PERSONA: &str = "ei";

// ── Data items ────────────────────────────────────────────────────────────────

/// Which human-knowledge bucket a data item belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DataKind {
    Fact,
    Trait,
    Topic,
    Person,
    Quote,
}

impl DataKind {
    /// The buckets the three-step extraction pipeline scans for. Quotes are
    /// captured inside Step 3 rather than scanned directly.
    pub const EXTRACTABLE: [DataKind; 4] = [
        DataKind::Fact,
        DataKind::Trait,
        DataKind::Topic,
        DataKind::Person,
    ];

    pub fn label(self) -> &'static str {
        match self {
            DataKind::Fact => "fact",
            DataKind::Trait => "trait",
            DataKind::Topic => "topic",
            DataKind::Person => "person",
            DataKind::Quote => "quote",
        }
    }
}

/// Fields shared by every human data item.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ItemCore {
    pub id: Uuid,
    pub name: String,
    #[serde(default)]
    pub description: String,
    /// Feeling toward the item, clamped to [-1, 1].
    #[serde(default)]
    pub sentiment: f32,
    pub last_updated: DateTime<Utc>,
    /// Name of the persona that first extracted the item, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub learned_by: Option<String>,
    /// Visibility groups. Empty means the item belongs to "General".
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub persona_groups: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub embedding: Option<Vec<f32>>,
}

impl ItemCore {
    pub fn new(name: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
            description: description.into(),
            sentiment: 0.0,
            last_updated: Utc::now(),
            learned_by: None,
            persona_groups: Vec::new(),
            embedding: None,
        }
    }
}

/// Access to the shared fields of any data item, used by the generic upsert
/// and visibility paths.
pub trait DataRecord {
    fn core(&self) -> &ItemCore;
    fn core_mut(&mut self) -> &mut ItemCore;

    fn id(&self) -> Uuid {
        self.core().id
    }
}

macro_rules! impl_data_record {
    ($ty:ty) => {
        impl DataRecord for $ty {
            fn core(&self) -> &ItemCore {
                &self.core
            }
            fn core_mut(&mut self) -> &mut ItemCore {
                &mut self.core
            }
        }
    };
}

/// Whether a fact has been confirmed by the human.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Validation {
    #[default]
    None,
    Human,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Fact {
    #[serde(flatten)]
    pub core: ItemCore,
    /// Extraction confidence, [0, 1].
    pub confidence: f32,
    #[serde(default)]
    pub validated: Validation,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub validated_date: Option<DateTime<Utc>>,
}
impl_data_record!(Fact);

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TraitItem {
    #[serde(flatten)]
    pub core: ItemCore,
    /// How strongly the pattern shows, [0, 1].
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub strength: Option<f32>,
}
impl_data_record!(TraitItem);

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Topic {
    #[serde(flatten)]
    pub core: ItemCore,
    /// Recency/exposure, [0, 1]. Decays toward 0 when untouched.
    pub level_current: f32,
    /// Desire to discuss, [0, 1]. Only moves on explicit preference signals.
    pub level_ideal: f32,
}
impl_data_record!(Topic);

impl Topic {
    /// Positive when the human would like to discuss this more than they do.
    pub fn engagement_gap(&self) -> f32 {
        self.level_ideal - self.level_current
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Person {
    #[serde(flatten)]
    pub core: ItemCore,
    pub relationship: String,
    pub level_current: f32,
    pub level_ideal: f32,
}
impl_data_record!(Person);

impl Person {
    pub fn engagement_gap(&self) -> f32 {
        self.level_ideal - self.level_current
    }
}

/// Who a quote came from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Speaker {
    Known(KnownSpeaker),
    Persona(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum KnownSpeaker {
    Human,
}

impl Speaker {
    pub fn human() -> Self {
        Speaker::Known(KnownSpeaker::Human)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QuoteOrigin {
    Extraction,
    Human,
}

/// A memorable phrase lifted verbatim from a message. `start`/`end` are
/// character offsets into the source message content; `None` when the exact
/// position could not be resolved.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Quote {
    pub id: Uuid,
    pub message_id: Uuid,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub data_item_ids: Vec<Uuid>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub persona_groups: Vec<String>,
    pub text: String,
    pub speaker: Speaker,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end: Option<usize>,
    pub created_at: DateTime<Utc>,
    pub created_by: QuoteOrigin,
}

// ── Messages ──────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Human,
    System,
}

/// Whether a message participates in response-prompt context.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ContextStatus {
    /// In context while inside the persona's sliding window.
    #[default]
    Default,
    /// Always in context.
    Always,
    /// Never in context.
    Never,
}

/// One chat message in a persona's thread. The single-letter flags mark
/// per-type extraction completion (fact / trait / person / topic) and are
/// omitted from the wire when unset.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub id: Uuid,
    pub role: Role,
    pub content: String,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub read: bool,
    #[serde(default)]
    pub context_status: ContextStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub f: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub r: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub p: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub o: Option<bool>,
}

impl Message {
    pub fn human(content: impl Into<String>) -> Self {
        Self::new(Role::Human, content)
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self::new(Role::System, content)
    }

    fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            role,
            content: content.into(),
            timestamp: Utc::now(),
            read: false,
            context_status: ContextStatus::Default,
            f: None,
            r: None,
            p: None,
            o: None,
        }
    }

    /// `true` when extraction for the given bucket has completed over this
    /// message. Absent flags mean "not yet extracted".
    pub fn extracted(&self, kind: DataKind) -> bool {
        let flag = match kind {
            DataKind::Fact => self.f,
            DataKind::Trait => self.r,
            DataKind::Person => self.p,
            DataKind::Topic => self.o,
            DataKind::Quote => return true,
        };
        flag.unwrap_or(false)
    }

    pub fn set_extracted(&mut self, kind: DataKind) {
        match kind {
            DataKind::Fact => self.f = Some(true),
            DataKind::Trait => self.r = Some(true),
            DataKind::Person => self.p = Some(true),
            DataKind::Topic => self.o = Some(true),
            DataKind::Quote => {}
        }
    }
}

// ── Personas ──────────────────────────────────────────────────────────────────

/// A persona's structured take on a topic it cares about.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PersonaTopic {
    pub id: Uuid,
    pub name: String,
    #[serde(default)]
    pub perspective: String,
    #[serde(default)]
    pub approach: String,
    #[serde(default)]
    pub personal_stake: String,
    #[serde(default)]
    pub sentiment: f32,
    pub exposure_current: f32,
    pub exposure_desired: f32,
    pub last_updated: DateTime<Utc>,
}

impl PersonaTopic {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
            perspective: String::new(),
            approach: String::new(),
            personal_stake: String::new(),
            sentiment: 0.0,
            exposure_current: 0.0,
            exposure_desired: 0.5,
            last_updated: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PersonaEntity {
    pub id: Uuid,
    pub name: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub aliases: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub short_description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub long_description: Option<String>,
    /// `provider:model` or a bare local model; `None` uses the defaults chain.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    /// Where items this persona extracts get tagged.
    #[serde(default)]
    pub group_primary: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub groups_visible: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub traits: Vec<TraitItem>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub topics: Vec<PersonaTopic>,
    /// Static personas (imported agents) skip ceremonies.
    #[serde(default)]
    pub is_dynamic: bool,
    #[serde(default)]
    pub is_paused: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pause_until: Option<DateTime<Utc>>,
    #[serde(default)]
    pub is_archived: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub archived_date: Option<DateTime<Utc>>,
    pub heartbeat_delay_ms: u64,
    pub context_window_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_heartbeat: Option<DateTime<Utc>>,
    pub last_updated: DateTime<Utc>,
}

impl PersonaEntity {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
            aliases: Vec::new(),
            short_description: None,
            long_description: None,
            model: None,
            group_primary: Some(GENERAL_GROUP.to_string()),
            groups_visible: Vec::new(),
            traits: Vec::new(),
            topics: Vec::new(),
            is_dynamic: true,
            is_paused: false,
            pause_until: None,
            is_archived: false,
            archived_date: None,
            heartbeat_delay_ms: 30 * 60 * 1000,
            context_window_ms: 24 * 60 * 60 * 1000,
            last_heartbeat: None,
            last_updated: Utc::now(),
        }
    }

    /// The built-in guide persona seeded on first run: primary group
    /// "General" and wildcard read access.
    pub fn default_ei() -> Self {
        let mut persona = Self::new(EI_PERSONA);
        persona.short_description = Some("Your guide to this system".to_string());
        persona.groups_visible = vec![WILDCARD_GROUP.to_string()];
        persona
    }

    pub fn is_ei(&self) -> bool {
        self.name.eq_ignore_ascii_case(EI_PERSONA)
    }

    pub fn matches_name(&self, needle: &str) -> bool {
        self.name.eq_ignore_ascii_case(needle)
            || self.aliases.iter().any(|a| a.eq_ignore_ascii_case(needle))
    }
}

// ── Human ─────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct HumanSettings {
    pub display_name: Option<String>,
    /// Provider account → model mapping for the selection chain.
    pub provider_accounts: BTreeMap<String, String>,
    pub sync_enabled: bool,
    /// Local time of day (`HH:MM`) for Ei's daily ceremony.
    pub ceremony_time: Option<String>,
    pub timezone: Option<String>,
    pub autosave_secs: Option<u64>,
    /// Date (`YYYY-MM-DD`, ceremony timezone) of the last daily ceremony, so
    /// a restart cannot re-run it the same day.
    pub last_ceremony_date: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct HumanEntity {
    pub facts: Vec<Fact>,
    pub traits: Vec<TraitItem>,
    pub topics: Vec<Topic>,
    pub people: Vec<Person>,
    pub quotes: Vec<Quote>,
    pub settings: HumanSettings,
    pub last_updated: Option<DateTime<Utc>>,
}

// ── Queue ─────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Low,
    Normal,
    High,
}

/// How the raw LLM text for a request is interpreted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseKind {
    /// Free text: echo-stripped, "No Message" detected.
    Text,
    /// First balanced JSON value extracted, repaired, retried.
    Json,
    /// Returned unchanged.
    Raw,
}

/// The typed request a queue item carries. The variant selects the handler;
/// the payload is everything that handler needs beyond live state.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "next_step", rename_all = "snake_case")]
pub enum Request {
    PersonaResponse {
        persona: String,
        /// Messages after this instant are not part of the request; context
        /// is fetched just-in-time when the item reaches the head.
        cutoff: DateTime<Utc>,
    },
    HeartbeatCheck {
        persona: String,
    },
    FastScan {
        persona: String,
        kind: DataKind,
        message_ids: Vec<Uuid>,
    },
    ItemMatch {
        persona: String,
        kind: DataKind,
        candidate: serde_json::Value,
        message_ids: Vec<Uuid>,
    },
    ItemUpdate {
        persona: String,
        kind: DataKind,
        existing_id: Option<Uuid>,
        candidate: serde_json::Value,
        message_ids: Vec<Uuid>,
    },
    PersonaGeneration {
        name: String,
        description: String,
    },
    PersonaExplore {
        persona: String,
    },
    DescriptionCheck {
        persona: String,
    },
    /// Ceremony exposure phase: a Step-1 style scan of recent messages
    /// against the persona's own topics.
    CeremonyExposure {
        persona: String,
    },
    /// A pending confirmation for Ei's daily ceremony. Parked: never handed
    /// to the LLM; drained by the ceremony instead.
    EiValidation {
        kind: DataKind,
        item_id: Option<Uuid>,
        summary: String,
        proposed_by: String,
        /// The scanned candidate, kept so a "keep" answer can still promote
        /// it through the match/update steps.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        candidate: Option<serde_json::Value>,
    },
    OneShot {
        guid: String,
        system: String,
        user: String,
    },
}

impl Request {
    pub fn response_kind(&self) -> ResponseKind {
        match self {
            Request::PersonaResponse { .. } | Request::HeartbeatCheck { .. } => ResponseKind::Text,
            Request::OneShot { .. } => ResponseKind::Raw,
            Request::EiValidation { .. } => ResponseKind::Raw,
            _ => ResponseKind::Json,
        }
    }

    /// Validation items sit in the queue as records for the daily ceremony;
    /// they are never dispatched to the LLM.
    pub fn is_parked(&self) -> bool {
        matches!(self, Request::EiValidation { .. })
    }

    /// The persona whose thread or data this request touches, when there is
    /// one. Used by `queue_clear_for` and supersession.
    pub fn persona(&self) -> Option<&str> {
        match self {
            Request::PersonaResponse { persona, .. }
            | Request::HeartbeatCheck { persona }
            | Request::FastScan { persona, .. }
            | Request::ItemMatch { persona, .. }
            | Request::ItemUpdate { persona, .. }
            | Request::PersonaExplore { persona }
            | Request::DescriptionCheck { persona }
            | Request::CeremonyExposure { persona } => Some(persona),
            _ => None,
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            Request::PersonaResponse { .. } => "persona_response",
            Request::HeartbeatCheck { .. } => "heartbeat_check",
            Request::FastScan { .. } => "fast_scan",
            Request::ItemMatch { .. } => "item_match",
            Request::ItemUpdate { .. } => "item_update",
            Request::PersonaGeneration { .. } => "persona_generation",
            Request::PersonaExplore { .. } => "persona_explore",
            Request::DescriptionCheck { .. } => "description_check",
            Request::CeremonyExposure { .. } => "ceremony_exposure",
            Request::EiValidation { .. } => "ei_validation",
            Request::OneShot { .. } => "one_shot",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueItem {
    pub id: Uuid,
    pub priority: Priority,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub attempts: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_attempt: Option<DateTime<Utc>>,
    /// Pre-built prompts, when the enqueuer already knows them (one-shots).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub system: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user: Option<String>,
    #[serde(flatten)]
    pub request: Request,
}

impl QueueItem {
    pub fn new(priority: Priority, request: Request) -> Self {
        Self {
            id: Uuid::new_v4(),
            priority,
            created_at: Utc::now(),
            attempts: 0,
            last_attempt: None,
            system: None,
            user: None,
            request,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct QueueState {
    pub items: Vec<QueueItem>,
    pub paused: bool,
}

// ── Checkpoints ───────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CheckpointKind {
    Auto,
    Manual,
}

/// Auto checkpoints rotate through slots 0–9; manual ones occupy 10–14 and
/// must be deleted explicitly once full.
pub const AUTO_SLOTS: std::ops::Range<u8> = 0..10;
pub const MANUAL_SLOTS: std::ops::Range<u8> = 10..15;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckpointMeta {
    pub id: Uuid,
    pub name: String,
    pub slot: u8,
    pub kind: CheckpointKind,
    pub created_at: DateTime<Utc>,
}

// ── Full state blob ───────────────────────────────────────────────────────────

pub const STATE_VERSION: u32 = 1;

/// The complete persisted state. This is the stable JSON shape shared with
/// every storage backend and captured by checkpoints.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FullState {
    pub version: u32,
    pub human: HumanEntity,
    pub personas: BTreeMap<String, PersonaEntity>,
    pub messages: BTreeMap<String, Vec<Message>>,
    pub queue: QueueState,
    pub settings: HumanSettings,
    pub checkpoints: Vec<CheckpointMeta>,
}

impl Default for FullState {
    fn default() -> Self {
        let ei = PersonaEntity::default_ei();
        let mut personas = BTreeMap::new();
        let mut messages = BTreeMap::new();
        messages.insert(ei.name.clone(), Vec::new());
        personas.insert(ei.name.clone(), ei);
        Self {
            version: STATE_VERSION,
            human: HumanEntity::default(),
            personas,
            messages,
            queue: QueueState::default(),
            settings: HumanSettings::default(),
            checkpoints: Vec::new(),
        }
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn message_flags_are_elided_when_unset() {
        let msg = Message::human("hello");
        let json = serde_json::to_value(&msg).unwrap();
        assert!(json.get("f").is_none());
        assert!(json.get("o").is_none());
    }

    #[test]
    fn absent_flag_reads_as_unextracted() {
        let raw = serde_json::json!({
            "id": Uuid::new_v4(),
            "role": "human",
            "content": "hi",
            "timestamp": Utc::now(),
        });
        let msg: Message = serde_json::from_value(raw).unwrap();
        assert!(!msg.extracted(DataKind::Fact));
        assert!(!msg.extracted(DataKind::Topic));
    }

    #[test]
    fn set_extracted_round_trips() {
        let mut msg = Message::human("hi");
        msg.set_extracted(DataKind::Trait);
        let json = serde_json::to_value(&msg).unwrap();
        assert_eq!(json["r"], true);
        assert!(json.get("f").is_none());
    }

    #[test]
    fn default_state_seeds_ei() {
        let state = FullState::default();
        let ei = state.personas.get(EI_PERSONA).expect("ei seeded");
        assert_eq!(ei.group_primary.as_deref(), Some(GENERAL_GROUP));
        assert_eq!(ei.groups_visible, vec![WILDCARD_GROUP.to_string()]);
    }

    #[test]
    fn priority_orders_high_over_low() {
        assert!(Priority::High > Priority::Normal);
        assert!(Priority::Normal > Priority::Low);
    }

    #[test]
    fn request_serializes_with_next_step_tag() {
        let item = QueueItem::new(
            Priority::Normal,
            Request::HeartbeatCheck {
                persona: "muse".to_string(),
            },
        );
        let json = serde_json::to_value(&item).unwrap();
        assert_eq!(json["next_step"], "heartbeat_check");
        assert_eq!(json["persona"], "muse");
    }

    #[test]
    fn fact_flattens_core_fields() {
        let fact = Fact {
            core: ItemCore::new("Birthday", "May 26, 1984"),
            confidence: 0.9,
            validated: Validation::None,
            validated_date: None,
        };
        let json = serde_json::to_value(&fact).unwrap();
        assert_eq!(json["name"], "Birthday");
        assert_eq!(json["confidence"], 0.9);
        assert!(json.get("core").is_none());
    }
}
