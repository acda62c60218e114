//! Authoritative in-memory state: the data model, the `StateManager` that
//! guards every mutation, the priority queue, checkpoints, group visibility,
//! and the numeric semantics for exposure and decay.

pub mod levels;
mod manager;
pub mod schema;
pub mod visibility;

pub use manager::{FailOutcome, MAX_ATTEMPTS, StateManager};
pub use schema::{
    AUTO_SLOTS, CheckpointKind, CheckpointMeta, ContextStatus, DataKind, DataRecord, EI_PERSONA,
    Fact, FullState, GENERAL_GROUP, HumanEntity, HumanSettings, ItemCore, KnownSpeaker,
    MANUAL_SLOTS, Message, Person, PersonaEntity, PersonaTopic, Priority, Quote, QuoteOrigin,
    QueueItem, QueueState, Request, ResponseKind, Role, STATE_VERSION, Speaker, Topic, TraitItem,
    Validation, WILDCARD_GROUP,
};
pub use visibility::{ReadScope, effective_scope, is_global_write};

#[derive(Debug, thiserror::Error)]
pub enum StateError {
    /// A precondition the caller was required to hold was violated.
    #[error("invariant violated: {0}")]
    Invariant(String),
    #[error("not found: {0}")]
    NotFound(String),
    /// All five manual checkpoint slots are occupied.
    #[error("all manual checkpoint slots are occupied")]
    CheckpointFull,
    /// The single-slot queue processor was started while busy.
    #[error("queue processor is busy")]
    QueueBusy,
    #[error(transparent)]
    Storage(#[from] ei_storage::StorageError),
}
