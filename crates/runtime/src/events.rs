//! Events the processor fans out to frontends.
//!
//! Delivery is a `tokio::sync::broadcast` channel: frontends that never
//! subscribe cost nothing, and a lagging subscriber drops old events rather
//! than stalling the core.

use serde::{Deserialize, Serialize};

use ei_state::CheckpointMeta;

/// Coarse queue activity shown in status lines.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QueueActivity {
    Idle,
    Busy,
    Paused,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum ProcessorEvent {
    PersonaAdded(String),
    PersonaUpdated(String),
    PersonaRemoved(String),
    /// A message (human or system) was appended to the persona's thread.
    MessageAdded { persona: String },
    /// A response request for the persona entered the queue.
    MessageQueued { persona: String },
    /// The persona's response request reached the LLM.
    MessageProcessing { persona: String },
    QueueStateChanged(QueueActivity),
    StatePersisted,
    CheckpointStart,
    CheckpointCreated(CheckpointMeta),
    SaveAndExitStart,
    SaveAndExitFinish,
    HumanUpdated,
    OneShotReturned { guid: String, content: String },
    Error { code: String, message: String },
}
