//! The processor core: single-slot LLM execution, handler dispatch, the
//! extraction pipeline, ceremonies, scheduling, and the frontend-facing
//! `Processor` API with its event stream.

mod events;
mod handlers;
mod parse;
mod processor;
mod queue_processor;
mod scheduler;

pub use events::{ProcessorEvent, QueueActivity};
pub use handlers::ExtractionGate;
pub use parse::{extract_json, extract_json_with_repair, is_no_message, strip_echo};
pub use processor::{EmbedFn, PersonaPatch, Processor};
pub use queue_processor::{Completion, LlmOutcome, PreparedCall, QueueProcessor, WorkError};
pub use scheduler::{Scheduler, ceremony_due, heartbeat_eligible};
