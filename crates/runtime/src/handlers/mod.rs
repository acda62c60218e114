//! Handler dispatch — every finished queue item lands here.
//!
//! Handlers run synchronously inside the tick loop with the state lock held.
//! They mutate state and enqueue follow-ups; anything LLM-bound goes back
//! through the queue rather than being awaited inline.

mod extraction;
mod persona;
mod response;

pub use extraction::ExtractionGate;
pub use persona::apply_decay_tick;

use std::collections::HashSet;

use tokio::sync::broadcast;
use tracing::warn;

use ei_config::AppConfig;
use ei_state::schema::DataKind;
use ei_state::{Request, StateManager};
use uuid::Uuid;

use crate::events::ProcessorEvent;
use crate::queue_processor::LlmOutcome;

/// A data item whose embedding should be recomputed (name or description
/// changed). Drained by the processor when an embedding service is attached.
#[derive(Debug, Clone)]
pub struct EmbedTask {
    pub kind: DataKind,
    pub item_id: Uuid,
    pub text: String,
}

/// Everything a handler may touch. Borrowed pieces of the processor core so
/// handlers stay plain functions.
pub struct HandlerCtx<'a> {
    pub state: &'a mut StateManager,
    pub events: &'a broadcast::Sender<ProcessorEvent>,
    pub config: &'a AppConfig,
    pub gate: &'a mut ExtractionGate,
    /// Personas with a response or heartbeat currently queued or in flight.
    pub processing: &'a mut HashSet<String>,
    pub pending_embeds: &'a mut Vec<EmbedTask>,
}

impl HandlerCtx<'_> {
    pub fn emit(&self, event: ProcessorEvent) {
        // No subscribers is fine; events are strictly optional.
        let _ = self.events.send(event);
    }
}

#[cfg(test)]
pub(crate) mod testing {
    //! Shared fixture for handler tests: a fresh state plus every borrowed
    //! piece a `HandlerCtx` wants.

    use super::*;
    use ei_config::AppConfig;

    pub(crate) struct Harness {
        pub state: StateManager,
        pub events: tokio::sync::broadcast::Sender<ProcessorEvent>,
        pub config: AppConfig,
        pub gate: ExtractionGate,
        pub processing: HashSet<String>,
        pub pending_embeds: Vec<EmbedTask>,
    }

    impl Harness {
        pub fn new() -> Self {
            let (events, _) = tokio::sync::broadcast::channel(64);
            Self {
                state: StateManager::new(),
                events,
                config: AppConfig::default(),
                gate: ExtractionGate::default(),
                processing: HashSet::new(),
                pending_embeds: Vec::new(),
            }
        }

        pub fn ctx(&mut self) -> HandlerCtx<'_> {
            HandlerCtx {
                state: &mut self.state,
                events: &self.events,
                config: &self.config,
                gate: &mut self.gate,
                processing: &mut self.processing,
                pending_embeds: &mut self.pending_embeds,
            }
        }
    }
}

/// Dispatch one completed request to its handler. Unknown combinations are a
/// programming error upstream (the queue processor parsed by the request's
/// own kind), so they fail the item loudly rather than guessing.
pub fn dispatch(ctx: &mut HandlerCtx, request: &Request, outcome: LlmOutcome) -> anyhow::Result<()> {
    match (request, outcome) {
        (Request::PersonaResponse { persona, .. }, outcome) => {
            response::handle_persona_response(ctx, persona, outcome)
        }
        (Request::HeartbeatCheck { persona }, outcome) => {
            response::handle_heartbeat(ctx, persona, outcome)
        }
        (
            Request::FastScan {
                persona,
                kind,
                message_ids,
            },
            LlmOutcome::Json(value),
        ) => extraction::handle_fast_scan(ctx, persona, *kind, message_ids, value),
        (
            Request::ItemMatch {
                persona,
                kind,
                candidate,
                message_ids,
            },
            LlmOutcome::Json(value),
        ) => extraction::handle_item_match(ctx, persona, *kind, candidate, message_ids, value),
        (
            Request::ItemUpdate {
                persona,
                kind,
                existing_id,
                message_ids,
                ..
            },
            LlmOutcome::Json(value),
        ) => extraction::handle_item_update(ctx, persona, *kind, *existing_id, message_ids, value),
        (Request::PersonaGeneration { name, description }, LlmOutcome::Json(value)) => {
            persona::handle_persona_generation(ctx, name, description, value)
        }
        (Request::PersonaExplore { persona }, LlmOutcome::Json(value)) => {
            persona::handle_persona_explore(ctx, persona, value)
        }
        (Request::DescriptionCheck { persona }, LlmOutcome::Json(value)) => {
            persona::handle_description_check(ctx, persona, value)
        }
        (Request::CeremonyExposure { persona }, LlmOutcome::Json(value)) => {
            persona::handle_ceremony_exposure(ctx, persona, value)
        }
        (Request::OneShot { guid, .. }, LlmOutcome::Raw(content)) => {
            ctx.emit(ProcessorEvent::OneShotReturned {
                guid: guid.clone(),
                content,
            });
            Ok(())
        }
        (request, outcome) => {
            warn!(
                step = request.label(),
                "no handler for outcome {outcome:?}"
            );
            anyhow::bail!("no handler for {} outcome", request.label());
        }
    }
}
