//! Single-slot LLM executor.
//!
//! `start` spawns the transport call and parsing onto a task and returns
//! immediately; the outcome arrives on the completion channel the caller
//! provided. Starting while busy is a hard error — the tick loop owns the
//! one slot and must never double-dispatch.

use std::sync::Arc;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use uuid::Uuid;

use ei_config::Operation;
use ei_llm::{CallOptions, LlmError, LlmTransport};
use ei_state::{ResponseKind, StateError};

use crate::parse::{extract_json_with_repair, is_no_message, strip_echo};

/// A fully prepared unit of LLM work: prompts built, model resolved.
#[derive(Debug, Clone)]
pub struct PreparedCall {
    pub item_id: Uuid,
    pub kind: ResponseKind,
    pub system: String,
    pub user: String,
    /// The final human message, for echo stripping of text responses.
    pub echo_guard: Option<String>,
    pub model: Option<String>,
    pub operation: Operation,
}

/// The interpreted result of a finished call.
#[derive(Debug, Clone)]
pub enum LlmOutcome {
    /// Free text, echo-stripped. `truncated` is carried through so handlers
    /// can log it; the content is still delivered.
    Text { content: String, truncated: bool },
    /// The persona replied with the literal silence token.
    Silence,
    Json(serde_json::Value),
    Raw(String),
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum WorkError {
    #[error("aborted")]
    Aborted,
    #[error("rate limited; retry after {retry_after_secs}s")]
    RateLimited { retry_after_secs: u64 },
    #[error("transport: {0}")]
    Transport(String),
    #[error("response was not valid JSON: {0}")]
    JsonParse(String),
    #[error("response truncated by length limit")]
    Truncated,
}

#[derive(Debug)]
pub struct Completion {
    pub item_id: Uuid,
    pub result: Result<LlmOutcome, WorkError>,
}

struct Flight {
    item_id: Uuid,
    cancel: CancellationToken,
}

pub struct QueueProcessor {
    transport: Arc<dyn LlmTransport>,
    flight: Option<Flight>,
}

impl QueueProcessor {
    pub fn new(transport: Arc<dyn LlmTransport>) -> Self {
        Self {
            transport,
            flight: None,
        }
    }

    pub fn is_busy(&self) -> bool {
        self.flight.is_some()
    }

    pub fn current_item(&self) -> Option<Uuid> {
        self.flight.as_ref().map(|f| f.item_id)
    }

    /// Dispatch a call. Fails with [`StateError::QueueBusy`] while another
    /// call is in flight.
    pub fn start(
        &mut self,
        call: PreparedCall,
        completions: mpsc::UnboundedSender<Completion>,
    ) -> Result<(), StateError> {
        if self.flight.is_some() {
            return Err(StateError::QueueBusy);
        }

        let cancel = CancellationToken::new();
        self.flight = Some(Flight {
            item_id: call.item_id,
            cancel: cancel.clone(),
        });

        let transport = self.transport.clone();
        tokio::spawn(async move {
            let item_id = call.item_id;
            let result = execute(transport, call, cancel).await;
            let _ = completions.send(Completion { item_id, result });
        });
        Ok(())
    }

    /// Cancel the in-flight call, if any. The completion arrives as
    /// `WorkError::Aborted`; the slot stays busy until the caller observes
    /// it and calls [`finish`](Self::finish).
    pub fn abort(&mut self) {
        if let Some(flight) = &self.flight {
            debug!(item = %flight.item_id, "aborting in-flight call");
            flight.cancel.cancel();
        }
    }

    /// Release the slot after its completion has been handled.
    pub fn finish(&mut self, item_id: Uuid) {
        if self.flight.as_ref().is_some_and(|f| f.item_id == item_id) {
            self.flight = None;
        }
    }
}

async fn execute(
    transport: Arc<dyn LlmTransport>,
    call: PreparedCall,
    cancel: CancellationToken,
) -> Result<LlmOutcome, WorkError> {
    let options = CallOptions {
        model: call.model.clone(),
        temperature: None,
        operation: call.operation,
        cancel: cancel.clone(),
    };

    let reply = transport
        .call(&call.system, &call.user, options)
        .await
        .map_err(map_llm_error)?;

    match call.kind {
        ResponseKind::Raw => Ok(LlmOutcome::Raw(reply.content)),
        ResponseKind::Text => {
            if is_no_message(&reply.content) {
                return Ok(LlmOutcome::Silence);
            }
            let content = match &call.echo_guard {
                Some(guard) => strip_echo(&reply.content, guard),
                None => reply.content.trim().to_string(),
            };
            Ok(LlmOutcome::Text {
                content,
                truncated: reply.finish_reason.is_truncated(),
            })
        }
        ResponseKind::Json => {
            if let Some(value) = extract_json_with_repair(&reply.content) {
                return Ok(LlmOutcome::Json(value));
            }
            if reply.finish_reason.is_truncated() {
                // A length-limited JSON reply is not re-requested; the item's
                // own attempt budget decides whether it runs again.
                return Err(WorkError::Truncated);
            }

            let retry_system = format!(
                "{}\n\nYour response MUST be valid JSON. No fences, no prose.",
                call.system
            );
            let retry_options = CallOptions {
                model: call.model,
                temperature: None,
                operation: call.operation,
                cancel,
            };
            let retry = transport
                .call(&retry_system, &call.user, retry_options)
                .await
                .map_err(map_llm_error)?;

            match extract_json_with_repair(&retry.content) {
                Some(value) => Ok(LlmOutcome::Json(value)),
                None if retry.finish_reason.is_truncated() => Err(WorkError::Truncated),
                None => Err(WorkError::JsonParse(crate::parse::parse_error_snippet(
                    &retry.content,
                ))),
            }
        }
    }
}

fn map_llm_error(error: LlmError) -> WorkError {
    match error {
        LlmError::Aborted => WorkError::Aborted,
        LlmError::RateLimited { retry_after_secs } => WorkError::RateLimited { retry_after_secs },
        LlmError::Network(message) => WorkError::Transport(message),
        LlmError::Provider { status, body } => {
            WorkError::Transport(format!("provider {status}: {body}"))
        }
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
