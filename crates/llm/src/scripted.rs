//! Playback transport for tests — returns a configured sequence of outcomes
//! and records every prompt it was asked.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::Notify;

use crate::{CallOptions, FinishReason, LlmError, LlmReply, LlmTransport};

/// A recorded call: the prompts and options the transport received.
#[derive(Debug, Clone)]
pub struct RecordedCall {
    pub system: String,
    pub user: String,
    pub model: Option<String>,
}

#[derive(Default)]
struct Script {
    outcomes: VecDeque<Result<LlmReply, LlmError>>,
    calls: Vec<RecordedCall>,
    /// When set, calls block until released — used to test supersession and
    /// abort while a request is in flight.
    gate: Option<Arc<Notify>>,
}

#[derive(Clone, Default)]
pub struct ScriptedTransport {
    script: Arc<Mutex<Script>>,
}

impl ScriptedTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_text(&self, content: impl Into<String>) -> &Self {
        self.push(Ok(LlmReply {
            content: content.into(),
            finish_reason: FinishReason::Stop,
        }))
    }

    pub fn push_truncated(&self, content: impl Into<String>) -> &Self {
        self.push(Ok(LlmReply {
            content: content.into(),
            finish_reason: FinishReason::Length,
        }))
    }

    pub fn push_error(&self, error: LlmError) -> &Self {
        self.push(Err(error))
    }

    fn push(&self, outcome: Result<LlmReply, LlmError>) -> &Self {
        self.script
            .lock()
            .expect("script mutex poisoned")
            .outcomes
            .push_back(outcome);
        self
    }

    /// Make the next calls block until [`release`](Self::release) is called.
    pub fn hold(&self) -> Arc<Notify> {
        let notify = Arc::new(Notify::new());
        self.script.lock().expect("script mutex poisoned").gate = Some(notify.clone());
        notify
    }

    pub fn release(&self) {
        let gate = self
            .script
            .lock()
            .expect("script mutex poisoned")
            .gate
            .take();
        if let Some(gate) = gate {
            gate.notify_waiters();
        }
    }

    pub fn calls(&self) -> Vec<RecordedCall> {
        self.script
            .lock()
            .expect("script mutex poisoned")
            .calls
            .clone()
    }

    pub fn call_count(&self) -> usize {
        self.script.lock().expect("script mutex poisoned").calls.len()
    }

    pub fn remaining(&self) -> usize {
        self.script
            .lock()
            .expect("script mutex poisoned")
            .outcomes
            .len()
    }
}

#[async_trait]
impl LlmTransport for ScriptedTransport {
    async fn call(
        &self,
        system: &str,
        user: &str,
        options: CallOptions,
    ) -> Result<LlmReply, LlmError> {
        let gate = {
            let mut script = self.script.lock().expect("script mutex poisoned");
            script.calls.push(RecordedCall {
                system: system.to_string(),
                user: user.to_string(),
                model: options.model.clone(),
            });
            script.gate.clone()
        };

        if let Some(gate) = gate {
            tokio::select! {
                _ = options.cancel.cancelled() => return Err(LlmError::Aborted),
                _ = gate.notified() => {}
            }
        }
        if options.cancel.is_cancelled() {
            return Err(LlmError::Aborted);
        }

        self.script
            .lock()
            .expect("script mutex poisoned")
            .outcomes
            .pop_front()
            .unwrap_or_else(|| {
                Ok(LlmReply {
                    content: "No Message".to_string(),
                    finish_reason: FinishReason::Stop,
                })
            })
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
