//! LLM transport — one operation: send a system + user prompt, get text and
//! a finish reason back, or a typed failure.
//!
//! The transport knows nothing about prompt semantics or application state;
//! parsing and retry policy live with the queue processor. Cancellation is
//! cooperative via a [`CancellationToken`] carried in the call options.

mod http;
mod scripted;

pub use http::HttpTransport;
pub use scripted::ScriptedTransport;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use ei_config::Operation;

#[derive(Debug, Clone, thiserror::Error)]
pub enum LlmError {
    #[error("call aborted")]
    Aborted,
    #[error("rate limited; retry after {retry_after_secs}s")]
    RateLimited { retry_after_secs: u64 },
    #[error("network: {0}")]
    Network(String),
    #[error("provider error {status}: {body}")]
    Provider { status: u16, body: String },
}

/// Why the model stopped generating.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FinishReason {
    Stop,
    /// The model hit its output length limit; the content is truncated.
    Length,
    Other,
}

impl FinishReason {
    pub fn from_wire(raw: &str) -> Self {
        match raw {
            "stop" => FinishReason::Stop,
            "length" => FinishReason::Length,
            _ => FinishReason::Other,
        }
    }

    pub fn is_truncated(self) -> bool {
        self == FinishReason::Length
    }
}

#[derive(Debug, Clone)]
pub struct LlmReply {
    pub content: String,
    pub finish_reason: FinishReason,
}

#[derive(Debug, Clone)]
pub struct CallOptions {
    pub model: Option<String>,
    pub temperature: Option<f32>,
    pub operation: Operation,
    pub cancel: CancellationToken,
}

impl CallOptions {
    pub fn new(operation: Operation) -> Self {
        Self {
            model: None,
            temperature: None,
            operation,
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_cancel(operation: Operation, cancel: CancellationToken) -> Self {
        Self {
            model: None,
            temperature: None,
            operation,
            cancel,
        }
    }
}

#[async_trait]
pub trait LlmTransport: Send + Sync {
    async fn call(
        &self,
        system: &str,
        user: &str,
        options: CallOptions,
    ) -> Result<LlmReply, LlmError>;
}
