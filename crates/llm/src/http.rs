//! OpenAI-compatible HTTP transport.
//!
//! `POST {base}/v1/chat/completions` with a system + user message pair.
//! Streaming is not used; the whole completion comes back in one body.

use async_trait::async_trait;
use serde_json::json;
use tracing::{debug, info};

use ei_config::{AppConfig, ModelSpec};

use crate::{CallOptions, FinishReason, LlmError, LlmReply, LlmTransport};

#[derive(Debug, Clone)]
pub struct HttpTransport {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
    config: AppConfig,
}

impl HttpTransport {
    pub fn new(config: AppConfig) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: config.llm.base_url.trim_end_matches('/').to_string(),
            api_key: config.llm.api_key.clone(),
            config,
        }
    }

    fn resolve_model(&self, options: &CallOptions) -> String {
        let raw = self
            .config
            .model_for(options.operation, options.model.as_deref());
        // The wire wants the bare model id; the provider prefix only selects
        // routing and is stripped here.
        ModelSpec::parse(&raw).model
    }

    async fn post_completion(
        &self,
        system: &str,
        user: &str,
        options: &CallOptions,
    ) -> Result<LlmReply, LlmError> {
        let model = self.resolve_model(options);
        let endpoint = format!("{}/v1/chat/completions", self.base_url);
        let payload = json!({
            "model": model,
            "messages": [
                {"role": "system", "content": system},
                {"role": "user", "content": user},
            ],
            "temperature": options.temperature.unwrap_or(0.7),
        });

        if self.config.llm.log_model_usage {
            info!(%model, operation = ?options.operation, "llm call");
        }

        let mut request = self
            .client
            .post(&endpoint)
            .header("HTTP-Referer", "https://ei.local")
            .header("X-Title", "Ei")
            .json(&payload);
        if !self.api_key.is_empty() {
            request = request.bearer_auth(&self.api_key);
        }

        let response = request
            .send()
            .await
            .map_err(|err| LlmError::Network(err.to_string()))?;

        let status = response.status();
        if status.as_u16() == 429 {
            let retry_after_secs = response
                .headers()
                .get("retry-after")
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.parse().ok())
                .unwrap_or(5);
            return Err(LlmError::RateLimited { retry_after_secs });
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(LlmError::Provider {
                status: status.as_u16(),
                body: truncate(&body, 500),
            });
        }

        let body: serde_json::Value = response
            .json()
            .await
            .map_err(|err| LlmError::Network(err.to_string()))?;

        let choice = body
            .get("choices")
            .and_then(|c| c.get(0))
            .ok_or_else(|| LlmError::Provider {
                status: status.as_u16(),
                body: "response has no choices".to_string(),
            })?;

        let content = choice
            .get("message")
            .and_then(|m| m.get("content"))
            .and_then(|v| v.as_str())
            .unwrap_or("")
            .to_string();

        let finish_reason = choice
            .get("finish_reason")
            .and_then(|v| v.as_str())
            .map(FinishReason::from_wire)
            .unwrap_or(FinishReason::Other);

        debug!(len = content.len(), ?finish_reason, "llm reply received");
        Ok(LlmReply {
            content,
            finish_reason,
        })
    }
}

#[async_trait]
impl LlmTransport for HttpTransport {
    async fn call(
        &self,
        system: &str,
        user: &str,
        options: CallOptions,
    ) -> Result<LlmReply, LlmError> {
        let cancel = options.cancel.clone();
        tokio::select! {
            _ = cancel.cancelled() => Err(LlmError::Aborted),
            result = self.post_completion(system, user, &options) => result,
        }
    }
}

fn truncate(text: &str, max: usize) -> String {
    if text.len() <= max {
        text.to_string()
    } else {
        let mut cut = max;
        while !text.is_char_boundary(cut) {
            cut -= 1;
        }
        format!("{}…", &text[..cut])
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
