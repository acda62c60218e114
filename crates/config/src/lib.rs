//! Application configuration — TOML file with environment overrides.
//!
//! The file lives at `<data_dir>/config.toml` and is created with defaults on
//! first run. Every section uses `#[serde(default)]` so old config files keep
//! working when new fields are added. Environment variables are applied after
//! the file is read, so `EI_LLM_BASE_URL=…` always wins over the file.

use std::env;
use std::fs;
use std::path::Path;

use anyhow::Result;
use serde::{Deserialize, Serialize};

/// Which kind of work an LLM call performs. Each operation can be pinned to
/// its own model via `[llm]` config or the `EI_MODEL_*` variables.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Operation {
    /// Conversational persona responses.
    Response,
    /// Extraction, matching, and other structured-JSON work.
    Concept,
    /// Persona generation and description rewriting.
    Generation,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LlmConfig {
    /// Base URL of the OpenAI-compatible endpoint.
    pub base_url: String,
    /// API key. Usually left empty here and supplied via `EI_LLM_API_KEY`.
    pub api_key: String,
    /// Global default model, `provider:model` or a bare local model name.
    pub model: String,
    pub model_response: Option<String>,
    pub model_concept: Option<String>,
    pub model_generation: Option<String>,
    /// Per-provider account → model mapping (account name as configured in
    /// the human's settings).
    pub log_model_usage: bool,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:11434".to_string(),
            api_key: String::new(),
            model: "llama3.1:8b".to_string(),
            model_response: None,
            model_concept: None,
            model_generation: None,
            log_model_usage: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ScheduleConfig {
    /// Seconds between autosaves of the full state blob.
    pub autosave_secs: u64,
    /// Hours between decay passes over human topics/people and persona topics.
    pub decay_interval_hours: u64,
    /// Local time of day (`HH:MM`) at which Ei's daily ceremony may fire.
    pub ceremony_time: String,
    /// IANA timezone name used to interpret `ceremony_time`.
    pub timezone: String,
}

impl Default for ScheduleConfig {
    fn default() -> Self {
        Self {
            autosave_secs: 300,
            decay_interval_hours: 1,
            ceremony_time: "09:00".to_string(),
            timezone: "UTC".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    /// Default idle threshold before a persona becomes heartbeat-eligible.
    pub heartbeat_delay_ms: u64,
    /// Default sliding context window for `ContextStatus::Default` messages.
    pub context_window_ms: u64,
    /// Floor of the fact/trait extraction frequency gate:
    /// extract when `messages_since >= max(floor, total_extractions)`.
    pub extraction_floor: u32,
    /// Attempts before a failing queue item is dropped.
    pub queue_attempt_cap: u32,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            heartbeat_delay_ms: 30 * 60 * 1000,
            context_window_ms: 24 * 60 * 60 * 1000,
            extraction_floor: 10,
            queue_attempt_cap: 3,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct SyncConfig {
    pub username: Option<String>,
    pub passphrase: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct AppConfig {
    pub llm: LlmConfig,
    pub schedule: ScheduleConfig,
    pub runtime: RuntimeConfig,
    pub sync: SyncConfig,
}

impl AppConfig {
    /// Read the config file if present, fall back to defaults otherwise, then
    /// apply environment overrides on top.
    pub fn load_from(path: impl AsRef<Path>) -> Result<Self> {
        let mut config = Self::default();
        if let Ok(raw) = fs::read_to_string(path) {
            config = toml::from_str(&raw)?;
        }
        config.apply_env();
        Ok(config)
    }

    pub fn save_to(&self, path: impl AsRef<Path>) -> Result<()> {
        if let Some(parent) = path.as_ref().parent() {
            fs::create_dir_all(parent)?;
        }
        let rendered = toml::to_string_pretty(self)?;
        fs::write(path, rendered)?;
        Ok(())
    }

    fn apply_env(&mut self) {
        if let Ok(value) = env::var("EI_LLM_BASE_URL") {
            if !value.is_empty() {
                self.llm.base_url = value;
            }
        }
        if let Ok(value) = env::var("EI_LLM_API_KEY") {
            if !value.is_empty() {
                self.llm.api_key = value;
            }
        }
        if let Ok(value) = env::var("EI_LLM_MODEL") {
            if !value.is_empty() {
                self.llm.model = value;
            }
        }
        if let Ok(value) = env::var("EI_MODEL_RESPONSE") {
            if !value.is_empty() {
                self.llm.model_response = Some(value);
            }
        }
        if let Ok(value) = env::var("EI_MODEL_CONCEPT") {
            if !value.is_empty() {
                self.llm.model_concept = Some(value);
            }
        }
        if let Ok(value) = env::var("EI_MODEL_GENERATION") {
            if !value.is_empty() {
                self.llm.model_generation = Some(value);
            }
        }
        if env::var("EI_LOG_MODEL_USAGE").is_ok_and(|v| v == "1" || v == "true") {
            self.llm.log_model_usage = true;
        }
        if let Ok(value) = env::var("EI_SYNC_USERNAME") {
            if !value.is_empty() {
                self.sync.username = Some(value);
            }
        }
        if let Ok(value) = env::var("EI_SYNC_PASSPHRASE") {
            if !value.is_empty() {
                self.sync.passphrase = Some(value);
            }
        }
    }

    /// Resolve the model for a call: explicit override → operation-specific
    /// config → global default → hardcoded fallback.
    pub fn model_for(&self, operation: Operation, explicit: Option<&str>) -> String {
        if let Some(model) = explicit {
            if !model.is_empty() {
                return model.to_string();
            }
        }
        let per_op = match operation {
            Operation::Response => self.llm.model_response.as_deref(),
            Operation::Concept => self.llm.model_concept.as_deref(),
            Operation::Generation => self.llm.model_generation.as_deref(),
        };
        if let Some(model) = per_op {
            if !model.is_empty() {
                return model.to_string();
            }
        }
        if !self.llm.model.is_empty() {
            return self.llm.model.clone();
        }
        "llama3.1:8b".to_string()
    }
}

/// A parsed model spec. `provider:model` selects a remote provider; a bare
/// name is assumed to be a local model.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelSpec {
    pub provider: Option<String>,
    pub model: String,
}

impl ModelSpec {
    pub fn parse(raw: &str) -> Self {
        match raw.split_once(':') {
            // Guard against model names that legitimately contain ':'
            // (e.g. ollama tags like `llama3.1:8b`): a provider segment is a
            // short alphabetic word.
            Some((provider, model))
                if !provider.is_empty()
                    && provider.chars().all(|c| c.is_ascii_alphabetic())
                    && !model.is_empty()
                    && model.contains(|c: char| !c.is_ascii_digit()) =>
            {
                Self {
                    provider: Some(provider.to_string()),
                    model: model.to_string(),
                }
            }
            _ => Self {
                provider: None,
                model: raw.to_string(),
            },
        }
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let config = AppConfig::default();
        assert_eq!(config.schedule.autosave_secs, 300);
        assert_eq!(config.runtime.queue_attempt_cap, 3);
        assert_eq!(config.runtime.extraction_floor, 10);
    }

    #[test]
    fn roundtrips_through_toml() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("config.toml");
        let mut config = AppConfig::default();
        config.llm.model = "openai:gpt-4o".to_string();
        config.schedule.ceremony_time = "21:30".to_string();
        config.save_to(&path)?;

        let loaded = AppConfig::load_from(&path)?;
        assert_eq!(loaded.llm.model, "openai:gpt-4o");
        assert_eq!(loaded.schedule.ceremony_time, "21:30");
        Ok(())
    }

    #[test]
    fn partial_file_fills_defaults() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "[llm]\nmodel = \"mistral\"\n")?;
        let loaded = AppConfig::load_from(&path)?;
        assert_eq!(loaded.llm.model, "mistral");
        assert_eq!(loaded.schedule.autosave_secs, 300);
        Ok(())
    }

    #[test]
    fn model_selection_chain() {
        let mut config = AppConfig::default();
        config.llm.model = "global".to_string();
        config.llm.model_concept = Some("concept-model".to_string());

        assert_eq!(config.model_for(Operation::Concept, None), "concept-model");
        assert_eq!(config.model_for(Operation::Response, None), "global");
        assert_eq!(
            config.model_for(Operation::Concept, Some("explicit")),
            "explicit"
        );
    }

    #[test]
    fn model_spec_parsing() {
        let spec = ModelSpec::parse("openai:gpt-4o");
        assert_eq!(spec.provider.as_deref(), Some("openai"));
        assert_eq!(spec.model, "gpt-4o");

        let bare = ModelSpec::parse("llama3.1:8b");
        assert!(bare.provider.is_none(), "ollama tag is not a provider");

        let plain = ModelSpec::parse("mistral");
        assert!(plain.provider.is_none());
        assert_eq!(plain.model, "mistral");
    }
}
