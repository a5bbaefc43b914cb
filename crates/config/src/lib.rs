use std::env;
use std::fs;
use std::path::Path;

use anyhow::Result;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProfileConfig {
    /// Maximum number of `(user, isolations)` profile views held in the LRU cache.
    pub max_cache_size: usize,
    /// Seconds the ingestion worker sleeps between empty dirty-set polls.
    pub update_interval_sec: f64,
    /// Number of pending messages that makes a user's batch fire.
    pub message_limit: usize,
    /// Seconds after a user's first pending message before their batch fires anyway.
    pub time_limit_sec: f64,
    /// Minimum `(feature, tag)` section size that triggers consolidation.
    pub consolidation_threshold: usize,
    /// Maximum uningested messages pulled per user per worker tick.
    pub history_batch_size: usize,
    /// When true, embeddings are generated from `"{feature}: {value}"` instead of
    /// the bare value.  Changing this measurably shifts recall.
    pub embed_feature_in_value: bool,
}

impl Default for ProfileConfig {
    fn default() -> Self {
        Self {
            max_cache_size: 1000,
            update_interval_sec: 2.0,
            message_limit: 5,
            time_limit_sec: 120.0,
            consolidation_threshold: 5,
            history_batch_size: 100,
            embed_feature_in_value: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Path to the embedded redb database file.
    pub path: String,
    /// Upper bound on concurrent storage transactions.
    pub max_concurrent_transactions: usize,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            path: "data/mnemon.redb".to_string(),
            max_concurrent_transactions: 100,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EmbedderConfig {
    pub provider: String,
    pub model: String,
    pub dimensions: usize,
    /// Base URL for the embeddings API.  Overridden at runtime by the
    /// `MNEMON_EMBEDDER_BASE_URL` environment variable when set.
    pub base_url: String,
    /// Name of the environment variable that holds the API key.
    pub api_key_env: String,
    pub max_attempts: u32,
}

impl Default for EmbedderConfig {
    fn default() -> Self {
        Self {
            provider: "openai".to_string(),
            model: "text-embedding-3-small".to_string(),
            dimensions: 1536,
            base_url: "https://api.openai.com/v1".to_string(),
            api_key_env: "OPENAI_API_KEY".to_string(),
            max_attempts: 3,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LanguageModelConfig {
    pub provider: String,
    pub model: String,
    /// Base URL for the chat-completions API.  Overridden at runtime by the
    /// `MNEMON_LLM_BASE_URL` environment variable when set.
    pub base_url: String,
    /// Name of the environment variable that holds the API key.
    pub api_key_env: String,
    pub max_attempts: u32,
}

impl Default for LanguageModelConfig {
    fn default() -> Self {
        Self {
            provider: "openai".to_string(),
            model: "gpt-4o-mini".to_string(),
            base_url: "https://api.openai.com/v1".to_string(),
            api_key_env: "OPENAI_API_KEY".to_string(),
            max_attempts: 3,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PromptConfig {
    /// Which opaque prompt bundle drives extraction and consolidation:
    /// `general`, `crm`, `financial`, or `writing`.
    pub module: String,
}

impl Default for PromptConfig {
    fn default() -> Self {
        Self {
            module: "general".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TelemetryConfig {
    pub log_level: String,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct AppConfig {
    pub profile: ProfileConfig,
    pub storage: StorageConfig,
    pub embedder: EmbedderConfig,
    pub language_model: LanguageModelConfig,
    pub prompt: PromptConfig,
    pub telemetry: TelemetryConfig,
}

impl AppConfig {
    pub fn load_from(path: impl AsRef<Path>) -> Result<Self> {
        let mut config = Self::default();
        if let Ok(raw) = fs::read_to_string(path) {
            config = toml::from_str(&raw)?;
        }

        if let Ok(value) = env::var("MNEMON_LLM_BASE_URL") {
            if !value.is_empty() {
                config.language_model.base_url = value;
            }
        }
        if let Ok(value) = env::var("MNEMON_EMBEDDER_BASE_URL") {
            if !value.is_empty() {
                config.embedder.base_url = value;
            }
        }

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
}
