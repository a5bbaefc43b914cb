//! Language-model and embedder adapters.
//!
//! The memory engine only ever talks to the [`LanguageModel`] and [`Embedder`]
//! traits; the concrete adapters here speak the OpenAI-compatible wire format
//! (chat completions and embeddings), which covers OpenAI itself plus the
//! many local servers that mimic it.

use std::time::Duration;

use async_trait::async_trait;
use serde_json::{Value, json};
use thiserror::Error;
use tracing::{debug, warn};

pub type AdapterResult<T> = Result<T, AdapterError>;

#[derive(Debug, Error)]
pub enum AdapterError {
    /// Malformed caller arguments: empty batches, zero attempts, and the like.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    /// The upstream API failed after all attempts were exhausted.
    #[error("{provider} request failed (status {status:?}): {message}")]
    Api {
        provider: String,
        status: Option<u16>,
        message: String,
    },
}

impl AdapterError {
    fn api(provider: &str, status: Option<u16>, message: impl Into<String>) -> Self {
        Self::Api {
            provider: provider.to_string(),
            status,
            message: message.into(),
        }
    }
}

/// Distance function the embedder's vectors are meant to be compared with.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SimilarityMetric {
    Cosine,
    Dot,
    Euclidean,
    Manhattan,
}

/// A text-generation model driven by a system prompt and a user prompt.
#[async_trait]
pub trait LanguageModel: Send + Sync {
    /// Generate a response.  Returns the response text and any structured tool
    /// calls the model produced (`Value::Null` when there are none).
    ///
    /// `max_attempts` must be at least 1; transient upstream failures are
    /// retried up to that many times with backoff.
    async fn generate_response(
        &self,
        system_prompt: Option<&str>,
        user_prompt: Option<&str>,
        tools: Option<&Value>,
        tool_choice: Option<&Value>,
        max_attempts: u32,
    ) -> AdapterResult<(String, Value)>;
}

/// A text-embedding model.  Ingest and search embeddings are distinct calls
/// because some providers train asymmetric document/query encoders.
#[async_trait]
pub trait Embedder: Send + Sync {
    async fn ingest_embed(
        &self,
        inputs: &[String],
        max_attempts: u32,
    ) -> AdapterResult<Vec<Vec<f32>>>;

    async fn search_embed(
        &self,
        queries: &[String],
        max_attempts: u32,
    ) -> AdapterResult<Vec<Vec<f32>>>;

    fn model_id(&self) -> &str;

    fn dimensions(&self) -> usize;

    fn similarity_metric(&self) -> SimilarityMetric {
        SimilarityMetric::Cosine
    }
}

fn check_attempts(max_attempts: u32) -> AdapterResult<()> {
    if max_attempts == 0 {
        return Err(AdapterError::InvalidArgument(
            "max_attempts must be at least 1".to_string(),
        ));
    }
    Ok(())
}

fn backoff(attempt: u32) -> Duration {
    Duration::from_millis(250 * u64::from(attempt))
}

// ── OpenAI-compatible chat model ──────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct OpenAiChatModel {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
    model: String,
}

impl OpenAiChatModel {
    pub fn new(base_url: &str, api_key: &str, model: &str) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key: api_key.to_string(),
            model: model.to_string(),
        }
    }

    fn build_payload(
        &self,
        system_prompt: Option<&str>,
        user_prompt: Option<&str>,
        tools: Option<&Value>,
        tool_choice: Option<&Value>,
    ) -> Value {
        let mut messages = Vec::new();
        if let Some(system) = system_prompt {
            messages.push(json!({"role": "system", "content": system}));
        }
        if let Some(user) = user_prompt {
            messages.push(json!({"role": "user", "content": user}));
        }

        let mut payload = json!({
            "model": self.model,
            "messages": messages,
        });
        if let Some(tools_val) = tools {
            payload["tools"] = tools_val.clone();
        }
        if let Some(choice) = tool_choice {
            payload["tool_choice"] = choice.clone();
        }
        payload
    }

    async fn request_once(&self, payload: &Value) -> AdapterResult<(String, Value)> {
        let endpoint = format!("{}/chat/completions", self.base_url);
        let response = self
            .client
            .post(&endpoint)
            .bearer_auth(&self.api_key)
            .json(payload)
            .send()
            .await
            .map_err(|e| AdapterError::api("language model", None, e.to_string()))?;

        let status = response.status();
        let body: Value = response
            .json()
            .await
            .map_err(|e| AdapterError::api("language model", Some(status.as_u16()), e.to_string()))?;

        if !status.is_success() {
            return Err(AdapterError::api(
                "language model",
                Some(status.as_u16()),
                body.to_string(),
            ));
        }

        let message = &body["choices"][0]["message"];
        let text = message["content"].as_str().unwrap_or_default().to_string();
        let tool_calls = message.get("tool_calls").cloned().unwrap_or(Value::Null);
        Ok((text, tool_calls))
    }
}

#[async_trait]
impl LanguageModel for OpenAiChatModel {
    async fn generate_response(
        &self,
        system_prompt: Option<&str>,
        user_prompt: Option<&str>,
        tools: Option<&Value>,
        tool_choice: Option<&Value>,
        max_attempts: u32,
    ) -> AdapterResult<(String, Value)> {
        check_attempts(max_attempts)?;
        if system_prompt.is_none() && user_prompt.is_none() {
            return Err(AdapterError::InvalidArgument(
                "at least one of system_prompt and user_prompt is required".to_string(),
            ));
        }

        let payload = self.build_payload(system_prompt, user_prompt, tools, tool_choice);

        let mut last_err = None;
        for attempt in 1..=max_attempts {
            match self.request_once(&payload).await {
                Ok(result) => {
                    debug!(model = %self.model, attempt, "chat completion succeeded");
                    return Ok(result);
                }
                Err(err) => {
                    warn!(model = %self.model, attempt, %err, "chat completion attempt failed");
                    last_err = Some(err);
                    if attempt < max_attempts {
                        tokio::time::sleep(backoff(attempt)).await;
                    }
                }
            }
        }
        Err(last_err.expect("at least one attempt was made"))
    }
}

// ── OpenAI-compatible embedder ────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct OpenAiEmbedder {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
    model: String,
    dimensions: usize,
}

impl OpenAiEmbedder {
    pub fn new(base_url: &str, api_key: &str, model: &str, dimensions: usize) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key: api_key.to_string(),
            model: model.to_string(),
            dimensions,
        }
    }

    async fn embed(&self, inputs: &[String], max_attempts: u32) -> AdapterResult<Vec<Vec<f32>>> {
        check_attempts(max_attempts)?;
        if inputs.is_empty() {
            return Err(AdapterError::InvalidArgument(
                "inputs must not be empty".to_string(),
            ));
        }

        let payload = json!({
            "model": self.model,
            "input": inputs,
        });

        let mut last_err = None;
        for attempt in 1..=max_attempts {
            match self.request_once(&payload).await {
                Ok(vectors) => return Ok(vectors),
                Err(err) => {
                    warn!(model = %self.model, attempt, %err, "embedding attempt failed");
                    last_err = Some(err);
                    if attempt < max_attempts {
                        tokio::time::sleep(backoff(attempt)).await;
                    }
                }
            }
        }
        Err(last_err.expect("at least one attempt was made"))
    }

    async fn request_once(&self, payload: &Value) -> AdapterResult<Vec<Vec<f32>>> {
        let endpoint = format!("{}/embeddings", self.base_url);
        let response = self
            .client
            .post(&endpoint)
            .bearer_auth(&self.api_key)
            .json(payload)
            .send()
            .await
            .map_err(|e| AdapterError::api("embedder", None, e.to_string()))?;

        let status = response.status();
        let body: Value = response
            .json()
            .await
            .map_err(|e| AdapterError::api("embedder", Some(status.as_u16()), e.to_string()))?;

        if !status.is_success() {
            return Err(AdapterError::api(
                "embedder",
                Some(status.as_u16()),
                body.to_string(),
            ));
        }

        let data = body["data"].as_array().ok_or_else(|| {
            AdapterError::api("embedder", Some(status.as_u16()), "response missing data array")
        })?;

        let mut vectors = Vec::with_capacity(data.len());
        for item in data {
            let embedding = item["embedding"].as_array().ok_or_else(|| {
                AdapterError::api("embedder", None, "response item missing embedding")
            })?;
            vectors.push(
                embedding
                    .iter()
                    .filter_map(Value::as_f64)
                    .map(|v| v as f32)
                    .collect(),
            );
        }
        Ok(vectors)
    }
}

#[async_trait]
impl Embedder for OpenAiEmbedder {
    async fn ingest_embed(
        &self,
        inputs: &[String],
        max_attempts: u32,
    ) -> AdapterResult<Vec<Vec<f32>>> {
        self.embed(inputs, max_attempts).await
    }

    async fn search_embed(
        &self,
        queries: &[String],
        max_attempts: u32,
    ) -> AdapterResult<Vec<Vec<f32>>> {
        self.embed(queries, max_attempts).await
    }

    fn model_id(&self) -> &str {
        &self.model
    }

    fn dimensions(&self) -> usize {
        self.dimensions
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
