//! Public profile-memory facade: wires cache, tracker, storage, adapters, and
//! the background ingestion worker behind one handle.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use serde_json::Value;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use mnemon_llm::{Embedder, LanguageModel};
use mnemon_prompt::PromptBundle;

use crate::cache::ProfileCache;
use crate::error::{MemoryError, Result};
use crate::ingest::spawn_ingestion_worker;
use crate::range_filter::range_filter;
use crate::schema::{Isolations, NewProfileFeature, ProfileEntry, ProfileView};
use crate::storage::ProfileStorage;
use crate::tracker::UpdateTrackerManager;

/// Engine tunables; defaults match the documented configuration.
#[derive(Debug, Clone)]
pub struct EngineSettings {
    pub max_cache_size: usize,
    pub update_interval_sec: f64,
    pub message_limit: usize,
    pub time_limit_sec: f64,
    pub consolidation_threshold: usize,
    pub history_batch_size: usize,
    pub embed_feature_in_value: bool,
    pub llm_max_attempts: u32,
    pub embed_max_attempts: u32,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            max_cache_size: 1000,
            update_interval_sec: 2.0,
            message_limit: 5,
            time_limit_sec: 120.0,
            consolidation_threshold: 5,
            history_batch_size: 100,
            embed_feature_in_value: false,
            llm_max_attempts: 3,
            embed_max_attempts: 3,
        }
    }
}

impl EngineSettings {
    fn validate(&self) -> Result<()> {
        if !(self.update_interval_sec > 0.0) {
            return Err(MemoryError::InvalidInput(
                "update_interval_sec must be positive".to_string(),
            ));
        }
        if self.consolidation_threshold < 2 {
            return Err(MemoryError::InvalidInput(
                "consolidation_threshold must be at least 2".to_string(),
            ));
        }
        if self.history_batch_size == 0 {
            return Err(MemoryError::InvalidInput(
                "history_batch_size must be positive".to_string(),
            ));
        }
        if self.llm_max_attempts == 0 || self.embed_max_attempts == 0 {
            return Err(MemoryError::InvalidInput(
                "adapter max_attempts must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

/// Semantic-search parameters with the engine's documented defaults.
#[derive(Debug, Clone)]
pub struct SearchRequest {
    pub query: String,
    pub user_id: String,
    pub isolations: Isolations,
    /// Maximum candidates fetched from storage.
    pub k: usize,
    /// Minimum cosine similarity for a candidate.
    pub min_cos: f32,
    /// Range gate for the post-search filter.
    pub max_range: f32,
    /// Standard-deviation gate for the post-search filter.
    pub max_std: f32,
}

impl Default for SearchRequest {
    fn default() -> Self {
        Self {
            query: String::new(),
            user_id: String::new(),
            isolations: Isolations::new(),
            k: 1_000_000,
            min_cos: -1.0,
            max_range: 2.0,
            max_std: 1.0,
        }
    }
}

/// Shared state between the facade and the background worker.
pub(crate) struct EngineCore {
    pub(crate) storage: Arc<dyn ProfileStorage>,
    pub(crate) model: Arc<dyn LanguageModel>,
    pub(crate) embedder: Arc<dyn Embedder>,
    pub(crate) cache: ProfileCache,
    pub(crate) tracker: UpdateTrackerManager,
    pub(crate) update_prompt: String,
    pub(crate) consolidation_prompt: String,
    pub(crate) settings: EngineSettings,
}

impl EngineCore {
    /// Cache-through profile read.
    pub(crate) async fn profile_cached(
        &self,
        user_id: &str,
        isolations: &Isolations,
    ) -> Result<ProfileView> {
        if let Some(view) = self.cache.get(user_id, isolations) {
            return Ok(view);
        }
        let view = self.storage.get_profile(user_id, isolations).await?;
        self.cache.put(user_id, isolations, view.clone());
        Ok(view)
    }

    /// Embed `value` and insert a profile feature, invalidating the cache.
    #[allow(clippy::too_many_arguments)]
    pub(crate) async fn add_new_profile(
        &self,
        user_id: &str,
        feature: &str,
        value: &str,
        tag: &str,
        metadata: Value,
        isolations: &Isolations,
        citations: Vec<i64>,
    ) -> Result<()> {
        self.cache.erase(user_id, isolations);
        let input = if self.settings.embed_feature_in_value {
            format!("{feature}: {value}")
        } else {
            value.to_string()
        };
        let vectors = self
            .embedder
            .ingest_embed(&[input], self.settings.embed_max_attempts)
            .await?;
        let embedding = vectors.into_iter().next().ok_or_else(|| {
            MemoryError::ExternalService(anyhow::anyhow!("embedder returned no vector"))
        })?;
        self.storage
            .add_profile_feature(NewProfileFeature {
                user_id: user_id.to_string(),
                feature: feature.to_string(),
                value: value.to_string(),
                tag: tag.to_string(),
                embedding,
                metadata,
                isolations: isolations.clone(),
                citations,
            })
            .await
    }

    pub(crate) async fn delete_profile_feature(
        &self,
        user_id: &str,
        feature: &str,
        tag: &str,
        value: Option<&str>,
        isolations: &Isolations,
    ) -> Result<()> {
        self.cache.erase(user_id, isolations);
        self.storage
            .delete_profile_feature(user_id, feature, tag, value, isolations)
            .await
    }
}

/// The profile memory engine.
///
/// `startup` launches the background ingestion worker; `shutdown` signals it,
/// waits for the in-flight batch, and releases storage.  Both are safe to
/// call at most once; extra calls are warned no-ops.
pub struct ProfileMemory {
    core: Arc<EngineCore>,
    shutdown_tx: watch::Sender<bool>,
    worker: Mutex<Option<JoinHandle<()>>>,
    started: AtomicBool,
}

impl ProfileMemory {
    pub fn new(
        model: Arc<dyn LanguageModel>,
        embedder: Arc<dyn Embedder>,
        prompts: &PromptBundle,
        storage: Arc<dyn ProfileStorage>,
        settings: EngineSettings,
    ) -> Result<Self> {
        settings.validate()?;
        let cache = ProfileCache::new(settings.max_cache_size)?;
        let tracker = UpdateTrackerManager::new(settings.message_limit, settings.time_limit_sec)?;
        let (shutdown_tx, _) = watch::channel(false);

        Ok(Self {
            core: Arc::new(EngineCore {
                storage,
                model,
                embedder,
                cache,
                tracker,
                update_prompt: prompts.update_prompt(),
                consolidation_prompt: prompts.consolidation_prompt().to_string(),
                settings,
            }),
            shutdown_tx,
            worker: Mutex::new(None),
            started: AtomicBool::new(false),
        })
    }

    pub async fn startup(&self) -> Result<()> {
        if self.started.swap(true, Ordering::SeqCst) {
            warn!("profile memory startup called more than once; ignoring");
            return Ok(());
        }
        self.core.storage.startup().await?;
        let handle =
            spawn_ingestion_worker(Arc::clone(&self.core), self.shutdown_tx.subscribe());
        *self.worker.lock().unwrap_or_else(PoisonError::into_inner) = Some(handle);
        info!("profile memory started");
        Ok(())
    }

    pub async fn shutdown(&self) -> Result<()> {
        let _ = self.shutdown_tx.send(true);
        let handle = self
            .worker
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(handle) = handle {
            if let Err(err) = handle.await {
                warn!(%err, "ingestion worker ended abnormally");
            }
        }
        self.core.storage.cleanup().await?;
        info!("profile memory stopped");
        Ok(())
    }

    /// Append a message to history and mark the user dirty.  Returns without
    /// waiting for any LLM work; the background worker picks the message up.
    pub async fn ingest_message(
        &self,
        user_id: &str,
        content: &str,
        metadata: Value,
        isolations: &Isolations,
    ) -> Result<()> {
        let content = match metadata.get("speaker").and_then(Value::as_str) {
            Some(speaker) => format!("{speaker} sends '{content}'"),
            None => content.to_string(),
        };
        self.core
            .storage
            .add_history(user_id, &content, metadata, isolations)
            .await?;
        self.core.tracker.mark_update(user_id);
        Ok(())
    }

    pub async fn get_profile(&self, user_id: &str, isolations: &Isolations) -> Result<ProfileView> {
        self.core.profile_cached(user_id, isolations).await
    }

    #[allow(clippy::too_many_arguments)]
    pub async fn add_feature(
        &self,
        user_id: &str,
        feature: &str,
        value: &str,
        tag: &str,
        metadata: Value,
        isolations: &Isolations,
        citations: Vec<i64>,
    ) -> Result<()> {
        self.core
            .add_new_profile(user_id, feature, value, tag, metadata, isolations, citations)
            .await
    }

    pub async fn delete_feature(
        &self,
        user_id: &str,
        feature: &str,
        tag: &str,
        value: Option<&str>,
        isolations: &Isolations,
    ) -> Result<()> {
        self.core
            .delete_profile_feature(user_id, feature, tag, value, isolations)
            .await
    }

    pub async fn delete_user_profile(&self, user_id: &str, isolations: &Isolations) -> Result<()> {
        self.core.cache.erase(user_id, isolations);
        self.core.storage.delete_profile(user_id, isolations).await
    }

    pub async fn delete_all(&self) -> Result<()> {
        self.core.cache.clear();
        self.core.storage.delete_all().await
    }

    /// Embed the query, search storage, and truncate the ranked results with
    /// the range filter.
    pub async fn semantic_search(&self, request: SearchRequest) -> Result<Vec<ProfileEntry>> {
        let vectors = self
            .core
            .embedder
            .search_embed(
                std::slice::from_ref(&request.query),
                self.core.settings.embed_max_attempts,
            )
            .await?;
        let query = vectors.into_iter().next().ok_or_else(|| {
            MemoryError::ExternalService(anyhow::anyhow!("embedder returned no vector"))
        })?;

        let candidates = self
            .core
            .storage
            .semantic_search(
                &request.user_id,
                &query,
                request.k,
                request.min_cos,
                &request.isolations,
            )
            .await?;

        let ranked: Vec<(f32, ProfileEntry)> = candidates
            .into_iter()
            .map(|entry| (entry.similarity_score(), entry))
            .collect();
        Ok(range_filter(ranked, request.max_range, request.max_std))
    }

    pub async fn uningested_count(&self) -> Result<u64> {
        self.core
            .storage
            .get_uningested_history_messages_count()
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::IsolationValue;
    use crate::storage::redb_store::RedbProfileStore;
    use async_trait::async_trait;
    use mnemon_llm::{AdapterError, AdapterResult};
    use std::collections::VecDeque;
    use std::time::Duration;

    /// Pops scripted responses in order; returns `{}` once the script runs dry.
    struct ScriptedModel {
        responses: Mutex<VecDeque<std::result::Result<String, String>>>,
    }

    impl ScriptedModel {
        fn new(responses: Vec<std::result::Result<String, String>>) -> Self {
            Self {
                responses: Mutex::new(responses.into_iter().collect()),
            }
        }
    }

    #[async_trait]
    impl LanguageModel for ScriptedModel {
        async fn generate_response(
            &self,
            _system_prompt: Option<&str>,
            _user_prompt: Option<&str>,
            _tools: Option<&Value>,
            _tool_choice: Option<&Value>,
            _max_attempts: u32,
        ) -> AdapterResult<(String, Value)> {
            let next = self
                .responses
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .pop_front();
            match next {
                Some(Ok(text)) => Ok((text, Value::Null)),
                Some(Err(message)) => Err(AdapterError::Api {
                    provider: "scripted".to_string(),
                    status: None,
                    message,
                }),
                None => Ok(("{}".to_string(), Value::Null)),
            }
        }
    }

    /// Embeds every input to the same unit vector, making all cosines 1.0.
    struct FixedEmbedder;

    #[async_trait]
    impl Embedder for FixedEmbedder {
        async fn ingest_embed(
            &self,
            inputs: &[String],
            _max_attempts: u32,
        ) -> AdapterResult<Vec<Vec<f32>>> {
            Ok(inputs.iter().map(|_| vec![1.0, 0.0]).collect())
        }

        async fn search_embed(
            &self,
            queries: &[String],
            _max_attempts: u32,
        ) -> AdapterResult<Vec<Vec<f32>>> {
            Ok(queries.iter().map(|_| vec![1.0, 0.0]).collect())
        }

        fn model_id(&self) -> &str {
            "fixed"
        }

        fn dimensions(&self) -> usize {
            2
        }
    }

    fn iso(pairs: &[(&str, &str)]) -> Isolations {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), IsolationValue::from(*v)))
            .collect()
    }

    fn settings() -> EngineSettings {
        EngineSettings {
            max_cache_size: 16,
            update_interval_sec: 0.05,
            message_limit: 1,
            time_limit_sec: 120.0,
            consolidation_threshold: 2,
            history_batch_size: 100,
            ..EngineSettings::default()
        }
    }

    fn memory_with(
        dir: &tempfile::TempDir,
        responses: Vec<std::result::Result<String, String>>,
        settings: EngineSettings,
    ) -> ProfileMemory {
        let storage =
            Arc::new(RedbProfileStore::new(dir.path().join("profiles.redb"), 8).unwrap());
        ProfileMemory::new(
            Arc::new(ScriptedModel::new(responses)),
            Arc::new(FixedEmbedder),
            mnemon_prompt::bundle("general").unwrap(),
            storage,
            settings,
        )
        .unwrap()
    }

    async fn drain(memory: &ProfileMemory) {
        for _ in 0..250 {
            if memory.uningested_count().await.unwrap() == 0 {
                return;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        panic!("ingestion did not drain in time");
    }

    #[test]
    fn invalid_settings_are_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let storage =
            Arc::new(RedbProfileStore::new(dir.path().join("profiles.redb"), 8).unwrap());
        let bad = EngineSettings {
            consolidation_threshold: 1,
            ..EngineSettings::default()
        };
        let err = ProfileMemory::new(
            Arc::new(ScriptedModel::new(Vec::new())),
            Arc::new(FixedEmbedder),
            mnemon_prompt::bundle("general").unwrap(),
            storage,
            bad,
        )
        .err()
        .unwrap();
        assert!(matches!(err, MemoryError::InvalidInput(_)));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn ingest_then_search_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let memory = memory_with(
            &dir,
            vec![Ok(
                r#"{"1":{"command":"add","feature":"likes","tag":"pets","value":"dogs"}}"#
                    .to_string(),
            )],
            settings(),
        );
        let scope = iso(&[("group", "g"), ("session", "s")]);

        memory.startup().await.unwrap();
        memory
            .ingest_message("u", "I like dogs", Value::Object(Default::default()), &scope)
            .await
            .unwrap();
        drain(&memory).await;

        let results = memory
            .semantic_search(SearchRequest {
                query: "pets I own".to_string(),
                user_id: "u".to_string(),
                isolations: scope.clone(),
                k: 5,
                min_cos: -1.0,
                max_range: 2.0,
                max_std: 1.0,
            })
            .await
            .unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].feature, "likes");
        assert_eq!(results[0].value, "dogs");
        assert_eq!(results[0].citations, vec![1]);

        // The profile view carries the same fact, cited to the message.
        let view = memory.get_profile("u", &scope).await.unwrap();
        assert_eq!(view["pets"]["likes"][0].value, "dogs");

        memory.shutdown().await.unwrap();
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn delete_command_applies_before_add() {
        let dir = tempfile::tempdir().unwrap();
        let memory = memory_with(
            &dir,
            vec![Ok(r#"{
                "1": {"command": "delete", "feature": "tone", "tag": "w"},
                "2": {"command": "add", "feature": "tone", "tag": "w", "value": "formal"}
            }"#
            .to_string())],
            settings(),
        );
        let scope = iso(&[]);

        memory.startup().await.unwrap();
        memory
            .add_feature("u", "tone", "casual", "w", Value::Null, &scope, Vec::new())
            .await
            .unwrap();

        memory
            .ingest_message("u", "please be formal", Value::Object(Default::default()), &scope)
            .await
            .unwrap();
        drain(&memory).await;

        let view = memory.get_profile("u", &scope).await.unwrap();
        assert_eq!(view["w"]["tone"].len(), 1);
        assert_eq!(view["w"]["tone"][0].value, "formal");

        memory.shutdown().await.unwrap();
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn batched_messages_apply_in_history_order() {
        let dir = tempfile::tempdir().unwrap();
        // Both messages land in one batch; the second message's commands must
        // see (and here, replace) what the first message added.
        let memory = memory_with(
            &dir,
            vec![
                Ok(r#"{"1":{"command":"add","feature":"plan","tag":"travel","value":"one"}}"#
                    .to_string()),
                Ok(r#"{
                    "1": {"command": "delete", "feature": "plan", "tag": "travel"},
                    "2": {"command": "add", "feature": "plan", "tag": "travel", "value": "two"}
                }"#
                .to_string()),
            ],
            EngineSettings {
                message_limit: 2,
                ..settings()
            },
        );
        let scope = iso(&[("g", "G")]);

        memory.startup().await.unwrap();
        memory
            .ingest_message("u", "first", Value::Object(Default::default()), &scope)
            .await
            .unwrap();
        memory
            .ingest_message("u", "second", Value::Object(Default::default()), &scope)
            .await
            .unwrap();
        drain(&memory).await;

        let view = memory.get_profile("u", &scope).await.unwrap();
        assert_eq!(view["travel"]["plan"].len(), 1);
        assert_eq!(view["travel"]["plan"][0].value, "two");

        memory.shutdown().await.unwrap();
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn failed_model_call_leaves_message_for_retry() {
        let dir = tempfile::tempdir().unwrap();
        let memory = memory_with(
            &dir,
            vec![
                Err("upstream flaked".to_string()),
                Ok(
                    r#"{"1":{"command":"add","feature":"likes","tag":"pets","value":"dogs"}}"#
                        .to_string(),
                ),
            ],
            settings(),
        );
        let scope = iso(&[]);

        memory.startup().await.unwrap();
        memory
            .ingest_message("u", "I like dogs", Value::Object(Default::default()), &scope)
            .await
            .unwrap();

        // First tick fails and keeps the message; the tracker needs a new
        // mark for the retry, which the next message provides.
        tokio::time::sleep(Duration::from_millis(250)).await;
        assert_eq!(memory.uningested_count().await.unwrap(), 1);

        memory
            .ingest_message("u", "still here", Value::Object(Default::default()), &scope)
            .await
            .unwrap();
        drain(&memory).await;

        let view = memory.get_profile("u", &scope).await.unwrap();
        assert_eq!(view["pets"]["likes"][0].value, "dogs");

        memory.shutdown().await.unwrap();
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn unreadable_output_is_discarded_not_retried() {
        let dir = tempfile::tempdir().unwrap();
        let memory = memory_with(
            &dir,
            vec![Ok("no json here at all".to_string())],
            settings(),
        );
        let scope = iso(&[]);

        memory.startup().await.unwrap();
        memory
            .ingest_message("u", "hello", Value::Object(Default::default()), &scope)
            .await
            .unwrap();
        drain(&memory).await;

        assert!(memory.get_profile("u", &scope).await.unwrap().is_empty());
        memory.shutdown().await.unwrap();
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn speaker_metadata_prefixes_history_content() {
        let dir = tempfile::tempdir().unwrap();
        let memory = memory_with(&dir, Vec::new(), settings());
        let scope = iso(&[]);

        memory.core.storage.startup().await.unwrap();
        memory
            .ingest_message(
                "u",
                "hello there",
                serde_json::json!({"speaker": "alice"}),
                &scope,
            )
            .await
            .unwrap();

        let pending = memory
            .core
            .storage
            .get_history_messages_by_ingestion_status("u", 0, false)
            .await
            .unwrap();
        assert_eq!(pending[0].content, "alice sends 'hello there'");
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn writes_erase_the_cached_view() {
        let dir = tempfile::tempdir().unwrap();
        let memory = memory_with(&dir, Vec::new(), settings());
        let scope = iso(&[("g", "G")]);

        memory.core.storage.startup().await.unwrap();
        memory
            .add_feature("u", "f", "v1", "t", Value::Null, &scope, Vec::new())
            .await
            .unwrap();

        // Prime the cache, then write through each mutating surface and make
        // sure the cached view is gone afterwards.
        memory.get_profile("u", &scope).await.unwrap();
        assert!(memory.core.cache.get("u", &scope).is_some());
        memory
            .add_feature("u", "f", "v2", "t", Value::Null, &scope, Vec::new())
            .await
            .unwrap();
        assert!(memory.core.cache.get("u", &scope).is_none());

        memory.get_profile("u", &scope).await.unwrap();
        memory
            .delete_feature("u", "f", "t", Some("v2"), &scope)
            .await
            .unwrap();
        assert!(memory.core.cache.get("u", &scope).is_none());

        memory.get_profile("u", &scope).await.unwrap();
        memory.delete_user_profile("u", &scope).await.unwrap();
        assert!(memory.core.cache.get("u", &scope).is_none());

        memory.get_profile("u", &scope).await.unwrap();
        memory.delete_all().await.unwrap();
        assert!(memory.core.cache.get("u", &scope).is_none());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn consolidation_merges_sections_and_prunes_conflicting_isolations() {
        let dir = tempfile::tempdir().unwrap();
        let consolidation = r#"{
            "consolidate_memories": [
                {"tag": "t", "feature": "f", "value": "merged", "metadata": {"citations": [1, 2]}}
            ],
            "keep_memories": []
        }"#;
        let memory = memory_with(
            &dir,
            vec![Ok("{}".to_string()), Ok(consolidation.to_string())],
            settings(),
        );

        memory.startup().await.unwrap();

        // Two source entries in the same (feature, tag) section, cited to
        // messages whose isolations agree on `g` but differ on `s`.
        let m1 = memory
            .core
            .storage
            .add_history("u", "m1", Value::Null, &iso(&[("g", "G"), ("s", "S1")]))
            .await
            .unwrap();
        let m2 = memory
            .core
            .storage
            .add_history("u", "m2", Value::Null, &iso(&[("g", "G"), ("s", "S2")]))
            .await
            .unwrap();
        memory
            .core
            .storage
            .mark_messages_ingested(&[m1.id, m2.id])
            .await
            .unwrap();

        memory
            .add_feature("u", "f", "v1", "t", Value::Null, &iso(&[]), vec![m1.id])
            .await
            .unwrap();
        memory
            .add_feature("u", "f", "v2", "t", Value::Null, &iso(&[]), vec![m2.id])
            .await
            .unwrap();

        // The trigger message ingests with no commands, then consolidates.
        memory
            .ingest_message("u", "trigger", Value::Object(Default::default()), &iso(&[]))
            .await
            .unwrap();
        drain(&memory).await;

        let survivors = memory
            .core
            .storage
            .semantic_search("u", &[1.0, 0.0], 0, -1.0, &iso(&[]))
            .await
            .unwrap();
        assert_eq!(survivors.len(), 1);
        assert_eq!(survivors[0].value, "merged");
        assert_eq!(survivors[0].citations, vec![m1.id, m2.id]);
        assert_eq!(survivors[0].isolations, iso(&[("g", "G")]));

        memory.shutdown().await.unwrap();
    }
}
