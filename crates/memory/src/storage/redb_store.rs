//! Embedded profile storage on [`redb`].
//!
//! Two value tables (profile features and history messages, keyed by
//! monotonic ids from a sequence table) with serde_json-encoded rows.
//! Similarity search is exact cosine over the candidate rows.  A semaphore
//! bounds concurrent transactions the way a connection pool would.

use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::{Arc, PoisonError, RwLock};

use async_trait::async_trait;
use chrono::Utc;
use redb::{Database, ReadableTable, TableDefinition, WriteTransaction};
use serde_json::Value;
use tokio::sync::Semaphore;
use tracing::{debug, info};

use crate::error::{MemoryError, Result};
use crate::schema::{
    HistoryMessage, Isolations, NewProfileFeature, ProfileEntry, ProfileFact, ProfileView,
    canonical_isolations, isolations_match,
};
use crate::storage::{ProfileStorage, cosine_similarity};

const PROFILE_TABLE: TableDefinition<u64, &[u8]> = TableDefinition::new("profile_features");
const HISTORY_TABLE: TableDefinition<u64, &[u8]> = TableDefinition::new("history_messages");
const SEQUENCE_TABLE: TableDefinition<&str, u64> = TableDefinition::new("sequences");

const PROFILE_SEQUENCE: &str = "profile";
const HISTORY_SEQUENCE: &str = "history";

pub struct RedbProfileStore {
    path: PathBuf,
    permits: Semaphore,
    db: RwLock<Option<Arc<Database>>>,
}

impl RedbProfileStore {
    /// Configure a store at `path`; the database file is not touched until
    /// [`ProfileStorage::startup`].
    pub fn new(path: impl AsRef<Path>, max_concurrent_transactions: usize) -> Result<Self> {
        if max_concurrent_transactions == 0 {
            return Err(MemoryError::InvalidInput(
                "max_concurrent_transactions must be positive".to_string(),
            ));
        }
        Ok(Self {
            path: path.as_ref().to_path_buf(),
            permits: Semaphore::new(max_concurrent_transactions),
            db: RwLock::new(None),
        })
    }

    fn database(&self) -> Result<Arc<Database>> {
        self.db
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
            .ok_or_else(|| MemoryError::Conflict("storage is not started".to_string()))
    }

    /// Await a transaction slot, then hand back the database handle.  The
    /// permit lives as long as the caller's transaction.
    async fn checkout(&self) -> Result<(tokio::sync::SemaphorePermit<'_>, Arc<Database>)> {
        let permit = self.permits.acquire().await?;
        let db = self.database()?;
        Ok((permit, db))
    }
}

fn encode<T: serde::Serialize>(value: &T) -> Result<Vec<u8>> {
    Ok(serde_json::to_vec(value)?)
}

fn next_sequence(tx: &WriteTransaction, name: &str) -> Result<u64> {
    let mut table = tx.open_table(SEQUENCE_TABLE)?;
    let next = table.get(name)?.map(|guard| guard.value()).unwrap_or(0) + 1;
    table.insert(name, next)?;
    Ok(next)
}

fn in_time_range(ts: i64, start_time: i64, end_time: i64) -> bool {
    (start_time == 0 || ts >= start_time) && (end_time == 0 || ts <= end_time)
}

#[async_trait]
impl ProfileStorage for RedbProfileStore {
    async fn startup(&self) -> Result<()> {
        let mut guard = self.db.write().unwrap_or_else(PoisonError::into_inner);
        if guard.is_some() {
            return Ok(());
        }
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| MemoryError::ExternalService(e.into()))?;
        }
        let db = Database::create(&self.path)?;
        {
            let tx = db.begin_write()?;
            tx.open_table(PROFILE_TABLE)?;
            tx.open_table(HISTORY_TABLE)?;
            tx.open_table(SEQUENCE_TABLE)?;
            tx.commit()?;
        }
        info!(path = %self.path.display(), "profile storage started");
        *guard = Some(Arc::new(db));
        Ok(())
    }

    async fn cleanup(&self) -> Result<()> {
        let released = self
            .db
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if released.is_some() {
            info!(path = %self.path.display(), "profile storage released");
        }
        Ok(())
    }

    async fn add_profile_feature(&self, feature: NewProfileFeature) -> Result<()> {
        let (_permit, db) = self.checkout().await?;
        let canonical = canonical_isolations(&feature.isolations);

        let tx = db.begin_write()?;
        {
            let mut table = tx.open_table(PROFILE_TABLE)?;

            let mut duplicate = false;
            for row in table.iter()? {
                let (_, bytes) = row?;
                let entry: ProfileEntry = serde_json::from_slice(bytes.value())?;
                if !entry.is_deleted()
                    && entry.user_id == feature.user_id
                    && entry.feature == feature.feature
                    && entry.tag == feature.tag
                    && entry.value == feature.value
                    && canonical_isolations(&entry.isolations) == canonical
                {
                    duplicate = true;
                    break;
                }
            }

            if duplicate {
                debug!(
                    user_id = %feature.user_id,
                    feature = %feature.feature,
                    tag = %feature.tag,
                    "duplicate profile feature ignored"
                );
            } else {
                let id = next_sequence(&tx, PROFILE_SEQUENCE)?;
                let now = Utc::now();
                let entry = ProfileEntry {
                    id: id as i64,
                    user_id: feature.user_id,
                    feature: feature.feature,
                    tag: feature.tag,
                    value: feature.value,
                    embedding: feature.embedding,
                    metadata: feature.metadata,
                    isolations: feature.isolations,
                    citations: feature.citations,
                    created_at: now,
                    updated_at: now,
                    deleted_at: None,
                };
                table.insert(id, encode(&entry)?.as_slice())?;
            }
        }
        tx.commit()?;
        Ok(())
    }

    async fn delete_profile_feature(
        &self,
        user_id: &str,
        feature: &str,
        tag: &str,
        value: Option<&str>,
        isolations: &Isolations,
    ) -> Result<()> {
        let (_permit, db) = self.checkout().await?;
        let tx = db.begin_write()?;
        {
            let mut table = tx.open_table(PROFILE_TABLE)?;

            let mut doomed = Vec::new();
            for row in table.iter()? {
                let (key, bytes) = row?;
                let entry: ProfileEntry = serde_json::from_slice(bytes.value())?;
                if !entry.is_deleted()
                    && entry.user_id == user_id
                    && entry.feature == feature
                    && entry.tag == tag
                    && value.is_none_or(|v| entry.value == v)
                    && isolations_match(isolations, &entry.isolations)
                {
                    doomed.push((key.value(), entry));
                }
            }

            let now = Utc::now();
            for (key, mut entry) in doomed {
                entry.deleted_at = Some(now);
                entry.updated_at = now;
                table.insert(key, encode(&entry)?.as_slice())?;
            }
        }
        tx.commit()?;
        Ok(())
    }

    async fn delete_profile_feature_by_id(&self, id: i64) -> Result<()> {
        let Ok(key) = u64::try_from(id) else {
            return Ok(());
        };
        let (_permit, db) = self.checkout().await?;
        let tx = db.begin_write()?;
        {
            let mut table = tx.open_table(PROFILE_TABLE)?;
            let existing = table.get(key)?.map(|bytes| bytes.value().to_vec());
            if let Some(bytes) = existing {
                let mut entry: ProfileEntry = serde_json::from_slice(&bytes)?;
                if !entry.is_deleted() {
                    let now = Utc::now();
                    entry.deleted_at = Some(now);
                    entry.updated_at = now;
                    table.insert(key, encode(&entry)?.as_slice())?;
                }
            }
        }
        tx.commit()?;
        Ok(())
    }

    async fn get_profile(&self, user_id: &str, isolations: &Isolations) -> Result<ProfileView> {
        let (_permit, db) = self.checkout().await?;
        let tx = db.begin_read()?;
        let table = tx.open_table(PROFILE_TABLE)?;

        let mut view = ProfileView::new();
        for row in table.iter()? {
            let (_, bytes) = row?;
            let entry: ProfileEntry = serde_json::from_slice(bytes.value())?;
            if entry.is_deleted()
                || entry.user_id != user_id
                || !isolations_match(isolations, &entry.isolations)
            {
                continue;
            }
            view.entry(entry.tag)
                .or_insert_with(BTreeMap::new)
                .entry(entry.feature)
                .or_insert_with(Vec::new)
                .push(ProfileFact {
                    value: entry.value,
                    metadata: entry.metadata,
                    citations: entry.citations,
                });
        }
        Ok(view)
    }

    async fn semantic_search(
        &self,
        user_id: &str,
        query: &[f32],
        k: usize,
        min_cos: f32,
        isolations: &Isolations,
    ) -> Result<Vec<ProfileEntry>> {
        let (_permit, db) = self.checkout().await?;
        let tx = db.begin_read()?;
        let table = tx.open_table(PROFILE_TABLE)?;

        let mut scored = Vec::new();
        for row in table.iter()? {
            let (_, bytes) = row?;
            let entry: ProfileEntry = serde_json::from_slice(bytes.value())?;
            if entry.is_deleted()
                || entry.user_id != user_id
                || !isolations_match(isolations, &entry.isolations)
            {
                continue;
            }
            let similarity = cosine_similarity(query, &entry.embedding);
            if similarity >= min_cos {
                scored.push((similarity, entry));
            }
        }

        scored.sort_by(|(a, _), (b, _)| b.total_cmp(a));
        if k > 0 {
            scored.truncate(k);
        }

        Ok(scored
            .into_iter()
            .map(|(similarity, mut entry)| {
                if !entry.metadata.is_object() {
                    entry.metadata = Value::Object(serde_json::Map::new());
                }
                entry.metadata["similarity_score"] = Value::from(f64::from(similarity));
                entry
            })
            .collect())
    }

    async fn get_large_profile_sections(
        &self,
        user_id: &str,
        threshold: usize,
        isolations: &Isolations,
    ) -> Result<Vec<Vec<ProfileEntry>>> {
        let (_permit, db) = self.checkout().await?;
        let tx = db.begin_read()?;
        let table = tx.open_table(PROFILE_TABLE)?;

        let mut sections: BTreeMap<(String, String), Vec<ProfileEntry>> = BTreeMap::new();
        for row in table.iter()? {
            let (_, bytes) = row?;
            let entry: ProfileEntry = serde_json::from_slice(bytes.value())?;
            if entry.is_deleted()
                || entry.user_id != user_id
                || !isolations_match(isolations, &entry.isolations)
            {
                continue;
            }
            sections
                .entry((entry.feature.clone(), entry.tag.clone()))
                .or_default()
                .push(entry);
        }

        Ok(sections
            .into_values()
            .filter(|group| group.len() >= threshold)
            .collect())
    }

    async fn get_all_citations_for_ids(&self, ids: &[i64]) -> Result<Vec<(i64, Isolations)>> {
        let (_permit, db) = self.checkout().await?;
        let tx = db.begin_read()?;
        let profiles = tx.open_table(PROFILE_TABLE)?;
        let history = tx.open_table(HISTORY_TABLE)?;

        let mut seen = HashSet::new();
        let mut associations = Vec::new();
        for id in ids {
            let Ok(key) = u64::try_from(*id) else {
                continue;
            };
            let Some(bytes) = profiles.get(key)?.map(|b| b.value().to_vec()) else {
                continue;
            };
            let entry: ProfileEntry = serde_json::from_slice(&bytes)?;
            for citation in entry.citations {
                if !seen.insert(citation) {
                    continue;
                }
                let Ok(history_key) = u64::try_from(citation) else {
                    continue;
                };
                let Some(raw) = history.get(history_key)?.map(|b| b.value().to_vec()) else {
                    continue;
                };
                let message: HistoryMessage = serde_json::from_slice(&raw)?;
                associations.push((citation, message.isolations));
            }
        }
        Ok(associations)
    }

    async fn delete_profile(&self, user_id: &str, isolations: &Isolations) -> Result<()> {
        let (_permit, db) = self.checkout().await?;
        let tx = db.begin_write()?;
        {
            let mut table = tx.open_table(PROFILE_TABLE)?;

            let mut doomed = Vec::new();
            for row in table.iter()? {
                let (key, bytes) = row?;
                let entry: ProfileEntry = serde_json::from_slice(bytes.value())?;
                if !entry.is_deleted()
                    && entry.user_id == user_id
                    && isolations_match(isolations, &entry.isolations)
                {
                    doomed.push((key.value(), entry));
                }
            }

            let now = Utc::now();
            for (key, mut entry) in doomed {
                entry.deleted_at = Some(now);
                entry.updated_at = now;
                table.insert(key, encode(&entry)?.as_slice())?;
            }
        }
        tx.commit()?;
        Ok(())
    }

    async fn delete_all(&self) -> Result<()> {
        let (_permit, db) = self.checkout().await?;
        let tx = db.begin_write()?;
        {
            for definition in [PROFILE_TABLE, HISTORY_TABLE] {
                let mut table = tx.open_table(definition)?;
                let keys: Vec<u64> = table
                    .iter()?
                    .filter_map(|row| row.ok().map(|(key, _)| key.value()))
                    .collect();
                for key in keys {
                    table.remove(key)?;
                }
            }
            // Sequences are kept so ids stay monotonic across wipes.
        }
        tx.commit()?;
        info!("all profile and history rows deleted");
        Ok(())
    }

    async fn add_history(
        &self,
        user_id: &str,
        content: &str,
        metadata: Value,
        isolations: &Isolations,
    ) -> Result<HistoryMessage> {
        let (_permit, db) = self.checkout().await?;
        let tx = db.begin_write()?;
        let message = {
            let mut table = tx.open_table(HISTORY_TABLE)?;
            let id = next_sequence(&tx, HISTORY_SEQUENCE)?;
            let message = HistoryMessage {
                id: id as i64,
                user_id: user_id.to_string(),
                content: content.to_string(),
                metadata,
                isolations: isolations.clone(),
                created_at: Utc::now(),
                is_ingested: false,
            };
            table.insert(id, encode(&message)?.as_slice())?;
            message
        };
        tx.commit()?;
        Ok(message)
    }

    async fn get_history_messages_by_ingestion_status(
        &self,
        user_id: &str,
        k: usize,
        is_ingested: bool,
    ) -> Result<Vec<HistoryMessage>> {
        let (_permit, db) = self.checkout().await?;
        let tx = db.begin_read()?;
        let table = tx.open_table(HISTORY_TABLE)?;

        let mut messages = Vec::new();
        for row in table.iter()? {
            let (_, bytes) = row?;
            let message: HistoryMessage = serde_json::from_slice(bytes.value())?;
            if message.user_id == user_id && message.is_ingested == is_ingested {
                messages.push(message);
            }
        }
        messages.sort_by(|a, b| (a.created_at, a.id).cmp(&(b.created_at, b.id)));
        if k > 0 {
            messages.truncate(k);
        }
        Ok(messages)
    }

    async fn get_history_message(
        &self,
        user_id: &str,
        start_time: i64,
        end_time: i64,
        isolations: &Isolations,
    ) -> Result<Vec<String>> {
        let (_permit, db) = self.checkout().await?;
        let tx = db.begin_read()?;
        let table = tx.open_table(HISTORY_TABLE)?;

        let mut messages = Vec::new();
        for row in table.iter()? {
            let (_, bytes) = row?;
            let message: HistoryMessage = serde_json::from_slice(bytes.value())?;
            if message.user_id == user_id
                && isolations_match(isolations, &message.isolations)
                && in_time_range(message.created_at.timestamp(), start_time, end_time)
            {
                messages.push(message);
            }
        }
        messages.sort_by(|a, b| (a.created_at, a.id).cmp(&(b.created_at, b.id)));
        Ok(messages.into_iter().map(|m| m.content).collect())
    }

    async fn get_uningested_history_messages_count(&self) -> Result<u64> {
        let (_permit, db) = self.checkout().await?;
        let tx = db.begin_read()?;
        let table = tx.open_table(HISTORY_TABLE)?;

        let mut count = 0u64;
        for row in table.iter()? {
            let (_, bytes) = row?;
            let message: HistoryMessage = serde_json::from_slice(bytes.value())?;
            if !message.is_ingested {
                count += 1;
            }
        }
        Ok(count)
    }

    async fn mark_messages_ingested(&self, ids: &[i64]) -> Result<()> {
        let (_permit, db) = self.checkout().await?;
        let tx = db.begin_write()?;
        {
            let mut table = tx.open_table(HISTORY_TABLE)?;
            for id in ids {
                let Ok(key) = u64::try_from(*id) else {
                    continue;
                };
                let existing = table.get(key)?.map(|bytes| bytes.value().to_vec());
                if let Some(bytes) = existing {
                    let mut message: HistoryMessage = serde_json::from_slice(&bytes)?;
                    if !message.is_ingested {
                        message.is_ingested = true;
                        table.insert(key, encode(&message)?.as_slice())?;
                    }
                }
            }
        }
        tx.commit()?;
        Ok(())
    }

    async fn delete_history(
        &self,
        user_id: &str,
        start_time: i64,
        end_time: i64,
        isolations: &Isolations,
    ) -> Result<()> {
        let (_permit, db) = self.checkout().await?;
        let tx = db.begin_write()?;
        {
            let mut table = tx.open_table(HISTORY_TABLE)?;
            let mut doomed = Vec::new();
            for row in table.iter()? {
                let (key, bytes) = row?;
                let message: HistoryMessage = serde_json::from_slice(bytes.value())?;
                if message.user_id == user_id
                    && isolations_match(isolations, &message.isolations)
                    && in_time_range(message.created_at.timestamp(), start_time, end_time)
                {
                    doomed.push(key.value());
                }
            }
            for key in doomed {
                table.remove(key)?;
            }
        }
        tx.commit()?;
        Ok(())
    }

    async fn purge_history(
        &self,
        user_id: &str,
        start_time: i64,
        isolations: &Isolations,
    ) -> Result<()> {
        self.delete_history(user_id, start_time, 0, isolations).await
    }
}
