//! Profile storage contract: transactional CRUD, k-NN vector search with
//! isolation filters, citation tracking, and bulk ingestion-status flips.

pub mod redb_store;

use async_trait::async_trait;
use serde_json::Value;

use crate::error::Result;
use crate::schema::{HistoryMessage, Isolations, NewProfileFeature, ProfileEntry, ProfileView};

#[async_trait]
pub trait ProfileStorage: Send + Sync {
    /// Acquire backing resources (database handles, pools).  Idempotent.
    async fn startup(&self) -> Result<()>;

    /// Release backing resources.  Idempotent.
    async fn cleanup(&self) -> Result<()>;

    /// Insert a profile feature, recording its citations and embedding.  An
    /// exact live duplicate (`user_id`, `feature`, `tag`, `value`, canonical
    /// isolations) is a silent no-op.
    async fn add_profile_feature(&self, feature: NewProfileFeature) -> Result<()>;

    /// Soft-delete matching features.  With `value = None` every value under
    /// `(feature, tag)` within the isolation is deleted.
    async fn delete_profile_feature(
        &self,
        user_id: &str,
        feature: &str,
        tag: &str,
        value: Option<&str>,
        isolations: &Isolations,
    ) -> Result<()>;

    /// Soft-delete one entry by id.  Unknown ids are a no-op.
    async fn delete_profile_feature_by_id(&self, id: i64) -> Result<()>;

    /// Nested `tag -> feature -> facts` view of a user's live entries under
    /// the isolation filter.
    async fn get_profile(&self, user_id: &str, isolations: &Isolations) -> Result<ProfileView>;

    /// Up to `k` live entries with cosine similarity >= `min_cos` against
    /// `query`, sorted descending, each with `similarity_score` stamped into
    /// its metadata.  `k = 0` means unlimited.
    async fn semantic_search(
        &self,
        user_id: &str,
        query: &[f32],
        k: usize,
        min_cos: f32,
        isolations: &Isolations,
    ) -> Result<Vec<ProfileEntry>>;

    /// Every `(feature, tag)` group with at least `threshold` live entries,
    /// each group as full entry records.
    async fn get_large_profile_sections(
        &self,
        user_id: &str,
        threshold: usize,
        isolations: &Isolations,
    ) -> Result<Vec<Vec<ProfileEntry>>>;

    /// Resolve the citations of the given profile entries to
    /// `(history_id, history isolations)` pairs, deduplicated in first-seen
    /// order.  Unknown entry ids are skipped.
    async fn get_all_citations_for_ids(&self, ids: &[i64]) -> Result<Vec<(i64, Isolations)>>;

    /// Soft-delete every profile entry of `user_id` under the isolation.
    async fn delete_profile(&self, user_id: &str, isolations: &Isolations) -> Result<()>;

    /// Physically wipe all profile entries and history messages.
    async fn delete_all(&self) -> Result<()>;

    /// Append a history message; returns the stored row.
    async fn add_history(
        &self,
        user_id: &str,
        content: &str,
        metadata: Value,
        isolations: &Isolations,
    ) -> Result<HistoryMessage>;

    /// History messages of `user_id` filtered by ingestion status, ordered by
    /// `(created_at, id)`.  `k = 0` means unlimited.
    async fn get_history_messages_by_ingestion_status(
        &self,
        user_id: &str,
        k: usize,
        is_ingested: bool,
    ) -> Result<Vec<HistoryMessage>>;

    /// Message contents for a user within `[start_time, end_time]` (unix
    /// seconds, `0` = unbounded) under the isolation, in chronological order.
    async fn get_history_message(
        &self,
        user_id: &str,
        start_time: i64,
        end_time: i64,
        isolations: &Isolations,
    ) -> Result<Vec<String>>;

    /// Count of uningested history messages across all users.
    async fn get_uningested_history_messages_count(&self) -> Result<u64>;

    /// Bulk flip `is_ingested = true`.  Already-ingested ids stay true.
    async fn mark_messages_ingested(&self, ids: &[i64]) -> Result<()>;

    /// Physically delete a user's messages within `[start_time, end_time]`
    /// (unix seconds, `0` = unbounded) under the isolation.
    async fn delete_history(
        &self,
        user_id: &str,
        start_time: i64,
        end_time: i64,
        isolations: &Isolations,
    ) -> Result<()>;

    /// Physically delete a user's messages from `start_time` (unix seconds)
    /// onward under the isolation; `0` purges everything.
    async fn purge_history(
        &self,
        user_id: &str,
        start_time: i64,
        isolations: &Isolations,
    ) -> Result<()>;
}

/// Plain cosine similarity; mismatched or empty vectors score 0.
pub(crate) fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    let dot: f32 = a.iter().zip(b.iter()).map(|(x, y)| x * y).sum();
    let mag_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let mag_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if mag_a == 0.0 || mag_b == 0.0 {
        return 0.0;
    }
    dot / (mag_a * mag_b)
}

#[cfg(test)]
mod tests {
    use super::cosine_similarity;

    #[test]
    fn cosine_of_parallel_vectors_is_one() {
        let sim = cosine_similarity(&[2.0, 0.0], &[4.0, 0.0]);
        assert!((sim - 1.0).abs() < 1e-6);
    }

    #[test]
    fn cosine_of_opposed_vectors_is_negative_one() {
        let sim = cosine_similarity(&[1.0, 0.0], &[-1.0, 0.0]);
        assert!((sim + 1.0).abs() < 1e-6);
    }

    #[test]
    fn degenerate_vectors_score_zero() {
        assert_eq!(cosine_similarity(&[], &[]), 0.0);
        assert_eq!(cosine_similarity(&[1.0], &[1.0, 2.0]), 0.0);
        assert_eq!(cosine_similarity(&[0.0, 0.0], &[1.0, 1.0]), 0.0);
    }
}
