//! Core data types: profile entries, history messages, and isolation maps.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// One scalar value inside an isolation map.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum IsolationValue {
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
}

impl From<bool> for IsolationValue {
    fn from(v: bool) -> Self {
        Self::Bool(v)
    }
}

impl From<i64> for IsolationValue {
    fn from(v: i64) -> Self {
        Self::Int(v)
    }
}

impl From<f64> for IsolationValue {
    fn from(v: f64) -> Self {
        Self::Float(v)
    }
}

impl From<&str> for IsolationValue {
    fn from(v: &str) -> Self {
        Self::Str(v.to_string())
    }
}

impl From<String> for IsolationValue {
    fn from(v: String) -> Self {
        Self::Str(v)
    }
}

/// Multi-dimensional tenant filter carried on every message and profile entry,
/// e.g. `{group: "g", session: "s"}`.
pub type Isolations = BTreeMap<String, IsolationValue>;

/// Canonical serialization of an isolation map: JSON with keys in sorted order
/// (the `BTreeMap` guarantees the ordering) and serde_json's default numeric
/// rendering.  Two maps are the same isolation iff their canonical forms match.
pub fn canonical_isolations(isolations: &Isolations) -> String {
    serde_json::to_string(isolations).unwrap_or_else(|_| "{}".to_string())
}

/// Whether a stored isolation map satisfies a query isolation map: every key
/// the query names must be present in the stored map with the same value.
/// Keys the stored map carries beyond the query are ignored.
pub fn isolations_match(query: &Isolations, stored: &Isolations) -> bool {
    query.iter().all(|(key, value)| stored.get(key) == Some(value))
}

/// An atomic, cited, embedding-indexed fact about one user.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProfileEntry {
    pub id: i64,
    pub user_id: String,
    pub feature: String,
    pub tag: String,
    pub value: String,
    #[serde(default)]
    pub embedding: Vec<f32>,
    #[serde(default)]
    pub metadata: Value,
    #[serde(default)]
    pub isolations: Isolations,
    /// History-message ids that justify this entry.
    #[serde(default)]
    pub citations: Vec<i64>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub deleted_at: Option<DateTime<Utc>>,
}

impl ProfileEntry {
    pub fn is_deleted(&self) -> bool {
        self.deleted_at.is_some()
    }

    /// Cosine similarity stamped into `metadata` by semantic search.
    pub fn similarity_score(&self) -> f32 {
        self.metadata
            .get("similarity_score")
            .and_then(Value::as_f64)
            .unwrap_or(0.0) as f32
    }
}

/// Input record for [`crate::storage::ProfileStorage::add_profile_feature`].
#[derive(Debug, Clone)]
pub struct NewProfileFeature {
    pub user_id: String,
    pub feature: String,
    pub value: String,
    pub tag: String,
    pub embedding: Vec<f32>,
    pub metadata: Value,
    pub isolations: Isolations,
    pub citations: Vec<i64>,
}

/// One conversation message awaiting (or past) profile ingestion.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoryMessage {
    pub id: i64,
    pub user_id: String,
    pub content: String,
    #[serde(default)]
    pub metadata: Value,
    #[serde(default)]
    pub isolations: Isolations,
    pub created_at: DateTime<Utc>,
    pub is_ingested: bool,
}

/// One `{value, metadata, citations}` record inside a profile view.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProfileFact {
    pub value: String,
    #[serde(default)]
    pub metadata: Value,
    #[serde(default)]
    pub citations: Vec<i64>,
}

/// A user's profile restricted to one isolation: `tag -> feature -> facts`.
pub type ProfileView = BTreeMap<String, BTreeMap<String, Vec<ProfileFact>>>;
