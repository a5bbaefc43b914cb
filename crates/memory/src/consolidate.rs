//! LLM-driven consolidation of oversized profile sections.

use std::collections::BTreeSet;

use futures::future::join_all;
use serde_json::{Value, json};
use tracing::{debug, error, warn};

use crate::engine::EngineCore;
use crate::error::Result;
use crate::parse::{MergedMemory, extract_response_json, parse_consolidation_plan};
use crate::schema::{Isolations, ProfileEntry};

/// Rewrite every oversized `(feature, tag)` section of the user's profile
/// under the given isolation.  All failures are logged and swallowed; the
/// sections simply stay as they are until a later pass.
pub(crate) async fn consolidate_profile(core: &EngineCore, user_id: &str, isolations: &Isolations) {
    let sections = match core
        .storage
        .get_large_profile_sections(user_id, core.settings.consolidation_threshold, isolations)
        .await
    {
        Ok(sections) => sections,
        Err(err) => {
            error!(user_id, %err, "loading profile sections failed");
            return;
        }
    };
    if sections.is_empty() {
        return;
    }

    debug!(user_id, count = sections.len(), "consolidating oversized sections");
    join_all(
        sections
            .into_iter()
            .map(|section| consolidate_section(core, user_id, section)),
    )
    .await;
}

async fn consolidate_section(core: &EngineCore, user_id: &str, section: Vec<ProfileEntry>) {
    let payload = section_payload(&section).to_string();

    let (response, _tool_calls) = match core
        .model
        .generate_response(
            Some(&core.consolidation_prompt),
            Some(&payload),
            None,
            None,
            core.settings.llm_max_attempts,
        )
        .await
    {
        Ok(result) => result,
        Err(err) => {
            error!(user_id, %err, "consolidation model call failed");
            return;
        }
    };

    let extracted = extract_response_json(&response);
    if let Some(thinking) = &extracted.thinking {
        debug!(user_id, thinking = %thinking, "consolidation reasoning captured");
    }

    let plan = match parse_consolidation_plan(&extracted.json) {
        Ok(plan) => plan,
        Err(err) => {
            warn!(user_id, %err, "discarding unreadable consolidation output");
            return;
        }
    };

    if !plan.keep_all {
        for entry in &section {
            if plan.keep_ids.contains(&entry.id) {
                continue;
            }
            core.cache.erase(user_id, &entry.isolations);
            if let Err(err) = core.storage.delete_profile_feature_by_id(entry.id).await {
                error!(user_id, entry_id = entry.id, %err, "deleting consolidated entry failed");
            }
        }
    }

    for merged in &plan.merged {
        if let Err(err) = insert_merged(core, user_id, merged).await {
            error!(user_id, %err, "inserting consolidated entry failed");
        }
    }
}

/// Serialize a section the way the consolidation prompt expects: each entry
/// exposes its id so the model can cite it.
fn section_payload(section: &[ProfileEntry]) -> Value {
    Value::Array(
        section
            .iter()
            .map(|entry| {
                json!({
                    "tag": entry.tag,
                    "feature": entry.feature,
                    "value": entry.value,
                    "metadata": {"id": entry.id},
                })
            })
            .collect(),
    )
}

async fn insert_merged(core: &EngineCore, user_id: &str, merged: &MergedMemory) -> Result<()> {
    let associations = core
        .storage
        .get_all_citations_for_ids(&merged.metadata.citations)
        .await?;
    let citations: Vec<i64> = associations.iter().map(|(id, _)| *id).collect();
    let isolations = intersect_isolations(&associations);

    debug!(
        user_id,
        source_entries = ?merged.metadata.citations,
        history_citations = ?citations,
        "consolidated entry citations resolved"
    );
    core.add_new_profile(
        user_id,
        &merged.feature,
        &merged.value,
        &merged.tag,
        Value::Object(serde_json::Map::new()),
        &isolations,
        citations,
    )
    .await
}

/// Isolation intersection with conflict pruning: adopt each key's value from
/// the first citing message, and drop any key whose value differs across the
/// cited messages.
fn intersect_isolations(associations: &[(i64, Isolations)]) -> Isolations {
    let mut merged = Isolations::new();
    let mut conflicted = BTreeSet::new();
    for (_, isolations) in associations {
        for (key, value) in isolations {
            match merged.get(key) {
                None => {
                    merged.insert(key.clone(), value.clone());
                }
                Some(existing) if existing != value => {
                    conflicted.insert(key.clone());
                }
                Some(_) => {}
            }
        }
    }
    for key in conflicted {
        merged.remove(&key);
    }
    merged
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::IsolationValue;
    use chrono::Utc;

    fn iso(pairs: &[(&str, &str)]) -> Isolations {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), IsolationValue::from(*v)))
            .collect()
    }

    #[test]
    fn conflicting_isolation_keys_are_pruned() {
        let merged = intersect_isolations(&[
            (1, iso(&[("g", "G"), ("s", "S1")])),
            (2, iso(&[("g", "G"), ("s", "S2")])),
        ]);
        assert_eq!(merged, iso(&[("g", "G")]));
    }

    #[test]
    fn disjoint_keys_are_all_adopted() {
        let merged = intersect_isolations(&[
            (1, iso(&[("g", "G")])),
            (2, iso(&[("s", "S")])),
        ]);
        assert_eq!(merged, iso(&[("g", "G"), ("s", "S")]));
    }

    #[test]
    fn conflicted_key_stays_pruned_despite_later_agreement() {
        let merged = intersect_isolations(&[
            (1, iso(&[("s", "S1")])),
            (2, iso(&[("s", "S2")])),
            (3, iso(&[("s", "S1")])),
        ]);
        assert!(merged.is_empty());
    }

    #[test]
    fn section_payload_exposes_entry_ids() {
        let entry = ProfileEntry {
            id: 7,
            user_id: "u".to_string(),
            feature: "f".to_string(),
            tag: "t".to_string(),
            value: "v".to_string(),
            embedding: Vec::new(),
            metadata: Value::Null,
            isolations: Isolations::new(),
            citations: vec![1],
            created_at: Utc::now(),
            updated_at: Utc::now(),
            deleted_at: None,
        };
        let payload = section_payload(&[entry]);
        assert_eq!(payload[0]["metadata"]["id"], 7);
        assert_eq!(payload[0]["value"], "v");
        assert!(payload[0].get("citations").is_none());
    }
}
