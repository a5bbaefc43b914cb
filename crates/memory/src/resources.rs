//! Resource initializer: builds adapter instances from declarative
//! definitions in dependency order.
//!
//! Definitions map a resource id to `{kind, name, config}`.  A definition may
//! reference other resources through config keys ending in `_id`; the
//! initializer orders construction topologically, fails with `NotFound` for
//! unknown references and `Conflict` for cycles.

use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::sync::Arc;

use serde_json::Value;
use tracing::warn;

use mnemon_llm::{Embedder, LanguageModel, OpenAiChatModel, OpenAiEmbedder};

use crate::error::{MemoryError, Result};

#[derive(Debug, Clone)]
pub struct ResourceDefinition {
    /// Resource kind: `embedder` or `language_model`.
    pub kind: String,
    /// Builder name within the kind, e.g. `openai`.
    pub name: String,
    pub config: Value,
}

/// A constructed resource instance.
#[derive(Clone)]
pub enum Resource {
    Embedder(Arc<dyn Embedder>),
    LanguageModel(Arc<dyn LanguageModel>),
}

impl Resource {
    pub fn as_embedder(&self) -> Option<Arc<dyn Embedder>> {
        match self {
            Self::Embedder(embedder) => Some(Arc::clone(embedder)),
            _ => None,
        }
    }

    pub fn as_language_model(&self) -> Option<Arc<dyn LanguageModel>> {
        match self {
            Self::LanguageModel(model) => Some(Arc::clone(model)),
            _ => None,
        }
    }
}

pub struct ResourceInitializer;

impl ResourceInitializer {
    /// Build every defined resource in topological dependency order.
    pub fn initialize(
        definitions: &BTreeMap<String, ResourceDefinition>,
    ) -> Result<BTreeMap<String, Resource>> {
        let ordered = order_resources(definitions)?;

        let mut resources = BTreeMap::new();
        for id in ordered {
            let definition = &definitions[&id];
            resources.insert(id, build_resource(definition)?);
        }
        Ok(resources)
    }
}

/// Dependency ids referenced from a definition: string values of config keys
/// ending in `_id`.
fn dependency_ids(definition: &ResourceDefinition) -> BTreeSet<String> {
    definition
        .config
        .as_object()
        .map(|config| {
            config
                .iter()
                .filter(|(key, _)| key.ends_with("_id"))
                .filter_map(|(_, value)| value.as_str().map(str::to_string))
                .collect()
        })
        .unwrap_or_default()
}

/// Kahn's algorithm over the dependency graph.
fn order_resources(definitions: &BTreeMap<String, ResourceDefinition>) -> Result<Vec<String>> {
    let graph: BTreeMap<String, BTreeSet<String>> = definitions
        .iter()
        .map(|(id, definition)| (id.clone(), dependency_ids(definition)))
        .collect();

    let mut dependency_counts: BTreeMap<&str, usize> = BTreeMap::new();
    let mut dependents: BTreeMap<&str, BTreeSet<&str>> = BTreeMap::new();
    for id in graph.keys() {
        dependency_counts.insert(id, 0);
        dependents.insert(id, BTreeSet::new());
    }

    for (id, dependencies) in &graph {
        for dependency in dependencies {
            if !graph.contains_key(dependency) {
                return Err(MemoryError::NotFound(format!(
                    "dependency '{dependency}' of resource '{id}' is not defined"
                )));
            }
            *dependency_counts.get_mut(id.as_str()).expect("id present") += 1;
            dependents
                .get_mut(dependency.as_str())
                .expect("dependency present")
                .insert(id.as_str());
        }
    }

    let mut queue: VecDeque<&str> = dependency_counts
        .iter()
        .filter(|(_, count)| **count == 0)
        .map(|(id, _)| *id)
        .collect();

    let mut ordered = Vec::new();
    while let Some(id) = queue.pop_front() {
        ordered.push(id.to_string());
        for dependent in &dependents[id] {
            let count = dependency_counts
                .get_mut(dependent)
                .expect("dependent present");
            *count -= 1;
            if *count == 0 {
                queue.push_back(dependent);
            }
        }
    }

    if ordered.len() != definitions.len() {
        return Err(MemoryError::Conflict(
            "cyclic dependency detected in resource definitions".to_string(),
        ));
    }
    Ok(ordered)
}

fn config_str<'a>(config: &'a Value, key: &str, default: &'a str) -> &'a str {
    config.get(key).and_then(Value::as_str).unwrap_or(default)
}

fn api_key_from_env(config: &Value) -> String {
    let env_name = config_str(config, "api_key_env", "OPENAI_API_KEY");
    match std::env::var(env_name) {
        Ok(key) if !key.is_empty() => key,
        _ => {
            warn!(env_name, "API key environment variable is unset or empty");
            String::new()
        }
    }
}

fn build_resource(definition: &ResourceDefinition) -> Result<Resource> {
    match (definition.kind.as_str(), definition.name.as_str()) {
        ("embedder", "openai") => {
            let config = &definition.config;
            let dimensions = config
                .get("dimensions")
                .and_then(Value::as_u64)
                .unwrap_or(1536) as usize;
            Ok(Resource::Embedder(Arc::new(OpenAiEmbedder::new(
                config_str(config, "base_url", "https://api.openai.com/v1"),
                &api_key_from_env(config),
                config_str(config, "model", "text-embedding-3-small"),
                dimensions,
            ))))
        }
        ("language_model", "openai") => {
            let config = &definition.config;
            Ok(Resource::LanguageModel(Arc::new(OpenAiChatModel::new(
                config_str(config, "base_url", "https://api.openai.com/v1"),
                &api_key_from_env(config),
                config_str(config, "model", "gpt-4o-mini"),
            ))))
        }
        (kind, name) => Err(MemoryError::InvalidInput(format!(
            "unknown resource builder '{name}' for kind '{kind}'"
        ))),
    }
}
