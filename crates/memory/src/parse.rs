//! Tolerant parsing of LLM output into profile commands.
//!
//! Models are asked for a bare JSON object but reply with every imaginable
//! wrapper: `<think>` preambles, fenced code blocks, XML-ish tags, unquoted
//! keys, single quotes, trailing commas, unbalanced braces.  Extraction and
//! repair here mirror that reality; anything still unreadable afterwards is a
//! [`MemoryError::Parse`] and the update is discarded rather than retried.

use std::sync::LazyLock;

use regex::Regex;
use serde::Deserialize;
use serde_json::Value;
use tracing::{debug, warn};

use crate::error::{MemoryError, Result};

/// Model output split into optional `<think>` text and the JSON candidate.
#[derive(Debug, Clone)]
pub struct ExtractedResponse {
    /// Inner text of a `<think>…</think>` preamble, kept for logging only.
    pub thinking: Option<String>,
    /// Best-guess JSON body, still unrepaired.
    pub json: String,
}

/// A validated profile update command.
#[derive(Debug, Clone, PartialEq)]
pub enum ProfileCommand {
    Add {
        feature: String,
        tag: String,
        value: String,
        date: Option<String>,
        author: Option<String>,
    },
    Delete {
        feature: String,
        tag: String,
        value: Option<String>,
        author: Option<String>,
    },
}

/// Validated outcome of a consolidation response.
#[derive(Debug, Clone, Default)]
pub struct ConsolidationPlan {
    /// True when either output key was missing or malformed: keep every
    /// existing entry and skip deletions.
    pub keep_all: bool,
    /// Ids of section entries the model wants kept as-is.
    pub keep_ids: Vec<i64>,
    /// New consolidated entries to insert.
    pub merged: Vec<MergedMemory>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MergedMemory {
    pub tag: String,
    pub feature: String,
    pub value: String,
    pub metadata: MergedMetadata,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MergedMetadata {
    /// Ids of the *profile entries* this memory was merged from; resolved to
    /// history ids before insertion.
    pub citations: Vec<i64>,
}

static TAGGED_PATTERNS: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    [
        r"(?s)<OLD_PROFILE>\s*(\{.*?\})\s*</OLD_PROFILE>",
        r"(?s)<NEW_PROFILE>\s*(\{.*?\})\s*</NEW_PROFILE>",
        r"(?s)<profile>\s*(\{.*?\})\s*</profile>",
        r"(?s)<json>\s*(\{.*?\})\s*</json>",
        r"(?s)```json\s*(\{.*?\})\s*```",
        r"(?s)```\s*(\{.*?\})\s*```",
        r"(?s)<think>\s*(\{.*?\})\s*</think>",
    ]
    .iter()
    .map(|p| Regex::new(p).expect("static pattern compiles"))
    .collect()
});

static LAST_OBJECT: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\{[^{}]*(?:\{[^{}]*\}[^{}]*)*\}").expect("static pattern compiles"));

static ANNOTATION: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\.\.\.\s*\([^)]*\)").expect("static pattern compiles"));
static TRAILING_COMMA: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r",(\s*[}\]])").expect("static pattern compiles"));
static UNQUOTED_KEY: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(\w+):\s*").expect("static pattern compiles"));
static SINGLE_QUOTED: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"'([^']*)'").expect("static pattern compiles"));
static BACKTICK_QUOTED: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"`([^`]*)`").expect("static pattern compiles"));

/// Split model output into thinking text and the JSON candidate.
///
/// Strategies, in order: the suffix after a `</think>` tag, then the tagged /
/// fenced wrappers, then the last brace-delimited object, then the whole text.
pub fn extract_response_json(text: &str) -> ExtractedResponse {
    if text.contains("<think>") {
        if let Some(end) = text.rfind("</think>") {
            let head = text[..end].strip_prefix("<think>").unwrap_or(&text[..end]);
            return ExtractedResponse {
                thinking: Some(head.trim().to_string()),
                json: text[end + "</think>".len()..].trim().to_string(),
            };
        }
    }

    for pattern in TAGGED_PATTERNS.iter() {
        if let Some(captures) = pattern.captures(text) {
            return ExtractedResponse {
                thinking: None,
                json: captures[1].trim().to_string(),
            };
        }
    }

    if let Some(found) = LAST_OBJECT.find_iter(text).last() {
        return ExtractedResponse {
            thinking: None,
            json: found.as_str().trim().to_string(),
        };
    }

    ExtractedResponse {
        thinking: None,
        json: text.trim().to_string(),
    }
}

/// Conservative cleanup of common LLM JSON mistakes.
fn repair_json(candidate: &str) -> String {
    // "... (other tags remain the same)" placeholders.
    let repaired = ANNOTATION.replace_all(candidate, "");
    // Trailing commas before a closing brace or bracket.
    let repaired = TRAILING_COMMA.replace_all(&repaired, "${1}");
    // Bare keys: `tag:` -> `"tag": `.  Keys that are already quoted have a
    // `"` between the word and the colon, so they are left alone.
    let repaired = UNQUOTED_KEY.replace_all(&repaired, "\"${1}\": ");
    // Single- and backtick-quoted strings.
    let repaired = SINGLE_QUOTED.replace_all(&repaired, "\"${1}\"");
    let repaired = BACKTICK_QUOTED.replace_all(&repaired, "\"${1}\"");

    let mut repaired = repaired.into_owned();
    let open = repaired.matches('{').count();
    let close = repaired.matches('}').count();
    if open > close {
        repaired.extend(std::iter::repeat_n('}', open - close));
    }
    repaired.trim().to_string()
}

/// Last-resort scan: walk the text tracking string state and brace depth,
/// collecting every complete top-level `{…}` object that parses.
fn scan_json_objects(text: &str) -> Vec<Value> {
    let mut objects = Vec::new();
    let mut current = String::new();
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;

    for ch in text.chars() {
        if depth == 0 && ch != '{' {
            continue;
        }
        current.push(ch);

        if escaped {
            escaped = false;
            continue;
        }
        match ch {
            '\\' if in_string => escaped = true,
            '"' => in_string = !in_string,
            '{' if !in_string => depth += 1,
            '}' if !in_string => {
                depth -= 1;
                if depth == 0 {
                    match serde_json::from_str::<Value>(current.trim()) {
                        Ok(value) => objects.push(value),
                        Err(err) => debug!(%err, "skipping malformed object during scan"),
                    }
                    current.clear();
                }
            }
            _ => {}
        }
    }
    objects
}

/// Repair and parse a JSON candidate; on failure, salvage whatever complete
/// objects a character scan can find, merged under synthetic `{i}_{key}` keys.
fn parse_candidate(raw: &str) -> Result<Value> {
    let repaired = repair_json(raw);
    match serde_json::from_str::<Value>(&repaired) {
        Ok(value) => Ok(value),
        Err(err) => {
            warn!(%err, "repaired model output is not valid JSON; scanning for objects");
            let objects = scan_json_objects(&repaired);
            if objects.is_empty() {
                return Err(MemoryError::Parse(format!(
                    "no JSON object recoverable from model output: {err}"
                )));
            }
            let mut combined = serde_json::Map::new();
            for (index, object) in objects.into_iter().enumerate() {
                if let Value::Object(map) = object {
                    for (key, value) in map {
                        combined.insert(format!("{index}_{key}"), value);
                    }
                }
            }
            Ok(Value::Object(combined))
        }
    }
}

/// Parse an update response into validated commands.
///
/// The accepted shape is an object whose values are command objects; commands
/// with unknown operations, missing required keys, or non-object shape are
/// dropped with a warning rather than failing the whole update.
pub fn parse_update_commands(raw: &str) -> Result<Vec<ProfileCommand>> {
    let value = parse_candidate(raw)?;
    let Value::Object(map) = value else {
        return Err(MemoryError::Parse(format!(
            "expected an object of update commands, got {value}"
        )));
    };

    let mut commands = Vec::new();
    for (key, candidate) in map {
        let Value::Object(command) = candidate else {
            warn!(key = %key, "dropping non-object update command");
            continue;
        };

        let Some(op) = command.get("command").and_then(Value::as_str) else {
            warn!(key = %key, "dropping update command without a 'command' key");
            continue;
        };
        if op != "add" && op != "delete" {
            warn!(key = %key, op, "dropping update command with unknown operation");
            continue;
        }

        let Some(feature) = command.get("feature").and_then(Value::as_str) else {
            warn!(key = %key, op, "dropping update command without a 'feature' key");
            continue;
        };
        let Some(tag) = command.get("tag").and_then(Value::as_str) else {
            warn!(key = %key, op, "dropping update command without a 'tag' key");
            continue;
        };

        let value_field = command.get("value").and_then(Value::as_str);
        let author = command
            .get("author")
            .and_then(Value::as_str)
            .map(str::to_string);

        if op == "add" {
            let Some(value_text) = value_field else {
                warn!(key = %key, "dropping add command without a 'value' key");
                continue;
            };
            commands.push(ProfileCommand::Add {
                feature: feature.to_string(),
                tag: tag.to_string(),
                value: value_text.to_string(),
                date: command
                    .get("date")
                    .and_then(Value::as_str)
                    .map(str::to_string),
                author,
            });
        } else {
            commands.push(ProfileCommand::Delete {
                feature: feature.to_string(),
                tag: tag.to_string(),
                value: value_field.map(str::to_string),
                author,
            });
        }
    }
    Ok(commands)
}

/// Parse a consolidation response into a [`ConsolidationPlan`].
pub fn parse_consolidation_plan(raw: &str) -> Result<ConsolidationPlan> {
    let value = parse_candidate(raw)?;
    let Value::Object(map) = value else {
        return Err(MemoryError::Parse(format!(
            "expected a consolidation object, got {value}"
        )));
    };

    let mut plan = ConsolidationPlan::default();

    let consolidate_items = match map.get("consolidate_memories") {
        Some(Value::Array(items)) => items.clone(),
        other => {
            warn!(?other, "missing or malformed 'consolidate_memories'; keeping all entries");
            plan.keep_all = true;
            Vec::new()
        }
    };

    match map.get("keep_memories") {
        Some(Value::Array(items)) => {
            for item in items {
                match item.as_i64() {
                    Some(id) => plan.keep_ids.push(id),
                    None => warn!(?item, "dropping non-integer id in 'keep_memories'"),
                }
            }
        }
        other => {
            warn!(?other, "missing or malformed 'keep_memories'; keeping all entries");
            plan.keep_all = true;
        }
    }

    for item in consolidate_items {
        match serde_json::from_value::<MergedMemory>(item.clone()) {
            Ok(memory) => plan.merged.push(memory),
            Err(err) => warn!(%err, ?item, "dropping malformed consolidated memory"),
        }
    }

    Ok(plan)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fenced_block_with_llm_typos_is_repaired() {
        let raw = "```json\n{1: {command: 'add', feature:'x', tag:'t', value:'v',},}\n```";
        let extracted = extract_response_json(raw);
        assert!(extracted.thinking.is_none());

        let commands = parse_update_commands(&extracted.json).unwrap();
        assert_eq!(
            commands,
            vec![ProfileCommand::Add {
                feature: "x".to_string(),
                tag: "t".to_string(),
                value: "v".to_string(),
                date: None,
                author: None,
            }]
        );
    }

    #[test]
    fn think_tag_splits_thinking_from_body() {
        let raw = "<think>reasoning</think>\n{\"1\":{\"command\":\"add\",\"feature\":\"f\",\"tag\":\"t\",\"value\":\"v\"}}";
        let extracted = extract_response_json(raw);
        assert_eq!(extracted.thinking.as_deref(), Some("reasoning"));

        let commands = parse_update_commands(&extracted.json).unwrap();
        assert_eq!(commands.len(), 1);
    }

    #[test]
    fn tagged_json_wrapper_is_unwrapped() {
        let raw = "Here you go:\n<json>\n{\"1\": {\"command\": \"delete\", \"feature\": \"f\", \"tag\": \"t\"}}\n</json>";
        let extracted = extract_response_json(raw);
        let commands = parse_update_commands(&extracted.json).unwrap();
        assert_eq!(
            commands,
            vec![ProfileCommand::Delete {
                feature: "f".to_string(),
                tag: "t".to_string(),
                value: None,
                author: None,
            }]
        );
    }

    #[test]
    fn bare_object_in_prose_is_found() {
        let raw = "Sure! The update is {\"1\": {\"command\": \"add\", \"feature\": \"f\", \"tag\": \"t\", \"value\": \"v\"}} as requested.";
        let extracted = extract_response_json(raw);
        assert!(extracted.json.starts_with('{'));
        assert_eq!(parse_update_commands(&extracted.json).unwrap().len(), 1);
    }

    #[test]
    fn annotation_placeholders_are_stripped() {
        let raw = "{\"1\": {\"command\": \"delete\", \"feature\": \"f\", \"tag\": \"t\"}, ... (other tags remain the same)}";
        let commands = parse_update_commands(raw).unwrap();
        assert_eq!(commands.len(), 1);
    }

    #[test]
    fn unbalanced_braces_are_closed() {
        let raw = "{\"1\": {\"command\": \"delete\", \"feature\": \"f\", \"tag\": \"t\"";
        let commands = parse_update_commands(raw).unwrap();
        assert_eq!(commands.len(), 1);
    }

    #[test]
    fn scan_salvages_multiple_objects_from_junk() {
        let raw = "\"unterminated {\"1\": {\"command\": \"add\", \"feature\": \"a\", \"tag\": \"t\", \"value\": \"v1\"}} noise {\"2\": {\"command\": \"add\", \"feature\": \"b\", \"tag\": \"t\", \"value\": \"v2\"}}";
        let objects = scan_json_objects(raw);
        assert_eq!(objects.len(), 2);
    }

    #[test]
    fn invalid_commands_are_dropped_not_fatal() {
        let raw = r#"{
            "1": {"command": "add", "feature": "ok", "tag": "t", "value": "v"},
            "2": {"command": "replace", "feature": "x", "tag": "t", "value": "v"},
            "3": {"command": "add", "feature": "no-value", "tag": "t"},
            "4": {"command": "delete", "tag": "t"},
            "5": "not an object"
        }"#;
        let commands = parse_update_commands(raw).unwrap();
        assert_eq!(commands.len(), 1);
        assert!(matches!(&commands[0], ProfileCommand::Add { feature, .. } if feature == "ok"));
    }

    #[test]
    fn command_order_follows_emission_order() {
        let raw = r#"{
            "1": {"command": "delete", "feature": "tone", "tag": "w"},
            "2": {"command": "add", "feature": "tone", "tag": "w", "value": "formal"}
        }"#;
        let commands = parse_update_commands(raw).unwrap();
        assert!(matches!(commands[0], ProfileCommand::Delete { .. }));
        assert!(matches!(commands[1], ProfileCommand::Add { .. }));
    }

    #[test]
    fn date_and_author_are_captured() {
        let raw = r#"{"1": {"command": "add", "feature": "f", "tag": "t", "value": "v", "date": "2024-06", "author": "alice"}}"#;
        let commands = parse_update_commands(raw).unwrap();
        assert_eq!(
            commands,
            vec![ProfileCommand::Add {
                feature: "f".to_string(),
                tag: "t".to_string(),
                value: "v".to_string(),
                date: Some("2024-06".to_string()),
                author: Some("alice".to_string()),
            }]
        );
    }

    #[test]
    fn non_object_update_payload_is_a_parse_error() {
        assert!(matches!(
            parse_update_commands("[1, 2, 3]"),
            Err(MemoryError::Parse(_))
        ));
        assert!(matches!(
            parse_update_commands("total garbage with no braces"),
            Err(MemoryError::Parse(_))
        ));
    }

    #[test]
    fn consolidation_plan_parses_both_lists() {
        let raw = r#"{
            "consolidate_memories": [
                {"tag": "t", "feature": "f", "value": "merged", "metadata": {"citations": [1, 2]}}
            ],
            "keep_memories": [3, 4, "bad"]
        }"#;
        let plan = parse_consolidation_plan(raw).unwrap();
        assert!(!plan.keep_all);
        assert_eq!(plan.keep_ids, vec![3, 4]);
        assert_eq!(plan.merged.len(), 1);
        assert_eq!(plan.merged[0].metadata.citations, vec![1, 2]);
    }

    #[test]
    fn missing_keep_memories_means_keep_all() {
        let raw = r#"{"consolidate_memories": []}"#;
        let plan = parse_consolidation_plan(raw).unwrap();
        assert!(plan.keep_all);
        assert!(plan.keep_ids.is_empty());
    }

    #[test]
    fn malformed_consolidate_list_means_keep_all() {
        let raw = r#"{"consolidate_memories": "nope", "keep_memories": [1]}"#;
        let plan = parse_consolidation_plan(raw).unwrap();
        assert!(plan.keep_all);
        assert!(plan.merged.is_empty());
        assert_eq!(plan.keep_ids, vec![1]);
    }

    #[test]
    fn malformed_merged_entries_are_skipped() {
        let raw = r#"{
            "consolidate_memories": [
                {"tag": "t", "feature": "f", "value": "ok", "metadata": {"citations": []}},
                {"tag": "t", "feature": "f"}
            ],
            "keep_memories": []
        }"#;
        let plan = parse_consolidation_plan(raw).unwrap();
        assert_eq!(plan.merged.len(), 1);
    }
}
