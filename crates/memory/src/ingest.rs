//! Background ingestion: drains dirty users, drives the LLM through the
//! update prompt, and applies the resulting commands to the profile.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use serde_json::Value;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::consolidate::consolidate_profile;
use crate::engine::EngineCore;
use crate::error::Result;
use crate::parse::{ProfileCommand, extract_response_json, parse_update_commands};
use crate::schema::{HistoryMessage, canonical_isolations};

/// Spawn the long-running ingestion task.  It polls the dirty-user tracker,
/// sleeps `update_interval_sec` between empty polls, and exits after the
/// current batch once the shutdown flag flips.
pub(crate) fn spawn_ingestion_worker(
    core: Arc<EngineCore>,
    mut shutdown_rx: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let interval = Duration::from_secs_f64(core.settings.update_interval_sec);
        info!("ingestion worker started");
        loop {
            if *shutdown_rx.borrow() {
                break;
            }

            let users = core.tracker.take_users_to_update();
            if users.is_empty() {
                tokio::select! {
                    _ = tokio::time::sleep(interval) => {}
                    changed = shutdown_rx.changed() => {
                        if changed.is_err() || *shutdown_rx.borrow() {
                            break;
                        }
                    }
                }
                continue;
            }

            debug!(count = users.len(), "processing dirty users");
            join_all(users.iter().map(|user| process_user(&core, user))).await;
        }
        info!("ingestion worker stopped");
    })
}

async fn process_user(core: &EngineCore, user_id: &str) {
    let pending = match core
        .storage
        .get_history_messages_by_ingestion_status(user_id, core.settings.history_batch_size, false)
        .await
    {
        Ok(rows) => rows,
        Err(err) => {
            error!(user_id, %err, "loading pending history failed");
            return;
        }
    };
    if pending.is_empty() {
        return;
    }

    debug!(user_id, count = pending.len(), "ingesting pending messages");
    let groups = group_by_isolation(pending);
    join_all(
        groups
            .into_values()
            .map(|messages| process_group(core, messages)),
    )
    .await;
}

/// Group pending messages by canonical isolation, preserving the incoming
/// `(created_at, id)` order within each group.
fn group_by_isolation(messages: Vec<HistoryMessage>) -> BTreeMap<String, Vec<HistoryMessage>> {
    let mut groups: BTreeMap<String, Vec<HistoryMessage>> = BTreeMap::new();
    for message in messages {
        groups
            .entry(canonical_isolations(&message.isolations))
            .or_default()
            .push(message);
    }
    groups
}

/// Apply one isolation group in message order.  Consolidation runs only for
/// the final message.  An external failure aborts the rest of the group so
/// the retry on the next tick replays messages in order.
async fn process_group(core: &EngineCore, messages: Vec<HistoryMessage>) {
    let last = messages.len() - 1;
    for (index, message) in messages.iter().enumerate() {
        match update_from_message(core, message, index == last).await {
            Ok(()) => {
                if let Err(err) = core.storage.mark_messages_ingested(&[message.id]).await {
                    error!(message_id = message.id, %err, "marking message ingested failed");
                    return;
                }
            }
            Err(err) => {
                error!(
                    message_id = message.id,
                    user_id = %message.user_id,
                    %err,
                    "profile update failed; message kept for retry"
                );
                return;
            }
        }
    }
}

/// Run one message through the update prompt and apply the parsed commands.
///
/// External failures (model, embedder, storage) propagate so the message is
/// retried; unreadable model output is logged and dropped so a poison message
/// cannot wedge the queue.
async fn update_from_message(
    core: &EngineCore,
    message: &HistoryMessage,
    consolidate: bool,
) -> Result<()> {
    let profile = core
        .profile_cached(&message.user_id, &message.isolations)
        .await?;
    let rendered =
        serde_json::to_string_pretty(&profile).unwrap_or_else(|_| "{}".to_string());
    let user_prompt = format!(
        "The old profile is provided below:\n\
         <OLD_PROFILE>\n{rendered}\n</OLD_PROFILE>\n\
         \n\
         The history is provided below:\n\
         <HISTORY>\n{content}\n</HISTORY>\n",
        content = message.content,
    );

    let (response, _tool_calls) = core
        .model
        .generate_response(
            Some(&core.update_prompt),
            Some(&user_prompt),
            None,
            None,
            core.settings.llm_max_attempts,
        )
        .await?;

    let extracted = extract_response_json(&response);
    if let Some(thinking) = &extracted.thinking {
        debug!(user_id = %message.user_id, thinking = %thinking, "update reasoning captured");
    }

    let commands = match parse_update_commands(&extracted.json) {
        Ok(commands) => commands,
        Err(err) => {
            warn!(
                message_id = message.id,
                user_id = %message.user_id,
                %err,
                "discarding unreadable profile update"
            );
            return Ok(());
        }
    };

    debug!(
        user_id = %message.user_id,
        message_id = message.id,
        count = commands.len(),
        "applying profile commands"
    );
    for command in commands {
        match command {
            ProfileCommand::Add {
                feature,
                tag,
                value,
                date,
                author,
            } => {
                let value = match date {
                    Some(edtf) => format!("[{edtf}] {value}"),
                    None => value,
                };
                let mut metadata = serde_json::Map::new();
                if let Some(author) = author {
                    metadata.insert("author".to_string(), Value::from(author));
                }
                core.add_new_profile(
                    &message.user_id,
                    &feature,
                    &value,
                    &tag,
                    Value::Object(metadata),
                    &message.isolations,
                    vec![message.id],
                )
                .await?;
            }
            ProfileCommand::Delete {
                feature,
                tag,
                value,
                ..
            } => {
                core.delete_profile_feature(
                    &message.user_id,
                    &feature,
                    &tag,
                    value.as_deref(),
                    &message.isolations,
                )
                .await?;
            }
        }
    }

    if consolidate {
        consolidate_profile(core, &message.user_id, &message.isolations).await;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{IsolationValue, Isolations};
    use chrono::Utc;

    fn message(id: i64, session: &str) -> HistoryMessage {
        let mut isolations = Isolations::new();
        isolations.insert("session".to_string(), IsolationValue::from(session));
        HistoryMessage {
            id,
            user_id: "u".to_string(),
            content: format!("message {id}"),
            metadata: Value::Null,
            isolations,
            created_at: Utc::now(),
            is_ingested: false,
        }
    }

    #[test]
    fn grouping_is_by_canonical_isolation() {
        let groups = group_by_isolation(vec![
            message(1, "a"),
            message(2, "b"),
            message(3, "a"),
        ]);
        assert_eq!(groups.len(), 2);

        let ids: Vec<Vec<i64>> = groups
            .values()
            .map(|msgs| msgs.iter().map(|m| m.id).collect())
            .collect();
        assert!(ids.contains(&vec![1, 3]));
        assert!(ids.contains(&vec![2]));
    }

    #[test]
    fn grouping_preserves_intra_group_order() {
        let groups = group_by_isolation(vec![
            message(5, "a"),
            message(2, "a"),
            message(9, "a"),
        ]);
        let only: Vec<i64> = groups.values().next().unwrap().iter().map(|m| m.id).collect();
        assert_eq!(only, vec![5, 2, 9]);
    }
}
