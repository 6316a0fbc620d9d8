use crate::bots::{Bot, BotMetadataUpdate, BotStore};
use crate::upstream::{UpstreamClient, UpstreamTarget};
use serde::Serialize;
use serde_json::Value;
use std::time::Duration;

#[derive(Debug, Clone, Default, Serialize, PartialEq, Eq)]
pub struct SyncSummary {
    pub total: usize,
    pub successful: usize,
    pub failed: usize,
}

fn non_empty_str(value: &Value, key: &str) -> Option<String> {
    value
        .get(key)
        .and_then(|v| v.as_str())
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

/// Queries `info`, `parameters` and `meta` concurrently. Each endpoint contributes
/// independently; a failing one is logged and skipped.
pub async fn fetch_metadata(upstream: &UpstreamClient, bot: &Bot) -> BotMetadataUpdate {
    let target = bot.upstream_target();
    let (info, parameters, meta) = tokio::join!(
        upstream.get_json(&target, "info", &[]),
        upstream.get_json(&target, "parameters", &[]),
        upstream.get_json(&target, "meta", &[]),
    );

    let mut update = BotMetadataUpdate::default();
    match info {
        Ok(info) => {
            update.name = non_empty_str(&info, "name");
            update.description = non_empty_str(&info, "description");
        }
        Err(err) => tracing::warn!(bot_id = %bot.id, error = %err, "bot sync: info unavailable"),
    }
    match parameters {
        Ok(parameters) => update.welcome_message = non_empty_str(&parameters, "opening_statement"),
        Err(err) => {
            tracing::warn!(bot_id = %bot.id, error = %err, "bot sync: parameters unavailable")
        }
    }
    match meta {
        Ok(meta) => update.avatar = non_empty_str(&meta, "icon"),
        Err(err) => tracing::warn!(bot_id = %bot.id, error = %err, "bot sync: meta unavailable"),
    }
    update
}

/// Refreshes one bot from its provider. Returns the bot as stored afterwards.
pub async fn sync_bot(
    upstream: &UpstreamClient,
    bots: &BotStore,
    bot: &Bot,
) -> Result<Bot, String> {
    let update = fetch_metadata(upstream, bot).await;
    if update.is_empty() {
        tracing::warn!(bot_id = %bot.id, "bot sync: nothing to update");
        return Ok(bot.clone());
    }
    let updated = bots
        .apply_metadata(&bot.id, update)
        .await?
        .ok_or_else(|| format!("bot {} disappeared during sync", bot.id))?;
    tracing::info!(bot_id = %bot.id, "bot synced from upstream");
    Ok(updated)
}

pub async fn sync_all_active(upstream: &UpstreamClient, bots: &BotStore) -> Result<SyncSummary, String> {
    let active = bots.list_active_bots().await?;
    let mut summary = SyncSummary {
        total: active.len(),
        ..Default::default()
    };
    for bot in &active {
        match sync_bot(upstream, bots, bot).await {
            Ok(_) => summary.successful += 1,
            Err(err) => {
                summary.failed += 1;
                tracing::warn!(bot_id = %bot.id, error = %err, "bot sync failed");
            }
        }
    }
    tracing::info!(
        total = summary.total,
        successful = summary.successful,
        failed = summary.failed,
        "bot sync pass finished"
    );
    Ok(summary)
}

/// Calls `info` with the given credentials; `{valid, app_info}` or `{valid, error}`.
pub async fn validate_target(upstream: &UpstreamClient, target: &UpstreamTarget) -> Value {
    match upstream.get_json(target, "info", &[]).await {
        Ok(info) => serde_json::json!({ "valid": true, "app_info": info }),
        Err(err) => serde_json::json!({ "valid": false, "error": err.message }),
    }
}

pub fn spawn_sync_loop(upstream: UpstreamClient, bots: BotStore, interval: Duration) {
    tokio::spawn(async move {
        loop {
            tokio::time::sleep(interval).await;
            if let Err(err) = sync_all_active(&upstream, &bots).await {
                tracing::warn!(error = %err, "bot sync pass failed");
            }
        }
    });
}
