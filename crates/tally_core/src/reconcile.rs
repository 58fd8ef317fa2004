/*
 * SPDX-FileCopyrightText: 2026 Tally Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

//! Background reconciliation: periodically snapshots every cached
//! counter and republishes it as an absolute correction, so the store
//! converges even when individual events were lost. A slower
//! housekeeping pass re-arms TTLs and prunes applied event rows.

use anyhow::Result;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{info, warn};

use crate::{
    cache::{InteractionCache, KeyTtl, DEFAULT_TTL},
    event_log::{now_ms, EventBody, EventLog},
    InteractionKind,
};

#[derive(Debug, Clone, serde::Deserialize)]
pub struct ReconcileConfig {
    pub sync_interval_secs: Option<u64>,
    pub cleanup_interval_secs: Option<u64>,
    pub applied_retention_days: Option<u32>,
}

impl Default for ReconcileConfig {
    fn default() -> Self {
        Self {
            sync_interval_secs: Some(300),
            cleanup_interval_secs: Some(24 * 3600),
            applied_retention_days: Some(7),
        }
    }
}

pub fn start_sync_worker(
    cfg: ReconcileConfig,
    cache: Arc<dyn InteractionCache>,
    log: EventLog,
    mut shutdown: watch::Receiver<bool>,
) {
    tokio::spawn(async move {
        let interval = cfg.sync_interval_secs.unwrap_or(300).max(30);
        let mut tick = tokio::time::interval(Duration::from_secs(interval));
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = shutdown.changed() => {
                    if *shutdown.borrow() { break; }
                }
                _ = tick.tick() => {}
            }

            if *shutdown.borrow() {
                break;
            }

            match sync_once(cache.as_ref(), &log).await {
                Ok(published) if published > 0 => {
                    info!(published, "counter sync published corrections");
                }
                Ok(_) => {}
                Err(e) => warn!("counter sync error: {e:#}"),
            }
        }
    });
}

pub fn start_cleanup_worker(
    cfg: ReconcileConfig,
    cache: Arc<dyn InteractionCache>,
    log: EventLog,
    mut shutdown: watch::Receiver<bool>,
) {
    tokio::spawn(async move {
        let interval = cfg.cleanup_interval_secs.unwrap_or(24 * 3600).max(60);
        let retention_days = cfg.applied_retention_days.unwrap_or(7).max(1);
        let mut tick = tokio::time::interval(Duration::from_secs(interval));
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = shutdown.changed() => {
                    if *shutdown.borrow() { break; }
                }
                _ = tick.tick() => {}
            }

            if *shutdown.borrow() {
                break;
            }

            let cutoff = now_ms()
                .saturating_sub((retention_days as i64).saturating_mul(24 * 3600 * 1000));
            match cleanup_once(cache.as_ref(), &log, cutoff).await {
                Ok(pruned) if pruned > 0 => info!(pruned, "cleanup pruned applied events"),
                Ok(_) => {}
                Err(e) => warn!("cleanup error: {e:#}"),
            }
        }
    });
}

/// One reconciliation sweep: every live cached counter becomes an
/// absolute `CounterSync` on its kind's queue. The consumer sets the
/// store column to this value, so replays and duplicates are harmless.
pub async fn sync_once(cache: &dyn InteractionCache, log: &EventLog) -> Result<u64> {
    let mut published = 0u64;
    for kind in InteractionKind::ALL {
        let keys = cache.scan_keys(kind.counter_pattern()).await?;
        for key in keys {
            let Some(target_id) = kind.parse_counter_key(&key) else {
                continue;
            };
            // Expired between scan and read: nothing to correct.
            let Some(value) = cache.get_int(&key).await? else {
                continue;
            };
            log.publish(
                kind.queue(),
                &EventBody::CounterSync {
                    target_id,
                    value,
                    timestamp_ms: now_ms(),
                },
            )
            .await?;
            published += 1;
        }
    }
    Ok(published)
}

/// Housekeeping: keys that lost their expiry (manual ops, restores)
/// get the standard TTL back, and applied event rows older than the
/// cutoff are dropped.
pub async fn cleanup_once(
    cache: &dyn InteractionCache,
    log: &EventLog,
    applied_cutoff_ms: i64,
) -> Result<u64> {
    let mut patterns = vec![
        "user:*:liked:posts".to_string(),
        "user:*:liked:comments".to_string(),
        "user:*:favorited:posts".to_string(),
        "like:cache:init:*".to_string(),
    ];
    for kind in InteractionKind::ALL {
        patterns.push(kind.counter_pattern().to_string());
    }

    for pattern in patterns {
        for key in cache.scan_keys(&pattern).await? {
            if cache.ttl(&key).await? == KeyTtl::None {
                cache.expire(&key, DEFAULT_TTL).await?;
            }
        }
    }

    log.prune_applied_before(applied_cutoff_ms).await
}
