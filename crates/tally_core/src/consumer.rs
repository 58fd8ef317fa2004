/*
 * SPDX-FileCopyrightText: 2026 Tally Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

//! Queue consumers: drain the event log into the membership store.
//! Delivery is at-least-once, so every apply is written to tolerate
//! redelivery — the store's gated transactions make duplicates no-ops.

use anyhow::Result;
use futures_util::StreamExt;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{info, warn};

use crate::{
    content_db::ContentDb,
    event_log::{next_backoff, Action, EventBody, EventLog, QueuedEvent},
    InteractionKind,
};

#[derive(Debug)]
pub enum ApplyOutcome {
    /// Applied (or recognized as already applied). Ack and forget.
    Ack,
    /// Transient failure, redeliver later.
    Requeue(String),
    /// Permanently unprocessable. Dead-letter with the reason.
    Drop(String),
}

#[derive(Debug, Clone)]
pub struct ConsumerSettings {
    pub batch: u32,
    /// In-batch apply concurrency per queue.
    pub workers: usize,
    pub idle_tick: Duration,
    pub base_backoff_secs: u64,
    pub max_backoff_secs: u64,
    /// `None` retries forever; `Some(n)` dead-letters after n failures.
    pub max_attempts: Option<u32>,
}

impl Default for ConsumerSettings {
    fn default() -> Self {
        Self {
            batch: 40,
            workers: 4,
            idle_tick: Duration::from_secs(2),
            base_backoff_secs: 5,
            max_backoff_secs: 3600,
            max_attempts: Some(10),
        }
    }
}

#[derive(Clone)]
pub struct Consumer {
    db: ContentDb,
    log: EventLog,
    settings: ConsumerSettings,
}

impl Consumer {
    pub fn new(db: ContentDb, log: EventLog, settings: ConsumerSettings) -> Self {
        Self { db, log, settings }
    }

    /// Spawns one worker per interaction queue.
    pub fn start_workers(&self, shutdown: watch::Receiver<bool>) {
        for kind in InteractionKind::ALL {
            let consumer = self.clone();
            let shutdown = shutdown.clone();
            tokio::spawn(async move {
                if let Err(e) = consumer.run_loop(kind, shutdown).await {
                    warn!("consumer for {} stopped: {e:#}", kind.queue());
                }
            });
        }
    }

    async fn run_loop(&self, kind: InteractionKind, mut shutdown: watch::Receiver<bool>) -> Result<()> {
        info!("consumer started: queue={}", kind.queue());
        let wakeup = self.log.wakeup();
        loop {
            if *shutdown.borrow() {
                break;
            }

            let processed = self.run_once(kind).await?;
            if processed == 0 {
                tokio::select! {
                    _ = wakeup.notified() => {}
                    _ = tokio::time::sleep(self.settings.idle_tick) => {}
                    _ = shutdown.changed() => {}
                }
            }
        }
        Ok(())
    }

    /// Drains one batch; returns how many events were fetched.
    /// Separated from the loop so tests can drive it directly.
    /// Events in a batch are distinct rows, so applying them with
    /// bounded concurrency is safe.
    pub async fn run_once(&self, kind: InteractionKind) -> Result<u32> {
        let events = self.log.fetch_due(kind.queue(), self.settings.batch).await?;
        let fetched = events.len() as u32;
        futures_util::stream::iter(events)
            .for_each_concurrent(self.settings.workers.max(1), |event| async move {
                if let Err(e) = self.handle_one(kind, event).await {
                    warn!("consumer disposition failed: {e:#}");
                }
            })
            .await;
        Ok(fetched)
    }

    async fn handle_one(&self, kind: InteractionKind, event: QueuedEvent) -> Result<()> {
        let message_id = event.message_id.clone();
        let attempt = event.attempt;
        match self.apply_event(kind, event).await {
            ApplyOutcome::Ack => self.log.ack(&message_id).await?,
            ApplyOutcome::Drop(reason) => {
                warn!("dead-lettering {message_id}: {reason}");
                self.log.mark_dead(&message_id, &reason).await?;
            }
            ApplyOutcome::Requeue(reason) => {
                let next_attempt = attempt + 1;
                if self
                    .settings
                    .max_attempts
                    .is_some_and(|max| next_attempt >= max)
                {
                    warn!("giving up on {message_id} after {next_attempt} attempts: {reason}");
                    self.log.mark_dead(&message_id, &reason).await?;
                } else {
                    let delay = next_backoff(
                        next_attempt,
                        self.settings.base_backoff_secs,
                        self.settings.max_backoff_secs,
                    );
                    self.log
                        .requeue(&message_id, next_attempt, delay, &reason)
                        .await?;
                }
            }
        }
        Ok(())
    }

    async fn apply_event(&self, kind: InteractionKind, event: QueuedEvent) -> ApplyOutcome {
        let body: EventBody = match serde_json::from_slice(&event.payload) {
            Ok(body) => body,
            Err(e) => return ApplyOutcome::Drop(format!("bad payload: {e}")),
        };

        let db = self.db.clone();
        let res = tokio::task::spawn_blocking(move || -> Result<()> {
            match body {
                EventBody::Interaction {
                    actor_id,
                    target_id,
                    action: Action::Like,
                    ..
                } => {
                    // false means the fact already exists: a duplicate
                    // delivery or a replay. Either way, done.
                    db.apply_like(kind, actor_id, target_id)?;
                }
                EventBody::Interaction {
                    actor_id,
                    target_id,
                    action: Action::Unlike,
                    ..
                } => {
                    db.apply_unlike(kind, actor_id, target_id)?;
                }
                EventBody::CounterSync {
                    target_id, value, ..
                } => {
                    db.set_counter(kind, target_id, value)?;
                }
            }
            Ok(())
        })
        .await;

        match res {
            Ok(Ok(())) => ApplyOutcome::Ack,
            Ok(Err(e)) => ApplyOutcome::Requeue(format!("store error: {e:#}")),
            Err(e) => ApplyOutcome::Requeue(format!("apply task failed: {e}")),
        }
    }
}
