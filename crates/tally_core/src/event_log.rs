/*
 * SPDX-FileCopyrightText: 2026 Tally Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

//! Append-only, at-least-once event log decoupling the request path
//! from the membership store write. One sqlite-backed table, one
//! logical queue per interaction kind.

use anyhow::{Context, Result};
use rand::{rngs::OsRng, RngCore};
use rusqlite::{params, Connection};
use serde::{Deserialize, Serialize};
use std::{
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};
use tokio::sync::Notify;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Action {
    Like,
    Unlike,
}

/// Wire payload. `CounterSync` is deliberately a distinct,
/// absolute-value event type: reconciliation corrections are "set the
/// counter to X", never an increment that could double-count.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EventBody {
    Interaction {
        actor_id: i64,
        target_id: i64,
        action: Action,
        timestamp_ms: i64,
    },
    CounterSync {
        target_id: i64,
        value: i64,
        timestamp_ms: i64,
    },
}

#[derive(Debug, Clone)]
pub struct QueuedEvent {
    pub message_id: String,
    pub queue: String,
    pub attempt: u32,
    pub payload: Vec<u8>,
}

#[derive(Debug, Clone)]
pub struct QueueStats {
    pub pending: u64,
    pub applied: u64,
    pub dead: u64,
}

#[derive(Clone)]
pub struct EventLog {
    db_path: PathBuf,
    notify: Arc<Notify>,
}

impl EventLog {
    pub fn open(db_path: impl AsRef<Path>) -> Result<Self> {
        let db_path = db_path.as_ref().to_path_buf();
        init_db(&db_path)?;
        Ok(Self {
            db_path,
            notify: Arc::new(Notify::new()),
        })
    }

    pub fn db_path(&self) -> &Path {
        &self.db_path
    }

    /// Wakeup handle for consumer loops.
    pub fn wakeup(&self) -> Arc<Notify> {
        self.notify.clone()
    }

    /// Appends one event and returns its message id (the dedup /
    /// idempotency token carried through redelivery).
    pub async fn publish(&self, queue: &str, body: &EventBody) -> Result<String> {
        let message_id = new_message_id();
        let payload = serde_json::to_vec(body).context("encode event")?;
        let created_at = now_ms();
        tokio::task::spawn_blocking({
            let db_path = self.db_path.clone();
            let message_id = message_id.clone();
            let queue = queue.to_string();
            move || -> Result<()> {
                let conn = open_conn(&db_path)?;
                conn.execute(
                    r#"
                    INSERT INTO interaction_events (
                      message_id, queue, created_at_ms, next_attempt_at_ms, attempt, status, payload, last_error
                    ) VALUES (?1, ?2, ?3, ?3, 0, 0, ?4, NULL)
                    "#,
                    params![message_id, queue, created_at, payload],
                )?;
                Ok(())
            }
        })
        .await??;

        self.notify.notify_one();
        Ok(message_id)
    }

    pub async fn fetch_due(&self, queue: &str, limit: u32) -> Result<Vec<QueuedEvent>> {
        tokio::task::spawn_blocking({
            let db_path = self.db_path.clone();
            let queue = queue.to_string();
            move || -> Result<Vec<QueuedEvent>> {
                let conn = open_conn(&db_path)?;
                let now = now_ms();
                let mut stmt = conn.prepare(
                    r#"
                    SELECT message_id, queue, attempt, payload
                    FROM interaction_events
                    WHERE queue = ?1 AND status = 0 AND next_attempt_at_ms <= ?2
                    ORDER BY next_attempt_at_ms ASC
                    LIMIT ?3
                    "#,
                )?;
                let mut rows = stmt.query(params![queue, now, limit])?;
                let mut out = Vec::new();
                while let Some(row) = rows.next()? {
                    out.push(QueuedEvent {
                        message_id: row.get(0)?,
                        queue: row.get(1)?,
                        attempt: row.get(2)?,
                        payload: row.get(3)?,
                    });
                }
                Ok(out)
            }
        })
        .await?
    }

    /// Marks an event applied. Applied rows are kept for stats and
    /// pruned by the housekeeping job.
    pub async fn ack(&self, message_id: &str) -> Result<()> {
        tokio::task::spawn_blocking({
            let db_path = self.db_path.clone();
            let message_id = message_id.to_string();
            move || -> Result<()> {
                let conn = open_conn(&db_path)?;
                conn.execute(
                    "UPDATE interaction_events SET status = 1, last_error = NULL WHERE message_id = ?1",
                    params![message_id],
                )?;
                Ok(())
            }
        })
        .await??;
        Ok(())
    }

    /// Schedules redelivery after `delay`.
    pub async fn requeue(
        &self,
        message_id: &str,
        attempt: u32,
        delay: Duration,
        err: &str,
    ) -> Result<()> {
        let next = now_ms().saturating_add(delay.as_millis() as i64);
        tokio::task::spawn_blocking({
            let db_path = self.db_path.clone();
            let message_id = message_id.to_string();
            let err = err.to_string();
            move || -> Result<()> {
                let conn = open_conn(&db_path)?;
                conn.execute(
                    "UPDATE interaction_events SET attempt = ?2, next_attempt_at_ms = ?3, last_error = ?4 WHERE message_id = ?1",
                    params![message_id, attempt, next, err],
                )?;
                Ok(())
            }
        })
        .await??;
        Ok(())
    }

    /// Terminal failure: malformed payloads and (optionally) poison
    /// messages that exhausted their attempts.
    pub async fn mark_dead(&self, message_id: &str, err: &str) -> Result<()> {
        tokio::task::spawn_blocking({
            let db_path = self.db_path.clone();
            let message_id = message_id.to_string();
            let err = err.to_string();
            move || -> Result<()> {
                let conn = open_conn(&db_path)?;
                conn.execute(
                    "UPDATE interaction_events SET status = 2, last_error = ?2 WHERE message_id = ?1",
                    params![message_id, err],
                )?;
                Ok(())
            }
        })
        .await??;
        Ok(())
    }

    pub async fn stats(&self) -> Result<QueueStats> {
        tokio::task::spawn_blocking({
            let db_path = self.db_path.clone();
            move || -> Result<QueueStats> {
                let conn = open_conn(&db_path)?;
                let count = |status: i64| -> Result<u64> {
                    Ok(conn.query_row(
                        "SELECT COUNT(*) FROM interaction_events WHERE status = ?1",
                        params![status],
                        |r| r.get(0),
                    )?)
                };
                Ok(QueueStats {
                    pending: count(0)?,
                    applied: count(1)?,
                    dead: count(2)?,
                })
            }
        })
        .await?
    }

    /// Housekeeping: drop applied rows older than `cutoff_ms`.
    pub async fn prune_applied_before(&self, cutoff_ms: i64) -> Result<u64> {
        tokio::task::spawn_blocking({
            let db_path = self.db_path.clone();
            move || -> Result<u64> {
                let conn = open_conn(&db_path)?;
                let deleted = conn.execute(
                    "DELETE FROM interaction_events WHERE status = 1 AND created_at_ms < ?1",
                    params![cutoff_ms],
                )?;
                Ok(deleted as u64)
            }
        })
        .await?
    }
}

fn open_conn(path: &Path) -> Result<Connection> {
    let conn = Connection::open(path)?;
    conn.busy_timeout(Duration::from_secs(5))?;
    Ok(conn)
}

fn init_db(path: &Path) -> Result<()> {
    let conn = Connection::open(path).with_context(|| format!("open db: {}", path.display()))?;
    conn.execute_batch(
        r#"
        PRAGMA journal_mode=WAL;
        CREATE TABLE IF NOT EXISTS interaction_events (
          message_id TEXT PRIMARY KEY,
          queue TEXT NOT NULL,
          created_at_ms INTEGER NOT NULL,
          next_attempt_at_ms INTEGER NOT NULL,
          attempt INTEGER NOT NULL,
          status INTEGER NOT NULL,
          payload BLOB NOT NULL,
          last_error TEXT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_events_due ON interaction_events(queue, status, next_attempt_at_ms);
        "#,
    )?;
    Ok(())
}

pub(crate) fn now_ms() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as i64
}

fn new_message_id() -> String {
    // 16 random bytes -> 32 hex chars
    let mut b = [0u8; 16];
    OsRng.fill_bytes(&mut b);
    b.iter().map(|v| format!("{v:02x}")).collect()
}

pub(crate) fn next_backoff(attempt: u32, base_secs: u64, max_secs: u64) -> Duration {
    let pow = attempt.saturating_sub(1).min(20);
    let mut secs = base_secs.saturating_mul(1u64 << pow);
    if secs > max_secs {
        secs = max_secs;
    }
    // jitter 0..1000ms
    let mut b = [0u8; 2];
    OsRng.fill_bytes(&mut b);
    let jitter_ms = u16::from_le_bytes(b) as u64 % 1000;
    Duration::from_secs(secs) + Duration::from_millis(jitter_ms)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn open_log() -> (tempfile::TempDir, EventLog) {
        let dir = tempfile::tempdir().expect("tempdir");
        let log = EventLog::open(dir.path().join("events.db")).expect("open");
        (dir, log)
    }

    fn like_body(actor_id: i64, target_id: i64) -> EventBody {
        EventBody::Interaction {
            actor_id,
            target_id,
            action: Action::Like,
            timestamp_ms: now_ms(),
        }
    }

    #[tokio::test]
    async fn publish_fetch_ack() {
        let (_dir, log) = open_log();
        let id = log.publish("like.post", &like_body(7, 42)).await.unwrap();
        assert_eq!(id.len(), 32);

        let due = log.fetch_due("like.post", 10).await.unwrap();
        assert_eq!(due.len(), 1);
        assert_eq!(due[0].message_id, id);
        let body: EventBody = serde_json::from_slice(&due[0].payload).unwrap();
        assert!(matches!(
            body,
            EventBody::Interaction { actor_id: 7, target_id: 42, action: Action::Like, .. }
        ));
        // Other queues do not see it.
        assert!(log.fetch_due("like.comment", 10).await.unwrap().is_empty());

        log.ack(&id).await.unwrap();
        assert!(log.fetch_due("like.post", 10).await.unwrap().is_empty());
        let stats = log.stats().await.unwrap();
        assert_eq!(stats.applied, 1);
        assert_eq!(stats.pending, 0);
    }

    #[tokio::test]
    async fn requeue_defers_redelivery() {
        let (_dir, log) = open_log();
        let id = log.publish("like.post", &like_body(7, 42)).await.unwrap();

        log.requeue(&id, 1, Duration::from_secs(3600), "db busy")
            .await
            .unwrap();
        assert!(log.fetch_due("like.post", 10).await.unwrap().is_empty());

        log.requeue(&id, 2, Duration::ZERO, "db busy").await.unwrap();
        let due = log.fetch_due("like.post", 10).await.unwrap();
        assert_eq!(due.len(), 1);
        assert_eq!(due[0].attempt, 2);
    }

    #[tokio::test]
    async fn dead_events_stay_dead() {
        let (_dir, log) = open_log();
        let id = log.publish("like.post", &like_body(7, 42)).await.unwrap();
        log.mark_dead(&id, "unparseable").await.unwrap();
        assert!(log.fetch_due("like.post", 10).await.unwrap().is_empty());
        assert_eq!(log.stats().await.unwrap().dead, 1);
    }

    #[tokio::test]
    async fn prune_applied() {
        let (_dir, log) = open_log();
        let id = log.publish("like.post", &like_body(7, 42)).await.unwrap();
        log.ack(&id).await.unwrap();
        assert_eq!(log.prune_applied_before(now_ms() + 1).await.unwrap(), 1);
        assert_eq!(log.stats().await.unwrap().applied, 0);
    }

    #[test]
    fn backoff_grows_and_caps() {
        let base = next_backoff(1, 5, 3600);
        assert!(base >= Duration::from_secs(5) && base < Duration::from_secs(7));
        let capped = next_backoff(15, 5, 3600);
        assert!(capped >= Duration::from_secs(3600) && capped < Duration::from_secs(3602));
    }
}
