/*
 * SPDX-FileCopyrightText: 2026 Tally Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

//! Fan-out of accepted interactions to whatever UI or notification
//! layer is listening. Delivery is best-effort; the engine never
//! fails a request because nobody is subscribed.

use crate::TargetType;
use async_trait::async_trait;
use serde::Serialize;
use tokio::sync::broadcast;

#[derive(Clone, Debug, Serialize)]
pub struct InteractionNotice {
    pub kind: String,
    pub actor_id: i64,
    pub owner_id: i64,
    pub target_id: i64,
    pub target_type: TargetType,
    pub ts_ms: i64,
}

impl InteractionNotice {
    pub fn new(
        kind: &str,
        actor_id: i64,
        owner_id: i64,
        target_id: i64,
        target_type: TargetType,
    ) -> Self {
        Self {
            kind: kind.to_string(),
            actor_id,
            owner_id,
            target_id,
            target_type,
            ts_ms: crate::event_log::now_ms(),
        }
    }
}

#[async_trait]
pub trait NotificationSink: Send + Sync {
    async fn notice(&self, notice: InteractionNotice);
}

/// Broadcast-channel sink; receivers are UI sessions or push workers.
pub struct BroadcastSink {
    tx: broadcast::Sender<InteractionNotice>,
}

impl BroadcastSink {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<InteractionNotice> {
        self.tx.subscribe()
    }
}

#[async_trait]
impl NotificationSink for BroadcastSink {
    async fn notice(&self, notice: InteractionNotice) {
        // Err only means no live receivers.
        let _ = self.tx.send(notice);
    }
}

pub struct NullSink;

#[async_trait]
impl NotificationSink for NullSink {
    async fn notice(&self, _notice: InteractionNotice) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn broadcast_reaches_subscribers() {
        let sink = BroadcastSink::new(8);
        let mut rx = sink.subscribe();
        sink.notice(InteractionNotice::new("like", 1, 2, 3, TargetType::Post))
            .await;
        let got = rx.recv().await.unwrap();
        assert_eq!(got.actor_id, 1);
        assert_eq!(got.target_id, 3);
    }

    #[tokio::test]
    async fn send_without_subscribers_is_fine() {
        let sink = BroadcastSink::new(8);
        sink.notice(InteractionNotice::new("like", 1, 2, 3, TargetType::Post))
            .await;
    }
}
