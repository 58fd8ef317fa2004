/*
 * SPDX-FileCopyrightText: 2026 Tally Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

//! Request-path facade: cache-first reads, cache-arbitrated writes,
//! store mutation deferred to the event log. The cache's atomic
//! set-add/set-remove return values decide whether a request changes
//! state, so concurrent duplicates collapse without any cross-request
//! lock. When the cache is down the engine degrades to store reads.

use anyhow::Result;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{error, warn};

use crate::{
    cache::{InteractionCache, DEFAULT_TTL},
    content_db::ContentDb,
    event_log::{now_ms, Action, EventBody, EventLog},
    notify::{InteractionNotice, NotificationSink},
    InteractionKind,
};

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("target not found or not interactable")]
    TargetUnavailable,
    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

#[derive(Clone)]
pub struct InteractionEngine {
    db: ContentDb,
    cache: Arc<dyn InteractionCache>,
    log: EventLog,
    sink: Arc<dyn NotificationSink>,
    ttl: Duration,
}

impl InteractionEngine {
    pub fn new(
        db: ContentDb,
        cache: Arc<dyn InteractionCache>,
        log: EventLog,
        sink: Arc<dyn NotificationSink>,
    ) -> Self {
        Self {
            db,
            cache,
            log,
            sink,
            ttl: DEFAULT_TTL,
        }
    }

    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }

    /// Records a like/favorite. Returns whether state changed; a
    /// repeat like from the same actor is a quiet no-op.
    pub async fn like(
        &self,
        kind: InteractionKind,
        actor_id: i64,
        target_id: i64,
    ) -> Result<bool, EngineError> {
        let owner_id = self.require_target(kind, target_id).await?;

        let changed = match self.cache_like(kind, actor_id, target_id).await {
            Ok(changed) => changed,
            Err(e) => {
                warn!("cache unavailable on like, using store: {e:#}");
                !self
                    .with_db(move |db| db.is_fact(kind, actor_id, target_id))
                    .await?
            }
        };

        if changed {
            self.publish(kind, actor_id, target_id, Action::Like).await;
            if actor_id != owner_id {
                self.sink
                    .notice(InteractionNotice::new(
                        notice_kind(kind),
                        actor_id,
                        owner_id,
                        target_id,
                        kind.target_type(),
                    ))
                    .await;
            }
        }
        Ok(changed)
    }

    /// Removes a like/favorite. Returns whether state changed.
    pub async fn unlike(
        &self,
        kind: InteractionKind,
        actor_id: i64,
        target_id: i64,
    ) -> Result<bool, EngineError> {
        self.require_target(kind, target_id).await?;

        let changed = match self.cache_unlike(kind, actor_id, target_id).await {
            Ok(changed) => changed,
            Err(e) => {
                warn!("cache unavailable on unlike, using store: {e:#}");
                self.with_db(move |db| db.is_fact(kind, actor_id, target_id))
                    .await?
            }
        };

        if changed {
            self.publish(kind, actor_id, target_id, Action::Unlike).await;
        }
        Ok(changed)
    }

    /// Flips the actor's state and returns the new state.
    pub async fn toggle(
        &self,
        kind: InteractionKind,
        actor_id: i64,
        target_id: i64,
    ) -> Result<bool, EngineError> {
        if self.is_liked(kind, actor_id, target_id).await? {
            self.unlike(kind, actor_id, target_id).await?;
            Ok(false)
        } else {
            self.like(kind, actor_id, target_id).await?;
            Ok(true)
        }
    }

    pub async fn is_liked(
        &self,
        kind: InteractionKind,
        actor_id: i64,
        target_id: i64,
    ) -> Result<bool, EngineError> {
        match self.cache_is_liked(kind, actor_id, target_id).await {
            Ok(liked) => Ok(liked),
            Err(e) => {
                warn!("cache unavailable on check, using store: {e:#}");
                Ok(self
                    .with_db(move |db| db.is_fact(kind, actor_id, target_id))
                    .await?)
            }
        }
    }

    /// Batch membership check; answers come from a fully warmed
    /// membership set so a partially populated cache can never report
    /// a false negative.
    pub async fn batch_is_liked(
        &self,
        kind: InteractionKind,
        actor_id: i64,
        target_ids: &[i64],
    ) -> Result<Vec<bool>, EngineError> {
        if target_ids.is_empty() {
            return Ok(Vec::new());
        }
        match self.cache_batch_is_liked(kind, actor_id, target_ids).await {
            Ok(hits) => Ok(hits),
            Err(e) => {
                warn!("cache unavailable on batch check, using store: {e:#}");
                let ids = target_ids.to_vec();
                let existing = self
                    .with_db(move |db| db.select_existing(kind, actor_id, &ids))
                    .await?;
                let existing: HashSet<i64> = existing.into_iter().collect();
                Ok(target_ids.iter().map(|t| existing.contains(t)).collect())
            }
        }
    }

    /// Display counter: cached value when present, otherwise the
    /// store value seeded into the cache as an absolute number.
    pub async fn count(&self, kind: InteractionKind, target_id: i64) -> Result<i64, EngineError> {
        let key = kind.counter_key(target_id);
        match self.cache.get_int(&key).await {
            Ok(Some(value)) => return Ok(value),
            Ok(None) => {}
            Err(e) => {
                warn!("cache unavailable on count, using store: {e:#}");
                return Ok(self.with_db(move |db| db.counter(kind, target_id)).await?);
            }
        }
        let value = self.with_db(move |db| db.counter(kind, target_id)).await?;
        if let Err(e) = self.cache.set_int_nx(&key, value, self.ttl).await {
            warn!("counter write-back failed: {e:#}");
        }
        Ok(value)
    }

    /// Who interacted with this target, newest first.
    pub async fn list_actors(
        &self,
        kind: InteractionKind,
        target_id: i64,
        limit: u32,
        offset: u32,
    ) -> Result<Vec<i64>, EngineError> {
        Ok(self
            .with_db(move |db| db.list_fact_actors(kind, target_id, limit, offset))
            .await?)
    }

    /// What this actor interacted with, newest first.
    pub async fn list_targets(
        &self,
        kind: InteractionKind,
        actor_id: i64,
        limit: u32,
        offset: u32,
    ) -> Result<Vec<i64>, EngineError> {
        Ok(self
            .with_db(move |db| db.list_actor_targets(kind, actor_id, limit, offset))
            .await?)
    }

    // -- internals ----------------------------------------------------------

    async fn with_db<T, F>(&self, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(ContentDb) -> Result<T> + Send + 'static,
    {
        let db = self.db.clone();
        tokio::task::spawn_blocking(move || f(db)).await?
    }

    async fn require_target(
        &self,
        kind: InteractionKind,
        target_id: i64,
    ) -> Result<i64, EngineError> {
        let target_type = kind.target_type();
        let info = self
            .with_db(move |db| db.get_target(target_type, target_id))
            .await?;
        match info {
            Some(info) if info.interactable() => Ok(info.owner_id),
            _ => Err(EngineError::TargetUnavailable),
        }
    }

    /// Backfills the actor's membership set from the store and raises
    /// the warm flag. Once warm, set answers are authoritative for
    /// both hits and misses.
    async fn ensure_warm(&self, kind: InteractionKind, actor_id: i64) -> Result<()> {
        let warm_key = kind.warm_key(actor_id);
        if self.cache.flag_is_set(&warm_key).await? {
            return Ok(());
        }
        let targets = self
            .with_db(move |db| db.select_facts_for_actor(kind, actor_id))
            .await?;
        let member_key = kind.member_key(actor_id);
        if !targets.is_empty() {
            self.cache.set_add_many(&member_key, &targets).await?;
            self.cache.expire(&member_key, self.ttl).await?;
        }
        // Flag raised only after the backfill landed.
        self.cache.flag_set(&warm_key, self.ttl).await?;
        Ok(())
    }

    /// The cached counter must hold an absolute value before the
    /// first incr/decr touches it, otherwise a cold cache would count
    /// deltas from zero.
    async fn seed_counter(&self, kind: InteractionKind, target_id: i64) -> Result<()> {
        let key = kind.counter_key(target_id);
        if self.cache.get_int(&key).await?.is_some() {
            return Ok(());
        }
        let value = self.with_db(move |db| db.counter(kind, target_id)).await?;
        self.cache.set_int_nx(&key, value, self.ttl).await?;
        Ok(())
    }

    async fn cache_like(
        &self,
        kind: InteractionKind,
        actor_id: i64,
        target_id: i64,
    ) -> Result<bool> {
        self.ensure_warm(kind, actor_id).await?;
        self.seed_counter(kind, target_id).await?;
        let member_key = kind.member_key(actor_id);
        let newly = self.cache.set_add(&member_key, target_id).await?;
        self.cache.expire(&member_key, self.ttl).await?;
        if newly {
            let counter_key = kind.counter_key(target_id);
            self.cache.incr(&counter_key).await?;
            self.cache.expire(&counter_key, self.ttl).await?;
        }
        Ok(newly)
    }

    async fn cache_unlike(
        &self,
        kind: InteractionKind,
        actor_id: i64,
        target_id: i64,
    ) -> Result<bool> {
        self.ensure_warm(kind, actor_id).await?;
        self.seed_counter(kind, target_id).await?;
        let removed = self
            .cache
            .set_remove(&kind.member_key(actor_id), target_id)
            .await?;
        if removed {
            let counter_key = kind.counter_key(target_id);
            self.cache.decr_floor(&counter_key).await?;
            self.cache.expire(&counter_key, self.ttl).await?;
        }
        Ok(removed)
    }

    async fn cache_is_liked(
        &self,
        kind: InteractionKind,
        actor_id: i64,
        target_id: i64,
    ) -> Result<bool> {
        // A positive set hit is always trustworthy, warm or not.
        let member_key = kind.member_key(actor_id);
        if self.cache.set_contains(&member_key, target_id).await? {
            return Ok(true);
        }
        // A miss is only authoritative once the set is a complete
        // mirror of the store.
        if self.cache.flag_is_set(&kind.warm_key(actor_id)).await? {
            return Ok(false);
        }
        // Cold miss: store answer, with a hit written back.
        let liked = self
            .with_db(move |db| db.is_fact(kind, actor_id, target_id))
            .await?;
        if liked {
            self.cache.set_add(&member_key, target_id).await?;
            self.cache.expire(&member_key, self.ttl).await?;
        }
        Ok(liked)
    }

    async fn cache_batch_is_liked(
        &self,
        kind: InteractionKind,
        actor_id: i64,
        target_ids: &[i64],
    ) -> Result<Vec<bool>> {
        self.ensure_warm(kind, actor_id).await?;
        self.cache
            .set_contains_many(&kind.member_key(actor_id), target_ids)
            .await
    }

    /// The cache already reflects the interaction; a failed append is
    /// logged and left to reconciliation rather than surfaced.
    async fn publish(&self, kind: InteractionKind, actor_id: i64, target_id: i64, action: Action) {
        let body = EventBody::Interaction {
            actor_id,
            target_id,
            action,
            timestamp_ms: now_ms(),
        };
        if let Err(e) = self.log.publish(kind.queue(), &body).await {
            error!("event publish failed on {}: {e:#}", kind.queue());
        }
    }
}

fn notice_kind(kind: InteractionKind) -> &'static str {
    match kind {
        InteractionKind::PostLike => "like_post",
        InteractionKind::CommentLike => "like_comment",
        InteractionKind::PostFavorite => "favorite_post",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        cache::{KeyTtl, MemoryCache},
        consumer::{Consumer, ConsumerSettings},
        content_db::STATUS_PUBLISHED,
        notify::{BroadcastSink, NullSink},
    };

    struct Fixture {
        _dir: tempfile::TempDir,
        db: ContentDb,
        log: EventLog,
        cache: Arc<dyn InteractionCache>,
        engine: InteractionEngine,
        consumer: Consumer,
    }

    fn setup() -> Fixture {
        setup_with_sink(Arc::new(NullSink))
    }

    fn setup_with_sink(sink: Arc<dyn NotificationSink>) -> Fixture {
        let dir = tempfile::tempdir().expect("tempdir");
        let db = ContentDb::open(dir.path().join("content.db")).expect("content db");
        let log = EventLog::open(dir.path().join("events.db")).expect("event log");
        let cache: Arc<dyn InteractionCache> = Arc::new(MemoryCache::new());
        let engine = InteractionEngine::new(db.clone(), cache.clone(), log.clone(), sink);
        let consumer = Consumer::new(db.clone(), log.clone(), ConsumerSettings::default());
        Fixture {
            _dir: dir,
            db,
            log,
            cache,
            engine,
            consumer,
        }
    }

    async fn drain(fx: &Fixture) {
        for kind in InteractionKind::ALL {
            while fx.consumer.run_once(kind).await.unwrap() > 0 {}
        }
    }

    #[tokio::test]
    async fn like_is_idempotent() {
        let fx = setup();
        let post = fx.db.create_post(1, STATUS_PUBLISHED).unwrap();
        let kind = InteractionKind::PostLike;

        assert!(fx.engine.like(kind, 7, post).await.unwrap());
        assert!(!fx.engine.like(kind, 7, post).await.unwrap());
        assert!(fx.engine.is_liked(kind, 7, post).await.unwrap());
        assert_eq!(fx.engine.count(kind, post).await.unwrap(), 1);

        drain(&fx).await;
        assert_eq!(fx.db.counter(kind, post).unwrap(), 1);
        assert_eq!(fx.db.count_facts(kind, post).unwrap(), 1);
        // Exactly one event, not one per request.
        assert_eq!(fx.log.stats().await.unwrap().applied, 1);
    }

    #[tokio::test]
    async fn unlike_is_symmetric() {
        let fx = setup();
        let post = fx.db.create_post(1, STATUS_PUBLISHED).unwrap();
        let kind = InteractionKind::PostFavorite;

        assert!(fx.engine.like(kind, 7, post).await.unwrap());
        assert!(fx.engine.unlike(kind, 7, post).await.unwrap());
        assert!(!fx.engine.unlike(kind, 7, post).await.unwrap());
        assert!(!fx.engine.is_liked(kind, 7, post).await.unwrap());
        assert_eq!(fx.engine.count(kind, post).await.unwrap(), 0);

        drain(&fx).await;
        assert_eq!(fx.db.counter(kind, post).unwrap(), 0);
        assert_eq!(fx.db.count_facts(kind, post).unwrap(), 0);
    }

    #[tokio::test]
    async fn toggle_flips_state() {
        let fx = setup();
        let post = fx.db.create_post(1, STATUS_PUBLISHED).unwrap();
        let kind = InteractionKind::PostLike;

        assert!(fx.engine.toggle(kind, 7, post).await.unwrap());
        assert!(!fx.engine.toggle(kind, 7, post).await.unwrap());
        assert_eq!(fx.engine.count(kind, post).await.unwrap(), 0);
        drain(&fx).await;
        assert_eq!(fx.db.count_facts(kind, post).unwrap(), 0);
    }

    #[tokio::test]
    async fn unavailable_targets_are_rejected() {
        let fx = setup();
        let kind = InteractionKind::PostLike;
        assert!(matches!(
            fx.engine.like(kind, 7, 999).await,
            Err(EngineError::TargetUnavailable)
        ));

        let draft = fx.db.create_post(1, 0).unwrap();
        assert!(matches!(
            fx.engine.like(kind, 7, draft).await,
            Err(EngineError::TargetUnavailable)
        ));
        assert!(matches!(
            fx.engine.unlike(kind, 7, draft).await,
            Err(EngineError::TargetUnavailable)
        ));

        // Comment likes only see comments.
        assert!(matches!(
            fx.engine.like(InteractionKind::CommentLike, 7, draft).await,
            Err(EngineError::TargetUnavailable)
        ));
    }

    #[tokio::test]
    async fn batch_check_backfills_cold_cache() {
        let fx = setup();
        let kind = InteractionKind::PostLike;
        let a = fx.db.create_post(1, STATUS_PUBLISHED).unwrap();
        let b = fx.db.create_post(1, STATUS_PUBLISHED).unwrap();
        let c = fx.db.create_post(1, STATUS_PUBLISHED).unwrap();
        // Facts exist only in the store; the cache has never seen
        // this actor.
        fx.db.apply_like(kind, 7, a).unwrap();
        fx.db.apply_like(kind, 7, c).unwrap();

        let hits = fx.engine.batch_is_liked(kind, 7, &[a, b, c]).await.unwrap();
        assert_eq!(hits, vec![true, false, true]);
        // The set is now warm, so single checks answer from cache too.
        assert!(fx.engine.is_liked(kind, 7, a).await.unwrap());
        assert!(!fx.engine.is_liked(kind, 7, b).await.unwrap());

        fx.engine.like(kind, 7, b).await.unwrap();
        let hits = fx.engine.batch_is_liked(kind, 7, &[a, b, c]).await.unwrap();
        assert_eq!(hits, vec![true, true, true]);
    }

    #[tokio::test]
    async fn positive_set_hits_are_trusted_without_warm_flag() {
        let fx = setup();
        let kind = InteractionKind::PostLike;
        let post = fx.db.create_post(1, STATUS_PUBLISHED).unwrap();

        // A membership the cache knows about but the store has not yet
        // applied (the event is still in flight). No warm flag either.
        fx.cache.set_add(&kind.member_key(7), post).await.unwrap();
        assert!(fx.engine.is_liked(kind, 7, post).await.unwrap());

        // A miss without the warm flag still falls through to the store.
        fx.db.apply_like(kind, 8, post).unwrap();
        assert!(fx.engine.is_liked(kind, 8, post).await.unwrap());
        assert!(!fx.engine.is_liked(kind, 9, post).await.unwrap());
    }

    #[tokio::test]
    async fn counter_ttl_is_refreshed_on_every_hit() {
        let fx = setup();
        let kind = InteractionKind::PostLike;
        let post = fx.db.create_post(1, STATUS_PUBLISHED).unwrap();
        let counter_key = kind.counter_key(post);

        // Pre-create the counter with no expiry, as a stale key would
        // look after losing its TTL.
        fx.cache.incr(&counter_key).await.unwrap();
        assert!(matches!(
            fx.cache.ttl(&counter_key).await.unwrap(),
            KeyTtl::None
        ));

        fx.engine.like(kind, 7, post).await.unwrap();
        assert!(matches!(
            fx.cache.ttl(&counter_key).await.unwrap(),
            KeyTtl::Secs(_)
        ));

        // Unlike re-arms it too.
        fx.cache.expire(&counter_key, DEFAULT_TTL * 4).await.unwrap();
        fx.engine.unlike(kind, 7, post).await.unwrap();
        match fx.cache.ttl(&counter_key).await.unwrap() {
            KeyTtl::Secs(secs) => assert!(secs <= DEFAULT_TTL.as_secs() as i64),
            other => panic!("expected a finite ttl, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn counter_is_seeded_absolute_not_delta() {
        let fx = setup();
        let kind = InteractionKind::PostLike;
        let post = fx.db.create_post(1, STATUS_PUBLISHED).unwrap();
        // Five pre-existing likes that never went through this cache.
        for actor in 1..=5 {
            fx.db.apply_like(kind, actor, post).unwrap();
        }

        assert!(fx.engine.like(kind, 6, post).await.unwrap());
        assert_eq!(fx.engine.count(kind, post).await.unwrap(), 6);

        drain(&fx).await;
        assert_eq!(fx.db.counter(kind, post).unwrap(), 6);
    }

    #[tokio::test]
    async fn owner_likes_do_not_notify() {
        let sink = Arc::new(BroadcastSink::new(16));
        let fx = setup_with_sink(sink.clone());
        let mut rx = sink.subscribe();
        let kind = InteractionKind::PostLike;
        let post = fx.db.create_post(9, STATUS_PUBLISHED).unwrap();

        fx.engine.like(kind, 9, post).await.unwrap();
        fx.engine.like(kind, 7, post).await.unwrap();

        let notice = rx.recv().await.unwrap();
        assert_eq!(notice.actor_id, 7);
        assert_eq!(notice.owner_id, 9);
        assert_eq!(notice.kind, "like_post");
        // Nothing queued for the self-like.
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn concurrent_duplicate_likes_count_once() {
        let fx = setup();
        let kind = InteractionKind::PostLike;
        let post = fx.db.create_post(1, STATUS_PUBLISHED).unwrap();

        let mut handles = Vec::new();
        for _ in 0..20 {
            let engine = fx.engine.clone();
            handles.push(tokio::spawn(
                async move { engine.like(kind, 7, post).await },
            ));
        }
        let mut changed = 0;
        for h in handles {
            if h.await.unwrap().unwrap() {
                changed += 1;
            }
        }
        assert_eq!(changed, 1);
        assert_eq!(fx.engine.count(kind, post).await.unwrap(), 1);

        drain(&fx).await;
        assert_eq!(fx.db.counter(kind, post).unwrap(), 1);
        assert_eq!(fx.log.stats().await.unwrap().applied, 1);
    }

    #[tokio::test]
    async fn concurrent_distinct_actors_all_count() {
        let fx = setup();
        let kind = InteractionKind::PostLike;
        let post = fx.db.create_post(1, STATUS_PUBLISHED).unwrap();

        let mut handles = Vec::new();
        for actor in 1..=50 {
            let engine = fx.engine.clone();
            handles.push(tokio::spawn(async move {
                engine.like(kind, actor, post).await
            }));
        }
        for h in handles {
            assert!(h.await.unwrap().unwrap());
        }
        assert_eq!(fx.engine.count(kind, post).await.unwrap(), 50);

        drain(&fx).await;
        assert_eq!(fx.db.counter(kind, post).unwrap(), 50);
        assert_eq!(fx.db.count_facts(kind, post).unwrap(), 50);
    }

    #[tokio::test]
    async fn end_to_end_like_flow() {
        let fx = setup();
        let kind = InteractionKind::PostLike;
        let post = fx.db.create_post(1, 0).unwrap();

        // Unpublished post rejects interactions.
        assert!(matches!(
            fx.engine.like(kind, 7, post).await,
            Err(EngineError::TargetUnavailable)
        ));

        fx.db
            .set_target_status(crate::TargetType::Post, post, STATUS_PUBLISHED)
            .unwrap();
        assert!(fx.engine.like(kind, 7, post).await.unwrap());
        assert_eq!(fx.engine.count(kind, post).await.unwrap(), 1);
        assert!(!fx.engine.like(kind, 7, post).await.unwrap());
        assert_eq!(fx.engine.count(kind, post).await.unwrap(), 1);
        assert!(fx.engine.like(kind, 8, post).await.unwrap());
        assert_eq!(fx.engine.count(kind, post).await.unwrap(), 2);
        assert!(fx.engine.unlike(kind, 7, post).await.unwrap());
        assert_eq!(fx.engine.count(kind, post).await.unwrap(), 1);

        drain(&fx).await;
        assert_eq!(fx.db.counter(kind, post).unwrap(), 1);
        assert_eq!(fx.db.count_facts(kind, post).unwrap(), 1);
        assert!(fx.db.is_fact(kind, 8, post).unwrap());
        assert!(!fx.db.is_fact(kind, 7, post).unwrap());
    }

    #[tokio::test]
    async fn listings_come_from_the_store() {
        let fx = setup();
        let kind = InteractionKind::PostLike;
        let post = fx.db.create_post(1, STATUS_PUBLISHED).unwrap();
        for actor in 1..=3 {
            fx.engine.like(kind, actor, post).await.unwrap();
        }
        drain(&fx).await;

        let actors = fx.engine.list_actors(kind, post, 10, 0).await.unwrap();
        assert_eq!(actors.len(), 3);
        let targets = fx.engine.list_targets(kind, 2, 10, 0).await.unwrap();
        assert_eq!(targets, vec![post]);
    }
}
