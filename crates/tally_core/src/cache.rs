/*
 * SPDX-FileCopyrightText: 2026 Tally Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

//! Fast-path cache: per-actor membership sets, per-target counters
//! and warm flags. All mutation goes through the store's atomic
//! primitives; the engine never does read-modify-write here.

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio::sync::Mutex;

/// TTL applied to membership sets, counters and warm flags.
pub const DEFAULT_TTL: Duration = Duration::from_secs(7 * 24 * 3600);

/// Remaining TTL, redis semantics: `Missing` for absent keys,
/// `None` for keys without an expiry, `Secs` otherwise.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyTtl {
    Missing,
    None,
    Secs(i64),
}

#[async_trait]
pub trait InteractionCache: Send + Sync {
    /// Atomic set-add; returns whether the member was newly added.
    /// This boolean is the engine's arbiter for "was this a new fact".
    async fn set_add(&self, key: &str, member: i64) -> Result<bool>;
    async fn set_add_many(&self, key: &str, members: &[i64]) -> Result<()>;
    /// Atomic set-remove; returns whether the member was present.
    async fn set_remove(&self, key: &str, member: i64) -> Result<bool>;
    async fn set_contains(&self, key: &str, member: i64) -> Result<bool>;
    async fn set_contains_many(&self, key: &str, members: &[i64]) -> Result<Vec<bool>>;

    async fn incr(&self, key: &str) -> Result<i64>;
    /// Decrement clamped at zero; the cache layer never goes negative.
    async fn decr_floor(&self, key: &str) -> Result<i64>;
    async fn get_int(&self, key: &str) -> Result<Option<i64>>;
    /// Seed a counter only if absent, so cached counters are absolute
    /// values rather than deltas drifting from zero.
    async fn set_int_nx(&self, key: &str, value: i64, ttl: Duration) -> Result<bool>;

    async fn flag_set(&self, key: &str, ttl: Duration) -> Result<()>;
    async fn flag_is_set(&self, key: &str) -> Result<bool>;

    async fn expire(&self, key: &str, ttl: Duration) -> Result<()>;
    async fn ttl(&self, key: &str) -> Result<KeyTtl>;
    async fn delete(&self, key: &str) -> Result<()>;
    /// Cursor-based key scan (never a blocking full listing).
    async fn scan_keys(&self, pattern: &str) -> Result<Vec<String>>;
}

// ---------------------------------------------------------------------------
// Redis implementation
// ---------------------------------------------------------------------------

pub struct RedisCache {
    conns: Vec<Mutex<ConnectionManager>>,
    index: AtomicUsize,
    op_timeout: Duration,
}

impl RedisCache {
    pub async fn connect(url: &str, pool_size: usize, op_timeout: Duration) -> Result<Self> {
        let client = redis::Client::open(url).context("redis client")?;
        let mut conns = Vec::with_capacity(pool_size.max(1));
        for _ in 0..pool_size.max(1) {
            let conn = ConnectionManager::new(client.clone())
                .await
                .context("redis connect")?;
            conns.push(Mutex::new(conn));
        }
        Ok(Self {
            conns,
            index: AtomicUsize::new(0),
            op_timeout,
        })
    }

    fn handle(&self) -> &Mutex<ConnectionManager> {
        let idx = self.index.fetch_add(1, Ordering::Relaxed) % self.conns.len();
        &self.conns[idx]
    }

    /// Cache unavailability must not block the request path; every
    /// call is capped by the configured per-op timeout.
    async fn timed<T, F>(&self, fut: F) -> Result<T>
    where
        F: Future<Output = redis::RedisResult<T>>,
    {
        match tokio::time::timeout(self.op_timeout, fut).await {
            Ok(res) => res.map_err(|e| anyhow!("redis: {e}")),
            Err(_) => Err(anyhow!("redis op timed out")),
        }
    }
}

#[async_trait]
impl InteractionCache for RedisCache {
    async fn set_add(&self, key: &str, member: i64) -> Result<bool> {
        let mut conn = self.handle().lock().await;
        let added: i64 = self.timed(conn.sadd(key, member)).await?;
        Ok(added > 0)
    }

    async fn set_add_many(&self, key: &str, members: &[i64]) -> Result<()> {
        if members.is_empty() {
            return Ok(());
        }
        let mut conn = self.handle().lock().await;
        let _: i64 = self.timed(conn.sadd(key, members)).await?;
        Ok(())
    }

    async fn set_remove(&self, key: &str, member: i64) -> Result<bool> {
        let mut conn = self.handle().lock().await;
        let removed: i64 = self.timed(conn.srem(key, member)).await?;
        Ok(removed > 0)
    }

    async fn set_contains(&self, key: &str, member: i64) -> Result<bool> {
        let mut conn = self.handle().lock().await;
        let found: bool = self.timed(conn.sismember(key, member)).await?;
        Ok(found)
    }

    async fn set_contains_many(&self, key: &str, members: &[i64]) -> Result<Vec<bool>> {
        if members.is_empty() {
            return Ok(Vec::new());
        }
        let mut cmd = redis::cmd("SMISMEMBER");
        cmd.arg(key);
        for m in members {
            cmd.arg(*m);
        }
        let mut conn = self.handle().lock().await;
        let found: Vec<i64> = self.timed(cmd.query_async(&mut *conn)).await?;
        Ok(found.into_iter().map(|v| v > 0).collect())
    }

    async fn incr(&self, key: &str) -> Result<i64> {
        let mut conn = self.handle().lock().await;
        let value: i64 = self.timed(conn.incr(key, 1)).await?;
        Ok(value)
    }

    async fn decr_floor(&self, key: &str) -> Result<i64> {
        let script = redis::Script::new(
            r#"
            local v = redis.call("DECR", KEYS[1])
            if v < 0 then
              redis.call("INCR", KEYS[1])
              return 0
            end
            return v
            "#,
        );
        let mut conn = self.handle().lock().await;
        let value: i64 = self
            .timed(script.key(key).invoke_async(&mut *conn))
            .await?;
        Ok(value)
    }

    async fn get_int(&self, key: &str) -> Result<Option<i64>> {
        let mut conn = self.handle().lock().await;
        let value: Option<i64> = self.timed(conn.get(key)).await?;
        Ok(value)
    }

    async fn set_int_nx(&self, key: &str, value: i64, ttl: Duration) -> Result<bool> {
        let mut cmd = redis::cmd("SET");
        cmd.arg(key)
            .arg(value)
            .arg("NX")
            .arg("EX")
            .arg(ttl.as_secs().max(1));
        let mut conn = self.handle().lock().await;
        let reply: Option<String> = self.timed(cmd.query_async(&mut *conn)).await?;
        Ok(reply.is_some())
    }

    async fn flag_set(&self, key: &str, ttl: Duration) -> Result<()> {
        let mut conn = self.handle().lock().await;
        let _: () = self
            .timed(conn.set_ex(key, 1, ttl.as_secs().max(1)))
            .await?;
        Ok(())
    }

    async fn flag_is_set(&self, key: &str) -> Result<bool> {
        let mut conn = self.handle().lock().await;
        let exists: bool = self.timed(conn.exists(key)).await?;
        Ok(exists)
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<()> {
        let mut conn = self.handle().lock().await;
        let _: i64 = self
            .timed(conn.expire(key, ttl.as_secs().max(1) as i64))
            .await?;
        Ok(())
    }

    async fn ttl(&self, key: &str) -> Result<KeyTtl> {
        let mut conn = self.handle().lock().await;
        let ttl: i64 = self.timed(conn.ttl(key)).await?;
        Ok(match ttl {
            -2 => KeyTtl::Missing,
            -1 => KeyTtl::None,
            secs => KeyTtl::Secs(secs),
        })
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let mut conn = self.handle().lock().await;
        let _: i64 = self.timed(conn.del(key)).await?;
        Ok(())
    }

    async fn scan_keys(&self, pattern: &str) -> Result<Vec<String>> {
        let mut conn = self.handle().lock().await;
        let mut cursor: u64 = 0;
        let mut out = Vec::new();
        loop {
            let mut cmd = redis::cmd("SCAN");
            cmd.arg(cursor).arg("MATCH").arg(pattern).arg("COUNT").arg(100);
            let (next, keys): (u64, Vec<String>) =
                self.timed(cmd.query_async(&mut *conn)).await?;
            out.extend(keys);
            if next == 0 {
                break;
            }
            cursor = next;
        }
        Ok(out)
    }
}

// ---------------------------------------------------------------------------
// In-memory implementation
// ---------------------------------------------------------------------------

/// TTL-stamped maps behind one mutex. Used by tests and by cacheless
/// deployments; every primitive is atomic under the lock, which is
/// never held across an await point.
#[derive(Default)]
pub struct MemoryCache {
    inner: Mutex<MemoryState>,
}

#[derive(Default)]
struct MemoryState {
    sets: HashMap<String, Entry<HashSet<i64>>>,
    ints: HashMap<String, Entry<i64>>,
    flags: HashMap<String, Entry<()>>,
}

struct Entry<T> {
    expires_at_ms: i64,
    value: T,
}

impl<T> Entry<T> {
    fn live(value: T) -> Self {
        Self {
            expires_at_ms: i64::MAX,
            value,
        }
    }

    fn expired(&self, now: i64) -> bool {
        self.expires_at_ms <= now
    }
}

impl MemoryCache {
    pub fn new() -> Self {
        Self::default()
    }
}

impl MemoryState {
    fn drop_expired(&mut self, now: i64) {
        self.sets.retain(|_, e| !e.expired(now));
        self.ints.retain(|_, e| !e.expired(now));
        self.flags.retain(|_, e| !e.expired(now));
    }
}

#[async_trait]
impl InteractionCache for MemoryCache {
    async fn set_add(&self, key: &str, member: i64) -> Result<bool> {
        let now = now_ms();
        let mut state = self.inner.lock().await;
        state.drop_expired(now);
        let entry = state
            .sets
            .entry(key.to_string())
            .or_insert_with(|| Entry::live(HashSet::new()));
        Ok(entry.value.insert(member))
    }

    async fn set_add_many(&self, key: &str, members: &[i64]) -> Result<()> {
        if members.is_empty() {
            return Ok(());
        }
        let now = now_ms();
        let mut state = self.inner.lock().await;
        state.drop_expired(now);
        let entry = state
            .sets
            .entry(key.to_string())
            .or_insert_with(|| Entry::live(HashSet::new()));
        entry.value.extend(members.iter().copied());
        Ok(())
    }

    async fn set_remove(&self, key: &str, member: i64) -> Result<bool> {
        let now = now_ms();
        let mut state = self.inner.lock().await;
        state.drop_expired(now);
        Ok(state
            .sets
            .get_mut(key)
            .map(|e| e.value.remove(&member))
            .unwrap_or(false))
    }

    async fn set_contains(&self, key: &str, member: i64) -> Result<bool> {
        let now = now_ms();
        let mut state = self.inner.lock().await;
        state.drop_expired(now);
        Ok(state
            .sets
            .get(key)
            .map(|e| e.value.contains(&member))
            .unwrap_or(false))
    }

    async fn set_contains_many(&self, key: &str, members: &[i64]) -> Result<Vec<bool>> {
        let now = now_ms();
        let mut state = self.inner.lock().await;
        state.drop_expired(now);
        let set = state.sets.get(key);
        Ok(members
            .iter()
            .map(|m| set.map(|e| e.value.contains(m)).unwrap_or(false))
            .collect())
    }

    async fn incr(&self, key: &str) -> Result<i64> {
        let now = now_ms();
        let mut state = self.inner.lock().await;
        state.drop_expired(now);
        let entry = state
            .ints
            .entry(key.to_string())
            .or_insert_with(|| Entry::live(0));
        entry.value += 1;
        Ok(entry.value)
    }

    async fn decr_floor(&self, key: &str) -> Result<i64> {
        let now = now_ms();
        let mut state = self.inner.lock().await;
        state.drop_expired(now);
        let entry = state
            .ints
            .entry(key.to_string())
            .or_insert_with(|| Entry::live(0));
        entry.value = (entry.value - 1).max(0);
        Ok(entry.value)
    }

    async fn get_int(&self, key: &str) -> Result<Option<i64>> {
        let now = now_ms();
        let mut state = self.inner.lock().await;
        state.drop_expired(now);
        Ok(state.ints.get(key).map(|e| e.value))
    }

    async fn set_int_nx(&self, key: &str, value: i64, ttl: Duration) -> Result<bool> {
        let now = now_ms();
        let mut state = self.inner.lock().await;
        state.drop_expired(now);
        if state.ints.contains_key(key) {
            return Ok(false);
        }
        state.ints.insert(
            key.to_string(),
            Entry {
                expires_at_ms: now.saturating_add(ttl.as_millis() as i64),
                value,
            },
        );
        Ok(true)
    }

    async fn flag_set(&self, key: &str, ttl: Duration) -> Result<()> {
        let now = now_ms();
        let mut state = self.inner.lock().await;
        state.drop_expired(now);
        state.flags.insert(
            key.to_string(),
            Entry {
                expires_at_ms: now.saturating_add(ttl.as_millis() as i64),
                value: (),
            },
        );
        Ok(())
    }

    async fn flag_is_set(&self, key: &str) -> Result<bool> {
        let now = now_ms();
        let mut state = self.inner.lock().await;
        state.drop_expired(now);
        Ok(state.flags.contains_key(key))
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<()> {
        let now = now_ms();
        let expires = now.saturating_add(ttl.as_millis() as i64);
        let mut state = self.inner.lock().await;
        state.drop_expired(now);
        if let Some(e) = state.sets.get_mut(key) {
            e.expires_at_ms = expires;
        }
        if let Some(e) = state.ints.get_mut(key) {
            e.expires_at_ms = expires;
        }
        if let Some(e) = state.flags.get_mut(key) {
            e.expires_at_ms = expires;
        }
        Ok(())
    }

    async fn ttl(&self, key: &str) -> Result<KeyTtl> {
        let now = now_ms();
        let mut state = self.inner.lock().await;
        state.drop_expired(now);
        let expires = state
            .sets
            .get(key)
            .map(|e| e.expires_at_ms)
            .or_else(|| state.ints.get(key).map(|e| e.expires_at_ms))
            .or_else(|| state.flags.get(key).map(|e| e.expires_at_ms));
        Ok(match expires {
            Some(i64::MAX) => KeyTtl::None,
            Some(at) => KeyTtl::Secs((at.saturating_sub(now) / 1000).max(0)),
            None => KeyTtl::Missing,
        })
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let mut state = self.inner.lock().await;
        state.sets.remove(key);
        state.ints.remove(key);
        state.flags.remove(key);
        Ok(())
    }

    async fn scan_keys(&self, pattern: &str) -> Result<Vec<String>> {
        let now = now_ms();
        let mut state = self.inner.lock().await;
        state.drop_expired(now);
        let mut out: Vec<String> = Vec::new();
        for key in state
            .sets
            .keys()
            .chain(state.ints.keys())
            .chain(state.flags.keys())
        {
            if glob_match(pattern, key) {
                out.push(key.clone());
            }
        }
        Ok(out)
    }
}

/// Minimal `*` glob, enough for the counter/member key patterns.
fn glob_match(pattern: &str, key: &str) -> bool {
    fn inner(p: &[u8], k: &[u8]) -> bool {
        match p.first() {
            None => k.is_empty(),
            Some(b'*') => {
                (0..=k.len()).any(|i| inner(&p[1..], &k[i..]))
            }
            Some(c) => k.first() == Some(c) && inner(&p[1..], &k[1..]),
        }
    }
    inner(pattern.as_bytes(), key.as_bytes())
}

fn now_ms() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as i64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn set_add_reports_newness() {
        let cache = MemoryCache::new();
        assert!(cache.set_add("user:7:liked:posts", 42).await.unwrap());
        assert!(!cache.set_add("user:7:liked:posts", 42).await.unwrap());
        assert!(cache.set_contains("user:7:liked:posts", 42).await.unwrap());
        assert!(cache.set_remove("user:7:liked:posts", 42).await.unwrap());
        assert!(!cache.set_remove("user:7:liked:posts", 42).await.unwrap());
    }

    #[tokio::test]
    async fn decr_clamps_at_zero() {
        let cache = MemoryCache::new();
        assert_eq!(cache.incr("post:1:like_count").await.unwrap(), 1);
        assert_eq!(cache.decr_floor("post:1:like_count").await.unwrap(), 0);
        assert_eq!(cache.decr_floor("post:1:like_count").await.unwrap(), 0);
        assert_eq!(cache.decr_floor("post:9:like_count").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn nx_seed_does_not_overwrite() {
        let cache = MemoryCache::new();
        assert!(cache
            .set_int_nx("post:1:like_count", 10, DEFAULT_TTL)
            .await
            .unwrap());
        assert!(!cache
            .set_int_nx("post:1:like_count", 99, DEFAULT_TTL)
            .await
            .unwrap());
        assert_eq!(cache.get_int("post:1:like_count").await.unwrap(), Some(10));
        assert_eq!(cache.incr("post:1:like_count").await.unwrap(), 11);
    }

    #[tokio::test]
    async fn entries_expire() {
        let cache = MemoryCache::new();
        cache.set_add("user:7:liked:posts", 1).await.unwrap();
        cache
            .expire("user:7:liked:posts", Duration::from_millis(20))
            .await
            .unwrap();
        cache
            .flag_set("like:cache:init:7:POST", Duration::from_millis(20))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!cache.set_contains("user:7:liked:posts", 1).await.unwrap());
        assert!(!cache.flag_is_set("like:cache:init:7:POST").await.unwrap());
        assert_eq!(cache.ttl("user:7:liked:posts").await.unwrap(), KeyTtl::Missing);
    }

    #[tokio::test]
    async fn scan_matches_counter_patterns() {
        let cache = MemoryCache::new();
        cache.incr("post:1:like_count").await.unwrap();
        cache.incr("post:2:favorite_count").await.unwrap();
        cache.incr("comment:3:like_count").await.unwrap();
        let mut keys = cache.scan_keys("post:*:like_count").await.unwrap();
        keys.sort();
        assert_eq!(keys, vec!["post:1:like_count"]);
        assert_eq!(cache.scan_keys("user:*:liked:*").await.unwrap().len(), 0);
    }

    #[test]
    fn glob_basics() {
        assert!(glob_match("post:*:like_count", "post:123:like_count"));
        assert!(!glob_match("post:*:like_count", "post:123:favorite_count"));
        assert!(glob_match("user:*:liked:*", "user:7:liked:posts"));
        assert!(!glob_match("user:*:liked:*", "post:7:like_count"));
    }
}
