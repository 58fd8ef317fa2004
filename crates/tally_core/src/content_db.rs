/*
 * SPDX-FileCopyrightText: 2026 Tally Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

//! System of record for interaction facts and the denormalized
//! counters on the owning content rows. Blocking rusqlite access;
//! async callers go through `spawn_blocking`.

use anyhow::{Context, Result};
use rusqlite::{params, Connection, OptionalExtension};
use std::path::{Path, PathBuf};

use crate::{InteractionKind, TargetType};

pub const STATUS_PUBLISHED: i64 = 1;

#[derive(Clone)]
pub struct ContentDb {
    path: PathBuf,
}

#[derive(Debug, Clone, Copy)]
pub struct TargetInfo {
    pub owner_id: i64,
    pub status: i64,
}

impl TargetInfo {
    /// Published/approved targets accept interactions; drafts and
    /// deleted rows do not.
    pub fn interactable(&self) -> bool {
        self.status == STATUS_PUBLISHED
    }
}

impl InteractionKind {
    fn fact_table(self) -> &'static str {
        match self {
            InteractionKind::PostLike => "post_likes",
            InteractionKind::CommentLike => "comment_likes",
            InteractionKind::PostFavorite => "post_favorites",
        }
    }

    fn target_column(self) -> &'static str {
        match self.target_type() {
            TargetType::Post => "post_id",
            TargetType::Comment => "comment_id",
        }
    }

    fn counter_table(self) -> &'static str {
        match self.target_type() {
            TargetType::Post => "posts",
            TargetType::Comment => "comments",
        }
    }

    fn counter_column(self) -> &'static str {
        match self {
            InteractionKind::PostLike | InteractionKind::CommentLike => "like_count",
            InteractionKind::PostFavorite => "favorite_count",
        }
    }
}

impl ContentDb {
    fn conn(&self) -> Result<Connection> {
        let conn = Connection::open(&self.path)?;
        conn.busy_timeout(std::time::Duration::from_secs(5))?;
        Ok(conn)
    }

    pub fn open(db_path: impl AsRef<Path>) -> Result<Self> {
        let path = db_path.as_ref().to_path_buf();
        let conn =
            Connection::open(&path).with_context(|| format!("open db: {}", path.display()))?;
        conn.execute_batch(
            r#"
            PRAGMA journal_mode=WAL;
            CREATE TABLE IF NOT EXISTS posts (
              id INTEGER PRIMARY KEY AUTOINCREMENT,
              author_id INTEGER NOT NULL,
              status INTEGER NOT NULL DEFAULT 0,
              like_count INTEGER NOT NULL DEFAULT 0,
              favorite_count INTEGER NOT NULL DEFAULT 0,
              created_at_ms INTEGER NOT NULL
            );

            CREATE TABLE IF NOT EXISTS comments (
              id INTEGER PRIMARY KEY AUTOINCREMENT,
              post_id INTEGER NOT NULL,
              author_id INTEGER NOT NULL,
              status INTEGER NOT NULL DEFAULT 1,
              like_count INTEGER NOT NULL DEFAULT 0,
              created_at_ms INTEGER NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_comments_post ON comments(post_id);

            CREATE TABLE IF NOT EXISTS post_likes (
              user_id INTEGER NOT NULL,
              post_id INTEGER NOT NULL,
              created_at_ms INTEGER NOT NULL,
              PRIMARY KEY(user_id, post_id)
            );
            CREATE INDEX IF NOT EXISTS idx_post_likes_post ON post_likes(post_id, created_at_ms DESC);

            CREATE TABLE IF NOT EXISTS comment_likes (
              user_id INTEGER NOT NULL,
              comment_id INTEGER NOT NULL,
              created_at_ms INTEGER NOT NULL,
              PRIMARY KEY(user_id, comment_id)
            );
            CREATE INDEX IF NOT EXISTS idx_comment_likes_comment ON comment_likes(comment_id, created_at_ms DESC);

            CREATE TABLE IF NOT EXISTS post_favorites (
              user_id INTEGER NOT NULL,
              post_id INTEGER NOT NULL,
              created_at_ms INTEGER NOT NULL,
              PRIMARY KEY(user_id, post_id)
            );
            CREATE INDEX IF NOT EXISTS idx_post_favorites_post ON post_favorites(post_id, created_at_ms DESC);
            "#,
        )?;
        Ok(Self { path })
    }

    pub fn health_check(&self) -> Result<()> {
        let conn = self.conn()?;
        conn.query_row("SELECT 1", [], |_| Ok(()))?;
        Ok(())
    }

    pub fn create_post(&self, author_id: i64, status: i64) -> Result<i64> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO posts (author_id, status, created_at_ms) VALUES (?1, ?2, ?3)",
            params![author_id, status, now_ms()],
        )?;
        Ok(conn.last_insert_rowid())
    }

    pub fn create_comment(&self, post_id: i64, author_id: i64, status: i64) -> Result<i64> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO comments (post_id, author_id, status, created_at_ms) VALUES (?1, ?2, ?3, ?4)",
            params![post_id, author_id, status, now_ms()],
        )?;
        Ok(conn.last_insert_rowid())
    }

    pub fn set_target_status(&self, target_type: TargetType, id: i64, status: i64) -> Result<()> {
        let conn = self.conn()?;
        let sql = match target_type {
            TargetType::Post => "UPDATE posts SET status = ?2 WHERE id = ?1",
            TargetType::Comment => "UPDATE comments SET status = ?2 WHERE id = ?1",
        };
        conn.execute(sql, params![id, status])?;
        Ok(())
    }

    pub fn get_target(&self, target_type: TargetType, id: i64) -> Result<Option<TargetInfo>> {
        let conn = self.conn()?;
        let sql = match target_type {
            TargetType::Post => "SELECT author_id, status FROM posts WHERE id = ?1",
            TargetType::Comment => "SELECT author_id, status FROM comments WHERE id = ?1",
        };
        let row = conn
            .query_row(sql, params![id], |r| {
                Ok(TargetInfo {
                    owner_id: r.get(0)?,
                    status: r.get(1)?,
                })
            })
            .optional()?;
        Ok(row)
    }

    /// Atomic insert gated by the (user, target) primary key.
    /// Returns whether a new fact was recorded.
    pub fn insert_fact_if_absent(
        &self,
        kind: InteractionKind,
        actor_id: i64,
        target_id: i64,
    ) -> Result<bool> {
        let conn = self.conn()?;
        let changed = conn.execute(
            &format!(
                "INSERT OR IGNORE INTO {} (user_id, {}, created_at_ms) VALUES (?1, ?2, ?3)",
                kind.fact_table(),
                kind.target_column()
            ),
            params![actor_id, target_id, now_ms()],
        )?;
        Ok(changed > 0)
    }

    /// Returns whether a fact existed and was deleted.
    pub fn delete_fact_if_present(
        &self,
        kind: InteractionKind,
        actor_id: i64,
        target_id: i64,
    ) -> Result<bool> {
        let conn = self.conn()?;
        let changed = conn.execute(
            &format!(
                "DELETE FROM {} WHERE user_id = ?1 AND {} = ?2",
                kind.fact_table(),
                kind.target_column()
            ),
            params![actor_id, target_id],
        )?;
        Ok(changed > 0)
    }

    /// Consumer apply path: insert the fact and, only if it was new,
    /// bump the denormalized counter — one transaction, so redelivery
    /// of an already-applied event is a clean no-op.
    pub fn apply_like(
        &self,
        kind: InteractionKind,
        actor_id: i64,
        target_id: i64,
    ) -> Result<bool> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        let inserted = tx.execute(
            &format!(
                "INSERT OR IGNORE INTO {} (user_id, {}, created_at_ms) VALUES (?1, ?2, ?3)",
                kind.fact_table(),
                kind.target_column()
            ),
            params![actor_id, target_id, now_ms()],
        )? > 0;
        if inserted {
            tx.execute(
                &format!(
                    "UPDATE {} SET {c} = {c} + 1 WHERE id = ?1",
                    kind.counter_table(),
                    c = kind.counter_column()
                ),
                params![target_id],
            )?;
        }
        tx.commit()?;
        Ok(inserted)
    }

    /// Symmetric to `apply_like`: decrement only when a fact was
    /// actually deleted, clamped at zero.
    pub fn apply_unlike(
        &self,
        kind: InteractionKind,
        actor_id: i64,
        target_id: i64,
    ) -> Result<bool> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        let deleted = tx.execute(
            &format!(
                "DELETE FROM {} WHERE user_id = ?1 AND {} = ?2",
                kind.fact_table(),
                kind.target_column()
            ),
            params![actor_id, target_id],
        )? > 0;
        if deleted {
            tx.execute(
                &format!(
                    "UPDATE {} SET {c} = MAX(0, {c} - 1) WHERE id = ?1",
                    kind.counter_table(),
                    c = kind.counter_column()
                ),
                params![target_id],
            )?;
        }
        tx.commit()?;
        Ok(deleted)
    }

    /// Absolute correction from the reconciliation scheduler.
    pub fn set_counter(&self, kind: InteractionKind, target_id: i64, value: i64) -> Result<()> {
        let conn = self.conn()?;
        conn.execute(
            &format!(
                "UPDATE {} SET {} = ?2 WHERE id = ?1",
                kind.counter_table(),
                kind.counter_column()
            ),
            params![target_id, value.max(0)],
        )?;
        Ok(())
    }

    pub fn counter(&self, kind: InteractionKind, target_id: i64) -> Result<i64> {
        let conn = self.conn()?;
        let value: Option<i64> = conn
            .query_row(
                &format!(
                    "SELECT {} FROM {} WHERE id = ?1",
                    kind.counter_column(),
                    kind.counter_table()
                ),
                params![target_id],
                |r| r.get(0),
            )
            .optional()?;
        Ok(value.unwrap_or(0))
    }

    pub fn count_facts(&self, kind: InteractionKind, target_id: i64) -> Result<i64> {
        let conn = self.conn()?;
        let count: i64 = conn.query_row(
            &format!(
                "SELECT COUNT(*) FROM {} WHERE {} = ?1",
                kind.fact_table(),
                kind.target_column()
            ),
            params![target_id],
            |r| r.get(0),
        )?;
        Ok(count)
    }

    pub fn is_fact(&self, kind: InteractionKind, actor_id: i64, target_id: i64) -> Result<bool> {
        let conn = self.conn()?;
        let found: Option<i64> = conn
            .query_row(
                &format!(
                    "SELECT 1 FROM {} WHERE user_id = ?1 AND {} = ?2",
                    kind.fact_table(),
                    kind.target_column()
                ),
                params![actor_id, target_id],
                |r| r.get(0),
            )
            .optional()?;
        Ok(found.is_some())
    }

    /// Bulk read for batch checks: which of `target_ids` does the
    /// actor currently like/favorite.
    pub fn select_existing(
        &self,
        kind: InteractionKind,
        actor_id: i64,
        target_ids: &[i64],
    ) -> Result<Vec<i64>> {
        if target_ids.is_empty() {
            return Ok(Vec::new());
        }
        let conn = self.conn()?;
        let placeholders = vec!["?"; target_ids.len()].join(",");
        let sql = format!(
            "SELECT {col} FROM {} WHERE user_id = ?1 AND {col} IN ({placeholders})",
            kind.fact_table(),
            col = kind.target_column()
        );
        let mut stmt = conn.prepare(&sql)?;
        let mut sql_params: Vec<&dyn rusqlite::ToSql> = vec![&actor_id];
        for id in target_ids {
            sql_params.push(id);
        }
        let mut rows = stmt.query(sql_params.as_slice())?;
        let mut out = Vec::new();
        while let Some(row) = rows.next()? {
            out.push(row.get(0)?);
        }
        Ok(out)
    }

    /// Every target the actor has interacted with, for the cache
    /// warm-up backfill.
    pub fn select_facts_for_actor(&self, kind: InteractionKind, actor_id: i64) -> Result<Vec<i64>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM {} WHERE user_id = ?1",
            kind.target_column(),
            kind.fact_table()
        ))?;
        let mut rows = stmt.query(params![actor_id])?;
        let mut out = Vec::new();
        while let Some(row) = rows.next()? {
            out.push(row.get(0)?);
        }
        Ok(out)
    }

    /// Paginated "who liked this target", newest first.
    pub fn list_fact_actors(
        &self,
        kind: InteractionKind,
        target_id: i64,
        limit: u32,
        offset: u32,
    ) -> Result<Vec<i64>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT user_id FROM {} WHERE {} = ?1 ORDER BY created_at_ms DESC LIMIT ?2 OFFSET ?3",
            kind.fact_table(),
            kind.target_column()
        ))?;
        let mut rows = stmt.query(params![target_id, limit, offset])?;
        let mut out = Vec::new();
        while let Some(row) = rows.next()? {
            out.push(row.get(0)?);
        }
        Ok(out)
    }

    /// Paginated "what has this actor liked", newest first.
    pub fn list_actor_targets(
        &self,
        kind: InteractionKind,
        actor_id: i64,
        limit: u32,
        offset: u32,
    ) -> Result<Vec<i64>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM {} WHERE user_id = ?1 ORDER BY created_at_ms DESC LIMIT ?2 OFFSET ?3",
            kind.target_column(),
            kind.fact_table()
        ))?;
        let mut rows = stmt.query(params![actor_id, limit, offset])?;
        let mut out = Vec::new();
        while let Some(row) = rows.next()? {
            out.push(row.get(0)?);
        }
        Ok(out)
    }
}

fn now_ms() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as i64
}
