/*
 * SPDX-FileCopyrightText: 2026 Tally Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

pub mod cache;
pub mod consumer;
pub mod content_db;
pub mod engine;
pub mod event_log;
pub mod notify;
pub mod reconcile;

use serde::{Deserialize, Serialize};

/// What an interaction points at. Comments only support likes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum TargetType {
    Post,
    Comment,
}

/// The three interaction families. Each one owns a membership table,
/// a denormalized counter column, an event queue and a cache key
/// namespace; everything downstream dispatches on this.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum InteractionKind {
    PostLike,
    CommentLike,
    PostFavorite,
}

impl InteractionKind {
    pub const ALL: [InteractionKind; 3] = [
        InteractionKind::PostLike,
        InteractionKind::CommentLike,
        InteractionKind::PostFavorite,
    ];

    pub fn target_type(self) -> TargetType {
        match self {
            InteractionKind::PostLike | InteractionKind::PostFavorite => TargetType::Post,
            InteractionKind::CommentLike => TargetType::Comment,
        }
    }

    /// Event-log queue name.
    pub fn queue(self) -> &'static str {
        match self {
            InteractionKind::PostLike => "like.post",
            InteractionKind::CommentLike => "like.comment",
            InteractionKind::PostFavorite => "favorite.post",
        }
    }

    pub fn from_queue(queue: &str) -> Option<Self> {
        match queue {
            "like.post" => Some(InteractionKind::PostLike),
            "like.comment" => Some(InteractionKind::CommentLike),
            "favorite.post" => Some(InteractionKind::PostFavorite),
            _ => None,
        }
    }

    /// Per-actor membership set key.
    pub fn member_key(self, actor_id: i64) -> String {
        match self {
            InteractionKind::PostLike => format!("user:{actor_id}:liked:posts"),
            InteractionKind::CommentLike => format!("user:{actor_id}:liked:comments"),
            InteractionKind::PostFavorite => format!("user:{actor_id}:favorited:posts"),
        }
    }

    /// Per-target counter key.
    pub fn counter_key(self, target_id: i64) -> String {
        match self {
            InteractionKind::PostLike => format!("post:{target_id}:like_count"),
            InteractionKind::CommentLike => format!("comment:{target_id}:like_count"),
            InteractionKind::PostFavorite => format!("post:{target_id}:favorite_count"),
        }
    }

    /// SCAN pattern matching every counter key of this kind.
    pub fn counter_pattern(self) -> &'static str {
        match self {
            InteractionKind::PostLike => "post:*:like_count",
            InteractionKind::CommentLike => "comment:*:like_count",
            InteractionKind::PostFavorite => "post:*:favorite_count",
        }
    }

    fn warm_tag(self) -> &'static str {
        match self {
            InteractionKind::PostLike => "POST",
            InteractionKind::CommentLike => "COMMENT",
            InteractionKind::PostFavorite => "FAVORITE",
        }
    }

    /// Warm-flag key: present iff the actor's membership set is a
    /// complete mirror of the store for this kind.
    pub fn warm_key(self, actor_id: i64) -> String {
        format!("like:cache:init:{actor_id}:{}", self.warm_tag())
    }

    /// Extracts the target id from one of this kind's counter keys,
    /// e.g. `post:123:like_count` -> 123.
    pub fn parse_counter_key(self, key: &str) -> Option<i64> {
        let mut parts = key.split(':');
        let prefix = parts.next()?;
        let id = parts.next()?;
        let suffix = parts.next()?;
        if parts.next().is_some() {
            return None;
        }
        let (want_prefix, want_suffix) = match self {
            InteractionKind::PostLike => ("post", "like_count"),
            InteractionKind::CommentLike => ("comment", "like_count"),
            InteractionKind::PostFavorite => ("post", "favorite_count"),
        };
        if prefix != want_prefix || suffix != want_suffix {
            return None;
        }
        id.parse().ok()
    }
}
