/*
 * SPDX-FileCopyrightText: 2026 Tally Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

use axum::{
    extract::{Path, Query, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post, put},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use std::{net::SocketAddr, sync::Arc, time::Duration};
use tokio::sync::{broadcast, watch};
use tower_http::trace::TraceLayer;
use tracing::{info, info_span, warn};

use tally_core::{
    cache::{InteractionCache, MemoryCache, RedisCache, DEFAULT_TTL},
    consumer::{Consumer, ConsumerSettings},
    content_db::ContentDb,
    engine::{EngineError, InteractionEngine},
    event_log::EventLog,
    notify::BroadcastSink,
    reconcile::{self, ReconcileConfig},
    InteractionKind,
};

#[derive(Clone)]
struct AppState {
    engine: InteractionEngine,
    db: ContentDb,
    log: EventLog,
}

#[derive(Debug, Clone)]
struct ServiceConfig {
    bind: SocketAddr,
    content_db: String,
    events_db: String,
    redis_url: Option<String>,
    redis_pool_size: usize,
    redis_op_timeout_ms: u64,
    cache_ttl_secs: u64,
    consumer_batch: u32,
    max_attempts: Option<u32>,
    reconcile: ReconcileConfig,
}

fn load_config() -> ServiceConfig {
    let bind = std::env::var("TALLY_BIND").unwrap_or_else(|_| "0.0.0.0:8088".to_string());
    let bind: SocketAddr = bind.parse().expect("TALLY_BIND invalid");
    let content_db =
        std::env::var("TALLY_CONTENT_DB").unwrap_or_else(|_| "tally_content.db".to_string());
    let events_db =
        std::env::var("TALLY_EVENTS_DB").unwrap_or_else(|_| "tally_events.db".to_string());
    let redis_url = std::env::var("TALLY_REDIS_URL")
        .ok()
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty());
    let redis_pool_size = std::env::var("TALLY_REDIS_POOL_SIZE")
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(4);
    let redis_op_timeout_ms = std::env::var("TALLY_REDIS_OP_TIMEOUT_MS")
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(500);
    let cache_ttl_secs = std::env::var("TALLY_CACHE_TTL_SECS")
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(DEFAULT_TTL.as_secs());
    let consumer_batch = std::env::var("TALLY_CONSUMER_BATCH")
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(40);
    let max_attempts = match std::env::var("TALLY_MAX_ATTEMPTS") {
        Ok(s) => s.parse::<u32>().ok().filter(|n| *n > 0),
        Err(_) => Some(10),
    };
    let reconcile = ReconcileConfig {
        sync_interval_secs: std::env::var("TALLY_SYNC_INTERVAL_SECS")
            .ok()
            .and_then(|s| s.parse().ok())
            .or(Some(300)),
        cleanup_interval_secs: std::env::var("TALLY_CLEANUP_INTERVAL_SECS")
            .ok()
            .and_then(|s| s.parse().ok())
            .or(Some(24 * 3600)),
        applied_retention_days: std::env::var("TALLY_APPLIED_RETENTION_DAYS")
            .ok()
            .and_then(|s| s.parse().ok())
            .or(Some(7)),
    };
    ServiceConfig {
        bind,
        content_db,
        events_db,
        redis_url,
        redis_pool_size,
        redis_op_timeout_ms,
        cache_ttl_secs,
        consumer_batch,
        max_attempts,
        reconcile,
    }
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env().add_directive("info".parse().unwrap()),
        )
        .init();

    let cfg = load_config();

    let db = ContentDb::open(&cfg.content_db).expect("content db init");
    let log = EventLog::open(&cfg.events_db).expect("event log init");

    let cache: Arc<dyn InteractionCache> = match cfg.redis_url.as_deref() {
        Some(url) => {
            let cache = RedisCache::connect(
                url,
                cfg.redis_pool_size,
                Duration::from_millis(cfg.redis_op_timeout_ms),
            )
            .await
            .expect("redis connect");
            info!("using redis cache");
            Arc::new(cache)
        }
        None => {
            info!("TALLY_REDIS_URL unset, using in-process cache");
            Arc::new(MemoryCache::new())
        }
    };

    let sink = Arc::new(BroadcastSink::new(512));
    spawn_notice_logger(sink.subscribe());

    let engine = InteractionEngine::new(db.clone(), cache.clone(), log.clone(), sink.clone())
        .with_ttl(Duration::from_secs(cfg.cache_ttl_secs.max(60)));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let consumer = Consumer::new(
        db.clone(),
        log.clone(),
        ConsumerSettings {
            batch: cfg.consumer_batch,
            max_attempts: cfg.max_attempts,
            ..ConsumerSettings::default()
        },
    );
    consumer.start_workers(shutdown_rx.clone());
    reconcile::start_sync_worker(
        cfg.reconcile.clone(),
        cache.clone(),
        log.clone(),
        shutdown_rx.clone(),
    );
    reconcile::start_cleanup_worker(cfg.reconcile.clone(), cache, log.clone(), shutdown_rx);

    let state = AppState { engine, db, log };
    let app = Router::new()
        .route("/api/:family/batch-status", post(batch_status))
        .route("/api/:family/mine", get(list_mine))
        .route("/api/:family/:id", post(like).delete(unlike))
        .route("/api/:family/:id/toggle", put(toggle))
        .route("/api/:family/:id/status", get(status))
        .route("/api/:family/:id/count", get(count))
        .route("/api/:family/:id/actors", get(list_actors))
        .route("/healthz", get(healthz))
        .layer(
            TraceLayer::new_for_http().make_span_with(|req: &axum::http::Request<_>| {
                info_span!("http", method = %req.method(), uri = %req.uri())
            }),
        )
        .with_state(state);

    info!("tally_service listening on http://{}", cfg.bind);
    let listener = tokio::net::TcpListener::bind(cfg.bind).await.expect("bind");
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let _ = tokio::signal::ctrl_c().await;
            info!("shutdown requested");
            let _ = shutdown_tx.send(true);
        })
        .await
        .expect("server");
}

fn spawn_notice_logger(mut rx: broadcast::Receiver<tally_core::notify::InteractionNotice>) {
    tokio::spawn(async move {
        loop {
            match rx.recv().await {
                Ok(n) => info!(
                    kind = %n.kind,
                    actor = n.actor_id,
                    owner = n.owner_id,
                    target = n.target_id,
                    "interaction notice"
                ),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(skipped, "notice logger lagged");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    });
}

// -- request/response types -------------------------------------------------

#[derive(Serialize)]
struct ApiResponse<T: Serialize> {
    success: bool,
    message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    data: Option<T>,
}

impl<T: Serialize> ApiResponse<T> {
    fn ok(data: T) -> Json<Self> {
        Self::ok_with("ok", data)
    }

    fn ok_with(message: &str, data: T) -> Json<Self> {
        Json(Self {
            success: true,
            message: message.to_string(),
            data: Some(data),
        })
    }
}

fn fail(status: StatusCode, message: &str) -> Response {
    (
        status,
        Json(ApiResponse::<()> {
            success: false,
            message: message.to_string(),
            data: None,
        }),
    )
        .into_response()
}

fn engine_error(e: EngineError) -> Response {
    match e {
        EngineError::TargetUnavailable => fail(StatusCode::NOT_FOUND, "target not available"),
        EngineError::Internal(e) => {
            warn!("internal error: {e:#}");
            fail(StatusCode::INTERNAL_SERVER_ERROR, "internal error")
        }
    }
}

fn parse_family(family: &str) -> Result<InteractionKind, Response> {
    match family {
        "post-likes" => Ok(InteractionKind::PostLike),
        "comment-likes" => Ok(InteractionKind::CommentLike),
        "post-favorites" => Ok(InteractionKind::PostFavorite),
        _ => Err(fail(StatusCode::NOT_FOUND, "unknown interaction family")),
    }
}

fn actor_id(headers: &HeaderMap) -> Result<i64, Response> {
    headers
        .get("x-user-id")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse().ok())
        .ok_or_else(|| fail(StatusCode::UNAUTHORIZED, "missing or invalid x-user-id"))
}

#[derive(Deserialize)]
struct PageQuery {
    limit: Option<u32>,
    offset: Option<u32>,
}

#[derive(Deserialize)]
struct BatchStatusRequest {
    target_ids: Vec<i64>,
}

#[derive(Serialize)]
struct BatchStatusEntry {
    target_id: i64,
    active: bool,
}

#[derive(Serialize)]
struct CountReply {
    count: i64,
}

#[derive(Serialize)]
struct HealthReply {
    pending_events: u64,
    dead_events: u64,
}

// -- handlers ---------------------------------------------------------------

async fn like(
    State(state): State<AppState>,
    Path((family, id)): Path<(String, i64)>,
    headers: HeaderMap,
) -> Response {
    let kind = match parse_family(&family) {
        Ok(k) => k,
        Err(r) => return r,
    };
    let actor = match actor_id(&headers) {
        Ok(a) => a,
        Err(r) => return r,
    };
    match state.engine.like(kind, actor, id).await {
        // Data is the operation result: false means "already liked".
        Ok(changed) => {
            let message = if changed { "liked" } else { "already liked" };
            ApiResponse::ok_with(message, changed).into_response()
        }
        Err(e) => engine_error(e),
    }
}

async fn unlike(
    State(state): State<AppState>,
    Path((family, id)): Path<(String, i64)>,
    headers: HeaderMap,
) -> Response {
    let kind = match parse_family(&family) {
        Ok(k) => k,
        Err(r) => return r,
    };
    let actor = match actor_id(&headers) {
        Ok(a) => a,
        Err(r) => return r,
    };
    match state.engine.unlike(kind, actor, id).await {
        Ok(changed) => {
            let message = if changed { "unliked" } else { "not liked" };
            ApiResponse::ok_with(message, changed).into_response()
        }
        Err(e) => engine_error(e),
    }
}

async fn toggle(
    State(state): State<AppState>,
    Path((family, id)): Path<(String, i64)>,
    headers: HeaderMap,
) -> Response {
    let kind = match parse_family(&family) {
        Ok(k) => k,
        Err(r) => return r,
    };
    let actor = match actor_id(&headers) {
        Ok(a) => a,
        Err(r) => return r,
    };
    match state.engine.toggle(kind, actor, id).await {
        Ok(active) => ApiResponse::ok(active).into_response(),
        Err(e) => engine_error(e),
    }
}

async fn status(
    State(state): State<AppState>,
    Path((family, id)): Path<(String, i64)>,
    headers: HeaderMap,
) -> Response {
    let kind = match parse_family(&family) {
        Ok(k) => k,
        Err(r) => return r,
    };
    let actor = match actor_id(&headers) {
        Ok(a) => a,
        Err(r) => return r,
    };
    match state.engine.is_liked(kind, actor, id).await {
        Ok(active) => ApiResponse::ok(active).into_response(),
        Err(e) => engine_error(e),
    }
}

async fn count(
    State(state): State<AppState>,
    Path((family, id)): Path<(String, i64)>,
) -> Response {
    let kind = match parse_family(&family) {
        Ok(k) => k,
        Err(r) => return r,
    };
    match state.engine.count(kind, id).await {
        Ok(count) => ApiResponse::ok(CountReply { count }).into_response(),
        Err(e) => engine_error(e),
    }
}

async fn batch_status(
    State(state): State<AppState>,
    Path(family): Path<String>,
    headers: HeaderMap,
    Json(req): Json<BatchStatusRequest>,
) -> Response {
    let kind = match parse_family(&family) {
        Ok(k) => k,
        Err(r) => return r,
    };
    let actor = match actor_id(&headers) {
        Ok(a) => a,
        Err(r) => return r,
    };
    if req.target_ids.len() > 500 {
        return fail(StatusCode::BAD_REQUEST, "too many target ids");
    }
    match state.engine.batch_is_liked(kind, actor, &req.target_ids).await {
        Ok(hits) => {
            let data: Vec<BatchStatusEntry> = req
                .target_ids
                .iter()
                .zip(hits)
                .map(|(target_id, active)| BatchStatusEntry {
                    target_id: *target_id,
                    active,
                })
                .collect();
            ApiResponse::ok(data).into_response()
        }
        Err(e) => engine_error(e),
    }
}

async fn list_actors(
    State(state): State<AppState>,
    Path((family, id)): Path<(String, i64)>,
    Query(page): Query<PageQuery>,
) -> Response {
    let kind = match parse_family(&family) {
        Ok(k) => k,
        Err(r) => return r,
    };
    let limit = page.limit.unwrap_or(50).min(200);
    let offset = page.offset.unwrap_or(0);
    match state.engine.list_actors(kind, id, limit, offset).await {
        Ok(actors) => ApiResponse::ok(actors).into_response(),
        Err(e) => engine_error(e),
    }
}

async fn list_mine(
    State(state): State<AppState>,
    Path(family): Path<String>,
    Query(page): Query<PageQuery>,
    headers: HeaderMap,
) -> Response {
    let kind = match parse_family(&family) {
        Ok(k) => k,
        Err(r) => return r,
    };
    let actor = match actor_id(&headers) {
        Ok(a) => a,
        Err(r) => return r,
    };
    let limit = page.limit.unwrap_or(50).min(200);
    let offset = page.offset.unwrap_or(0);
    match state.engine.list_targets(kind, actor, limit, offset).await {
        Ok(targets) => ApiResponse::ok(targets).into_response(),
        Err(e) => engine_error(e),
    }
}

async fn healthz(State(state): State<AppState>) -> Response {
    let db = state.db.clone();
    let db_ok = tokio::task::spawn_blocking(move || db.health_check())
        .await
        .map(|r| r.is_ok())
        .unwrap_or(false);
    if !db_ok {
        return fail(StatusCode::SERVICE_UNAVAILABLE, "store unavailable");
    }
    match state.log.stats().await {
        Ok(stats) => ApiResponse::ok(HealthReply {
            pending_events: stats.pending,
            dead_events: stats.dead,
        })
        .into_response(),
        Err(e) => {
            warn!("event log stats failed: {e:#}");
            fail(StatusCode::SERVICE_UNAVAILABLE, "event log unavailable")
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tally_core::{content_db::STATUS_PUBLISHED, notify::NullSink};

    fn test_state() -> (tempfile::TempDir, AppState) {
        let dir = tempfile::tempdir().expect("tempdir");
        let db = ContentDb::open(dir.path().join("content.db")).expect("content db");
        let log = EventLog::open(dir.path().join("events.db")).expect("event log");
        let cache: Arc<dyn InteractionCache> = Arc::new(MemoryCache::new());
        let engine = InteractionEngine::new(db.clone(), cache, log.clone(), Arc::new(NullSink));
        (dir, AppState { engine, db, log })
    }

    fn actor_headers(id: i64) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert("x-user-id", id.to_string().parse().unwrap());
        headers
    }

    async fn read_json(resp: Response) -> serde_json::Value {
        let bytes = axum::body::to_bytes(resp.into_body(), 64 * 1024)
            .await
            .unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn like_payload_carries_the_operation_result() {
        let (_dir, state) = test_state();
        let post = state.db.create_post(1, STATUS_PUBLISHED).unwrap();
        let path = || Path(("post-likes".to_string(), post));

        let first = like(State(state.clone()), path(), actor_headers(7)).await;
        let body = read_json(first).await;
        assert_eq!(body["success"], true);
        assert_eq!(body["message"], "liked");
        assert_eq!(body["data"], true);

        // Repeat like: success envelope, but the boolean says no-op.
        let second = like(State(state.clone()), path(), actor_headers(7)).await;
        let body = read_json(second).await;
        assert_eq!(body["success"], true);
        assert_eq!(body["message"], "already liked");
        assert_eq!(body["data"], false);

        let removed = unlike(State(state.clone()), path(), actor_headers(7)).await;
        let body = read_json(removed).await;
        assert_eq!(body["message"], "unliked");
        assert_eq!(body["data"], true);

        let again = unlike(State(state.clone()), path(), actor_headers(7)).await;
        let body = read_json(again).await;
        assert_eq!(body["message"], "not liked");
        assert_eq!(body["data"], false);
    }

    #[tokio::test]
    async fn missing_target_maps_to_not_found() {
        let (_dir, state) = test_state();
        let resp = like(
            State(state.clone()),
            Path(("post-likes".to_string(), 999)),
            actor_headers(7),
        )
        .await;
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
        let body = read_json(resp).await;
        assert_eq!(body["success"], false);
    }

    #[tokio::test]
    async fn missing_actor_header_is_unauthorized() {
        let (_dir, state) = test_state();
        let post = state.db.create_post(1, STATUS_PUBLISHED).unwrap();
        let resp = like(
            State(state),
            Path(("post-likes".to_string(), post)),
            HeaderMap::new(),
        )
        .await;
        assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
    }
}
