use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

use anyhow::{Context, Result};
use axum::extract::{Path, Query, Request, State};
use axum::http::{HeaderName, StatusCode, header};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use bytes::Bytes;
use common::{
    FailoverStatus, HealthStatus, NodeHealthRecord, NodeId, RequestCounters, SyncAction,
    SyncOutcome, SyncRequest, SyncResponse,
};
use serde::Deserialize;
use serde_json::json;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;

mod cache;
mod catalog;
mod config;
mod failover;
mod health;
mod sync;


use cache::{BoundedCache, CacheError};
use catalog::{CatalogError, CatalogQuery, CatalogStore, InMemoryCatalog, ReadOutcome};
use config::NodeConfig;
use failover::{FailoverAggregator, PeerDescriptor};
use health::HealthMonitor;
use sync::EdgeSyncGateway;

const PEER_REQUEST_TIMEOUT: Duration = Duration::from_secs(5);
const SLOW_REQUEST_THRESHOLD: Duration = Duration::from_millis(100);

#[derive(Clone)]
struct ServerState {
    node_id: NodeId,
    cache: Arc<Mutex<BoundedCache>>,
    failover: Arc<Mutex<FailoverAggregator>>,
    health: Arc<HealthMonitor>,
    catalog: Arc<dyn CatalogStore>,
    gateway: EdgeSyncGateway,
    peers: Arc<Vec<PeerDescriptor>>,
    peer_http: reqwest::Client,
    warm_peers_on_fill: bool,
    inflight_requests: Arc<AtomicUsize>,
    total_requests: Arc<AtomicU64>,
}

impl ServerState {
    fn from_config(config: &NodeConfig, catalog: Arc<dyn CatalogStore>) -> Self {
        let cache = Arc::new(Mutex::new(BoundedCache::new(config.cache.clone())));
        let failover = Arc::new(Mutex::new(FailoverAggregator::new(
            config.node_id.clone(),
            &config.peers,
            config.peer_timeout,
        )));

        Self {
            node_id: config.node_id.clone(),
            gateway: EdgeSyncGateway::new(cache.clone(), failover.clone()),
            cache,
            failover,
            health: Arc::new(HealthMonitor::new(
                config.node_id.clone(),
                config.node_type,
                config.probe_timeout,
            )),
            catalog,
            peers: Arc::new(config.peers.clone()),
            peer_http: sync::peer_http_client(PEER_REQUEST_TIMEOUT),
            warm_peers_on_fill: config.warm_peers_on_fill,
            inflight_requests: Arc::new(AtomicUsize::new(0)),
            total_requests: Arc::new(AtomicU64::new(0)),
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_target(false)
        .compact()
        .init();

    let config = NodeConfig::from_env()?;

    let catalog: Arc<dyn CatalogStore> = match &config.catalog_path {
        Some(path) => Arc::new(
            InMemoryCatalog::load(path)
                .await
                .with_context(|| format!("failed to load catalog from {}", path.display()))?,
        ),
        None => Arc::new(InMemoryCatalog::sample()),
    };

    let state = ServerState::from_config(&config, catalog.clone());

    tokio::spawn(
        state
            .health
            .clone()
            .run(catalog, config.health_interval),
    );

    if config.heartbeat.enabled && !config.peers.is_empty() {
        tokio::spawn(sync::run_peer_heartbeat(
            state.health.clone(),
            config.peers.clone(),
            config.heartbeat.interval,
            PEER_REQUEST_TIMEOUT,
        ));
    }

    if let Some(interval) = config.decay_interval {
        tokio::spawn(run_access_decay(state.cache.clone(), interval));
    }

    let app = build_router(state);

    info!(
        node_id = %config.node_id,
        node_type = %config.node_type,
        bind_addr = %config.bind_addr,
        public_url = %config.public_url,
        peers = config.peers.len(),
        capacity_bytes = config.cache.capacity_bytes,
        "server node listening"
    );

    let listener = tokio::net::TcpListener::bind(config.bind_addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}

fn build_router(state: ServerState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/status", get(status))
        .route("/sync", post(sync_entry))
        .route("/peers/heartbeat", post(peer_heartbeat))
        .route("/products", get(list_products))
        .route("/products/{id}", get(get_product))
        .route("/categories", get(list_categories))
        .route("/search", get(search_products))
        .route("/admin/cache/clear", post(clear_cache))
        .route("/admin/cache/purge", post(purge_cache))
        .layer(middleware::from_fn_with_state(state.clone(), track_requests))
        .with_state(state)
}

struct InflightGuard(Arc<AtomicUsize>);

impl Drop for InflightGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::Relaxed);
    }
}

async fn track_requests(State(state): State<ServerState>, request: Request, next: Next) -> Response {
    state.total_requests.fetch_add(1, Ordering::Relaxed);
    state.inflight_requests.fetch_add(1, Ordering::Relaxed);
    let _guard = InflightGuard(state.inflight_requests.clone());

    let method = request.method().clone();
    let path = request.uri().path().to_string();
    let started = tokio::time::Instant::now();

    let response = next.run(request).await;

    let elapsed = started.elapsed();
    if is_slow(elapsed) {
        warn!(
            %method,
            %path,
            status = response.status().as_u16(),
            elapsed_ms = elapsed.as_millis() as u64,
            "slow request"
        );
    }

    response
}

fn is_slow(elapsed: Duration) -> bool {
    elapsed > SLOW_REQUEST_THRESHOLD
}

async fn run_access_decay(cache: Arc<Mutex<BoundedCache>>, interval: Duration) {
    let mut ticker = tokio::time::interval(interval);
    // first tick completes immediately
    ticker.tick().await;

    loop {
        ticker.tick().await;
        cache.lock().await.decay_access_counts();
        debug!("halved cache access counts");
    }
}

async fn health(State(state): State<ServerState>) -> Json<HealthStatus> {
    let node = state.health.record().await;
    let cache = state.cache.lock().await.stats();

    Json(HealthStatus {
        node,
        cache,
        requests: RequestCounters {
            total: state.total_requests.load(Ordering::Relaxed),
            inflight: state.inflight_requests.load(Ordering::Relaxed),
        },
    })
}

async fn status(State(state): State<ServerState>) -> Json<FailoverStatus> {
    let local = state.health.record().await;
    let failover = state.failover.lock().await;
    Json(failover.status(&local))
}

async fn peer_heartbeat(
    State(state): State<ServerState>,
    Json(record): Json<NodeHealthRecord>,
) -> StatusCode {
    let node_id = record.node_id.clone();
    let report = state.failover.lock().await.report_peer(node_id.clone(), record);
    debug!(peer = %node_id, ?report, "peer heartbeat received");

    StatusCode::NO_CONTENT
}

fn sync_reply(
    code: StatusCode,
    status: SyncOutcome,
    key: String,
    value: Option<serde_json::Value>,
    error: Option<String>,
) -> Response {
    (
        code,
        Json(SyncResponse {
            status,
            key,
            value,
            error,
        }),
    )
        .into_response()
}

fn sync_rejected(code: StatusCode, key: String, error: impl Into<String>) -> Response {
    sync_reply(code, SyncOutcome::Rejected, key, None, Some(error.into()))
}

async fn sync_entry(
    State(state): State<ServerState>,
    Json(request): Json<SyncRequest>,
) -> Response {
    let SyncRequest {
        action,
        key,
        value,
        ttl,
        source_node_id,
    } = request;

    if key.trim().is_empty() {
        return sync_rejected(StatusCode::BAD_REQUEST, key, "key must not be empty");
    }

    match action {
        SyncAction::Push => {
            let Some(value) = value else {
                return sync_rejected(StatusCode::BAD_REQUEST, key, "push requires a value");
            };
            let Some(source) = source_node_id else {
                return sync_rejected(StatusCode::BAD_REQUEST, key, "push requires source_node_id");
            };
            let payload = match serde_json::to_vec(&value) {
                Ok(encoded) => Bytes::from(encoded),
                Err(err) => {
                    return sync_rejected(StatusCode::BAD_REQUEST, key, err.to_string());
                }
            };

            match state
                .gateway
                .push_entry(&key, payload, ttl.map(Duration::from_secs), &source)
                .await
            {
                Ok(()) => sync_reply(StatusCode::OK, SyncOutcome::Stored, key, None, None),
                Err(err @ CacheError::EntryTooLarge { .. }) => {
                    warn!(key = %key, source = %source, error = %err, "rejected pushed entry");
                    sync_rejected(StatusCode::PAYLOAD_TOO_LARGE, key, err.to_string())
                }
                Err(err @ CacheError::TtlOutOfRange { .. }) => {
                    warn!(key = %key, source = %source, error = %err, "rejected pushed entry");
                    sync_rejected(StatusCode::BAD_REQUEST, key, err.to_string())
                }
            }
        }
        SyncAction::Pull => match state.gateway.pull_entry(&key).await {
            Some(payload) => match serde_json::from_slice::<serde_json::Value>(&payload) {
                Ok(value) => sync_reply(StatusCode::OK, SyncOutcome::Found, key, Some(value), None),
                Err(err) => {
                    error!(key = %key, error = %err, "cached entry is not valid JSON");
                    sync_rejected(StatusCode::INTERNAL_SERVER_ERROR, key, "corrupt cache entry")
                }
            },
            None => sync_reply(StatusCode::NOT_FOUND, SyncOutcome::NotFound, key, None, None),
        },
        SyncAction::Invalidate => {
            if state
                .gateway
                .invalidate_entry(&key, source_node_id.as_ref())
                .await
            {
                sync_reply(StatusCode::OK, SyncOutcome::Invalidated, key, None, None)
            } else {
                sync_reply(StatusCode::NOT_FOUND, SyncOutcome::NotFound, key, None, None)
            }
        }
    }
}

#[derive(Debug, Deserialize)]
struct ListingParams {
    category: Option<String>,
    limit: Option<usize>,
    offset: Option<usize>,
}

async fn list_products(
    State(state): State<ServerState>,
    Query(params): Query<ListingParams>,
) -> Response {
    let query = CatalogQuery::listing(params.category.as_deref(), params.limit, params.offset);
    serve_catalog(&state, query).await
}

#[derive(Debug, Deserialize)]
struct SearchParams {
    q: Option<String>,
    category: Option<String>,
    limit: Option<usize>,
    offset: Option<usize>,
}

async fn search_products(
    State(state): State<ServerState>,
    Query(params): Query<SearchParams>,
) -> Response {
    let query = CatalogQuery::search(
        params.q.as_deref(),
        params.category.as_deref(),
        params.limit,
        params.offset,
    );
    serve_catalog(&state, query).await
}

async fn get_product(State(state): State<ServerState>, Path(id): Path<u64>) -> Response {
    serve_catalog(&state, CatalogQuery::Product { id }).await
}

async fn list_categories(State(state): State<ServerState>) -> Response {
    serve_catalog(&state, CatalogQuery::Categories).await
}

fn catalog_body(code: StatusCode, cache: &'static str, body: Bytes) -> Response {
    (
        code,
        [
            (header::CONTENT_TYPE, "application/json"),
            (HeaderName::from_static("x-cache"), cache),
        ],
        body,
    )
        .into_response()
}

async fn serve_catalog(state: &ServerState, query: CatalogQuery) -> Response {
    match catalog::read_through(&state.cache, state.catalog.as_ref(), &query).await {
        Ok(ReadOutcome::Hit(payload)) => catalog_body(StatusCode::OK, "hit", payload),
        Ok(ReadOutcome::Miss(payload)) => {
            if state.warm_peers_on_fill && !state.peers.is_empty() {
                tokio::spawn(sync::warm_peers(
                    state.peer_http.clone(),
                    state.peers.as_ref().clone(),
                    state.node_id.clone(),
                    query.cache_key(),
                    payload.clone(),
                ));
            }
            catalog_body(StatusCode::OK, "miss", payload)
        }
        Ok(ReadOutcome::NotFound) => catalog_body(
            StatusCode::NOT_FOUND,
            "miss",
            Bytes::from_static(b"{\"error\":\"not_found\"}"),
        ),
        Err(CatalogError::Unavailable(reason)) => {
            warn!(key = %query.cache_key(), error = %reason, "catalog read failed on cache miss");
            (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(json!({ "error": "catalog store unavailable" })),
            )
                .into_response()
        }
        Err(err) => {
            error!(key = %query.cache_key(), error = %err, "failed to encode catalog response");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

async fn clear_cache(State(state): State<ServerState>) -> Json<serde_json::Value> {
    let removed = state.cache.lock().await.clear();
    info!(removed, "cache cleared by operator");
    Json(json!({ "removed": removed }))
}

async fn purge_cache(State(state): State<ServerState>) -> Json<serde_json::Value> {
    let purged = state.cache.lock().await.purge_expired();
    info!(purged, "expired cache entries purged");
    Json(json!({ "purged": purged }))
}
