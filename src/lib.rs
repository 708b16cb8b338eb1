pub mod config;
pub mod engine;
pub mod hls;
pub mod mac;
pub mod metrics;
pub mod occupancy;
pub mod portal;
pub mod store;
pub mod supervisor;
pub mod transcoder;

#[cfg(test)]
mod testing;

use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;

use axum::body::Body;
use axum::extract::{ConnectInfo, FromRequestParts, Path, Query, State};
use axum::http::request::Parts;
use axum::http::{header, HeaderMap, Method, StatusCode, Uri};
use axum::response::{IntoResponse, Json, Response};
use axum::routing::{get, post};
use axum::Router;
use serde::Deserialize;
use tracing::{error, info, warn};

use crate::config::{Settings, StreamMethod};
use crate::engine::{AcquireError, SessionEngine};
use crate::hls::{HlsError, HlsManager};
use crate::occupancy::{OccupancyTracker, ViewerInfo};
use crate::store::PortalStore;
use crate::supervisor::{OutputMode, StreamSupervisor};

pub struct AppState {
    pub store: Arc<PortalStore>,
    pub occupancy: OccupancyTracker,
    pub engine: Arc<SessionEngine>,
    pub supervisor: StreamSupervisor,
    pub hls: HlsManager,
    pub method: StreamMethod,
}

impl AppState {
    /// Wires the components together from loaded settings.
    pub fn new(
        settings: &Settings,
        store: Arc<PortalStore>,
        client: Arc<dyn portal::PortalClient>,
    ) -> anyhow::Result<Self> {
        let streaming = &settings.streaming;
        let occupancy = OccupancyTracker::new();
        let engine = Arc::new(SessionEngine::new(
            store.clone(),
            occupancy.clone(),
            client,
            engine::EnginePolicy {
                try_all_macs: streaming.try_all_macs,
                test_streams: streaming.test_streams,
                probe_timeout: streaming.timeout(),
            },
        ));
        let supervisor = StreamSupervisor::new(
            engine.clone(),
            streaming.ffmpeg_path.clone(),
            streaming.template()?,
            streaming.timeout(),
        );
        let hls = HlsManager::new(
            settings.hls.clone(),
            streaming.ffmpeg_path.clone(),
            streaming.timeout(),
        );
        Ok(Self {
            store,
            occupancy,
            engine,
            supervisor,
            hls,
            method: streaming.method,
        })
    }
}

/// Rewrites portals configured with a landing page URL to the `.php`
/// endpoint their `xpcom.common.js` points at.
pub async fn discover_portal_endpoints(store: &PortalStore, client: &portal::StalkerClient) {
    for mut portal in store.portals().await {
        if portal.url.ends_with(".php") {
            continue;
        }
        let Some(endpoint) = client.discover_endpoint(&portal.url, portal.proxy()).await else {
            continue;
        };
        info!("Portal endpoint updated: portal={} url={} endpoint={}", portal.id, portal.url, endpoint);
        portal.url = endpoint;
        if let Err(e) = store.upsert(portal).await {
            error!("Failed to persist discovered endpoint: err={}", e);
        }
    }
}

pub fn create_app(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/play/{portal_id}/{channel_id}", get(play_handler))
        .route("/hls/{portal_id}/{channel_id}/{filename}", get(hls_handler))
        .route("/api/streaming", get(streaming_handler))
        .route("/api/portals/{portal_id}/test-macs", post(test_macs_handler))
        .route("/metrics", get(metrics_handler))
        .fallback(fallback_handler)
        .with_state(state)
}

fn text(status: StatusCode, body: &'static str) -> Response {
    (status, body).into_response()
}

fn user_agent(headers: &HeaderMap) -> &str {
    headers
        .get(header::USER_AGENT)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("<none>")
}

/// Viewer address: first `X-Forwarded-For` hop, then `X-Real-IP`, then the peer.
pub struct ClientIp(pub String);

impl<S> FromRequestParts<S> for ClientIp
where
    S: Send + Sync,
{
    type Rejection = Infallible;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let header_value = |name: &str| {
            parts
                .headers
                .get(name)
                .and_then(|v| v.to_str().ok())
                .map(str::trim)
                .filter(|v| !v.is_empty())
                .map(str::to_string)
        };
        let forwarded = header_value("x-forwarded-for")
            .and_then(|v| v.split(',').next().map(|s| s.trim().to_string()))
            .filter(|v| !v.is_empty());
        let ip = forwarded
            .or_else(|| header_value("x-real-ip"))
            .or_else(|| {
                parts
                    .extensions
                    .get::<ConnectInfo<SocketAddr>>()
                    .map(|ConnectInfo(addr)| addr.ip().to_string())
            })
            .unwrap_or_else(|| "unknown".to_string());
        Ok(ClientIp(ip))
    }
}

fn acquire_error_response(err: &AcquireError) -> Response {
    match err {
        AcquireError::PortalNotFound(_) => text(StatusCode::NOT_FOUND, "Portal not found"),
        AcquireError::PortalDisabled(_) => text(StatusCode::NOT_FOUND, "Portal disabled"),
        AcquireError::Exhausted(_) => text(StatusCode::SERVICE_UNAVAILABLE, "No streams available"),
    }
}

#[derive(Debug, Default, Deserialize)]
struct PlayQuery {
    /// Present (any value but `false`/`0`) for browser playback.
    web: Option<String>,
    user: Option<String>,
}

impl PlayQuery {
    fn web(&self) -> bool {
        matches!(self.web.as_deref(), Some(v) if v != "false" && v != "0")
    }
}

async fn play_handler(
    Path((portal_id, channel_id)): Path<(String, String)>,
    Query(query): Query<PlayQuery>,
    State(state): State<Arc<AppState>>,
    ClientIp(client_ip): ClientIp,
    headers: HeaderMap,
) -> Response {
    let web = query.web();
    info!(
        "HTTP play request: portal={} channel={} web={} client={} UA=\"{}\"",
        portal_id,
        channel_id,
        web,
        client_ip,
        user_agent(&headers)
    );

    let ready = match state.engine.acquire(&portal_id, &channel_id).await {
        Ok(r) => r,
        Err(e) => {
            warn!("Play rejected: portal={} channel={} err={}", portal_id, channel_id, e);
            return acquire_error_response(&e);
        }
    };

    // Browsers always get the fMP4 remux; only players follow the stream method.
    if !web && state.method == StreamMethod::Redirect {
        info!("Redirecting: portal={} channel={} link={}", portal_id, channel_id, ready.link);
        return (StatusCode::FOUND, [(header::LOCATION, ready.link.clone())]).into_response();
    }

    let viewer = ViewerInfo {
        portal_name: ready.portal.name.clone(),
        channel_name: ready.channel.name.clone(),
        client_ip,
        user: query.user.clone(),
    };
    let (mode, content_type) = if web {
        (OutputMode::Web, "video/mp4")
    } else {
        (OutputMode::Player, "application/octet-stream")
    };

    match state.supervisor.start(ready, viewer, mode) {
        Ok(stream) => (
            [(header::CONTENT_TYPE, content_type)],
            Body::from_stream(stream),
        )
            .into_response(),
        Err(e) => {
            error!("Failed to start stream: portal={} channel={} err={:#}", portal_id, channel_id, e);
            text(StatusCode::INTERNAL_SERVER_ERROR, "Error starting stream")
        }
    }
}

async fn hls_handler(
    Path((portal_id, channel_id, filename)): Path<(String, String, String)>,
    State(state): State<Arc<AppState>>,
    ClientIp(client_ip): ClientIp,
) -> Response {
    info!(
        "HTTP HLS request: portal={} channel={} file={} client={}",
        portal_id, channel_id, filename, client_ip
    );

    let Some(portal) = state.store.portal(&portal_id).await else {
        warn!("HLS request for unknown portal: portal={}", portal_id);
        return text(StatusCode::NOT_FOUND, "Portal not found");
    };

    let mut file = match state.hls.session_kind(&portal_id, &channel_id).await {
        Some(passthrough) => {
            state
                .hls
                .fetch_when_ready(&portal_id, &channel_id, &filename, passthrough)
                .await
        }
        None => None,
    };

    let startable = [".m3u8", ".ts", ".m4s"].iter().any(|ext| filename.ends_with(ext));
    if file.is_none() && startable && state.hls.session_kind(&portal_id, &channel_id).await.is_none() {
        let ready = match state.engine.acquire(&portal_id, &channel_id).await {
            Ok(r) => r,
            Err(e) => {
                warn!("HLS rejected: portal={} channel={} err={}", portal_id, channel_id, e);
                return acquire_error_response(&e);
            }
        };
        let started = state
            .hls
            .start_or_reuse(&portal_id, &channel_id, &ready.link, portal.proxy())
            .await;
        drop(ready);
        match started {
            Ok(info) => {
                file = state
                    .hls
                    .fetch_when_ready(&portal_id, &channel_id, &filename, info.passthrough)
                    .await;
            }
            Err(HlsError::Capacity(max)) => {
                warn!("HLS capacity reached: max_streams={} portal={} channel={}", max, portal_id, channel_id);
                return text(StatusCode::SERVICE_UNAVAILABLE, "HLS capacity reached");
            }
            Err(e) => {
                error!("Error starting HLS stream: portal={} channel={} err={}", portal_id, channel_id, e);
                return text(StatusCode::INTERNAL_SERVER_ERROR, "Error starting stream");
            }
        }
    }

    let Some(file) = file else {
        warn!("HLS file not found: portal={} channel={} file={}", portal_id, channel_id, filename);
        return text(StatusCode::NOT_FOUND, "File not found");
    };
    match tokio::fs::read(&file.path).await {
        Ok(bytes) => (
            [
                (header::CONTENT_TYPE, file.content_type),
                (header::CACHE_CONTROL, "no-cache"),
            ],
            bytes,
        )
            .into_response(),
        Err(e) => {
            warn!("HLS file vanished: path={} err={}", file.path.display(), e);
            text(StatusCode::NOT_FOUND, "File not found")
        }
    }
}

async fn streaming_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(state.occupancy.snapshot())
}

async fn test_macs_handler(
    Path(portal_id): Path<String>,
    State(state): State<Arc<AppState>>,
) -> Response {
    info!("MAC test requested: portal={}", portal_id);
    match state.engine.test_macs(&portal_id).await {
        Ok(results) => Json(results).into_response(),
        Err(e) => acquire_error_response(&e),
    }
}

async fn metrics_handler() -> impl IntoResponse {
    (
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        metrics::gather_metrics(),
    )
}

async fn fallback_handler(method: Method, uri: Uri, headers: HeaderMap) -> Response {
    info!(
        "HTTP 404: method={} uri={} UA=\"{}\"",
        method,
        uri,
        user_agent(&headers)
    );
    text(StatusCode::NOT_FOUND, "Not found")
}
