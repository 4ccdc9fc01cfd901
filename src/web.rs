use anyhow::{Context, Result};
use axum::{
    body::Body,
    extract::{ConnectInfo, State},
    http::header,
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use bytes::Bytes;
use serde::Serialize;
use std::collections::BTreeMap;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::mjpeg::STREAM_CONTENT_TYPE;
use crate::streaming::{FrameDistributor, RelayMonitor, RelayStats};

/// Web server state
#[derive(Clone)]
pub struct AppState {
    distributor: Arc<FrameDistributor>,
    monitor: RelayMonitor,
    shutdown: CancellationToken,
}

impl AppState {
    pub fn new(distributor: Arc<FrameDistributor>, monitor: RelayMonitor, shutdown: CancellationToken) -> Self {
        Self {
            distributor,
            monitor,
            shutdown,
        }
    }
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/", get(index_handler))
        .route("/video_feed", get(video_feed_handler))
        .route("/health", get(health_handler))
        .route("/api/stats", get(stats_handler))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Serve until the shutdown token fires; open streams end at that point.
pub async fn run_server(listener: TcpListener, state: AppState) -> Result<()> {
    let shutdown = state.shutdown.clone();
    let app = router(state);

    info!(addr = %listener.local_addr()?, "Starting web server");

    axum::serve(listener, app.into_make_service_with_connect_info::<SocketAddr>())
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await
        .context("web server failed")?;

    Ok(())
}

/// MJPEG stream handler
///
/// Attaches a client session and streams framed parts until the client
/// goes away. A failed write drops the body, which drops the session and
/// detaches it; nothing else is affected.
async fn video_feed_handler(
    State(state): State<AppState>,
    peer: Option<ConnectInfo<SocketAddr>>,
) -> impl IntoResponse {
    let peer = peer
        .map(|ConnectInfo(addr)| addr.to_string())
        .unwrap_or_else(|| "unknown".to_string());
    let session = state.distributor.attach_client(peer);
    let shutdown = state.shutdown.clone();

    let parts = futures_util::stream::unfold(session, move |mut session| {
        let shutdown = shutdown.clone();
        async move {
            let next = tokio::select! {
                _ = shutdown.cancelled() => None,
                chunk = session.recv() => chunk,
            };
            next.map(|chunk| (Ok::<Bytes, Infallible>(chunk.bytes.clone()), session))
        }
    });

    (
        [
            (header::CONTENT_TYPE, STREAM_CONTENT_TYPE),
            (header::CACHE_CONTROL, "no-cache, no-store, must-revalidate"),
        ],
        Body::from_stream(parts),
    )
}

/// Health check response
#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    message: &'static str,
}

async fn health_handler() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        message: "Camera stream server is running",
    })
}

#[derive(Serialize)]
struct IndexResponse {
    name: &'static str,
    version: &'static str,
    endpoints: BTreeMap<&'static str, &'static str>,
}

async fn index_handler() -> Json<IndexResponse> {
    let endpoints = BTreeMap::from([
        ("/video_feed", "MJPEG video stream"),
        ("/health", "Health check"),
        ("/api/stats", "Relay statistics"),
    ]);

    Json(IndexResponse {
        name: "Camera Stream Server",
        version: env!("CARGO_PKG_VERSION"),
        endpoints,
    })
}

async fn stats_handler(State(state): State<AppState>) -> Json<RelayStats> {
    Json(state.monitor.stats())
}
