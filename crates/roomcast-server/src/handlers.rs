//! HTTP routes for the roomcast server.
//!
//! `/` serves the chat page, `/ws` upgrades to a WebSocket and hands it to a
//! [`ConnectionEndpoint`], `/health` reports liveness.

use crate::config::Config;
use crate::metrics;
use anyhow::{Context, Result};
use axum::{
    extract::{ws::WebSocket, ConnectInfo, State, WebSocketUpgrade},
    response::{Html, IntoResponse},
    routing::get,
    Router,
};
use roomcast_core::metrics::ConnectionMetricsGuard;
use roomcast_core::{Bus, BusBridge, ConnectionEndpoint, LocalBus, RoomRegistry};
use roomcast_transport::{AxumConnection, Connection};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{debug, error, info};

const BUNDLED_HOME_PAGE: &str = include_str!("../static/home.html");

/// Shared server state.
pub struct AppState {
    /// Room membership for this process.
    pub registry: Arc<RoomRegistry>,
    /// Bus bridge shared by every connection.
    pub bridge: Arc<BusBridge>,
    /// Server configuration.
    pub config: Config,
    home_page: String,
}

impl AppState {
    /// Create new app state on top of a bus.
    ///
    /// # Errors
    ///
    /// Returns an error if a configured home page cannot be read.
    pub fn new(config: Config, bus: Arc<dyn Bus>) -> Result<Self> {
        let home_page = match &config.transport.home_page {
            Some(path) => std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read home page: {}", path.display()))?,
            None => BUNDLED_HOME_PAGE.to_string(),
        };

        let registry = Arc::new(RoomRegistry::new());
        let bridge = Arc::new(BusBridge::new(
            bus,
            Arc::clone(&registry),
            config.bridge_config(),
        ));

        Ok(Self {
            registry,
            bridge,
            config,
            home_page,
        })
    }
}

/// Build the HTTP router.
pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/", get(home_handler))
        .route(&state.config.transport.websocket_path, get(ws_handler))
        .route("/health", get(health_handler))
        .with_state(state)
}

/// Run the HTTP/WebSocket server.
///
/// # Errors
///
/// Returns an error if the bus subscription cannot be established or the
/// listener cannot be bound.
pub async fn run_server(config: Config) -> Result<()> {
    let bus = Arc::new(LocalBus::with_capacity(config.bus.capacity));
    info!(bus = bus.name(), topic = %config.bus.topic, "Using bus");

    let state = Arc::new(AppState::new(config.clone(), bus)?);

    // No room traffic can be served without the subscription
    Arc::clone(&state.bridge)
        .start()
        .await
        .context("Failed to subscribe to the bus")?;

    if config.metrics.enabled {
        if let Err(e) = metrics::start_metrics_server(config.metrics.port) {
            error!("Failed to start metrics server: {:#}", e);
        }
    }

    let app = router(state);

    let addr = config.bind_addr()?;
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind {}", addr))?;

    info!("Roomcast server listening on {}", addr);
    info!(
        "WebSocket endpoint: ws://{}{}",
        addr, config.transport.websocket_path
    );

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .await?;

    Ok(())
}

/// Home page handler.
async fn home_handler(State(state): State<Arc<AppState>>) -> Html<String> {
    Html(state.home_page.clone())
}

/// Health check handler.
async fn health_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let stats = state.registry.stats();
    axum::Json(serde_json::json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "rooms": stats.room_count,
        "connections": stats.connection_count,
        "memberships": stats.total_memberships
    }))
}

/// WebSocket upgrade handler.
///
/// Frames above the configured limit are refused from their header.
async fn ws_handler(
    ws: WebSocketUpgrade,
    ConnectInfo(remote): ConnectInfo<SocketAddr>,
    State(state): State<Arc<AppState>>,
) -> impl IntoResponse {
    let limit = state.config.limits.max_frame_size;
    ws.max_message_size(limit)
        .max_frame_size(limit)
        .on_upgrade(move |socket| handle_websocket(socket, remote, state))
}

/// Run one upgraded WebSocket until it closes.
async fn handle_websocket(socket: WebSocket, remote: SocketAddr, state: Arc<AppState>) {
    let _metrics_guard = ConnectionMetricsGuard::new();

    let connection = AxumConnection::new(socket, state.config.limits.max_frame_size)
        .with_remote_addr(remote.to_string());
    debug!(connection = %connection.id(), remote = %remote, "WebSocket connected");

    let endpoint = ConnectionEndpoint::new(
        Box::new(connection),
        Arc::clone(&state.registry),
        Arc::clone(&state.bridge),
        state.config.endpoint_config(),
    );

    // The endpoint logs its own outcome
    let _ = endpoint.run().await;
}
