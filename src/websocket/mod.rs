//! WebSocket connection handling.
//!
//! The front door: accept upgrades, gate on total capacity, wait for the
//! first framed message to learn the target map, then hand the connection
//! off to the room manager.

mod connection;

use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::ws::WebSocketUpgrade;
use axum::extract::{ConnectInfo, State};
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::manager::RoomManager;
use crate::metrics::NodeMetrics;

pub use connection::{OUTBOUND_QUEUE_WATERMARK, PENDING_TIMEOUT};

#[derive(Clone)]
pub struct AppState {
    pub manager: Arc<RoomManager>,
    pub metrics: Arc<NodeMetrics>,
    /// Hard cap on concurrent clients across all rooms.
    pub max_players: usize,
}

pub fn create_router() -> Router<AppState> {
    Router::new()
        .route("/ws", get(ws_handler))
        .route("/healthz", get(healthz))
        .fallback(banner)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
}

async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| connection::handle_socket(socket, state, addr))
}

async fn healthz() -> &'static str {
    "ok"
}

async fn banner() -> &'static str {
    "Scene Sync Node. Use /ws for the client protocol."
}
