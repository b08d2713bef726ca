#![forbid(unsafe_code)]

// Signaling hub server - WebSocket transport plus health/metrics endpoints

pub mod connection;
pub mod gateway;
pub mod protocol;

use crate::auth::jwt;
use crate::metrics::HubMetrics;
use crate::room::relay::MAX_SIGNAL_PAYLOAD_BYTES;
use crate::room::RoomRegistry;
use axum::{
    extract::{ws::WebSocketUpgrade, Query, State},
    http::{HeaderMap, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use serde::Deserialize;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tower_http::cors::CorsLayer;
use tracing::{info, warn};

/// Headroom over the relay payload cap so an oversized payload arrives as a
/// parseable frame and gets a proper error instead of a hard close.
const WS_MAX_MESSAGE_SIZE: usize = MAX_SIGNAL_PAYLOAD_BYTES + 8 * 1024;

/// Signaling hub state
#[derive(Clone)]
pub struct SignalingHub {
    registry: Arc<RoomRegistry>,
    metrics: HubMetrics,
    jwt_secret: Arc<String>,
    connection_semaphore: Arc<Semaphore>,
}

impl SignalingHub {
    /// Creates a new signaling hub
    pub fn new(registry: Arc<RoomRegistry>, metrics: HubMetrics, jwt_secret: String) -> Self {
        let mut max_connections: usize = std::env::var("MAX_CONNECTIONS")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(10_000);
        if max_connections == 0 {
            warn!("MAX_CONNECTIONS=0 would reject all connections, using default 10000");
            max_connections = 10_000;
        }
        info!("Max connections: {}", max_connections);

        Self {
            registry,
            metrics,
            jwt_secret: Arc::new(jwt_secret),
            connection_semaphore: Arc::new(Semaphore::new(max_connections)),
        }
    }

    /// Creates the Axum router for the hub
    pub fn router(self) -> Router {
        let cors = match std::env::var("ALLOWED_ORIGIN") {
            Ok(origin) => match origin.parse::<HeaderValue>() {
                Ok(value) => {
                    info!("CORS restricted to origin {}", origin);
                    CorsLayer::new()
                        .allow_origin(value)
                        .allow_methods(tower_http::cors::Any)
                        .allow_headers(tower_http::cors::Any)
                }
                Err(_) => {
                    warn!("Invalid ALLOWED_ORIGIN value, falling back to permissive CORS");
                    CorsLayer::permissive()
                }
            },
            Err(_) => CorsLayer::permissive(),
        };

        Router::new()
            .route("/ws", get(ws_handler))
            .route("/health", get(health_handler))
            .route("/metrics", get(metrics_handler))
            .with_state(self)
            .layer(cors)
    }

    /// Starts the hub on the specified port
    ///
    /// # Errors
    /// Returns an error if the server fails to bind to the port
    pub async fn serve(self, port: u16) -> anyhow::Result<()> {
        let addr = format!("0.0.0.0:{port}");
        info!("Starting signaling hub on {}", addr);

        let listener = tokio::net::TcpListener::bind(&addr).await?;
        let app = self.router();

        axum::serve(listener, app).await?;

        Ok(())
    }
}

#[derive(Deserialize)]
struct WsQuery {
    token: Option<String>,
}

/// Health check handler
async fn health_handler(State(hub): State<SignalingHub>) -> Json<serde_json::Value> {
    let rooms = hub.registry.room_count();
    let participants = hub.registry.total_participant_count().await;
    Json(serde_json::json!({
        "status": "ok",
        "rooms": rooms,
        "participants": participants,
    }))
}

/// Metrics handler — Prometheus text exposition format.
/// Protected by optional METRICS_TOKEN env var (Bearer auth).
async fn metrics_handler(State(hub): State<SignalingHub>, headers: HeaderMap) -> Response {
    if let Ok(expected) = std::env::var("METRICS_TOKEN") {
        let provided = headers
            .get("authorization")
            .and_then(|v| v.to_str().ok())
            .unwrap_or("");
        if provided != format!("Bearer {}", expected) {
            return StatusCode::UNAUTHORIZED.into_response();
        }
    }

    let rooms = hub.registry.room_count();
    let participants = hub.registry.total_participant_count().await;
    let body = hub.metrics.render_prometheus(rooms, participants);
    (
        StatusCode::OK,
        [("content-type", "text/plain; version=0.0.4; charset=utf-8")],
        body,
    )
        .into_response()
}

/// WebSocket upgrade handler. Resolves the bearer token to an identity
/// before the socket exists; unauthenticated upgrades never reach the hub.
async fn ws_handler(
    ws: WebSocketUpgrade,
    Query(query): Query<WsQuery>,
    headers: HeaderMap,
    State(hub): State<SignalingHub>,
) -> Response {
    let token = query.token.or_else(|| {
        headers
            .get("authorization")
            .and_then(|v| v.to_str().ok())
            .and_then(|h| h.strip_prefix("Bearer "))
            .map(str::to_string)
    });
    let Some(token) = token else {
        return (StatusCode::UNAUTHORIZED, "Missing bearer token").into_response();
    };

    let identity = match jwt::resolve_identity(&token, &hub.jwt_secret) {
        Ok(identity) => identity,
        Err(e) => {
            warn!("Rejected WebSocket upgrade: {}", e);
            return (StatusCode::UNAUTHORIZED, "Invalid bearer token").into_response();
        }
    };

    // Acquire connection permit (non-blocking)
    let permit = match hub.connection_semaphore.clone().try_acquire_owned() {
        Ok(permit) => permit,
        Err(_) => {
            warn!("Connection limit reached, rejecting WebSocket upgrade");
            return (StatusCode::SERVICE_UNAVAILABLE, "Too many connections").into_response();
        }
    };

    ws.max_message_size(WS_MAX_MESSAGE_SIZE)
        .on_failed_upgrade(|error| {
            warn!("WebSocket upgrade failed: {}", error);
        })
        .on_upgrade(move |socket| {
            connection::handle_connection(socket, hub.registry, hub.metrics, identity, permit)
        })
}
