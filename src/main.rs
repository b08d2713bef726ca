#![forbid(unsafe_code)]

use anyhow::Result;
use parley::metrics::HubMetrics;
use parley::room::RoomRegistry;
use parley::signaling::gateway::ConnRegistry;
use parley::signaling::SignalingHub;
use parley::store::MeetingStore;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "parley=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Parley - starting signaling hub");

    // Identity resolution is mandatory: every connection is bound to an
    // authenticated user before any event is dispatched.
    let jwt_secret = std::env::var("JWT_SECRET").map_err(|_| {
        anyhow::anyhow!("JWT_SECRET must be set; the hub does not accept unauthenticated connections")
    })?;

    // Meeting store is optional (DATABASE_URL)
    let store = MeetingStore::connect().await?;
    if store.is_enabled() {
        info!("Meeting store enabled");
    }

    let metrics = HubMetrics::new();
    let conns = ConnRegistry::new();
    let registry = Arc::new(RoomRegistry::new(conns, store, metrics.clone()));

    // Once-per-minute sweep of expired pending join requests
    let sweeper = registry.spawn_sweeper();

    let hub = SignalingHub::new(registry.clone(), metrics, jwt_secret);
    let port: u16 = std::env::var("PORT")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(3000);

    // Run server with graceful shutdown
    tokio::select! {
        result = hub.serve(port) => {
            if let Err(e) = result {
                tracing::error!("Signaling hub error: {}", e);
            }
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Received Ctrl+C, shutting down...");
            registry.shutdown().await;
        }
    }

    sweeper.abort();
    info!("Hub shutdown complete");
    Ok(())
}
