//! beacond: notification gateway server.

use std::sync::Arc;

use beacond::config::Config;
use beacond::{lifecycle, routes, state};
use tracing::{info, warn};

#[tokio::main]
async fn main() -> std::io::Result<()> {
    // Load .env if present (local dev).
    let _ = dotenvy::dotenv();

    let config = Config::from_env();

    // Tracing.
    if config.json_logs {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(&config.log_level)
            .with_target(true)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(&config.log_level)
            .with_target(true)
            .init();
    }

    info!("beacond starting");
    info!(listen = %config.listen_addr, instance = %config.server_instance);

    if config.jwt_secret.is_none() {
        warn!("JWT_SECRET not set, every connection will be anonymous");
    }
    if config.producer_key.is_none() {
        warn!("PRODUCER_KEY not set, producer endpoints are disabled");
    }

    // ── Shared state ────────────────────────────────────────
    let state = state::AppState::new(config.clone());

    // ── Background tasks ────────────────────────────────────
    // Deadline scanning needs a project store; embedders call
    // lifecycle::spawn_deadline_scan with their own source.
    lifecycle::spawn_heartbeat(Arc::clone(&state));

    // ── Bind & serve ────────────────────────────────────────
    let app = routes::build_router(state);
    let listener = tokio::net::TcpListener::bind(&config.listen_addr).await?;

    info!(addr = %config.listen_addr, "beacond listening");

    axum::serve(listener, app).await
}
