//! sealdex-gateway — HTTP control plane for the encrypted search service
//!
//! Bearer-token authenticated JSON API over axum. Every route except
//! `/health` resolves the bearer key to a client record before touching
//! storage, so tenant isolation is enforced at the door.

pub mod auth;
pub mod config;
pub mod error;
pub mod ratelimit;
pub mod routes;
pub mod state;

use anyhow::{Context, Result};
use tracing::info;

pub use config::GatewayConfig;
pub use state::AppState;

/// Bind and serve until the process is stopped.
pub async fn serve(config: GatewayConfig) -> Result<()> {
    let bind = config.bind.clone();
    let state = AppState::new(config).context("Failed to initialize gateway state")?;
    let app = routes::router(state);

    let listener = tokio::net::TcpListener::bind(&bind)
        .await
        .with_context(|| format!("Failed to bind {bind}"))?;
    info!("sealdex gateway listening on {}", bind);

    axum::serve(listener, app)
        .await
        .context("HTTP server exited")?;
    Ok(())
}
