// src/api/mod.rs

//! HTTP control API (axum).

pub mod error;
pub mod routes;
pub mod sse;

use std::net::SocketAddr;

use axum::Router;
use tokio_util::sync::CancellationToken;
use tower_http::cors::{Any, CorsLayer};
use tracing::info;

use crate::app::App;
use crate::errors::Result;

pub use error::{ApiError, ApiResult};

/// The full application router with CORS and state attached.
pub fn build_router(app: App) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    routes::api_router().layer(cors).with_state(app)
}

/// Serve the API on `addr` until `shutdown` is cancelled.
pub async fn serve(app: App, addr: SocketAddr, shutdown: CancellationToken) -> Result<()> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(addr = %listener.local_addr()?, "control api listening");

    axum::serve(listener, build_router(app))
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await?;
    Ok(())
}
