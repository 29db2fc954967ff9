//! WebSocket API layer.
//!
//! This module contains the thin Axum transport handler that delegates to
//! [`crate::follow::FollowPipeline`]. It provides the router construction
//! and server startup functionality.

use std::sync::Arc;

use axum::routing::get;
use axum::Router;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::bootstrap::BootstrappedServices;
use crate::follow::FollowPipeline;
use crate::rate_limiter::RateLimitRule;

pub mod ws;
pub mod ws_connection;

pub use ws_connection::WsConnectionManager;

/// Errors that can occur when starting the server.
#[derive(Debug, Error)]
pub enum ServerError {
    /// Failed to bind to a TCP port.
    #[error("failed to bind to port: {0}")]
    Bind(#[from] std::io::Error),
}

/// Shared application state for the WebSocket transport layer.
///
/// A thin wrapper that holds references to the follow pipeline and the
/// transport-level concerns (rate limiting, connection tracking, shutdown)
/// that sit outside the domain logic.
#[derive(Clone)]
pub struct AppState {
    /// The session follow pipeline — every dispatch goes through here.
    pub pipeline: FollowPipeline,
    /// Control-message rate-limit rule.
    pub control_rate_rule: RateLimitRule,
    /// Audio-frame rate-limit rule.
    pub audio_rate_rule: RateLimitRule,
    /// Tracks active connections for graceful force-close on shutdown.
    pub ws_manager: Arc<WsConnectionManager>,
    /// Cancelled on graceful shutdown; every connection's `tokio::select!`
    /// loop observes this and tears itself down.
    pub cancel_token: CancellationToken,
}

impl AppState {
    /// Builds the transport-level `AppState` from a bootstrapped services
    /// container.
    pub fn from_services(services: &BootstrappedServices) -> Self {
        Self {
            pipeline: services.pipeline.clone(),
            control_rate_rule: services.control_rate_rule,
            audio_rate_rule: services.audio_rate_rule,
            ws_manager: Arc::clone(&services.ws_manager),
            cancel_token: services.cancel_token.clone(),
        }
    }
}

fn create_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any)
        .allow_credentials(false);

    Router::new()
        .route("/", get(ws::ws_handler))
        .with_state(state)
        .layer(cors)
        .layer(TraceLayer::new_for_http())
}

/// Starts the WebSocket server bound to `bind_port`.
///
/// No port-scan fallback or mDNS advertisement step: clients connect to a
/// single, operator-known address and port.
pub async fn start_server(state: AppState, bind_port: u16) -> Result<(), ServerError> {
    let addr = std::net::SocketAddr::from(([0, 0, 0, 0], bind_port));
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    log::info!("Server listening on ws://0.0.0.0:{}", bind_port);

    let app = create_router(state);
    axum::serve(listener, app).await?;
    Ok(())
}
