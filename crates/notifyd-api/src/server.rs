//! Axum server wiring and graceful shutdown.

use std::{net::SocketAddr, sync::Arc, time::Duration};

use axum::{
    routing::{get, post},
    Router,
};
use notifyd_core::{storage::Storage, Clock};
use tower_http::{timeout::TimeoutLayer, trace::TraceLayer};
use tracing::info;

use crate::{config::Config, handlers, AppState};

/// Builds the router with all routes and middleware.
pub fn create_router(storage: Storage, config: Arc<Config>, clock: Arc<dyn Clock>) -> Router {
    let request_timeout = Duration::from_secs(config.server.request_timeout);
    let state = AppState { storage, config, clock };

    Router::new()
        .route("/v1/notify", post(handlers::create_notification))
        .route("/v1/notify/{task_id}", get(handlers::get_notification))
        .route("/v1/notify/{task_id}/cancel", post(handlers::cancel_notification))
        .route("/health", get(handlers::health_check))
        .layer(TimeoutLayer::new(request_timeout))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Binds and serves until a shutdown signal arrives.
///
/// # Errors
///
/// Returns `std::io::Error` when the port is unavailable or the listener
/// fails.
pub async fn start_server(
    storage: Storage,
    config: Arc<Config>,
    clock: Arc<dyn Clock>,
    addr: SocketAddr,
) -> Result<(), std::io::Error> {
    let app = create_router(storage, config, clock);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(addr = %listener.local_addr()?, "HTTP server listening");

    axum::serve(listener, app).with_graceful_shutdown(shutdown_signal()).await?;

    info!("HTTP server stopped");
    Ok(())
}

/// Resolves on CTRL+C or SIGTERM.
pub async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "failed to install Ctrl+C handler");
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            },
            Err(e) => {
                tracing::error!(error = %e, "failed to install SIGTERM handler");
            },
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {
            info!("received CTRL+C, starting graceful shutdown");
        },
        () = terminate => {
            info!("received SIGTERM, starting graceful shutdown");
        },
    }
}
