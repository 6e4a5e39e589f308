//! HTTP API
//!
//! JSON endpoints for deployment, onboarding and service control. Deployments
//! answer with a `text/event-stream` of [`DeployEvent`](rc_protocol::DeployEvent)s.

mod error;
mod routes;
mod sse;

pub use error::ApiError;
pub use sse::{event_stream, to_sse};

use std::future::IntoFuture;
use std::sync::Arc;

use axum::routing::{get, post};
use axum::Router;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use crate::state::AppState;

/// Build the API router
pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/api/deploy", post(routes::deploy))
        .route("/api/tunnels", get(routes::list_tunnels))
        .route(
            "/api/instances/:name/setup",
            post(routes::start_setup).delete(routes::stop_setup),
        )
        .route(
            "/api/instances/:name/setup/complete",
            post(routes::complete_setup),
        )
        .route("/api/instances/:name/tunnel", get(routes::tunnel_status))
        .route(
            "/api/instances/:name/service",
            get(routes::service_status).post(routes::service_action),
        )
        .with_state(state)
}

/// Serve the API on `listener` until `cancel` fires
///
/// Tunnels are torn down as soon as `cancel` fires. Open event streams then
/// get `shutdown_grace` to finish before the server stops waiting for them.
pub async fn serve(
    listener: TcpListener,
    state: Arc<AppState>,
    cancel: CancellationToken,
) -> std::io::Result<()> {
    let addr = listener.local_addr()?;
    tracing::info!("Dashboard API listening on http://{}", addr);

    let grace = state.config.shutdown_grace;
    let tunnels = state.tunnels.clone();
    let signal = cancel.clone();
    let server = axum::serve(listener, router(state))
        .with_graceful_shutdown(async move {
            signal.cancelled().await;
            tunnels.shutdown().await;
        })
        .into_future();

    let deadline = async {
        cancel.cancelled().await;
        tokio::time::sleep(grace).await;
    };

    tokio::select! {
        result = server => result,
        () = deadline => {
            tracing::warn!(
                "Open connections did not finish within {}s, closing",
                grace.as_secs_f64()
            );
            Ok(())
        }
    }
}
