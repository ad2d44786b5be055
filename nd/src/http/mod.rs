//! HTTP adapter - thin REST + SSE surface over the facade
//!
//! Handlers parse the request, call the facade, and map domain errors onto
//! status codes. No orchestration logic lives here.

pub mod routes;
pub mod sse;

use std::future::Future;

use axum::Router;
use eyre::{Context, Result};
use tracing::info;

use crate::facade::Deps;

/// Build the router with all endpoints
pub fn router(deps: Deps) -> Router {
    routes::router(deps)
}

/// Serve the HTTP adapter until the process exits
pub async fn serve(deps: Deps, bind: &str) -> Result<()> {
    serve_until(deps, bind, std::future::pending()).await
}

/// Serve the HTTP adapter until `shutdown` resolves
pub async fn serve_until(deps: Deps, bind: &str, shutdown: impl Future<Output = ()> + Send + 'static) -> Result<()> {
    let app = router(deps);
    let listener = tokio::net::TcpListener::bind(bind)
        .await
        .context(format!("cannot bind {bind}"))?;
    info!(%bind, "http adapter listening");
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await
        .context("http server failed")?;
    Ok(())
}
