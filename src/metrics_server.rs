// src/metrics_server.rs

//! Exposes the process's Prometheus metrics over HTTP on `/metrics`. The
//! core itself has no dynamic gauges to refresh on scrape (unlike a data
//! server tracking live memory/replication state); `gather_metrics` already
//! reflects the counters and gauges the signal controller, supervisor, pool
//! manager, and HA watchers update as they run.

use std::net::SocketAddr;

use axum::{Router, http::StatusCode, response::IntoResponse, routing::get};
use tokio::sync::broadcast;
use tracing::{error, info};

use crate::core::metrics::gather_metrics;

async fn metrics_handler() -> impl IntoResponse {
    let body = gather_metrics();
    (
        StatusCode::OK,
        [("content-type", "text/plain; version=0.0.4")],
        body,
    )
}

/// Serves `/metrics` on `0.0.0.0:<port>` until `shutdown_rx` fires.
pub async fn run_metrics_server(port: u16, mut shutdown_rx: broadcast::Receiver<()>) {
    let app = Router::new().route("/metrics", get(metrics_handler));

    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    info!("metrics server listening on http://{addr}/metrics");

    let listener = match tokio::net::TcpListener::bind(addr).await {
        Ok(l) => l,
        Err(e) => {
            error!(port, error = %e, "failed to bind metrics server");
            return;
        }
    };

    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            shutdown_rx.recv().await.ok();
            info!("metrics server shutting down");
        })
        .await
        .ok();
}
