//! # Prometheus Metrics
//!
//! Renders the gateway's [`GatewayMonitor`] registry in the Prometheus text
//! format. Served at `/metrics` on both the API port and the dedicated
//! metrics port.

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use std::sync::Arc;

use satp_protocol::monitor::GatewayMonitor;

pub type SharedMonitor = Arc<GatewayMonitor>;

pub fn render(monitor: &GatewayMonitor) -> Response {
    match monitor.encode() {
        Ok(body) => (
            StatusCode::OK,
            [("content-type", "text/plain; version=0.0.4; charset=utf-8")],
            body,
        )
            .into_response(),
        Err(e) => {
            tracing::error!("failed to encode metrics: {}", e);
            (StatusCode::INTERNAL_SERVER_ERROR, "metrics encoding failed").into_response()
        }
    }
}

/// Handler for the standalone metrics router.
pub async fn metrics_handler(State(monitor): State<SharedMonitor>) -> Response {
    render(&monitor)
}
