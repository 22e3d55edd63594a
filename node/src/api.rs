//! # REST API
//!
//! Builds the axum router for the gateway's HTTP interface. All endpoints
//! share the [`Gateway`] through axum's `State` extractor.
//!
//! ## Endpoints
//!
//! | Method | Path                        | Description                       |
//! |--------|-----------------------------|-----------------------------------|
//! | GET    | `/health`                   | Liveness check                    |
//! | GET    | `/status`                   | Gateway status summary            |
//! | POST   | `/api/v1/transact`          | Start a transfer as client        |
//! | GET    | `/api/v1/sessions/:id`      | Session status                    |
//! | GET    | `/api/v1/approve-address`   | Account to approve before a transfer |
//! | GET    | `/metrics`                  | Prometheus metrics                |

use axum::{
    extract::{Path, Query, State},
    http::{Method, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use satp_protocol::{Gateway, SatpError, TransactRequest};

use crate::metrics;

// ---------------------------------------------------------------------------
// Application State
// ---------------------------------------------------------------------------

/// Cheap to clone, everything behind `Arc`.
#[derive(Clone)]
pub struct AppState {
    pub version: String,
    pub gateway: Arc<Gateway>,
}

// ---------------------------------------------------------------------------
// Router Construction
// ---------------------------------------------------------------------------

pub fn create_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers(Any);

    Router::new()
        .route("/health", get(health_handler))
        .route("/status", get(status_handler))
        .route("/api/v1/transact", post(transact_handler))
        .route("/api/v1/sessions/:id", get(session_handler))
        .route("/api/v1/approve-address", get(approve_address_handler))
        .route("/metrics", get(metrics_handler))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

// ---------------------------------------------------------------------------
// Response Types
// ---------------------------------------------------------------------------

/// Response payload for `GET /status`.
#[derive(Debug, Serialize, Deserialize)]
pub struct StatusResponse {
    pub version: String,
    pub satp_version: String,
    pub gateway_id: String,
    pub public_key: String,
    pub ledgers: Vec<String>,
    pub known_gateways: Vec<String>,
    pub active_sessions: usize,
    pub recovering_sessions: usize,
    pub monitor_running: bool,
    /// ISO-8601 timestamp of the response.
    pub timestamp: String,
}

/// Error body shared by every endpoint.
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
    pub kind: String,
}

#[derive(Debug, Deserialize)]
pub struct ApproveAddressQuery {
    pub network_id: String,
    #[serde(default = "default_token_type")]
    pub token_type: String,
}

fn default_token_type() -> String {
    "FUNGIBLE".to_string()
}

/// A [`SatpError`] on its way out as an HTTP response.
pub struct ApiError(pub SatpError);

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match &self.0 {
            SatpError::Validation(_) => StatusCode::BAD_REQUEST,
            SatpError::SessionNotFound(_) => StatusCode::NOT_FOUND,
            SatpError::SessionClosed { .. } => StatusCode::CONFLICT,
            SatpError::RetryExhausted { .. } | SatpError::Timeout(_) => {
                StatusCode::GATEWAY_TIMEOUT
            }
            SatpError::Transport(_)
            | SatpError::UnknownGateway(_)
            | SatpError::Rejected(_)
            | SatpError::SignatureVerification(_)
            | SatpError::Ledger(_) => StatusCode::BAD_GATEWAY,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl From<SatpError> for ApiError {
    fn from(err: SatpError) -> Self {
        Self(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            tracing::warn!(kind = self.0.kind(), "request failed: {}", self.0);
        }
        let body = ErrorResponse {
            error: self.0.to_string(),
            kind: self.0.kind().to_string(),
        };
        (status, Json(body)).into_response()
    }
}

// ---------------------------------------------------------------------------
// Handlers
// ---------------------------------------------------------------------------

/// `GET /health`: 200 while the process is alive.
async fn health_handler() -> impl IntoResponse {
    (StatusCode::OK, Json(serde_json::json!({ "status": "ok" })))
}

async fn status_handler(State(state): State<AppState>) -> impl IntoResponse {
    let gateway = &state.gateway;
    let identity = gateway.identity();
    let orchestrator = gateway.manager().orchestrator();

    let mut known_gateways: Vec<String> =
        orchestrator.known_gateways().map(|gw| gw.id.clone()).collect();
    known_gateways.sort();

    Json(StatusResponse {
        version: state.version.clone(),
        satp_version: satp_protocol::config::SATP_VERSION.to_string(),
        gateway_id: identity.id.clone(),
        public_key: identity.pubkey.to_hex(),
        ledgers: gateway.manager().ledgers().registry().ledger_ids(),
        known_gateways,
        active_sessions: gateway.manager().active_session_count(),
        recovering_sessions: gateway.crash_manager().tracked_sessions().len(),
        monitor_running: gateway.monitor().is_running(),
        timestamp: chrono::Utc::now().to_rfc3339(),
    })
}

/// `POST /api/v1/transact`: runs the transfer to completion before
/// answering.
async fn transact_handler(
    State(state): State<AppState>,
    Json(request): Json<TransactRequest>,
) -> Result<Response, ApiError> {
    let response = state.gateway.transact(request).await?;
    Ok((StatusCode::OK, Json(response)).into_response())
}

async fn session_handler(
    Path(session_id): Path<String>,
    State(state): State<AppState>,
) -> Result<Response, ApiError> {
    let status = state.gateway.session_status(&session_id)?;
    Ok(Json(status).into_response())
}

async fn approve_address_handler(
    Query(query): Query<ApproveAddressQuery>,
    State(state): State<AppState>,
) -> Result<Response, ApiError> {
    let response = state
        .gateway
        .get_approve_address(&query.network_id, &query.token_type)
        .await?;
    Ok(Json(response).into_response())
}

async fn metrics_handler(State(state): State<AppState>) -> Response {
    metrics::render(state.gateway.monitor())
}
