//! Health and readiness endpoints.
//!
//! # Endpoints
//!
//! - `GET /health` - Always 200, with key availability in the body
//! - `GET /ready` - 503 until a verification key set is available
//!
//! Both are exempt from rate limiting by default
//! (`RATE_LIMIT_EXEMPT_PATHS`).

use axum::Json;
use axum::extract::State;
use axum::http::StatusCode;
use chrono::Utc;
use tracing::instrument;

use crate::models::HealthResponse;
use crate::state::AppState;

/// Health check endpoint.
///
/// # Response Body
///
/// ```json
/// {
///   "status": "healthy",
///   "keys_ready": true,
///   "version": "0.1.0",
///   "uptime_seconds": 42,
///   "timestamp": "2026-01-15T10:30:00Z"
/// }
/// ```
#[instrument(skip(state))]
pub async fn health_check(State(state): State<AppState>) -> Json<HealthResponse> {
    let keys_ready = state.is_ready();

    Json(HealthResponse {
        status: if keys_ready { "healthy" } else { "degraded" }.to_string(),
        keys_ready,
        version: env!("CARGO_PKG_VERSION").to_string(),
        uptime_seconds: state.uptime_seconds(),
        timestamp: Utc::now(),
    })
}

/// Readiness check endpoint for load balancer and Kubernetes probes.
///
/// With a JWKS key source the service is not ready until the identity
/// provider's keys have been fetched once.
#[instrument(skip(state))]
pub async fn readiness_check(State(state): State<AppState>) -> Result<StatusCode, StatusCode> {
    if state.is_ready() {
        Ok(StatusCode::OK)
    } else {
        Err(StatusCode::SERVICE_UNAVAILABLE)
    }
}
