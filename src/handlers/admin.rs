//! Admin dashboard endpoints.
//!
//! Every route here requires an administrator. Privileged routes are
//! audited by the pipeline, so handlers do not write records themselves.

use axum::Json;
use axum::extract::{Query, State};
use serde_json::{Value, json};
use tracing::{info, instrument};

use crate::error::AppResult;
use crate::models::{AuditLogQuery, AuditLogResponse, RotateSecretResponse};
use crate::state::AppState;

/// Largest audit log page served at once.
const MAX_AUDIT_PAGE: usize = 500;

pub async fn admin_info() -> Json<Value> {
    Json(json!({
        "message": "Admin API",
        "endpoints": [
            "GET /admin/audit-log - Recent audit records (newest first)",
            "POST /admin/session-secret/rotate - Rotate the session secret",
        ],
    }))
}

/// Page through the audit log, newest first.
#[instrument(skip(state))]
pub async fn audit_log(
    State(state): State<AppState>,
    Query(query): Query<AuditLogQuery>,
) -> AppResult<Json<AuditLogResponse>> {
    let limit = query.limit.clamp(1, MAX_AUDIT_PAGE);
    let records = state.audit.recent(limit, query.offset).await?;

    Ok(Json(AuditLogResponse {
        count: records.len(),
        records,
    }))
}

/// Install a fresh random session secret.
///
/// Every existing admin session, the caller's included, is revoked.
#[instrument(skip(state))]
pub async fn rotate_session_secret(State(state): State<AppState>) -> AppResult<Json<RotateSecretResponse>> {
    let sessions = state.gatekeeper.sessions();
    let secret_version = sessions.rotate_random_secret()?;
    info!(secret_version, "Admin session secret rotated");

    Ok(Json(RotateSecretResponse {
        secret_version,
        remaining_sessions: sessions.session_count(),
    }))
}
