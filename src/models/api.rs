use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::audit::AuditRecord;
use crate::auth::{Identity, IdentityClaim};

/// Health check response.
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    /// "healthy" when verification keys are available, "degraded" otherwise
    pub status: String,
    pub keys_ready: bool,
    pub version: String,
    pub uptime_seconds: u64,
    pub timestamp: DateTime<Utc>,
}

/// `GET /auth` response.
#[derive(Debug, Serialize)]
pub struct AuthInfoResponse {
    pub service: &'static str,
    pub version: &'static str,
    pub endpoints: Vec<&'static str>,
}

/// Caller as seen by the identity endpoints.
#[derive(Debug, Serialize)]
pub struct UserInfo {
    pub id: String,
    pub email: Option<String>,
    pub email_verified: bool,
    pub role: Option<String>,
    /// "bearer" or "admin_session"
    pub via: &'static str,
}

impl From<&Identity> for UserInfo {
    fn from(identity: &Identity) -> Self {
        match identity {
            Identity::External(claim) => Self {
                id: claim.subject.clone(),
                email: claim.email.clone(),
                email_verified: claim.email_verified,
                role: claim.role.clone(),
                via: "bearer",
            },
            Identity::Admin(session) => Self {
                id: session.admin.subject.clone(),
                email: Some(session.admin.email.clone()),
                email_verified: true,
                role: Some(crate::auth::policy::ADMIN_ROLE.to_string()),
                via: "admin_session",
            },
        }
    }
}

/// `GET /auth/me` response.
#[derive(Debug, Serialize)]
pub struct MeResponse {
    pub user: UserInfo,
    pub authenticated: bool,
}

/// `GET /auth/verify` response.
#[derive(Debug, Serialize)]
pub struct VerifyResponse {
    pub valid: bool,
    pub user_id: String,
    pub email: Option<String>,
    pub expires_at: DateTime<Utc>,
}

impl From<&IdentityClaim> for VerifyResponse {
    fn from(claim: &IdentityClaim) -> Self {
        Self {
            valid: true,
            user_id: claim.subject.clone(),
            email: claim.email.clone(),
            expires_at: claim.expires_at,
        }
    }
}

/// `GET /auth/is-admin` response.
#[derive(Debug, Serialize)]
pub struct IsAdminResponse {
    pub is_admin: bool,
    pub user_id: String,
    pub email: Option<String>,
}

/// Current admin session, as reported by `GET /auth/session`.
#[derive(Debug, Serialize)]
pub struct SessionInfoResponse {
    pub authenticated: bool,
    /// Log-safe prefix of the session id
    pub session: String,
    pub email: String,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub secret_version: u32,
}

/// `POST /auth/session` response.
///
/// The token is also set as an `HttpOnly` cookie; it is returned in the body
/// for clients that send it in `X-Admin-Session` instead.
#[derive(Debug, Serialize)]
pub struct LoginResponse {
    pub message: &'static str,
    pub token: String,
    pub expires_at: DateTime<Utc>,
}

/// `DELETE /auth/session` response.
#[derive(Debug, Serialize)]
pub struct LogoutResponse {
    pub revoked: bool,
}

/// `POST /admin/session-secret/rotate` response.
#[derive(Debug, Serialize)]
pub struct RotateSecretResponse {
    pub secret_version: u32,
    pub remaining_sessions: usize,
}

/// Paging for `GET /admin/audit-log`.
#[derive(Debug, Deserialize)]
pub struct AuditLogQuery {
    #[serde(default = "default_audit_limit")]
    pub limit: usize,
    #[serde(default)]
    pub offset: usize,
}

fn default_audit_limit() -> usize {
    100
}

/// `GET /admin/audit-log` response, newest first.
#[derive(Debug, Serialize)]
pub struct AuditLogResponse {
    pub records: Vec<AuditRecord>,
    pub count: usize,
}
