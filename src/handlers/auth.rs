//! Identity and admin session endpoints.
//!
//! # Endpoints
//!
//! - `GET /auth` - Endpoint listing (public)
//! - `GET /auth/me` - Caller identity
//! - `GET /auth/verify` - Validity of the presented credential
//! - `GET /auth/is-admin` - Succeeds only for administrators
//! - `GET /auth/session` - Current admin session
//! - `POST /auth/session` - Exchange an admin's bearer token for a session
//! - `DELETE /auth/session` - Revoke the current session
//!
//! The pipeline has already authenticated the caller; handlers read the
//! result from `Extension<Identity>`. Login and logout write their own audit
//! records because they are one action each, whatever the route policy.

use axum::Json;
use axum::extract::{Extension, State};
use axum::http::HeaderMap;
use axum::http::header::SET_COOKIE;
use axum::response::IntoResponse;
use tracing::{info, instrument, warn};

use super::util::{cleared_cookie, request_id, session_cookie};
use crate::audit::{AuditEntry, AuditOutcome};
use crate::auth::session::short_id;
use crate::auth::{AdminIdentity, AuthError, Identity};
use crate::error::{AppError, AppResult};
use crate::models::{
    AuthInfoResponse, IsAdminResponse, LoginResponse, LogoutResponse, MeResponse,
    SessionInfoResponse, UserInfo, VerifyResponse,
};
use crate::state::AppState;

const SESSION_TARGET: &str = "/auth/session";
const LOGIN_ACTION: &str = "session.create";
const LOGOUT_ACTION: &str = "session.revoke";

/// List the authentication endpoints.
pub async fn auth_info() -> Json<AuthInfoResponse> {
    Json(AuthInfoResponse {
        service: "portal_guard",
        version: env!("CARGO_PKG_VERSION"),
        endpoints: vec![
            "GET /auth/me - Current identity",
            "GET /auth/verify - Verify the presented credential",
            "GET /auth/is-admin - Check administrator privileges",
            "GET /auth/session - Current admin session",
            "POST /auth/session - Create an admin session from a bearer token",
            "DELETE /auth/session - Revoke the current admin session",
        ],
    })
}

#[instrument(skip_all)]
pub async fn me(Extension(identity): Extension<Identity>) -> Json<MeResponse> {
    Json(MeResponse {
        user: UserInfo::from(&identity),
        authenticated: true,
    })
}

#[instrument(skip_all)]
pub async fn verify(Extension(identity): Extension<Identity>) -> Json<VerifyResponse> {
    Json(match &identity {
        Identity::External(claim) => VerifyResponse::from(claim),
        Identity::Admin(session) => VerifyResponse {
            valid: true,
            user_id: session.admin.subject.clone(),
            email: Some(session.admin.email.clone()),
            expires_at: session.expires_at,
        },
    })
}

/// Reached only by administrators; the pipeline rejects everyone else.
#[instrument(skip_all)]
pub async fn is_admin(Extension(identity): Extension<Identity>) -> Json<IsAdminResponse> {
    let user = UserInfo::from(&identity);
    Json(IsAdminResponse {
        is_admin: true,
        user_id: user.id,
        email: user.email,
    })
}

#[instrument(skip_all)]
pub async fn session_info(Extension(identity): Extension<Identity>) -> AppResult<Json<SessionInfoResponse>> {
    let Identity::Admin(session) = identity else {
        return Err(AppError::NotFound("No admin session on this request".to_string()));
    };

    Ok(Json(SessionInfoResponse {
        authenticated: true,
        session: short_id(&session.id).to_string(),
        email: session.admin.email,
        created_at: session.created_at,
        expires_at: session.expires_at,
        secret_version: session.secret_version,
    }))
}

/// Admin login.
///
/// The caller's verified bearer identity must be an administrator. The new
/// session is only handed out once its audit record is persisted; if that
/// fails the session is revoked again and the request fails with 503.
#[instrument(skip_all)]
pub async fn create_session(
    State(state): State<AppState>,
    headers: HeaderMap,
    Extension(identity): Extension<Identity>,
) -> AppResult<impl IntoResponse> {
    let actor = identity.actor();
    let request_id = request_id(&headers);

    let claim = match identity {
        Identity::External(claim) => claim,
        Identity::Admin(_) => {
            return Err(AppError::BadRequest(
                "Admin login requires a bearer token".to_string(),
            ));
        }
    };

    if !state.admins.is_admin(&claim) {
        warn!(actor = %actor, "Admin login refused: not an administrator");
        state
            .audit
            .record(
                AuditEntry::new(&actor, LOGIN_ACTION, SESSION_TARGET, AuditOutcome::Denied)
                    .with_detail("not an administrator")
                    .with_request_id(request_id),
            )
            .await?;
        return Err(AuthError::Unauthorized.into());
    }

    let sessions = state.gatekeeper.sessions();
    let admin = AdminIdentity {
        email: claim.email.clone().unwrap_or_else(|| claim.subject.clone()),
        subject: claim.subject,
    };
    let issued = sessions.create_session(admin)?;
    let session_id = short_id(&issued.session.id).to_string();

    let entry = AuditEntry::new(&actor, LOGIN_ACTION, SESSION_TARGET, AuditOutcome::Success)
        .with_detail(format!("session {session_id}"))
        .with_request_id(request_id);
    if let Err(e) = state.audit.record(entry).await {
        sessions.revoke_session(&issued.session.id);
        return Err(e.into());
    }

    let cookie = session_cookie(state.gatekeeper.cookie_name(), &issued.token, sessions.ttl())?;
    info!(actor = %actor, session_id = %session_id, "Admin session created");

    Ok((
        [(SET_COOKIE, cookie)],
        Json(LoginResponse {
            message: "Admin session created",
            token: issued.token,
            expires_at: issued.session.expires_at,
        }),
    ))
}

/// Admin logout. Always clears the cookie; revokes only when the request
/// was authenticated by a session.
#[instrument(skip_all)]
pub async fn delete_session(
    State(state): State<AppState>,
    headers: HeaderMap,
    Extension(identity): Extension<Identity>,
) -> AppResult<impl IntoResponse> {
    let cleared = cleared_cookie(state.gatekeeper.cookie_name())?;

    let Identity::Admin(session) = &identity else {
        return Ok(([(SET_COOKIE, cleared)], Json(LogoutResponse { revoked: false })));
    };

    let revoked = state.gatekeeper.sessions().revoke_session(&session.id);
    let entry = AuditEntry::new(identity.actor(), LOGOUT_ACTION, SESSION_TARGET, AuditOutcome::Success)
        .with_detail(format!("session {}", short_id(&session.id)))
        .with_request_id(request_id(&headers));

    // Revocation stands even when the record cannot be written.
    if state.audit.record(entry).await.is_err() {
        warn!(session_id = %short_id(&session.id), "Admin session revoked without an audit record");
    }

    Ok(([(SET_COOKIE, cleared)], Json(LogoutResponse { revoked })))
}
