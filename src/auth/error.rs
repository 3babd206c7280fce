//! Rejection taxonomy for the admission-control layer.
//!
//! Every variant maps to a stable, machine-readable reason code so that
//! clients can decide whether to retry immediately, retry after a delay, or
//! re-authenticate. Response bodies carry fixed messages only: no key
//! material, token contents or internal state.

use std::time::Duration;

use axum::Json;
use axum::http::{HeaderValue, StatusCode, header};
use axum::response::{IntoResponse, Response};
use serde::Serialize;
use thiserror::Error;

/// Reasons a request can be refused by the admission pipeline.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AuthError {
    /// The credential could not be parsed.
    #[error("credential is malformed")]
    Malformed,

    /// The credential's signature does not verify against any trusted key.
    #[error("credential signature is invalid")]
    SignatureInvalid,

    /// The credential was issued by (or for) a party we do not trust.
    #[error("credential issuer is not trusted")]
    IssuerUntrusted,

    /// The credential was valid once but is outside its validity window.
    #[error("credential has expired")]
    Expired,

    /// The credential was explicitly or implicitly revoked.
    #[error("credential has been revoked")]
    Revoked,

    /// Verification keys could not be obtained from the identity provider.
    #[error("identity provider is unreachable")]
    IssuerUnreachable,

    /// Admission denied for this client; retry after the given delay.
    #[error("rate limit exceeded (retry after {retry_after:?})")]
    RateLimited { retry_after: Duration, limit: u32 },

    /// Identity is valid but lacks the capability the route requires.
    #[error("identity lacks the required capability")]
    Unauthorized,

    /// The route requires an identity and none was presented.
    #[error("credential required")]
    Unauthenticated,
}

impl AuthError {
    /// Stable reason code exposed to clients.
    pub fn reason(&self) -> &'static str {
        match self {
            AuthError::Malformed => "malformed_credential",
            AuthError::SignatureInvalid => "signature_invalid",
            AuthError::IssuerUntrusted => "issuer_untrusted",
            AuthError::Expired => "credential_expired",
            AuthError::Revoked => "credential_revoked",
            AuthError::IssuerUnreachable => "issuer_unreachable",
            AuthError::RateLimited { .. } => "rate_limited",
            AuthError::Unauthorized => "unauthorized",
            AuthError::Unauthenticated => "unauthenticated",
        }
    }

    /// HTTP status for this rejection.
    pub fn status(&self) -> StatusCode {
        match self {
            AuthError::Malformed
            | AuthError::SignatureInvalid
            | AuthError::IssuerUntrusted
            | AuthError::Expired
            | AuthError::Revoked
            | AuthError::Unauthenticated => StatusCode::UNAUTHORIZED,
            AuthError::Unauthorized => StatusCode::FORBIDDEN,
            AuthError::RateLimited { .. } => StatusCode::TOO_MANY_REQUESTS,
            AuthError::IssuerUnreachable => StatusCode::SERVICE_UNAVAILABLE,
        }
    }

    fn message(&self) -> &'static str {
        match self {
            AuthError::Malformed => "The supplied credential could not be parsed.",
            AuthError::SignatureInvalid => "The supplied credential could not be verified.",
            AuthError::IssuerUntrusted => "The supplied credential was not issued by a trusted party.",
            AuthError::Expired => "The supplied credential has expired. Please re-authenticate.",
            AuthError::Revoked => "The supplied credential is no longer valid. Please re-authenticate.",
            AuthError::IssuerUnreachable => {
                "Authentication is temporarily unavailable. Please try again later."
            }
            AuthError::RateLimited { .. } => "Too many requests. Please retry later.",
            AuthError::Unauthorized => "You do not have permission to perform this action.",
            AuthError::Unauthenticated => "Authentication required.",
        }
    }
}

/// Whole seconds for a `Retry-After` value, never zero.
pub fn retry_after_secs(retry_after: Duration) -> u64 {
    let secs = retry_after.as_secs();
    if retry_after.subsec_nanos() > 0 {
        secs + 1
    } else {
        secs.max(1)
    }
}

#[derive(Serialize)]
struct RejectionBody {
    error: &'static str,
    message: &'static str,
}

impl IntoResponse for AuthError {
    fn into_response(self) -> Response {
        let body = RejectionBody {
            error: self.reason(),
            message: self.message(),
        };
        let mut response = (self.status(), Json(body)).into_response();
        let headers = response.headers_mut();

        match &self {
            AuthError::RateLimited { retry_after, limit } => {
                headers.insert(header::RETRY_AFTER, HeaderValue::from(retry_after_secs(*retry_after)));
                headers.insert("x-ratelimit-limit", HeaderValue::from(*limit));
                headers.insert("x-ratelimit-remaining", HeaderValue::from_static("0"));
            }
            err if err.status() == StatusCode::UNAUTHORIZED => {
                headers.insert(header::WWW_AUTHENTICATE, HeaderValue::from_static("Bearer"));
            }
            _ => {}
        }

        response
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_reason_codes_are_distinct() {
        let all = [
            AuthError::Malformed,
            AuthError::SignatureInvalid,
            AuthError::IssuerUntrusted,
            AuthError::Expired,
            AuthError::Revoked,
            AuthError::IssuerUnreachable,
            AuthError::RateLimited {
                retry_after: Duration::from_secs(1),
                limit: 1,
            },
            AuthError::Unauthorized,
            AuthError::Unauthenticated,
        ];
        let mut reasons: Vec<_> = all.iter().map(AuthError::reason).collect();
        reasons.sort_unstable();
        reasons.dedup();
        assert_eq!(reasons.len(), all.len());
    }

    #[test]
    fn test_retry_after_rounds_up() {
        assert_eq!(retry_after_secs(Duration::from_millis(1)), 1);
        assert_eq!(retry_after_secs(Duration::from_millis(1500)), 2);
        assert_eq!(retry_after_secs(Duration::from_secs(60)), 60);
        assert_eq!(retry_after_secs(Duration::ZERO), 1);
    }

    #[test]
    fn test_rate_limited_response_headers() {
        let response = AuthError::RateLimited {
            retry_after: Duration::from_secs(42),
            limit: 100,
        }
        .into_response();

        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(response.headers()[header::RETRY_AFTER], "42");
        assert_eq!(response.headers()["x-ratelimit-limit"], "100");
        assert_eq!(response.headers()["x-ratelimit-remaining"], "0");
    }

    #[test]
    fn test_credential_errors_challenge_bearer() {
        for err in [AuthError::Expired, AuthError::Malformed, AuthError::Unauthenticated] {
            let response = err.into_response();
            assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
            assert_eq!(response.headers()[header::WWW_AUTHENTICATE], "Bearer");
        }
    }

    #[test]
    fn test_forbidden_has_no_challenge() {
        let response = AuthError::Unauthorized.into_response();
        assert_eq!(response.status(), StatusCode::FORBIDDEN);
        assert!(response.headers().get(header::WWW_AUTHENTICATE).is_none());
    }
}
