//! Shared utilities for handlers.

use std::time::Duration;

use axum::http::HeaderMap;
use axum::http::header::HeaderValue;

use crate::error::{AppError, AppResult};
use crate::middleware::REQUEST_ID_HEADER;

/// Request id stamped by the request id layer.
pub fn request_id(headers: &HeaderMap) -> Option<String> {
    headers
        .get(REQUEST_ID_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
}

/// `Set-Cookie` value carrying an admin session token.
pub fn session_cookie(name: &str, token: &str, max_age: Duration) -> AppResult<HeaderValue> {
    cookie(name, token, max_age.as_secs())
}

/// `Set-Cookie` value deleting the admin session cookie.
pub fn cleared_cookie(name: &str) -> AppResult<HeaderValue> {
    cookie(name, "", 0)
}

fn cookie(name: &str, value: &str, max_age_secs: u64) -> AppResult<HeaderValue> {
    HeaderValue::from_str(&format!(
        "{name}={value}; HttpOnly; Secure; SameSite=Strict; Path=/; Max-Age={max_age_secs}"
    ))
    .map_err(|e| AppError::Internal(format!("Invalid session cookie: {e}")))
}
