//! Security headers stamped on every response.
//!
//! The set is built once at startup and shared read-only. It is applied to
//! early rejections (429, 401, 403, 503) exactly as to handler responses, so
//! a rejected request is as well protected as an accepted one.
//!
//! A header the handler already set is left alone. The `Server` header is
//! always removed.

use axum::http::header::{self, HeaderMap, HeaderName, HeaderValue};

/// Header name → value pairs applied to every response.
#[derive(Debug, Clone)]
pub struct SecurityHeaderSet {
    headers: Vec<(HeaderName, HeaderValue)>,
}

impl Default for SecurityHeaderSet {
    fn default() -> Self {
        Self::new(vec![
            (
                header::STRICT_TRANSPORT_SECURITY,
                HeaderValue::from_static("max-age=31536000; includeSubDomains"),
            ),
            (header::X_CONTENT_TYPE_OPTIONS, HeaderValue::from_static("nosniff")),
            (header::X_FRAME_OPTIONS, HeaderValue::from_static("DENY")),
            (
                HeaderName::from_static("cross-origin-opener-policy"),
                HeaderValue::from_static("same-origin"),
            ),
            (
                HeaderName::from_static("cross-origin-resource-policy"),
                HeaderValue::from_static("same-origin"),
            ),
            (
                header::CONTENT_SECURITY_POLICY,
                HeaderValue::from_static("default-src 'none'; frame-ancestors 'none'"),
            ),
            (
                header::REFERRER_POLICY,
                HeaderValue::from_static("strict-origin-when-cross-origin"),
            ),
            (
                HeaderName::from_static("permissions-policy"),
                HeaderValue::from_static("geolocation=(), microphone=(), camera=()"),
            ),
            (header::X_XSS_PROTECTION, HeaderValue::from_static("1; mode=block")),
        ])
    }
}

impl SecurityHeaderSet {
    /// Build a set. Later duplicates of a name are dropped.
    pub fn new(headers: Vec<(HeaderName, HeaderValue)>) -> Self {
        let mut unique: Vec<(HeaderName, HeaderValue)> = Vec::with_capacity(headers.len());
        for (name, value) in headers {
            if !unique.iter().any(|(n, _)| *n == name) {
                unique.push((name, value));
            }
        }
        Self { headers: unique }
    }

    /// Replace (or add) one header in the set.
    pub fn with(mut self, name: HeaderName, value: HeaderValue) -> Self {
        match self.headers.iter_mut().find(|(n, _)| *n == name) {
            Some((_, existing)) => *existing = value,
            None => self.headers.push((name, value)),
        }
        self
    }

    pub fn iter(&self) -> impl Iterator<Item = (&HeaderName, &HeaderValue)> {
        self.headers.iter().map(|(n, v)| (n, v))
    }

    pub fn len(&self) -> usize {
        self.headers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.headers.is_empty()
    }

    /// Stamp the set onto `headers`.
    pub fn apply(&self, headers: &mut HeaderMap) {
        for (name, value) in &self.headers {
            if !headers.contains_key(name) {
                headers.insert(name.clone(), value.clone());
            }
        }
        headers.remove(header::SERVER);
    }
}
