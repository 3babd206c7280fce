//! HTTP middleware for admission control and observability.
//!
//! - **Pipeline**: the single layer running every admission gate
//! - **Rate Limiting**: sliding-window log per route class and client
//! - **Auth Failures**: lockout after repeated bad credentials
//! - **Security Headers**: stamped on every response
//! - **Client IP**: trusted-proxy aware client keys
//! - **Request ID**: generation and propagation for tracing and audit
//!
//! # Architecture
//!
//! ```text
//! Request → Request ID → Trace → Pipeline ──────────────────────→ CORS → Handler
//!                                  │ rate limit → identity → capability
//!                                  ↓
//!                       429 / 401 / 403 / 503 (with security headers)
//! ```

pub mod auth_failures;
pub mod ip;
pub mod pipeline;
pub mod rate_limit;
pub mod request_id;
pub mod security_headers;

pub use auth_failures::AuthFailureGuard;
pub use ip::{TrustedProxyConfig, UNKNOWN_IP, client_key};
pub use pipeline::RequestPipeline;
pub use rate_limit::{Admission, ClassLimits, RateLimitError, RateLimiter, RateRule};
pub use request_id::{REQUEST_ID_HEADER, RequestIdExt, RequestIdLayer};
pub use security_headers::SecurityHeaderSet;
