//! # Portal Guard
//!
//! Request authentication and admission control for a marketing-site API,
//! built on Axum:
//!
//! - **Identity**: external bearer tokens (static HMAC keys or the identity
//!   provider's JWKS) and first-party admin sessions
//! - **Admission**: per-client sliding-window rate limits by route class,
//!   plus a lockout after repeated credential failures
//! - **Policy**: route capabilities checked before any handler runs
//! - **Audit**: an append-only trail of privileged actions
//! - **Hardening**: security headers on every response, rejections included
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      Axum HTTP Server                       │
//! ├─────────────────────────────────────────────────────────────┤
//! │  Request ID → Trace → RequestPipeline → CORS                │
//! │     rate limit → identity → capability → handler → audit    │
//! ├─────────────────────────────────────────────────────────────┤
//! │  Handlers (health, auth, admin) + collaborator content      │
//! ├─────────────────────────────────────────────────────────────┤
//! │  Gatekeeper (TokenValidator, SessionManager) · RateLimiter  │
//! │  AuditLogger · SecurityHeaderSet · Clock                    │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use portal_guard::{AppState, Config, build_router};
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let config = Config::from_env()?;
//! let state = AppState::new(config).await?;
//! let app = build_router(state.clone())?;
//!
//! let listener = tokio::net::TcpListener::bind("0.0.0.0:8000").await?;
//! axum::serve(
//!     listener,
//!     app.into_make_service_with_connect_info::<std::net::SocketAddr>(),
//! )
//! .await?;
//! state.shutdown().await;
//! # Ok(())
//! # }
//! ```
//!
//! ## Configuration
//!
//! ```bash
//! JWT_ISSUER=https://issuer.example/ \
//! JWKS_URL=https://issuer.example/.well-known/jwks.json \
//! ADMIN_SESSION_SECRET=$(openssl rand -hex 32) \
//! ALLOWED_ADMIN_EMAILS=owner@example.com \
//! cargo run
//! ```

pub mod audit;
pub mod auth;
pub mod clock;
pub mod config;
pub mod error;
pub mod handlers;
pub mod metrics;
pub mod middleware;
pub mod models;
pub mod routes;
pub mod state;
pub mod utils;

// Re-exports for convenience
pub use audit::{AuditLogger, AuditRecord};
pub use auth::{AuthError, Gatekeeper, Identity, RouteTable};
pub use clock::{Clock, ManualClock, SharedClock, SystemClock};
pub use config::Config;
pub use error::{AppError, AppResult};
pub use middleware::RequestPipeline;
pub use routes::{build_router, build_router_with, route_table};
pub use state::AppState;
