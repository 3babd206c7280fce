//! Application routing configuration with middleware stack.
//!
//! # Middleware Stack (outermost first)
//!
//! ```text
//! Request
//!    │
//!    ▼
//! ┌──────────────────┐
//! │   Request ID     │ ← X-Request-Id on request and response
//! └────────┬─────────┘
//!          ▼
//! ┌──────────────────┐
//! │     Tracing      │ ← HTTP request/response logging
//! └────────┬─────────┘
//!          ▼
//! ┌──────────────────┐
//! │  Admission       │ ← 429 / 401 / 403 / 503, security headers, audit
//! │  pipeline        │
//! └────────┬─────────┘
//!          ▼
//! ┌──────────────────┐
//! │      CORS        │ ← Cross-origin headers, preflight answers
//! └────────┬─────────┘
//!          ▼
//!      Handler
//! ```
//!
//! # Route Groups
//!
//! - `/health`, `/ready` - Monitoring (public, not rate limited)
//! - `/auth/*` - Identity and admin sessions (`auth` rate class)
//! - `/admin/*` - Admin dashboard (`admin` rate class, administrators only)
//!
//! Anything else is classified as public `content`, so collaborators'
//! content routes merged into the router are rate limited and get security
//! headers without further registration.

use axum::Router;
use axum::extract::DefaultBodyLimit;
use axum::http::Method;
use axum::routing::{get, post};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::auth::{Capability, RouteClass, RoutePolicy, RouteTable};
use crate::config::Config;
use crate::error::AppResult;
use crate::handlers;
use crate::middleware::{RequestIdLayer, RequestPipeline};
use crate::state::AppState;

/// Route policies for the endpoints this crate serves.
///
/// # Errors
///
/// Returns `AppError::ConfigError` for a malformed pattern, a duplicate
/// registration or a capability naming an unknown role.
pub fn route_table(config: &Config) -> AppResult<RouteTable> {
    let auth_admin = RoutePolicy {
        class: RouteClass::Auth,
        capability: Capability::Admin,
        privileged: false,
    };

    RouteTable::new(&config.known_roles, RoutePolicy::public(RouteClass::Content))?
        .route(None, "/health", RoutePolicy::public(RouteClass::Content))?
        .route(None, "/ready", RoutePolicy::public(RouteClass::Content))?
        .route(Some(Method::GET), "/auth", RoutePolicy::public(RouteClass::Auth))?
        .route(None, "/auth/*", RoutePolicy::authenticated(RouteClass::Auth))?
        .route(Some(Method::GET), "/auth/is-admin", auth_admin)?
        .route(None, "/admin/*", RoutePolicy::admin())?
        .route(Some(Method::GET), "/admin/audit-log", RoutePolicy::admin().privileged())?
        .route(
            Some(Method::POST),
            "/admin/session-secret/rotate",
            RoutePolicy::admin().privileged(),
        )
}

/// Build the application router with all routes and middleware configured.
///
/// # Errors
///
/// Returns `AppError::ConfigError` if the route table is invalid.
pub fn build_router(state: AppState) -> AppResult<Router> {
    let routes = route_table(&state.config)?;
    build_router_with(state, Router::new(), routes)
}

/// Build the router around additional collaborator routes.
///
/// `content` is merged under the admission pipeline; `routes` must carry
/// the policies for everything the router serves.
pub fn build_router_with(state: AppState, content: Router<AppState>, routes: RouteTable) -> AppResult<Router> {
    let config = state.config.clone();
    let cors = build_cors_layer(&config.cors_allowed_origins);

    let mut router = Router::new()
        // Health endpoints
        .route("/health", get(handlers::health_check))
        .route("/ready", get(handlers::readiness_check))
        // Identity and admin sessions
        .route("/auth", get(handlers::auth::auth_info))
        .route("/auth/me", get(handlers::auth::me))
        .route("/auth/verify", get(handlers::auth::verify))
        .route("/auth/is-admin", get(handlers::auth::is_admin))
        .route(
            "/auth/session",
            get(handlers::auth::session_info)
                .post(handlers::auth::create_session)
                .delete(handlers::auth::delete_session),
        )
        // Admin dashboard
        .route("/admin", get(handlers::admin::admin_info))
        .route("/admin/audit-log", get(handlers::admin::audit_log))
        .route(
            "/admin/session-secret/rotate",
            post(handlers::admin::rotate_session_secret),
        )
        .merge(content);

    // =========================================================================
    // Apply Middleware Stack (order matters - applied bottom to top)
    // =========================================================================

    // 1. Request body size limit
    info!(
        max_size_kb = config.max_request_body_size / 1024,
        "Request body size limit configured"
    );
    router = router.layer(DefaultBodyLimit::max(config.max_request_body_size));

    // 2. CORS
    router = router.layer(cors);

    // 3. Admission pipeline
    info!(
        routes = routes.len(),
        trusted_proxies = config.trusted_proxies.len(),
        exempt_paths = config.rate_limit_exempt_paths.len(),
        "Admission pipeline enabled"
    );
    router = router.layer(RequestPipeline::new(state.clone(), routes));

    // 4. Tracing
    router = router.layer(TraceLayer::new_for_http());

    // 5. Request ID
    router = router.layer(RequestIdLayer::new());

    Ok(router.with_state(state))
}

/// Build CORS layer from configuration.
///
/// `*` allows any origin. Credentials are only sent cross-origin to
/// explicitly listed origins.
fn build_cors_layer(allowed_origins: &[String]) -> CorsLayer {
    let allow_any = allowed_origins.iter().any(|o| o == "*");

    if allow_any {
        CorsLayer::new()
            .allow_origin(Any)
            .allow_methods(Any)
            .allow_headers(Any)
    } else {
        let origins: Vec<_> = allowed_origins
            .iter()
            .filter_map(|o| o.parse().ok())
            .collect();

        CorsLayer::new()
            .allow_origin(origins)
            .allow_methods([Method::GET, Method::POST, Method::PUT, Method::DELETE])
            .allow_headers([
                axum::http::header::AUTHORIZATION,
                axum::http::header::CONTENT_TYPE,
                axum::http::HeaderName::from_static(crate::auth::ADMIN_SESSION_HEADER),
            ])
            .allow_credentials(true)
    }
}
