//! The request admission pipeline.
//!
//! One Tower layer wraps the whole router and runs the gates in a fixed
//! order:
//!
//! ```text
//! Request → normalize path → classify route
//!    │
//!    ├─ rate limit ─────────────── 429 RateLimited
//!    ├─ identity (if credential) ─ 401 / 429 lockout / 503 issuer unreachable
//!    ├─ capability ─────────────── 401 Unauthenticated / 403 Unauthorized
//!    ├─ handler
//!    └─ audit (privileged routes)
//!          │
//!          ▼
//!   security headers on every response, rejections included
//! ```
//!
//! A failed gate short-circuits the rest; header injection always runs.
//! `OPTIONS` requests go straight to the handler so CORS preflights are
//! never rejected, and exempt paths skip only the rate limiter.
//!
//! The resolved [`Identity`] is inserted into request extensions, where
//! handlers read it with `Extension<Identity>`.

use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Instant;

use axum::body::Body;
use axum::http::header::{HeaderMap, HeaderName, HeaderValue};
use axum::http::{Method, Request, Response};
use axum::response::IntoResponse;
use tower::{Layer, Service};
use tracing::{debug, error, warn};

use super::ip::client_key;
use super::rate_limit::Admission;
use super::request_id::RequestIdExt;
use crate::audit::{AuditEntry, AuditOutcome};
use crate::auth::policy::ResolvedRoute;
use crate::auth::{AuthError, Capability, Credential, Identity, RouteClass, RoutePolicy, RouteTable, normalize_path};
use crate::metrics;
use crate::state::AppState;

pub const RATE_LIMIT_LIMIT_HEADER: HeaderName = HeaderName::from_static("x-ratelimit-limit");
pub const RATE_LIMIT_REMAINING_HEADER: HeaderName = HeaderName::from_static("x-ratelimit-remaining");

/// Actor recorded when a privileged route is reached anonymously.
const ANONYMOUS_ACTOR: &str = "anonymous";

/// Admission pipeline layer.
#[derive(Clone)]
pub struct RequestPipeline {
    state: AppState,
    routes: Arc<RouteTable>,
}

impl RequestPipeline {
    pub fn new(state: AppState, routes: RouteTable) -> Self {
        Self {
            state,
            routes: Arc::new(routes),
        }
    }

    /// Route table requests are classified against.
    pub fn routes(&self) -> &RouteTable {
        &self.routes
    }

    /// Run every gate, the handler and the audit step. Headers are stamped
    /// by the caller.
    async fn process<S>(
        &self,
        mut req: Request<Body>,
        path: String,
        resolved: ResolvedRoute,
        inner: &mut S,
    ) -> Result<Response<Body>, S::Error>
    where
        S: Service<Request<Body>, Response = Response<Body>>,
    {
        if req.method() == Method::OPTIONS {
            return inner.call(req).await;
        }

        let state = &self.state;
        let class = resolved.policy.class;
        let client = client_key(&req, &state.proxies);

        let quota = if state.exempt_paths.contains(&path) {
            None
        } else {
            match state.limiter.admit(&client, class) {
                Admission::Allow { limit, remaining } => Some((limit, remaining)),
                Admission::Deny { retry_after, limit } => {
                    return Ok(reject(AuthError::RateLimited { retry_after, limit }, &client, class));
                }
            }
        };

        let identity = match self.identify(req.headers(), &client, &resolved.policy).await {
            Ok(identity) => identity,
            Err(e) => return Ok(reject(e, &client, class)),
        };

        if let Err(e) = resolved.policy.capability.check(identity.as_ref(), &state.admins) {
            return Ok(reject(e, &client, class));
        }

        let method = req.method().clone();
        let request_id = req.request_id();
        if let Some(identity) = &identity {
            req.extensions_mut().insert(identity.clone());
        }

        let mut response = inner.call(req).await?;

        if resolved.policy.privileged {
            let actor = identity
                .as_ref()
                .map_or_else(|| ANONYMOUS_ACTOR.to_string(), Identity::actor);
            let entry = AuditEntry::new(
                actor,
                format!("{method} {}", resolved.route),
                path,
                AuditOutcome::from_status(response.status()),
            )
            .with_request_id(request_id);

            // The action already happened; the handler's response stands.
            if let Err(e) = state.audit.record(entry).await {
                error!(
                    error = %e,
                    route_class = %class,
                    status = response.status().as_u16(),
                    "Privileged action completed but its audit record was not persisted"
                );
            }
        }

        if let Some((limit, remaining)) = quota {
            insert_quota_headers(response.headers_mut(), limit, remaining);
        }

        Ok(response)
    }

    /// Resolve the request's credential, if it carries one.
    ///
    /// An invalid session cookie on a public route is ignored and the
    /// request proceeds anonymously. Explicit credentials are always
    /// enforced.
    async fn identify(
        &self,
        headers: &HeaderMap,
        client: &str,
        policy: &RoutePolicy,
    ) -> Result<Option<Identity>, AuthError> {
        let gatekeeper = &self.state.gatekeeper;
        let failures = &self.state.failures;

        let credential = match gatekeeper.credential(headers).transpose() {
            None => return Ok(None),
            Some(credential) => credential,
        };
        let lenient =
            policy.capability == Capability::Public && credential.as_ref().is_ok_and(Credential::is_ambient);

        if let Err(e) = failures.check(client) {
            return if lenient { Ok(None) } else { Err(e) };
        }

        let result = match &credential {
            Ok(credential) => gatekeeper.resolve(credential).await,
            Err(e) => Err(e.clone()),
        };

        match result {
            Ok(identity) => Ok(Some(identity)),
            // Not counted towards a lockout.
            Err(AuthError::IssuerUnreachable) => Err(AuthError::IssuerUnreachable),
            Err(e) if lenient => {
                debug!(reason = e.reason(), "Ignoring invalid session cookie on public route");
                Ok(None)
            }
            Err(e) => {
                failures.record_failure(client);
                Err(e)
            }
        }
    }
}

impl<S> Layer<S> for RequestPipeline {
    type Service = RequestPipelineService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        RequestPipelineService {
            inner,
            pipeline: self.clone(),
        }
    }
}

/// Admission pipeline service wrapper.
#[derive(Clone)]
pub struct RequestPipelineService<S> {
    inner: S,
    pipeline: RequestPipeline,
}

impl<S> Service<Request<Body>> for RequestPipelineService<S>
where
    S: Service<Request<Body>, Response = Response<Body>> + Clone + Send + 'static,
    S::Future: Send,
{
    type Response = Response<Body>;
    type Error = S::Error;
    type Future = std::pin::Pin<
        Box<dyn std::future::Future<Output = Result<Self::Response, Self::Error>> + Send>,
    >;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, req: Request<Body>) -> Self::Future {
        let pipeline = self.pipeline.clone();
        let mut inner = self.inner.clone();

        Box::pin(async move {
            let started = Instant::now();
            let path = normalize_path(req.uri().path()).into_owned();
            let resolved = pipeline.routes.resolve(req.method(), &path);
            let class = resolved.policy.class;

            let mut response = pipeline.process(req, path, resolved, &mut inner).await?;
            pipeline.state.headers.apply(response.headers_mut());

            metrics::record_request_duration(
                class.as_str(),
                response.status().as_u16(),
                started.elapsed().as_secs_f64(),
            );
            Ok(response)
        })
    }
}

/// Turn a gate failure into its response.
fn reject(err: AuthError, client: &str, class: RouteClass) -> Response<Body> {
    metrics::record_auth_failure(err.reason());
    warn!(
        client_key = client,
        route_class = %class,
        reason = err.reason(),
        "Request rejected"
    );
    err.into_response()
}

fn insert_quota_headers(headers: &mut HeaderMap, limit: u32, remaining: u32) {
    headers
        .entry(RATE_LIMIT_LIMIT_HEADER)
        .or_insert_with(|| HeaderValue::from(limit));
    headers
        .entry(RATE_LIMIT_REMAINING_HEADER)
        .or_insert_with(|| HeaderValue::from(remaining));
}
