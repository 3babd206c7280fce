//! Request ID propagation.
//!
//! Every request gets an `X-Request-Id`: the client's own when it is a
//! short printable token, otherwise a fresh UUIDv4. The id is written back
//! onto the request (so the pipeline can stamp it on audit records) and onto
//! the response for correlation:
//!
//! ```bash
//! curl -H "X-Request-Id: my-correlation-id" http://localhost:8000/auth/me
//! ```

use std::task::{Context, Poll};

use axum::body::Body;
use axum::http::header::HeaderValue;
use axum::http::{Request, Response};
use tower::{Layer, Service};
use tracing::{Span, debug};
use uuid::Uuid;

/// Header name for request ID.
pub const REQUEST_ID_HEADER: &str = "x-request-id";

/// Longest client-supplied id that is propagated as-is.
const MAX_REQUEST_ID_LEN: usize = 128;

/// Request ID layer for Tower middleware stack.
#[derive(Clone, Default)]
pub struct RequestIdLayer;

impl RequestIdLayer {
    pub fn new() -> Self {
        Self
    }
}

impl<S> Layer<S> for RequestIdLayer {
    type Service = RequestIdService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        RequestIdService { inner }
    }
}

/// Request ID service wrapper.
#[derive(Clone)]
pub struct RequestIdService<S> {
    inner: S,
}

impl<S> Service<Request<Body>> for RequestIdService<S>
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

    fn call(&mut self, mut req: Request<Body>) -> Self::Future {
        let request_id = accepted_or_new_request_id(&req);

        Span::current().record("request_id", request_id.to_str().unwrap_or_default());
        debug!(request_id = ?request_id, method = %req.method(), "Processing request");

        req.headers_mut().insert(REQUEST_ID_HEADER, request_id.clone());
        let mut inner = self.inner.clone();

        Box::pin(async move {
            let mut response = inner.call(req).await?;
            response.headers_mut().insert(REQUEST_ID_HEADER, request_id);
            Ok(response)
        })
    }
}

/// The client's request id if acceptable, otherwise a new UUID.
fn accepted_or_new_request_id<B>(req: &Request<B>) -> HeaderValue {
    req.headers()
        .get(REQUEST_ID_HEADER)
        .filter(|value| is_acceptable(value))
        .cloned()
        .unwrap_or_else(new_request_id)
}

fn is_acceptable(value: &HeaderValue) -> bool {
    let bytes = value.as_bytes();
    !bytes.is_empty() && bytes.len() <= MAX_REQUEST_ID_LEN && bytes.iter().all(|b| b.is_ascii_graphic())
}

fn new_request_id() -> HeaderValue {
    let mut buf = Uuid::encode_buffer();
    let id = Uuid::new_v4().hyphenated().encode_lower(&mut buf);
    HeaderValue::from_str(id).unwrap_or_else(|_| HeaderValue::from_static("unknown"))
}

/// Extension trait to read the request ID.
pub trait RequestIdExt {
    /// The request ID set by [`RequestIdLayer`], if any.
    fn request_id(&self) -> Option<String>;
}

impl<B> RequestIdExt for Request<B> {
    fn request_id(&self) -> Option<String> {
        self.headers()
            .get(REQUEST_ID_HEADER)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_client_request_id_kept() {
        let req = Request::builder()
            .header("x-request-id", "existing-id-123")
            .body(Body::empty())
            .unwrap();

        assert_eq!(accepted_or_new_request_id(&req), "existing-id-123");
    }

    #[test]
    fn test_missing_request_id_generated() {
        let req = Request::builder().body(Body::empty()).unwrap();

        let id = accepted_or_new_request_id(&req);
        assert!(Uuid::parse_str(id.to_str().unwrap()).is_ok());
    }

    #[test]
    fn test_unacceptable_request_id_replaced() {
        let long = "a".repeat(MAX_REQUEST_ID_LEN + 1);
        for bad in ["has space", long.as_str()] {
            let req = Request::builder()
                .header("x-request-id", bad)
                .body(Body::empty())
                .unwrap();
            let id = accepted_or_new_request_id(&req);
            assert!(Uuid::parse_str(id.to_str().unwrap()).is_ok(), "{bad} was kept");
        }
    }

    #[test]
    fn test_request_id_ext_trait() {
        let req = Request::builder()
            .header("x-request-id", "test-id")
            .body(Body::empty())
            .unwrap();
        assert_eq!(req.request_id(), Some("test-id".to_string()));

        let req = Request::builder().body(Body::empty()).unwrap();
        assert_eq!(req.request_id(), None);
    }
}
