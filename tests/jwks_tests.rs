//! Token verification against a live JWKS endpoint.
//!
//! A small axum server on an ephemeral port stands in for the identity
//! provider. Its availability, latency and published keys are switched per
//! test; cache ages are driven by a `ManualClock`.
//!
//! Run with: `cargo test --test jwks_tests`
#![allow(clippy::unwrap_used, clippy::expect_used)]

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

use axum::Router;
use axum::body::{Body, to_bytes};
use axum::extract::{ConnectInfo, State};
use axum::http::{Method, Request, Response, StatusCode, header};
use axum::routing::get;
use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use jsonwebtoken::{Algorithm, EncodingKey, Header, encode};
use serde_json::{Value, json};
use tokio::net::TcpListener;
use tokio::sync::RwLock;
use tower::ServiceExt;

use portal_guard::audit::MemoryAuditSink;
use portal_guard::clock::{Clock, ManualClock};
use portal_guard::config::Config;
use portal_guard::{AppState, build_router};

const ISSUER: &str = "https://issuer.test/";
const FIRST_KEY: (&str, &str) = ("k1", "first-provider-signing-key");
const SECOND_KEY: (&str, &str) = ("k2", "second-provider-signing-key");

/// Controllable stand-in for the identity provider's JWKS endpoint.
#[derive(Clone, Default)]
struct Provider {
    keys: Arc<RwLock<Vec<(&'static str, &'static str)>>>,
    down: Arc<AtomicBool>,
    delay_ms: Arc<AtomicU64>,
    hits: Arc<AtomicUsize>,
}

impl Provider {
    async fn start(keys: &[(&'static str, &'static str)]) -> (Self, String) {
        let provider = Provider::default();
        *provider.keys.write().await = keys.to_vec();

        let app = Router::new()
            .route("/.well-known/jwks.json", get(serve_jwks))
            .with_state(provider.clone());
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        (provider, format!("http://{addr}/.well-known/jwks.json"))
    }

    fn set_down(&self, down: bool) {
        self.down.store(down, Ordering::SeqCst);
    }
}

async fn serve_jwks(State(provider): State<Provider>) -> Result<axum::Json<Value>, StatusCode> {
    provider.hits.fetch_add(1, Ordering::SeqCst);

    let delay = provider.delay_ms.load(Ordering::SeqCst);
    if delay > 0 {
        tokio::time::sleep(Duration::from_millis(delay)).await;
    }
    if provider.down.load(Ordering::SeqCst) {
        return Err(StatusCode::SERVICE_UNAVAILABLE);
    }

    let keys: Vec<Value> = provider
        .keys
        .read()
        .await
        .iter()
        .map(|(kid, secret)| {
            json!({
                "kty": "oct",
                "kid": kid,
                "use": "sig",
                "alg": "HS256",
                "k": URL_SAFE_NO_PAD.encode(secret),
            })
        })
        .collect();
    Ok(axum::Json(json!({ "keys": keys })))
}

struct Harness {
    app: Router,
    clock: Arc<ManualClock>,
}

impl Harness {
    async fn new(jwks_url: String, adjust: impl FnOnce(&mut Config)) -> Self {
        let mut config = Config::default();
        config.jwt_issuer = ISSUER.to_string();
        config.jwt_hs256_secret = None;
        config.jwks_url = Some(jwks_url);
        config.jwks_fetch_timeout = Duration::from_millis(500);
        config.jwks_cache_ttl = Duration::from_secs(60);
        config.jwks_max_stale = Duration::from_secs(300);
        config.jwks_min_refresh_interval = Duration::from_secs(1);
        adjust(&mut config);

        let clock = Arc::new(ManualClock::new());
        let state = AppState::build(config, clock.clone(), Arc::new(MemoryAuditSink::new()))
            .await
            .unwrap();
        let app = build_router(state).unwrap();

        Self { app, clock }
    }

    fn token(&self, (kid, secret): (&str, &str)) -> String {
        let now = self.clock.now().timestamp();
        let mut header = Header::new(Algorithm::HS256);
        header.kid = Some(kid.to_string());
        encode(
            &header,
            &json!({
                "sub": "auth0|visitor",
                "iss": ISSUER,
                "exp": now + 3600,
                "email": "visitor@example.com",
            }),
            &EncodingKey::from_secret(secret.as_bytes()),
        )
        .unwrap()
    }

    async fn me(&self, token: &str) -> Response<Body> {
        let request = Request::builder()
            .method(Method::GET)
            .uri("/auth/me")
            .header(header::AUTHORIZATION, format!("Bearer {token}"))
            .extension(ConnectInfo(SocketAddr::from(([198, 51, 100, 7], 50_000))))
            .body(Body::empty())
            .unwrap();
        self.app.clone().oneshot(request).await.unwrap()
    }

    async fn ready(&self) -> StatusCode {
        let request = Request::builder()
            .uri("/ready")
            .extension(ConnectInfo(SocketAddr::from(([198, 51, 100, 7], 50_000))))
            .body(Body::empty())
            .unwrap();
        self.app.clone().oneshot(request).await.unwrap().status()
    }
}

async fn error_code(response: Response<Body>) -> String {
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let body: Value = serde_json::from_slice(&bytes).unwrap();
    body["error"].as_str().unwrap().to_string()
}

#[tokio::test]
async fn test_token_signed_with_published_key_accepted() {
    let (provider, url) = Provider::start(&[FIRST_KEY]).await;
    let harness = Harness::new(url, |_| {}).await;

    let response = harness.me(&harness.token(FIRST_KEY)).await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(harness.ready().await, StatusCode::OK);

    // Cached keys serve later requests without another fetch.
    let hits = provider.hits.load(Ordering::SeqCst);
    for _ in 0..3 {
        assert_eq!(harness.me(&harness.token(FIRST_KEY)).await.status(), StatusCode::OK);
    }
    assert_eq!(provider.hits.load(Ordering::SeqCst), hits);
}

#[tokio::test]
async fn test_token_with_unpublished_key_rejected() {
    let (_provider, url) = Provider::start(&[FIRST_KEY]).await;
    let harness = Harness::new(url, |_| {}).await;

    let forged = harness.token(("k1", "attacker-chosen-secret"));
    let response = harness.me(&forged).await;
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    assert_eq!(error_code(response).await, "signature_invalid");
}

#[tokio::test]
async fn test_unreachable_provider_fails_closed() {
    let (provider, url) = Provider::start(&[FIRST_KEY]).await;
    provider.set_down(true);
    let harness = Harness::new(url, |_| {}).await;

    let response = harness.me(&harness.token(FIRST_KEY)).await;
    assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(error_code(response).await, "issuer_unreachable");
    assert_eq!(harness.ready().await, StatusCode::SERVICE_UNAVAILABLE);
}

#[tokio::test]
async fn test_slow_provider_times_out() {
    let (provider, url) = Provider::start(&[FIRST_KEY]).await;
    provider.delay_ms.store(2_000, Ordering::SeqCst);
    let harness = Harness::new(url, |c| c.jwks_fetch_timeout = Duration::from_millis(100)).await;

    let started = std::time::Instant::now();
    let response = harness.me(&harness.token(FIRST_KEY)).await;
    assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    assert!(started.elapsed() < Duration::from_millis(1_500), "request waited on the provider");
}

#[tokio::test]
async fn test_stale_keys_served_until_max_stale() {
    let (provider, url) = Provider::start(&[FIRST_KEY]).await;
    let harness = Harness::new(url, |_| {}).await;
    assert_eq!(harness.me(&harness.token(FIRST_KEY)).await.status(), StatusCode::OK);

    provider.set_down(true);

    // Past the cache TTL but inside the stale window.
    harness.clock.advance(Duration::from_secs(120));
    assert_eq!(harness.me(&harness.token(FIRST_KEY)).await.status(), StatusCode::OK);

    // Past the stale window.
    harness.clock.advance(Duration::from_secs(200));
    let response = harness.me(&harness.token(FIRST_KEY)).await;
    assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(error_code(response).await, "issuer_unreachable");
}

#[tokio::test]
async fn test_unknown_kid_triggers_refresh() {
    let (provider, url) = Provider::start(&[FIRST_KEY]).await;
    let harness = Harness::new(url, |_| {}).await;
    assert_eq!(harness.me(&harness.token(FIRST_KEY)).await.status(), StatusCode::OK);

    // The provider rotates in a new signing key.
    *provider.keys.write().await = vec![FIRST_KEY, SECOND_KEY];
    harness.clock.advance(Duration::from_secs(5));

    assert_eq!(harness.me(&harness.token(SECOND_KEY)).await.status(), StatusCode::OK);
}

#[tokio::test]
async fn test_unknown_kid_refresh_is_throttled() {
    let (provider, url) = Provider::start(&[FIRST_KEY]).await;
    let harness = Harness::new(url, |c| c.jwks_min_refresh_interval = Duration::from_secs(30)).await;
    assert_eq!(harness.me(&harness.token(FIRST_KEY)).await.status(), StatusCode::OK);
    let hits = provider.hits.load(Ordering::SeqCst);

    for i in 0..5 {
        let forged = harness.token(("forged", "attacker-chosen-secret"));
        let response = harness.me(&forged).await;
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED, "attempt {i}");
    }
    assert_eq!(provider.hits.load(Ordering::SeqCst), hits);
}

#[tokio::test]
async fn test_readiness_follows_key_availability() {
    let (provider, url) = Provider::start(&[FIRST_KEY]).await;
    provider.set_down(true);
    let harness = Harness::new(url, |_| {}).await;
    assert_eq!(harness.ready().await, StatusCode::SERVICE_UNAVAILABLE);

    provider.set_down(false);
    harness.clock.advance(Duration::from_secs(2));
    assert_eq!(harness.me(&harness.token(FIRST_KEY)).await.status(), StatusCode::OK);
    assert_eq!(harness.ready().await, StatusCode::OK);
}
