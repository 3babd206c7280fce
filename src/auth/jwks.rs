//! JWKS client for the external identity provider.
//!
//! # Caching
//!
//! Fetched key sets are held in an `ArcSwapOption` snapshot. Readers never
//! take a lock; only refreshes are serialized (single-flight), so a slow
//! identity provider stalls at most the requests that actually need new keys.
//!
//! # Failure Semantics
//!
//! Every fetch is bounded by `fetch_timeout`. When a fetch fails or times out:
//!
//! - a cached set younger than `max_stale` keeps being served
//! - otherwise validation fails closed with [`AuthError::IssuerUnreachable`]
//!
//! Refreshes triggered by unknown `kid` values are throttled by
//! `min_refresh_interval` so forged key ids cannot turn into a fetch storm.

use std::sync::Arc;
use std::time::{Duration, Instant};

use arc_swap::ArcSwapOption;
use jsonwebtoken::jwk::JwkSet;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use super::error::AuthError;
use super::keys::KeySet;
use crate::clock::SharedClock;
use crate::metrics;

/// Settings for fetching and caching a JWKS document.
#[derive(Debug, Clone)]
pub struct JwksSettings {
    pub url: String,
    pub fetch_timeout: Duration,
    pub cache_ttl: Duration,
    pub max_stale: Duration,
    pub min_refresh_interval: Duration,
}

#[derive(Debug, Error)]
enum FetchError {
    #[error("request timed out after {0:?}")]
    Timeout(Duration),
    #[error("request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("document contained no usable signing keys")]
    NoUsableKeys,
}

#[derive(Debug)]
struct CachedKeys {
    keys: Arc<KeySet>,
    fetched_at: Instant,
}

/// Fetches and caches the identity provider's signing keys.
#[derive(Debug)]
pub struct JwksClient {
    settings: JwksSettings,
    http: reqwest::Client,
    cache: ArcSwapOption<CachedKeys>,
    /// Serializes refreshes; holds the time of the last fetch attempt.
    last_attempt: Mutex<Option<Instant>>,
    clock: SharedClock,
}

impl JwksClient {
    /// Create a client. No request is made until keys are first needed
    /// or [`JwksClient::prefetch`] is called.
    pub fn new(settings: JwksSettings, clock: SharedClock) -> Result<Self, reqwest::Error> {
        let http = reqwest::Client::builder()
            .connect_timeout(settings.fetch_timeout)
            .build()?;

        Ok(Self {
            settings,
            http,
            cache: ArcSwapOption::empty(),
            last_attempt: Mutex::new(None),
            clock,
        })
    }

    /// Whether a key set is currently cached.
    pub fn has_keys(&self) -> bool {
        self.cache.load().is_some()
    }

    /// Fetch keys ahead of the first request. Failures are logged only.
    pub async fn prefetch(&self) {
        if let Err(e) = self.refresh().await {
            warn!(error = %e, url = %self.settings.url, "Initial JWKS fetch failed");
        }
    }

    /// Key set to verify a token naming `kid` against.
    pub async fn key_set(&self, kid: Option<&str>) -> Result<Arc<KeySet>, AuthError> {
        let now = self.clock.monotonic();

        if let Some(cached) = self.cache.load_full() {
            let age = now.saturating_duration_since(cached.fetched_at);
            let knows_kid = kid.is_none_or(|kid| cached.keys.contains_kid(kid));

            if age < self.settings.cache_ttl && (knows_kid || age < self.settings.min_refresh_interval) {
                return Ok(cached.keys.clone());
            }
        }

        self.refresh().await
    }

    async fn refresh(&self) -> Result<Arc<KeySet>, AuthError> {
        let mut last_attempt = self.last_attempt.lock().await;
        let now = self.clock.monotonic();

        // Another task may have fetched while we waited for the lock,
        // or a recent attempt failed and should not be retried yet.
        let throttled = last_attempt
            .is_some_and(|at| now.saturating_duration_since(at) < self.settings.min_refresh_interval);
        if throttled {
            debug!("JWKS refresh throttled, serving cached keys");
            return self.cached_within(self.settings.max_stale, now);
        }

        *last_attempt = Some(now);

        match self.fetch().await {
            Ok(keys) => {
                let keys = Arc::new(keys);
                info!(keys = keys.len(), url = %self.settings.url, "JWKS refreshed");
                metrics::record_jwks_refresh("success");
                self.cache.store(Some(Arc::new(CachedKeys {
                    keys: keys.clone(),
                    fetched_at: now,
                })));
                Ok(keys)
            }
            Err(e) => {
                warn!(error = %e, url = %self.settings.url, "JWKS refresh failed");
                metrics::record_jwks_refresh("failure");
                self.cached_within(self.settings.max_stale, now)
            }
        }
    }

    fn cached_within(&self, max_age: Duration, now: Instant) -> Result<Arc<KeySet>, AuthError> {
        match self.cache.load_full() {
            Some(cached) if now.saturating_duration_since(cached.fetched_at) < max_age => {
                Ok(cached.keys.clone())
            }
            _ => Err(AuthError::IssuerUnreachable),
        }
    }

    async fn fetch(&self) -> Result<KeySet, FetchError> {
        let request = async {
            let response = self
                .http
                .get(&self.settings.url)
                .send()
                .await?
                .error_for_status()?;
            response.json::<JwkSet>().await
        };

        let jwks = tokio::time::timeout(self.settings.fetch_timeout, request)
            .await
            .map_err(|_| FetchError::Timeout(self.settings.fetch_timeout))??;

        let keys = KeySet::from_jwks(&jwks);
        if keys.is_empty() {
            return Err(FetchError::NoUsableKeys);
        }
        Ok(keys)
    }
}
