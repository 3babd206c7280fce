//! Shared application state for the pipeline and handlers.
//!
//! Every admission component is built once from [`Config`] and shared by
//! `Arc`, so cloning the state per request is cheap. It includes:
//!
//! - **Gatekeeper**: token validation and admin sessions
//! - **Rate limiting**: the per-class sliding windows and the brute-force guard
//! - **Audit**: the append-only audit logger
//! - **Policy inputs**: admin allowlist, trusted proxies, security headers
//!
//! # Structured Concurrency
//!
//! Background tasks (the sweeper and the JWKS pre-warm) are managed using
//! `tokio_util::task::TaskTracker` and `CancellationToken`. Call
//! `shutdown()` to stop them before application exit.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::time::interval;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, trace};

use crate::audit::{AuditLogger, AuditSink, JsonlAuditSink, MemoryAuditSink};
use crate::auth::jwks::JwksClient;
use crate::auth::keys::StaticKeys;
use crate::auth::{
    AdminDirectory, Gatekeeper, KeySource, MemorySessionStore, SessionManager, TokenValidator,
};
use crate::clock::{SharedClock, SystemClock};
use crate::config::Config;
use crate::error::{AppError, AppResult};
use crate::middleware::auth_failures::AuthFailureGuard;
use crate::middleware::ip::TrustedProxyConfig;
use crate::middleware::rate_limit::RateLimiter;
use crate::middleware::security_headers::SecurityHeaderSet;

/// How long an expired session stays in the store before the sweeper drops it.
const EXPIRED_SESSION_GRACE: Duration = Duration::from_secs(60);

/// Shared application state.
///
/// # Lifecycle
///
/// Background tasks are spawned when the state is created. Call `shutdown()`
/// before dropping to ensure clean task termination:
///
/// ```rust,ignore
/// let state = AppState::new(config).await?;
/// // ... serve ...
/// state.shutdown().await;
/// ```
#[derive(Clone)]
pub struct AppState {
    /// Application configuration
    pub config: Arc<Config>,
    /// Time source shared by every component
    pub clock: SharedClock,
    /// Resolves credentials into identities
    pub gatekeeper: Gatekeeper,
    /// Per-class request admission
    pub limiter: Arc<RateLimiter>,
    /// Lockout after repeated credential failures
    pub failures: Arc<AuthFailureGuard>,
    /// Privileged action trail
    pub audit: Arc<AuditLogger>,
    /// Allowlisted admin emails
    pub admins: Arc<AdminDirectory>,
    /// Headers stamped on every response
    pub headers: Arc<SecurityHeaderSet>,
    /// Proxies whose forwarding headers are believed
    pub proxies: Arc<TrustedProxyConfig>,
    /// Normalized paths that skip the rate limiter
    pub exempt_paths: Arc<HashSet<String>>,
    /// Timestamp when the application started
    pub started_at: Instant,
    task_tracker: TaskTracker,
    cancellation_token: CancellationToken,
}

impl AppState {
    /// Build state from configuration with the system clock.
    ///
    /// The audit log is a JSONL file when `AUDIT_LOG_PATH` is set and an
    /// in-memory sink otherwise.
    pub async fn new(config: Config) -> AppResult<Self> {
        let sink: Arc<dyn AuditSink> = match &config.audit_log_path {
            Some(path) => Arc::new(JsonlAuditSink::open(path).await?),
            None => {
                info!("AUDIT_LOG_PATH not set, audit records are kept in memory");
                Arc::new(MemoryAuditSink::new())
            }
        };
        Self::build(config, SystemClock::shared(), sink).await
    }

    /// Build state with an explicit clock and audit sink.
    ///
    /// # Errors
    ///
    /// Returns `AppError::ConfigError` for an invalid configuration and
    /// `AppError::Audit` if the audit log cannot be resumed.
    pub async fn build(config: Config, clock: SharedClock, sink: Arc<dyn AuditSink>) -> AppResult<Self> {
        config.validate()?;

        let keys = match (&config.jwt_hs256_secret, config.jwks_settings()) {
            (Some(secret), None) => KeySource::Static(StaticKeys::new(
                secret.expose().as_bytes(),
                config
                    .jwt_hs256_retiring_secret
                    .as_ref()
                    .map(|s| s.expose().as_bytes()),
            )),
            (None, Some(settings)) => KeySource::Remote(
                JwksClient::new(settings, clock.clone())
                    .map_err(|e| AppError::ConfigError(format!("Failed to build JWKS client: {e}")))?,
            ),
            _ => {
                return Err(AppError::ConfigError(
                    "Exactly one of JWT_HS256_SECRET or JWKS_URL must be set".to_string(),
                ));
            }
        };
        let tokens = Arc::new(TokenValidator::new(config.token_settings(), keys, clock.clone()));

        let sessions = Arc::new(SessionManager::new(
            config.admin_session_secret.expose().as_bytes(),
            config.session_ttl,
            Arc::new(MemorySessionStore::new()),
            clock.clone(),
        )?);

        let limiter = RateLimiter::new(config.class_limits(), config.rate_limit_retention, clock.clone())
            .map_err(|e| AppError::ConfigError(e.to_string()))?;

        let failures = AuthFailureGuard::new(
            config.auth_failure_limit_per_minute,
            config.auth_failure_burst,
            clock.clone(),
        );

        let audit = AuditLogger::open(sink, clock.clone()).await?;

        let state = Self {
            gatekeeper: Gatekeeper::new(tokens, sessions, &config.admin_cookie_name),
            limiter: Arc::new(limiter),
            failures: Arc::new(failures),
            audit: Arc::new(audit),
            admins: Arc::new(AdminDirectory::new(config.allowed_admin_emails.iter().cloned())),
            headers: Arc::new(SecurityHeaderSet::default()),
            proxies: Arc::new(TrustedProxyConfig::new(&config.trusted_proxies)),
            exempt_paths: Arc::new(
                config
                    .rate_limit_exempt_paths
                    .iter()
                    .map(|p| crate::auth::normalize_path(p).into_owned())
                    .collect(),
            ),
            config: Arc::new(config),
            clock,
            started_at: Instant::now(),
            task_tracker: TaskTracker::new(),
            cancellation_token: CancellationToken::new(),
        };

        state.spawn_sweeper_task();
        state.spawn_jwks_prewarm_task();

        Ok(state)
    }

    /// Whether a verification key set is available.
    pub fn is_ready(&self) -> bool {
        self.gatekeeper.tokens().key_source().is_ready()
    }

    /// Run one sweep: idle rate windows, expired sessions, stale lockouts.
    pub fn sweep(&self) {
        sweep_once(&self.limiter, self.gatekeeper.sessions(), &self.failures);
    }

    /// Spawn the periodic sweeper.
    ///
    /// The task holds only the components it sweeps, not the whole state.
    fn spawn_sweeper_task(&self) {
        let limiter = self.limiter.clone();
        let sessions = self.gatekeeper.sessions().clone();
        let failures = self.failures.clone();
        let period = self.config.sweep_interval;
        let cancel = self.cancellation_token.clone();

        self.task_tracker.spawn(async move {
            let mut ticker = interval(period);
            ticker.tick().await; // Skip first immediate tick

            loop {
                tokio::select! {
                    biased;

                    _ = cancel.cancelled() => {
                        debug!("Sweeper task received cancellation signal");
                        break;
                    }
                    _ = ticker.tick() => {
                        sweep_once(&limiter, &sessions, &failures);
                    }
                }
            }

            debug!("Sweeper task shutting down");
        });
    }

    /// Fetch the identity provider's keys at startup and once per cache TTL
    /// afterwards, so requests rarely wait on the network.
    fn spawn_jwks_prewarm_task(&self) {
        let Some(period) = self.config.jwks_settings().map(|s| s.cache_ttl) else {
            return;
        };
        let tokens = self.gatekeeper.tokens().clone();
        let cancel = self.cancellation_token.clone();

        self.task_tracker.spawn(async move {
            let KeySource::Remote(client) = tokens.key_source() else {
                return;
            };

            let mut ticker = interval(period);
            loop {
                tokio::select! {
                    biased;

                    _ = cancel.cancelled() => {
                        debug!("JWKS pre-warm task received cancellation signal");
                        break;
                    }
                    _ = ticker.tick() => {
                        client.prefetch().await;
                    }
                }
            }

            debug!("JWKS pre-warm task shutting down");
        });
    }

    /// Gracefully shutdown all background tasks.
    ///
    /// This method:
    /// 1. Signals all tasks to stop via cancellation token
    /// 2. Closes the task tracker (prevents new tasks)
    /// 3. Waits for all tasks to complete
    pub async fn shutdown(&self) {
        info!("Initiating graceful shutdown of background tasks");

        self.cancellation_token.cancel();
        self.task_tracker.close();
        self.task_tracker.wait().await;

        info!("All background tasks have completed");
    }

    /// Get the application uptime in seconds.
    pub fn uptime_seconds(&self) -> u64 {
        self.started_at.elapsed().as_secs()
    }
}

fn sweep_once(limiter: &RateLimiter, sessions: &SessionManager, failures: &AuthFailureGuard) {
    let evicted_windows = limiter.evict_idle();
    let purged_sessions = sessions.purge_expired(EXPIRED_SESSION_GRACE);
    failures.sweep();
    trace!(evicted_windows, purged_sessions, "Sweep completed");
}
