//! Application configuration loaded from environment variables.
//!
//! Configuration is read once at startup, validated, and then shared
//! immutably. Anything that can be wrong with it (a missing secret, two key
//! sources, a zero-length rate window) is reported here as
//! `AppError::ConfigError`, before the listener is bound.
//!
//! # Token Verification
//!
//! Exactly one key source must be configured:
//!
//! - `JWT_HS256_SECRET` (optionally with `JWT_HS256_RETIRING_SECRET` during a
//!   rotation), or
//! - `JWKS_URL`, fetched with `JWKS_FETCH_TIMEOUT_MS` and cached for
//!   `JWKS_CACHE_TTL_SECS`, serving stale keys for at most
//!   `JWKS_MAX_STALE_SECS` while the identity provider is unreachable.
//!
//! # Admin Sessions
//!
//! - `ADMIN_SESSION_SECRET`: sealing secret, at least 32 bytes (required)
//! - `SESSION_TTL_SECS`: session lifetime (default: 3600)
//! - `ALLOWED_ADMIN_EMAILS`: comma-separated allowlist for admin login
//!
//! # Rate Limiting
//!
//! One `(requests, window)` pair per route class: `RATE_LIMIT_*` for content,
//! `AUTH_RATE_LIMIT_*` and `ADMIN_RATE_LIMIT_*`.

use std::env;
use std::fmt;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::auth::jwks::JwksSettings;
use crate::auth::session::MIN_SECRET_LEN;
use crate::auth::{DEFAULT_COOKIE_NAME, TokenSettings};
use crate::error::{AppError, AppResult};
use crate::middleware::rate_limit::{ClassLimits, RateRule};

/// A configuration value that must never appear in logs.
#[derive(Clone, PartialEq, Eq)]
pub struct Secret(String);

impl Secret {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn expose(&self) -> &str {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Debug for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Secret(<redacted>)")
    }
}

/// Log output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

impl FromStr for LogFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "pretty" | "text" => Ok(LogFormat::Pretty),
            "json" => Ok(LogFormat::Json),
            other => Err(format!("expected 'pretty' or 'json', got '{other}'")),
        }
    }
}

impl fmt::Display for LogFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LogFormat::Pretty => f.write_str("pretty"),
            LogFormat::Json => f.write_str("json"),
        }
    }
}

/// Application configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    // =========================================================================
    // Server
    // =========================================================================
    /// Bind address (default: "0.0.0.0")
    pub host: String,

    /// Listen port (default: 8000)
    pub port: u16,

    /// Maximum request body size in bytes (default: 1 MiB)
    pub max_request_body_size: usize,

    /// Allowed CORS origins; "*" allows any (default: "*")
    pub cors_allowed_origins: Vec<String>,

    // =========================================================================
    // Rate Limiting
    // =========================================================================
    pub rate_limit_requests: u32,
    pub rate_limit_window: Duration,
    pub auth_rate_limit_requests: u32,
    pub auth_rate_limit_window: Duration,
    pub admin_rate_limit_requests: u32,
    pub admin_rate_limit_window: Duration,

    /// How long an idle rate window is kept (default: 300s)
    pub rate_limit_retention: Duration,

    /// Background sweep period for rate windows and sessions (default: 30s)
    pub sweep_interval: Duration,

    /// Paths that skip the rate limiter (default: "/health,/ready,/")
    pub rate_limit_exempt_paths: Vec<String>,

    /// CIDR ranges whose forwarding headers are believed (default: none)
    pub trusted_proxies: Vec<String>,

    // =========================================================================
    // Token Verification
    // =========================================================================
    /// Trusted `iss` value (required)
    pub jwt_issuer: String,

    /// Required `aud` value (optional)
    pub jwt_audience: Option<String>,

    pub jwt_hs256_secret: Option<Secret>,
    pub jwt_hs256_retiring_secret: Option<Secret>,

    pub jwks_url: Option<String>,
    pub jwks_fetch_timeout: Duration,
    pub jwks_cache_ttl: Duration,
    pub jwks_max_stale: Duration,

    /// Minimum spacing between JWKS fetches triggered by unknown `kid`s
    pub jwks_min_refresh_interval: Duration,

    /// Grace period for `exp`/`nbf` (default: 0)
    pub jwt_leeway_secs: u64,

    // =========================================================================
    // Admin Sessions
    // =========================================================================
    pub admin_session_secret: Secret,
    pub session_ttl: Duration,
    pub admin_cookie_name: String,
    pub allowed_admin_emails: Vec<String>,

    /// Roles route capabilities may name (default: "admin,editor")
    pub known_roles: Vec<String>,

    // =========================================================================
    // Audit & Brute-Force Protection
    // =========================================================================
    /// JSONL audit log; in-memory when unset
    pub audit_log_path: Option<PathBuf>,

    pub auth_failure_limit_per_minute: u32,
    pub auth_failure_burst: u32,

    // =========================================================================
    // Observability
    // =========================================================================
    pub log_format: LogFormat,

    /// Log filter (e.g., "info", "portal_guard=debug")
    pub log_level: String,

    /// Prometheus listener port (default: 9090, 0 = disabled)
    pub metrics_port: u16,
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// # Errors
    ///
    /// Returns `AppError::ConfigError` for unparseable values, missing
    /// required values, or an inconsistent combination.
    pub fn from_env() -> AppResult<Self> {
        // A missing .env file is fine
        let _ = dotenvy::dotenv();

        let config = Self {
            host: env::var("HOST").unwrap_or_else(|_| "0.0.0.0".to_string()),
            port: Self::parse_env("PORT", 8000)?,
            max_request_body_size: Self::parse_env("MAX_REQUEST_BODY_SIZE", 1024 * 1024)?,
            cors_allowed_origins: Self::parse_list("CORS_ALLOWED_ORIGINS", "*"),

            rate_limit_requests: Self::parse_env("RATE_LIMIT_REQUESTS", 100)?,
            rate_limit_window: Self::parse_secs("RATE_LIMIT_WINDOW_SECS", 60)?,
            auth_rate_limit_requests: Self::parse_env("AUTH_RATE_LIMIT_REQUESTS", 10)?,
            auth_rate_limit_window: Self::parse_secs("AUTH_RATE_LIMIT_WINDOW_SECS", 60)?,
            admin_rate_limit_requests: Self::parse_env("ADMIN_RATE_LIMIT_REQUESTS", 60)?,
            admin_rate_limit_window: Self::parse_secs("ADMIN_RATE_LIMIT_WINDOW_SECS", 60)?,
            rate_limit_retention: Self::parse_secs("RATE_LIMIT_RETENTION_SECS", 300)?,
            sweep_interval: Self::parse_secs("SWEEP_INTERVAL_SECS", 30)?,
            rate_limit_exempt_paths: Self::parse_list("RATE_LIMIT_EXEMPT_PATHS", "/health,/ready,/"),
            trusted_proxies: Self::parse_list("TRUSTED_PROXIES", ""),

            jwt_issuer: Self::optional("JWT_ISSUER").unwrap_or_default(),
            jwt_audience: Self::optional("JWT_AUDIENCE"),
            jwt_hs256_secret: Self::optional("JWT_HS256_SECRET").map(Secret),
            jwt_hs256_retiring_secret: Self::optional("JWT_HS256_RETIRING_SECRET").map(Secret),
            jwks_url: Self::optional("JWKS_URL"),
            jwks_fetch_timeout: Duration::from_millis(Self::parse_env("JWKS_FETCH_TIMEOUT_MS", 3000)?),
            jwks_cache_ttl: Self::parse_secs("JWKS_CACHE_TTL_SECS", 600)?,
            jwks_max_stale: Self::parse_secs("JWKS_MAX_STALE_SECS", 3600)?,
            jwks_min_refresh_interval: Self::parse_secs("JWKS_MIN_REFRESH_SECS", 30)?,
            jwt_leeway_secs: Self::parse_env("JWT_LEEWAY_SECS", 0)?,

            admin_session_secret: Secret(Self::optional("ADMIN_SESSION_SECRET").unwrap_or_default()),
            session_ttl: Self::parse_secs("SESSION_TTL_SECS", 3600)?,
            admin_cookie_name: env::var("ADMIN_COOKIE_NAME").unwrap_or_else(|_| DEFAULT_COOKIE_NAME.to_string()),
            allowed_admin_emails: Self::parse_list("ALLOWED_ADMIN_EMAILS", ""),
            known_roles: Self::parse_list("KNOWN_ROLES", "admin,editor"),

            audit_log_path: Self::optional("AUDIT_LOG_PATH").map(PathBuf::from),
            auth_failure_limit_per_minute: Self::parse_env("AUTH_FAILURE_LIMIT_PER_MINUTE", 10)?,
            auth_failure_burst: Self::parse_env("AUTH_FAILURE_BURST", 5)?,

            log_format: Self::parse_env("LOG_FORMAT", LogFormat::Pretty)?,
            log_level: env::var("RUST_LOG").unwrap_or_else(|_| "info".to_string()),
            metrics_port: Self::parse_env("METRICS_PORT", 9090)?,
        };

        config.validate()?;
        Ok(config)
    }

    /// Check values for consistency.
    ///
    /// # Errors
    ///
    /// Returns `AppError::ConfigError` naming the offending variable.
    pub fn validate(&self) -> AppResult<()> {
        match (&self.jwt_hs256_secret, &self.jwks_url) {
            (Some(_), Some(_)) => {
                return Err(AppError::ConfigError(
                    "Configure either JWT_HS256_SECRET or JWKS_URL, not both".to_string(),
                ));
            }
            (None, None) => {
                return Err(AppError::ConfigError(
                    "One of JWT_HS256_SECRET or JWKS_URL is required".to_string(),
                ));
            }
            _ => {}
        }

        if self.jwt_hs256_retiring_secret.is_some() && self.jwt_hs256_secret.is_none() {
            return Err(AppError::ConfigError(
                "JWT_HS256_RETIRING_SECRET requires JWT_HS256_SECRET".to_string(),
            ));
        }

        if let Some(url) = &self.jwks_url
            && !(url.starts_with("https://") || url.starts_with("http://"))
        {
            return Err(AppError::ConfigError(format!(
                "JWKS_URL must be an http(s) URL, got '{url}'"
            )));
        }

        if self.jwt_issuer.is_empty() {
            return Err(AppError::ConfigError("JWT_ISSUER is required".to_string()));
        }

        if self.admin_session_secret.len() < MIN_SECRET_LEN {
            return Err(AppError::ConfigError(format!(
                "ADMIN_SESSION_SECRET must be at least {MIN_SECRET_LEN} bytes"
            )));
        }

        for (name, value) in [
            ("RATE_LIMIT_REQUESTS", self.rate_limit_requests),
            ("AUTH_RATE_LIMIT_REQUESTS", self.auth_rate_limit_requests),
            ("ADMIN_RATE_LIMIT_REQUESTS", self.admin_rate_limit_requests),
        ] {
            if value == 0 {
                return Err(AppError::ConfigError(format!("{name} must be greater than 0")));
            }
        }

        for (name, value) in [
            ("RATE_LIMIT_WINDOW_SECS", self.rate_limit_window),
            ("AUTH_RATE_LIMIT_WINDOW_SECS", self.auth_rate_limit_window),
            ("ADMIN_RATE_LIMIT_WINDOW_SECS", self.admin_rate_limit_window),
            ("SWEEP_INTERVAL_SECS", self.sweep_interval),
            ("SESSION_TTL_SECS", self.session_ttl),
            ("JWKS_FETCH_TIMEOUT_MS", self.jwks_fetch_timeout),
        ] {
            if value.is_zero() {
                return Err(AppError::ConfigError(format!("{name} must be greater than 0")));
            }
        }

        if self.jwks_max_stale < self.jwks_cache_ttl {
            return Err(AppError::ConfigError(format!(
                "JWKS_MAX_STALE_SECS ({:?}) must be >= JWKS_CACHE_TTL_SECS ({:?})",
                self.jwks_max_stale, self.jwks_cache_ttl
            )));
        }

        if self.max_request_body_size == 0 {
            return Err(AppError::ConfigError(
                "MAX_REQUEST_BODY_SIZE must be greater than 0".to_string(),
            ));
        }

        if self.admin_cookie_name.is_empty()
            || !self
                .admin_cookie_name
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
        {
            return Err(AppError::ConfigError(format!(
                "ADMIN_COOKIE_NAME '{}' is not a valid cookie name",
                self.admin_cookie_name
            )));
        }

        Ok(())
    }

    pub fn server_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn metrics_enabled(&self) -> bool {
        self.metrics_port > 0
    }

    /// Metrics listener address, `None` when disabled.
    pub fn metrics_addr(&self) -> Option<SocketAddr> {
        self.metrics_enabled()
            .then(|| SocketAddr::from(([0, 0, 0, 0], self.metrics_port)))
    }

    pub fn class_limits(&self) -> ClassLimits {
        ClassLimits {
            content: RateRule::new(self.rate_limit_requests, self.rate_limit_window),
            auth: RateRule::new(self.auth_rate_limit_requests, self.auth_rate_limit_window),
            admin: RateRule::new(self.admin_rate_limit_requests, self.admin_rate_limit_window),
        }
    }

    pub fn token_settings(&self) -> TokenSettings {
        TokenSettings {
            issuer: self.jwt_issuer.clone(),
            audience: self.jwt_audience.clone(),
            leeway_secs: self.jwt_leeway_secs,
        }
    }

    /// JWKS settings when tokens are verified against a remote key set.
    pub fn jwks_settings(&self) -> Option<JwksSettings> {
        self.jwks_url.as_ref().map(|url| JwksSettings {
            url: url.clone(),
            fetch_timeout: self.jwks_fetch_timeout,
            cache_ttl: self.jwks_cache_ttl,
            max_stale: self.jwks_max_stale,
            min_refresh_interval: self.jwks_min_refresh_interval,
        })
    }

    fn parse_env<T>(name: &str, default: T) -> AppResult<T>
    where
        T: FromStr,
        T::Err: fmt::Display,
    {
        match env::var(name) {
            Ok(val) => val
                .trim()
                .parse()
                .map_err(|e| AppError::ConfigError(format!("Invalid {name}: {e}"))),
            Err(_) => Ok(default),
        }
    }

    fn parse_secs(name: &str, default: u64) -> AppResult<Duration> {
        Self::parse_env(name, default).map(Duration::from_secs)
    }

    /// Non-empty value of `name`.
    fn optional(name: &str) -> Option<String> {
        env::var(name).ok().map(|v| v.trim().to_string()).filter(|v| !v.is_empty())
    }

    /// Comma-separated list, entries trimmed, empty entries dropped.
    fn parse_list(name: &str, default: &str) -> Vec<String> {
        split_list(&env::var(name).unwrap_or_else(|_| default.to_string()))
    }
}

fn split_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}

/// Development defaults: a static HS256 key source and a fixed session
/// secret. Production deployments load with `Config::from_env()`.
impl Default for Config {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8000,
            max_request_body_size: 1024 * 1024,
            cors_allowed_origins: vec!["*".to_string()],

            rate_limit_requests: 100,
            rate_limit_window: Duration::from_secs(60),
            auth_rate_limit_requests: 10,
            auth_rate_limit_window: Duration::from_secs(60),
            admin_rate_limit_requests: 60,
            admin_rate_limit_window: Duration::from_secs(60),
            rate_limit_retention: Duration::from_secs(300),
            sweep_interval: Duration::from_secs(30),
            rate_limit_exempt_paths: split_list("/health,/ready,/"),
            trusted_proxies: Vec::new(),

            jwt_issuer: "https://issuer.localhost/".to_string(),
            jwt_audience: None,
            jwt_hs256_secret: Some(Secret::new("development-bearer-secret")),
            jwt_hs256_retiring_secret: None,
            jwks_url: None,
            jwks_fetch_timeout: Duration::from_millis(3000),
            jwks_cache_ttl: Duration::from_secs(600),
            jwks_max_stale: Duration::from_secs(3600),
            jwks_min_refresh_interval: Duration::from_secs(30),
            jwt_leeway_secs: 0,

            admin_session_secret: Secret::new("development-session-secret-0123456789"),
            session_ttl: Duration::from_secs(3600),
            admin_cookie_name: DEFAULT_COOKIE_NAME.to_string(),
            allowed_admin_emails: Vec::new(),
            known_roles: split_list("admin,editor"),

            audit_log_path: None,
            auth_failure_limit_per_minute: 10,
            auth_failure_burst: 5,

            log_format: LogFormat::Pretty,
            log_level: "info".to_string(),
            metrics_port: 9090,
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    fn expect_error(config: Config, needle: &str) {
        let err = config.validate().unwrap_err().to_string();
        assert!(err.contains(needle), "'{err}' does not mention {needle}");
    }

    #[test]
    fn test_default_config_is_valid() {
        let config = Config::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.port, 8000);
        assert_eq!(config.session_ttl, Duration::from_secs(3600));
        assert_eq!(config.rate_limit_exempt_paths, vec!["/health", "/ready", "/"]);
    }

    #[test]
    fn test_server_addr_format() {
        let config = Config {
            host: "127.0.0.1".to_string(),
            port: 8080,
            ..Config::default()
        };
        assert_eq!(config.server_addr(), "127.0.0.1:8080");
    }

    #[test]
    fn test_exactly_one_key_source() {
        expect_error(
            Config {
                jwks_url: Some("https://issuer.example/.well-known/jwks.json".to_string()),
                ..Config::default()
            },
            "not both",
        );
        expect_error(
            Config {
                jwt_hs256_secret: None,
                ..Config::default()
            },
            "is required",
        );
    }

    #[test]
    fn test_jwks_url_scheme() {
        expect_error(
            Config {
                jwt_hs256_secret: None,
                jwks_url: Some("ftp://keys".to_string()),
                ..Config::default()
            },
            "JWKS_URL",
        );
    }

    #[test]
    fn test_short_session_secret() {
        expect_error(
            Config {
                admin_session_secret: Secret::new("too-short"),
                ..Config::default()
            },
            "ADMIN_SESSION_SECRET",
        );
    }

    #[test]
    fn test_zero_limits_and_windows() {
        expect_error(
            Config {
                auth_rate_limit_requests: 0,
                ..Config::default()
            },
            "AUTH_RATE_LIMIT_REQUESTS",
        );
        expect_error(
            Config {
                admin_rate_limit_window: Duration::ZERO,
                ..Config::default()
            },
            "ADMIN_RATE_LIMIT_WINDOW_SECS",
        );
    }

    #[test]
    fn test_stale_window_ordering() {
        expect_error(
            Config {
                jwks_cache_ttl: Duration::from_secs(600),
                jwks_max_stale: Duration::from_secs(60),
                ..Config::default()
            },
            "JWKS_MAX_STALE_SECS",
        );
    }

    #[test]
    fn test_cookie_name_validation() {
        expect_error(
            Config {
                admin_cookie_name: "bad name;".to_string(),
                ..Config::default()
            },
            "ADMIN_COOKIE_NAME",
        );
    }

    #[test]
    fn test_secret_debug_is_redacted() {
        let rendered = format!("{:?}", Config::default());
        assert!(!rendered.contains("development-session-secret"));
        assert!(rendered.contains("<redacted>"));
    }

    #[test]
    fn test_log_format_parsing() {
        assert_eq!("JSON".parse::<LogFormat>().unwrap(), LogFormat::Json);
        assert_eq!("pretty".parse::<LogFormat>().unwrap(), LogFormat::Pretty);
        assert!("xml".parse::<LogFormat>().is_err());
    }

    #[test]
    fn test_derived_settings() {
        let config = Config::default();
        assert_eq!(config.class_limits().auth, RateRule::new(10, Duration::from_secs(60)));
        assert!(config.jwks_settings().is_none());
        assert_eq!(config.token_settings().issuer, "https://issuer.localhost/");
        assert_eq!(
            config.metrics_addr(),
            Some(SocketAddr::from(([0, 0, 0, 0], 9090)))
        );
    }

    #[test]
    fn test_split_list() {
        assert_eq!(split_list(" a@x.com , ,b@x.com"), vec!["a@x.com", "b@x.com"]);
        assert!(split_list("").is_empty());
    }
}
