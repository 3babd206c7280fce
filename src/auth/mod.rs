//! Identity resolution: bearer tokens, admin sessions and route policy.
//!
//! [`Gatekeeper`] is the single entry point collaborators use to turn request
//! headers into an [`Identity`]. It reads at most one credential per request:
//!
//! 1. `Authorization: Bearer <token>` → [`TokenValidator`]
//! 2. `X-Admin-Session: <token>` → [`SessionManager`]
//! 3. the admin session cookie → [`SessionManager`]
//!
//! A bearer token takes precedence so an admin can log in again while a
//! stale session cookie is still attached.

pub mod claims;
pub mod error;
pub mod jwks;
pub mod keys;
pub mod policy;
pub mod session;
pub mod token;

use std::sync::Arc;

use axum::http::HeaderMap;
use axum::http::header::{AUTHORIZATION, COOKIE};

pub use claims::{AdminIdentity, Identity, IdentityClaim};
pub use error::AuthError;
pub use policy::{AdminDirectory, Capability, RouteClass, RoutePolicy, RouteTable, normalize_path};
pub use session::{AdminSession, MemorySessionStore, SessionManager, SessionStore};
pub use token::{KeySource, TokenSettings, TokenValidator};

/// Header carrying an admin session token for non-browser clients.
pub const ADMIN_SESSION_HEADER: &str = "x-admin-session";

/// Default name of the admin session cookie.
pub const DEFAULT_COOKIE_NAME: &str = "admin_session";

/// A credential found on a request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Credential {
    Bearer(String),
    /// Session token sent in [`ADMIN_SESSION_HEADER`].
    SessionHeader(String),
    /// Session token sent in the session cookie.
    SessionCookie(String),
}

impl Credential {
    /// Cookies are attached by the browser on every request, so a stale
    /// one says nothing about the caller's intent.
    pub fn is_ambient(&self) -> bool {
        matches!(self, Credential::SessionCookie(_))
    }

    /// The session token, for session credentials.
    pub fn session_token(&self) -> Option<&str> {
        match self {
            Credential::Bearer(_) => None,
            Credential::SessionHeader(token) | Credential::SessionCookie(token) => Some(token),
        }
    }
}

/// Resolves request credentials into identities.
#[derive(Debug, Clone)]
pub struct Gatekeeper {
    tokens: Arc<TokenValidator>,
    sessions: Arc<SessionManager>,
    cookie_name: Arc<str>,
}

impl Gatekeeper {
    pub fn new(tokens: Arc<TokenValidator>, sessions: Arc<SessionManager>, cookie_name: &str) -> Self {
        Self {
            tokens,
            sessions,
            cookie_name: Arc::from(cookie_name),
        }
    }

    pub fn tokens(&self) -> &Arc<TokenValidator> {
        &self.tokens
    }

    pub fn sessions(&self) -> &Arc<SessionManager> {
        &self.sessions
    }

    pub fn cookie_name(&self) -> &str {
        &self.cookie_name
    }

    /// Find the credential a request presents, if any.
    ///
    /// An `Authorization` header with any scheme other than `Bearer`, or an
    /// empty token, is `Malformed`.
    pub fn credential(&self, headers: &HeaderMap) -> Result<Option<Credential>, AuthError> {
        if let Some(value) = headers.get(AUTHORIZATION) {
            let value = value.to_str().map_err(|_| AuthError::Malformed)?;
            let (scheme, token) = value.trim().split_once(' ').ok_or(AuthError::Malformed)?;
            let token = token.trim();
            if !scheme.eq_ignore_ascii_case("bearer") || token.is_empty() {
                return Err(AuthError::Malformed);
            }
            return Ok(Some(Credential::Bearer(token.to_string())));
        }

        if let Some(value) = headers.get(ADMIN_SESSION_HEADER) {
            let token = value.to_str().map_err(|_| AuthError::Malformed)?.trim();
            if token.is_empty() {
                return Err(AuthError::Malformed);
            }
            return Ok(Some(Credential::SessionHeader(token.to_string())));
        }

        Ok(session_cookie(headers, &self.cookie_name).map(Credential::SessionCookie))
    }

    /// Verify a credential.
    pub async fn resolve(&self, credential: &Credential) -> Result<Identity, AuthError> {
        match credential {
            Credential::Bearer(token) => self.tokens.validate(token).await.map(Identity::External),
            Credential::SessionHeader(token) | Credential::SessionCookie(token) => {
                self.sessions.validate_session(token).map(Identity::Admin)
            }
        }
    }

    /// Resolve the identity a request presents. `Ok(None)` when it carries
    /// no credential at all.
    pub async fn authenticate(&self, headers: &HeaderMap) -> Result<Option<Identity>, AuthError> {
        match self.credential(headers)? {
            Some(credential) => self.resolve(&credential).await.map(Some),
            None => Ok(None),
        }
    }
}

/// Value of cookie `name`, if present and non-empty.
fn session_cookie(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get_all(COOKIE)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(';'))
        .filter_map(|pair| pair.trim().split_once('='))
        .find(|(key, _)| *key == name)
        .map(|(_, value)| value.trim().trim_matches('"').to_string())
        .filter(|value| !value.is_empty())
}
