//! First-party admin sessions.
//!
//! # Session Lifecycle
//!
//! ```text
//!            create_session
//!                  │
//!                  ▼
//!             ┌─────────┐   now >= expires_at   ┌─────────┐
//!             │ Active  │ ────────────────────▶ │ Expired │
//!             └────┬────┘                       └─────────┘
//!                  │ revoke_session / rotate_secret
//!                  ▼
//!             ┌─────────┐
//!             │ Revoked │
//!             └─────────┘
//! ```
//!
//! Both terminal states are irreversible.
//!
//! # Credential Format
//!
//! The client holds a compact HS256 credential whose `kid` header names the
//! secret version it was sealed under. The credential only *names* the
//! session; the authoritative state (revocation, expiry, version) lives in
//! the [`SessionStore`]. A credential sealed under a secret version other
//! than the active one is treated as revoked, so rotating the secret logs
//! every admin out.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use jsonwebtoken::{Algorithm, DecodingKey, EncodingKey, Header, Validation, decode, decode_header, encode};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use super::claims::AdminIdentity;
use super::error::AuthError;
use crate::clock::SharedClock;
use crate::error::{AppError, AppResult};
use crate::metrics;

/// Minimum length of a session sealing secret in bytes.
pub const MIN_SECRET_LEN: usize = 32;

/// Session identifier entropy in bytes.
const SESSION_ID_BYTES: usize = 32;

const KID_PREFIX: &str = "session-v";

/// A first-party admin session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AdminSession {
    pub id: String,
    pub admin: AdminIdentity,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub secret_version: u32,
}

/// Observable state of a session at a point in time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Active,
    Expired,
    Revoked,
}

/// Stored form of a session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionRecord {
    pub session: AdminSession,
    pub revoked_at: Option<DateTime<Utc>>,
}

impl SessionRecord {
    /// State at `now`. Revocation takes precedence over expiry.
    pub fn state(&self, now: DateTime<Utc>) -> SessionState {
        if self.revoked_at.is_some() {
            SessionState::Revoked
        } else if now >= self.session.expires_at {
            SessionState::Expired
        } else {
            SessionState::Active
        }
    }
}

/// Storage seam for session records, keyed by session id.
///
/// Implementations must make a completed [`SessionStore::revoke`] visible to
/// every later [`SessionStore::get`].
pub trait SessionStore: Send + Sync + fmt::Debug {
    fn insert(&self, record: SessionRecord);

    fn get(&self, id: &str) -> Option<SessionRecord>;

    /// Mark a session revoked. Returns `true` if this call revoked it.
    fn revoke(&self, id: &str, at: DateTime<Utc>) -> bool;

    /// Drop every record for which `keep` returns `false`.
    fn retain(&self, keep: &dyn Fn(&SessionRecord) -> bool) -> usize;

    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// In-memory session store backed by a sharded map.
#[derive(Debug, Default)]
pub struct MemorySessionStore {
    records: DashMap<String, SessionRecord>,
}

impl MemorySessionStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl SessionStore for MemorySessionStore {
    fn insert(&self, record: SessionRecord) {
        self.records.insert(record.session.id.clone(), record);
    }

    fn get(&self, id: &str) -> Option<SessionRecord> {
        self.records.get(id).map(|r| r.value().clone())
    }

    fn revoke(&self, id: &str, at: DateTime<Utc>) -> bool {
        match self.records.get_mut(id) {
            Some(mut record) if record.revoked_at.is_none() => {
                record.revoked_at = Some(at);
                true
            }
            _ => false,
        }
    }

    fn retain(&self, keep: &dyn Fn(&SessionRecord) -> bool) -> usize {
        let before = self.records.len();
        self.records.retain(|_, record| keep(record));
        before.saturating_sub(self.records.len())
    }

    fn len(&self) -> usize {
        self.records.len()
    }
}

/// Sealing secret for one version.
struct SessionSecret {
    version: u32,
    encoding: EncodingKey,
    decoding: DecodingKey,
}

impl SessionSecret {
    fn new(version: u32, secret: &[u8]) -> Self {
        Self {
            version,
            encoding: EncodingKey::from_secret(secret),
            decoding: DecodingKey::from_secret(secret),
        }
    }

    fn kid(&self) -> String {
        format!("{KID_PREFIX}{}", self.version)
    }
}

/// Wire schema of the session credential.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
struct SessionClaims {
    sid: String,
    sub: String,
    email: String,
    iat: i64,
    exp: i64,
    ver: u32,
}

/// A newly created session and the credential handed to the client.
#[derive(Debug, Clone)]
pub struct IssuedSession {
    pub session: AdminSession,
    pub token: String,
}

/// Issues, validates and revokes admin sessions.
pub struct SessionManager {
    secret: ArcSwap<SessionSecret>,
    store: Arc<dyn SessionStore>,
    ttl: Duration,
    clock: SharedClock,
}

impl fmt::Debug for SessionManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionManager")
            .field("secret_version", &self.active_version())
            .field("sessions", &self.store.len())
            .field("ttl", &self.ttl)
            .finish_non_exhaustive()
    }
}

impl SessionManager {
    /// Create a manager sealing credentials with `secret` (version 1).
    ///
    /// # Errors
    ///
    /// Returns `AppError::ConfigError` if the secret is shorter than
    /// [`MIN_SECRET_LEN`].
    pub fn new(
        secret: &[u8],
        ttl: Duration,
        store: Arc<dyn SessionStore>,
        clock: SharedClock,
    ) -> AppResult<Self> {
        check_secret(secret)?;
        Ok(Self {
            secret: ArcSwap::from_pointee(SessionSecret::new(1, secret)),
            store,
            ttl,
            clock,
        })
    }

    /// Currently active secret version.
    pub fn active_version(&self) -> u32 {
        self.secret.load().version
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Create a session for an admin whose primary credential the caller
    /// has already verified.
    pub fn create_session(&self, admin: AdminIdentity) -> AppResult<IssuedSession> {
        let secret = self.secret.load_full();
        let created_at = self.clock.now();
        let ttl = chrono::Duration::from_std(self.ttl)
            .map_err(|e| AppError::Internal(format!("session ttl out of range: {e}")))?;
        let expires_at = created_at + ttl;

        let session = AdminSession {
            id: new_session_id(),
            admin,
            created_at,
            expires_at,
            secret_version: secret.version,
        };

        let claims = SessionClaims {
            sid: session.id.clone(),
            sub: session.admin.subject.clone(),
            email: session.admin.email.clone(),
            iat: created_at.timestamp(),
            exp: expires_at.timestamp(),
            ver: secret.version,
        };
        let header = Header {
            kid: Some(secret.kid()),
            ..Header::new(Algorithm::HS256)
        };
        let token = encode(&header, &claims, &secret.encoding)
            .map_err(|e| AppError::Internal(format!("failed to seal session: {e}")))?;

        self.store.insert(SessionRecord {
            session: session.clone(),
            revoked_at: None,
        });
        metrics::record_session_event("created", 1);

        info!(
            session = %short_id(&session.id),
            admin = %session.admin.email,
            expires_at = %session.expires_at,
            "Admin session created"
        );

        Ok(IssuedSession { session, token })
    }

    /// Resolve a session credential.
    ///
    /// Fails with `Malformed` (unparseable or forged), `Revoked` (explicitly
    /// revoked, unknown, or sealed under a retired secret) or `Expired`.
    pub fn validate_session(&self, token: &str) -> Result<AdminSession, AuthError> {
        let header = decode_header(token).map_err(|_| AuthError::Malformed)?;
        if header.alg != Algorithm::HS256 {
            return Err(AuthError::Malformed);
        }
        let version = header
            .kid
            .as_deref()
            .and_then(|kid| kid.strip_prefix(KID_PREFIX))
            .and_then(|v| v.parse::<u32>().ok())
            .ok_or(AuthError::Malformed)?;

        let secret = self.secret.load_full();
        if version != secret.version {
            debug!(version, active = secret.version, "Session sealed under retired secret");
            return Err(AuthError::Revoked);
        }

        let mut validation = Validation::new(Algorithm::HS256);
        validation.validate_exp = false;
        validation.leeway = 0;
        validation.set_required_spec_claims(&["exp", "sub"]);
        let claims = decode::<SessionClaims>(token, &secret.decoding, &validation)
            .map_err(|_| AuthError::Malformed)?
            .claims;
        if claims.ver != version {
            return Err(AuthError::Malformed);
        }

        let now = self.clock.now();
        let record = self.store.get(&claims.sid);

        match record {
            Some(record) => match record.state(now) {
                SessionState::Revoked => Err(AuthError::Revoked),
                SessionState::Expired => Err(AuthError::Expired),
                SessionState::Active if record.session.secret_version != secret.version => {
                    Err(AuthError::Revoked)
                }
                SessionState::Active => Ok(record.session),
            },
            // Purged after expiry, or never issued by this store.
            None if now.timestamp() >= claims.exp => Err(AuthError::Expired),
            None => Err(AuthError::Revoked),
        }
    }

    /// Revoke a session. Idempotent; returns `true` if this call revoked it.
    pub fn revoke_session(&self, session_id: &str) -> bool {
        let revoked = self.store.revoke(session_id, self.clock.now());
        if revoked {
            metrics::record_session_event("revoked", 1);
            info!(session = %short_id(session_id), "Admin session revoked");
        }
        revoked
    }

    /// Current state of a stored session.
    pub fn session_state(&self, session_id: &str) -> Option<SessionState> {
        self.store.get(session_id).map(|r| r.state(self.clock.now()))
    }

    /// Install a new sealing secret.
    ///
    /// Every session issued under an older version becomes invalid and is
    /// purged from the store. Returns the new version.
    pub fn rotate_secret(&self, secret: &[u8]) -> AppResult<u32> {
        check_secret(secret)?;
        let previous = self
            .secret
            .rcu(|current| SessionSecret::new(current.version.saturating_add(1), secret));
        let next = previous.version.saturating_add(1);

        let purged = self.store.retain(&|record| record.session.secret_version >= next);
        metrics::record_session_event("purged", purged as u64);
        info!(version = next, purged, "Session secret rotated");
        Ok(next)
    }

    /// Rotate to a freshly generated random secret.
    pub fn rotate_random_secret(&self) -> AppResult<u32> {
        let mut secret = [0u8; MIN_SECRET_LEN];
        rand::rng().fill_bytes(&mut secret);
        self.rotate_secret(&secret)
    }

    /// Drop records whose expiry is more than `grace` in the past.
    ///
    /// Revoked records are kept until then too, so a revoked token reports
    /// `Revoked` for as long as it would otherwise have been valid.
    pub fn purge_expired(&self, grace: Duration) -> usize {
        let now = self.clock.now();
        let grace = chrono::Duration::from_std(grace).unwrap_or(chrono::Duration::zero());
        let purged = self.store.retain(&|record| record.session.expires_at + grace > now);
        if purged > 0 {
            metrics::record_session_event("purged", purged as u64);
            debug!(purged, "Purged expired admin sessions");
        }
        metrics::set_active_sessions(self.store.len());
        purged
    }

    pub fn session_count(&self) -> usize {
        self.store.len()
    }
}

fn check_secret(secret: &[u8]) -> AppResult<()> {
    if secret.len() < MIN_SECRET_LEN {
        return Err(AppError::ConfigError(format!(
            "ADMIN_SESSION_SECRET must be at least {MIN_SECRET_LEN} bytes"
        )));
    }
    Ok(())
}

fn new_session_id() -> String {
    let mut bytes = [0u8; SESSION_ID_BYTES];
    rand::rng().fill_bytes(&mut bytes);
    URL_SAFE_NO_PAD.encode(bytes)
}

/// Log-safe prefix of a session id.
pub fn short_id(id: &str) -> &str {
    id.get(..8).unwrap_or(id)
}
