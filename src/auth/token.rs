//! Verification of externally issued bearer tokens.
//!
//! # Check Order
//!
//! 1. Structure: three base64url segments with a parseable header and
//!    payload, otherwise `Malformed`.
//! 2. Validity window: `exp`/`nbf` read from the not-yet-verified payload and
//!    compared with the clock, otherwise `Expired`. Doing this first means a
//!    stale token is reported as `Expired` whatever its signature.
//! 3. Signature against the current key snapshot, otherwise
//!    `SignatureInvalid`.
//! 4. Issuer (and audience, when configured), otherwise `IssuerUntrusted`.
//! 5. Claim schema, otherwise `Malformed`.
//!
//! Time checks use the injected [`Clock`](crate::clock::Clock) rather than
//! the library's own, so the grace period is applied identically to `nbf`
//! and `exp`.

use std::sync::Arc;

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use jsonwebtoken::errors::ErrorKind;
use jsonwebtoken::{Validation, decode, decode_header};
use tracing::debug;

use super::claims::{IdentityClaim, TokenClaims, UnverifiedWindow};
use super::error::AuthError;
use super::jwks::JwksClient;
use super::keys::{KeySet, KeyStatus, StaticKeys};
use crate::clock::SharedClock;

/// Claims every accepted token must carry.
const REQUIRED_CLAIMS: [&str; 3] = ["exp", "sub", "iss"];

/// Trust settings applied to every token.
#[derive(Debug, Clone)]
pub struct TokenSettings {
    /// Exact `iss` value accepted.
    pub issuer: String,
    /// Required `aud` value, if any.
    pub audience: Option<String>,
    /// Grace period in seconds for `nbf` and `exp`.
    pub leeway_secs: u64,
}

/// Where verification keys come from.
#[derive(Debug)]
pub enum KeySource {
    /// Locally configured shared secrets.
    Static(StaticKeys),
    /// Keys published by the identity provider.
    Remote(JwksClient),
}

impl KeySource {
    async fn key_set(&self, kid: Option<&str>) -> Result<Arc<KeySet>, AuthError> {
        match self {
            KeySource::Static(keys) => Ok(keys.snapshot()),
            KeySource::Remote(client) => client.key_set(kid).await,
        }
    }

    /// Whether keys are available without a network round trip.
    pub fn is_ready(&self) -> bool {
        match self {
            KeySource::Static(_) => true,
            KeySource::Remote(client) => client.has_keys(),
        }
    }
}

/// Verifies bearer tokens and extracts an [`IdentityClaim`].
#[derive(Debug)]
pub struct TokenValidator {
    settings: TokenSettings,
    keys: KeySource,
    clock: SharedClock,
}

impl TokenValidator {
    pub fn new(settings: TokenSettings, keys: KeySource, clock: SharedClock) -> Self {
        Self { settings, keys, clock }
    }

    pub fn key_source(&self) -> &KeySource {
        &self.keys
    }

    /// Verify `token` and return the identity it asserts.
    ///
    /// The returned claims establish identity only; capability checks are
    /// made separately by the caller.
    pub async fn validate(&self, token: &str) -> Result<IdentityClaim, AuthError> {
        let header = decode_header(token).map_err(|_| AuthError::Malformed)?;
        let window = peek_window(token)?;
        self.check_window(&window)?;

        let keys = self.keys.key_set(header.kid.as_deref()).await?;
        let candidates = keys.candidates(header.kid.as_deref(), header.alg);
        if candidates.is_empty() {
            debug!(kid = ?header.kid, alg = ?header.alg, "No verification key matches token header");
            return Err(AuthError::SignatureInvalid);
        }

        let validation = self.validation(header.alg);
        for key in candidates {
            match decode::<TokenClaims>(token, key.decoding_key(), &validation) {
                Ok(data) => {
                    if key.status() == KeyStatus::Retiring {
                        debug!(sub = %data.claims.sub, "Token verified with retiring key");
                    }
                    return IdentityClaim::try_from(data.claims);
                }
                Err(e) => match e.kind() {
                    ErrorKind::InvalidSignature => continue,
                    ErrorKind::InvalidIssuer | ErrorKind::InvalidAudience => {
                        return Err(AuthError::IssuerUntrusted);
                    }
                    ErrorKind::InvalidToken
                    | ErrorKind::MissingRequiredClaim(_)
                    | ErrorKind::Base64(_)
                    | ErrorKind::Json(_)
                    | ErrorKind::Utf8(_) => return Err(AuthError::Malformed),
                    _ => return Err(AuthError::SignatureInvalid),
                },
            }
        }

        Err(AuthError::SignatureInvalid)
    }

    fn validation(&self, alg: jsonwebtoken::Algorithm) -> Validation {
        let mut validation = Validation::new(alg);
        // Time window is checked against the injected clock.
        validation.validate_exp = false;
        validation.validate_nbf = false;
        validation.leeway = 0;
        validation.set_required_spec_claims(&REQUIRED_CLAIMS);
        validation.set_issuer(&[self.settings.issuer.as_str()]);
        match &self.settings.audience {
            Some(aud) => validation.set_audience(&[aud.as_str()]),
            None => validation.validate_aud = false,
        }
        validation
    }

    fn check_window(&self, window: &UnverifiedWindow) -> Result<(), AuthError> {
        let now = self.clock.now().timestamp();
        let leeway = i64::try_from(self.settings.leeway_secs).unwrap_or(i64::MAX);
        let exp = window.exp.ok_or(AuthError::Malformed)?;

        if now >= exp.saturating_add(leeway) {
            return Err(AuthError::Expired);
        }
        if let Some(nbf) = window.nbf
            && now.saturating_add(leeway) < nbf
        {
            return Err(AuthError::Expired);
        }
        Ok(())
    }
}

/// Read `exp`/`nbf` from a compact JWS without verifying it.
fn peek_window(token: &str) -> Result<UnverifiedWindow, AuthError> {
    let mut parts = token.split('.');
    let (Some(_), Some(payload), Some(_), None) = (parts.next(), parts.next(), parts.next(), parts.next())
    else {
        return Err(AuthError::Malformed);
    };
    let bytes = URL_SAFE_NO_PAD.decode(payload).map_err(|_| AuthError::Malformed)?;
    serde_json::from_slice(&bytes).map_err(|_| AuthError::Malformed)
}
