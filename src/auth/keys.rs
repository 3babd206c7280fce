//! Verification key sets.
//!
//! A [`KeySet`] is an immutable snapshot. Rotation never mutates a set in
//! place: a new set is built and swapped in atomically, so a validation that
//! loaded the previous snapshot finishes against a consistent view.

use std::fmt;
use std::sync::Arc;

use arc_swap::ArcSwap;
use jsonwebtoken::jwk::{AlgorithmParameters, Jwk, JwkSet, PublicKeyUse};
use jsonwebtoken::{Algorithm, DecodingKey};
use tracing::{info, warn};

const HMAC_ALGORITHMS: [Algorithm; 3] = [Algorithm::HS256, Algorithm::HS384, Algorithm::HS512];
const RSA_ALGORITHMS: [Algorithm; 6] = [
    Algorithm::RS256,
    Algorithm::RS384,
    Algorithm::RS512,
    Algorithm::PS256,
    Algorithm::PS384,
    Algorithm::PS512,
];
const EC_ALGORITHMS: [Algorithm; 2] = [Algorithm::ES256, Algorithm::ES384];

/// Lifecycle position of a key within a set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyStatus {
    /// Current signing key.
    Active,
    /// Previous key, still accepted so rotation needs no downtime.
    Retiring,
}

/// A single key tokens may be verified against.
#[derive(Clone)]
pub struct VerificationKey {
    kid: Option<String>,
    key: DecodingKey,
    algorithms: Vec<Algorithm>,
    status: KeyStatus,
}

impl fmt::Debug for VerificationKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("VerificationKey")
            .field("kid", &self.kid)
            .field("algorithms", &self.algorithms)
            .field("status", &self.status)
            .finish_non_exhaustive()
    }
}

impl VerificationKey {
    /// Shared-secret key for the HMAC family.
    pub fn hmac(kid: Option<String>, secret: &[u8], status: KeyStatus) -> Self {
        Self {
            kid,
            key: DecodingKey::from_secret(secret),
            algorithms: HMAC_ALGORITHMS.to_vec(),
            status,
        }
    }

    /// Key published in a JWKS document.
    ///
    /// Returns `None` for encryption keys and key types that cannot verify
    /// signatures.
    pub fn from_jwk(jwk: &Jwk) -> Option<Self> {
        if matches!(jwk.common.public_key_use, Some(PublicKeyUse::Encryption)) {
            return None;
        }

        #[allow(unreachable_patterns)]
        let algorithms = match &jwk.algorithm {
            AlgorithmParameters::RSA(_) => RSA_ALGORITHMS.to_vec(),
            AlgorithmParameters::EllipticCurve(_) => EC_ALGORITHMS.to_vec(),
            AlgorithmParameters::OctetKey(_) => HMAC_ALGORITHMS.to_vec(),
            AlgorithmParameters::OctetKeyPair(_) => vec![Algorithm::EdDSA],
            _ => return None,
        };

        let key = match DecodingKey::from_jwk(jwk) {
            Ok(key) => key,
            Err(e) => {
                warn!(kid = ?jwk.common.key_id, error = %e, "Skipping unusable JWK");
                return None;
            }
        };

        Some(Self {
            kid: jwk.common.key_id.clone(),
            key,
            algorithms,
            status: KeyStatus::Active,
        })
    }

    pub fn kid(&self) -> Option<&str> {
        self.kid.as_deref()
    }

    pub fn status(&self) -> KeyStatus {
        self.status
    }

    pub fn decoding_key(&self) -> &DecodingKey {
        &self.key
    }

    /// Whether `alg` is valid for this key's family.
    pub fn accepts(&self, alg: Algorithm) -> bool {
        self.algorithms.contains(&alg)
    }
}

/// Immutable collection of verification keys.
#[derive(Debug, Clone, Default)]
pub struct KeySet {
    keys: Vec<VerificationKey>,
}

impl KeySet {
    pub fn new(keys: Vec<VerificationKey>) -> Self {
        Self { keys }
    }

    /// Build a set from a fetched JWKS document, skipping unusable keys.
    pub fn from_jwks(jwks: &JwkSet) -> Self {
        Self {
            keys: jwks.keys.iter().filter_map(VerificationKey::from_jwk).collect(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn contains_kid(&self, kid: &str) -> bool {
        self.keys.iter().any(|k| k.kid() == Some(kid))
    }

    /// Keys a token with header `kid`/`alg` may be verified against.
    ///
    /// A token naming a `kid` only matches that key. A token without one is
    /// tried against every compatible key, active keys first.
    pub fn candidates(&self, kid: Option<&str>, alg: Algorithm) -> Vec<&VerificationKey> {
        let mut matching: Vec<&VerificationKey> = self
            .keys
            .iter()
            .filter(|k| k.accepts(alg))
            .filter(|k| match kid {
                Some(kid) => k.kid() == Some(kid),
                None => true,
            })
            .collect();
        matching.sort_by_key(|k| k.status() == KeyStatus::Retiring);
        matching
    }
}

/// Locally configured HMAC keys with active/retiring rotation.
#[derive(Debug)]
pub struct StaticKeys {
    current: ArcSwap<KeySet>,
}

impl StaticKeys {
    /// Create from an active secret and an optional retiring one.
    pub fn new(active: &[u8], retiring: Option<&[u8]>) -> Self {
        let mut keys = vec![VerificationKey::hmac(None, active, KeyStatus::Active)];
        if let Some(retiring) = retiring {
            keys.push(VerificationKey::hmac(None, retiring, KeyStatus::Retiring));
        }
        Self {
            current: ArcSwap::from_pointee(KeySet::new(keys)),
        }
    }

    /// Current snapshot.
    pub fn snapshot(&self) -> Arc<KeySet> {
        self.current.load_full()
    }

    /// Install `secret` as the active key; the previous active key becomes
    /// the retiring key and any older retiring key is dropped.
    pub fn rotate(&self, secret: &[u8]) {
        self.current.rcu(|set| {
            let mut keys = vec![VerificationKey::hmac(None, secret, KeyStatus::Active)];
            keys.extend(
                set.keys
                    .iter()
                    .filter(|k| k.status() == KeyStatus::Active)
                    .cloned()
                    .map(|mut k| {
                        k.status = KeyStatus::Retiring;
                        k
                    }),
            );
            KeySet::new(keys)
        });
        info!("Token verification key rotated");
    }
}
