//! Verified identity types.
//!
//! External bearer tokens are decoded into [`TokenClaims`], a fixed and
//! explicitly enumerated schema. Unknown fields are rejected rather than
//! ignored, and required fields (`sub`, `iss`, `exp`) must be present. The
//! result of a successful verification is an [`IdentityClaim`], which is
//! read-only and request-scoped.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::error::AuthError;
use super::session::AdminSession;

/// `aud` may be a single string or an array of strings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Audience {
    One(String),
    Many(Vec<String>),
}

impl Audience {
    /// Whether `expected` is among the audiences.
    pub fn contains(&self, expected: &str) -> bool {
        match self {
            Audience::One(aud) => aud == expected,
            Audience::Many(auds) => auds.iter().any(|aud| aud == expected),
        }
    }
}

/// Wire schema of an external identity token.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TokenClaims {
    pub sub: String,
    pub iss: String,
    pub exp: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub aud: Option<Audience>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nbf: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub iat: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub jti: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub azp: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scope: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub permissions: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email_verified: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,
}

/// Time-window fields read from a token payload before its signature is
/// checked. Only used to order the `Expired` decision ahead of signature
/// verification; nothing else is trusted from this view.
#[derive(Debug, Deserialize)]
pub(crate) struct UnverifiedWindow {
    pub exp: Option<i64>,
    #[serde(default)]
    pub nbf: Option<i64>,
}

/// A verified external identity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct IdentityClaim {
    pub subject: String,
    pub issuer: String,
    pub expires_at: DateTime<Utc>,
    pub email: Option<String>,
    pub email_verified: bool,
    pub role: Option<String>,
    pub audience: Option<Audience>,
    pub permissions: Vec<String>,
    pub scope: Vec<String>,
}

impl TryFrom<TokenClaims> for IdentityClaim {
    type Error = AuthError;

    fn try_from(claims: TokenClaims) -> Result<Self, Self::Error> {
        if claims.sub.is_empty() {
            return Err(AuthError::Malformed);
        }
        let expires_at = DateTime::from_timestamp(claims.exp, 0).ok_or(AuthError::Malformed)?;

        Ok(Self {
            subject: claims.sub,
            issuer: claims.iss,
            expires_at,
            email: claims.email.map(|e| e.to_lowercase()),
            email_verified: claims.email_verified.unwrap_or(false),
            role: claims.role,
            audience: claims.aud,
            permissions: claims.permissions.unwrap_or_default(),
            scope: claims
                .scope
                .map(|s| s.split_whitespace().map(str::to_string).collect())
                .unwrap_or_default(),
        })
    }
}

impl IdentityClaim {
    /// Whether the identity carries `permission` either as a granted
    /// permission or as an OAuth scope.
    pub fn has_permission(&self, permission: &str) -> bool {
        self.permissions.iter().any(|p| p == permission) || self.scope.iter().any(|s| s == permission)
    }
}

/// The admin an [`AdminSession`] is bound to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AdminIdentity {
    pub subject: String,
    pub email: String,
}

/// Identity resolved for a request by the pipeline.
///
/// Inserted into request extensions; handlers read it with
/// `Extension<Identity>`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Identity {
    /// Verified external bearer token.
    External(IdentityClaim),
    /// First-party admin session.
    Admin(AdminSession),
}

impl Identity {
    /// Actor name for audit records.
    pub fn actor(&self) -> String {
        match self {
            Identity::External(claim) => claim.email.clone().unwrap_or_else(|| claim.subject.clone()),
            Identity::Admin(session) => session.admin.email.clone(),
        }
    }

    /// Subject identifier.
    pub fn subject(&self) -> &str {
        match self {
            Identity::External(claim) => &claim.subject,
            Identity::Admin(session) => &session.admin.subject,
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use serde_json::json;

    fn base() -> serde_json::Value {
        json!({
            "sub": "auth0|123",
            "iss": "https://issuer.example/",
            "exp": 1_900_000_000_i64,
        })
    }

    #[test]
    fn test_minimal_claims_parse() {
        let claims: TokenClaims = serde_json::from_value(base()).unwrap();
        let identity = IdentityClaim::try_from(claims).unwrap();
        assert_eq!(identity.subject, "auth0|123");
        assert!(identity.email.is_none());
        assert!(!identity.email_verified);
    }

    #[test]
    fn test_unknown_field_rejected() {
        let mut value = base();
        value["is_admin"] = json!(true);
        assert!(serde_json::from_value::<TokenClaims>(value).is_err());
    }

    #[test]
    fn test_missing_required_field_rejected() {
        let mut value = base();
        value.as_object_mut().unwrap().remove("iss");
        assert!(serde_json::from_value::<TokenClaims>(value).is_err());
    }

    #[test]
    fn test_audience_forms() {
        let mut value = base();
        value["aud"] = json!(["https://api.example", "other"]);
        let claims: TokenClaims = serde_json::from_value(value).unwrap();
        assert!(claims.aud.as_ref().unwrap().contains("https://api.example"));
        assert!(!claims.aud.unwrap().contains("missing"));

        let single = Audience::One("x".to_string());
        assert!(single.contains("x"));
    }

    #[test]
    fn test_email_is_lowercased_and_scope_split() {
        let mut value = base();
        value["email"] = json!("Admin@Example.COM");
        value["scope"] = json!("read:content write:content");
        let identity = IdentityClaim::try_from(serde_json::from_value::<TokenClaims>(value).unwrap()).unwrap();
        assert_eq!(identity.email.as_deref(), Some("admin@example.com"));
        assert!(identity.has_permission("write:content"));
        assert!(!identity.has_permission("delete:content"));
    }

    #[test]
    fn test_empty_subject_is_malformed() {
        let mut value = base();
        value["sub"] = json!("");
        let claims: TokenClaims = serde_json::from_value(value).unwrap();
        assert_eq!(IdentityClaim::try_from(claims), Err(AuthError::Malformed));
    }
}
