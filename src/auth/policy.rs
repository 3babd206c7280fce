//! Route classification and capability checks.
//!
//! Collaborators register a [`RoutePolicy`] per route pattern on a
//! [`RouteTable`]. The pipeline resolves every request against the table
//! after normalizing its path, so `/admin/stats`, `/admin/stats/` and
//! `//admin//stats` all share one policy and one rate-limit class.
//!
//! Registration is validated eagerly: a malformed pattern or a capability
//! naming an unknown role is a startup error, never a per-request one.

use std::borrow::Cow;
use std::collections::HashSet;
use std::fmt;
use std::str::FromStr;

use axum::http::Method;
use serde::Serialize;

use super::claims::{Identity, IdentityClaim};
use super::error::AuthError;
use crate::error::{AppError, AppResult};

/// Role that makes an external identity an administrator.
pub const ADMIN_ROLE: &str = "admin";

/// Rate-limit class a route belongs to. Each class has its own limits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RouteClass {
    /// Read-mostly content endpoints.
    Content,
    /// Login/logout and identity endpoints.
    Auth,
    /// Admin dashboard endpoints.
    Admin,
}

impl RouteClass {
    pub const ALL: [RouteClass; 3] = [RouteClass::Content, RouteClass::Auth, RouteClass::Admin];

    pub fn as_str(&self) -> &'static str {
        match self {
            RouteClass::Content => "content",
            RouteClass::Auth => "auth",
            RouteClass::Admin => "admin",
        }
    }
}

impl fmt::Display for RouteClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What a caller must prove to reach a route.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Capability {
    /// No identity required.
    Public,
    /// Any verified identity.
    Authenticated,
    /// An admin session, or an external identity on the admin allowlist.
    Admin,
    /// An external identity carrying the named role. Admins satisfy every role.
    Role(String),
}

impl FromStr for Capability {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "none" | "public" => Ok(Capability::Public),
            "authenticated" => Ok(Capability::Authenticated),
            "admin" => Ok(Capability::Admin),
            other => match other.strip_prefix("role:") {
                Some(role) if !role.is_empty() => Ok(Capability::Role(role.to_string())),
                _ => Err(AppError::ConfigError(format!("Unrecognized capability: {other}"))),
            },
        }
    }
}

impl Capability {
    /// Check `identity` against this capability.
    ///
    /// `Unauthenticated` when an identity is required and none was
    /// presented, `Unauthorized` when one was presented but is insufficient.
    pub fn check(&self, identity: Option<&Identity>, admins: &AdminDirectory) -> Result<(), AuthError> {
        let identity = match (self, identity) {
            (Capability::Public, _) => return Ok(()),
            (_, None) => return Err(AuthError::Unauthenticated),
            (_, Some(identity)) => identity,
        };

        let allowed = match (self, identity) {
            (Capability::Public | Capability::Authenticated, _) => true,
            (Capability::Admin | Capability::Role(_), Identity::Admin(_)) => true,
            (Capability::Admin, Identity::External(claim)) => admins.is_admin(claim),
            (Capability::Role(role), Identity::External(claim)) => {
                claim.role.as_deref() == Some(role.as_str()) || admins.is_admin(claim)
            }
        };

        if allowed { Ok(()) } else { Err(AuthError::Unauthorized) }
    }
}

/// Policy attached to a route.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoutePolicy {
    pub class: RouteClass,
    pub capability: Capability,
    /// Successful or not, requests to privileged routes are audited.
    pub privileged: bool,
}

impl RoutePolicy {
    pub fn public(class: RouteClass) -> Self {
        Self {
            class,
            capability: Capability::Public,
            privileged: false,
        }
    }

    pub fn authenticated(class: RouteClass) -> Self {
        Self {
            class,
            capability: Capability::Authenticated,
            privileged: false,
        }
    }

    pub fn admin() -> Self {
        Self {
            class: RouteClass::Admin,
            capability: Capability::Admin,
            privileged: false,
        }
    }

    pub fn role(class: RouteClass, role: impl Into<String>) -> Self {
        Self {
            class,
            capability: Capability::Role(role.into()),
            privileged: false,
        }
    }

    /// Mark the route as privileged.
    pub fn privileged(mut self) -> Self {
        self.privileged = true;
        self
    }
}

/// A registered route pattern: an exact path or a `/prefix/*` subtree.
#[derive(Debug, Clone, PartialEq, Eq)]
enum RoutePattern {
    Exact(String),
    Prefix(String),
}

impl RoutePattern {
    fn parse(pattern: &str) -> AppResult<Self> {
        if !pattern.starts_with('/') {
            return Err(AppError::ConfigError(format!(
                "Route pattern must start with '/': {pattern}"
            )));
        }

        let (base, prefix) = match pattern.strip_suffix("/*") {
            Some(base) => (base, true),
            None => (pattern, false),
        };
        if base.contains('*') {
            return Err(AppError::ConfigError(format!(
                "Wildcard only allowed as trailing '/*': {pattern}"
            )));
        }

        let base = normalize_path(base).into_owned();
        Ok(if prefix {
            RoutePattern::Prefix(base)
        } else {
            RoutePattern::Exact(base)
        })
    }

    /// Match strength: exact beats any prefix, longer prefix beats shorter.
    fn score(&self, path: &str) -> Option<usize> {
        match self {
            RoutePattern::Exact(p) => (p == path).then_some(usize::MAX),
            RoutePattern::Prefix(p) if p == "/" => Some(0),
            RoutePattern::Prefix(p) => {
                let under = path
                    .strip_prefix(p.as_str())
                    .is_some_and(|rest| rest.is_empty() || rest.starts_with('/'));
                under.then_some(p.len())
            }
        }
    }
}

impl fmt::Display for RoutePattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RoutePattern::Exact(p) => f.write_str(p),
            RoutePattern::Prefix(p) if p == "/" => f.write_str("/*"),
            RoutePattern::Prefix(p) => write!(f, "{p}/*"),
        }
    }
}

#[derive(Debug, Clone)]
struct RouteEntry {
    method: Option<Method>,
    pattern: RoutePattern,
    label: String,
    policy: RoutePolicy,
}

/// Route resolved for a request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedRoute {
    /// Registered pattern, used as the audit target.
    pub route: String,
    pub policy: RoutePolicy,
}

/// Route metadata registered by collaborators.
#[derive(Debug, Clone)]
pub struct RouteTable {
    entries: Vec<RouteEntry>,
    fallback: RoutePolicy,
    known_roles: HashSet<String>,
}

impl RouteTable {
    /// Create a table. Unregistered routes get `fallback`.
    pub fn new<I, S>(known_roles: I, fallback: RoutePolicy) -> AppResult<Self>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let known_roles: HashSet<String> = known_roles.into_iter().map(Into::into).collect();
        check_capability(&fallback.capability, &known_roles)?;
        Ok(Self {
            entries: Vec::new(),
            fallback,
            known_roles,
        })
    }

    /// Register a policy for `pattern`, optionally restricted to `method`.
    ///
    /// # Errors
    ///
    /// `AppError::ConfigError` for a malformed pattern, an unknown role, or
    /// a duplicate registration.
    pub fn route(mut self, method: Option<Method>, pattern: &str, policy: RoutePolicy) -> AppResult<Self> {
        let parsed = RoutePattern::parse(pattern)?;
        check_capability(&policy.capability, &self.known_roles)?;

        if self
            .entries
            .iter()
            .any(|e| e.pattern == parsed && e.method == method)
        {
            return Err(AppError::ConfigError(format!(
                "Route registered twice: {} {pattern}",
                method.as_ref().map_or("*", Method::as_str)
            )));
        }

        self.entries.push(RouteEntry {
            method,
            label: parsed.to_string(),
            pattern: parsed,
            policy,
        });
        Ok(self)
    }

    /// Resolve a normalized path.
    ///
    /// The strongest pattern match wins; among equal matches a
    /// method-specific entry beats a method-agnostic one.
    pub fn resolve(&self, method: &Method, path: &str) -> ResolvedRoute {
        let best = self
            .entries
            .iter()
            .filter(|e| e.method.as_ref().is_none_or(|m| m == method))
            .filter_map(|e| e.pattern.score(path).map(|score| (score, e.method.is_some(), e)))
            .max_by_key(|(score, specific, _)| (*score, *specific));

        match best {
            Some((_, _, entry)) => ResolvedRoute {
                route: entry.label.clone(),
                policy: entry.policy.clone(),
            },
            None => ResolvedRoute {
                route: path.to_string(),
                policy: self.fallback.clone(),
            },
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

fn check_capability(capability: &Capability, known_roles: &HashSet<String>) -> AppResult<()> {
    match capability {
        Capability::Role(role) if !known_roles.contains(role) => Err(AppError::ConfigError(format!(
            "Route requires unknown role: {role}"
        ))),
        _ => Ok(()),
    }
}

/// Collapse duplicate slashes and drop a trailing slash.
///
/// Borrows when the path is already normal.
pub fn normalize_path(path: &str) -> Cow<'_, str> {
    let already_normal = path.starts_with('/')
        && !path.contains("//")
        && (path == "/" || !path.ends_with('/'));
    if already_normal {
        return Cow::Borrowed(path);
    }

    let mut normalized = String::with_capacity(path.len() + 1);
    for segment in path.split('/').filter(|s| !s.is_empty()) {
        normalized.push('/');
        normalized.push_str(segment);
    }
    if normalized.is_empty() {
        normalized.push('/');
    }
    Cow::Owned(normalized)
}

/// Which external identities count as administrators.
#[derive(Debug, Clone, Default)]
pub struct AdminDirectory {
    emails: HashSet<String>,
}

impl AdminDirectory {
    /// Build from an email allowlist. Matching is case-insensitive.
    pub fn new<I, S>(emails: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Self {
            emails: emails
                .into_iter()
                .map(|e| e.as_ref().trim().to_lowercase())
                .filter(|e| !e.is_empty())
                .collect(),
        }
    }

    /// Allowlisted email the issuer has verified, or the `admin` role.
    pub fn is_admin(&self, claim: &IdentityClaim) -> bool {
        claim.role.as_deref() == Some(ADMIN_ROLE)
            || (claim.email_verified
                && claim
                    .email
                    .as_deref()
                    .is_some_and(|email| self.emails.contains(&email.to_lowercase())))
    }

    pub fn len(&self) -> usize {
        self.emails.len()
    }

    pub fn is_empty(&self) -> bool {
        self.emails.is_empty()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::auth::claims::AdminIdentity;
    use crate::auth::session::AdminSession;
    use chrono::Utc;

    fn claim(email: Option<&str>, role: Option<&str>) -> IdentityClaim {
        IdentityClaim {
            subject: "user".to_string(),
            issuer: "https://issuer.example/".to_string(),
            expires_at: Utc::now(),
            email: email.map(str::to_string),
            email_verified: true,
            role: role.map(str::to_string),
            audience: None,
            permissions: Vec::new(),
            scope: Vec::new(),
        }
    }

    fn admin_session() -> Identity {
        Identity::Admin(AdminSession {
            id: "sid".to_string(),
            admin: AdminIdentity {
                subject: "admin".to_string(),
                email: "admin@example.com".to_string(),
            },
            created_at: Utc::now(),
            expires_at: Utc::now(),
            secret_version: 1,
        })
    }

    fn table() -> RouteTable {
        RouteTable::new(["admin", "editor"], RoutePolicy::public(RouteClass::Content))
            .unwrap()
            .route(None, "/admin/*", RoutePolicy::admin())
            .unwrap()
            .route(Some(Method::POST), "/admin/posts", RoutePolicy::admin().privileged())
            .unwrap()
            .route(None, "/auth/*", RoutePolicy::public(RouteClass::Auth))
            .unwrap()
    }

    #[test]
    fn test_normalize_path() {
        assert_eq!(normalize_path("/admin/stats"), "/admin/stats");
        assert!(matches!(normalize_path("/admin/stats"), Cow::Borrowed(_)));
        assert_eq!(normalize_path("/admin/stats/"), "/admin/stats");
        assert_eq!(normalize_path("//admin///stats//"), "/admin/stats");
        assert_eq!(normalize_path("/"), "/");
        assert_eq!(normalize_path(""), "/");
        assert_eq!(normalize_path("///"), "/");
    }

    #[test]
    fn test_resolve_prefers_exact_then_method() {
        let table = table();

        let post = table.resolve(&Method::POST, "/admin/posts");
        assert!(post.policy.privileged);
        assert_eq!(post.route, "/admin/posts");

        let get = table.resolve(&Method::GET, "/admin/posts");
        assert!(!get.policy.privileged);
        assert_eq!(get.route, "/admin/*");
        assert_eq!(get.policy.class, RouteClass::Admin);
    }

    #[test]
    fn test_prefix_respects_segment_boundary() {
        let table = table();
        assert_eq!(table.resolve(&Method::GET, "/admin").policy.class, RouteClass::Admin);
        assert_eq!(table.resolve(&Method::GET, "/administrator").policy.class, RouteClass::Content);
    }

    #[test]
    fn test_fallback_policy() {
        let resolved = table().resolve(&Method::GET, "/services");
        assert_eq!(resolved.policy, RoutePolicy::public(RouteClass::Content));
        assert_eq!(resolved.route, "/services");
    }

    #[test]
    fn test_unknown_role_is_config_error() {
        let result = table().route(None, "/reports", RoutePolicy::role(RouteClass::Content, "auditor"));
        assert!(matches!(result, Err(AppError::ConfigError(_))));
    }

    #[test]
    fn test_malformed_patterns_rejected() {
        assert!(table().route(None, "admin", RoutePolicy::admin()).is_err());
        assert!(table().route(None, "/a/*/b", RoutePolicy::admin()).is_err());
        assert!(table().route(None, "/admin/*", RoutePolicy::admin()).is_err());
    }

    #[test]
    fn test_capability_from_str() {
        assert_eq!("none".parse::<Capability>().unwrap(), Capability::Public);
        assert_eq!("admin".parse::<Capability>().unwrap(), Capability::Admin);
        assert_eq!(
            "role:editor".parse::<Capability>().unwrap(),
            Capability::Role("editor".to_string())
        );
        assert!("role:".parse::<Capability>().is_err());
        assert!("superuser".parse::<Capability>().is_err());
    }

    #[test]
    fn test_capability_checks() {
        let admins = AdminDirectory::new(["Boss@Example.com"]);
        let boss = Identity::External(claim(Some("boss@example.com"), None));
        let editor = Identity::External(claim(Some("ed@example.com"), Some("editor")));
        let session = admin_session();

        assert_eq!(Capability::Public.check(None, &admins), Ok(()));
        assert_eq!(Capability::Authenticated.check(None, &admins), Err(AuthError::Unauthenticated));
        assert_eq!(Capability::Authenticated.check(Some(&editor), &admins), Ok(()));

        assert_eq!(Capability::Admin.check(Some(&boss), &admins), Ok(()));
        assert_eq!(Capability::Admin.check(Some(&session), &admins), Ok(()));
        assert_eq!(Capability::Admin.check(Some(&editor), &admins), Err(AuthError::Unauthorized));

        let needs_editor = Capability::Role("editor".to_string());
        assert_eq!(needs_editor.check(Some(&editor), &admins), Ok(()));
        assert_eq!(needs_editor.check(Some(&boss), &admins), Ok(()));
        assert_eq!(
            needs_editor.check(Some(&Identity::External(claim(None, None))), &admins),
            Err(AuthError::Unauthorized)
        );
    }

    #[test]
    fn test_admin_role_claim_is_admin() {
        let admins = AdminDirectory::default();
        assert!(admins.is_admin(&claim(None, Some("admin"))));
        assert!(!admins.is_admin(&claim(Some("x@example.com"), None)));
    }

    #[test]
    fn test_unverified_allowlisted_email_is_not_admin() {
        let admins = AdminDirectory::new(["boss@example.com"]);
        let mut unverified = claim(Some("boss@example.com"), None);
        unverified.email_verified = false;

        assert!(!admins.is_admin(&unverified));
        assert_eq!(
            Capability::Admin.check(Some(&Identity::External(unverified.clone())), &admins),
            Err(AuthError::Unauthorized)
        );

        unverified.role = Some(ADMIN_ROLE.to_string());
        assert!(admins.is_admin(&unverified));
    }
}
