//! Brute-force guard for credential verification.
//!
//! Failed verifications are metered per client with a GCRA quota
//! (`AUTH_FAILURE_LIMIT_PER_MINUTE`, burst `AUTH_FAILURE_BURST`). Once a
//! client exhausts it, every request carrying a credential is rejected with
//! `RateLimited` before any verification work happens, until the quota
//! refills. Successful verifications cost nothing.
//!
//! The quota is measured on the injected [`SharedClock`], the same clock that
//! times the lockout, so a lockout lifts exactly when the quota has room again.

use std::fmt;
use std::num::NonZeroU32;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use governor::middleware::NoOpMiddleware;
use governor::state::keyed::DefaultKeyedStateStore;
use governor::{Quota, RateLimiter};
use tracing::{error, warn};

use crate::auth::AuthError;
use crate::clock::SharedClock;

const DEFAULT_FAILURE_LIMIT: NonZeroU32 = NonZeroU32::MIN.saturating_add(9);
const DEFAULT_FAILURE_BURST: NonZeroU32 = NonZeroU32::MIN.saturating_add(4);

type FailureLimiter = RateLimiter<String, DefaultKeyedStateStore<String>, QuotaClock, NoOpMiddleware<Instant>>;

/// The service clock's monotonic reading, as seen by `governor`.
#[derive(Debug, Clone)]
struct QuotaClock(SharedClock);

impl governor::clock::Clock for QuotaClock {
    type Instant = Instant;

    fn now(&self) -> Instant {
        self.0.monotonic()
    }
}

/// Per-client authentication failure tracker.
pub struct AuthFailureGuard {
    limiter: FailureLimiter,
    burst: u32,
    /// Clients over quota, with the instant they may try again.
    blocked: DashMap<String, Instant>,
    clock: SharedClock,
}

impl fmt::Debug for AuthFailureGuard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AuthFailureGuard")
            .field("burst", &self.burst)
            .field("blocked", &self.blocked.len())
            .finish_non_exhaustive()
    }
}

impl AuthFailureGuard {
    /// `per_minute` failures sustained, `burst` in quick succession. Zero
    /// values fall back to 10 and 5.
    pub fn new(per_minute: u32, burst: u32, clock: SharedClock) -> Self {
        let per_minute = NonZeroU32::new(per_minute).unwrap_or(DEFAULT_FAILURE_LIMIT);
        let burst = NonZeroU32::new(burst).unwrap_or(DEFAULT_FAILURE_BURST);
        let quota = Quota::per_minute(per_minute).allow_burst(burst);

        Self {
            limiter: RateLimiter::new(quota, DefaultKeyedStateStore::default(), QuotaClock(clock.clone())),
            burst: burst.get(),
            blocked: DashMap::new(),
            clock,
        }
    }

    /// Reject `client_key` if it is currently locked out.
    pub fn check(&self, client_key: &str) -> Result<(), AuthError> {
        let now = self.clock.monotonic();
        let blocked_until = self.blocked.get(client_key).map(|until| *until);
        match blocked_until {
            Some(until) if until > now => {
                let retry_after = until.saturating_duration_since(now);
                warn!(
                    client_key,
                    retry_after_secs = retry_after.as_secs(),
                    "Request rejected: client locked out after repeated auth failures"
                );
                Err(AuthError::RateLimited {
                    retry_after,
                    limit: self.burst,
                })
            }
            Some(_) => {
                self.blocked.remove(client_key);
                Ok(())
            }
            None => Ok(()),
        }
    }

    /// Count one failed verification for `client_key`.
    pub fn record_failure(&self, client_key: &str) {
        let key = client_key.to_string();
        if let Err(not_until) = self.limiter.check_key(&key) {
            let now = self.clock.monotonic();
            let wait = not_until.wait_time_from(now).max(Duration::from_secs(1));
            error!(
                client_key,
                retry_after_secs = wait.as_secs(),
                "Client locked out due to excessive auth failures"
            );
            self.blocked.insert(key, now + wait);
        }
    }

    /// Forget expired lockouts and idle limiter state.
    pub fn sweep(&self) {
        let now = self.clock.monotonic();
        self.blocked.retain(|_, until| *until > now);
        self.limiter.retain_recent();
        self.limiter.shrink_to_fit();
    }

    pub fn blocked_count(&self) -> usize {
        self.blocked.len()
    }
}
