//! Per-client admission control.
//!
//! # Algorithm
//!
//! Sliding-window log. Each (route class, client key) pair owns a
//! [`RateWindow`] holding the instants of its admitted requests inside the
//! current window. A request is admitted while fewer than `limit` hits
//! remain after pruning those older than `window`, so no rolling window of
//! that length ever contains more than `limit` admissions, including across
//! what a fixed-window counter would treat as a reset boundary.
//!
//! Denied requests are not logged as hits. A client hammering a closed
//! window does not push its own reopening further out.
//!
//! # Concurrency
//!
//! Windows live in a sharded `DashMap`. The read-modify-write of one window
//! happens under its shard's entry lock, so requests from one client are
//! strictly serialized while unrelated clients rarely contend.
//!
//! # Memory
//!
//! [`RateLimiter::evict_idle`] drops windows whose newest hit is older than
//! `max(retention, window)`. A window still holding hits inside its active
//! period is never dropped, so eviction can never reopen a closed window.

use std::collections::VecDeque;
use std::fmt;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use tracing::{debug, warn};

use crate::auth::RouteClass;
use crate::clock::SharedClock;
use crate::metrics;

/// Invalid limiter configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RateLimitError {
    /// A class was configured with a limit of zero.
    ZeroLimit(RouteClass),
    /// A class was configured with a zero-length window.
    ZeroWindow(RouteClass),
}

impl fmt::Display for RateLimitError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RateLimitError::ZeroLimit(class) => {
                write!(f, "rate limit for class '{class}' must be greater than 0")
            }
            RateLimitError::ZeroWindow(class) => {
                write!(f, "rate limit window for class '{class}' must be greater than 0")
            }
        }
    }
}

impl std::error::Error for RateLimitError {}

/// Limit for one route class.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateRule {
    pub limit: u32,
    pub window: Duration,
}

impl RateRule {
    pub const fn new(limit: u32, window: Duration) -> Self {
        Self { limit, window }
    }
}

/// Limits for every route class.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClassLimits {
    pub content: RateRule,
    pub auth: RateRule,
    pub admin: RateRule,
}

impl ClassLimits {
    pub fn rule(&self, class: RouteClass) -> RateRule {
        match class {
            RouteClass::Content => self.content,
            RouteClass::Auth => self.auth,
            RouteClass::Admin => self.admin,
        }
    }

    fn validate(&self) -> Result<(), RateLimitError> {
        for class in RouteClass::ALL {
            let rule = self.rule(class);
            if rule.limit == 0 {
                return Err(RateLimitError::ZeroLimit(class));
            }
            if rule.window.is_zero() {
                return Err(RateLimitError::ZeroWindow(class));
            }
        }
        Ok(())
    }
}

impl Default for ClassLimits {
    fn default() -> Self {
        Self {
            content: RateRule::new(100, Duration::from_secs(60)),
            auth: RateRule::new(10, Duration::from_secs(60)),
            admin: RateRule::new(60, Duration::from_secs(60)),
        }
    }
}

/// Admission decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    Allow { limit: u32, remaining: u32 },
    /// `retry_after` is always positive.
    Deny { retry_after: Duration, limit: u32 },
}

impl Admission {
    pub fn is_allowed(&self) -> bool {
        matches!(self, Admission::Allow { .. })
    }

    fn as_str(&self) -> &'static str {
        match self {
            Admission::Allow { .. } => "allow",
            Admission::Deny { .. } => "deny",
        }
    }
}

/// Admission log for one (route class, client key) pair.
#[derive(Debug, Clone)]
pub struct RateWindow {
    hits: VecDeque<Instant>,
    rule: RateRule,
}

impl RateWindow {
    fn new(rule: RateRule) -> Self {
        Self {
            hits: VecDeque::with_capacity(rule.limit.min(64) as usize),
            rule,
        }
    }

    fn prune(&mut self, now: Instant) {
        while let Some(&oldest) = self.hits.front() {
            if now.saturating_duration_since(oldest) >= self.rule.window {
                self.hits.pop_front();
            } else {
                break;
            }
        }
    }

    fn admit(&mut self, now: Instant) -> Admission {
        self.prune(now);
        let used = u32::try_from(self.hits.len()).unwrap_or(u32::MAX);

        if used < self.rule.limit {
            self.hits.push_back(now);
            return Admission::Allow {
                limit: self.rule.limit,
                remaining: self.rule.limit - used - 1,
            };
        }

        // The window reopens when its oldest hit ages out.
        let retry_after = self
            .hits
            .front()
            .map(|&oldest| (oldest + self.rule.window).saturating_duration_since(now))
            .filter(|d| !d.is_zero())
            .unwrap_or(Duration::from_millis(1));

        Admission::Deny {
            retry_after,
            limit: self.rule.limit,
        }
    }

    /// Whether the window is idle for longer than `horizon` at `now`.
    fn is_idle(&self, now: Instant, horizon: Duration) -> bool {
        self.hits
            .back()
            .is_none_or(|&newest| now.saturating_duration_since(newest) >= horizon.max(self.rule.window))
    }
}

/// Sharded table of rate windows.
#[derive(Debug)]
pub struct RateLimiter {
    windows: DashMap<(RouteClass, String), RateWindow>,
    limits: ClassLimits,
    retention: Duration,
    clock: SharedClock,
}

impl RateLimiter {
    /// Create a limiter.
    ///
    /// # Errors
    ///
    /// Returns [`RateLimitError`] if any class has a zero limit or window.
    pub fn new(limits: ClassLimits, retention: Duration, clock: SharedClock) -> Result<Self, RateLimitError> {
        limits.validate()?;
        Ok(Self {
            windows: DashMap::new(),
            limits,
            retention,
            clock,
        })
    }

    pub fn limits(&self) -> &ClassLimits {
        &self.limits
    }

    /// Decide whether `client_key` may make another `class` request now.
    pub fn admit(&self, client_key: &str, class: RouteClass) -> Admission {
        let now = self.clock.monotonic();
        let rule = self.limits.rule(class);

        let decision = self
            .windows
            .entry((class, client_key.to_string()))
            .or_insert_with(|| RateWindow::new(rule))
            .admit(now);

        metrics::record_admission(class.as_str(), decision.as_str());
        if let Admission::Deny { retry_after, .. } = decision {
            warn!(
                client_key,
                route_class = %class,
                retry_after_ms = retry_after.as_millis() as u64,
                "Rate limit exceeded"
            );
        }
        decision
    }

    /// Drop idle windows. Returns the number removed.
    pub fn evict_idle(&self) -> usize {
        let now = self.clock.monotonic();
        let before = self.windows.len();
        self.windows.retain(|_, window| !window.is_idle(now, self.retention));

        let remaining = self.windows.len();
        metrics::set_rate_windows(remaining);
        let evicted = before.saturating_sub(remaining);
        if evicted > 0 {
            debug!(evicted, remaining, "Evicted idle rate windows");
        }
        evicted
    }

    /// Number of tracked windows.
    pub fn window_count(&self) -> usize {
        self.windows.len()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use std::sync::Arc;

    const MINUTE: Duration = Duration::from_secs(60);

    fn limiter(clock: Arc<ManualClock>, limits: ClassLimits) -> RateLimiter {
        RateLimiter::new(limits, Duration::from_secs(300), clock).unwrap()
    }

    fn tight(limit: u32, window: Duration) -> ClassLimits {
        ClassLimits {
            content: RateRule::new(limit, window),
            ..ClassLimits::default()
        }
    }

    #[test]
    fn test_zero_limits_rejected() {
        let clock = Arc::new(ManualClock::new());
        let err = RateLimiter::new(tight(0, MINUTE), MINUTE, clock.clone()).unwrap_err();
        assert_eq!(err, RateLimitError::ZeroLimit(RouteClass::Content));

        let err = RateLimiter::new(tight(5, Duration::ZERO), MINUTE, clock).unwrap_err();
        assert_eq!(err, RateLimitError::ZeroWindow(RouteClass::Content));
    }

    #[test]
    fn test_hundred_and_first_request_denied() {
        let clock = Arc::new(ManualClock::new());
        let limiter = limiter(clock.clone(), ClassLimits::default());

        for i in 0..100u32 {
            clock.advance(Duration::from_millis(100));
            let decision = limiter.admit("203.0.113.9", RouteClass::Content);
            assert_eq!(decision, Admission::Allow { limit: 100, remaining: 99 - i });
        }

        match limiter.admit("203.0.113.9", RouteClass::Content) {
            Admission::Deny { retry_after, limit } => {
                assert_eq!(limit, 100);
                assert!(retry_after > Duration::ZERO);
                assert!(retry_after <= MINUTE);
            }
            other => panic!("expected deny, got {other:?}"),
        }
    }

    #[test]
    fn test_denials_do_not_count() {
        let clock = Arc::new(ManualClock::new());
        let limiter = limiter(clock.clone(), tight(2, Duration::from_secs(10)));

        assert!(limiter.admit("k", RouteClass::Content).is_allowed());
        assert!(limiter.admit("k", RouteClass::Content).is_allowed());

        clock.advance(Duration::from_secs(5));
        for _ in 0..20 {
            assert!(!limiter.admit("k", RouteClass::Content).is_allowed());
        }

        clock.advance(Duration::from_secs(5));
        assert!(limiter.admit("k", RouteClass::Content).is_allowed());
        assert!(limiter.admit("k", RouteClass::Content).is_allowed());
    }

    #[test]
    fn test_no_burst_across_window_boundary() {
        let clock = Arc::new(ManualClock::new());
        let limiter = limiter(clock.clone(), tight(10, MINUTE));

        clock.advance(Duration::from_secs(30));
        for _ in 0..10 {
            assert!(limiter.admit("k", RouteClass::Content).is_allowed());
        }

        // A fixed window would reset here and admit another 10.
        clock.advance(Duration::from_secs(31));
        match limiter.admit("k", RouteClass::Content) {
            Admission::Deny { retry_after, .. } => assert_eq!(retry_after, Duration::from_secs(29)),
            other => panic!("expected deny, got {other:?}"),
        }

        clock.advance(Duration::from_secs(29));
        assert!(limiter.admit("k", RouteClass::Content).is_allowed());
    }

    #[test]
    fn test_classes_and_keys_are_independent() {
        let clock = Arc::new(ManualClock::new());
        let limits = ClassLimits {
            auth: RateRule::new(1, MINUTE),
            ..ClassLimits::default()
        };
        let limiter = limiter(clock, limits);

        assert!(limiter.admit("k", RouteClass::Auth).is_allowed());
        assert!(!limiter.admit("k", RouteClass::Auth).is_allowed());
        assert!(limiter.admit("k", RouteClass::Content).is_allowed());
        assert!(limiter.admit("other", RouteClass::Auth).is_allowed());
    }

    #[test]
    fn test_eviction_never_drops_active_window() {
        let clock = Arc::new(ManualClock::new());
        // Retention shorter than the window: the window length still wins.
        let limiter = RateLimiter::new(tight(1, MINUTE), Duration::from_secs(1), clock.clone()).unwrap();

        assert!(limiter.admit("k", RouteClass::Content).is_allowed());
        clock.advance(Duration::from_secs(30));
        assert_eq!(limiter.evict_idle(), 0);
        assert!(!limiter.admit("k", RouteClass::Content).is_allowed());

        clock.advance(Duration::from_secs(30));
        assert_eq!(limiter.evict_idle(), 1);
        assert_eq!(limiter.window_count(), 0);
    }

    #[test]
    fn test_concurrent_admissions_never_exceed_limit() {
        let clock = Arc::new(ManualClock::new());
        let limiter = Arc::new(limiter(clock, tight(100, MINUTE)));

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let limiter = limiter.clone();
                std::thread::spawn(move || {
                    (0..50)
                        .filter(|_| limiter.admit("shared", RouteClass::Content).is_allowed())
                        .count()
                })
            })
            .collect();

        let admitted: usize = handles.into_iter().map(|h| h.join().unwrap()).sum();
        assert_eq!(admitted, 100);
    }
}
