//! Time sources for every time-bounded decision.
//!
//! Two readings are exposed:
//!
//! - **Wall time** (`DateTime<Utc>`): token `exp`/`nbf`, session expiry and
//!   audit timestamps. These values leave the process, so they must be
//!   calendar time.
//! - **Monotonic time** (`Instant`): rate-limit windows and idle eviction.
//!   Never goes backwards, immune to NTP adjustments.
//!
//! Production code uses [`SystemClock`]. Tests drive time explicitly with
//! [`ManualClock`] so that "minute 59 vs minute 61" scenarios are exact.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};

/// Shared handle to a clock.
pub type SharedClock = Arc<dyn Clock>;

/// Source of wall and monotonic time.
pub trait Clock: Send + Sync + fmt::Debug {
    /// Current wall-clock time.
    fn now(&self) -> DateTime<Utc>;

    /// Current monotonic instant.
    fn monotonic(&self) -> Instant;
}

/// Clock backed by the operating system.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl SystemClock {
    /// Create a shared system clock.
    pub fn shared() -> SharedClock {
        Arc::new(Self)
    }
}

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }

    fn monotonic(&self) -> Instant {
        Instant::now()
    }
}

/// Manually advanced clock.
///
/// Both readings start at the moment of construction and move forward only
/// through [`ManualClock::advance`]. The offset is a single atomic, so the
/// clock can be shared across tasks without locking.
#[derive(Debug)]
pub struct ManualClock {
    wall_origin: DateTime<Utc>,
    mono_origin: Instant,
    offset_nanos: AtomicU64,
}

impl ManualClock {
    /// Create a clock frozen at the current system time.
    pub fn new() -> Self {
        Self::starting_at(Utc::now())
    }

    /// Create a clock frozen at the given wall time.
    pub fn starting_at(wall_origin: DateTime<Utc>) -> Self {
        Self {
            wall_origin,
            mono_origin: Instant::now(),
            offset_nanos: AtomicU64::new(0),
        }
    }

    /// Move both readings forward.
    pub fn advance(&self, by: Duration) {
        let nanos = u64::try_from(by.as_nanos()).unwrap_or(u64::MAX);
        self.offset_nanos.fetch_add(nanos, Ordering::SeqCst);
    }

    fn offset(&self) -> Duration {
        Duration::from_nanos(self.offset_nanos.load(Ordering::SeqCst))
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        chrono::Duration::from_std(self.offset())
            .ok()
            .and_then(|offset| self.wall_origin.checked_add_signed(offset))
            .unwrap_or(DateTime::<Utc>::MAX_UTC)
    }

    fn monotonic(&self) -> Instant {
        self.mono_origin + self.offset()
    }
}
