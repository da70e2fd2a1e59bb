use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use anyhow::{bail, Result};
use chrono::{Local, TimeZone};

/// Wall clock in whole Unix seconds.
///
/// Production code uses [`Clock::system`]; tests drive a [`Clock::manual`]
/// instance so bucket boundaries and window anchors are deterministic.
#[derive(Debug, Clone)]
pub enum Clock {
    System,
    Manual(Arc<AtomicI64>),
}

impl Clock {
    pub fn system() -> Self {
        Self::System
    }

    /// Creates a clock frozen at `start` until moved with [`Clock::set`] or
    /// [`Clock::advance`].
    pub fn manual(start: i64) -> Self {
        Self::Manual(Arc::new(AtomicI64::new(start)))
    }

    /// Returns the current time in Unix seconds.
    pub fn now(&self) -> i64 {
        match self {
            Self::System => SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .map(|d| d.as_secs() as i64)
                .unwrap_or(0),
            Self::Manual(now) => now.load(Ordering::Relaxed),
        }
    }

    /// Moves a manual clock to `secs`. No-op for the system clock.
    pub fn set(&self, secs: i64) {
        if let Self::Manual(now) = self {
            now.store(secs, Ordering::Relaxed);
        }
    }

    /// Moves a manual clock forward. No-op for the system clock.
    pub fn advance(&self, by: Duration) {
        if let Self::Manual(now) = self {
            now.fetch_add(by.as_secs() as i64, Ordering::Relaxed);
        }
    }
}

/// Bucket width in seconds. Every stored and transmitted timestamp is a
/// multiple of it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Alignment(i64);

impl Alignment {
    pub fn from_secs(secs: i64) -> Result<Self> {
        if secs <= 0 {
            bail!("alignment must be positive, got {secs}s");
        }
        Ok(Self(secs))
    }

    /// Converts a configured duration, rejecting sub-second precision.
    pub fn from_duration(d: Duration) -> Result<Self> {
        if d.subsec_nanos() != 0 {
            bail!("alignment must be a whole number of seconds, got {d:?}");
        }
        Self::from_secs(d.as_secs() as i64)
    }

    pub fn secs(self) -> i64 {
        self.0
    }

    /// Rounds `ts` down to a bucket boundary (floor, also for negative input).
    pub fn floor(self, ts: i64) -> i64 {
        ts.div_euclid(self.0) * self.0
    }

    /// Number of whole buckets from `from` to `to`. Negative when `to < from`.
    pub fn buckets_between(self, from: i64, to: i64) -> i64 {
        (to - from).div_euclid(self.0)
    }

    pub fn is_multiple(self, secs: i64) -> bool {
        secs % self.0 == 0
    }
}

/// Returns local midnight of the day containing `now`.
pub fn start_of_day(now: i64) -> i64 {
    let Some(local) = Local.timestamp_opt(now, 0).single() else {
        return now - now.rem_euclid(86_400);
    };

    local
        .date_naive()
        .and_hms_opt(0, 0, 0)
        .and_then(|midnight| midnight.and_local_timezone(Local).earliest())
        .map(|dt| dt.timestamp())
        .unwrap_or_else(|| now - now.rem_euclid(86_400))
}
