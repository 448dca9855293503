//! Wall-clock timestamps and duration formatting.
//!
//! Timestamps are Unix epoch seconds (UTC). Peer bookkeeping only needs
//! second resolution, which is also what the peer file stores.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// A Unix timestamp in seconds since epoch (UTC).
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Timestamp(u64);

impl Timestamp {
    /// The epoch (time zero).
    pub const EPOCH: Self = Self(0);

    pub fn new(secs: u64) -> Self {
        Self(secs)
    }

    /// Current system time. A clock set before the epoch reads as [`Timestamp::EPOCH`].
    pub fn now() -> Self {
        let secs = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0);
        Self(secs)
    }

    pub fn as_secs(&self) -> u64 {
        self.0
    }

    /// Seconds elapsed between this timestamp and `now` (zero if `now` is earlier).
    pub fn elapsed_since(&self, now: Timestamp) -> u64 {
        now.0.saturating_sub(self.0)
    }

    /// Whether more than `max_age` has passed between this timestamp and `now`.
    pub fn older_than(&self, max_age: Duration, now: Timestamp) -> bool {
        self.elapsed_since(now) > max_age.as_secs()
    }

    /// This timestamp moved `secs` into the past, clamped at the epoch.
    pub fn saturating_sub_secs(&self, secs: u64) -> Self {
        Self(self.0.saturating_sub(secs))
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}s", self.0)
    }
}

/// Format a duration in seconds to a human-readable string.
pub fn format_duration(secs: u64) -> String {
    if secs < 60 {
        format!("{}s", secs)
    } else if secs < 3600 {
        format!("{}m {}s", secs / 60, secs % 60)
    } else if secs < 86400 {
        format!("{}h {}m", secs / 3600, (secs % 3600) / 60)
    } else {
        format!("{}d {}h", secs / 86400, (secs % 86400) / 3600)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn elapsed_saturates_when_clock_goes_backwards() {
        let later = Timestamp::new(100);
        assert_eq!(later.elapsed_since(Timestamp::new(40)), 0);
        assert_eq!(Timestamp::new(40).elapsed_since(later), 60);
    }

    #[test]
    fn older_than_is_strict() {
        let seen = Timestamp::new(1_000);
        let max_age = Duration::from_secs(60);
        assert!(!seen.older_than(max_age, Timestamp::new(1_060)));
        assert!(seen.older_than(max_age, Timestamp::new(1_061)));
    }

    #[test]
    fn serializes_as_bare_integer() {
        let json = serde_json::to_string(&Timestamp::new(1_700_000_000)).unwrap();
        assert_eq!(json, "1700000000");
    }

    #[test]
    fn format_duration_picks_largest_units() {
        assert_eq!(format_duration(42), "42s");
        assert_eq!(format_duration(600), "10m 0s");
        assert_eq!(format_duration(86_400 + 7_200), "1d 2h");
    }
}
