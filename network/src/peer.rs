//! A single address book entry and its reconnect backoff.

use cairn_utils::Timestamp;
use rand::Rng;

/// Default backoff unit, in seconds.
pub const DEFAULT_BACKOFF_UNIT_SECS: u64 = 5;
/// Default number of consecutive failures after which an untrusted peer is culled.
pub const DEFAULT_MAX_RETRY_TIMES: u32 = 3;

/// Reconnect policy shared by every peer in a [`Peerlist`](crate::Peerlist).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Multiplier of the backoff ceiling `(2^retries - 1) * unit`.
    pub backoff_unit_secs: u64,
    /// Retry count at which an untrusted peer is culled.
    pub max_retry_times: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            backoff_unit_secs: DEFAULT_BACKOFF_UNIT_SECS,
            max_retry_times: DEFAULT_MAX_RETRY_TIMES,
        }
    }
}

impl RetryPolicy {
    /// Upper bound, in seconds, of the random wait after `retry_times` failures.
    pub fn backoff_ceiling_secs(&self, retry_times: u32) -> u64 {
        let factor = 1u64
            .checked_shl(retry_times)
            .map_or(u64::MAX, |p| p - 1);
        factor.saturating_mul(self.backoff_unit_secs)
    }
}

/// Bookkeeping for one known peer.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Peer {
    /// Canonical `ip:port`, unique within a peer list.
    pub addr: String,
    pub last_seen: Timestamp,
    /// Never shared with other nodes and never expired.
    pub private: bool,
    /// Never culled for failed reconnects.
    pub trusted: bool,
    /// Has shown a publicly dialable listening port, so may be handed out in
    /// peer exchange.
    pub valid: bool,
    /// Consecutive failed connection attempts. Not persisted.
    pub retry_times: u32,
}

impl Peer {
    /// A fresh, untrusted, public entry last seen now.
    pub fn new(addr: impl Into<String>) -> Self {
        Self {
            addr: addr.into(),
            last_seen: Timestamp::now(),
            private: false,
            trusted: false,
            valid: false,
            retry_times: 0,
        }
    }

    pub fn seen(&mut self) {
        self.last_seen = Timestamp::now();
    }

    pub fn increase_retry_times(&mut self) {
        self.retry_times = self.retry_times.saturating_add(1);
    }

    /// Clear the failure count after a successful contact.
    pub fn reset_retry_times(&mut self) {
        self.retry_times = 0;
        self.seen();
    }

    /// Whether a reconnect may be attempted now.
    pub fn can_try(&self, policy: &RetryPolicy) -> bool {
        self.can_try_at(Timestamp::now(), policy, &mut rand::thread_rng())
    }

    /// Exponential backoff with jitter: after `n` failures, a random wait in
    /// `[0, (2^n - 1) * unit)` seconds must have passed since `last_seen`.
    pub fn can_try_at<R: Rng>(&self, now: Timestamp, policy: &RetryPolicy, rng: &mut R) -> bool {
        let ceiling = policy.backoff_ceiling_secs(self.retry_times);
        if ceiling == 0 {
            return true;
        }
        let wait = rng.gen_range(0..ceiling);
        self.last_seen.elapsed_since(now) > wait
    }

    /// Whether failed reconnects have reached the cull threshold.
    pub fn exhausted(&self, policy: &RetryPolicy) -> bool {
        self.retry_times >= policy.max_retry_times
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn backoff_ceiling_grows_exponentially() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.backoff_ceiling_secs(0), 0);
        assert_eq!(policy.backoff_ceiling_secs(1), 5);
        assert_eq!(policy.backoff_ceiling_secs(2), 15);
        assert_eq!(policy.backoff_ceiling_secs(3), 35);
        assert_eq!(policy.backoff_ceiling_secs(64), u64::MAX);
        assert_eq!(policy.backoff_ceiling_secs(200), u64::MAX);
    }

    #[test]
    fn fresh_peer_can_always_try() {
        let peer = Peer::new("112.32.32.14:6000");
        let policy = RetryPolicy::default();
        for _ in 0..100 {
            assert!(peer.can_try(&policy));
        }
    }

    #[test]
    fn just_failed_peer_must_wait() {
        let mut peer = Peer::new("112.32.32.14:6000");
        peer.increase_retry_times();
        let policy = RetryPolicy::default();
        let mut rng = StdRng::seed_from_u64(7);
        let now = peer.last_seen;
        let eligible = (0..1_000)
            .filter(|_| peer.can_try_at(now, &policy, &mut rng))
            .count();
        assert_eq!(eligible, 0);
    }

    #[test]
    fn eligibility_returns_after_the_ceiling() {
        let mut peer = Peer::new("112.32.32.14:6000");
        peer.retry_times = 2;
        let policy = RetryPolicy::default();
        let mut rng = StdRng::seed_from_u64(11);
        let later = Timestamp::new(peer.last_seen.as_secs() + 15);
        assert!((0..1_000).all(|_| peer.can_try_at(later, &policy, &mut rng)));
    }

    #[test]
    fn jitter_spreads_eligibility_inside_the_window() {
        let mut peer = Peer::new("112.32.32.14:6000");
        peer.retry_times = 3;
        let policy = RetryPolicy::default();
        let mut rng = StdRng::seed_from_u64(3);
        let midway = Timestamp::new(peer.last_seen.as_secs() + 17);
        let eligible = (0..2_000)
            .filter(|_| peer.can_try_at(midway, &policy, &mut rng))
            .count();
        assert!(eligible > 500 && eligible < 1_500, "eligible = {eligible}");
    }

    #[test]
    fn reset_clears_retries_and_refreshes_last_seen() {
        let mut peer = Peer::new("112.32.32.14:6000");
        peer.last_seen = Timestamp::EPOCH;
        peer.increase_retry_times();
        peer.increase_retry_times();
        peer.reset_retry_times();
        assert_eq!(peer.retry_times, 0);
        assert!(peer.last_seen > Timestamp::EPOCH);
    }

    #[test]
    fn exhausted_at_threshold() {
        let policy = RetryPolicy {
            backoff_unit_secs: 1,
            max_retry_times: 2,
        };
        let mut peer = Peer::new("112.32.32.14:6000");
        peer.increase_retry_times();
        assert!(!peer.exhausted(&policy));
        peer.increase_retry_times();
        assert!(peer.exhausted(&policy));
    }
}
