//! Bounded address book of known peers.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use cairn_utils::Timestamp;
use parking_lot::Mutex;
use rand::seq::SliceRandom;

use crate::error::PexError;
use crate::peer::{Peer, RetryPolicy};
use crate::peer_file;

/// Shared handle to the set of known peers, keyed by `"ip:port"`.
///
/// Every operation holds the internal lock only for its in-memory work;
/// file I/O in [`save`](Self::save) and [`load`](Self::load) happens outside
/// it. Reads return copies, never references into the map. Cloning the
/// handle shares the same underlying list.
#[derive(Clone)]
pub struct Peerlist {
    peers: Arc<Mutex<HashMap<String, Peer>>>,
    /// Upper bound on tracked peers; `0` means unbounded.
    max_peers: usize,
    policy: RetryPolicy,
}

impl Peerlist {
    /// Create an empty list holding at most `max_peers` entries (`0` = unbounded).
    pub fn new(max_peers: usize) -> Self {
        Self::with_policy(max_peers, RetryPolicy::default())
    }

    pub fn with_policy(max_peers: usize, policy: RetryPolicy) -> Self {
        Self {
            peers: Arc::new(Mutex::new(HashMap::new())),
            max_peers,
            policy,
        }
    }

    pub fn policy(&self) -> RetryPolicy {
        self.policy
    }

    pub fn max_peers(&self) -> usize {
        self.max_peers
    }

    pub fn len(&self) -> usize {
        self.peers.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.lock().is_empty()
    }

    /// Whether a capacity is set and has been reached.
    pub fn is_full(&self) -> bool {
        self.max_peers > 0 && self.len() >= self.max_peers
    }

    // -- Peer lifecycle --------------------------------------------------------

    /// Insert `addr`, or refresh its last-seen time if already known.
    ///
    /// The address is not validated here; that is the caller's job.
    pub fn add_peer(&self, addr: &str) -> Result<(), PexError> {
        let mut peers = self.peers.lock();
        insert_or_refresh(&mut peers, self.max_peers, addr)
    }

    /// Insert every address `canonicalize` accepts, keyed by the form it
    /// returns. Returns how many were accepted and stored (refreshing a known
    /// peer counts). Failures are logged and do not stop the remaining
    /// addresses.
    pub fn add_peers<I, S, F>(&self, addrs: I, canonicalize: F) -> usize
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
        F: Fn(&str) -> Option<String>,
    {
        let mut peers = self.peers.lock();
        let mut added = 0;
        for addr in addrs {
            let raw = addr.as_ref();
            let Some(addr) = canonicalize(raw) else {
                tracing::debug!(addr = raw, "skipping invalid peer address");
                continue;
            };
            match insert_or_refresh(&mut peers, self.max_peers, &addr) {
                Ok(()) => added += 1,
                Err(e) => tracing::warn!(addr = %addr, error = %e, "failed to add peer"),
            }
        }
        added
    }

    /// Remove a peer. Unknown addresses are ignored.
    pub fn remove_peer(&self, addr: &str) {
        self.peers.lock().remove(addr);
    }

    pub fn set_private(&self, addr: &str, private: bool) -> Result<(), PexError> {
        self.update(addr, |p| p.private = private)
    }

    pub fn set_trusted(&self, addr: &str, trusted: bool) -> Result<(), PexError> {
        self.update(addr, |p| p.trusted = trusted)
    }

    /// Record whether the peer has a publicly dialable listening port.
    pub fn set_valid(&self, addr: &str, valid: bool) -> Result<(), PexError> {
        self.update(addr, |p| p.valid = valid)
    }

    /// Record a failed connection attempt.
    pub fn increase_retry_times(&self, addr: &str) -> Result<(), PexError> {
        self.update(addr, Peer::increase_retry_times)
    }

    /// Record a successful contact: clears the retry count and refreshes last-seen.
    pub fn reset_retry_times(&self, addr: &str) -> Result<(), PexError> {
        self.update(addr, Peer::reset_retry_times)
    }

    pub fn reset_all_retry_times(&self) {
        for peer in self.peers.lock().values_mut() {
            peer.reset_retry_times();
        }
    }

    fn update(&self, addr: &str, f: impl FnOnce(&mut Peer)) -> Result<(), PexError> {
        let mut peers = self.peers.lock();
        let peer = peers
            .get_mut(addr)
            .ok_or_else(|| PexError::PeerNotFound(addr.to_string()))?;
        f(peer);
        Ok(())
    }

    // -- Queries ---------------------------------------------------------------

    /// Copy of the entry for `addr`.
    pub fn get_peer(&self, addr: &str) -> Option<Peer> {
        self.peers.lock().get(addr).cloned()
    }

    /// Up to `count` random peers whose backoff allows a reconnect now
    /// (`count == 0` returns all of them, shuffled).
    pub fn random(&self, count: usize, include_private: bool) -> Vec<Peer> {
        let policy = self.policy;
        self.sample(count, |p| (include_private || !p.private) && p.can_try(&policy))
    }

    /// Up to `count` random peers flagged valid, i.e. fit to hand out in
    /// peer exchange (`count == 0` returns all of them, shuffled).
    pub fn random_exchangeable(&self, count: usize, include_private: bool) -> Vec<Peer> {
        self.sample(count, |p| (include_private || !p.private) && p.valid)
    }

    /// Copies of every entry, in no particular order.
    pub fn all(&self) -> Vec<Peer> {
        self.filtered(|_| true)
    }

    /// Trusted peers that may be shared.
    pub fn public_trusted_peers(&self) -> Vec<Peer> {
        self.filtered(|p| p.trusted && !p.private)
    }

    pub fn trusted_peers(&self) -> Vec<Peer> {
        self.filtered(|p| p.trusted)
    }

    pub fn private_addresses(&self) -> Vec<String> {
        self.peers
            .lock()
            .values()
            .filter(|p| p.private)
            .map(|p| p.addr.clone())
            .collect()
    }

    fn filtered(&self, keep: impl Fn(&Peer) -> bool) -> Vec<Peer> {
        self.peers
            .lock()
            .values()
            .filter(|p| keep(p))
            .cloned()
            .collect()
    }

    /// Materialize the eligible entries, shuffle them, and take a prefix.
    fn sample(&self, count: usize, eligible: impl Fn(&Peer) -> bool) -> Vec<Peer> {
        let mut candidates = self.filtered(eligible);
        candidates.shuffle(&mut rand::thread_rng());
        if count > 0 {
            candidates.truncate(count);
        }
        candidates
    }

    // -- Maintenance -----------------------------------------------------------

    /// Remove and return untrusted peers whose retry count reached the
    /// policy threshold.
    pub fn cull_invalid_peers(&self) -> Vec<Peer> {
        let policy = self.policy;
        let mut culled = Vec::new();
        self.peers.lock().retain(|_, p| {
            if !p.trusted && p.exhausted(&policy) {
                culled.push(p.clone());
                false
            } else {
                true
            }
        });
        for peer in &culled {
            tracing::debug!(addr = %peer.addr, retries = peer.retry_times, "culled unreachable peer");
        }
        culled
    }

    /// Remove public peers not seen for more than `max_age`. Returns the
    /// number removed.
    pub fn clear_old(&self, max_age: Duration) -> usize {
        self.clear_old_at(max_age, Timestamp::now())
    }

    pub fn clear_old_at(&self, max_age: Duration, now: Timestamp) -> usize {
        let mut peers = self.peers.lock();
        let before = peers.len();
        peers.retain(|addr, p| {
            let expired = !p.private && p.last_seen.older_than(max_age, now);
            if expired {
                tracing::debug!(addr = %addr, last_seen = %p.last_seen, "expired stale peer");
            }
            !expired
        });
        before - peers.len()
    }

    // -- Persistence -----------------------------------------------------------

    /// Write the list to the peer file under `dir`.
    ///
    /// Untrusted peers already past the cull threshold are left out.
    pub fn save(&self, dir: &Path) -> Result<(), PexError> {
        let max_retries = self.policy.max_retry_times;
        let snapshot = self.filtered(|p| p.trusted || p.retry_times <= max_retries);
        let bytes = peer_file::encode(&snapshot)?;
        peer_file::write_atomic(dir, &bytes)?;
        tracing::debug!(peers = snapshot.len(), dir = %dir.display(), "saved peer list");
        Ok(())
    }

    /// Replace the in-memory list with the peer file under `dir`. A missing
    /// file leaves the list empty. Returns the number of peers loaded.
    pub fn load(&self, dir: &Path) -> Result<usize, PexError> {
        let loaded = match peer_file::read(dir)? {
            Some(bytes) => peer_file::decode(&bytes)?,
            None => {
                tracing::info!(dir = %dir.display(), "no peer list file, starting empty");
                Vec::new()
            }
        };

        let mut peers = self.peers.lock();
        peers.clear();
        for peer in loaded {
            if self.max_peers > 0 && peers.len() >= self.max_peers {
                tracing::warn!(max = self.max_peers, "peer list file exceeds capacity, dropping the rest");
                break;
            }
            peers.insert(peer.addr.clone(), peer);
        }
        Ok(peers.len())
    }
}

fn insert_or_refresh(
    peers: &mut HashMap<String, Peer>,
    max_peers: usize,
    addr: &str,
) -> Result<(), PexError> {
    if let Some(peer) = peers.get_mut(addr) {
        peer.seen();
        return Ok(());
    }
    if max_peers > 0 && peers.len() >= max_peers {
        return Err(PexError::PeerlistFull);
    }
    peers.insert(addr.to_string(), Peer::new(addr));
    Ok(())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::address::canonical_address;
    use std::collections::HashSet;

    fn addr(n: u16) -> String {
        format!("112.32.32.14:{}", 10_000 + n)
    }

    fn filled(count: u16) -> Peerlist {
        let pl = Peerlist::new(0);
        for n in 0..count {
            pl.add_peer(&addr(n)).unwrap();
        }
        pl
    }

    fn backdate(pl: &Peerlist, a: &str, secs: u64) {
        let mut peers = pl.peers.lock();
        let peer = peers.get_mut(a).unwrap();
        peer.last_seen = Timestamp::now().saturating_sub_secs(secs);
    }

    #[test]
    fn capacity_rejects_new_but_refreshes_known() {
        let pl = Peerlist::new(3);
        pl.add_peer("112.32.32.14:10011").unwrap();
        pl.add_peer("112.32.32.14:20011").unwrap();
        pl.add_peer("112.32.32.14:30011").unwrap();
        assert!(pl.is_full());

        let err = pl.add_peer("112.32.32.14:40011").unwrap_err();
        assert!(matches!(err, PexError::PeerlistFull));

        pl.add_peer("112.32.32.14:10011").unwrap();
        assert!(pl.is_full());
        assert_eq!(pl.len(), 3);
    }

    #[test]
    fn zero_capacity_is_unbounded() {
        let pl = filled(50);
        assert!(!pl.is_full());
        assert_eq!(pl.len(), 50);
    }

    #[test]
    fn re_adding_refreshes_last_seen() {
        let pl = Peerlist::new(0);
        let a = addr(1);
        pl.add_peer(&a).unwrap();
        backdate(&pl, &a, 1_000);
        let stale = pl.get_peer(&a).unwrap().last_seen;

        pl.add_peer(&a).unwrap();
        assert_eq!(pl.len(), 1);
        assert!(pl.get_peer(&a).unwrap().last_seen > stale);
    }

    #[test]
    fn new_peers_are_untrusted_and_public() {
        let pl = filled(1);
        let p = pl.get_peer(&addr(0)).unwrap();
        assert!(!p.trusted && !p.private && !p.valid);
        assert_eq!(p.retry_times, 0);
    }

    #[test]
    fn add_peers_counts_accepted_addresses() {
        let pl = Peerlist::new(3);
        pl.add_peer("112.32.32.14:10011").unwrap();
        let added = pl.add_peers(
            [
                "112.32.32.14:10011",
                "112.32.32.14:80",
                "not an address",
                "112.32.32.14:20011",
                "112.32.32.14:30011",
                "112.32.32.14:40011",
            ],
            |a| canonical_address(a, false),
        );
        // duplicate + two new; the fourth distinct address hits capacity
        assert_eq!(added, 3);
        assert_eq!(pl.len(), 3);
        assert!(pl.get_peer("112.32.32.14:40011").is_none());
    }

    #[test]
    fn add_peers_keys_by_canonical_form() {
        let pl = Peerlist::new(0);
        let added = pl.add_peers(
            [" 112.32.32.14:6000", "112.32.32.14:6000\n", "112.32.32.14:06000"],
            |a| canonical_address(a, false),
        );
        assert_eq!(added, 3);
        assert_eq!(pl.len(), 1);
        assert!(pl.get_peer("112.32.32.14:6000").is_some());
    }

    #[test]
    fn all_ignores_backoff() {
        let pl = filled(3);
        for _ in 0..5 {
            pl.increase_retry_times(&addr(1)).unwrap();
        }
        pl.set_private(&addr(2), true).unwrap();
        let mut addrs: Vec<String> = pl.all().into_iter().map(|p| p.addr).collect();
        addrs.sort();
        assert_eq!(addrs, vec![addr(0), addr(1), addr(2)]);
    }

    #[test]
    fn setters_fail_on_unknown_address() {
        let pl = filled(1);
        assert!(matches!(
            pl.set_trusted("1.2.3.4:6000", true),
            Err(PexError::PeerNotFound(_))
        ));
        assert!(pl.set_private("1.2.3.4:6000", true).is_err());
        assert!(pl.set_valid("1.2.3.4:6000", true).is_err());
        assert!(pl.increase_retry_times("1.2.3.4:6000").is_err());

        pl.set_trusted(&addr(0), true).unwrap();
        pl.set_private(&addr(0), true).unwrap();
        pl.set_valid(&addr(0), true).unwrap();
        let p = pl.get_peer(&addr(0)).unwrap();
        assert!(p.trusted && p.private && p.valid);
    }

    #[test]
    fn get_peer_returns_a_copy() {
        let pl = filled(1);
        let mut copy = pl.get_peer(&addr(0)).unwrap();
        copy.trusted = true;
        assert!(!pl.get_peer(&addr(0)).unwrap().trusted);
    }

    #[test]
    fn remove_is_silent_for_unknown() {
        let pl = filled(2);
        pl.remove_peer(&addr(0));
        pl.remove_peer(&addr(0));
        assert_eq!(pl.len(), 1);
    }

    #[test]
    fn random_zero_returns_every_public_eligible_peer() {
        let pl = filled(10);
        pl.set_private(&addr(3), true).unwrap();
        for n in 0..100 {
            let a = format!("112.32.32.15:{}", 10_000 + n);
            pl.add_peer(&a).unwrap();
            pl.update(&a, |p| p.retry_times = 60).unwrap();
        }

        let all = pl.random(0, false);
        assert_eq!(all.len(), 9);
        assert!(all.iter().all(|p| p.addr != addr(3)));
        assert_eq!(pl.random(0, true).len(), 10);
    }

    #[test]
    fn random_over_asking_returns_distinct_eligible() {
        let pl = filled(5);
        let sample = pl.random(50, false);
        assert_eq!(sample.len(), 5);
        let unique: HashSet<_> = sample.iter().map(|p| p.addr.clone()).collect();
        assert_eq!(unique.len(), 5);

        assert_eq!(pl.random(2, false).len(), 2);
        assert!(Peerlist::new(0).random(3, false).is_empty());
    }

    #[test]
    fn random_order_varies() {
        let pl = filled(20);
        let first: Vec<String> = pl.random(0, false).into_iter().map(|p| p.addr).collect();
        let differs = (0..20).any(|_| {
            let next: Vec<String> = pl.random(0, false).into_iter().map(|p| p.addr).collect();
            next != first
        });
        assert!(differs);
    }

    #[test]
    fn exchangeable_requires_valid_flag() {
        let pl = filled(6);
        pl.set_valid(&addr(0), true).unwrap();
        pl.set_valid(&addr(1), true).unwrap();
        pl.set_valid(&addr(2), true).unwrap();
        pl.set_private(&addr(2), true).unwrap();

        let public: HashSet<String> = pl
            .random_exchangeable(0, false)
            .into_iter()
            .map(|p| p.addr)
            .collect();
        assert_eq!(public, HashSet::from([addr(0), addr(1)]));
        assert_eq!(pl.random_exchangeable(0, true).len(), 3);
        assert_eq!(pl.random_exchangeable(1, false).len(), 1);
    }

    #[test]
    fn trusted_and_private_views() {
        let pl = filled(4);
        pl.set_trusted(&addr(0), true).unwrap();
        pl.set_trusted(&addr(1), true).unwrap();
        pl.set_private(&addr(1), true).unwrap();
        pl.set_private(&addr(2), true).unwrap();

        assert_eq!(pl.trusted_peers().len(), 2);
        let public_trusted = pl.public_trusted_peers();
        assert_eq!(public_trusted.len(), 1);
        assert_eq!(public_trusted[0].addr, addr(0));

        let mut private = pl.private_addresses();
        private.sort();
        assert_eq!(private, vec![addr(1), addr(2)]);
    }

    #[test]
    fn cull_removes_exhausted_untrusted_only() {
        let pl = filled(3);
        for _ in 0..3 {
            pl.increase_retry_times(&addr(0)).unwrap();
        }
        pl.set_trusted(&addr(1), true).unwrap();
        pl.update(&addr(1), |p| p.retry_times = 100).unwrap();
        pl.increase_retry_times(&addr(2)).unwrap();
        pl.increase_retry_times(&addr(2)).unwrap();

        let culled = pl.cull_invalid_peers();
        assert_eq!(culled.len(), 1);
        assert_eq!(culled[0].addr, addr(0));
        assert!(pl.get_peer(&addr(1)).is_some());
        assert!(pl.get_peer(&addr(2)).is_some());
    }

    #[test]
    fn cull_threshold_follows_policy() {
        let pl = Peerlist::with_policy(
            0,
            RetryPolicy {
                backoff_unit_secs: 1,
                max_retry_times: 1,
            },
        );
        pl.add_peer(&addr(0)).unwrap();
        pl.increase_retry_times(&addr(0)).unwrap();
        assert_eq!(pl.cull_invalid_peers().len(), 1);
    }

    #[test]
    fn reset_retry_times_clears_counters() {
        let pl = filled(2);
        pl.increase_retry_times(&addr(0)).unwrap();
        pl.increase_retry_times(&addr(1)).unwrap();
        pl.reset_retry_times(&addr(0)).unwrap();
        assert_eq!(pl.get_peer(&addr(0)).unwrap().retry_times, 0);
        assert_eq!(pl.get_peer(&addr(1)).unwrap().retry_times, 1);
        pl.reset_all_retry_times();
        assert_eq!(pl.get_peer(&addr(1)).unwrap().retry_times, 0);
    }

    #[test]
    fn clear_old_spares_private_and_recent() {
        let pl = filled(3);
        backdate(&pl, &addr(0), 10_000);
        backdate(&pl, &addr(1), 10_000);
        pl.set_private(&addr(1), true).unwrap();

        let removed = pl.clear_old(Duration::from_secs(3_600));
        assert_eq!(removed, 1);
        assert!(pl.get_peer(&addr(0)).is_none());
        assert!(pl.get_peer(&addr(1)).is_some());
        assert!(pl.get_peer(&addr(2)).is_some());
    }

    #[test]
    fn save_load_round_trip_drops_exhausted_untrusted() {
        let dir = tempfile::tempdir().unwrap();
        let pl = filled(4);
        pl.set_trusted(&addr(0), true).unwrap();
        pl.set_private(&addr(1), true).unwrap();
        pl.set_valid(&addr(1), true).unwrap();
        pl.update(&addr(2), |p| p.retry_times = 4).unwrap();
        pl.update(&addr(3), |p| p.retry_times = 3).unwrap();
        pl.save(dir.path()).unwrap();

        let restored = Peerlist::new(0);
        assert_eq!(restored.load(dir.path()).unwrap(), 3);
        assert!(restored.get_peer(&addr(2)).is_none());
        assert!(restored.get_peer(&addr(0)).unwrap().trusted);
        let p1 = restored.get_peer(&addr(1)).unwrap();
        assert!(p1.private && p1.valid);
        let p3 = restored.get_peer(&addr(3)).unwrap();
        assert_eq!(p3.retry_times, 0);
        assert_eq!(p3.last_seen, pl.get_peer(&addr(3)).unwrap().last_seen);
    }

    #[test]
    fn load_missing_file_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let pl = filled(2);
        assert_eq!(pl.load(dir.path()).unwrap(), 0);
        assert!(pl.is_empty());
    }

    #[test]
    fn load_respects_capacity() {
        let dir = tempfile::tempdir().unwrap();
        filled(5).save(dir.path()).unwrap();
        let small = Peerlist::new(2);
        assert_eq!(small.load(dir.path()).unwrap(), 2);
    }

    #[test]
    fn overlapping_saves_all_succeed() {
        let dir = tempfile::tempdir().unwrap();
        let pl = filled(50);
        std::thread::scope(|scope| {
            for _ in 0..4 {
                scope.spawn(|| {
                    for _ in 0..20 {
                        pl.save(dir.path()).unwrap();
                    }
                });
            }
        });
        let reloaded = Peerlist::new(0);
        assert_eq!(reloaded.load(dir.path()).unwrap(), 50);
    }
}
