//! Peer exchange service: the address book plus its upkeep.
//!
//! [`Pex`] validates addresses before they reach the [`Peerlist`], seeds the
//! list with trusted bootstrap peers, and runs a maintenance loop that culls
//! unreachable peers, expires stale ones and persists the list.

use std::io;

use cairn_utils::ShutdownController;
use tokio::time::{interval_at, Instant, MissedTickBehavior};

use crate::address::canonical_address;
use crate::blacklist::Blacklist;
use crate::config::PexConfig;
use crate::error::PexError;
use crate::peer::Peer;
use crate::peerlist::Peerlist;
use crate::remote::fetch_remote_peer_list;

pub struct Pex {
    config: PexConfig,
    peerlist: Peerlist,
    blacklist: Blacklist,
    shutdown: ShutdownController,
}

impl Pex {
    /// Build the service: load the stored peer list, add every default
    /// connection as a trusted peer, and save the result.
    ///
    /// Fails if the peer file cannot be read or written, or if a default
    /// connection is invalid or does not fit.
    pub fn new(config: PexConfig, default_connections: &[String]) -> Result<Self, PexError> {
        config.validate()?;
        let peerlist = Peerlist::with_policy(config.max_peers, config.retry_policy());
        let loaded = peerlist.load(&config.data_dir)?;
        tracing::info!(loaded, dir = %config.data_dir.display(), "loaded peer list");

        let pex = Self {
            config,
            peerlist,
            blacklist: Blacklist::new(),
            shutdown: ShutdownController::new(),
        };

        for addr in default_connections {
            let addr = pex.check(addr)?;
            pex.peerlist.add_peer(&addr)?;
            pex.peerlist.set_trusted(&addr, true)?;
        }

        pex.save()?;
        Ok(pex)
    }

    pub fn config(&self) -> &PexConfig {
        &self.config
    }

    /// Shared handle to the underlying address book.
    pub fn peerlist(&self) -> &Peerlist {
        &self.peerlist
    }

    pub fn blacklist(&self) -> &Blacklist {
        &self.blacklist
    }

    // -- Maintenance loop ------------------------------------------------------

    /// Run maintenance until [`shutdown`](Self::shutdown) is called, then
    /// save the list one last time.
    ///
    /// Culling runs every `cull_interval` unless networking is disabled;
    /// expiry runs every `clear_old_interval` unless the service or
    /// networking is disabled. Save failures inside the loop are logged and
    /// otherwise ignored; a failure of the final save is returned.
    pub async fn run(&self) -> Result<(), PexError> {
        let mut quit = self.shutdown.subscribe();

        if self.config.download_peer_list && !self.config.network_disabled {
            self.spawn_peer_list_download();
        }

        let start = Instant::now();
        let mut cull = interval_at(start + self.config.cull_interval(), self.config.cull_interval());
        cull.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut clear_old = interval_at(
            start + self.config.clear_old_interval(),
            self.config.clear_old_interval(),
        );
        clear_old.set_missed_tick_behavior(MissedTickBehavior::Delay);

        tracing::info!(peers = self.peerlist.len(), "peer exchange running");

        loop {
            tokio::select! {
                _ = quit.wait() => break,
                _ = cull.tick() => {
                    if self.config.network_disabled {
                        continue;
                    }
                    let culled = self.peerlist.cull_invalid_peers();
                    if !culled.is_empty() {
                        tracing::info!(count = culled.len(), "culled unreachable peers");
                    }
                    self.persist_logged().await;
                }
                _ = clear_old.tick() => {
                    if self.config.disabled || self.config.network_disabled {
                        continue;
                    }
                    let removed = self.peerlist.clear_old(self.config.expiration());
                    if removed > 0 {
                        tracing::info!(count = removed, "cleared expired peers");
                    }
                    self.persist_logged().await;
                }
            }
        }

        tracing::info!("peer exchange stopping, saving peer list");
        self.persist().await
    }

    /// Stop [`run`](Self::run). Safe to call any number of times.
    pub fn shutdown(&self) {
        self.shutdown.shutdown();
    }

    fn spawn_peer_list_download(&self) {
        let Some(url) = self.config.peer_list_url.clone() else {
            return;
        };
        let peerlist = self.peerlist.clone();
        let allow_localhost = self.config.allow_localhost;
        let mut quit = self.shutdown.subscribe();

        tokio::spawn(async move {
            tokio::select! {
                _ = quit.wait() => {}
                result = fetch_remote_peer_list(&url) => match result {
                    Ok(addrs) => {
                        let added = peerlist.add_peers(&addrs, |a| canonical_address(a, allow_localhost));
                        tracing::info!(added, listed = addrs.len(), %url, "added peers from remote peer list");
                    }
                    Err(e) => tracing::warn!(error = %e, %url, "failed to download peer list"),
                }
            }
        });
    }

    async fn persist(&self) -> Result<(), PexError> {
        let peerlist = self.peerlist.clone();
        let dir = self.config.data_dir.clone();
        tokio::task::spawn_blocking(move || peerlist.save(&dir))
            .await
            .map_err(|e| PexError::Io(io::Error::other(e)))?
    }

    async fn persist_logged(&self) {
        if let Err(e) = self.persist().await {
            tracing::error!(error = %e, "failed to save peer list");
        }
    }

    // -- Validated mutations ---------------------------------------------------

    /// Validate `addr` and return the canonical key it is stored under.
    fn check(&self, addr: &str) -> Result<String, PexError> {
        canonical_address(addr, self.config.allow_localhost)
            .ok_or_else(|| PexError::InvalidAddress(addr.to_string()))
    }

    /// Key for a lookup. Addresses that fail validation are never stored, so
    /// falling back to the trimmed input simply finds nothing.
    fn key(&self, addr: &str) -> String {
        canonical_address(addr, self.config.allow_localhost)
            .unwrap_or_else(|| addr.trim().to_string())
    }

    pub fn add_peer(&self, addr: &str) -> Result<(), PexError> {
        let addr = self.check(addr)?;
        self.peerlist.add_peer(&addr)
    }

    /// Add every valid address; returns how many were stored.
    pub fn add_peers(&self, addrs: &[String]) -> usize {
        let allow_localhost = self.config.allow_localhost;
        self.peerlist
            .add_peers(addrs, |a| canonical_address(a, allow_localhost))
    }

    pub fn set_private(&self, addr: &str, private: bool) -> Result<(), PexError> {
        let addr = self.check(addr)?;
        self.peerlist.set_private(&addr, private)
    }

    pub fn set_trusted(&self, addr: &str, trusted: bool) -> Result<(), PexError> {
        let addr = self.check(addr)?;
        self.peerlist.set_trusted(&addr, trusted)
    }

    pub fn set_valid(&self, addr: &str, valid: bool) -> Result<(), PexError> {
        let addr = self.check(addr)?;
        self.peerlist.set_valid(&addr, valid)
    }

    pub fn increase_retry_times(&self, addr: &str) -> Result<(), PexError> {
        self.peerlist.increase_retry_times(&self.key(addr))
    }

    pub fn reset_retry_times(&self, addr: &str) -> Result<(), PexError> {
        self.peerlist.reset_retry_times(&self.key(addr))
    }

    pub fn reset_all_retry_times(&self) {
        self.peerlist.reset_all_retry_times();
    }

    pub fn remove_peer(&self, addr: &str) {
        self.peerlist.remove_peer(&self.key(addr));
    }

    // -- Queries ---------------------------------------------------------------

    pub fn get_peer(&self, addr: &str) -> Option<Peer> {
        self.peerlist.get_peer(&self.key(addr))
    }

    pub fn is_full(&self) -> bool {
        self.peerlist.is_full()
    }

    /// Up to `count` reachable public peers (`0` = all).
    pub fn random_public(&self, count: usize) -> Vec<Peer> {
        self.peerlist.random(count, false)
    }

    /// Up to `count` reachable peers, private ones included (`0` = all).
    pub fn random_all(&self, count: usize) -> Vec<Peer> {
        self.peerlist.random(count, true)
    }

    /// Up to `count` public peers known to accept inbound connections.
    pub fn random_exchangeable(&self, count: usize) -> Vec<Peer> {
        self.peerlist.random_exchangeable(count, false)
    }

    /// Peers to send in reply to another node's peer exchange request.
    pub fn peers_for_exchange(&self) -> Vec<Peer> {
        self.random_exchangeable(self.config.reply_count)
    }

    pub fn trusted(&self) -> Vec<Peer> {
        self.peerlist.trusted_peers()
    }

    pub fn trusted_public(&self) -> Vec<Peer> {
        self.peerlist.public_trusted_peers()
    }

    pub fn private_addresses(&self) -> Vec<String> {
        self.peerlist.private_addresses()
    }

    /// Write the peer list to the data directory now.
    pub fn save(&self) -> Result<(), PexError> {
        self.peerlist.save(&self.config.data_dir)
    }
}
