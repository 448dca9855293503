//! Explicitly banned peers, kept apart from the address book.

use std::collections::HashMap;

use parking_lot::Mutex;

use crate::peer::Peer;

/// Banned peers keyed by address. Entries stay until deleted.
#[derive(Default)]
pub struct Blacklist {
    entries: Mutex<HashMap<String, Peer>>,
}

impl Blacklist {
    pub fn new() -> Self {
        Self::default()
    }

    /// Ban `peer`, replacing any existing entry for the same address.
    pub fn add(&self, peer: Peer) {
        self.entries.lock().insert(peer.addr.clone(), peer);
    }

    /// Lift the ban on `addr`, returning the removed entry.
    pub fn delete(&self, addr: &str) -> Option<Peer> {
        self.entries.lock().remove(addr)
    }

    pub fn contains(&self, addr: &str) -> bool {
        self.entries.lock().contains_key(addr)
    }

    pub fn get(&self, addr: &str) -> Option<Peer> {
        self.entries.lock().get(addr).cloned()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}
