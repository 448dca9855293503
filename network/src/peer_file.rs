//! On-disk format of the peer list.
//!
//! The file is a JSON object keyed by address:
//!
//! ```json
//! { "112.32.32.14:6000": { "Addr": "112.32.32.14:6000", "LastSeen": 1700000000,
//!   "Private": false, "Trusted": true, "HasIncomingPort": true } }
//! ```
//!
//! Older nodes wrote `LastSeen` as an RFC 3339 string and called the
//! reachability flag `HasIncomePort`. Both shapes are read; only the current
//! one is written. Retry counters are never stored.

use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use cairn_utils::Timestamp;
use chrono::DateTime;
use serde::{Deserialize, Serialize};

use crate::address::canonical_address;
use crate::error::PexError;
use crate::peer::Peer;

/// File name of the peer list inside the data directory.
pub const PEERS_FILENAME: &str = "peers.json";

const TEMP_PREFIX: &str = ".peers.json.";

#[derive(Debug, Serialize, Deserialize)]
struct PeerRecord {
    #[serde(rename = "Addr")]
    addr: String,
    #[serde(rename = "LastSeen")]
    last_seen: i64,
    #[serde(rename = "Private", default)]
    private: bool,
    #[serde(rename = "Trusted", default)]
    trusted: bool,
    #[serde(rename = "HasIncomingPort", alias = "Valid", default)]
    has_incoming_port: bool,
}

#[derive(Debug, Deserialize)]
struct LegacyPeerRecord {
    #[serde(rename = "Addr")]
    addr: String,
    #[serde(rename = "LastSeen")]
    last_seen: String,
    #[serde(rename = "Private", default)]
    private: bool,
    #[serde(rename = "Trusted", default)]
    trusted: bool,
    #[serde(rename = "HasIncomePort", default)]
    has_income_port: bool,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum StoredPeer {
    Current(PeerRecord),
    Legacy(LegacyPeerRecord),
}

impl StoredPeer {
    fn into_peer(self) -> Result<Peer, String> {
        let (addr, last_seen, private, trusted, valid) = match self {
            Self::Current(r) => (r.addr, r.last_seen, r.private, r.trusted, r.has_incoming_port),
            Self::Legacy(r) => {
                let last_seen = DateTime::parse_from_rfc3339(&r.last_seen)
                    .map_err(|e| format!("bad LastSeen {:?}: {e}", r.last_seen))?
                    .timestamp();
                (r.addr, last_seen, r.private, r.trusted, r.has_income_port)
            }
        };
        Ok(Peer {
            addr,
            last_seen: Timestamp::new(last_seen.max(0) as u64),
            private,
            trusted,
            valid,
            retry_times: 0,
        })
    }
}

impl From<&Peer> for PeerRecord {
    fn from(p: &Peer) -> Self {
        Self {
            addr: p.addr.clone(),
            last_seen: i64::try_from(p.last_seen.as_secs()).unwrap_or(i64::MAX),
            private: p.private,
            trusted: p.trusted,
            has_incoming_port: p.valid,
        }
    }
}

/// Path of the peer list file under `dir`.
pub fn peers_path(dir: &Path) -> PathBuf {
    dir.join(PEERS_FILENAME)
}

/// Serialize peers into the current file format.
pub fn encode(peers: &[Peer]) -> Result<Vec<u8>, PexError> {
    let records: BTreeMap<&str, PeerRecord> =
        peers.iter().map(|p| (p.addr.as_str(), PeerRecord::from(p))).collect();
    Ok(serde_json::to_vec_pretty(&records)?)
}

/// Parse a peer list file in either format.
///
/// Malformed JSON is an error. Individual records that cannot be decoded, or
/// whose address is not a valid peer address (loopback allowed), are skipped.
pub fn decode(bytes: &[u8]) -> Result<Vec<Peer>, PexError> {
    if bytes.iter().all(u8::is_ascii_whitespace) {
        return Ok(Vec::new());
    }

    let raw: HashMap<String, serde_json::Value> = serde_json::from_slice(bytes)?;
    let mut peers = Vec::with_capacity(raw.len());
    for (key, value) in raw {
        let mut peer = match serde_json::from_value::<StoredPeer>(value)
            .map_err(|e| e.to_string())
            .and_then(StoredPeer::into_peer)
        {
            Ok(peer) => peer,
            Err(e) => {
                tracing::warn!(addr = %key, error = %e, "skipping unreadable peer record");
                continue;
            }
        };
        if peer.addr.is_empty() {
            peer.addr = key;
        }
        match canonical_address(&peer.addr, true) {
            Some(addr) => peer.addr = addr,
            None => {
                tracing::warn!(addr = %peer.addr, "skipping stored peer with invalid address");
                continue;
            }
        }
        peers.push(peer);
    }
    Ok(peers)
}

/// Read the peer list file under `dir`. A missing file reads as `None`.
pub fn read(dir: &Path) -> io::Result<Option<Vec<u8>>> {
    match fs::read(peers_path(dir)) {
        Ok(bytes) => Ok(Some(bytes)),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e),
    }
}

/// Replace the peer list file under `dir` with `bytes`.
///
/// Each call writes its own owner-only temp file in `dir` and renames it over
/// the target, so concurrent saves never share a temp file and a crash
/// never leaves a truncated peer list behind.
pub fn write_atomic(dir: &Path, bytes: &[u8]) -> io::Result<()> {
    fs::create_dir_all(dir)?;
    let mut tmp = tempfile::Builder::new()
        .prefix(TEMP_PREFIX)
        .suffix(".tmp")
        .tempfile_in(dir)?;
    tmp.write_all(bytes)?;
    tmp.as_file().sync_all()?;
    tmp.persist(peers_path(dir)).map_err(|e| e.error)?;
    Ok(())
}
