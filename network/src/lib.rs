//! Peer exchange for the Cairn node.
//!
//! Keeps a bounded, persistent book of known peer addresses with trust,
//! privacy and reachability bookkeeping, and the maintenance loop that keeps
//! it healthy. Connection handling and the gossip protocol live elsewhere
//! and drive this crate through [`Pex`].

pub mod address;
pub mod blacklist;
pub mod config;
pub mod error;
pub mod peer;
pub mod peer_file;
pub mod peerlist;
pub mod pex;
pub mod remote;

pub use address::{canonical_address, validate_address};
pub use blacklist::Blacklist;
pub use config::PexConfig;
pub use error::PexError;
pub use peer::{Peer, RetryPolicy};
pub use peerlist::Peerlist;
pub use pex::Pex;
pub use remote::{fetch_remote_peer_list, parse_remote_peer_list};
