//! Peer exchange configuration with TOML file support.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use crate::error::PexError;
use crate::peer::{RetryPolicy, DEFAULT_BACKOFF_UNIT_SECS, DEFAULT_MAX_RETRY_TIMES};

/// Configuration for the peer exchange service. Immutable once the
/// service is built.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PexConfig {
    /// Directory holding the peer list file.
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,

    /// Maximum number of known peers (`0` = unbounded).
    #[serde(default = "default_max_peers")]
    pub max_peers: usize,

    /// Public peers not seen for this long are forgotten.
    #[serde(default = "default_expiration_secs")]
    pub expiration_secs: u64,

    /// How often unreachable peers are culled.
    #[serde(default = "default_cull_interval_secs")]
    pub cull_interval_secs: u64,

    /// How often expired peers are cleared.
    #[serde(default = "default_clear_old_interval_secs")]
    pub clear_old_interval_secs: u64,

    /// Number of peers handed out per peer exchange reply.
    #[serde(default = "default_reply_count")]
    pub reply_count: usize,

    /// Accept loopback addresses (local test networks).
    #[serde(default)]
    pub allow_localhost: bool,

    /// Disable peer expiry.
    #[serde(default)]
    pub disabled: bool,

    /// The node runs without networking; maintenance is skipped.
    #[serde(default)]
    pub network_disabled: bool,

    /// Fetch bootstrap peers from `peer_list_url` at startup.
    #[serde(default)]
    pub download_peer_list: bool,

    /// Newline-delimited `ip:port` list served over HTTP(S).
    #[serde(default)]
    pub peer_list_url: Option<String>,

    /// Backoff unit for reconnect attempts.
    #[serde(default = "default_retry_backoff_secs")]
    pub retry_backoff_secs: u64,

    /// Failed attempts after which an untrusted peer is culled.
    #[serde(default = "default_max_retry_times")]
    pub max_retry_times: u32,
}

// ── Serde default helpers ──────────────────────────────────────────────

fn default_data_dir() -> PathBuf {
    PathBuf::from("./cairn_data")
}

fn default_max_peers() -> usize {
    1000
}

fn default_expiration_secs() -> u64 {
    24 * 60 * 60
}

fn default_cull_interval_secs() -> u64 {
    10
}

fn default_clear_old_interval_secs() -> u64 {
    10 * 60
}

fn default_reply_count() -> usize {
    30
}

fn default_retry_backoff_secs() -> u64 {
    DEFAULT_BACKOFF_UNIT_SECS
}

fn default_max_retry_times() -> u32 {
    DEFAULT_MAX_RETRY_TIMES
}

// ── Impl ───────────────────────────────────────────────────────────────

impl PexConfig {
    /// Load configuration from a TOML file.
    pub fn from_toml_file(path: &str) -> Result<Self, PexError> {
        let content =
            std::fs::read_to_string(path).map_err(|e| PexError::Config(e.to_string()))?;
        Self::from_toml_str(&content)
    }

    /// Parse configuration from a TOML string.
    pub fn from_toml_str(s: &str) -> Result<Self, PexError> {
        let config: Self = toml::from_str(s).map_err(|e| PexError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Serialize the configuration to a TOML string.
    pub fn to_toml_string(&self) -> Result<String, PexError> {
        toml::to_string_pretty(self).map_err(|e| PexError::Config(e.to_string()))
    }

    /// Reject settings the maintenance loop cannot run with.
    pub fn validate(&self) -> Result<(), PexError> {
        if self.cull_interval_secs == 0 {
            return Err(PexError::Config("cull_interval_secs must be positive".into()));
        }
        if self.clear_old_interval_secs == 0 {
            return Err(PexError::Config("clear_old_interval_secs must be positive".into()));
        }
        if self.download_peer_list && self.peer_list_url.is_none() {
            return Err(PexError::Config(
                "download_peer_list requires peer_list_url".into(),
            ));
        }
        Ok(())
    }

    pub fn expiration(&self) -> Duration {
        Duration::from_secs(self.expiration_secs)
    }

    pub fn cull_interval(&self) -> Duration {
        Duration::from_secs(self.cull_interval_secs)
    }

    pub fn clear_old_interval(&self) -> Duration {
        Duration::from_secs(self.clear_old_interval_secs)
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            backoff_unit_secs: self.retry_backoff_secs,
            max_retry_times: self.max_retry_times,
        }
    }
}

impl Default for PexConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            max_peers: default_max_peers(),
            expiration_secs: default_expiration_secs(),
            cull_interval_secs: default_cull_interval_secs(),
            clear_old_interval_secs: default_clear_old_interval_secs(),
            reply_count: default_reply_count(),
            allow_localhost: false,
            disabled: false,
            network_disabled: false,
            download_peer_list: false,
            peer_list_url: None,
            retry_backoff_secs: default_retry_backoff_secs(),
            max_retry_times: default_max_retry_times(),
        }
    }
}
