use thiserror::Error;

#[derive(Debug, Error)]
pub enum PexError {
    #[error("invalid address {0}")]
    InvalidAddress(String),

    #[error("peer list full")]
    PeerlistFull,

    #[error("peer {0} not found")]
    PeerNotFound(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("peer list download failed: {0}")]
    PeerListFetch(String),

    #[error("config error: {0}")]
    Config(String),
}

impl From<serde_json::Error> for PexError {
    fn from(e: serde_json::Error) -> Self {
        Self::Serialization(e.to_string())
    }
}

impl From<reqwest::Error> for PexError {
    fn from(e: reqwest::Error) -> Self {
        Self::PeerListFetch(e.to_string())
    }
}
