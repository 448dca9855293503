//! Bootstrap peers published as a plain-text list.

use std::time::Duration;

use crate::address::canonical_address;
use crate::error::PexError;

const FETCH_TIMEOUT: Duration = Duration::from_secs(30);

/// Parse a newline-delimited `ip:port` list. Blank lines and lines starting
/// with `#` are ignored; entries that are not valid public peer addresses
/// are dropped with a warning. Entries come back in canonical form.
pub fn parse_remote_peer_list(body: &str) -> Vec<String> {
    body.lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .filter_map(|line| {
            let addr = canonical_address(line, false);
            if addr.is_none() {
                tracing::warn!(addr = %line, "ignoring invalid address in remote peer list");
            }
            addr
        })
        .collect()
}

/// Download and parse the peer list published at `url`.
pub async fn fetch_remote_peer_list(url: &str) -> Result<Vec<String>, PexError> {
    let client = reqwest::Client::builder().timeout(FETCH_TIMEOUT).build()?;
    let body = client
        .get(url)
        .send()
        .await?
        .error_for_status()?
        .text()
        .await?;
    Ok(parse_remote_peer_list(&body))
}
