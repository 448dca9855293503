//! `ip:port` validation for peer addresses.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

/// Lowest port a peer may listen on; well-known ports are rejected.
pub const MIN_PEER_PORT: u16 = 1024;

/// Check that `addr` is a dialable `ip:port` peer address.
///
/// The host must be an IP literal (IPv6 in brackets) that is global unicast,
/// or loopback when `allow_loopback` is set. The port must be a plain decimal
/// number in `1024..=65535`. Leading and trailing whitespace is ignored.
pub fn validate_address(addr: &str, allow_loopback: bool) -> bool {
    canonical_address(addr, allow_loopback).is_some()
}

/// Validate `addr` like [`validate_address`] and return the form peers are
/// keyed by: whitespace stripped, IPv6 compressed, port without leading zeros.
pub fn canonical_address(addr: &str, allow_loopback: bool) -> Option<String> {
    let addr = addr.trim();
    let (host, port) = addr.rsplit_once(':')?;

    let ip = match host.strip_prefix('[').and_then(|h| h.strip_suffix(']')) {
        Some(v6) => IpAddr::V6(v6.parse::<Ipv6Addr>().ok()?),
        None => IpAddr::V4(host.parse::<Ipv4Addr>().ok()?),
    };

    if !is_global_unicast(&ip) && !(allow_loopback && ip.is_loopback()) {
        return None;
    }

    let port = parse_port(port).filter(|p| *p >= MIN_PEER_PORT)?;
    Some(SocketAddr::new(ip, port).to_string())
}

fn parse_port(port: &str) -> Option<u16> {
    if port.is_empty() || !port.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    port.parse().ok()
}

/// Unicast addresses outside the unspecified, loopback, link-local,
/// multicast and broadcast ranges. Private (RFC 1918) ranges count as global.
fn is_global_unicast(ip: &IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => {
            !(v4.is_unspecified()
                || v4.is_loopback()
                || v4.is_multicast()
                || v4.is_link_local()
                || v4.is_broadcast())
        }
        IpAddr::V6(v6) => {
            let unicast_link_local = (v6.segments()[0] & 0xffc0) == 0xfe80;
            !(v6.is_unspecified() || v6.is_loopback() || v6.is_multicast() || unicast_link_local)
        }
    }
}
