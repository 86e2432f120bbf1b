//! # Peers
//!
//! Where to dial and how healthy the live links are. Discovery itself is
//! someone else's job: seeds, the CLI and identify hand addresses to the
//! [`AddressBook`], and the connection layer reports back how each dial went.

pub mod address_book;
pub mod ping;

pub use address_book::{AddrSource, AddressBook, DialOutcome};
pub use ping::PingTracker;

use std::net::SocketAddr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::config::{
    DIAL_BACKOFF_BASE, DIAL_BACKOFF_JITTER, DIAL_BACKOFF_MAX, IDENTIFY_TIMEOUT, MAX_ADDRESSES,
    MAX_PEERS, PING_INTERVAL, PING_TIMEOUT,
};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PeerConfig {
    pub max_peers: usize,
    /// Outbound connections the dialer tries to keep.
    pub target_outbound: usize,
    pub max_addresses: usize,
    pub backoff_base: f64,
    pub backoff_jitter: f64,
    pub backoff_max_ms: u64,
    pub ping_interval_ms: u64,
    pub ping_timeout_ms: u64,
    /// Pings lost in a row before the connection is dropped.
    pub max_missed_pings: u32,
    pub identify_timeout_ms: u64,
}

impl Default for PeerConfig {
    fn default() -> Self {
        Self {
            max_peers: MAX_PEERS,
            target_outbound: 8,
            max_addresses: MAX_ADDRESSES,
            backoff_base: DIAL_BACKOFF_BASE,
            backoff_jitter: DIAL_BACKOFF_JITTER,
            backoff_max_ms: DIAL_BACKOFF_MAX.as_millis() as u64,
            ping_interval_ms: PING_INTERVAL.as_millis() as u64,
            ping_timeout_ms: PING_TIMEOUT.as_millis() as u64,
            max_missed_pings: 3,
            identify_timeout_ms: IDENTIFY_TIMEOUT.as_millis() as u64,
        }
    }
}

impl PeerConfig {
    pub fn backoff_max(&self) -> Duration {
        Duration::from_millis(self.backoff_max_ms)
    }

    pub fn ping_interval(&self) -> Duration {
        Duration::from_millis(self.ping_interval_ms)
    }

    pub fn ping_timeout(&self) -> Duration {
        Duration::from_millis(self.ping_timeout_ms)
    }

    pub fn identify_timeout(&self) -> Duration {
        Duration::from_millis(self.identify_timeout_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PeerError {
    #[error("invalid address {0:?}")]
    InvalidAddress(String),

    #[error("unsupported scheme {0:?}")]
    UnsupportedScheme(String),
}

/// Parse `ip:port`, `[ipv6]:port` or `tcp://ip:port`. Host names must be
/// resolved by the caller first.
pub fn parse_addr(input: &str) -> Result<SocketAddr, PeerError> {
    let trimmed = input.trim();
    let rest = match trimmed.split_once("://") {
        Some(("tcp", rest)) => rest,
        Some((scheme, _)) => return Err(PeerError::UnsupportedScheme(scheme.to_string())),
        None => trimmed,
    };
    rest.parse()
        .map_err(|_| PeerError::InvalidAddress(input.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn address_forms() {
        assert_eq!(parse_addr("127.0.0.1:9000").unwrap().port(), 9000);
        assert_eq!(parse_addr(" tcp://10.0.0.1:30303 ").unwrap().port(), 30303);
        assert!(parse_addr("[::1]:7000").unwrap().is_ipv6());
        assert_eq!(
            parse_addr("quic://1.2.3.4:1"),
            Err(PeerError::UnsupportedScheme("quic".into()))
        );
        assert!(matches!(parse_addr("seed.example.org:1"), Err(PeerError::InvalidAddress(_))));
    }
}
