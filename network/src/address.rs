//! Peer endpoint addresses.
//!
//! A `PeerAddress` is the *unresolved* form of a peer endpoint: hostname or
//! IP literal plus port. Equality compares the unresolved form, so two
//! hostnames resolving to the same IP are still distinct peers in the store.
//! Resolution to a socket address is an explicit, fallible operation.

use std::fmt;
use std::net::{IpAddr, Ipv6Addr, SocketAddr};

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum AddressParseError {
    #[error("empty host")]
    EmptyHost,

    #[error("invalid port {0:?}")]
    InvalidPort(String),

    #[error("unbalanced brackets in {0:?}")]
    UnbalancedBrackets(String),

    #[error("not a valid host {0:?}")]
    InvalidHost(String),
}

/// Host plus port identifying a peer, kept in unresolved form.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PeerAddress {
    host: String,
    port: u16,
}

impl PeerAddress {
    /// Build from parts already split. The host must be non-empty and free
    /// of bracket characters.
    pub fn new(host: impl Into<String>, port: u16) -> Result<Self, AddressParseError> {
        let host = host.into();
        if host.is_empty() {
            return Err(AddressParseError::EmptyHost);
        }
        if host.contains('[') || host.contains(']') {
            return Err(AddressParseError::InvalidHost(host));
        }
        Ok(PeerAddress { host, port })
    }

    /// Parse `host`, `host:port`, `[ipv6]` or `[ipv6]:port`, applying
    /// `default_port` when none is given.
    pub fn parse(s: &str, default_port: u16) -> Result<Self, AddressParseError> {
        let s = s.trim();
        if s.is_empty() {
            return Err(AddressParseError::EmptyHost);
        }

        if let Some(rest) = s.strip_prefix('[') {
            let Some((inside, after)) = rest.split_once(']') else {
                return Err(AddressParseError::UnbalancedBrackets(s.to_string()));
            };
            if inside.parse::<Ipv6Addr>().is_err() {
                return Err(AddressParseError::InvalidHost(inside.to_string()));
            }
            let port = match after {
                "" => default_port,
                _ => match after.strip_prefix(':') {
                    Some(p) => parse_port(p)?,
                    None => return Err(AddressParseError::InvalidHost(s.to_string())),
                },
            };
            return PeerAddress::new(inside, port);
        }

        // A bare IPv6 literal has multiple colons; anything else with one
        // colon is host:port.
        if s.matches(':').count() > 1 {
            if s.parse::<Ipv6Addr>().is_ok() {
                return PeerAddress::new(s, default_port);
            }
            return Err(AddressParseError::InvalidHost(s.to_string()));
        }

        match s.split_once(':') {
            Some((host, port)) => PeerAddress::new(host, parse_port(port)?),
            None => PeerAddress::new(s, default_port),
        }
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// Resolve to a socket address. DNS may return several entries; the
    /// first is used, matching what an outbound connect would do.
    pub async fn resolve(&self) -> std::io::Result<SocketAddr> {
        let mut addrs = tokio::net::lookup_host((self.host.as_str(), self.port)).await?;
        addrs.next().ok_or_else(|| {
            std::io::Error::new(
                std::io::ErrorKind::NotFound,
                format!("no addresses for {}", self.host),
            )
        })
    }
}

impl fmt::Display for PeerAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.host.contains(':') {
            write!(f, "[{}]:{}", self.host, self.port)
        } else {
            write!(f, "{}:{}", self.host, self.port)
        }
    }
}

fn parse_port(s: &str) -> Result<u16, AddressParseError> {
    match s.parse::<u16>() {
        Ok(0) | Err(_) => Err(AddressParseError::InvalidPort(s.to_string())),
        Ok(port) => Ok(port),
    }
}

/// Whether an IP address is link-local, loopback or otherwise not routable
/// from the wider internet. Such addresses are only advertised to peers that
/// are themselves local.
pub fn is_address_local(addr: &IpAddr) -> bool {
    match addr {
        IpAddr::V4(v4) => v4.is_loopback() || v4.is_private() || v4.is_link_local(),
        IpAddr::V6(v6) => {
            v6.is_loopback()
                // fc00::/7 unique-local
                || (v6.segments()[0] & 0xfe00) == 0xfc00
                // fe80::/10 link-local
                || (v6.segments()[0] & 0xffc0) == 0xfe80
        }
    }
}
