//! In-band DNS interception
//!
//! Flows addressed to the configured resolver on port 53 never reach the
//! dispatch queues. They are relayed here instead:
//!
//! - TCP: [`relay_tcp`] reads length-prefixed queries in a loop and writes
//!   each answer back raw.
//! - UDP: [`relay_udp`] answers one datagram through the stack endpoint.
//!
//! Messages are opaque bytes. Resolution is delegated to a [`DnsResolver`];
//! [`UpstreamResolver`] forwards to plain nameservers.

use std::fmt;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::str::FromStr;
use std::time::Duration;

use async_trait::async_trait;

use crate::error::{ConfigError, DnsRelayResult};

mod relay;
pub mod upstream;

pub use relay::{relay_tcp, relay_udp};
pub use upstream::{UpstreamResolver, DEFAULT_NAMESERVERS};

/// Well-known DNS port
pub const DNS_PORT: u16 = 53;

/// Default idle timeout for a hijacked TCP DNS connection
pub const DEFAULT_RELAY_TIMEOUT: Duration = Duration::from_secs(5);

/// Resolves raw DNS query bytes into raw response bytes
#[async_trait]
pub trait DnsResolver: Send + Sync {
    /// Exchange one query for one response
    async fn exchange(&self, query: &[u8]) -> DnsRelayResult<Vec<u8>>;
}

/// Destination whose DNS traffic is diverted to the relay
///
/// Matches port 53 on the configured address. The unspecified address
/// `0.0.0.0` matches port 53 on every address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DnsHijackTarget {
    addr: Ipv4Addr,
}

impl DnsHijackTarget {
    /// Hijack DNS sent to `addr`
    #[must_use]
    pub const fn new(addr: Ipv4Addr) -> Self {
        Self { addr }
    }

    /// Hijack every DNS flow regardless of destination address
    #[must_use]
    pub const fn all() -> Self {
        Self::new(Ipv4Addr::UNSPECIFIED)
    }

    /// Configured resolver address
    #[must_use]
    pub const fn addr(&self) -> Ipv4Addr {
        self.addr
    }

    /// Whether traffic to `dst` should be relayed
    #[must_use]
    pub fn matches(&self, dst: SocketAddr) -> bool {
        dst.port() == DNS_PORT
            && (self.addr.is_unspecified() || dst.ip() == IpAddr::V4(self.addr))
    }
}

impl FromStr for DnsHijackTarget {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.trim()
            .parse::<Ipv4Addr>()
            .map(Self::new)
            .map_err(|e| ConfigError::validation(format!("invalid dns address '{s}': {e}")))
    }
}

impl fmt::Display for DnsHijackTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{DNS_PORT}", self.addr)
    }
}
