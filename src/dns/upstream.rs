//! Plain UDP forwarding to upstream nameservers

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Duration;

use async_trait::async_trait;
use tokio::net::UdpSocket;
use tokio::time::{timeout, Instant};
use tracing::{debug, trace};

use super::{DnsResolver, DNS_PORT};
use crate::error::{DnsRelayError, DnsRelayResult};

/// Nameservers used when none are configured
pub const DEFAULT_NAMESERVERS: [Ipv4Addr; 4] = [
    Ipv4Addr::new(223, 5, 5, 5),
    Ipv4Addr::new(119, 29, 29, 29),
    Ipv4Addr::new(8, 8, 8, 8),
    Ipv4Addr::new(1, 1, 1, 1),
];

/// Default per-server timeout
pub const DEFAULT_UPSTREAM_TIMEOUT: Duration = Duration::from_secs(2);

/// Largest response accepted from an upstream
const MAX_RESPONSE_SIZE: usize = 64 * 1024;

/// Forwards raw queries to a list of nameservers, in order
///
/// The first server to answer wins. A response whose transaction ID does not
/// match the query is ignored and the wait continues.
#[derive(Debug, Clone)]
pub struct UpstreamResolver {
    servers: Vec<SocketAddr>,
    timeout: Duration,
}

impl UpstreamResolver {
    /// Resolver over `servers` with a per-server `timeout`
    #[must_use]
    pub fn new(servers: Vec<SocketAddr>, timeout: Duration) -> Self {
        Self { servers, timeout }
    }

    /// Resolver over plain addresses on port 53
    #[must_use]
    pub fn from_ips(ips: impl IntoIterator<Item = IpAddr>, timeout: Duration) -> Self {
        Self::new(
            ips.into_iter().map(|ip| SocketAddr::new(ip, DNS_PORT)).collect(),
            timeout,
        )
    }

    /// Configured servers
    #[must_use]
    pub fn servers(&self) -> &[SocketAddr] {
        &self.servers
    }

    async fn query_one(&self, server: SocketAddr, query: &[u8]) -> DnsRelayResult<Vec<u8>> {
        let bind: SocketAddr = if server.is_ipv4() {
            (Ipv4Addr::UNSPECIFIED, 0).into()
        } else {
            (std::net::Ipv6Addr::UNSPECIFIED, 0).into()
        };
        let socket = UdpSocket::bind(bind).await?;
        socket.connect(server).await?;
        socket.send(query).await?;

        let deadline = Instant::now() + self.timeout;
        let mut buf = vec![0u8; MAX_RESPONSE_SIZE];
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            let n = timeout(remaining, socket.recv(&mut buf))
                .await
                .map_err(|_| DnsRelayError::Timeout(self.timeout))??;

            if transaction_id_matches(query, &buf[..n]) {
                buf.truncate(n);
                return Ok(buf);
            }
            trace!(%server, "Ignoring DNS response with mismatched ID");
        }
    }
}

impl Default for UpstreamResolver {
    fn default() -> Self {
        Self::from_ips(
            DEFAULT_NAMESERVERS.iter().copied().map(IpAddr::V4),
            DEFAULT_UPSTREAM_TIMEOUT,
        )
    }
}

#[async_trait]
impl DnsResolver for UpstreamResolver {
    async fn exchange(&self, query: &[u8]) -> DnsRelayResult<Vec<u8>> {
        let mut last_err = None;

        for &server in &self.servers {
            match self.query_one(server, query).await {
                Ok(response) => {
                    trace!(%server, len = response.len(), "Upstream answered");
                    return Ok(response);
                }
                Err(e) => {
                    debug!(%server, error = %e, "Upstream query failed");
                    last_err = Some(e);
                }
            }
        }

        Err(last_err.unwrap_or(DnsRelayError::NoUpstream))
    }
}

/// Queries shorter than a header carry no ID; accept whatever comes back.
fn transaction_id_matches(query: &[u8], response: &[u8]) -> bool {
    match (query.get(..2), response.get(..2)) {
        (Some(q), Some(r)) => q == r,
        (None, _) => true,
        (Some(_), None) => false,
    }
}
