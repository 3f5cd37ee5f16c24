//! Connection metadata handed to the dispatch substrate
//!
//! A [`Metadata`] is built once per accepted flow from the addressing the
//! packet stack reported, and never changes afterwards.

use std::fmt;
use std::net::SocketAddr;

use serde::Serialize;

/// Transport protocol of a flow
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Network {
    Tcp,
    Udp,
}

impl fmt::Display for Network {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Tcp => write!(f, "tcp"),
            Self::Udp => write!(f, "udp"),
        }
    }
}

/// Inbound type tag carried by every flow
///
/// Traffic from the virtual device is presented to the substrate as if it
/// came from a SOCKS5 inbound, so downstream rules written for SOCKS5 apply.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize)]
pub enum InboundType {
    #[default]
    Socks5,
}

impl fmt::Display for InboundType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Socks5 => write!(f, "Socks5"),
        }
    }
}

/// Address family tag (SOCKS5 ATYP numbering)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum AddrType {
    Ipv4,
    Domain,
    Ipv6,
}

impl AddrType {
    /// SOCKS5 ATYP byte for this family
    #[must_use]
    pub const fn atyp(self) -> u8 {
        match self {
            Self::Ipv4 => crate::dispatch::ATYP_IPV4,
            Self::Domain => crate::dispatch::ATYP_DOMAIN,
            Self::Ipv6 => crate::dispatch::ATYP_IPV6,
        }
    }
}

/// Immutable routing descriptor for one flow
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Metadata {
    /// TCP or UDP
    pub network: Network,
    /// Inbound type tag
    pub inbound_type: InboundType,
    /// Source IP (virtual side)
    pub src_ip: String,
    /// Destination IP
    pub dst_ip: String,
    /// Source port
    pub src_port: String,
    /// Destination port
    pub dst_port: String,
    /// Address family tag; always IPv4 for flows from the virtual device
    pub addr_type: AddrType,
    /// Destination host name, empty because flows carry only addresses
    pub host: String,
    /// Raw source address
    pub raw_src_addr: SocketAddr,
    /// Raw destination address
    pub raw_dst_addr: SocketAddr,
}

impl Metadata {
    /// Build the descriptor for a flow from `local` to `remote`.
    #[must_use]
    pub fn new(
        network: Network,
        inbound_type: InboundType,
        local: SocketAddr,
        remote: SocketAddr,
    ) -> Self {
        Self {
            network,
            inbound_type,
            src_ip: local.ip().to_string(),
            dst_ip: remote.ip().to_string(),
            src_port: local.port().to_string(),
            dst_port: remote.port().to_string(),
            addr_type: AddrType::Ipv4,
            host: String::new(),
            raw_src_addr: local,
            raw_dst_addr: remote,
        }
    }

    /// Shorthand for a TCP flow tagged as SOCKS5
    #[must_use]
    pub fn tcp(local: SocketAddr, remote: SocketAddr) -> Self {
        Self::new(Network::Tcp, InboundType::Socks5, local, remote)
    }

    /// `ip:port` of the source
    #[must_use]
    pub fn source_address(&self) -> String {
        join_host_port(&self.src_ip, &self.src_port)
    }

    /// `ip:port` of the destination, or `host:port` when a host is known
    #[must_use]
    pub fn remote_address(&self) -> String {
        if self.host.is_empty() {
            join_host_port(&self.dst_ip, &self.dst_port)
        } else {
            join_host_port(&self.host, &self.dst_port)
        }
    }
}

impl fmt::Display for Metadata {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[{}] {} --> {}",
            self.network,
            self.source_address(),
            self.remote_address()
        )
    }
}

fn join_host_port(host: &str, port: &str) -> String {
    if host.contains(':') {
        format!("[{host}]:{port}")
    } else {
        format!("{host}:{port}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(s: &str) -> SocketAddr {
        s.parse().unwrap()
    }

    #[test]
    fn test_tcp_metadata_fields() {
        let meta = Metadata::tcp(addr("198.18.0.1:50000"), addr("10.0.0.5:443"));

        assert_eq!(meta.network, Network::Tcp);
        assert_eq!(meta.inbound_type, InboundType::Socks5);
        assert_eq!(meta.src_ip, "198.18.0.1");
        assert_eq!(meta.src_port, "50000");
        assert_eq!(meta.dst_ip, "10.0.0.5");
        assert_eq!(meta.dst_port, "443");
        assert_eq!(meta.addr_type, AddrType::Ipv4);
        assert!(meta.host.is_empty());
        assert_eq!(meta.raw_src_addr, addr("198.18.0.1:50000"));
        assert_eq!(meta.raw_dst_addr, addr("10.0.0.5:443"));
    }

    #[test]
    fn test_remote_address() {
        let meta = Metadata::tcp(addr("198.18.0.1:50000"), addr("10.0.0.5:443"));
        assert_eq!(meta.remote_address(), "10.0.0.5:443");
        assert_eq!(meta.source_address(), "198.18.0.1:50000");
    }

    #[test]
    fn test_remote_address_ipv6_is_bracketed() {
        let meta = Metadata::new(
            Network::Udp,
            InboundType::Socks5,
            addr("[fd00::2]:1000"),
            addr("[2001:db8::1]:53"),
        );
        assert_eq!(meta.remote_address(), "[2001:db8::1]:53");
        assert_eq!(meta.addr_type, AddrType::Ipv4);
    }

    #[test]
    fn test_display() {
        let meta = Metadata::tcp(addr("198.18.0.1:50000"), addr("10.0.0.5:443"));
        assert_eq!(meta.to_string(), "[tcp] 198.18.0.1:50000 --> 10.0.0.5:443");
    }

    #[test]
    fn test_atyp_values() {
        assert_eq!(AddrType::Ipv4.atyp(), 0x01);
        assert_eq!(AddrType::Domain.atyp(), 0x03);
        assert_eq!(AddrType::Ipv6.atyp(), 0x04);
    }

    #[test]
    fn test_metadata_serialization() {
        let meta = Metadata::tcp(addr("198.18.0.1:50000"), addr("10.0.0.5:443"));
        let json = serde_json::to_string(&meta).unwrap();
        assert!(json.contains("\"network\":\"tcp\""));
        assert!(json.contains("\"dst_port\":\"443\""));
    }
}
