//! Per-flow classification shared by the TCP and UDP loops

use std::net::{IpAddr, SocketAddr};

use ipnet::Ipv4Net;

use crate::dns::DnsHijackTarget;

/// Destinations inside this network are never forwarded
pub const LOOPBACK_NET: Ipv4Net = Ipv4Net::new_assert(std::net::Ipv4Addr::new(127, 0, 0, 0), 8);

/// What to do with a flow, decided by its destination
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlowAction {
    /// Loopback destination: close or discard
    Drop,
    /// DNS to the hijack target: relay in-band
    HijackDns,
    /// Everything else: hand to the dispatch substrate
    Dispatch,
}

/// Classifies flows by destination address
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FlowFilter {
    loopback: Ipv4Net,
    dns: DnsHijackTarget,
}

impl FlowFilter {
    #[must_use]
    pub const fn new(dns: DnsHijackTarget) -> Self {
        Self {
            loopback: LOOPBACK_NET,
            dns,
        }
    }

    /// The DNS hijack target
    #[must_use]
    pub const fn dns_target(&self) -> DnsHijackTarget {
        self.dns
    }

    /// Whether `ip` falls in the loopback network. IPv4-mapped IPv6
    /// addresses are checked by their IPv4 form.
    #[must_use]
    pub fn is_loopback(&self, ip: IpAddr) -> bool {
        match ip {
            IpAddr::V4(v4) => self.loopback.contains(&v4),
            IpAddr::V6(v6) => v6
                .to_ipv4_mapped()
                .is_some_and(|v4| self.loopback.contains(&v4)),
        }
    }

    /// Decide the fate of a flow addressed to `remote`. Loopback wins over
    /// DNS hijacking.
    #[must_use]
    pub fn classify(&self, remote: SocketAddr) -> FlowAction {
        if self.is_loopback(remote.ip()) {
            FlowAction::Drop
        } else if self.dns.matches(remote) {
            FlowAction::HijackDns
        } else {
            FlowAction::Dispatch
        }
    }
}
