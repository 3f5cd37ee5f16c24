//! Bridge counters

use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

/// Counters updated by the bridge loops
///
/// All counters use relaxed ordering; they are for observation only.
#[derive(Debug, Default)]
pub struct BridgeStats {
    /// TCP flows accepted from the stack
    pub tcp_accepted: AtomicU64,
    /// TCP flows handed to the dispatch queue
    pub tcp_dispatched: AtomicU64,
    /// Accept attempts that failed without closing the listener
    pub tcp_accept_errors: AtomicU64,
    /// UDP datagrams received from the stack
    pub udp_received: AtomicU64,
    /// UDP datagrams handed to the dispatch queue
    pub udp_dispatched: AtomicU64,
    /// UDP payload bytes received
    pub udp_bytes: AtomicU64,
    /// UDP datagrams discarded for not fitting a pool buffer
    pub udp_oversized: AtomicU64,
    /// Flows and datagrams dropped for a loopback destination
    pub loopback_dropped: AtomicU64,
    /// TCP flows diverted to the DNS relay
    pub dns_hijacked_tcp: AtomicU64,
    /// UDP datagrams diverted to the DNS relay
    pub dns_hijacked_udp: AtomicU64,
    /// DNS relay exchanges that ended in an error
    pub dns_relay_errors: AtomicU64,
    /// Hand-offs that failed because the substrate was gone
    pub dispatch_failures: AtomicU64,
}

impl BridgeStats {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn incr(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn add(counter: &AtomicU64, n: usize) {
        counter.fetch_add(n as u64, Ordering::Relaxed);
    }

    /// Point-in-time copy of the counters
    #[must_use]
    pub fn snapshot(&self) -> BridgeStatsSnapshot {
        BridgeStatsSnapshot {
            tcp_accepted: self.tcp_accepted.load(Ordering::Relaxed),
            tcp_dispatched: self.tcp_dispatched.load(Ordering::Relaxed),
            tcp_accept_errors: self.tcp_accept_errors.load(Ordering::Relaxed),
            udp_received: self.udp_received.load(Ordering::Relaxed),
            udp_dispatched: self.udp_dispatched.load(Ordering::Relaxed),
            udp_bytes: self.udp_bytes.load(Ordering::Relaxed),
            udp_oversized: self.udp_oversized.load(Ordering::Relaxed),
            loopback_dropped: self.loopback_dropped.load(Ordering::Relaxed),
            dns_hijacked_tcp: self.dns_hijacked_tcp.load(Ordering::Relaxed),
            dns_hijacked_udp: self.dns_hijacked_udp.load(Ordering::Relaxed),
            dns_relay_errors: self.dns_relay_errors.load(Ordering::Relaxed),
            dispatch_failures: self.dispatch_failures.load(Ordering::Relaxed),
        }
    }
}

/// Serializable copy of [`BridgeStats`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct BridgeStatsSnapshot {
    pub tcp_accepted: u64,
    pub tcp_dispatched: u64,
    pub tcp_accept_errors: u64,
    pub udp_received: u64,
    pub udp_dispatched: u64,
    pub udp_bytes: u64,
    pub udp_oversized: u64,
    pub loopback_dropped: u64,
    pub dns_hijacked_tcp: u64,
    pub dns_hijacked_udp: u64,
    pub dns_relay_errors: u64,
    pub dispatch_failures: u64,
}

impl BridgeStatsSnapshot {
    /// Total flows and datagrams diverted to the DNS relay
    #[must_use]
    pub const fn dns_hijacked(&self) -> u64 {
        self.dns_hijacked_tcp + self.dns_hijacked_udp
    }
}
