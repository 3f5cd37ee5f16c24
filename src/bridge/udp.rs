//! UDP read loop

use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use super::filter::{FlowAction, FlowFilter};
use super::stats::BridgeStats;
use crate::dispatch::{Datagram, Dispatcher, SocksAddr, UdpInbound};
use crate::dns::{self, DnsResolver};
use crate::error::StackError;
use crate::io::{PooledBuffer, UdpBufferPool};
use crate::metadata::InboundType;
use crate::stack::StackUdpEndpoint;

/// One of the workers reading the shared UDP endpoint
///
/// Every buffer borrowed from the pool goes back exactly once: dropped on a
/// loopback destination, an oversized datagram or a receive error, released
/// by the relay task for hijacked DNS, or owned by the [`Datagram`] handed to
/// the substrate.
pub(crate) struct UdpWorker {
    pub(crate) id: usize,
    pub(crate) endpoint: Arc<dyn StackUdpEndpoint>,
    pub(crate) filter: FlowFilter,
    pub(crate) dispatcher: Dispatcher,
    pub(crate) resolver: Arc<dyn DnsResolver>,
    pub(crate) pool: Arc<UdpBufferPool>,
    pub(crate) stats: Arc<BridgeStats>,
    pub(crate) cancel: CancellationToken,
}

impl UdpWorker {
    /// Run until cancelled or the endpoint fails, then close the endpoint.
    pub(crate) async fn run(self) {
        let id = self.id;
        debug!(worker = id, "UDP worker started");

        loop {
            let mut buf = self.pool.get();

            let received = tokio::select! {
                biased;
                () = self.cancel.cancelled() => None,
                received = self.endpoint.recv_from(&mut buf) => Some(received),
            };

            let (n, local, remote) = match received {
                Some(Ok(recv)) => recv,
                Some(Err(StackError::Oversized { len, capacity })) => {
                    BridgeStats::incr(&self.stats.udp_oversized);
                    debug!(worker = id, len, capacity, "Discarding oversized datagram");
                    buf.release();
                    continue;
                }
                Some(Err(e)) => {
                    debug!(worker = id, error = %e, "UDP receive ended");
                    buf.release();
                    break;
                }
                None => {
                    buf.release();
                    break;
                }
            };

            buf.truncate(n);
            BridgeStats::incr(&self.stats.udp_received);
            BridgeStats::add(&self.stats.udp_bytes, n);

            match self.filter.classify(remote) {
                FlowAction::Drop => {
                    BridgeStats::incr(&self.stats.loopback_dropped);
                    trace!(worker = id, %remote, "Dropping loopback datagram");
                    buf.release();
                }
                FlowAction::HijackDns => {
                    BridgeStats::incr(&self.stats.dns_hijacked_udp);
                    self.spawn_relay(buf, local, remote);
                }
                FlowAction::Dispatch => {
                    trace!(worker = id, %local, %remote, len = n, "Dispatching datagram");
                    let inbound = UdpInbound {
                        target: SocksAddr::from(remote),
                        packet: Datagram::new(buf, local, remote, Arc::clone(&self.endpoint)),
                        inbound_type: InboundType::Socks5,
                    };

                    let result = tokio::select! {
                        biased;
                        () = self.cancel.cancelled() => break,
                        result = self.dispatcher.dispatch_udp(inbound) => result,
                    };

                    match result {
                        Ok(()) => BridgeStats::incr(&self.stats.udp_dispatched),
                        Err(e) => {
                            BridgeStats::incr(&self.stats.dispatch_failures);
                            debug!(worker = id, error = %e, "Datagram dropped");
                        }
                    }
                }
            }
        }

        self.endpoint.close();
        debug!(worker = id, "UDP worker stopped");
    }

    fn spawn_relay(
        &self,
        buf: PooledBuffer,
        local: std::net::SocketAddr,
        remote: std::net::SocketAddr,
    ) {
        let resolver = Arc::clone(&self.resolver);
        let endpoint = Arc::clone(&self.endpoint);
        let stats = Arc::clone(&self.stats);

        tokio::spawn(async move {
            let result =
                dns::relay_udp(&buf, resolver.as_ref(), endpoint.as_ref(), local, remote).await;
            buf.release();

            if let Err(e) = result {
                BridgeStats::incr(&stats.dns_relay_errors);
                debug!(%local, error = %e, "UDP DNS relay failed");
            }
        });
    }
}
