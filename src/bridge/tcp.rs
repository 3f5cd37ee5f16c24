//! TCP accept loop

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use super::filter::{FlowAction, FlowFilter};
use super::stats::BridgeStats;
use crate::dispatch::{Dispatcher, TcpInbound};
use crate::dns::{self, DnsResolver};
use crate::io::UdpBufferPool;
use crate::metadata::Metadata;
use crate::stack::{StackTcpListener, TcpFlow};

/// Pause after a failed accept before trying again
pub(crate) const ACCEPT_ERROR_PAUSE: Duration = Duration::from_millis(10);

/// Accepts flows from the stack and routes each one
pub(crate) struct TcpAcceptor {
    pub(crate) listener: Arc<dyn StackTcpListener>,
    pub(crate) filter: FlowFilter,
    pub(crate) dispatcher: Dispatcher,
    pub(crate) resolver: Arc<dyn DnsResolver>,
    pub(crate) relay_timeout: Duration,
    pub(crate) pool: Arc<UdpBufferPool>,
    pub(crate) stats: Arc<BridgeStats>,
    pub(crate) cancel: CancellationToken,
}

impl TcpAcceptor {
    /// Run until cancelled or the listener closes, then close the listener.
    pub(crate) async fn run(self) {
        debug!("TCP acceptor started");

        loop {
            let accepted = tokio::select! {
                biased;
                () = self.cancel.cancelled() => break,
                accepted = self.listener.accept() => accepted,
            };

            let flow = match accepted {
                Ok(flow) => flow,
                Err(e) if e.is_closed() => {
                    debug!(error = %e, "TCP listener closed");
                    break;
                }
                Err(e) => {
                    BridgeStats::incr(&self.stats.tcp_accept_errors);
                    debug!(error = %e, "Accept connection failed");
                    tokio::select! {
                        () = self.cancel.cancelled() => break,
                        () = tokio::time::sleep(ACCEPT_ERROR_PAUSE) => continue,
                    }
                }
            };

            BridgeStats::incr(&self.stats.tcp_accepted);

            match self.filter.classify(flow.remote) {
                FlowAction::Drop => {
                    BridgeStats::incr(&self.stats.loopback_dropped);
                    trace!(remote = %flow.remote, "Dropping loopback TCP flow");
                    drop(flow);
                }
                FlowAction::HijackDns => {
                    BridgeStats::incr(&self.stats.dns_hijacked_tcp);
                    self.spawn_relay(flow);
                }
                FlowAction::Dispatch => {
                    let metadata = Metadata::tcp(flow.local, flow.remote);
                    trace!(%metadata, "Dispatching TCP flow");

                    let inbound = TcpInbound {
                        conn: flow,
                        metadata,
                    };
                    let result = tokio::select! {
                        biased;
                        () = self.cancel.cancelled() => break,
                        result = self.dispatcher.dispatch_tcp(inbound) => result,
                    };

                    match result {
                        Ok(()) => BridgeStats::incr(&self.stats.tcp_dispatched),
                        Err(e) => {
                            BridgeStats::incr(&self.stats.dispatch_failures);
                            debug!(error = %e, "TCP flow dropped");
                        }
                    }
                }
            }
        }

        self.listener.close();
        debug!("TCP acceptor stopped");
    }

    fn spawn_relay(&self, mut flow: TcpFlow) {
        let resolver = Arc::clone(&self.resolver);
        let stats = Arc::clone(&self.stats);
        let cancel = self.cancel.clone();
        let relay_timeout = self.relay_timeout;
        let mut buf = self.pool.get();

        tokio::spawn(async move {
            let local = flow.local;
            let result = tokio::select! {
                () = cancel.cancelled() => return,
                result = dns::relay_tcp(&mut flow.stream, resolver.as_ref(), relay_timeout, &mut buf) => result,
            };

            match result {
                Ok(exchanges) => trace!(%local, exchanges, "TCP DNS relay finished"),
                Err(e) => {
                    BridgeStats::incr(&stats.dns_relay_errors);
                    debug!(%local, error = %e, "TCP DNS relay ended");
                }
            }
        });
    }
}
