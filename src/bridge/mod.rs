//! Bridge lifecycle
//!
//! [`Bridge::start`] turns a virtual device descriptor into a running bridge:
//!
//! ```text
//!   OwnedFd ──► VirtualDevice ──► StackLauncher ──► NetworkStack
//!                                                     │
//!                         ┌───────────────────────────┴──────────────┐
//!                         ▼                                          ▼
//!                   TcpAcceptor (1)                          UdpWorker (N)
//!                         │                                          │
//!          loopback ── drop                            loopback ── release
//!          dns:53   ── relay_tcp (task)                dns:53   ── relay_udp (task)
//!          other    ── TcpInbound ──► queue            other    ── UdpInbound ──► queue
//! ```
//!
//! The returned [`BridgeHandle`] is the only way to stop it. Closing cancels
//! every loop and closes the stack once; repeated closes are no-ops.

use std::net::Ipv4Addr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::BridgeConfig;
use crate::dispatch::Dispatcher;
use crate::dns::{DnsHijackTarget, DnsResolver, DEFAULT_RELAY_TIMEOUT};
use crate::error::{BridgeError, ConfigError};
use crate::io::{BufferPoolConfig, UdpBufferPool};
use crate::stack::NetworkStack;

pub mod filter;
pub mod stats;
mod tcp;
mod udp;

pub use filter::{FlowAction, FlowFilter, LOOPBACK_NET};
pub use stats::{BridgeStats, BridgeStatsSnapshot};

/// Default number of UDP workers
pub const DEFAULT_UDP_WORKERS: usize = 2;

/// Runtime options for a bridge
#[derive(Debug, Clone)]
pub struct BridgeOptions {
    /// Destination whose DNS traffic is relayed in-band
    pub dns: DnsHijackTarget,
    /// Number of UDP workers reading the endpoint (at least 1)
    pub udp_workers: usize,
    /// Idle timeout of a hijacked TCP DNS connection
    pub relay_timeout: Duration,
    /// Buffer pool sizing
    pub buffer_pool: BufferPoolConfig,
}

impl Default for BridgeOptions {
    fn default() -> Self {
        Self {
            dns: DnsHijackTarget::all(),
            udp_workers: DEFAULT_UDP_WORKERS,
            relay_timeout: DEFAULT_RELAY_TIMEOUT,
            buffer_pool: BufferPoolConfig::default(),
        }
    }
}

impl BridgeOptions {
    /// Options hijacking DNS sent to `dns`
    #[must_use]
    pub fn new(dns: DnsHijackTarget) -> Self {
        Self {
            dns,
            ..Self::default()
        }
    }

    #[must_use]
    pub const fn with_udp_workers(mut self, workers: usize) -> Self {
        self.udp_workers = workers;
        self
    }

    #[must_use]
    pub const fn with_relay_timeout(mut self, timeout: Duration) -> Self {
        self.relay_timeout = timeout;
        self
    }

    #[must_use]
    pub const fn with_buffer_pool(mut self, pool: BufferPoolConfig) -> Self {
        self.buffer_pool = pool;
        self
    }

    /// Options derived from a validated configuration
    pub fn from_config(config: &BridgeConfig) -> Result<Self, ConfigError> {
        Ok(Self {
            dns: config.tun.dns.parse()?,
            udp_workers: config.udp_workers,
            relay_timeout: config.dns_relay_timeout(),
            buffer_pool: BufferPoolConfig::new(config.buffer_pool.capacity, config.buffer_pool.buffer_size)
                .with_prewarm(config.buffer_pool.prewarm),
        })
    }
}

/// Entry points for starting a bridge
pub struct Bridge;

impl Bridge {
    /// Start a bridge on the virtual device `device_fd`.
    ///
    /// `gateway`, `portal` and `dns` are IPv4 literals. The device is handed
    /// to `launcher`, which builds the packet stack bound to gateway and
    /// portal. On success the TCP acceptor and the UDP workers are running.
    ///
    /// Must be called from within a tokio runtime.
    ///
    /// # Errors
    ///
    /// Fails when an address does not parse, the device cannot be opened or
    /// the stack does not start. The descriptor is closed before the error
    /// is returned.
    #[cfg(unix)]
    pub fn start(
        device_fd: std::os::fd::OwnedFd,
        gateway: &str,
        portal: &str,
        dns: &str,
        launcher: &dyn crate::stack::StackLauncher<crate::stack::VirtualDevice>,
        dispatcher: Dispatcher,
        resolver: Arc<dyn DnsResolver>,
    ) -> Result<BridgeHandle, BridgeError> {
        Self::start_with_options(
            device_fd,
            gateway,
            portal,
            dns,
            BridgeOptions::default(),
            launcher,
            dispatcher,
            resolver,
        )
    }

    /// [`Bridge::start`] with explicit options. `dns` replaces `options.dns`.
    ///
    /// # Errors
    ///
    /// Same as [`Bridge::start`].
    #[cfg(unix)]
    #[allow(clippy::too_many_arguments)]
    pub fn start_with_options(
        device_fd: std::os::fd::OwnedFd,
        gateway: &str,
        portal: &str,
        dns: &str,
        mut options: BridgeOptions,
        launcher: &dyn crate::stack::StackLauncher<crate::stack::VirtualDevice>,
        dispatcher: Dispatcher,
        resolver: Arc<dyn DnsResolver>,
    ) -> Result<BridgeHandle, BridgeError> {
        use std::os::fd::AsRawFd;

        use crate::stack::{StackAddressing, VirtualDevice};

        debug!(fd = device_fd.as_raw_fd(), gateway, portal, dns, "Starting bridge");

        let parsed = parse_ipv4("gateway", gateway)
            .and_then(|gateway| Ok((gateway, parse_ipv4("portal", portal)?)))
            .and_then(|(gateway, portal)| Ok((gateway, portal, dns.parse::<DnsHijackTarget>()?)));
        let (gateway, portal, dns) = match parsed {
            Ok(parsed) => parsed,
            Err(e) => {
                drop(device_fd);
                return Err(e.into());
            }
        };
        options.dns = dns;

        let device = VirtualDevice::open(device_fd).map_err(BridgeError::Device)?;
        let stack = launcher.launch(device, StackAddressing { gateway, portal })?;

        Ok(Self::with_stack(stack, options, dispatcher, resolver))
    }

    /// Run the bridge loops on an already running stack.
    ///
    /// Must be called from within a tokio runtime.
    #[must_use]
    pub fn with_stack(
        stack: Arc<dyn NetworkStack>,
        options: BridgeOptions,
        dispatcher: Dispatcher,
        resolver: Arc<dyn DnsResolver>,
    ) -> BridgeHandle {
        let cancel = CancellationToken::new();
        let stats = Arc::new(BridgeStats::new());
        let pool = options.buffer_pool.build();
        let filter = FlowFilter::new(options.dns);
        let udp_workers = options.udp_workers.max(1);

        let mut workers = Vec::with_capacity(1 + udp_workers);

        workers.push(tokio::spawn(
            tcp::TcpAcceptor {
                listener: stack.tcp(),
                filter,
                dispatcher: dispatcher.clone(),
                resolver: Arc::clone(&resolver),
                relay_timeout: options.relay_timeout,
                pool: Arc::clone(&pool),
                stats: Arc::clone(&stats),
                cancel: cancel.clone(),
            }
            .run(),
        ));

        let endpoint = stack.udp();
        for id in 0..udp_workers {
            workers.push(tokio::spawn(
                udp::UdpWorker {
                    id,
                    endpoint: Arc::clone(&endpoint),
                    filter,
                    dispatcher: dispatcher.clone(),
                    resolver: Arc::clone(&resolver),
                    pool: Arc::clone(&pool),
                    stats: Arc::clone(&stats),
                    cancel: cancel.clone(),
                }
                .run(),
            ));
        }

        info!(
            dns = %options.dns,
            udp_workers,
            buffer_size = pool.buffer_size(),
            "Bridge started"
        );

        BridgeHandle {
            stack,
            cancel,
            closed: AtomicBool::new(false),
            workers: Mutex::new(workers),
            stats,
            pool,
            dns: options.dns,
        }
    }
}

fn parse_ipv4(field: &str, value: &str) -> Result<Ipv4Addr, ConfigError> {
    value
        .trim()
        .parse()
        .map_err(|e| ConfigError::validation(format!("invalid {field} address '{value}': {e}")))
}

/// Handle to a running bridge
///
/// Dropping the handle closes the bridge.
pub struct BridgeHandle {
    stack: Arc<dyn NetworkStack>,
    cancel: CancellationToken,
    closed: AtomicBool,
    workers: Mutex<Vec<JoinHandle<()>>>,
    stats: Arc<BridgeStats>,
    pool: Arc<UdpBufferPool>,
    dns: DnsHijackTarget,
}

impl BridgeHandle {
    /// Stop all loops and close the stack. Safe to call any number of times.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }

        info!("Closing bridge");
        self.cancel.cancel();
        self.stack.close();
    }

    /// Close and wait for every loop to finish
    pub async fn shutdown(&self) {
        self.close();

        let workers = std::mem::take(&mut *self.workers.lock());
        for (i, worker) in workers.into_iter().enumerate() {
            if let Err(e) = worker.await {
                warn!(worker = i, error = %e, "Bridge task join error");
            }
        }

        let stats = self.stats.snapshot();
        info!(
            tcp_accepted = stats.tcp_accepted,
            udp_received = stats.udp_received,
            dns_hijacked = stats.dns_hijacked(),
            "Bridge shut down"
        );
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Counters
    #[must_use]
    pub fn stats(&self) -> &Arc<BridgeStats> {
        &self.stats
    }

    /// The pool backing UDP receives and TCP DNS relays
    #[must_use]
    pub fn buffer_pool(&self) -> &Arc<UdpBufferPool> {
        &self.pool
    }

    /// The DNS hijack target in effect
    #[must_use]
    pub const fn dns_target(&self) -> DnsHijackTarget {
        self.dns
    }
}

impl Drop for BridgeHandle {
    fn drop(&mut self) {
        self.close();
    }
}

impl std::fmt::Debug for BridgeHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BridgeHandle")
            .field("dns", &self.dns)
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}
