//! Integration tests for tun-bridge
//!
//! Every test drives a real bridge over the in-memory packet stack: flows and
//! datagrams are injected on the device side of a `MemoryStack` and observed
//! on the dispatch queues or in the replies written back to the device.
//!
//! # Test Organization
//!
//! - `tcp_flows`: TCP accept, metadata and loopback filtering
//! - `udp_flows`: datagram dispatch, write-back and buffer accounting
//! - `dns_relay`: in-band DNS hijack over TCP and UDP
//! - `lifecycle`: start, close and shutdown

pub mod dns_relay;
pub mod lifecycle;
pub mod tcp_flows;
pub mod udp_flows;

use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use tun_bridge::dispatch::{self, InboundQueues};
use tun_bridge::error::DnsRelayResult;
use tun_bridge::io::BufferPoolConfig;
use tun_bridge::stack::{MemoryStack, MemoryStackHandle};
use tun_bridge::{Bridge, BridgeHandle, BridgeOptions, DnsHijackTarget, DnsResolver};

/// Virtual-side client address used throughout
pub const CLIENT: &str = "172.19.0.1:40000";

/// Hijacked resolver address
pub const DNS_SERVER: &str = "172.19.0.2";

/// Upper bound for anything a test waits on
pub const WAIT: Duration = Duration::from_secs(2);

pub fn addr(s: &str) -> SocketAddr {
    s.parse().expect("valid socket address")
}

/// Resolver answering `b"ans:" + query` and counting exchanges
#[derive(Default)]
pub struct CountingResolver {
    exchanges: AtomicUsize,
}

impl CountingResolver {
    pub fn count(&self) -> usize {
        self.exchanges.load(Ordering::SeqCst)
    }

    pub fn answer(query: &[u8]) -> Vec<u8> {
        let mut response = b"ans:".to_vec();
        response.extend_from_slice(query);
        response
    }
}

#[async_trait]
impl DnsResolver for CountingResolver {
    async fn exchange(&self, query: &[u8]) -> DnsRelayResult<Vec<u8>> {
        self.exchanges.fetch_add(1, Ordering::SeqCst);
        Ok(Self::answer(query))
    }
}

/// Running bridge plus both ends it talks to
pub struct Harness {
    pub bridge: BridgeHandle,
    pub device: MemoryStackHandle,
    pub queues: InboundQueues,
    pub resolver: Arc<CountingResolver>,
}

impl Harness {
    /// Bridge hijacking DNS to [`DNS_SERVER`]
    pub fn start() -> Self {
        Self::with_target(DNS_SERVER.parse().expect("valid target"))
    }

    pub fn with_target(dns: DnsHijackTarget) -> Self {
        Self::with_options(
            BridgeOptions::new(dns)
                .with_relay_timeout(Duration::from_millis(500))
                .with_buffer_pool(BufferPoolConfig::new(16, 2048)),
        )
    }

    pub fn with_options(options: BridgeOptions) -> Self {
        let (stack, device) = MemoryStack::new(32);
        let (dispatcher, queues) = dispatch::channel(32);
        let resolver = Arc::new(CountingResolver::default());

        let bridge = Bridge::with_stack(stack, options, dispatcher, Arc::clone(&resolver) as Arc<dyn DnsResolver>);

        Self {
            bridge,
            device,
            queues,
            resolver,
        }
    }
}

/// Poll `cond` until it holds or [`WAIT`] elapses
pub async fn wait_until(mut cond: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + WAIT;
    while tokio::time::Instant::now() < deadline {
        if cond() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    cond()
}
