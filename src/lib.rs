//! tun-bridge: virtual network interface to proxy-pipeline bridge
//!
//! This crate terminates a TUN-style device and turns the raw IP traffic
//! arriving on it into ordinary TCP connections and UDP datagrams, handed to
//! a dispatch substrate through two bounded queues.
//!
//! # Features
//!
//! - **Loopback filtering**: traffic to `127.0.0.0/8` never leaves the bridge
//! - **DNS hijacking**: port-53 traffic to the configured resolver is relayed
//!   in-band over TCP and UDP framing
//! - **Pooled UDP buffers**: every receive borrows a buffer that is returned
//!   exactly once
//! - **Pluggable packet stack**: any [`stack::NetworkStack`]; an `ipstack`
//!   adapter ships behind the `ipstack` feature
//!
//! # Architecture
//!
//! ```text
//! TUN fd → VirtualDevice → NetworkStack ─┬─ TCP acceptor ──► TcpInbound queue
//!                                        └─ UDP workers  ──► UdpInbound queue
//!                                               ↓
//!                                          DNS relay (port 53)
//! ```
//!
//! # Quick Start
//!
//! ```no_run
//! use std::sync::Arc;
//! use tun_bridge::dispatch;
//! use tun_bridge::dns::UpstreamResolver;
//! use tun_bridge::stack::MemoryStack;
//! use tun_bridge::{Bridge, BridgeOptions};
//!
//! # async fn example() {
//! let (stack, _device) = MemoryStack::new(64);
//! let (dispatcher, mut queues) = dispatch::channel(dispatch::DEFAULT_QUEUE_CAPACITY);
//!
//! let bridge = Bridge::with_stack(
//!     stack,
//!     BridgeOptions::new("172.19.0.2".parse().unwrap()),
//!     dispatcher,
//!     Arc::new(UpstreamResolver::default()),
//! );
//!
//! while let Some(inbound) = queues.tcp.recv().await {
//!     println!("{}", inbound.metadata);
//! }
//! # bridge.shutdown().await;
//! # }
//! ```
//!
//! # Modules
//!
//! - [`bridge`]: lifecycle, accept loop, UDP workers, flow filter
//! - [`config`]: configuration types and loading
//! - [`dispatch`]: inbound queues and the datagram capability
//! - [`dns`]: DNS hijack relay and upstream resolver
//! - [`error`]: error types
//! - [`io`]: UDP buffer pool
//! - [`logging`]: subscriber setup
//! - [`metadata`]: connection descriptors
//! - [`stack`]: packet-stack boundary and implementations

#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]

pub mod bridge;
pub mod config;
pub mod dispatch;
pub mod dns;
pub mod error;
pub mod io;
pub mod logging;
pub mod metadata;
pub mod stack;

// Re-export commonly used types at the crate root
pub use bridge::{Bridge, BridgeHandle, BridgeOptions, BridgeStatsSnapshot};
pub use config::{BridgeConfig, LogConfig};
pub use dispatch::{Datagram, Dispatcher, InboundQueues, SocksAddr, TcpInbound, UdpInbound};
pub use dns::{DnsHijackTarget, DnsResolver, UpstreamResolver};
pub use error::{BridgeError, ConfigError, DnsRelayError, StackError};
pub use metadata::{InboundType, Metadata, Network};

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
