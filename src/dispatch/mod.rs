//! Inbound hand-off to the dispatch substrate
//!
//! The bridge pushes classified traffic into two bounded queues. The
//! substrate drains them:
//!
//! - [`TcpInbound`]: an accepted flow plus its [`Metadata`]. The receiver owns
//!   the connection and must close it.
//! - [`UdpInbound`]: one [`Datagram`] tagged with its SOCKS5 destination. The
//!   receiver owns the datagram and releases it, explicitly or by drop.
//!
//! # Example
//!
//! ```
//! use tun_bridge::dispatch;
//!
//! # async fn example() {
//! let (dispatcher, mut queues) = dispatch::channel(dispatch::DEFAULT_QUEUE_CAPACITY);
//! # drop(dispatcher);
//! while let Some(inbound) = queues.tcp.recv().await {
//!     println!("{}", inbound.metadata);
//! }
//! # }
//! ```

use thiserror::Error;
use tokio::sync::mpsc;

use crate::metadata::{InboundType, Metadata, Network};
use crate::stack::TcpFlow;

mod datagram;
mod socks_addr;

pub use datagram::Datagram;
pub use socks_addr::{SocksAddr, SocksAddrError};

/// SOCKS5 ATYP: IPv4 address
pub const ATYP_IPV4: u8 = 0x01;

/// SOCKS5 ATYP: domain name
pub const ATYP_DOMAIN: u8 = 0x03;

/// SOCKS5 ATYP: IPv6 address
pub const ATYP_IPV6: u8 = 0x04;

/// Default capacity of each inbound queue
pub const DEFAULT_QUEUE_CAPACITY: usize = 200;

/// An accepted TCP flow ready for routing
#[derive(Debug)]
pub struct TcpInbound {
    /// The connection; closed when dropped
    pub conn: TcpFlow,
    /// Routing descriptor
    pub metadata: Metadata,
}

/// A UDP datagram ready for routing
#[derive(Debug)]
pub struct UdpInbound {
    /// Destination the sender addressed
    pub target: SocksAddr,
    /// Payload capture with write-back and release
    pub packet: Datagram,
    /// Inbound type tag
    pub inbound_type: InboundType,
}

/// Hand-off failures
#[derive(Debug, Error, PartialEq, Eq)]
pub enum DispatchError {
    /// The substrate dropped its end of the queue
    #[error("{0} inbound queue closed")]
    QueueClosed(Network),
}

/// Sending half of the inbound queues
#[derive(Debug, Clone)]
pub struct Dispatcher {
    tcp_tx: mpsc::Sender<TcpInbound>,
    udp_tx: mpsc::Sender<UdpInbound>,
}

impl Dispatcher {
    /// Queue a TCP flow, waiting while the queue is full.
    ///
    /// When the receiver is gone the flow is dropped, closing it.
    pub async fn dispatch_tcp(&self, inbound: TcpInbound) -> Result<(), DispatchError> {
        self.tcp_tx
            .send(inbound)
            .await
            .map_err(|_| DispatchError::QueueClosed(Network::Tcp))
    }

    /// Queue a UDP datagram, waiting while the queue is full.
    ///
    /// When the receiver is gone the datagram is dropped, releasing its buffer.
    pub async fn dispatch_udp(&self, inbound: UdpInbound) -> Result<(), DispatchError> {
        self.udp_tx
            .send(inbound)
            .await
            .map_err(|_| DispatchError::QueueClosed(Network::Udp))
    }

    /// Whether the substrate has dropped both receivers
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.tcp_tx.is_closed() && self.udp_tx.is_closed()
    }
}

/// Receiving half of the inbound queues
#[derive(Debug)]
pub struct InboundQueues {
    /// TCP-inbound queue
    pub tcp: mpsc::Receiver<TcpInbound>,
    /// UDP-inbound queue
    pub udp: mpsc::Receiver<UdpInbound>,
}

/// Create a pair of bounded inbound queues, each holding `capacity` entries
#[must_use]
pub fn channel(capacity: usize) -> (Dispatcher, InboundQueues) {
    let (tcp_tx, tcp) = mpsc::channel(capacity.max(1));
    let (udp_tx, udp) = mpsc::channel(capacity.max(1));
    (Dispatcher { tcp_tx, udp_tx }, InboundQueues { tcp, udp })
}
