//! Packet-stack boundary
//!
//! The user-space TCP/IP stack that turns raw IP frames from the virtual
//! device into TCP flows and UDP datagrams is a collaborator, not part of the
//! bridge. The bridge only sees it through the traits in this module:
//!
//! ```text
//! VirtualDevice ──► StackLauncher::launch ──► NetworkStack
//!                                               ├── StackTcpListener  (accept)
//!                                               └── StackUdpEndpoint  (recv_from / send_to)
//! ```
//!
//! Two implementations ship with the crate:
//!
//! - [`memory::MemoryStack`]: channel-backed, for hosts that already own the
//!   flows and for tests
//! - `ipstack::IpStackLauncher` (feature `ipstack`): a real stack over the
//!   `ipstack` crate

use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite};

use crate::error::StackError;

#[cfg(unix)]
pub mod device;
#[cfg(feature = "ipstack")]
pub mod ipstack;
pub mod memory;

#[cfg(unix)]
pub use device::VirtualDevice;
pub use memory::{MemoryLauncher, MemoryStack, MemoryStackHandle, UdpReply};

/// Byte stream of one accepted TCP flow
pub trait FlowIo: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T> FlowIo for T where T: AsyncRead + AsyncWrite + Send + Unpin {}

/// Owned TCP flow stream
pub type FlowStream = Box<dyn FlowIo>;

/// One accepted TCP flow
pub struct TcpFlow {
    /// Bidirectional stream to the application behind the virtual device
    pub stream: FlowStream,
    /// Virtual-side address (the application)
    pub local: SocketAddr,
    /// Destination the application tried to reach
    pub remote: SocketAddr,
}

impl TcpFlow {
    /// Wrap any async stream as a flow
    pub fn new(stream: impl FlowIo + 'static, local: SocketAddr, remote: SocketAddr) -> Self {
        Self {
            stream: Box::new(stream),
            local,
            remote,
        }
    }
}

impl std::fmt::Debug for TcpFlow {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TcpFlow")
            .field("local", &self.local)
            .field("remote", &self.remote)
            .finish_non_exhaustive()
    }
}

/// Result of one UDP receive: `(len, local, remote)`
pub type UdpRecv = (usize, SocketAddr, SocketAddr);

/// The stack's virtual TCP listener
#[async_trait]
pub trait StackTcpListener: Send + Sync {
    /// Wait for the next flow. Returns [`StackError::Closed`] once the
    /// listener is closed.
    async fn accept(&self) -> Result<TcpFlow, StackError>;

    /// Close the listener. Idempotent.
    fn close(&self);
}

/// The stack's virtual UDP endpoint
///
/// `recv_from` must be safe for concurrent callers: the bridge runs several
/// workers against one endpoint.
#[async_trait]
pub trait StackUdpEndpoint: Send + Sync {
    /// Receive one datagram into `buf`, returning its length and its local and
    /// remote addresses. Returns [`StackError::Closed`] once closed.
    ///
    /// A datagram longer than `buf` is consumed and discarded, and
    /// [`StackError::Oversized`] is returned; the endpoint stays usable.
    async fn recv_from(&self, buf: &mut [u8]) -> Result<UdpRecv, StackError>;

    /// Send `payload` back into the virtual device, appearing to come from
    /// `from` and addressed to `to`.
    async fn send_to(&self, payload: &[u8], from: SocketAddr, to: SocketAddr) -> Result<usize, StackError>;

    /// Close the endpoint. Idempotent.
    fn close(&self);
}

/// A running packet stack
pub trait NetworkStack: Send + Sync {
    /// The TCP listener
    fn tcp(&self) -> Arc<dyn StackTcpListener>;

    /// The UDP endpoint
    fn udp(&self) -> Arc<dyn StackUdpEndpoint>;

    /// Close both the listener and the endpoint. Idempotent.
    fn close(&self) {
        self.tcp().close();
        self.udp().close();
    }
}

/// Virtual addressing the stack is bound to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StackAddressing {
    /// Address the stack answers as
    pub gateway: Ipv4Addr,
    /// Address flows are redirected through
    pub portal: Ipv4Addr,
}

/// Starts a [`NetworkStack`] on top of a device
///
/// The device is moved into the launcher. If launching fails the launcher
/// drops it, which closes the descriptor.
pub trait StackLauncher<D>: Send + Sync {
    /// Start the stack
    fn launch(&self, device: D, addressing: StackAddressing) -> Result<Arc<dyn NetworkStack>, StackError>;
}
