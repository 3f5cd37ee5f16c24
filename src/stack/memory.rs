//! Channel-backed packet stack
//!
//! [`MemoryStack`] implements the stack traits on top of tokio channels. The
//! paired [`MemoryStackHandle`] plays the role of the virtual device: it opens
//! TCP flows (getting back the application side of a duplex pipe), injects
//! UDP datagrams and collects the datagrams the bridge writes back.
//!
//! # Example
//!
//! ```
//! use tun_bridge::stack::MemoryStack;
//!
//! # async fn example() -> std::io::Result<()> {
//! let (stack, handle) = MemoryStack::new(16);
//!
//! let app = handle
//!     .connect_tcp("198.18.0.1:40000".parse().unwrap(), "10.0.0.5:443".parse().unwrap())
//!     .await?;
//! handle
//!     .send_udp(b"ping".to_vec(), "198.18.0.1:40001".parse().unwrap(), "10.0.0.5:9".parse().unwrap())
//!     .await?;
//! # drop((stack, app));
//! # Ok(())
//! # }
//! ```

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex as SyncMutex;
use tokio::io::DuplexStream;
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::trace;

use super::{NetworkStack, StackAddressing, StackLauncher, StackTcpListener, StackUdpEndpoint, TcpFlow, UdpRecv};
use crate::error::StackError;

/// Per-direction buffer of the duplex pipe backing each TCP flow
pub const DUPLEX_BUFFER_SIZE: usize = 64 * 1024;

/// A datagram written back into the virtual device by the bridge
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UdpReply {
    /// Payload bytes
    pub payload: Vec<u8>,
    /// Apparent source (the original destination)
    pub from: SocketAddr,
    /// Destination (the original sender)
    pub to: SocketAddr,
}

struct InjectedDatagram {
    payload: Vec<u8>,
    local: SocketAddr,
    remote: SocketAddr,
}

/// Channel-backed TCP listener
pub struct MemoryTcpListener {
    rx: Mutex<mpsc::Receiver<TcpFlow>>,
    closed: CancellationToken,
}

#[async_trait]
impl StackTcpListener for MemoryTcpListener {
    async fn accept(&self) -> Result<TcpFlow, StackError> {
        let mut rx = tokio::select! {
            () = self.closed.cancelled() => return Err(StackError::Closed),
            rx = self.rx.lock() => rx,
        };
        tokio::select! {
            () = self.closed.cancelled() => Err(StackError::Closed),
            flow = rx.recv() => flow.ok_or(StackError::Closed),
        }
    }

    fn close(&self) {
        self.closed.cancel();
    }
}

/// Channel-backed UDP endpoint
pub struct MemoryUdpEndpoint {
    rx: Mutex<mpsc::Receiver<InjectedDatagram>>,
    reply_tx: mpsc::UnboundedSender<UdpReply>,
    closed: CancellationToken,
}

#[async_trait]
impl StackUdpEndpoint for MemoryUdpEndpoint {
    async fn recv_from(&self, buf: &mut [u8]) -> Result<UdpRecv, StackError> {
        let mut rx = tokio::select! {
            () = self.closed.cancelled() => return Err(StackError::Closed),
            rx = self.rx.lock() => rx,
        };
        let datagram = tokio::select! {
            () = self.closed.cancelled() => return Err(StackError::Closed),
            datagram = rx.recv() => datagram.ok_or(StackError::Closed)?,
        };

        let n = datagram.payload.len();
        if n > buf.len() {
            return Err(StackError::oversized(n, buf.len()));
        }
        buf[..n].copy_from_slice(&datagram.payload);
        Ok((n, datagram.local, datagram.remote))
    }

    async fn send_to(&self, payload: &[u8], from: SocketAddr, to: SocketAddr) -> Result<usize, StackError> {
        if self.closed.is_cancelled() {
            return Err(StackError::Closed);
        }
        trace!(len = payload.len(), %from, %to, "Memory stack reply");
        self.reply_tx
            .send(UdpReply {
                payload: payload.to_vec(),
                from,
                to,
            })
            .map_err(|_| StackError::Closed)?;
        Ok(payload.len())
    }

    fn close(&self) {
        self.closed.cancel();
    }
}

/// Channel-backed [`NetworkStack`]
pub struct MemoryStack {
    tcp: Arc<MemoryTcpListener>,
    udp: Arc<MemoryUdpEndpoint>,
}

impl MemoryStack {
    /// Create a stack whose inbound queues hold `capacity` entries each,
    /// together with the handle that feeds it.
    #[must_use]
    pub fn new(capacity: usize) -> (Arc<Self>, MemoryStackHandle) {
        let (tcp_tx, tcp_rx) = mpsc::channel(capacity.max(1));
        let (udp_tx, udp_rx) = mpsc::channel(capacity.max(1));
        let (reply_tx, reply_rx) = mpsc::unbounded_channel();

        let tcp_closed = CancellationToken::new();
        let udp_closed = CancellationToken::new();

        let stack = Arc::new(Self {
            tcp: Arc::new(MemoryTcpListener {
                rx: Mutex::new(tcp_rx),
                closed: tcp_closed.clone(),
            }),
            udp: Arc::new(MemoryUdpEndpoint {
                rx: Mutex::new(udp_rx),
                reply_tx,
                closed: udp_closed.clone(),
            }),
        });

        let handle = MemoryStackHandle {
            tcp_tx,
            udp_tx,
            reply_rx,
            tcp_closed,
            udp_closed,
        };

        (stack, handle)
    }
}

impl NetworkStack for MemoryStack {
    fn tcp(&self) -> Arc<dyn StackTcpListener> {
        Arc::clone(&self.tcp) as Arc<dyn StackTcpListener>
    }

    fn udp(&self) -> Arc<dyn StackUdpEndpoint> {
        Arc::clone(&self.udp) as Arc<dyn StackUdpEndpoint>
    }
}

/// Device side of a [`MemoryStack`]
pub struct MemoryStackHandle {
    tcp_tx: mpsc::Sender<TcpFlow>,
    udp_tx: mpsc::Sender<InjectedDatagram>,
    reply_rx: mpsc::UnboundedReceiver<UdpReply>,
    tcp_closed: CancellationToken,
    udp_closed: CancellationToken,
}

impl MemoryStackHandle {
    /// Open a TCP flow from `local` to `remote` and return the application
    /// side of it.
    pub async fn connect_tcp(&self, local: SocketAddr, remote: SocketAddr) -> io::Result<DuplexStream> {
        let (app, stack_side) = tokio::io::duplex(DUPLEX_BUFFER_SIZE);
        self.tcp_tx
            .send(TcpFlow::new(stack_side, local, remote))
            .await
            .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "tcp listener closed"))?;
        Ok(app)
    }

    /// Inject a datagram sent by `local` to `remote`
    pub async fn send_udp(&self, payload: Vec<u8>, local: SocketAddr, remote: SocketAddr) -> io::Result<()> {
        self.udp_tx
            .send(InjectedDatagram {
                payload,
                local,
                remote,
            })
            .await
            .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "udp endpoint closed"))
    }

    /// Wait for the next datagram written back by the bridge
    pub async fn recv_reply(&mut self) -> Option<UdpReply> {
        self.reply_rx.recv().await
    }

    /// Take a written-back datagram if one is queued
    pub fn try_recv_reply(&mut self) -> Option<UdpReply> {
        self.reply_rx.try_recv().ok()
    }

    /// Whether the TCP listener has been closed
    #[must_use]
    pub fn is_tcp_closed(&self) -> bool {
        self.tcp_closed.is_cancelled()
    }

    /// Whether the UDP endpoint has been closed
    #[must_use]
    pub fn is_udp_closed(&self) -> bool {
        self.udp_closed.is_cancelled()
    }
}

/// [`StackLauncher`] handing out a prepared stack
///
/// Accepts any device type and drops it; the prepared stack stands in for
/// the one that would have been built on the device.
pub struct MemoryLauncher {
    stack: SyncMutex<Option<Arc<dyn NetworkStack>>>,
    failure: Option<String>,
}

impl MemoryLauncher {
    /// Launcher returning `stack` on the first launch
    #[must_use]
    pub fn new(stack: Arc<dyn NetworkStack>) -> Self {
        Self {
            stack: SyncMutex::new(Some(stack)),
            failure: None,
        }
    }

    /// Launcher whose every launch fails with `reason`
    #[must_use]
    pub fn failing(reason: impl Into<String>) -> Self {
        Self {
            stack: SyncMutex::new(None),
            failure: Some(reason.into()),
        }
    }
}

impl<D: Send> StackLauncher<D> for MemoryLauncher {
    fn launch(&self, device: D, _addressing: StackAddressing) -> Result<Arc<dyn NetworkStack>, StackError> {
        drop(device);
        if let Some(reason) = &self.failure {
            return Err(StackError::startup(reason.clone()));
        }
        self.stack
            .lock()
            .take()
            .ok_or_else(|| StackError::startup("memory stack already launched"))
    }
}
