//! [`NetworkStack`] over the `ipstack` crate
//!
//! ```text
//! VirtualDevice ◄──► ipstack::IpStack ──accept──► driver task
//!                                                   ├── Tcp  ──► tcp queue ──► IpStackListener::accept
//!                                                   └── Udp  ──► session task ──► udp queue ──► recv_from
//!                                                                  ▲
//!                                    send_to(from, to) ── sessions[(to, from)]
//! ```
//!
//! ipstack hands out one stream per UDP 4-tuple. Each stream gets a session
//! task that flattens it into datagrams; replies are routed back to the
//! stream whose addressing matches.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt, WriteHalf};
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use super::{
    NetworkStack, StackAddressing, StackLauncher, StackTcpListener, StackUdpEndpoint, TcpFlow,
    UdpRecv, VirtualDevice,
};
use crate::error::StackError;

/// Default interface MTU
pub const DEFAULT_MTU: u16 = 9000;

/// Default idle timeout of a UDP session
pub const DEFAULT_UDP_IDLE_TIMEOUT: Duration = Duration::from_secs(30);

/// Default depth of the accepted-flow queues
pub const DEFAULT_QUEUE_DEPTH: usize = 256;

type SessionKey = (SocketAddr, SocketAddr);
type SessionWriter = Arc<Mutex<WriteHalf<::ipstack::IpStackUdpStream>>>;

struct InboundDatagram {
    payload: Bytes,
    local: SocketAddr,
    remote: SocketAddr,
}

/// Launches an `ipstack` stack on a [`VirtualDevice`]
#[derive(Debug, Clone)]
pub struct IpStackLauncher {
    mtu: u16,
    udp_idle_timeout: Duration,
    queue_depth: usize,
}

impl Default for IpStackLauncher {
    fn default() -> Self {
        Self {
            mtu: DEFAULT_MTU,
            udp_idle_timeout: DEFAULT_UDP_IDLE_TIMEOUT,
            queue_depth: DEFAULT_QUEUE_DEPTH,
        }
    }
}

impl IpStackLauncher {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub const fn with_mtu(mut self, mtu: u16) -> Self {
        self.mtu = mtu;
        self
    }

    #[must_use]
    pub const fn with_udp_idle_timeout(mut self, timeout: Duration) -> Self {
        self.udp_idle_timeout = timeout;
        self
    }
}

impl StackLauncher<VirtualDevice> for IpStackLauncher {
    fn launch(
        &self,
        device: VirtualDevice,
        addressing: StackAddressing,
    ) -> Result<Arc<dyn NetworkStack>, StackError> {
        if self.mtu < 576 {
            return Err(StackError::startup(format!("mtu {} too small", self.mtu)));
        }

        let mut config = ::ipstack::IpStackConfig::default();
        config.mtu(self.mtu);

        let fd = device.raw_fd();
        let ip_stack = ::ipstack::IpStack::new(config, device);

        let (driver, network) = self.wire();
        tokio::spawn(driver.run(ip_stack));

        info!(
            fd,
            gateway = %addressing.gateway,
            portal = %addressing.portal,
            mtu = self.mtu,
            "ipstack started"
        );

        Ok(Arc::new(network))
    }
}

impl IpStackLauncher {
    /// Driver plus the listener and endpoint it feeds
    fn wire(&self) -> (Driver, IpStackNetwork) {
        let (tcp_tx, tcp_rx) = mpsc::channel(self.queue_depth);
        let (udp_tx, udp_rx) = mpsc::channel(self.queue_depth);
        let sessions: Arc<DashMap<SessionKey, SessionWriter>> = Arc::new(DashMap::new());

        let tcp_closed = CancellationToken::new();
        let udp_closed = CancellationToken::new();

        let driver = Driver {
            tcp_tx,
            udp_tx,
            sessions: Arc::clone(&sessions),
            tcp_closed: tcp_closed.clone(),
            udp_closed: udp_closed.clone(),
            udp_idle_timeout: self.udp_idle_timeout,
            mtu: self.mtu,
        };

        let network = IpStackNetwork {
            tcp: Arc::new(IpStackListener {
                rx: Mutex::new(tcp_rx),
                closed: tcp_closed,
            }),
            udp: Arc::new(IpStackEndpoint {
                rx: Mutex::new(udp_rx),
                sessions,
                closed: udp_closed,
            }),
        };

        (driver, network)
    }
}

/// Pulls streams out of ipstack and routes them to the listener and endpoint
struct Driver {
    tcp_tx: mpsc::Sender<TcpFlow>,
    udp_tx: mpsc::Sender<InboundDatagram>,
    sessions: Arc<DashMap<SessionKey, SessionWriter>>,
    tcp_closed: CancellationToken,
    udp_closed: CancellationToken,
    udp_idle_timeout: Duration,
    mtu: u16,
}

impl Driver {
    async fn run(self, mut ip_stack: ::ipstack::IpStack) {
        debug!("ipstack driver started");

        loop {
            let accepted = tokio::select! {
                () = self.both_closed() => break,
                accepted = ip_stack.accept() => accepted,
            };

            let stream = match accepted {
                Ok(stream) => stream,
                Err(e) => {
                    warn!("ipstack accept error: {:?}", e);
                    break;
                }
            };

            match stream {
                ::ipstack::IpStackStream::Tcp(tcp_stream) => {
                    if self.tcp_closed.is_cancelled() {
                        continue;
                    }
                    let local = tcp_stream.local_addr();
                    let remote = tcp_stream.peer_addr();
                    trace!(%local, %remote, "ipstack TCP stream");
                    self.hand_off_tcp(TcpFlow::new(tcp_stream, local, remote));
                }
                ::ipstack::IpStackStream::Udp(udp_stream) => {
                    if self.udp_closed.is_cancelled() {
                        continue;
                    }
                    self.spawn_session(udp_stream);
                }
                ::ipstack::IpStackStream::UnknownTransport(unknown) => {
                    trace!(
                        src = %unknown.src_addr(),
                        dst = %unknown.dst_addr(),
                        "Unknown transport packet"
                    );
                }
                ::ipstack::IpStackStream::UnknownNetwork(packet) => {
                    trace!(len = packet.len(), "Unknown network packet");
                }
            }
        }

        self.sessions.clear();
        debug!("ipstack driver stopped");
    }

    /// Queue a flow for the listener. Never waits on the TCP queue.
    fn hand_off_tcp(&self, flow: TcpFlow) {
        let tcp_tx = self.tcp_tx.clone();
        let closed = self.tcp_closed.clone();

        tokio::spawn(async move {
            let remote = flow.remote;
            tokio::select! {
                () = closed.cancelled() => trace!(%remote, "TCP flow discarded on close"),
                sent = tcp_tx.send(flow) => {
                    if sent.is_err() {
                        debug!(%remote, "TCP queue closed");
                    }
                }
            }
        });
    }

    async fn both_closed(&self) {
        self.tcp_closed.cancelled().await;
        self.udp_closed.cancelled().await;
    }

    fn spawn_session(&self, udp_stream: ::ipstack::IpStackUdpStream) {
        let local = udp_stream.local_addr();
        let remote = udp_stream.peer_addr();
        let (reader, writer) = tokio::io::split(udp_stream);

        self.sessions
            .insert((local, remote), Arc::new(Mutex::new(writer)));
        trace!(%local, %remote, sessions = self.sessions.len(), "UDP session opened");

        tokio::spawn(run_session(
            reader,
            local,
            remote,
            self.udp_tx.clone(),
            Arc::clone(&self.sessions),
            self.udp_closed.clone(),
            self.udp_idle_timeout,
            usize::from(self.mtu),
        ));
    }
}

#[allow(clippy::too_many_arguments)]
async fn run_session<R>(
    mut reader: R,
    local: SocketAddr,
    remote: SocketAddr,
    udp_tx: mpsc::Sender<InboundDatagram>,
    sessions: Arc<DashMap<SessionKey, SessionWriter>>,
    closed: CancellationToken,
    idle_timeout: Duration,
    mtu: usize,
) where
    R: AsyncRead + Unpin,
{
    let mut buf = vec![0u8; mtu];

    loop {
        let read = tokio::select! {
            () = closed.cancelled() => break,
            read = tokio::time::timeout(idle_timeout, reader.read(&mut buf)) => read,
        };

        let n = match read {
            Ok(Ok(0)) | Err(_) => break,
            Ok(Ok(n)) => n,
            Ok(Err(e)) => {
                debug!(%local, %remote, error = %e, "UDP session read failed");
                break;
            }
        };

        let datagram = InboundDatagram {
            payload: Bytes::copy_from_slice(&buf[..n]),
            local,
            remote,
        };
        if udp_tx.send(datagram).await.is_err() {
            break;
        }
    }

    sessions.remove(&(local, remote));
    trace!(%local, %remote, "UDP session closed");
}

/// TCP side of an ipstack stack
struct IpStackListener {
    rx: Mutex<mpsc::Receiver<TcpFlow>>,
    closed: CancellationToken,
}

#[async_trait]
impl StackTcpListener for IpStackListener {
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

/// UDP side of an ipstack stack
struct IpStackEndpoint {
    rx: Mutex<mpsc::Receiver<InboundDatagram>>,
    sessions: Arc<DashMap<SessionKey, SessionWriter>>,
    closed: CancellationToken,
}

#[async_trait]
impl StackUdpEndpoint for IpStackEndpoint {
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

        // No shard lock may be held across the write.
        let writer = self
            .sessions
            .get(&(to, from))
            .map(|entry| Arc::clone(entry.value()))
            .ok_or_else(|| {
                StackError::Io(io::Error::new(
                    io::ErrorKind::NotFound,
                    format!("no UDP session for {to} <- {from}"),
                ))
            })?;

        let mut writer = writer.lock().await;
        writer.write_all(payload).await?;
        Ok(payload.len())
    }

    fn close(&self) {
        self.closed.cancel();
    }
}

struct IpStackNetwork {
    tcp: Arc<IpStackListener>,
    udp: Arc<IpStackEndpoint>,
}

impl NetworkStack for IpStackNetwork {
    fn tcp(&self) -> Arc<dyn StackTcpListener> {
        Arc::clone(&self.tcp) as Arc<dyn StackTcpListener>
    }

    fn udp(&self) -> Arc<dyn StackUdpEndpoint> {
        Arc::clone(&self.udp) as Arc<dyn StackUdpEndpoint>
    }
}
