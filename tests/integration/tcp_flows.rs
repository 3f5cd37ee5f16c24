//! TCP flows through the bridge

use std::collections::VecDeque;
use std::sync::atomic::Ordering;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

use tun_bridge::dispatch;
use tun_bridge::metadata::AddrType;
use tun_bridge::stack::{MemoryStack, NetworkStack, StackTcpListener, StackUdpEndpoint, TcpFlow};
use tun_bridge::{Bridge, BridgeOptions, InboundType, Network, StackError};

use super::{addr, wait_until, CountingResolver, Harness, CLIENT, WAIT};

/// Listener replaying a fixed sequence of accept results, then idling until closed
struct ScriptedListener {
    script: Mutex<VecDeque<Result<TcpFlow, StackError>>>,
    closed: CancellationToken,
}

#[async_trait]
impl StackTcpListener for ScriptedListener {
    async fn accept(&self) -> Result<TcpFlow, StackError> {
        let next = self.script.lock().unwrap().pop_front();
        match next {
            Some(result) => result,
            None => {
                self.closed.cancelled().await;
                Err(StackError::Closed)
            }
        }
    }

    fn close(&self) {
        self.closed.cancel();
    }
}

/// Scripted TCP side, in-memory UDP side
struct ScriptedStack {
    tcp: Arc<ScriptedListener>,
    memory: Arc<MemoryStack>,
}

impl NetworkStack for ScriptedStack {
    fn tcp(&self) -> Arc<dyn StackTcpListener> {
        Arc::clone(&self.tcp) as Arc<dyn StackTcpListener>
    }

    fn udp(&self) -> Arc<dyn StackUdpEndpoint> {
        self.memory.udp()
    }
}

#[tokio::test]
async fn test_tcp_flow_dispatched_with_metadata() {
    let mut h = Harness::start();

    let mut app = h
        .device
        .connect_tcp(addr(CLIENT), addr("93.184.216.34:443"))
        .await
        .unwrap();

    let mut inbound = timeout(WAIT, h.queues.tcp.recv()).await.unwrap().unwrap();
    let metadata = &inbound.metadata;

    assert_eq!(metadata.network, Network::Tcp);
    assert_eq!(metadata.inbound_type, InboundType::Socks5);
    assert_eq!(metadata.src_ip, "172.19.0.1");
    assert_eq!(metadata.src_port, "40000");
    assert_eq!(metadata.dst_ip, "93.184.216.34");
    assert_eq!(metadata.dst_port, "443");
    assert_eq!(metadata.addr_type, AddrType::Ipv4);
    assert!(metadata.host.is_empty());
    assert_eq!(metadata.raw_src_addr, addr(CLIENT));
    assert_eq!(metadata.raw_dst_addr, addr("93.184.216.34:443"));
    assert_eq!(inbound.conn.local, addr(CLIENT));
    assert_eq!(inbound.conn.remote, addr("93.184.216.34:443"));

    // The queued connection is the other end of the device-side stream
    app.write_all(b"client hello").await.unwrap();
    let mut buf = [0u8; 12];
    inbound.conn.stream.read_exact(&mut buf).await.unwrap();
    assert_eq!(&buf, b"client hello");

    inbound.conn.stream.write_all(b"server hello").await.unwrap();
    app.read_exact(&mut buf).await.unwrap();
    assert_eq!(&buf, b"server hello");

    let stats = h.bridge.stats().snapshot();
    assert_eq!(stats.tcp_accepted, 1);
    assert_eq!(stats.tcp_dispatched, 1);

    h.bridge.shutdown().await;
}

#[tokio::test]
async fn test_tcp_flows_queued_in_accept_order() {
    let mut h = Harness::start();

    let mut apps = Vec::new();
    for port in [1001u16, 1002, 1003] {
        let remote = addr(&format!("10.0.0.1:{port}"));
        apps.push(h.device.connect_tcp(addr(CLIENT), remote).await.unwrap());
    }

    for port in [1001u16, 1002, 1003] {
        let inbound = timeout(WAIT, h.queues.tcp.recv()).await.unwrap().unwrap();
        assert_eq!(inbound.metadata.dst_port, port.to_string());
    }

    h.bridge.shutdown().await;
}

#[tokio::test]
async fn test_loopback_tcp_flow_closed_not_queued() {
    let mut h = Harness::start();

    let mut app = h
        .device
        .connect_tcp(addr(CLIENT), addr("127.0.0.1:8080"))
        .await
        .unwrap();

    // The bridge drops the flow, so the device side reads EOF
    let mut buf = [0u8; 1];
    let n = timeout(WAIT, app.read(&mut buf)).await.unwrap().unwrap();
    assert_eq!(n, 0);

    assert!(h.queues.tcp.try_recv().is_err());
    let stats = h.bridge.stats();
    assert!(wait_until(|| stats.loopback_dropped.load(Ordering::Relaxed) == 1).await);
    assert_eq!(stats.snapshot().tcp_dispatched, 0);

    h.bridge.shutdown().await;
}

#[tokio::test]
async fn test_whole_loopback_block_filtered() {
    let mut h = Harness::start();

    for remote in ["127.255.255.254:80", "[::ffff:127.0.0.1]:80"] {
        let mut app = h.device.connect_tcp(addr(CLIENT), addr(remote)).await.unwrap();
        let mut buf = [0u8; 1];
        assert_eq!(timeout(WAIT, app.read(&mut buf)).await.unwrap().unwrap(), 0);
    }

    // Just outside the block is dispatched
    let _app = h
        .device
        .connect_tcp(addr(CLIENT), addr("128.0.0.1:80"))
        .await
        .unwrap();
    let inbound = timeout(WAIT, h.queues.tcp.recv()).await.unwrap().unwrap();
    assert_eq!(inbound.metadata.dst_ip, "128.0.0.1");

    assert_eq!(h.bridge.stats().snapshot().loopback_dropped, 2);

    h.bridge.shutdown().await;
}

#[tokio::test]
async fn test_tcp_flow_closed_when_substrate_gone() {
    let Harness {
        bridge,
        device,
        queues,
        ..
    } = Harness::start();
    drop(queues);

    let mut app = device
        .connect_tcp(addr(CLIENT), addr("1.1.1.1:443"))
        .await
        .unwrap();

    let mut buf = [0u8; 1];
    assert_eq!(timeout(WAIT, app.read(&mut buf)).await.unwrap().unwrap(), 0);

    let stats = bridge.stats();
    assert!(wait_until(|| stats.dispatch_failures.load(Ordering::Relaxed) == 1).await);
    assert!(!bridge.is_closed());

    bridge.shutdown().await;
}

#[tokio::test]
async fn test_accept_errors_counted_and_loop_continues() {
    let (mut app, stack_side) = tokio::io::duplex(64);
    let mut script: VecDeque<Result<TcpFlow, StackError>> =
        (0..3).map(|_| Err(StackError::accept("transient"))).collect();
    script.push_back(Ok(TcpFlow::new(
        stack_side,
        addr(CLIENT),
        addr("10.0.0.5:443"),
    )));

    let listener = Arc::new(ScriptedListener {
        script: Mutex::new(script),
        closed: CancellationToken::new(),
    });
    let (memory, _device) = MemoryStack::new(8);
    let stack = Arc::new(ScriptedStack {
        tcp: Arc::clone(&listener),
        memory,
    });
    let (dispatcher, mut queues) = dispatch::channel(8);

    let bridge = Bridge::with_stack(
        stack,
        BridgeOptions::default(),
        dispatcher,
        Arc::new(CountingResolver::default()),
    );

    // The flow behind the failures still reaches the substrate
    let mut inbound = timeout(WAIT, queues.tcp.recv()).await.unwrap().unwrap();
    assert_eq!(inbound.metadata.dst_ip, "10.0.0.5");
    assert_eq!(inbound.metadata.dst_port, "443");

    app.write_all(b"ping").await.unwrap();
    let mut buf = [0u8; 4];
    inbound.conn.stream.read_exact(&mut buf).await.unwrap();
    assert_eq!(&buf, b"ping");

    let stats = bridge.stats().snapshot();
    assert_eq!(stats.tcp_accept_errors, 3);
    assert_eq!(stats.tcp_accepted, 1);
    assert_eq!(stats.tcp_dispatched, 1);
    assert!(!bridge.is_closed());

    bridge.shutdown().await;
    assert!(listener.closed.is_cancelled());
}
