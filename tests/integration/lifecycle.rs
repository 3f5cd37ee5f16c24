//! Bridge start, close and shutdown

use std::io::Read;
use std::os::fd::OwnedFd;
use std::os::unix::net::UnixStream;
use std::sync::Arc;
use std::time::Duration;

use tokio::time::timeout;

use tun_bridge::bridge::DEFAULT_UDP_WORKERS;
use tun_bridge::dispatch;
use tun_bridge::stack::{MemoryLauncher, MemoryStack};
use tun_bridge::{Bridge, BridgeError, BridgeOptions, DnsResolver};

use super::{addr, CountingResolver, Harness, CLIENT, WAIT};

/// Socket pair standing in for a TUN descriptor; the peer observes closure
fn device_pair() -> (OwnedFd, UnixStream) {
    let (device, peer) = UnixStream::pair().unwrap();
    peer.set_read_timeout(Some(WAIT)).unwrap();
    (OwnedFd::from(device), peer)
}

fn assert_peer_closed(mut peer: UnixStream) {
    let mut buf = [0u8; 1];
    assert_eq!(peer.read(&mut buf).unwrap(), 0, "device descriptor still open");
}

#[tokio::test]
async fn test_start_with_launcher() {
    let (fd, _peer) = device_pair();
    let (stack, device) = MemoryStack::new(8);
    let launcher = MemoryLauncher::new(stack);
    let (dispatcher, mut queues) = dispatch::channel(8);

    let bridge = Bridge::start(
        fd,
        "172.19.0.1",
        "172.19.0.2",
        "172.19.0.2",
        &launcher,
        dispatcher,
        Arc::new(CountingResolver::default()),
    )
    .unwrap();

    assert_eq!(bridge.dns_target().to_string(), "172.19.0.2:53");

    device
        .send_udp(b"hello".to_vec(), addr(CLIENT), addr("1.1.1.1:443"))
        .await
        .unwrap();
    let inbound = timeout(WAIT, queues.udp.recv()).await.unwrap().unwrap();
    assert_eq!(inbound.packet.data(), b"hello");
    inbound.packet.release();

    bridge.shutdown().await;
    assert!(device.is_tcp_closed());
    assert!(device.is_udp_closed());
}

#[tokio::test]
async fn test_start_failure_closes_device() {
    let (fd, peer) = device_pair();
    let launcher = MemoryLauncher::failing("no stack today");
    let (dispatcher, _queues) = dispatch::channel(8);

    let err = Bridge::start(
        fd,
        "172.19.0.1",
        "172.19.0.2",
        "172.19.0.2",
        &launcher,
        dispatcher,
        Arc::new(CountingResolver::default()),
    )
    .unwrap_err();

    assert!(matches!(err, BridgeError::Stack(_)));
    assert!(err.to_string().contains("no stack today"));
    assert_peer_closed(peer);
}

#[tokio::test]
async fn test_start_rejects_bad_addresses() {
    for (gateway, portal, dns) in [
        ("172.19.0.300", "172.19.0.2", "172.19.0.2"),
        ("172.19.0.1", "portal", "172.19.0.2"),
        ("172.19.0.1", "172.19.0.2", "fd00::2"),
    ] {
        let (fd, peer) = device_pair();
        let (stack, _device) = MemoryStack::new(8);
        let launcher = MemoryLauncher::new(stack);
        let (dispatcher, _queues) = dispatch::channel(8);

        let err = Bridge::start(
            fd,
            gateway,
            portal,
            dns,
            &launcher,
            dispatcher,
            Arc::new(CountingResolver::default()),
        )
        .unwrap_err();

        assert!(matches!(err, BridgeError::Config(_)), "{gateway} {portal} {dns}: {err}");
        assert_peer_closed(peer);
    }
}

#[tokio::test]
async fn test_close_is_idempotent() {
    let h = Harness::start();

    h.bridge.close();
    h.bridge.close();
    assert!(h.bridge.is_closed());
    assert!(h.device.is_tcp_closed());
    assert!(h.device.is_udp_closed());

    timeout(WAIT, h.bridge.shutdown()).await.unwrap();
    timeout(WAIT, h.bridge.shutdown()).await.unwrap();
}

#[tokio::test]
async fn test_shutdown_returns_every_buffer() {
    let mut h = Harness::start();

    // One datagram of each kind
    for remote in ["1.1.1.1:443", "127.0.0.1:443", "172.19.0.2:53"] {
        h.device
            .send_udp(b"payload".to_vec(), addr(CLIENT), addr(remote))
            .await
            .unwrap();
    }

    let inbound = timeout(WAIT, h.queues.udp.recv()).await.unwrap().unwrap();
    let reply = timeout(WAIT, h.device.recv_reply()).await.unwrap().unwrap();
    assert_eq!(reply.from, addr("172.19.0.2:53"));

    timeout(WAIT, h.bridge.shutdown()).await.unwrap();

    // Only the datagram still held by the substrate is outstanding
    let pool = h.bridge.buffer_pool();
    assert_eq!(pool.stats().outstanding(), 1);
    inbound.packet.release();
    assert_eq!(pool.stats().outstanding(), 0);
}

#[tokio::test]
async fn test_write_back_after_close_fails() {
    let mut h = Harness::start();

    h.device
        .send_udp(b"late".to_vec(), addr(CLIENT), addr("1.1.1.1:443"))
        .await
        .unwrap();
    let inbound = timeout(WAIT, h.queues.udp.recv()).await.unwrap().unwrap();

    h.bridge.shutdown().await;

    let err = inbound
        .packet
        .write_back(b"reply", addr("1.1.1.1:443"))
        .await
        .unwrap_err();
    assert!(err.is_closed());
    inbound.packet.release();
}

#[tokio::test]
async fn test_zero_workers_still_runs_one() {
    let (stack, device) = MemoryStack::new(8);
    let (dispatcher, mut queues) = dispatch::channel(8);

    let bridge = Bridge::with_stack(
        stack,
        BridgeOptions::default().with_udp_workers(0),
        dispatcher,
        Arc::new(CountingResolver::default()) as Arc<dyn DnsResolver>,
    );

    device
        .send_udp(b"x".to_vec(), addr(CLIENT), addr("1.1.1.1:443"))
        .await
        .unwrap();
    let inbound = timeout(WAIT, queues.udp.recv()).await.unwrap().unwrap();
    inbound.packet.release();

    assert_eq!(BridgeOptions::default().udp_workers, DEFAULT_UDP_WORKERS);
    bridge.shutdown().await;
}

#[tokio::test]
async fn test_dropping_handle_stops_loops() {
    let Harness { bridge, device, .. } = Harness::start();
    drop(bridge);

    assert!(device.is_tcp_closed());
    assert!(device.is_udp_closed());

    // Nothing accepts the flow any more
    tokio::time::sleep(Duration::from_millis(10)).await;
    let app = device.connect_tcp(addr(CLIENT), addr("1.1.1.1:443")).await;
    assert!(app.is_err());
}
