//! In-band DNS hijack

use std::sync::atomic::Ordering;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::time::timeout;

use tun_bridge::DnsHijackTarget;

use super::{addr, wait_until, CountingResolver, Harness, CLIENT, WAIT};

/// 2-byte length prefix followed by the query
fn framed(query: &[u8]) -> Vec<u8> {
    let len = u16::try_from(query.len()).unwrap();
    let mut out = len.to_be_bytes().to_vec();
    out.extend_from_slice(query);
    out
}

#[tokio::test]
async fn test_udp_query_answered_in_band() {
    let mut h = Harness::start();
    let server = addr("172.19.0.2:53");

    h.device
        .send_udp(b"\x12\x34query".to_vec(), addr(CLIENT), server)
        .await
        .unwrap();

    let reply = timeout(WAIT, h.device.recv_reply()).await.unwrap().unwrap();
    assert_eq!(reply.payload, CountingResolver::answer(b"\x12\x34query"));
    assert_eq!(reply.from, server);
    assert_eq!(reply.to, addr(CLIENT));

    assert_eq!(h.resolver.count(), 1);
    assert!(h.queues.udp.try_recv().is_err());

    let stats = h.bridge.stats().snapshot();
    assert_eq!(stats.dns_hijacked_udp, 1);
    assert_eq!(stats.udp_dispatched, 0);

    h.bridge.shutdown().await;
    assert_eq!(h.bridge.buffer_pool().stats().outstanding(), 0);
}

#[tokio::test]
async fn test_tcp_queries_answered_without_prefix() {
    let mut h = Harness::start();

    let mut app = h
        .device
        .connect_tcp(addr(CLIENT), addr("172.19.0.2:53"))
        .await
        .unwrap();

    for query in [&b"first"[..], &b"second query"[..]] {
        app.write_all(&framed(query)).await.unwrap();

        let expected = CountingResolver::answer(query);
        let mut response = vec![0u8; expected.len()];
        timeout(WAIT, app.read_exact(&mut response)).await.unwrap().unwrap();
        assert_eq!(response, expected);
    }

    assert_eq!(h.resolver.count(), 2);
    assert!(h.queues.tcp.try_recv().is_err());
    assert_eq!(h.bridge.stats().snapshot().dns_hijacked_tcp, 1);

    // Closing the client side ends the relay cleanly
    drop(app);
    tokio::time::sleep(std::time::Duration::from_millis(20)).await;
    assert_eq!(h.bridge.stats().snapshot().dns_relay_errors, 0);

    h.bridge.shutdown().await;
}

#[tokio::test]
async fn test_tcp_relay_closes_on_oversized_length() {
    let h = Harness::start();

    let mut app = h
        .device
        .connect_tcp(addr(CLIENT), addr("172.19.0.2:53"))
        .await
        .unwrap();

    // Declares more than a relay buffer holds
    app.write_all(&[0xFF, 0xFF]).await.unwrap();

    let mut buf = [0u8; 1];
    assert_eq!(timeout(WAIT, app.read(&mut buf)).await.unwrap().unwrap(), 0);

    let stats = h.bridge.stats();
    assert!(wait_until(|| stats.dns_relay_errors.load(Ordering::Relaxed) == 1).await);
    assert_eq!(h.resolver.count(), 0);

    h.bridge.shutdown().await;
}

#[tokio::test]
async fn test_tcp_relay_idle_timeout_closes() {
    let h = Harness::start();

    let mut app = h
        .device
        .connect_tcp(addr(CLIENT), addr("172.19.0.2:53"))
        .await
        .unwrap();

    // Relay timeout is 500ms in the harness
    let mut buf = [0u8; 1];
    assert_eq!(timeout(WAIT, app.read(&mut buf)).await.unwrap().unwrap(), 0);

    let stats = h.bridge.stats();
    assert!(wait_until(|| stats.dns_relay_errors.load(Ordering::Relaxed) == 1).await);

    h.bridge.shutdown().await;
}

#[tokio::test]
async fn test_other_resolver_not_hijacked() {
    let mut h = Harness::start();

    h.device
        .send_udp(b"query".to_vec(), addr(CLIENT), addr("8.8.8.8:53"))
        .await
        .unwrap();
    let inbound = timeout(WAIT, h.queues.udp.recv()).await.unwrap().unwrap();
    assert_eq!(inbound.packet.remote_addr(), addr("8.8.8.8:53"));
    inbound.packet.release();

    // Right address, wrong port
    h.device
        .send_udp(b"x".to_vec(), addr(CLIENT), addr("172.19.0.2:5353"))
        .await
        .unwrap();
    let inbound = timeout(WAIT, h.queues.udp.recv()).await.unwrap().unwrap();
    assert_eq!(inbound.packet.remote_addr(), addr("172.19.0.2:5353"));
    inbound.packet.release();

    assert_eq!(h.resolver.count(), 0);
    h.bridge.shutdown().await;
}

#[tokio::test]
async fn test_unspecified_target_hijacks_every_port_53() {
    let mut h = Harness::with_target(DnsHijackTarget::all());

    for server in ["8.8.8.8:53", "1.1.1.1:53"] {
        h.device
            .send_udp(b"q".to_vec(), addr(CLIENT), addr(server))
            .await
            .unwrap();
        let reply = timeout(WAIT, h.device.recv_reply()).await.unwrap().unwrap();
        assert_eq!(reply.from, addr(server));
    }

    assert_eq!(h.resolver.count(), 2);
    assert!(h.queues.udp.try_recv().is_err());
    h.bridge.shutdown().await;
}

#[tokio::test]
async fn test_loopback_resolver_dropped_before_hijack() {
    let mut h = Harness::with_target(DnsHijackTarget::all());

    h.device
        .send_udp(b"q".to_vec(), addr(CLIENT), addr("127.0.0.1:53"))
        .await
        .unwrap();

    let stats = h.bridge.stats();
    assert!(wait_until(|| stats.loopback_dropped.load(Ordering::Relaxed) == 1).await);
    assert_eq!(h.resolver.count(), 0);
    assert!(h.device.try_recv_reply().is_none());

    h.bridge.shutdown().await;
}
