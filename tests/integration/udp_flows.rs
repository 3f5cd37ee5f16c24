//! UDP datagrams through the bridge

use std::sync::atomic::Ordering;

use tokio::time::timeout;

use tun_bridge::{InboundType, SocksAddr};

use super::{addr, wait_until, Harness, CLIENT, WAIT};

#[tokio::test]
async fn test_datagram_dispatched_and_written_back() {
    let mut h = Harness::start();
    let remote = addr("8.8.4.4:3478");

    h.device
        .send_udp(b"binding request".to_vec(), addr(CLIENT), remote)
        .await
        .unwrap();

    let inbound = timeout(WAIT, h.queues.udp.recv()).await.unwrap().unwrap();
    assert_eq!(inbound.target, SocksAddr::Ip(remote));
    assert_eq!(inbound.inbound_type, InboundType::Socks5);
    assert_eq!(inbound.packet.data(), b"binding request");
    assert_eq!(inbound.packet.local_addr(), addr(CLIENT));
    assert_eq!(inbound.packet.remote_addr(), remote);

    // Reply as the original destination
    let written = inbound
        .packet
        .write_back(b"binding response", remote)
        .await
        .unwrap();
    assert_eq!(written, 16);

    let reply = timeout(WAIT, h.device.recv_reply()).await.unwrap().unwrap();
    assert_eq!(reply.payload, b"binding response");
    assert_eq!(reply.from, remote);
    assert_eq!(reply.to, addr(CLIENT));

    // Idle workers hold one buffer each; the datagram holds one more
    let pool = h.bridge.buffer_pool();
    let before = pool.stats().outstanding();
    inbound.packet.release();
    assert_eq!(pool.stats().outstanding(), before - 1);

    let stats = h.bridge.stats().snapshot();
    assert_eq!(stats.udp_received, 1);
    assert_eq!(stats.udp_dispatched, 1);
    assert_eq!(stats.udp_bytes, 15);

    h.bridge.shutdown().await;
}

#[tokio::test]
async fn test_write_back_from_other_source() {
    let mut h = Harness::start();

    h.device
        .send_udp(b"q".to_vec(), addr(CLIENT), addr("1.2.3.4:9000"))
        .await
        .unwrap();
    let inbound = timeout(WAIT, h.queues.udp.recv()).await.unwrap().unwrap();

    // Full-cone style reply from a different peer
    let other = addr("5.6.7.8:9001");
    inbound.packet.write_back(b"r", other).await.unwrap();

    let reply = timeout(WAIT, h.device.recv_reply()).await.unwrap().unwrap();
    assert_eq!(reply.from, other);
    assert_eq!(reply.to, addr(CLIENT));

    inbound.packet.release();
    h.bridge.shutdown().await;
}

#[tokio::test]
async fn test_loopback_datagram_released_not_queued() {
    let mut h = Harness::start();

    h.device
        .send_udp(b"local".to_vec(), addr(CLIENT), addr("127.0.0.53:53"))
        .await
        .unwrap();

    let stats = h.bridge.stats();
    assert!(wait_until(|| stats.loopback_dropped.load(Ordering::Relaxed) == 1).await);

    assert!(h.queues.udp.try_recv().is_err());
    assert!(h.device.try_recv_reply().is_none());

    h.bridge.shutdown().await;
    assert_eq!(h.bridge.buffer_pool().stats().outstanding(), 0);
}

#[tokio::test]
async fn test_datagram_burst_all_dispatched() {
    let mut h = Harness::start();
    let remote = addr("9.9.9.9:443");

    for i in 0..8u8 {
        h.device.send_udp(vec![i], addr(CLIENT), remote).await.unwrap();
    }

    let mut seen = Vec::new();
    for _ in 0..8 {
        let inbound = timeout(WAIT, h.queues.udp.recv()).await.unwrap().unwrap();
        seen.push(inbound.packet.data()[0]);
        inbound.packet.release();
    }
    // Workers race for the endpoint, so only the set is stable
    seen.sort_unstable();
    assert_eq!(seen, (0..8).collect::<Vec<u8>>());

    h.bridge.shutdown().await;
    assert_eq!(h.bridge.buffer_pool().stats().outstanding(), 0);
}

#[tokio::test]
async fn test_datagram_released_when_substrate_gone() {
    let Harness {
        bridge,
        device,
        queues,
        ..
    } = Harness::start();
    drop(queues);

    device
        .send_udp(b"orphan".to_vec(), addr(CLIENT), addr("1.1.1.1:443"))
        .await
        .unwrap();

    let stats = bridge.stats();
    assert!(wait_until(|| stats.dispatch_failures.load(Ordering::Relaxed) == 1).await);

    bridge.shutdown().await;
    assert_eq!(bridge.buffer_pool().stats().outstanding(), 0);
}

#[tokio::test]
async fn test_oversized_datagram_dropped_not_clipped() {
    let mut h = Harness::start();
    let remote = addr("10.0.0.5:9");

    // Harness buffers hold 2048 bytes
    h.device
        .send_udp(vec![0xAB; 3000], addr(CLIENT), remote)
        .await
        .unwrap();
    h.device
        .send_udp(b"fits".to_vec(), addr(CLIENT), remote)
        .await
        .unwrap();

    let inbound = timeout(WAIT, h.queues.udp.recv()).await.unwrap().unwrap();
    assert_eq!(inbound.packet.data(), b"fits");
    inbound.packet.release();
    assert!(h.queues.udp.try_recv().is_err());

    let stats = h.bridge.stats();
    assert!(wait_until(|| stats.udp_oversized.load(Ordering::Relaxed) == 1).await);
    assert_eq!(stats.snapshot().udp_dispatched, 1);

    h.bridge.shutdown().await;
    assert_eq!(h.bridge.buffer_pool().stats().outstanding(), 0);
}
