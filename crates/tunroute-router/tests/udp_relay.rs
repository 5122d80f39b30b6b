mod common;

use std::time::Duration;

use common::{device_addr, eventually, start_router, test_config, udp, Device};
use tokio::net::UdpSocket;
use tunroute_packet::Protocol;
use tunroute_router::RouterConfig;

async fn echo_server() -> std::net::SocketAddr {
    let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let addr = socket.local_addr().unwrap();
    tokio::spawn(async move {
        let mut buf = [0u8; 2048];
        loop {
            let (n, from) = socket.recv_from(&mut buf).await.unwrap();
            socket.send_to(&buf[..n], from).await.unwrap();
        }
    });
    addr
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn datagram_round_trip_swaps_addresses() {
    let remote = echo_server().await;
    let mut device = Device::new();
    let router = start_router(test_config(), &device);

    device.inject(udp(device_addr(5353), remote, b"ping"));
    let reply = device.next_packet().await;
    assert_eq!(reply.view.protocol, Protocol::Udp);
    assert_eq!(reply.view.source_addr(), remote);
    assert_eq!(reply.view.destination_addr(), device_addr(5353));
    assert_eq!(reply.payload(), b"ping");

    // The second datagram reuses the session.
    device.inject(udp(device_addr(5353), remote, b"pong"));
    assert_eq!(device.next_packet().await.payload(), b"pong");

    let stats = router.metrics().snapshot();
    assert_eq!(stats.udp_sessions_total, 1);
    assert_eq!(router.active_sessions(), 1);

    router.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn distinct_device_ports_get_distinct_sessions() {
    let remote = echo_server().await;
    let mut device = Device::new();
    let router = start_router(test_config(), &device);

    device.inject(udp(device_addr(6000), remote, b"a"));
    device.inject(udp(device_addr(6001), remote, b"b"));
    let mut ports = vec![
        device.next_packet().await.view.destination_port,
        device.next_packet().await.view.destination_port,
    ];
    ports.sort_unstable();
    assert_eq!(ports, [6000, 6001]);
    assert_eq!(router.active_sessions(), 2);

    router.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn idle_session_is_evicted() {
    let remote = echo_server().await;
    let mut device = Device::new();
    let router = start_router(
        RouterConfig {
            udp_idle_timeout: Duration::from_millis(300),
            ..test_config()
        },
        &device,
    );

    device.inject(udp(device_addr(7000), remote, b"hi"));
    device.next_packet().await;
    assert_eq!(router.active_sessions(), 1);

    eventually("idle eviction", || router.active_sessions() == 0).await;
    eventually("relay task exit", || {
        router.metrics().snapshot().udp_sessions_active == 0
    })
    .await;
    assert!(router.metrics().snapshot().sessions_evicted_total >= 1);

    // A fresh datagram opens a new session.
    device.inject(udp(device_addr(7000), remote, b"again"));
    assert_eq!(device.next_packet().await.payload(), b"again");
    assert_eq!(router.metrics().snapshot().udp_sessions_total, 2);

    router.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn oversized_response_is_dropped() {
    let remote = echo_server().await;
    let mut device = Device::new();
    let router = start_router(
        RouterConfig {
            mtu: 600,
            ..test_config()
        },
        &device,
    );

    // 600 - 20 - 8 = 572 bytes fit; the device packet itself is within the MTU as well.
    device.inject(udp(device_addr(8000), remote, &[7u8; 572]));
    assert_eq!(device.next_packet().await.payload().len(), 572);

    // Larger device packets are truncated by the read and dropped as malformed, so exercise the
    // response limit with a remote that answers bigger than it was asked.
    let big = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let big_addr = big.local_addr().unwrap();
    tokio::spawn(async move {
        let mut buf = [0u8; 64];
        let (_, from) = big.recv_from(&mut buf).await.unwrap();
        big.send_to(&[1u8; 1000], from).await.unwrap();
        big.send_to(b"small", from).await.unwrap();
    });
    device.inject(udp(device_addr(8001), big_addr, b"q"));
    assert_eq!(device.next_packet().await.payload(), b"small");
    assert_eq!(router.metrics().snapshot().dropped_oversized, 1);

    router.stop().await;
}
