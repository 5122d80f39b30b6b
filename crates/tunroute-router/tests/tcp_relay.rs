mod common;

use std::io;
use std::time::Duration;

use common::{device_addr, eventually, start_router, test_config, Device, TcpClient};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tunroute_packet::TcpFlags;

async fn echo_server() -> std::net::SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        let (mut stream, _) = listener.accept().await.unwrap();
        let mut buf = [0u8; 4096];
        loop {
            let n = stream.read(&mut buf).await.unwrap();
            if n == 0 {
                break;
            }
            stream.write_all(&buf[..n]).await.unwrap();
        }
    });
    addr
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn handshake_then_echo() {
    let remote = echo_server().await;
    let mut device = Device::new();
    let router = start_router(test_config(), &device);

    let mut client = TcpClient::new(device_addr(40000), remote, 100);
    let synack = client.connect(&mut device).await;
    assert_eq!(synack.tcp().ack, 101);
    assert_eq!(synack.tcp().mss, Some(1460));
    assert_eq!(synack.view.source_addr(), remote);
    assert_eq!(synack.view.destination_addr(), device_addr(40000));
    // Exactly one SYN-ACK, and nothing else until data flows.
    device.expect_silence(Duration::from_millis(200)).await;
    assert_eq!(router.active_sessions(), 1);

    device.inject(client.data(b"hello"));
    let mut acked = false;
    let mut echoed = None;
    while !acked || echoed.is_none() {
        let pkt = device.next_packet().await;
        if pkt.payload().is_empty() {
            assert!(pkt.has_flags(TcpFlags::ACK));
            assert_eq!(pkt.tcp().ack, 106);
            acked = true;
        } else {
            echoed = Some(pkt);
        }
    }
    let echoed = echoed.unwrap();
    assert_eq!(echoed.payload(), b"hello");
    assert_eq!(echoed.tcp().seq, client.ack);
    assert_eq!(echoed.tcp().ack, 106);
    assert!(echoed.tcp().flags.contains(TcpFlags::PSH));

    router.stop().await;
    assert_eq!(router.active_sessions(), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn out_of_order_segments_reach_remote_in_order() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let remote = listener.local_addr().unwrap();
    let (tx, rx) = oneshot::channel();
    tokio::spawn(async move {
        let (mut stream, _) = listener.accept().await.unwrap();
        let mut received = Vec::new();
        stream.read_to_end(&mut received).await.unwrap();
        let _ = tx.send(received);
    });

    let mut device = Device::new();
    let router = start_router(test_config(), &device);
    let mut client = TcpClient::new(device_addr(40001), remote, 7000);
    client.connect(&mut device).await;

    let start = client.seq;
    let hello = client.data(b"hello");
    let world = client.data(b"world");

    device.inject(world);
    let dup = device.expect(|p| p.has_flags(TcpFlags::ACK)).await;
    assert_eq!(dup.tcp().ack, start);

    device.inject(hello);
    device
        .expect(|p| p.has_flags(TcpFlags::ACK) && p.tcp().ack == start + 10)
        .await;

    device.inject(client.fin());
    let received = tokio::time::timeout(Duration::from_secs(5), rx)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(received, b"helloworld");

    router.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn remote_close_tears_down_session() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let remote = listener.local_addr().unwrap();
    tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        drop(stream);
    });

    let mut device = Device::new();
    let router = start_router(test_config(), &device);
    let mut client = TcpClient::new(device_addr(40002), remote, 1);
    client.connect(&mut device).await;

    let fin = device
        .expect(|p| p.view.tcp.map_or(false, |t| t.flags.contains(TcpFlags::FIN)))
        .await;
    assert_eq!(fin.tcp().flags, TcpFlags::FIN | TcpFlags::ACK);
    assert_eq!(fin.tcp().seq, client.ack);

    client.ack = client.ack.wrapping_add(1);
    device.inject(client.fin());
    let last = device.expect(|p| p.has_flags(TcpFlags::ACK)).await;
    assert_eq!(last.tcp().ack, client.seq);

    eventually("session removal", || router.active_sessions() == 0).await;
    device.expect_silence(Duration::from_millis(100)).await;
    let stats = router.metrics().snapshot();
    assert_eq!(stats.tcp_resets_sent_total, 0);
    assert_eq!(stats.tcp_sessions_active, 0);
    assert_eq!(stats.tcp_sessions_total, 1);

    router.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn refused_connect_resets_device() {
    let remote = {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        listener.local_addr().unwrap()
    };

    let mut device = Device::new();
    let router = start_router(test_config(), &device);
    let client = TcpClient::new(device_addr(40003), remote, 500);
    device.inject(client.syn());

    let rst = device.next_packet().await;
    assert_eq!(rst.tcp().flags, TcpFlags::RST | TcpFlags::ACK);
    assert_eq!(rst.tcp().ack, 501);
    assert_eq!(rst.view.source_addr(), remote);

    eventually("session removal", || router.active_sessions() == 0).await;
    assert_eq!(router.metrics().snapshot().tcp_connect_fail_total, 1);

    router.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn device_data_after_remote_close_reaches_remote() {
    let mut device = Device::new();
    let router = start_router(test_config(), &device);

    // The final segment both carries data and completes the close; repeat to cover the
    // interleavings of the upstream writer and the teardown.
    for round in 0..8u16 {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let remote = listener.local_addr().unwrap();
        let (tx, rx) = oneshot::channel();
        tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            stream.shutdown().await.unwrap();
            let mut received = Vec::new();
            stream.read_to_end(&mut received).await.unwrap();
            let _ = tx.send(received);
        });

        let mut client = TcpClient::new(device_addr(41000 + round), remote, 1000);
        client.connect(&mut device).await;
        let fin = device
            .expect(|p| p.view.tcp.map_or(false, |t| t.flags.contains(TcpFlags::FIN)))
            .await;
        client.ack = fin.tcp().seq.wrapping_add(1);
        device.inject(client.ack_segment());

        device.inject(client.segment_at(
            client.seq,
            TcpFlags::FIN | TcpFlags::ACK | TcpFlags::PSH,
            b"bye",
        ));
        let ack = device.expect(|p| p.has_flags(TcpFlags::ACK)).await;
        assert_eq!(ack.tcp().ack, client.seq.wrapping_add(4));

        let received = tokio::time::timeout(Duration::from_secs(5), rx)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(received, b"bye", "round {round}");
        eventually("session removal", || router.active_sessions() == 0).await;
    }

    let stats = router.metrics().snapshot();
    assert_eq!(stats.tcp_resets_sent_total, 0);
    assert_eq!(stats.tcp_bytes_uplink, 8 * 3);

    router.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn device_reset_aborts_upstream() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let remote = listener.local_addr().unwrap();
    let (tx, rx) = oneshot::channel();
    tokio::spawn(async move {
        let (mut stream, _) = listener.accept().await.unwrap();
        let mut buf = [0u8; 16];
        let res = stream.read(&mut buf).await;
        let _ = tx.send(res.map_err(|err| err.kind()));
    });

    let mut device = Device::new();
    let router = start_router(test_config(), &device);
    let mut client = TcpClient::new(device_addr(40004), remote, 42);
    client.connect(&mut device).await;
    assert_eq!(router.active_sessions(), 1);

    device.inject(client.segment_at(client.seq, TcpFlags::RST, &[]));
    let read = tokio::time::timeout(Duration::from_secs(5), rx)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(read, Err(io::ErrorKind::ConnectionReset));

    eventually("session removal", || router.active_sessions() == 0).await;
    // The device already gave up; it gets no reply.
    device.expect_silence(Duration::from_millis(200)).await;
    assert_eq!(router.metrics().snapshot().tcp_resets_sent_total, 0);

    router.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn segment_without_session_is_reset() {
    let mut device = Device::new();
    let router = start_router(test_config(), &device);

    let mut client = TcpClient::new(device_addr(40005), "127.0.0.1:9".parse().unwrap(), 500);
    client.ack = 777;
    device.inject(client.segment_at(500, TcpFlags::ACK | TcpFlags::PSH, b"stale"));

    let rst = device.next_packet().await;
    assert_eq!(rst.tcp().flags, TcpFlags::RST);
    assert_eq!(rst.tcp().seq, 777);
    assert_eq!(router.active_sessions(), 0);

    router.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn downlink_is_cut_to_device_mss() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let remote = listener.local_addr().unwrap();
    let body: Vec<u8> = (0..3000u32).map(|i| (i % 251) as u8).collect();
    let sent = body.clone();
    tokio::spawn(async move {
        let (mut stream, _) = listener.accept().await.unwrap();
        stream.write_all(&sent).await.unwrap();
        // Keep the connection open until the test ends.
        let mut sink = Vec::new();
        let _ = stream.read_to_end(&mut sink).await;
    });

    let mut device = Device::new();
    let router = start_router(test_config(), &device);
    let mut client = TcpClient::new(device_addr(40006), remote, 9);
    client.connect(&mut device).await;

    let mut received = Vec::new();
    let mut next_seq = client.ack;
    while received.len() < body.len() {
        let pkt = device.expect(|p| !p.payload().is_empty()).await;
        assert!(pkt.payload().len() <= 1400);
        assert_eq!(pkt.tcp().seq, next_seq);
        next_seq = next_seq.wrapping_add(pkt.payload().len() as u32);
        received.extend_from_slice(pkt.payload());
    }
    assert_eq!(received, body);
    assert_eq!(router.metrics().snapshot().tcp_bytes_downlink, 3000);

    router.stop().await;
}
