//! End-to-end UDP balancing.

mod common;

use std::time::Duration;

use common::*;
use netbalancer::Server;
use tokio::net::UdpSocket;

async fn exchange(socket: &UdpSocket, msg: &[u8]) -> String {
    socket.send(msg).await.unwrap();
    let mut buf = [0u8; 1024];
    let n = tokio::time::timeout(Duration::from_secs(2), socket.recv(&mut buf))
        .await
        .expect("reply timed out")
        .unwrap();
    String::from_utf8_lossy(&buf[..n]).into_owned()
}

#[tokio::test]
async fn session_sticks_to_one_backend() {
    let a = start_udp_echo("a").await;
    let b = start_udp_echo("b").await;
    let cfg = server_config(&format!(
        r#"
        bind = "127.0.0.1:0"
        protocol = "udp"
        balance = "roundrobin"
        [discovery]
        kind = "static"
        static_list = {}
        "#,
        static_list(&[a, b])
    ));
    let server = Server::start("test", &cfg).await.unwrap();
    wait_for_backends(&server, 2).await;

    let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    client.connect(server.local_addr()).await.unwrap();

    let first = exchange(&client, b"one").await;
    let tag = &first[..2];
    assert!(tag == "a:" || tag == "b:");
    assert_eq!(exchange(&client, b"two").await, format!("{}two", tag));

    let backends = wait_until(&server, |b| b.iter().any(|b| b.stats.rx_bytes >= 10)).await;
    let used: Vec<_> = backends.iter().filter(|b| b.stats.total_connections > 0).collect();
    assert_eq!(used.len(), 1);

    server.stop();
}

#[tokio::test]
async fn single_packet_mode_answers_each_datagram() {
    let a = start_udp_echo("a").await;
    let cfg = server_config(&format!(
        r#"
        bind = "127.0.0.1:0"
        protocol = "udp"
        [udp]
        max_requests = 1
        max_responses = 1
        [discovery]
        kind = "static"
        static_list = {}
        "#,
        static_list(&[a])
    ));
    let server = Server::start("test", &cfg).await.unwrap();
    wait_for_backends(&server, 1).await;

    let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    client.connect(server.local_addr()).await.unwrap();
    assert_eq!(exchange(&client, b"q1").await, "a:q1");
    assert_eq!(exchange(&client, b"q2").await, "a:q2");

    let backends = wait_until(&server, |b| {
        b[0].stats.total_connections == 2 && b[0].stats.active_connections == 0
    })
    .await;
    assert_eq!(backends[0].stats.tx_bytes, 4);

    server.stop();
}

#[tokio::test]
async fn denied_datagrams_are_dropped() {
    let a = start_udp_echo("a").await;
    let cfg = server_config(&format!(
        r#"
        bind = "127.0.0.1:0"
        protocol = "udp"
        [access]
        default = "deny"
        [discovery]
        kind = "static"
        static_list = {}
        "#,
        static_list(&[a])
    ));
    let server = Server::start("test", &cfg).await.unwrap();
    wait_for_backends(&server, 1).await;

    let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    client.connect(server.local_addr()).await.unwrap();
    client.send(b"hi").await.unwrap();
    let mut buf = [0u8; 64];
    let reply = tokio::time::timeout(Duration::from_millis(300), client.recv(&mut buf)).await;
    assert!(reply.is_err());

    server.stop();
}
