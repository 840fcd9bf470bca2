//! Shared utilities for integration tests.

#![allow(dead_code)]

use std::net::SocketAddr;
use std::time::Duration;

use netbalancer::config::{parse_config, ServerConfig};
use netbalancer::core::Backend;
use netbalancer::Server;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream, UdpSocket};

/// Start a TCP backend that answers every read with `<tag>:<data>`.
pub async fn start_tcp_echo(tag: &'static str) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        while let Ok((mut socket, _)) = listener.accept().await {
            tokio::spawn(async move {
                let mut buf = [0u8; 1024];
                loop {
                    match socket.read(&mut buf).await {
                        Ok(0) | Err(_) => break,
                        Ok(n) => {
                            let mut reply = format!("{}:", tag).into_bytes();
                            reply.extend_from_slice(&buf[..n]);
                            if socket.write_all(&reply).await.is_err() {
                                break;
                            }
                        }
                    }
                }
            });
        }
    });

    addr
}

/// Start a TCP backend that accepts connections and never sends a byte.
pub async fn start_silent_backend() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        let mut held = Vec::new();
        while let Ok((socket, _)) = listener.accept().await {
            held.push(socket);
        }
    });

    addr
}

/// Start a UDP backend that answers every datagram with `<tag>:<data>`.
pub async fn start_udp_echo(tag: &'static str) -> SocketAddr {
    let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let addr = socket.local_addr().unwrap();

    tokio::spawn(async move {
        let mut buf = [0u8; 1024];
        while let Ok((n, peer)) = socket.recv_from(&mut buf).await {
            let mut reply = format!("{}:", tag).into_bytes();
            reply.extend_from_slice(&buf[..n]);
            let _ = socket.send_to(&reply, peer).await;
        }
    });

    addr
}

/// Parse the body of a single server table. Sub-tables such as
/// `[discovery]` are nested under the server.
pub fn server_config(body: &str) -> ServerConfig {
    let mut doc = String::from("[servers.test]\n");
    for line in body.lines() {
        let line = line.trim();
        match line.strip_prefix('[') {
            Some(table) => doc.push_str(&format!("[servers.test.{}\n", table)),
            None => doc.push_str(&format!("{}\n", line)),
        }
    }
    let mut config = parse_config(&doc).unwrap();
    config.servers.remove("test").unwrap()
}

/// `static_list = [...]` entry for the given backends.
pub fn static_list(backends: &[SocketAddr]) -> String {
    let entries: Vec<String> = backends.iter().map(|a| format!("\"{}\"", a)).collect();
    format!("[{}]", entries.join(", "))
}

/// Poll the scheduler until it reports `n` backends.
pub async fn wait_for_backends(server: &Server, n: usize) -> Vec<Backend> {
    wait_until(server, |backends| backends.len() == n).await
}

/// Poll the scheduler until `done` holds for its backends.
pub async fn wait_until<F>(server: &Server, done: F) -> Vec<Backend>
where
    F: Fn(&[Backend]) -> bool,
{
    for _ in 0..200 {
        let backends = server.scheduler().backends().await.unwrap();
        if done(&backends) {
            return backends;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("backends never reached the expected state");
}

/// Send `msg` over TCP and return the first reply.
pub async fn tcp_roundtrip(addr: SocketAddr, msg: &[u8]) -> String {
    let mut stream = TcpStream::connect(addr).await.unwrap();
    stream.write_all(msg).await.unwrap();
    let mut buf = [0u8; 1024];
    let n = tokio::time::timeout(Duration::from_secs(2), stream.read(&mut buf))
        .await
        .expect("reply timed out")
        .unwrap();
    String::from_utf8_lossy(&buf[..n]).into_owned()
}

/// True when the peer closes `stream` without sending anything.
pub async fn closed_without_reply(stream: &mut TcpStream) -> bool {
    let mut buf = [0u8; 64];
    matches!(
        tokio::time::timeout(Duration::from_secs(2), stream.read(&mut buf)).await,
        Ok(Ok(0)) | Ok(Err(_))
    )
}
