//! Listener tests: dual-stack binding and shutdown.

use std::net::SocketAddr;
use std::time::Duration;

use gatehouse::config::Config;
use gatehouse::proxy::Dispatcher;
use gatehouse::server::Server;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::oneshot;
use tokio::time::timeout;

const WAIT: Duration = Duration::from_secs(5);

/// A port that is free on both loopback families, or `None` without IPv6.
fn free_dual_stack_port() -> Option<u16> {
    for _ in 0..10 {
        let v4 = std::net::TcpListener::bind("127.0.0.1:0").ok()?;
        let port = v4.local_addr().ok()?.port();
        if std::net::TcpListener::bind(("::1", port)).is_ok() {
            return Some(port);
        }
        if std::net::TcpListener::bind("[::1]:0").is_err() {
            return None;
        }
    }
    None
}

fn config(listen: &[String]) -> Config {
    let listen = listen
        .iter()
        .map(|a| format!("'{}'", a))
        .collect::<Vec<_>>()
        .join(", ");
    let yaml = format!(
        r#"
server:
  listen: [{}]
  shutdown_grace_ms: 200
routes:
  - {{ prefix: /only/, upstream: '127.0.0.1:9' }}
"#,
        listen
    );
    let cfg = Config::from_yaml(&yaml).unwrap();
    cfg.validate().unwrap();
    cfg
}

async fn roundtrip(addr: SocketAddr, raw: &str) -> String {
    let mut stream = TcpStream::connect(addr).await.unwrap();
    stream.write_all(raw.as_bytes()).await.unwrap();
    let mut buf = Vec::new();
    timeout(WAIT, stream.read_to_end(&mut buf)).await.unwrap().unwrap();
    String::from_utf8_lossy(&buf).into_owned()
}

#[tokio::test]
async fn test_serves_ipv4_and_ipv6_on_the_same_port() {
    let Some(port) = free_dual_stack_port() else {
        eprintln!("IPv6 loopback unavailable, skipping");
        return;
    };
    let cfg = config(&[format!("127.0.0.1:{}", port), format!("[::1]:{}", port)]);
    let dispatcher = Dispatcher::from_config(&cfg).unwrap();
    let server = Server::bind(&cfg.server, dispatcher).await.unwrap();

    let addrs = server.local_addrs();
    assert_eq!(addrs.len(), 2);
    assert!(addrs.iter().any(|a| a.is_ipv4() && a.port() == port));
    assert!(addrs.iter().any(|a| a.is_ipv6() && a.port() == port));
    tokio::spawn(server.run(std::future::pending()));

    for addr in addrs {
        let response = roundtrip(addr, "GET /elsewhere HTTP/1.1\r\nConnection: close\r\n\r\n").await;
        assert!(
            response.starts_with("HTTP/1.1 404 Not Found\r\n"),
            "{}: {}",
            addr,
            response
        );
    }
}

#[tokio::test]
async fn test_run_returns_after_shutdown() {
    let cfg = config(&["127.0.0.1:0".to_string()]);
    let dispatcher = Dispatcher::from_config(&cfg).unwrap();
    let server = Server::bind(&cfg.server, dispatcher).await.unwrap();
    let addr = server.local_addrs()[0];

    let (stop, stopped) = oneshot::channel::<()>();
    let handle = tokio::spawn(server.run(async {
        let _ = stopped.await;
    }));

    let response = roundtrip(addr, "GET / HTTP/1.1\r\nConnection: close\r\n\r\n").await;
    assert!(response.starts_with("HTTP/1.1 404 Not Found\r\n"));

    stop.send(()).unwrap();
    timeout(WAIT, handle).await.unwrap().unwrap().unwrap();
}

#[tokio::test]
async fn test_bind_conflict_is_fatal() {
    let taken = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let port = taken.local_addr().unwrap().port();
    let cfg = config(&[format!("127.0.0.1:{}", port)]);
    let dispatcher = Dispatcher::from_config(&cfg).unwrap();
    assert!(Server::bind(&cfg.server, dispatcher).await.is_err());
}
