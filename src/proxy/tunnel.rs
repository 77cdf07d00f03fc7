//! Bidirectional byte pump for upgraded (101) connections.

use std::io;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::time::timeout;

use crate::http::stream::{BufferedStream, idle_timeout_error};

const TUNNEL_BUF: usize = 8192;

enum Side {
    Client,
    Upstream,
}

/// Copies bytes both ways until both peers have closed.
///
/// Bytes already buffered on either side are delivered first. EOF from one
/// peer half-closes the other. The client's idle timeout bounds every wait;
/// when it fires both legs are abandoned.
///
/// Returns `(client_to_upstream, upstream_to_client)` byte counts.
pub async fn tunnel<A, B>(
    client: &mut BufferedStream<A>,
    upstream: &mut BufferedStream<B>,
) -> io::Result<(u64, u64)>
where
    A: AsyncRead + AsyncWrite + Unpin,
    B: AsyncRead + AsyncWrite + Unpin,
{
    let idle = client.idle_timeout();
    let mut sent = 0u64;
    let mut received = 0u64;

    let pending = client.consume(client.buffered().len());
    if !pending.is_empty() {
        upstream.write_all(&pending).await?;
        sent += pending.len() as u64;
    }
    let pending = upstream.consume(upstream.buffered().len());
    if !pending.is_empty() {
        client.write_all(&pending).await?;
        received += pending.len() as u64;
    }
    client.flush().await?;
    upstream.flush().await?;

    let mut client_buf = vec![0u8; TUNNEL_BUF];
    let mut upstream_buf = vec![0u8; TUNNEL_BUF];
    let mut client_open = true;
    let mut upstream_open = true;

    while client_open || upstream_open {
        let step = timeout(idle, async {
            tokio::select! {
                r = client.get_mut().read(&mut client_buf), if client_open => (Side::Client, r),
                r = upstream.get_mut().read(&mut upstream_buf), if upstream_open => (Side::Upstream, r),
            }
        })
        .await
        .map_err(|_| idle_timeout_error())?;

        match step {
            (Side::Client, Ok(0)) => {
                client_open = false;
                let _ = upstream.get_mut().shutdown().await;
            }
            (Side::Client, Ok(n)) => {
                upstream.write_all(&client_buf[..n]).await?;
                sent += n as u64;
            }
            (Side::Upstream, Ok(0)) => {
                upstream_open = false;
                let _ = client.get_mut().shutdown().await;
            }
            (Side::Upstream, Ok(n)) => {
                client.write_all(&upstream_buf[..n]).await?;
                received += n as u64;
            }
            (_, Err(e)) => return Err(e),
        }
    }

    Ok((sent, received))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::io::duplex;

    #[tokio::test]
    async fn pumps_both_directions_until_close() {
        let (mut client_peer, client_side) = duplex(1024);
        let (upstream_side, mut upstream_peer) = duplex(1024);
        let mut client = BufferedStream::new(client_side, Duration::from_secs(2));
        let mut upstream = BufferedStream::new(upstream_side, Duration::from_secs(2));

        let pump = tokio::spawn(async move { tunnel(&mut client, &mut upstream).await });

        client_peer.write_all(b"ping").await.unwrap();
        let mut buf = [0u8; 4];
        upstream_peer.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");

        upstream_peer.write_all(b"pong!").await.unwrap();
        let mut buf = [0u8; 5];
        client_peer.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"pong!");

        drop(client_peer);
        drop(upstream_peer);
        assert_eq!(pump.await.unwrap().unwrap(), (4, 5));
    }
}
