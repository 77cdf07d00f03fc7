use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::{JoinError, JoinSet};
use tracing::info;

use crate::config::ServerConfig;
use crate::http::connection::Connection;
use crate::http::stream::BufferedStream;
use crate::proxy::Dispatcher;

const LISTEN_BACKLOG: i32 = 1024;

/// Pause after a failed `accept` (e.g. out of file descriptors).
const ACCEPT_ERROR_BACKOFF: Duration = Duration::from_millis(100);

/// Bound listeners plus the shared dispatcher.
pub struct Server {
    listeners: Vec<TcpListener>,
    dispatcher: Arc<Dispatcher>,
    idle_timeout: Duration,
    shutdown_grace: Duration,
}

impl Server {
    /// Binds every configured address. Any bind failure is fatal.
    pub async fn bind(cfg: &ServerConfig, dispatcher: Dispatcher) -> anyhow::Result<Self> {
        let mut listeners = Vec::new();
        for addr in cfg.listen_addrs()? {
            let listener = bind_listener(addr).with_context(|| format!("failed to bind {}", addr))?;
            info!("Listening on {}", listener.local_addr()?);
            listeners.push(listener);
        }

        Ok(Self {
            listeners,
            dispatcher: Arc::new(dispatcher),
            idle_timeout: cfg.idle_timeout(),
            shutdown_grace: cfg.shutdown_grace(),
        })
    }

    pub fn local_addrs(&self) -> Vec<SocketAddr> {
        self.listeners
            .iter()
            .filter_map(|l| l.local_addr().ok())
            .collect()
    }

    /// Accepts connections until `shutdown` resolves.
    ///
    /// Each connection runs in its own task. After shutdown, in-flight
    /// connections get the configured grace period and are then aborted,
    /// which closes their upstream sockets as well.
    pub async fn run(self, shutdown: impl Future<Output = ()>) -> anyhow::Result<()> {
        let (tx, mut rx) = mpsc::channel::<(TcpStream, SocketAddr)>(LISTEN_BACKLOG as usize);
        let mut acceptors = JoinSet::new();
        for listener in self.listeners {
            acceptors.spawn(accept_loop(listener, tx.clone()));
        }
        drop(tx);

        let mut connections = JoinSet::new();
        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                _ = &mut shutdown => {
                    info!("Shutdown signal received");
                    break;
                }

                accepted = rx.recv() => {
                    let Some((socket, peer)) = accepted else {
                        anyhow::bail!("all listeners stopped");
                    };
                    tracing::debug!("Accepted connection from {}", peer);

                    let dispatcher = self.dispatcher.clone();
                    let idle_timeout = self.idle_timeout;
                    connections.spawn(async move {
                        let _ = socket.set_nodelay(true);
                        let stream = BufferedStream::new(socket, idle_timeout);
                        let mut conn = Connection::new(stream, peer, dispatcher);
                        if let Err(e) = conn.run().await {
                            tracing::error!("Connection error from {}: {}", peer, e);
                        }
                    });
                }

                Some(res) = connections.join_next() => log_task_result(res),
            }
        }

        acceptors.abort_all();

        let in_flight = connections.len();
        if in_flight > 0 {
            info!(in_flight, "Waiting for in-flight connections");
            let drained = tokio::time::timeout(self.shutdown_grace, async {
                while let Some(res) = connections.join_next().await {
                    log_task_result(res);
                }
            })
            .await;
            if drained.is_err() {
                tracing::warn!(
                    remaining = connections.len(),
                    "Grace period elapsed, aborting connections"
                );
                connections.shutdown().await;
            }
        }

        Ok(())
    }
}

async fn accept_loop(listener: TcpListener, tx: mpsc::Sender<(TcpStream, SocketAddr)>) {
    loop {
        match listener.accept().await {
            Ok(accepted) => {
                if tx.send(accepted).await.is_err() {
                    return;
                }
            }
            Err(e) => {
                tracing::error!("Accept failed: {}", e);
                tokio::time::sleep(ACCEPT_ERROR_BACKOFF).await;
            }
        }
    }
}

/// A panicking connection task only takes down its own connection.
fn log_task_result(res: Result<(), JoinError>) {
    if let Err(e) = res {
        if e.is_panic() {
            tracing::error!("Connection task panicked: {}", e);
        }
    }
}

/// Binds with `SO_REUSEADDR`; IPv6 sockets are v6-only so that
/// `0.0.0.0:port` and `[::]:port` can be bound side by side.
fn bind_listener(addr: SocketAddr) -> std::io::Result<TcpListener> {
    let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))?;
    if addr.is_ipv6() {
        socket.set_only_v6(true)?;
    }
    socket.set_reuse_address(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    socket.listen(LISTEN_BACKLOG)?;
    TcpListener::from_std(socket.into())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn panicking_connection_does_not_stop_the_others() {
        let mut connections = JoinSet::new();
        connections.spawn(async { panic!("handler bug") });
        let (tx, rx) = tokio::sync::oneshot::channel();
        connections.spawn(async move {
            tokio::task::yield_now().await;
            let _ = tx.send("served");
        });

        let mut panics = 0;
        while let Some(res) = connections.join_next().await {
            if res.as_ref().is_err_and(|e| e.is_panic()) {
                panics += 1;
            }
            log_task_result(res);
        }
        assert_eq!(panics, 1);
        assert_eq!(rx.await.unwrap(), "served");
    }

    #[tokio::test]
    async fn wildcard_ipv6_leaves_ipv4_port_free() {
        let Ok(v6) = bind_listener("[::]:0".parse().unwrap()) else {
            return;
        };
        let port = v6.local_addr().unwrap().port();
        let v4 = bind_listener(SocketAddr::from(([0, 0, 0, 0], port)));
        assert!(v4.is_ok());
    }
}
