use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;

use crate::error::ProxyError;
use crate::http::parser::{ParseError, parse_http_request};
use crate::http::request::Request;
use crate::http::response::Response;
use crate::http::stream::{BufferedStream, HeadError};
use crate::http::writer::serialize_response;
use crate::proxy::dispatcher::{Dispatcher, Outcome};
use crate::proxy::tunnel::tunnel;

/// One client connection, driven through its keep-alive lifecycle.
pub struct Connection<S> {
    stream: BufferedStream<S>,
    peer: SocketAddr,
    dispatcher: Arc<Dispatcher>,
    state: ConnectionState,
}

pub enum ConnectionState {
    Reading,
    Dispatching(Request),
    Tunnelling(BufferedStream<TcpStream>),
    Closed,
}

impl<S> Connection<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    pub fn new(stream: BufferedStream<S>, peer: SocketAddr, dispatcher: Arc<Dispatcher>) -> Self {
        Self {
            stream,
            peer,
            dispatcher,
            state: ConnectionState::Reading,
        }
    }

    pub async fn run(&mut self) -> anyhow::Result<()> {
        loop {
            match std::mem::replace(&mut self.state, ConnectionState::Closed) {
                ConnectionState::Reading => {
                    self.state = match self.read_request().await? {
                        Some(req) => ConnectionState::Dispatching(req),
                        None => ConnectionState::Closed,
                    };
                }

                ConnectionState::Dispatching(req) => {
                    self.state = match self.dispatcher.handle(req, &mut self.stream, self.peer).await {
                        Outcome::KeepAlive => ConnectionState::Reading, // go back for next request
                        Outcome::Close => ConnectionState::Closed,
                        Outcome::Upgraded(upstream) => ConnectionState::Tunnelling(upstream),
                    };
                }

                ConnectionState::Tunnelling(mut upstream) => {
                    let (sent, received) = tunnel(&mut self.stream, &mut upstream).await?;
                    tracing::debug!(peer = %self.peer, sent, received, "Tunnel closed");
                }

                ConnectionState::Closed => {
                    break;
                }
            }
        }

        Ok(())
    }

    /// Reads the next request head.
    ///
    /// Malformed heads are answered here with 400, oversized ones (too many
    /// bytes or too many header lines) with 431. Either way this ends
    /// the connection; no upstream is ever contacted for them.
    pub async fn read_request(&mut self) -> anyhow::Result<Option<Request>> {
        let max = self.dispatcher.max_header_bytes();
        let err = match self.stream.read_head(max, parse_http_request).await {
            Ok(req) => return Ok(req),
            Err(HeadError::Parse(ParseError::TooManyHeaders)) => ProxyError::HeaderTooLarge(max),
            Err(HeadError::Parse(e)) => ProxyError::MalformedRequest(e.to_string()),
            Err(HeadError::TooLarge(limit)) => ProxyError::HeaderTooLarge(limit),
            Err(HeadError::UnexpectedEof) => {
                tracing::debug!(peer = %self.peer, "Client closed mid-request");
                return Ok(None);
            }
            Err(HeadError::Io(e)) if e.kind() == std::io::ErrorKind::TimedOut => {
                tracing::debug!(peer = %self.peer, "Idle connection timed out");
                return Ok(None);
            }
            Err(HeadError::Io(e)) => return Err(e.into()),
        };
        tracing::warn!(peer = %self.peer, status = err.status().as_u16(), "Rejected request head: {}", err);

        let mut response = Response::status_page(err.status());
        response.headers.set("Connection", "close");
        self.stream.write_all(&serialize_response(&response)).await?;
        self.stream.flush().await?;
        Ok(None)
    }
}
