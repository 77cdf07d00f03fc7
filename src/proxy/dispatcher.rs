//! Per-request proxy pipeline.
//!
//! ```text
//! framing check → route lookup → auth → header rewrite
//!     → connect upstream → request head + body → response head + body
//! ```
//!
//! Every step before the response head reaches the client can fail with a
//! [`ProxyError`], which is answered with a status response. Once the
//! upstream's head has been relayed, failures can only close the connection.

use std::net::SocketAddr;
use std::time::Instant;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;

use crate::auth::{CredentialStore, authorize};
use crate::config::Config;
use crate::error::{ConfigError, ProxyError};
use crate::http::body::{
    BodyFraming, RelayError, discard_body, relay_body, relay_dechunked, request_framing, response_framing,
};
use crate::http::parser::parse_http_response;
use crate::http::request::Request;
use crate::http::response::{Response, ResponseHead};
use crate::http::stream::{BufferedStream, HeadError};
use crate::http::writer::{serialize_request_head, serialize_response, serialize_response_head};
use crate::proxy::rewrite::RewriteContext;
use crate::proxy::upstream::UpstreamClient;
use crate::routing::{AuthPolicy, RouteTable};

/// Largest request body read and thrown away to keep a connection alive
/// after answering without forwarding.
const DISCARD_LIMIT: u64 = 64 * 1024;

/// Response headers managed per hop by the proxy.
const RESPONSE_HOP_BY_HOP: [&str; 4] = ["Connection", "Keep-Alive", "Proxy-Connection", "Upgrade"];

/// What the connection should do after a request.
pub enum Outcome {
    KeepAlive,
    Close,
    /// The upstream switched protocols; bytes are now tunnelled raw.
    Upgraded(BufferedStream<TcpStream>),
}

/// Shared, immutable request handler.
pub struct Dispatcher {
    routes: RouteTable,
    credentials: CredentialStore,
    upstream: UpstreamClient,
    scheme: String,
    max_header_bytes: usize,
}

impl Dispatcher {
    pub fn new(
        routes: RouteTable,
        credentials: CredentialStore,
        upstream: UpstreamClient,
        scheme: impl Into<String>,
        max_header_bytes: usize,
    ) -> Self {
        Self {
            routes,
            credentials,
            upstream,
            scheme: scheme.into(),
            max_header_bytes,
        }
    }

    /// Builds the route table and credential store from a validated config.
    pub fn from_config(config: &Config) -> Result<Self, ConfigError> {
        let routes = config.build_routes()?;
        let credentials = config.load_credentials(&routes)?;
        let upstream = UpstreamClient::new(
            config.server.connect_timeout(),
            config.server.idle_timeout(),
        );
        Ok(Self::new(
            routes,
            credentials,
            upstream,
            config.server.scheme.clone(),
            config.server.max_header_bytes,
        ))
    }

    pub fn credentials(&self) -> &CredentialStore {
        &self.credentials
    }

    pub fn routes(&self) -> &RouteTable {
        &self.routes
    }

    pub fn max_header_bytes(&self) -> usize {
        self.max_header_bytes
    }

    /// Handles one request whose head has already been read from `client`.
    pub async fn handle<S>(&self, request: Request, client: &mut BufferedStream<S>, peer: SocketAddr) -> Outcome
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let started = Instant::now();

        match self.forward(&request, client, peer).await {
            Ok((status, outcome)) => {
                tracing::info!(
                    peer = %peer,
                    method = request.method.as_str(),
                    path = %request.path,
                    status,
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "Request proxied"
                );
                outcome
            }
            Err(err) => self.fail(&request, client, peer, err, started).await,
        }
    }

    /// Answers a request that could not be forwarded.
    async fn fail<S>(
        &self,
        request: &Request,
        client: &mut BufferedStream<S>,
        peer: SocketAddr,
        err: ProxyError,
        started: Instant,
    ) -> Outcome
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let status = err.status();
        match &err {
            ProxyError::RouteNotFound(_) | ProxyError::AuthRequired(_) | ProxyError::AuthInvalid(_) => {
                tracing::info!(
                    peer = %peer,
                    method = request.method.as_str(),
                    path = %request.path,
                    status = status.as_u16(),
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "Request rejected: {}", err
                );
            }
            _ => {
                tracing::warn!(
                    peer = %peer,
                    method = request.method.as_str(),
                    path = %request.path,
                    status = status.as_u16(),
                    error = %err,
                    "Request failed"
                );
            }
        }

        if !err.is_reportable() {
            return Outcome::Close;
        }

        // The body was never read for these; drop it to reuse the connection.
        let keep_alive = match &err {
            ProxyError::RouteNotFound(_) | ProxyError::AuthRequired(_) | ProxyError::AuthInvalid(_) => {
                request.keep_alive()
                    && match request_framing(request) {
                        Ok(framing) => discard_body(framing, client, DISCARD_LIMIT).await,
                        Err(_) => false,
                    }
            }
            _ => false,
        };

        let mut response = match &err {
            ProxyError::AuthRequired(realm) | ProxyError::AuthInvalid(realm) => Response::unauthorized(realm),
            _ => Response::status_page(status),
        };
        if !keep_alive {
            response.headers.set("Connection", "close");
        }

        let bytes = serialize_response(&response);
        if let Err(e) = write_and_flush(client, &bytes).await {
            tracing::debug!(peer = %peer, error = %e, "Failed to send error response");
            return Outcome::Close;
        }

        if keep_alive { Outcome::KeepAlive } else { Outcome::Close }
    }

    /// Forwards the request; returns the relayed status and what to do next.
    async fn forward<S>(
        &self,
        request: &Request,
        client: &mut BufferedStream<S>,
        peer: SocketAddr,
    ) -> Result<(u16, Outcome), ProxyError>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let framing = request_framing(request).map_err(ProxyError::MalformedRequest)?;

        let route = self
            .routes
            .lookup(request.path_only())
            .ok_or_else(|| ProxyError::RouteNotFound(request.path_only().to_string()))?;

        // Auth is decided before any upstream I/O.
        if let AuthPolicy::Basic { realm } = &route.auth {
            authorize(&request.headers, &self.credentials, realm)?;
        }

        let ctx = RewriteContext::from_request(request, peer, &self.scheme, &route.upstream.authority());
        let mut outbound = UpstreamClient::build_upstream_request(route, request, &ctx);
        let upgrade = request.wants_upgrade() && route.rewriter.allows_upgrade();

        let expects_continue = outbound.headers.has_token("Expect", "100-continue");
        if expects_continue {
            outbound.headers.remove("Expect");
        }

        tracing::debug!(
            route = %route.prefix,
            upstream = %route.upstream,
            target = %outbound.path,
            "Forwarding request"
        );

        let mut upstream = self.upstream.connect(&route.upstream).await?;
        let upstream_name = route.upstream.to_string();
        let upstream_err = |e: std::io::Error| upstream_io_error(&upstream_name, e);

        upstream
            .write_all(&serialize_request_head(&outbound))
            .await
            .map_err(upstream_err)?;

        if expects_continue {
            write_and_flush(client, b"HTTP/1.1 100 Continue\r\n\r\n")
                .await
                .map_err(|e| ProxyError::ClientGone(e.to_string()))?;
        }

        relay_body(framing, client, &mut upstream)
            .await
            .map_err(|e| match e {
                RelayError::Source(e) => ProxyError::ClientGone(e.to_string()),
                RelayError::Sink(e) => upstream_err(e),
                RelayError::Malformed(msg) => ProxyError::MalformedRequest(msg),
            })?;

        let mut head = self.read_final_head(&mut upstream, client, &upstream_name).await?;

        if head.is_switching_protocols() {
            if !upgrade {
                return Err(ProxyError::UpstreamProtocol(
                    "unsolicited 101 Switching Protocols".into(),
                ));
            }
            write_and_flush(client, &serialize_response_head(&head))
                .await
                .map_err(|e| ProxyError::ClientGone(e.to_string()))?;
            return Ok((101, Outcome::Upgraded(upstream)));
        }

        let resp_framing = response_framing(&head, &request.method).map_err(ProxyError::UpstreamProtocol)?;
        // HTTP/1.0 clients cannot parse chunked encoding; they get the bare
        // payload, delimited by closing the connection.
        let dechunk = resp_framing == BodyFraming::Chunked && request.version == "HTTP/1.0";
        let keep_alive = request.keep_alive() && resp_framing != BodyFraming::UntilClose && !dechunk;
        prepare_response_headers(&mut head, keep_alive);
        if dechunk {
            head.headers.remove("Transfer-Encoding");
            head.headers.remove("Trailer");
        }

        // From here on the client has a status line; failures only close.
        if let Err(e) = client.write_all(&serialize_response_head(&head)).await {
            tracing::debug!(peer = %peer, error = %e, "Client went away before response head");
            return Ok((head.status, Outcome::Close));
        }

        let relayed = if dechunk {
            relay_dechunked(&mut upstream, client).await
        } else {
            relay_body(resp_framing, &mut upstream, client).await
        };
        match relayed {
            Ok(_) => {}
            Err(e) => {
                tracing::warn!(
                    peer = %peer,
                    upstream = %upstream_name,
                    error = %e,
                    "Response body relay aborted"
                );
                return Ok((head.status, Outcome::Close));
            }
        }

        let outcome = if keep_alive { Outcome::KeepAlive } else { Outcome::Close };
        Ok((head.status, outcome))
    }

    /// Reads the upstream's final response head, relaying interim 1xx heads.
    async fn read_final_head<S>(
        &self,
        upstream: &mut BufferedStream<TcpStream>,
        client: &mut BufferedStream<S>,
        upstream_name: &str,
    ) -> Result<ResponseHead, ProxyError>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        loop {
            let head = match upstream.read_head(self.max_header_bytes, parse_http_response).await {
                Ok(Some(head)) => head,
                Ok(None) | Err(HeadError::UnexpectedEof) => {
                    return Err(ProxyError::UpstreamProtocol(
                        "connection closed before response".into(),
                    ));
                }
                Err(HeadError::Parse(e)) => return Err(ProxyError::UpstreamProtocol(e.to_string())),
                Err(HeadError::TooLarge(n)) => {
                    return Err(ProxyError::UpstreamProtocol(format!(
                        "response head exceeds {} bytes",
                        n
                    )));
                }
                Err(HeadError::Io(e)) => return Err(upstream_io_error(upstream_name, e)),
            };

            if (100..200).contains(&head.status) && head.status != 101 {
                write_and_flush(client, &serialize_response_head(&head))
                    .await
                    .map_err(|e| ProxyError::ClientGone(e.to_string()))?;
                continue;
            }
            return Ok(head);
        }
    }
}

/// Strips upstream hop-by-hop headers and sets the client-side `Connection`.
fn prepare_response_headers(head: &mut ResponseHead, keep_alive: bool) {
    let listed: Vec<String> = head
        .headers
        .get_all("Connection")
        .flat_map(|v| v.split(','))
        .map(|t| t.trim().to_string())
        .filter(|t| !t.is_empty() && !t.eq_ignore_ascii_case("close") && !t.eq_ignore_ascii_case("keep-alive"))
        .collect();
    for name in listed {
        head.headers.remove(&name);
    }
    for name in RESPONSE_HOP_BY_HOP {
        head.headers.remove(name);
    }
    if !keep_alive {
        head.headers.set("Connection", "close");
    }
}

fn upstream_io_error(upstream: &str, e: std::io::Error) -> ProxyError {
    if e.kind() == std::io::ErrorKind::TimedOut {
        ProxyError::UpstreamTimeout(upstream.to_string())
    } else {
        ProxyError::UpstreamUnreachable {
            upstream: upstream.to_string(),
            source: e,
        }
    }
}

async fn write_and_flush<S>(stream: &mut BufferedStream<S>, bytes: &[u8]) -> std::io::Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    stream.write_all(bytes).await?;
    stream.flush().await
}
