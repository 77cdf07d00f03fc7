//! Upstream connections and outbound request construction.

use std::time::Duration;
use tokio::net::TcpStream;
use tokio::time::timeout;

use crate::error::ProxyError;
use crate::http::request::Request;
use crate::http::stream::BufferedStream;
use crate::proxy::rewrite::RewriteContext;
use crate::routing::{Route, Upstream};

/// Opens one connection per proxied request.
///
/// Connections are not pooled: each is owned by the request that opened it
/// and closed when that request completes or fails.
#[derive(Debug, Clone)]
pub struct UpstreamClient {
    /// Connection timeout duration
    connect_timeout: Duration,
    /// Idle timeout applied to every read and write on the connection
    idle_timeout: Duration,
}

impl UpstreamClient {
    pub fn new(connect_timeout: Duration, idle_timeout: Duration) -> Self {
        Self {
            connect_timeout,
            idle_timeout,
        }
    }

    /// Connects to `upstream`, bounded by the connect timeout.
    pub async fn connect(&self, upstream: &Upstream) -> Result<BufferedStream<TcpStream>, ProxyError> {
        let addr = upstream.authority();
        let stream = match timeout(self.connect_timeout, TcpStream::connect(&addr)).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(source)) => {
                return Err(ProxyError::UpstreamUnreachable {
                    upstream: addr,
                    source,
                });
            }
            Err(_) => return Err(ProxyError::UpstreamTimeout(addr)),
        };
        stream.set_nodelay(true)?;

        tracing::trace!(upstream = %addr, "Connected to upstream");
        Ok(BufferedStream::new(stream, self.idle_timeout))
    }

    /// Builds the request head sent to the route's upstream.
    ///
    /// The target has the route prefix stripped (if configured) and headers
    /// go through the route's rewriter. Body framing headers are untouched.
    pub fn build_upstream_request(route: &Route, request: &Request, ctx: &RewriteContext) -> Request {
        Request {
            method: request.method.clone(),
            path: route.upstream_target(&request.path),
            version: "HTTP/1.1".to_string(),
            headers: route.rewriter.apply(ctx, request.headers.clone()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::request::{Method, RequestBuilder};
    use crate::http::writer::serialize_request_head;
    use crate::proxy::rewrite::{HeaderOp, HeaderRewriter};

    fn ctx() -> RewriteContext {
        RewriteContext {
            remote_addr: "10.1.1.1".into(),
            scheme: "http".into(),
            host: "gw.local".into(),
            proxy_host: "127.0.0.1:3000".into(),
            request_uri: "/postgrest/items".into(),
            forwarded_for: None,
        }
    }

    #[test]
    fn test_build_upstream_request() {
        let route = Route::new("/postgrest/", Upstream::parse("127.0.0.1:3000").unwrap());
        let request = RequestBuilder::new()
            .method(Method::GET)
            .path("/postgrest/items")
            .header("User-Agent", "Test")
            .header("Connection", "keep-alive")
            .build()
            .unwrap();

        let out = UpstreamClient::build_upstream_request(&route, &request, &ctx());
        let request_str = String::from_utf8(serialize_request_head(&out)).unwrap();

        assert!(request_str.starts_with("GET /items HTTP/1.1\r\n"));
        assert!(request_str.contains("Host: 127.0.0.1:3000\r\n"));
        assert!(request_str.contains("User-Agent: Test\r\n"));
        assert!(request_str.contains("Connection: close\r\n"));
    }

    #[test]
    fn test_build_upstream_request_keeps_framing_headers() {
        let route = Route::new("/api/", Upstream::parse("127.0.0.1:8080").unwrap())
            .with_rewriter(HeaderRewriter::new(vec![HeaderOp::set("X-Real-IP", "$remote_addr").unwrap()]));
        let request = RequestBuilder::new()
            .method(Method::POST)
            .path("/api/data")
            .header("Content-Length", "2")
            .build()
            .unwrap();

        let out = UpstreamClient::build_upstream_request(&route, &request, &ctx());
        assert_eq!(out.headers.get("Content-Length"), Some("2"));
        assert_eq!(out.headers.get("X-Real-IP"), Some("10.1.1.1"));
    }

    #[test]
    fn test_build_upstream_request_drops_connection_listed_headers() {
        let route = Route::new("/api/", Upstream::parse("127.0.0.1:8080").unwrap());
        let request = RequestBuilder::new()
            .method(Method::GET)
            .path("/api/data")
            .header("Connection", "X-Secret-Hop")
            .header("X-Secret-Hop", "1")
            .build()
            .unwrap();

        let out = UpstreamClient::build_upstream_request(&route, &request, &ctx());
        assert_eq!(out.headers.get("X-Secret-Hop"), None);
        assert_eq!(out.headers.get("Connection"), Some("close"));
    }

    #[tokio::test]
    async fn test_connect_refused_is_unreachable() {
        // Bind then drop to get a port with nothing listening.
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let client = UpstreamClient::new(Duration::from_secs(2), Duration::from_secs(2));
        let upstream = Upstream {
            host: "127.0.0.1".into(),
            port,
        };
        let err = client.connect(&upstream).await.unwrap_err();
        assert!(matches!(err, ProxyError::UpstreamUnreachable { .. }));
    }
}
