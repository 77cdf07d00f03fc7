//! Outbound request header rewriting.
//!
//! Each route carries an ordered list of [`HeaderOp`]s. Values may reference
//! connection variables (`$remote_addr`, `$scheme`, `$host`, `$proxy_host`,
//! `$proxy_add_x_forwarded_for`, `$request_uri`), which are resolved from a
//! [`RewriteContext`] captured once from the inbound request. Rewriting never
//! reads variables from the headers it is modifying, so applying the same
//! rewriter twice gives the same result as applying it once.

use std::fmt;
use std::net::SocketAddr;

use crate::http::headers::HeaderMap;
use crate::http::request::Request;

/// Headers whose framing the proxy owns; routes may not touch them.
const FRAMING_HEADERS: [&str; 2] = ["Content-Length", "Transfer-Encoding"];

/// Hop-by-hop headers removed unless a route names them.
const HOP_BY_HOP: [&str; 5] = ["Keep-Alive", "Proxy-Connection", "TE", "Trailer", "Upgrade"];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Var {
    RemoteAddr,
    Scheme,
    Host,
    ProxyHost,
    ProxyAddXForwardedFor,
    RequestUri,
}

impl Var {
    fn from_name(name: &str) -> Option<Self> {
        match name {
            "remote_addr" => Some(Var::RemoteAddr),
            "scheme" => Some(Var::Scheme),
            "host" => Some(Var::Host),
            "proxy_host" => Some(Var::ProxyHost),
            "proxy_add_x_forwarded_for" => Some(Var::ProxyAddXForwardedFor),
            "request_uri" => Some(Var::RequestUri),
            _ => None,
        }
    }

    fn name(&self) -> &'static str {
        match self {
            Var::RemoteAddr => "remote_addr",
            Var::Scheme => "scheme",
            Var::Host => "host",
            Var::ProxyHost => "proxy_host",
            Var::ProxyAddXForwardedFor => "proxy_add_x_forwarded_for",
            Var::RequestUri => "request_uri",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Segment {
    Literal(String),
    Var(Var),
}

/// A header value with `$variable` placeholders.
///
/// `${name}` delimits a variable that is directly followed by text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValueTemplate {
    segments: Vec<Segment>,
}

impl ValueTemplate {
    pub fn parse(template: &str) -> Result<Self, String> {
        let mut segments = Vec::new();
        let mut literal = String::new();
        let mut rest = template;

        while let Some(pos) = rest.find('$') {
            literal.push_str(&rest[..pos]);
            let after = &rest[pos + 1..];

            let (name, remainder) = if let Some(braced) = after.strip_prefix('{') {
                let end = braced
                    .find('}')
                    .ok_or_else(|| format!("unterminated variable in {:?}", template))?;
                (&braced[..end], &braced[end + 1..])
            } else {
                let end = after
                    .find(|c: char| !(c.is_ascii_alphanumeric() || c == '_'))
                    .unwrap_or(after.len());
                (&after[..end], &after[end..])
            };

            let var = Var::from_name(name)
                .ok_or_else(|| format!("unknown variable ${} in {:?}", name, template))?;
            if !literal.is_empty() {
                segments.push(Segment::Literal(std::mem::take(&mut literal)));
            }
            segments.push(Segment::Var(var));
            rest = remainder;
        }

        literal.push_str(rest);
        if !literal.is_empty() {
            segments.push(Segment::Literal(literal));
        }
        Ok(Self { segments })
    }

    pub fn render(&self, ctx: &RewriteContext) -> String {
        let mut out = String::new();
        for segment in &self.segments {
            match segment {
                Segment::Literal(text) => out.push_str(text),
                Segment::Var(var) => out.push_str(&ctx.resolve(*var)),
            }
        }
        out
    }
}

impl fmt::Display for ValueTemplate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for segment in &self.segments {
            match segment {
                Segment::Literal(text) => f.write_str(text)?,
                Segment::Var(var) => write!(f, "${{{}}}", var.name())?,
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HeaderAction {
    /// Replace (or insert) the header with the rendered template.
    Set(ValueTemplate),
    /// Remove the header entirely.
    Clear,
    /// Forward whatever the client sent.
    PassThrough,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HeaderOp {
    pub name: String,
    pub action: HeaderAction,
}

impl HeaderOp {
    pub fn new(name: impl Into<String>, action: HeaderAction) -> Result<Self, String> {
        let name = name.into();
        if name.is_empty()
            || !name
                .bytes()
                .all(|b| b.is_ascii_alphanumeric() || b"!#$%&'*+-.^_`|~".contains(&b))
        {
            return Err(format!("invalid header name {:?}", name));
        }
        if is_framing_header(&name) {
            return Err(format!("{} is managed by the proxy and cannot be rewritten", name));
        }
        Ok(Self { name, action })
    }

    pub fn set(name: &str, template: &str) -> Result<Self, String> {
        Self::new(name, HeaderAction::Set(ValueTemplate::parse(template)?))
    }

    pub fn clear(name: &str) -> Result<Self, String> {
        Self::new(name, HeaderAction::Clear)
    }

    pub fn pass_through(name: &str) -> Result<Self, String> {
        Self::new(name, HeaderAction::PassThrough)
    }
}

fn is_framing_header(name: &str) -> bool {
    FRAMING_HEADERS.iter().any(|h| h.eq_ignore_ascii_case(name))
}

/// Values available to header templates, captured from one inbound request.
#[derive(Debug, Clone)]
pub struct RewriteContext {
    pub remote_addr: String,
    pub scheme: String,
    /// Host the client asked for, without port.
    pub host: String,
    /// `host:port` of the upstream.
    pub proxy_host: String,
    pub request_uri: String,
    /// `X-Forwarded-For` as received from the client.
    pub forwarded_for: Option<String>,
}

impl RewriteContext {
    pub fn from_request(req: &Request, peer: SocketAddr, scheme: &str, proxy_host: &str) -> Self {
        let host = req
            .header("Host")
            .map(strip_port)
            .filter(|h| !h.is_empty())
            .unwrap_or_else(|| strip_port(proxy_host))
            .to_string();

        let forwarded_for = {
            let values: Vec<&str> = req.headers.get_all("X-Forwarded-For").collect();
            (!values.is_empty()).then(|| values.join(", "))
        };

        Self {
            remote_addr: peer.ip().to_string(),
            scheme: scheme.to_string(),
            host,
            proxy_host: proxy_host.to_string(),
            request_uri: req.path.clone(),
            forwarded_for,
        }
    }

    fn resolve(&self, var: Var) -> String {
        match var {
            Var::RemoteAddr => self.remote_addr.clone(),
            Var::Scheme => self.scheme.clone(),
            Var::Host => self.host.clone(),
            Var::ProxyHost => self.proxy_host.clone(),
            Var::RequestUri => self.request_uri.clone(),
            Var::ProxyAddXForwardedFor => match &self.forwarded_for {
                Some(existing) => format!("{}, {}", existing, self.remote_addr),
                None => self.remote_addr.clone(),
            },
        }
    }
}

fn strip_port(host: &str) -> &str {
    if host.starts_with('[') {
        // IPv6 literal: keep the brackets, drop ":port".
        return host.find(']').map(|end| &host[..=end]).unwrap_or(host);
    }
    host.rsplit_once(':').map(|(h, _)| h).unwrap_or(host)
}

/// A route's effective header operations, defaults included.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HeaderRewriter {
    ops: Vec<HeaderOp>,
}

impl HeaderRewriter {
    /// Combines `route_ops` with the proxy defaults.
    ///
    /// Unless the route names them itself, `Host` is set to `$proxy_host`,
    /// `Connection` to `close`, and the other hop-by-hop headers are
    /// cleared. Defaults run first so route ops always win.
    pub fn new(route_ops: Vec<HeaderOp>) -> Self {
        let named = |name: &str| route_ops.iter().any(|op| op.name.eq_ignore_ascii_case(name));
        let mut ops = Vec::new();

        if !named("Host") {
            ops.push(HeaderOp {
                name: "Host".into(),
                action: HeaderAction::Set(ValueTemplate {
                    segments: vec![Segment::Var(Var::ProxyHost)],
                }),
            });
        }
        if !named("Connection") {
            ops.push(HeaderOp {
                name: "Connection".into(),
                action: HeaderAction::Set(ValueTemplate {
                    segments: vec![Segment::Literal("close".into())],
                }),
            });
        }
        for header in HOP_BY_HOP {
            if !named(header) {
                ops.push(HeaderOp {
                    name: header.into(),
                    action: HeaderAction::Clear,
                });
            }
        }

        ops.extend(route_ops);
        Self { ops }
    }

    /// Applies every operation in order and returns the rewritten headers.
    ///
    /// Headers the client lists in its own `Connection` header are
    /// hop-by-hop and dropped first, unless an op passes them through.
    pub fn apply(&self, ctx: &RewriteContext, mut headers: HeaderMap) -> HeaderMap {
        let listed: Vec<String> = headers
            .get_all("Connection")
            .flat_map(|v| v.split(','))
            .map(str::trim)
            .filter(|t| !t.is_empty() && !is_framing_header(t) && !self.passes_through(t))
            .map(String::from)
            .collect();
        for name in listed {
            headers.remove(&name);
        }

        for op in &self.ops {
            match &op.action {
                HeaderAction::Set(template) => headers.set(op.name.clone(), template.render(ctx)),
                HeaderAction::Clear => {
                    headers.remove(&op.name);
                }
                HeaderAction::PassThrough => {}
            }
        }
        headers
    }

    pub fn ops(&self) -> &[HeaderOp] {
        &self.ops
    }

    /// True if the route forwards `Upgrade` and `Connection` from the client.
    pub fn allows_upgrade(&self) -> bool {
        self.passes_through("Upgrade") && self.passes_through("Connection")
    }

    /// Whether the last op naming `name` is a pass-through.
    fn passes_through(&self, name: &str) -> bool {
        self.ops
            .iter()
            .rev()
            .find(|op| op.name.eq_ignore_ascii_case(name))
            .is_some_and(|op| op.action == HeaderAction::PassThrough)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::request::{Method, RequestBuilder};

    fn ctx() -> RewriteContext {
        RewriteContext {
            remote_addr: "10.0.0.7".into(),
            scheme: "https".into(),
            host: "example.org".into(),
            proxy_host: "127.0.0.1:9001".into(),
            request_uri: "/minio/x".into(),
            forwarded_for: Some("1.2.3.4".into()),
        }
    }

    #[test]
    fn template_parsing_and_rendering() {
        let t = ValueTemplate::parse("for=$remote_addr;proto=${scheme}x").unwrap();
        assert_eq!(t.render(&ctx()), "for=10.0.0.7;proto=httpsx");
        assert_eq!(t.to_string(), "for=${remote_addr};proto=${scheme}x");
        assert!(ValueTemplate::parse("$nope").is_err());
        assert!(ValueTemplate::parse("${scheme").is_err());
    }

    #[test]
    fn forwarded_for_appends_client() {
        let t = ValueTemplate::parse("$proxy_add_x_forwarded_for").unwrap();
        assert_eq!(t.render(&ctx()), "1.2.3.4, 10.0.0.7");
    }

    #[test]
    fn framing_headers_cannot_be_rewritten() {
        assert!(HeaderOp::clear("content-length").is_err());
        assert!(HeaderOp::set("Transfer-Encoding", "identity").is_err());
        assert!(HeaderOp::clear("Bad Header").is_err());
    }

    #[test]
    fn set_clear_and_pass_through() {
        let rewriter = HeaderRewriter::new(vec![
            HeaderOp::set("X-Forwarded-Proto", "$scheme").unwrap(),
            HeaderOp::clear("Connection").unwrap(),
            HeaderOp::pass_through("X-Custom").unwrap(),
        ]);
        let headers: HeaderMap = [
            ("Host", "example.org"),
            ("Connection", "keep-alive"),
            ("X-Forwarded-Proto", "ftp"),
            ("X-Custom", "kept"),
            ("Keep-Alive", "timeout=5"),
        ]
        .into_iter()
        .collect();

        let out = rewriter.apply(&ctx(), headers);
        assert_eq!(out.get("x-forwarded-proto"), Some("https"));
        assert_eq!(out.get("X-Custom"), Some("kept"));
        assert_eq!(out.get("Host"), Some("127.0.0.1:9001"));
        assert!(!out.contains("Connection"));
        assert!(!out.contains("Keep-Alive"));
    }

    #[test]
    fn defaults_close_upstream_connection() {
        let out = HeaderRewriter::new(Vec::new()).apply(&ctx(), HeaderMap::new());
        assert_eq!(out.get("Connection"), Some("close"));
    }

    #[test]
    fn rewriting_is_idempotent() {
        let rewriter = HeaderRewriter::new(vec![
            HeaderOp::set("X-Forwarded-For", "$proxy_add_x_forwarded_for").unwrap(),
            HeaderOp::set("X-Real-IP", "$remote_addr").unwrap(),
            HeaderOp::clear("Cookie").unwrap(),
        ]);
        let headers: HeaderMap = [("X-Forwarded-For", "1.2.3.4"), ("Cookie", "a=b"), ("Accept", "*/*")]
            .into_iter()
            .collect();

        let once = rewriter.apply(&ctx(), headers);
        let twice = rewriter.apply(&ctx(), once.clone());
        assert_eq!(once, twice);
    }

    #[test]
    fn connection_listed_headers_are_dropped() {
        let rewriter = HeaderRewriter::new(vec![HeaderOp::pass_through("X-Kept-Hop").unwrap()]);
        let headers: HeaderMap = [
            ("Connection", "X-Secret-Hop, x-kept-hop"),
            ("X-Secret-Hop", "1"),
            ("X-Kept-Hop", "2"),
            ("Accept", "*/*"),
        ]
        .into_iter()
        .collect();

        let out = rewriter.apply(&ctx(), headers);
        assert!(!out.contains("X-Secret-Hop"));
        assert_eq!(out.get("X-Kept-Hop"), Some("2"));
        assert_eq!(out.get("Accept"), Some("*/*"));
        assert_eq!(out.get("Connection"), Some("close"));
        assert_eq!(rewriter.apply(&ctx(), out.clone()), out);
    }

    #[test]
    fn connection_cannot_strip_framing_headers() {
        let headers: HeaderMap = [("Connection", "Content-Length"), ("Content-Length", "3")]
            .into_iter()
            .collect();
        let out = HeaderRewriter::new(Vec::new()).apply(&ctx(), headers);
        assert_eq!(out.get("Content-Length"), Some("3"));
    }

    #[test]
    fn upgrade_requires_both_pass_throughs() {
        let only_upgrade = HeaderRewriter::new(vec![HeaderOp::pass_through("Upgrade").unwrap()]);
        assert!(!only_upgrade.allows_upgrade());

        let both = HeaderRewriter::new(vec![
            HeaderOp::pass_through("Upgrade").unwrap(),
            HeaderOp::pass_through("Connection").unwrap(),
        ]);
        assert!(both.allows_upgrade());
    }

    #[test]
    fn context_from_request() {
        let req = RequestBuilder::new()
            .method(Method::GET)
            .path("/minio/bucket?list")
            .header("Host", "files.example.org:8443")
            .header("X-Forwarded-For", "1.1.1.1")
            .header("x-forwarded-for", "2.2.2.2")
            .build()
            .unwrap();
        let peer: SocketAddr = "192.168.1.5:40000".parse().unwrap();
        let ctx = RewriteContext::from_request(&req, peer, "http", "127.0.0.1:9001");

        assert_eq!(ctx.host, "files.example.org");
        assert_eq!(ctx.remote_addr, "192.168.1.5");
        assert_eq!(ctx.request_uri, "/minio/bucket?list");
        assert_eq!(ctx.forwarded_for.as_deref(), Some("1.1.1.1, 2.2.2.2"));
    }
}
