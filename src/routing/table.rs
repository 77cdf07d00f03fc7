//! Route lookup.
//!
//! # Design Decisions
//! - Immutable after construction, shared between connections without locks
//! - Longest prefix wins; equal prefixes keep registration order
//! - Prefixes match the path only, never the query string
//! - Explicit `None` for no match rather than a silent default route

use std::fmt;

use crate::proxy::rewrite::HeaderRewriter;

/// Access policy attached to a route.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthPolicy {
    None,
    Basic { realm: String },
}

impl AuthPolicy {
    pub fn realm(&self) -> Option<&str> {
        match self {
            AuthPolicy::None => None,
            AuthPolicy::Basic { realm } => Some(realm),
        }
    }
}

/// Plain-HTTP upstream target.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Upstream {
    pub host: String,
    pub port: u16,
}

impl Upstream {
    /// Parses `host:port` or `http://host[:port][/]`.
    ///
    /// A bare address without a port is rejected; a URL without a port
    /// defaults to 80. `https` upstreams are not supported.
    pub fn parse(address: &str) -> Result<Self, String> {
        let (with_scheme, explicit) = if address.contains("://") {
            (address.to_string(), true)
        } else {
            (format!("http://{}", address), false)
        };

        let url = url::Url::parse(&with_scheme)
            .map_err(|e| format!("invalid upstream {:?}: {}", address, e))?;
        if url.scheme() != "http" {
            return Err(format!("unsupported upstream scheme {:?}", url.scheme()));
        }
        if !matches!(url.path(), "" | "/") || url.query().is_some() {
            return Err(format!("upstream {:?} must not carry a path", address));
        }
        let host = match url.host() {
            Some(url::Host::Ipv6(addr)) => format!("[{}]", addr),
            Some(host) => host.to_string(),
            None => return Err(format!("upstream {:?} has no host", address)),
        };
        let port = match (url.port(), explicit) {
            (Some(port), _) => port,
            (None, true) => 80,
            (None, false) if address.ends_with(":80") => 80,
            (None, false) => return Err(format!("upstream {:?} has no port", address)),
        };

        Ok(Self { host, port })
    }

    /// `host:port`, suitable for connecting and for the `Host` header.
    pub fn authority(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

impl fmt::Display for Upstream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// One path-prefix rule.
#[derive(Debug, Clone)]
pub struct Route {
    pub prefix: String,
    pub upstream: Upstream,
    pub auth: AuthPolicy,
    pub rewriter: HeaderRewriter,
    /// Replace the matched prefix with `/` before forwarding.
    pub strip_prefix: bool,
}

impl Route {
    pub fn new(prefix: impl Into<String>, upstream: Upstream) -> Self {
        Self {
            prefix: prefix.into(),
            upstream,
            auth: AuthPolicy::None,
            rewriter: HeaderRewriter::new(Vec::new()),
            strip_prefix: true,
        }
    }

    pub fn with_auth(mut self, auth: AuthPolicy) -> Self {
        self.auth = auth;
        self
    }

    pub fn with_rewriter(mut self, rewriter: HeaderRewriter) -> Self {
        self.rewriter = rewriter;
        self
    }

    pub fn with_strip_prefix(mut self, strip: bool) -> Self {
        self.strip_prefix = strip;
        self
    }

    /// Maps an inbound request target onto the upstream's target.
    ///
    /// With prefix stripping, `/postgrest/items?x=1` under `/postgrest/`
    /// becomes `/items?x=1`. The target must start with the route prefix.
    pub fn upstream_target(&self, target: &str) -> String {
        if !self.strip_prefix {
            return target.to_string();
        }
        let rest = target.strip_prefix(self.prefix.as_str()).unwrap_or(target);
        if rest.starts_with('/') {
            rest.to_string()
        } else {
            format!("/{}", rest)
        }
    }
}

/// Ordered set of routes, searched longest-prefix-first.
#[derive(Debug, Default)]
pub struct RouteTable {
    routes: Vec<Route>,
}

impl RouteTable {
    /// Builds the table, sorting by descending prefix length.
    ///
    /// The sort is stable, so among identical prefixes the one registered
    /// first is found first.
    pub fn new(mut routes: Vec<Route>) -> Self {
        routes.sort_by(|a, b| b.prefix.len().cmp(&a.prefix.len()));
        Self { routes }
    }

    /// Finds the most specific route whose prefix starts `path`.
    pub fn lookup(&self, path: &str) -> Option<&Route> {
        self.routes.iter().find(|r| path.starts_with(&r.prefix))
    }

    pub fn routes(&self) -> &[Route] {
        &self.routes
    }

    pub fn requires_auth(&self) -> bool {
        self.routes.iter().any(|r| r.auth != AuthPolicy::None)
    }

    pub fn len(&self) -> usize {
        self.routes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn up(port: u16) -> Upstream {
        Upstream {
            host: "127.0.0.1".into(),
            port,
        }
    }

    #[test]
    fn longest_prefix_wins() {
        let table = RouteTable::new(vec![
            Route::new("/", up(1)),
            Route::new("/api/", up(2)),
            Route::new("/api/v2/", up(3)),
        ]);

        assert_eq!(table.lookup("/api/v2/users").unwrap().upstream.port, 3);
        assert_eq!(table.lookup("/api/v1/users").unwrap().upstream.port, 2);
        assert_eq!(table.lookup("/index.html").unwrap().upstream.port, 1);
    }

    #[test]
    fn identical_prefixes_keep_registration_order() {
        let table = RouteTable::new(vec![
            Route::new("/short/", up(1)),
            Route::new("/dup/", up(2)),
            Route::new("/dup/", up(3)),
        ]);
        assert_eq!(table.lookup("/dup/x").unwrap().upstream.port, 2);
    }

    #[test]
    fn no_match_is_none() {
        let table = RouteTable::new(vec![Route::new("/postgrest/", up(3000))]);
        assert!(table.lookup("/unknown/path").is_none());
        assert!(table.lookup("/postgrest").is_none());
    }

    #[test]
    fn strips_prefix_into_upstream_target() {
        let route = Route::new("/postgrest/", up(3000));
        assert_eq!(route.upstream_target("/postgrest/items"), "/items");
        assert_eq!(route.upstream_target("/postgrest/?a=1"), "/?a=1");

        let route = Route::new("/api", up(1));
        assert_eq!(route.upstream_target("/api/x"), "/x");
        assert_eq!(route.upstream_target("/api"), "/");

        let route = Route::new("/keep/", up(1)).with_strip_prefix(false);
        assert_eq!(route.upstream_target("/keep/x"), "/keep/x");
    }

    #[test]
    fn parses_upstream_addresses() {
        assert_eq!(Upstream::parse("127.0.0.1:3000").unwrap(), up(3000));
        assert_eq!(Upstream::parse("http://127.0.0.1:3000/").unwrap(), up(3000));
        assert_eq!(Upstream::parse("http://localhost").unwrap().port, 80);
        assert_eq!(Upstream::parse("[::1]:8080").unwrap().host, "[::1]");
        assert!(Upstream::parse("https://example.com").is_err());
        assert!(Upstream::parse("localhost").is_err());
        assert!(Upstream::parse("http://h:1/sub").is_err());
    }
}
