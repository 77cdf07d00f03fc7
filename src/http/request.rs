use crate::http::headers::HeaderMap;

/// HTTP request methods.
///
/// Every method is forwarded as-is; the proxy only treats `HEAD` specially
/// (its response never carries a body). Methods outside the common set
/// (`PROPFIND`, `MKCOL`, `LOCK`, ...) are kept as [`Method::Extension`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Method {
    /// GET - Retrieve a resource
    GET,
    /// POST - Create or submit data
    POST,
    /// PUT - Replace a resource
    PUT,
    /// DELETE - Delete a resource
    DELETE,
    /// HEAD - Like GET but without the response body
    HEAD,
    /// OPTIONS - Describe communication options
    OPTIONS,
    /// PATCH - Partial modification of a resource
    PATCH,
    /// TRACE - Message loop-back test
    TRACE,
    /// Any other method token, case preserved
    Extension(String),
}

/// The head of a parsed HTTP request: request line plus headers.
///
/// The body is not buffered here; it stays on the connection and is relayed
/// to the upstream according to its framing.
#[derive(Debug, Clone)]
pub struct Request {
    /// The HTTP method (GET, POST, etc.)
    pub method: Method,
    /// The request target (e.g., "/index.html?x=1")
    pub path: String,
    /// HTTP version (e.g. "HTTP/1.1")
    pub version: String,
    /// Request headers in arrival order
    pub headers: HeaderMap,
}

/// Builder for constructing Request objects.
pub struct RequestBuilder {
    method: Option<Method>,
    path: Option<String>,
    version: Option<String>,
    headers: HeaderMap,
}

impl Method {
    /// Parses an HTTP method from a string.
    ///
    /// Method names are case-sensitive; anything that is a valid token but
    /// not one of the common methods becomes an extension method.
    ///
    /// # Example
    ///
    /// ```
    /// # use gatehouse::http::request::Method;
    /// assert_eq!(Method::from_str("GET"), Some(Method::GET));
    /// assert_eq!(Method::from_str("get"), Some(Method::Extension("get".into())));
    /// assert_eq!(Method::from_str("GE T"), None);
    /// ```
    #[allow(clippy::should_implement_trait)]
    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "GET" => Some(Method::GET),
            "POST" => Some(Method::POST),
            "PUT" => Some(Method::PUT),
            "DELETE" => Some(Method::DELETE),
            "HEAD" => Some(Method::HEAD),
            "OPTIONS" => Some(Method::OPTIONS),
            "PATCH" => Some(Method::PATCH),
            "TRACE" => Some(Method::TRACE),
            other if is_token(other) => Some(Method::Extension(other.to_string())),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            Method::GET => "GET",
            Method::POST => "POST",
            Method::PUT => "PUT",
            Method::DELETE => "DELETE",
            Method::HEAD => "HEAD",
            Method::OPTIONS => "OPTIONS",
            Method::PATCH => "PATCH",
            Method::TRACE => "TRACE",
            Method::Extension(name) => name,
        }
    }
}

/// RFC 9110 `token`: one or more visible characters other than delimiters.
fn is_token(s: &str) -> bool {
    !s.is_empty()
        && s
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b"!#$%&'*+-.^_`|~".contains(&b))
}

impl Default for RequestBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl RequestBuilder {
    pub fn new() -> Self {
        Self {
            method: None,
            path: None,
            version: None,
            headers: HeaderMap::new(),
        }
    }

    pub fn method(mut self, method: Method) -> Self {
        self.method = Some(method);
        self
    }

    pub fn path(mut self, path: impl Into<String>) -> Self {
        self.path = Some(path.into());
        self
    }

    pub fn version(mut self, version: impl Into<String>) -> Self {
        self.version = Some(version.into());
        self
    }

    pub fn header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.append(key, value);
        self
    }

    pub fn build(self) -> Result<Request, &'static str> {
        Ok(Request {
            method: self.method.ok_or("method missing")?,
            path: self.path.ok_or("path missing")?,
            version: self.version.unwrap_or_else(|| "HTTP/1.1".to_string()),
            headers: self.headers,
        })
    }
}

impl Request {
    /// Retrieves a header value by name, ignoring case.
    pub fn header(&self, key: &str) -> Option<&str> {
        self.headers.get(key)
    }

    /// The path component of the request target, without the query string.
    pub fn path_only(&self) -> &str {
        self.path
            .split_once('?')
            .map(|(path, _)| path)
            .unwrap_or(&self.path)
    }

    /// Determines whether the client wants the connection kept open.
    ///
    /// HTTP/1.1 defaults to keep-alive unless `Connection: close` is sent;
    /// HTTP/1.0 only keeps the connection open on `Connection: keep-alive`.
    pub fn keep_alive(&self) -> bool {
        if self.version == "HTTP/1.0" {
            self.headers.has_token("Connection", "keep-alive")
        } else {
            !self.headers.has_token("Connection", "close")
        }
    }

    /// Whether the client asked to switch protocols (e.g. WebSocket).
    pub fn wants_upgrade(&self) -> bool {
        self.headers.contains("Upgrade") && self.headers.has_token("Connection", "upgrade")
    }
}
