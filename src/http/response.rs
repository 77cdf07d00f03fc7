use crate::http::headers::HeaderMap;

/// Status codes the proxy generates itself.
///
/// Upstream responses are relayed with whatever status they carry (see
/// [`ResponseHead`]); this enum only covers locally produced answers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusCode {
    /// 200 OK
    Ok,
    /// 400 Bad Request
    BadRequest,
    /// 401 Unauthorized
    Unauthorized,
    /// 404 Not Found
    NotFound,
    /// 431 Request Header Fields Too Large
    RequestHeaderFieldsTooLarge,
    /// 500 Internal Server Error
    InternalServerError,
    /// 502 Bad Gateway
    BadGateway,
    /// 504 Gateway Timeout
    GatewayTimeout,
}

impl StatusCode {
    /// Returns the numeric HTTP status code.
    ///
    /// # Example
    ///
    /// ```
    /// # use gatehouse::http::response::StatusCode;
    /// assert_eq!(StatusCode::Ok.as_u16(), 200);
    /// assert_eq!(StatusCode::NotFound.as_u16(), 404);
    /// ```
    pub fn as_u16(&self) -> u16 {
        match self {
            StatusCode::Ok => 200,
            StatusCode::BadRequest => 400,
            StatusCode::Unauthorized => 401,
            StatusCode::NotFound => 404,
            StatusCode::RequestHeaderFieldsTooLarge => 431,
            StatusCode::InternalServerError => 500,
            StatusCode::BadGateway => 502,
            StatusCode::GatewayTimeout => 504,
        }
    }

    /// Returns the standard HTTP reason phrase for this status code.
    pub fn reason_phrase(&self) -> &'static str {
        match self {
            StatusCode::Ok => "OK",
            StatusCode::BadRequest => "Bad Request",
            StatusCode::Unauthorized => "Unauthorized",
            StatusCode::NotFound => "Not Found",
            StatusCode::RequestHeaderFieldsTooLarge => "Request Header Fields Too Large",
            StatusCode::InternalServerError => "Internal Server Error",
            StatusCode::BadGateway => "Bad Gateway",
            StatusCode::GatewayTimeout => "Gateway Timeout",
        }
    }
}

/// A complete response generated by the proxy (errors, auth challenges).
#[derive(Debug)]
pub struct Response {
    /// The HTTP status code
    pub status: StatusCode,
    /// HTTP headers
    pub headers: HeaderMap,
    /// Response body as bytes
    pub body: Vec<u8>,
}

/// Builder for constructing HTTP responses in a fluent style.
///
/// # Example
///
/// ```ignore
/// let response = ResponseBuilder::new(StatusCode::Unauthorized)
///     .header("WWW-Authenticate", "Basic realm=\"radt\"")
///     .body(b"401 Unauthorized".to_vec())
///     .build();
/// ```
pub struct ResponseBuilder {
    status: StatusCode,
    headers: HeaderMap,
    body: Vec<u8>,
}

impl ResponseBuilder {
    /// Creates a new response builder with the specified status code.
    pub fn new(status: StatusCode) -> Self {
        Self {
            status,
            headers: HeaderMap::new(),
            body: Vec::new(),
        }
    }

    /// Adds or replaces a header.
    pub fn header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.set(key, value);
        self
    }

    /// Sets the response body.
    pub fn body(mut self, body: Vec<u8>) -> Self {
        self.body = body;
        self
    }

    /// Builds the final Response.
    ///
    /// Adds `Content-Length` from the body size if not already present.
    pub fn build(mut self) -> Response {
        if !self.headers.contains("Content-Length") {
            self.headers.set("Content-Length", self.body.len().to_string());
        }

        Response {
            status: self.status,
            headers: self.headers,
            body: self.body,
        }
    }
}

impl Response {
    /// A plain-text response whose body is the status line itself.
    pub fn status_page(status: StatusCode) -> Self {
        let body = format!("{} {}\n", status.as_u16(), status.reason_phrase());
        ResponseBuilder::new(status)
            .header("Content-Type", "text/plain; charset=utf-8")
            .body(body.into_bytes())
            .build()
    }

    /// Creates a 404 Not Found response.
    pub fn not_found() -> Self {
        Self::status_page(StatusCode::NotFound)
    }

    /// Creates a 401 challenge for the given Basic auth realm.
    pub fn unauthorized(realm: &str) -> Self {
        let realm = realm.replace('\\', "\\\\").replace('"', "\\\"");
        let mut response = Self::status_page(StatusCode::Unauthorized);
        response
            .headers
            .set("WWW-Authenticate", format!("Basic realm=\"{}\"", realm));
        response
    }
}

/// Status line and headers of a response received from an upstream.
#[derive(Debug, Clone)]
pub struct ResponseHead {
    /// HTTP version, e.g. "HTTP/1.1"
    pub version: String,
    pub status: u16,
    pub reason: String,
    pub headers: HeaderMap,
}

impl ResponseHead {
    /// Whether a body follows this head, given the request method.
    ///
    /// Responses to HEAD and 1xx, 204 and 304 responses never carry one.
    pub fn has_body(&self, request_method: &crate::http::request::Method) -> bool {
        !(*request_method == crate::http::request::Method::HEAD
            || (100..200).contains(&self.status)
            || self.status == 204
            || self.status == 304)
    }

    pub fn is_switching_protocols(&self) -> bool {
        self.status == 101
    }
}
