//! Request and response head parsing.
//!
//! Tokenizing is done by `httparse`; this module turns its borrowed output
//! into owned [`Request`] / [`ResponseHead`] values and reports how many
//! bytes the head occupied so the caller can continue with the body.

use crate::http::headers::HeaderMap;
use crate::http::request::{Method, Request};
use crate::http::response::ResponseHead;

/// Maximum number of headers accepted in one head.
const MAX_HEADERS: usize = 100;

#[derive(Debug, PartialEq, Eq)]
pub enum ParseError {
    InvalidRequest,
    InvalidMethod,
    InvalidHeader,
    InvalidStatus,
    TooManyHeaders,
    Incomplete,
}

impl std::fmt::Display for ParseError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let msg = match self {
            ParseError::InvalidRequest => "invalid request line",
            ParseError::InvalidMethod => "invalid method token",
            ParseError::InvalidHeader => "invalid header",
            ParseError::InvalidStatus => "invalid status line",
            ParseError::TooManyHeaders => "too many headers",
            ParseError::Incomplete => "incomplete head",
        };
        f.write_str(msg)
    }
}

impl From<httparse::Error> for ParseError {
    fn from(err: httparse::Error) -> Self {
        match err {
            httparse::Error::HeaderName | httparse::Error::HeaderValue => ParseError::InvalidHeader,
            httparse::Error::Status => ParseError::InvalidStatus,
            httparse::Error::Token => ParseError::InvalidMethod,
            httparse::Error::TooManyHeaders => ParseError::TooManyHeaders,
            _ => ParseError::InvalidRequest,
        }
    }
}

/// Parses a request head from the start of `buf`.
///
/// Returns the request and the number of bytes consumed (request line,
/// headers and the terminating blank line). Body bytes are left untouched.
pub fn parse_http_request(buf: &[u8]) -> Result<(Request, usize), ParseError> {
    let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
    let mut req = httparse::Request::new(&mut headers);

    let consumed = match req.parse(buf)? {
        httparse::Status::Complete(n) => n,
        httparse::Status::Partial => return Err(ParseError::Incomplete),
    };

    let method = req
        .method
        .and_then(Method::from_str)
        .ok_or(ParseError::InvalidMethod)?;
    let path = req.path.ok_or(ParseError::InvalidRequest)?;
    if !path.starts_with('/') {
        return Err(ParseError::InvalidRequest);
    }
    let version = version_string(req.version.ok_or(ParseError::InvalidRequest)?);

    let request = Request {
        method,
        path: path.to_string(),
        version,
        headers: collect_headers(req.headers)?,
    };

    Ok((request, consumed))
}

/// Parses a response head from the start of `buf`.
pub fn parse_http_response(buf: &[u8]) -> Result<(ResponseHead, usize), ParseError> {
    let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
    let mut resp = httparse::Response::new(&mut headers);

    let consumed = match resp.parse(buf)? {
        httparse::Status::Complete(n) => n,
        httparse::Status::Partial => return Err(ParseError::Incomplete),
    };

    let head = ResponseHead {
        version: version_string(resp.version.ok_or(ParseError::InvalidStatus)?),
        status: resp.code.ok_or(ParseError::InvalidStatus)?,
        reason: resp.reason.unwrap_or("").to_string(),
        headers: collect_headers(resp.headers)?,
    };

    Ok((head, consumed))
}

fn version_string(minor: u8) -> String {
    format!("HTTP/1.{}", minor)
}

fn collect_headers(raw: &[httparse::Header<'_>]) -> Result<HeaderMap, ParseError> {
    let mut headers = HeaderMap::new();
    for header in raw {
        let value = std::str::from_utf8(header.value).map_err(|_| ParseError::InvalidHeader)?;
        headers.append(header.name, value.trim());
    }
    Ok(headers)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_simple_get() {
        let req = b"GET / HTTP/1.1\r\nHost: example.com\r\n\r\n";

        let (parsed, consumed) = parse_http_request(req).unwrap();

        assert_eq!(parsed.path, "/");
        assert_eq!(parsed.headers.get("Host").unwrap(), "example.com");
        assert_eq!(consumed, req.len());
    }

    #[test]
    fn body_bytes_are_not_consumed() {
        let req = b"POST /api HTTP/1.1\r\nContent-Length: 5\r\n\r\nhello";
        let (_, consumed) = parse_http_request(req).unwrap();
        assert_eq!(&req[consumed..], b"hello");
    }

    #[test]
    fn extension_method_is_kept() {
        let req = b"PROPFIND /minio/x HTTP/1.1\r\nDepth: 1\r\n\r\n";
        let (parsed, _) = parse_http_request(req).unwrap();
        assert_eq!(parsed.method, Method::Extension("PROPFIND".into()));
        assert_eq!(parsed.method.as_str(), "PROPFIND");
    }

    #[test]
    fn parse_response_head() {
        let resp = b"HTTP/1.1 201 Created\r\nContent-Length: 0\r\n\r\n";
        let (head, consumed) = parse_http_response(resp).unwrap();
        assert_eq!(head.status, 201);
        assert_eq!(head.reason, "Created");
        assert_eq!(consumed, resp.len());
    }
}
