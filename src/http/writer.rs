use crate::http::headers::HeaderMap;
use crate::http::request::Request;
use crate::http::response::{Response, ResponseHead};

const HTTP_VERSION: &str = "HTTP/1.1";

fn write_headers(buf: &mut Vec<u8>, headers: &HeaderMap) {
    for (k, v) in headers.iter() {
        buf.extend_from_slice(k.as_bytes());
        buf.extend_from_slice(b": ");
        buf.extend_from_slice(v.as_bytes());
        buf.extend_from_slice(b"\r\n");
    }
    // Header/body separator
    buf.extend_from_slice(b"\r\n");
}

/// Serializes a locally generated response, body included.
pub fn serialize_response(resp: &Response) -> Vec<u8> {
    let mut buf = Vec::with_capacity(128 + resp.body.len());

    let status_line = format!(
        "{} {} {}\r\n",
        HTTP_VERSION,
        resp.status.as_u16(),
        resp.status.reason_phrase()
    );
    buf.extend_from_slice(status_line.as_bytes());
    write_headers(&mut buf, &resp.headers);
    buf.extend_from_slice(&resp.body);

    buf
}

/// Serializes a relayed response head. The body follows separately.
pub fn serialize_response_head(head: &ResponseHead) -> Vec<u8> {
    let mut buf = Vec::with_capacity(256);
    let status_line = format!("{} {} {}\r\n", HTTP_VERSION, head.status, head.reason);
    buf.extend_from_slice(status_line.as_bytes());
    write_headers(&mut buf, &head.headers);
    buf
}

/// Serializes an outbound request head. The body follows separately.
pub fn serialize_request_head(req: &Request) -> Vec<u8> {
    let mut buf = Vec::with_capacity(256);
    let request_line = format!("{} {} {}\r\n", req.method.as_str(), req.path, HTTP_VERSION);
    buf.extend_from_slice(request_line.as_bytes());
    write_headers(&mut buf, &req.headers);
    buf
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::response::StatusCode;

    #[test]
    fn serializes_status_page() {
        let bytes = serialize_response(&Response::status_page(StatusCode::NotFound));
        let text = String::from_utf8(bytes).unwrap();
        assert!(text.starts_with("HTTP/1.1 404 Not Found\r\n"));
        assert!(text.contains("Content-Length: 14\r\n"));
        assert!(text.ends_with("\r\n\r\n404 Not Found\n"));
    }
}
