use gatehouse::http::headers::HeaderMap;
use gatehouse::http::request::{Method, Request, RequestBuilder};

fn request(version: &str, headers: &[(&str, &str)]) -> Request {
    Request {
        method: Method::GET,
        path: "/".to_string(),
        version: version.to_string(),
        headers: headers.iter().copied().collect::<HeaderMap>(),
    }
}

#[test]
fn test_request_header_retrieval() {
    let req = request(
        "HTTP/1.1",
        &[("Host", "example.com"), ("Content-Type", "application/json")],
    );

    assert_eq!(req.header("Host"), Some("example.com"));
    assert_eq!(req.header("content-type"), Some("application/json"));
    assert_eq!(req.header("Missing"), None);
}

#[test]
fn test_request_keep_alive_http11_default() {
    // HTTP/1.1 defaults to keep-alive
    assert!(request("HTTP/1.1", &[]).keep_alive());
}

#[test]
fn test_request_keep_alive_close() {
    assert!(!request("HTTP/1.1", &[("Connection", "close")]).keep_alive());
    assert!(!request("HTTP/1.1", &[("connection", "Close")]).keep_alive());
}

#[test]
fn test_request_keep_alive_http10_opt_in() {
    assert!(!request("HTTP/1.0", &[]).keep_alive());
    assert!(request("HTTP/1.0", &[("Connection", "keep-alive")]).keep_alive());
}

#[test]
fn test_request_wants_upgrade() {
    let req = request(
        "HTTP/1.1",
        &[("Connection", "keep-alive, Upgrade"), ("Upgrade", "websocket")],
    );
    assert!(req.wants_upgrade());
    assert!(!request("HTTP/1.1", &[("Upgrade", "websocket")]).wants_upgrade());
}

#[test]
fn test_request_builder_defaults() {
    let req = RequestBuilder::new()
        .method(Method::DELETE)
        .path("/items/1")
        .build()
        .unwrap();

    assert_eq!(req.version, "HTTP/1.1");
    assert!(req.headers.is_empty());
}

#[test]
fn test_request_builder_requires_method_and_path() {
    assert!(RequestBuilder::new().path("/").build().is_err());
    assert!(RequestBuilder::new().method(Method::GET).build().is_err());
}
