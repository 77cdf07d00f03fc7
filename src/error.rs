//! Error types
//!
//! Per-request failures are [`ProxyError`]s: they end one request (and
//! sometimes its connection) and map onto the status code sent back to the
//! client. Startup failures are [`ConfigError`]s and abort the process.

use crate::http::response::StatusCode;
use thiserror::Error;

/// A failure while handling one proxied request.
#[derive(Debug, Error)]
pub enum ProxyError {
    /// The request head or body framing could not be parsed.
    #[error("malformed request: {0}")]
    MalformedRequest(String),

    /// The request head exceeded `server.max_header_bytes`.
    #[error("request head exceeds {0} bytes")]
    HeaderTooLarge(usize),

    /// No route prefix matched the request path.
    #[error("no route for {0}")]
    RouteNotFound(String),

    /// The route requires Basic auth and no credentials were sent.
    #[error("authentication required for realm {0:?}")]
    AuthRequired(String),

    /// Credentials were sent but did not verify.
    #[error("invalid credentials for realm {0:?}")]
    AuthInvalid(String),

    /// The upstream refused or reset the connection.
    #[error("upstream {upstream} unreachable: {source}")]
    UpstreamUnreachable {
        upstream: String,
        #[source]
        source: std::io::Error,
    },

    /// Connecting to, or waiting on, the upstream took too long.
    #[error("upstream {0} timed out")]
    UpstreamTimeout(String),

    /// The upstream sent something that is not a valid HTTP/1.x response.
    #[error("invalid response from upstream: {0}")]
    UpstreamProtocol(String),

    /// The client went away or stalled past the idle timeout.
    #[error("client connection lost: {0}")]
    ClientGone(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl ProxyError {
    /// Status code answered to the client for this failure.
    pub fn status(&self) -> StatusCode {
        match self {
            ProxyError::MalformedRequest(_) => StatusCode::BadRequest,
            ProxyError::HeaderTooLarge(_) => StatusCode::RequestHeaderFieldsTooLarge,
            ProxyError::RouteNotFound(_) => StatusCode::NotFound,
            ProxyError::AuthRequired(_) | ProxyError::AuthInvalid(_) => StatusCode::Unauthorized,
            ProxyError::UpstreamUnreachable { .. } | ProxyError::UpstreamProtocol(_) => {
                StatusCode::BadGateway
            }
            ProxyError::UpstreamTimeout(_) => StatusCode::GatewayTimeout,
            ProxyError::ClientGone(_) | ProxyError::Io(_) => StatusCode::InternalServerError,
        }
    }

    /// Whether the client can still be sent a response after this error.
    ///
    /// Client-side I/O failures mean the socket is unusable.
    pub fn is_reportable(&self) -> bool {
        !matches!(self, ProxyError::ClientGone(_) | ProxyError::Io(_))
    }
}

/// Invalid configuration, fatal at startup.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config: {0}")]
    Parse(#[from] serde_yaml::Error),

    #[error("invalid listen address {0:?}")]
    ListenAddress(String),

    #[error("route {prefix:?}: {reason}")]
    Route { prefix: String, reason: String },

    #[error("routes require authentication but auth.credentials_file is not set")]
    MissingCredentials,

    #[error(transparent)]
    Credentials(#[from] CredentialError),

    #[error("{0}")]
    Invalid(String),
}

/// Problems loading the credential file.
#[derive(Debug, Error)]
pub enum CredentialError {
    #[error("failed to read credential file {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("line {line}: {reason}")]
    Malformed { line: usize, reason: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn maps_taxonomy_to_status_codes() {
        assert_eq!(
            ProxyError::MalformedRequest("x".into()).status().as_u16(),
            400
        );
        assert_eq!(ProxyError::RouteNotFound("/x".into()).status().as_u16(), 404);
        assert_eq!(ProxyError::AuthRequired("r".into()).status().as_u16(), 401);
        assert_eq!(ProxyError::AuthInvalid("r".into()).status().as_u16(), 401);
        assert_eq!(ProxyError::UpstreamTimeout("u".into()).status().as_u16(), 504);
        let unreachable = ProxyError::UpstreamUnreachable {
            upstream: "127.0.0.1:1".into(),
            source: std::io::Error::from(std::io::ErrorKind::ConnectionRefused),
        };
        assert_eq!(unreachable.status().as_u16(), 502);
    }

    #[test]
    fn client_side_failures_are_not_reportable() {
        assert!(!ProxyError::ClientGone("reset".into()).is_reportable());
        assert!(ProxyError::HeaderTooLarge(10).is_reportable());
    }
}
