//! HTTP Basic authentication (RFC 7617).
//!
//! ```text
//! Authorization: Basic <base64(username:password)>
//! ```

use base64::Engine;

use crate::auth::credentials::CredentialStore;
use crate::error::ProxyError;
use crate::http::headers::HeaderMap;

/// Decoded `username:password` pair from an `Authorization` header.
#[derive(Debug, PartialEq, Eq)]
pub struct BasicCredentials {
    pub username: String,
    pub password: String,
}

impl BasicCredentials {
    /// Decodes a header value of the form `Basic <base64>`.
    ///
    /// The scheme name is case-insensitive. Returns `None` for any other
    /// scheme, invalid base64, non-UTF-8 payloads or a missing colon.
    pub fn from_header(value: &str) -> Option<Self> {
        let (scheme, encoded) = value.trim().split_once(' ')?;
        if !scheme.eq_ignore_ascii_case("basic") {
            return None;
        }

        let decoded = base64::engine::general_purpose::STANDARD
            .decode(encoded.trim())
            .ok()?;
        let decoded = String::from_utf8(decoded).ok()?;
        let (username, password) = decoded.split_once(':')?;

        Some(Self {
            username: username.to_string(),
            password: password.to_string(),
        })
    }
}

/// Checks the request's Basic credentials against `store`.
///
/// Missing credentials yield [`ProxyError::AuthRequired`], undecodable or
/// wrong ones [`ProxyError::AuthInvalid`]; both carry the realm for the
/// challenge.
pub fn authorize(headers: &HeaderMap, store: &CredentialStore, realm: &str) -> Result<String, ProxyError> {
    let value = headers
        .get("Authorization")
        .ok_or_else(|| ProxyError::AuthRequired(realm.to_string()))?;

    let creds = BasicCredentials::from_header(value)
        .ok_or_else(|| ProxyError::AuthInvalid(realm.to_string()))?;

    if store.verify(&creds.username, &creds.password) {
        tracing::debug!(user = %creds.username, realm, "Basic auth: valid credentials");
        Ok(creds.username)
    } else {
        tracing::debug!(user = %creds.username, realm, "Basic auth: invalid credentials");
        Err(ProxyError::AuthInvalid(realm.to_string()))
    }
}
