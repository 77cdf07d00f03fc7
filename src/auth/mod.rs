//! Basic authentication for protected routes.
//!
//! - **`credentials`**: the immutable username/password-hash store
//! - **`basic`**: `Authorization: Basic` decoding and verification

pub mod basic;
pub mod credentials;

pub use basic::{BasicCredentials, authorize};
pub use credentials::CredentialStore;
