//! Gatehouse - minimal path-prefix reverse proxy
//!
//! Core library for routing, Basic auth, header rewriting and HTTP/1.x
//! request forwarding.

pub mod auth;
pub mod config;
pub mod error;
pub mod http;
pub mod proxy;
pub mod routing;
pub mod server;

pub use config::Config;
pub use error::{ConfigError, ProxyError};
