//! Startup configuration.
//!
//! Loaded once from a YAML file, optionally overridden from the
//! environment, validated, then turned into the immutable route table and
//! credential store. Any problem here is fatal: the proxy never starts with
//! a partially valid configuration.

use serde::Deserialize;
use std::collections::HashSet;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::auth::CredentialStore;
use crate::error::ConfigError;
use crate::proxy::rewrite::{HeaderOp, HeaderRewriter};
use crate::routing::{AuthPolicy, Route, RouteTable, Upstream};

/// Comma-separated listen addresses replacing `server.listen`.
pub const LISTEN_ENV: &str = "GATEHOUSE_LISTEN";

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub auth: AuthConfig,
    pub routes: Vec<RouteConfig>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct ServerConfig {
    pub listen: Vec<String>,
    /// Value of `$scheme` in header templates.
    pub scheme: String,
    pub connect_timeout_ms: u64,
    pub idle_timeout_ms: u64,
    pub max_header_bytes: usize,
    pub shutdown_grace_ms: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: vec!["0.0.0.0:80".to_string(), "[::]:80".to_string()],
            scheme: "http".to_string(),
            connect_timeout_ms: 5_000,
            idle_timeout_ms: 60_000,
            max_header_bytes: 64 * 1024,
            shutdown_grace_ms: 10_000,
        }
    }
}

impl ServerConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_millis(self.idle_timeout_ms)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_millis(self.shutdown_grace_ms)
    }

    pub fn listen_addrs(&self) -> Result<Vec<SocketAddr>, ConfigError> {
        self.listen
            .iter()
            .map(|addr| {
                addr.trim()
                    .parse()
                    .map_err(|_| ConfigError::ListenAddress(addr.clone()))
            })
            .collect()
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AuthConfig {
    pub credentials_file: Option<PathBuf>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RouteConfig {
    pub prefix: String,
    pub upstream: String,
    #[serde(default)]
    pub auth: Option<RouteAuthConfig>,
    #[serde(default)]
    pub headers: Vec<HeaderOpConfig>,
    #[serde(default = "default_strip_prefix")]
    pub strip_prefix: bool,
}

fn default_strip_prefix() -> bool {
    true
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RouteAuthConfig {
    pub realm: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum HeaderActionKind {
    Set,
    Clear,
    PassThrough,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct HeaderOpConfig {
    pub name: String,
    pub action: HeaderActionKind,
    #[serde(default)]
    pub value: Option<String>,
}

impl HeaderOpConfig {
    fn to_op(&self) -> Result<HeaderOp, String> {
        match (self.action, &self.value) {
            (HeaderActionKind::Set, Some(value)) => HeaderOp::set(&self.name, value),
            (HeaderActionKind::Set, None) => Err(format!("set {} requires a value", self.name)),
            (HeaderActionKind::Clear, None) => HeaderOp::clear(&self.name),
            (HeaderActionKind::PassThrough, None) => HeaderOp::pass_through(&self.name),
            (_, Some(_)) => Err(format!("only set takes a value ({})", self.name)),
        }
    }
}

impl Config {
    /// Reads, overrides from the environment, and validates a config file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;

        let mut config = Self::from_yaml(&text)?;
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    pub fn from_yaml(text: &str) -> Result<Self, ConfigError> {
        Ok(serde_yaml::from_str(text)?)
    }

    pub fn apply_env_overrides(&mut self) {
        if let Ok(listen) = std::env::var(LISTEN_ENV) {
            let addrs: Vec<String> = listen
                .split(',')
                .map(str::trim)
                .filter(|a| !a.is_empty())
                .map(String::from)
                .collect();
            if !addrs.is_empty() {
                self.server.listen = addrs;
            }
        }
    }

    /// Checks everything that can be checked without touching the network.
    ///
    /// Building the route table re-validates each route; credentials are
    /// checked separately by [`Config::load_credentials`].
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.server.listen.is_empty() {
            return Err(ConfigError::Invalid("server.listen is empty".into()));
        }
        self.server.listen_addrs()?;
        if self.server.scheme.is_empty() {
            return Err(ConfigError::Invalid("server.scheme is empty".into()));
        }
        if self.server.connect_timeout_ms == 0 || self.server.idle_timeout_ms == 0 {
            return Err(ConfigError::Invalid("timeouts must be greater than zero".into()));
        }
        if self.server.max_header_bytes < 1024 {
            return Err(ConfigError::Invalid(
                "server.max_header_bytes must be at least 1024".into(),
            ));
        }
        if self.routes.is_empty() {
            return Err(ConfigError::Invalid("no routes configured".into()));
        }

        let mut protected = HashSet::new();
        for route in &self.routes {
            if let Some(auth) = &route.auth {
                if !protected.insert((auth.realm.as_str(), route.prefix.as_str())) {
                    return Err(route_error(
                        route,
                        format!("duplicate protected prefix in realm {:?}", auth.realm),
                    ));
                }
            }
        }

        self.build_routes().map(|_| ())
    }

    pub fn build_routes(&self) -> Result<RouteTable, ConfigError> {
        let routes = self
            .routes
            .iter()
            .map(RouteConfig::build)
            .collect::<Result<Vec<_>, _>>()?;
        Ok(RouteTable::new(routes))
    }

    /// Loads the credential store if any route needs it.
    ///
    /// Without protected routes an empty store is returned and the file,
    /// if configured, is still loaded so mistakes surface at startup.
    pub fn load_credentials(&self, routes: &RouteTable) -> Result<CredentialStore, ConfigError> {
        match &self.auth.credentials_file {
            Some(path) => Ok(CredentialStore::load(path)?),
            None if routes.requires_auth() => Err(ConfigError::MissingCredentials),
            None => Ok(CredentialStore::default()),
        }
    }
}

impl RouteConfig {
    fn build(&self) -> Result<Route, ConfigError> {
        if !self.prefix.starts_with('/') {
            return Err(route_error(self, "prefix must start with '/'".into()));
        }
        let upstream = Upstream::parse(&self.upstream).map_err(|reason| route_error(self, reason))?;

        let auth = match &self.auth {
            Some(auth) if auth.realm.trim().is_empty() => {
                return Err(route_error(self, "auth realm is empty".into()));
            }
            Some(auth) => AuthPolicy::Basic {
                realm: auth.realm.clone(),
            },
            None => AuthPolicy::None,
        };

        let ops = self
            .headers
            .iter()
            .map(HeaderOpConfig::to_op)
            .collect::<Result<Vec<_>, _>>()
            .map_err(|reason| route_error(self, reason))?;

        Ok(Route::new(self.prefix.clone(), upstream)
            .with_auth(auth)
            .with_rewriter(HeaderRewriter::new(ops))
            .with_strip_prefix(self.strip_prefix))
    }
}

fn route_error(route: &RouteConfig, reason: String) -> ConfigError {
    ConfigError::Route {
        prefix: route.prefix.clone(),
        reason,
    }
}
