use std::io::Write;

use gatehouse::auth::credentials::sha256_entry;
use gatehouse::config::{Config, LISTEN_ENV};
use gatehouse::error::ConfigError;
use gatehouse::proxy::Dispatcher;
use tempfile::NamedTempFile;

fn write_temp(contents: &str) -> NamedTempFile {
    let mut file = NamedTempFile::new().unwrap();
    file.write_all(contents.as_bytes()).unwrap();
    file
}

fn config_with_credentials(credentials: &NamedTempFile) -> NamedTempFile {
    write_temp(&format!(
        r#"
server:
  listen: ["127.0.0.1:8080"]
auth:
  credentials_file: {}
routes:
  - prefix: /postgrest/
    upstream: 127.0.0.1:3000
  - prefix: /radt/
    upstream: 127.0.0.1:5000
    auth: {{ realm: radt }}
"#,
        credentials.path().display()
    ))
}

#[test]
fn test_config_load_from_file() {
    let credentials = write_temp(&format!("alice:{}\n", sha256_entry("secret")));
    let file = config_with_credentials(&credentials);

    let cfg = Config::load(file.path()).unwrap();
    assert_eq!(cfg.routes.len(), 2);
    assert_eq!(cfg.server.scheme, "http");
    assert_eq!(cfg.server.connect_timeout_ms, 5_000);

    let dispatcher = Dispatcher::from_config(&cfg).unwrap();
    assert_eq!(dispatcher.routes().len(), 2);
    assert!(dispatcher.credentials().verify("alice", "secret"));
    assert!(!dispatcher.credentials().verify("alice", "wrong"));
}

#[test]
fn test_config_listen_override_from_env() {
    let credentials = write_temp(&format!("alice:{}\n", sha256_entry("secret")));
    let file = config_with_credentials(&credentials);

    unsafe {
        std::env::set_var(LISTEN_ENV, "0.0.0.0:3000, [::]:3000");
    }
    let cfg = Config::load(file.path());
    unsafe {
        std::env::remove_var(LISTEN_ENV);
    }

    let addrs = cfg.unwrap().server.listen_addrs().unwrap();
    assert_eq!(addrs.len(), 2);
    assert!(addrs[0].is_ipv4());
    assert!(addrs[1].is_ipv6());
    assert_eq!(addrs[1].port(), 3000);
}

#[test]
fn test_config_missing_file() {
    let result = Config::load("/nonexistent/gatehouse.yaml");
    assert!(matches!(result, Err(ConfigError::Read { .. })));
}

#[test]
fn test_config_invalid_upstream() {
    let file = write_temp("routes: [{ prefix: /a/, upstream: 'https://secure.local' }]");
    let result = Config::load(file.path());
    assert!(matches!(result, Err(ConfigError::Route { .. })));
}

#[test]
fn test_config_protected_route_without_credentials_file() {
    let file = write_temp("routes: [{ prefix: /radt/, upstream: '127.0.0.1:5000', auth: { realm: radt } }]");
    let cfg = Config::load(file.path()).unwrap();

    let result = Dispatcher::from_config(&cfg);
    assert!(matches!(result, Err(ConfigError::MissingCredentials)));
}

#[test]
fn test_config_malformed_credentials_file() {
    let credentials = write_temp("alice:plaintext-password\n");
    let file = config_with_credentials(&credentials);
    let cfg = Config::load(file.path()).unwrap();

    let result = Dispatcher::from_config(&cfg);
    assert!(matches!(result, Err(ConfigError::Credentials(_))));
}

#[test]
fn test_config_clone() {
    let file = write_temp("routes: [{ prefix: /, upstream: '127.0.0.1:3000' }]");
    let cfg1 = Config::load(file.path()).unwrap();
    let cfg2 = cfg1.clone();
    assert_eq!(cfg1.routes[0].prefix, cfg2.routes[0].prefix);
}
