//! Configuration loading tests
//!
//! File formats, partial files falling back to defaults, and `FERRY_*`
//! environment overrides.

#![allow(clippy::unwrap_used)]

use assert_matches::assert_matches;
use ferry_core::{FerryConfig, FerryError};
use serial_test::serial;
use std::io::Write;
use std::net::{IpAddr, Ipv4Addr};

fn write_config(suffix: &str, content: &str) -> tempfile::NamedTempFile {
    let mut file = tempfile::Builder::new().suffix(suffix).tempfile().unwrap();
    file.write_all(content.as_bytes()).unwrap();
    file
}

#[test]
fn test_load_toml_partial() {
    let file = write_config(
        ".toml",
        r#"
port = 4242
key_length = 32
"#,
    );

    let config = FerryConfig::load_from_file(file.path()).unwrap();
    assert_eq!(config.port, 4242);
    assert_eq!(config.key_length, 32);
    // Unset fields keep their defaults
    assert_eq!(
        config.pending_connection_timeout_ms,
        FerryConfig::default().pending_connection_timeout_ms
    );
    assert!(config.validate().is_ok());
}

#[test]
fn test_load_json() {
    let file = write_config(
        ".json",
        r#"{"bind_address": "127.0.0.1", "dial_timeout_ms": 250}"#,
    );

    let config = FerryConfig::load_from_file(file.path()).unwrap();
    assert_eq!(config.bind_address, IpAddr::V4(Ipv4Addr::LOCALHOST));
    assert_eq!(config.dial_timeout_ms, 250);
}

#[test]
fn test_invalid_toml() {
    let file = write_config(".toml", "port = \"not a number\"");
    assert_matches!(
        FerryConfig::load_from_file(file.path()),
        Err(FerryError::Configuration { .. })
    );
}

#[test]
fn test_unsupported_extension() {
    let file = write_config(".yaml", "port: 1");
    assert_matches!(
        FerryConfig::load_from_file(file.path()),
        Err(FerryError::Configuration { .. })
    );
}

#[test]
fn test_missing_file() {
    let result = FerryConfig::load_from_file(std::path::Path::new("/nonexistent/ferry.toml"));
    assert_matches!(result, Err(FerryError::Configuration { .. }));
}

#[test]
#[serial]
fn test_env_overrides() {
    std::env::set_var("FERRY_PORT", "7001");
    std::env::set_var("FERRY_PENDING_CONNECTION_TIMEOUT_MS", "1500");
    std::env::set_var("FERRY_ADDRESS_ECHO_URL", "http://echo.internal/ip");

    let mut config = FerryConfig::default();
    let result = config.merge_with_env();

    std::env::remove_var("FERRY_PORT");
    std::env::remove_var("FERRY_PENDING_CONNECTION_TIMEOUT_MS");
    std::env::remove_var("FERRY_ADDRESS_ECHO_URL");

    result.unwrap();
    assert_eq!(config.port, 7001);
    assert_eq!(config.pending_connection_timeout_ms, 1500);
    assert_eq!(config.address_echo_url, "http://echo.internal/ip");
}

#[test]
#[serial]
fn test_env_invalid_value() {
    std::env::set_var("FERRY_KEY_LENGTH", "lots");
    let mut config = FerryConfig::default();
    let result = config.merge_with_env();
    std::env::remove_var("FERRY_KEY_LENGTH");

    assert_matches!(result, Err(FerryError::Configuration { message }) if message.contains("FERRY_KEY_LENGTH"));
}
