//! Configuration loading tests
//!
//! Tests that touch SETLIST_CONFIG or credential variables are marked
//! #[serial] so they never race each other.

use serial_test::serial;
use setlist_common::config::{
    resolve_config_path, BackoffSettings, ImportConfig, CONFIG_ENV_VAR,
};
use setlist_common::Error;
use std::env;
use std::io::Write;

fn write_config(content: &str) -> tempfile::NamedTempFile {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    file.write_all(content.as_bytes()).unwrap();
    file
}

#[test]
fn test_partial_toml_keeps_defaults() {
    let config = ImportConfig::from_toml_str(
        r#"
        [server]
        port = 6100

        [queues.artist_import]
        concurrency = 4
        backoff = { type = "fixed", delay_ms = 500 }
        "#,
    )
    .unwrap();

    assert_eq!(config.server.port, 6100);
    assert_eq!(config.queues.artist_import.concurrency, 4);
    assert_eq!(
        config.queues.artist_import.backoff,
        BackoffSettings::Fixed { delay_ms: 500 }
    );
    // Untouched sections fall back to compiled defaults
    let defaults = ImportConfig::default();
    assert_eq!(config.queues.artist_import.attempts, defaults.queues.artist_import.attempts);
    assert_eq!(config.import.event_batch_size, defaults.import.event_batch_size);
    assert_eq!(config.breaker.failure_threshold, defaults.breaker.failure_threshold);
}

#[test]
fn test_malformed_toml_is_config_error() {
    let err = ImportConfig::from_toml_str("[server\nport = ").unwrap_err();
    assert!(err.to_string().contains("Parse TOML failed"), "{err}");
}

#[test]
fn test_unreadable_file_is_io_error() {
    // A directory exists but cannot be read as a file
    let dir = tempfile::tempdir().unwrap();

    let err = ImportConfig::from_file(dir.path()).unwrap_err();

    match &err {
        Error::Io { path, .. } => assert_eq!(path, dir.path()),
        other => panic!("expected Io error, got {other:?}"),
    }
    assert!(err.to_string().starts_with("Read "), "{err}");
}

#[test]
fn test_zero_threshold_fails_validation() {
    let mut config = ImportConfig::default();
    config.breaker.failure_threshold = 0;
    assert!(config.validate().is_err());

    let mut config = ImportConfig::default();
    config.queues.venue_sync.concurrency = 0;
    let err = config.validate().unwrap_err();
    assert!(err.to_string().contains("venue_sync"), "{err}");
}

#[test]
#[serial]
fn test_explicit_missing_path_is_error() {
    let missing = std::path::Path::new("/nonexistent/setlist-import.toml");
    assert!(resolve_config_path(Some(missing)).is_err());
    assert!(ImportConfig::load(Some(missing)).is_err());
}

#[test]
#[serial]
fn test_env_var_selects_config_file() {
    let file = write_config("[server]\nport = 6200\n");
    env::set_var(CONFIG_ENV_VAR, file.path());

    let resolved = resolve_config_path(None).unwrap();
    let config = ImportConfig::load(None).unwrap();

    env::remove_var(CONFIG_ENV_VAR);
    assert_eq!(resolved.as_deref(), Some(file.path()));
    assert_eq!(config.server.port, 6200);
}

#[test]
#[serial]
fn test_cli_path_beats_env_var() {
    let from_env = write_config("[server]\nport = 6300\n");
    let from_cli = write_config("[server]\nport = 6400\n");
    env::set_var(CONFIG_ENV_VAR, from_env.path());

    let config = ImportConfig::load(Some(from_cli.path())).unwrap();

    env::remove_var(CONFIG_ENV_VAR);
    assert_eq!(config.server.port, 6400);
}

#[test]
#[serial]
fn test_credentials_from_environment() {
    let file = write_config("[credentials]\nticketmaster_api_key = \"from-toml\"\n");
    env::set_var("TICKETMASTER_API_KEY", "from-env");
    env::set_var("SETLISTFM_API_KEY", "  ");

    let config = ImportConfig::load(Some(file.path())).unwrap();

    env::remove_var("TICKETMASTER_API_KEY");
    env::remove_var("SETLISTFM_API_KEY");
    assert_eq!(config.credentials.ticketmaster_api_key.as_deref(), Some("from-env"));
    // Blank values do not clear the slot
    assert!(config.credentials.setlistfm_api_key.is_none());
}
