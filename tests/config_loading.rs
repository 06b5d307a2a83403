use std::io::Write;

use plexus_core::config::{AppConfig, DuplicatePolicy, StoreBackend};
use plexus_core::error::PlexusError;

#[test]
fn test_load_full_config_from_file() {
    let toml_content = r#"
[engine]
max_concurrent_nodes = 8
event_bus_capacity = 256

[engine.update_retry]
max_attempts = 7
delay_ms = 5

[engine.dispatch_retry]
max_attempts = 4
delay_ms = 1000

[outcomes]
duplicate_policy = "shadow"

[store]
backend = "sqlite"
path = "/var/lib/plexus/plexus.db"

[locks]
ttl_secs = 90

[log]
filter = "plexus=debug"
"#;

    let mut tmp = tempfile::NamedTempFile::new().expect("create temp file");
    tmp.write_all(toml_content.as_bytes()).expect("write toml");

    let config = AppConfig::load(tmp.path()).expect("load config");

    assert_eq!(config.engine.max_concurrent_nodes, 8);
    assert_eq!(config.engine.event_bus_capacity, 256);
    assert_eq!(config.engine.update_retry.max_attempts, 7);
    assert_eq!(config.engine.update_retry.delay_ms, 5);
    assert_eq!(config.engine.dispatch_retry.max_attempts, 4);
    assert_eq!(config.engine.dispatch_retry.delay().as_secs(), 1);
    assert_eq!(config.outcomes.duplicate_policy, DuplicatePolicy::Shadow);
    assert_eq!(config.store.backend, StoreBackend::Sqlite);
    assert_eq!(config.store.path, "/var/lib/plexus/plexus.db");
    assert_eq!(config.locks.ttl().as_secs(), 90);
    assert_eq!(config.log_filter(), Some("plexus=debug"));
}

#[test]
fn test_env_var_expansion_in_config() {
    std::env::set_var("PLEXUS_TEST_DB_PATH", "/tmp/expanded.db");

    let toml_content = r#"
[store]
backend = "sqlite"
path = "${PLEXUS_TEST_DB_PATH}"
"#;

    let mut tmp = tempfile::NamedTempFile::new().expect("create temp file");
    tmp.write_all(toml_content.as_bytes()).expect("write toml");

    let config = AppConfig::load(tmp.path()).expect("load config");
    assert_eq!(config.store.path, "/tmp/expanded.db");

    std::env::remove_var("PLEXUS_TEST_DB_PATH");
}

#[test]
fn test_minimal_config_uses_defaults() {
    let toml_content = r#"
[locks]
ttl_secs = 10
"#;

    let tmp = plexus_test_utils::temp_config(toml_content);
    let config = AppConfig::load(tmp.path()).expect("load config");

    assert_eq!(config.locks.ttl_secs, 10);
    assert_eq!(config.engine.max_concurrent_nodes, 64);
    assert_eq!(config.engine.update_retry.max_attempts, 5);
    assert_eq!(config.outcomes.duplicate_policy, DuplicatePolicy::Reject);
    assert_eq!(config.store.backend, StoreBackend::Memory);
    assert_eq!(config.store.path, "plexus.db");
    assert!(config.log.is_none());
}

#[test]
fn test_missing_file_is_reported() {
    let err = AppConfig::load(std::path::Path::new("/nonexistent/plexus.toml")).unwrap_err();
    assert!(matches!(err, PlexusError::ConfigNotFound(_)));
}

#[test]
fn test_malformed_config_is_a_config_error() {
    let tmp = plexus_test_utils::temp_config("[engine]\nmax_concurrent_nodes = \"many\"\n");
    let err = AppConfig::load(tmp.path()).unwrap_err();
    assert!(matches!(err, PlexusError::Config(_)));
}

#[test]
fn test_config_round_trips_through_toml() {
    let mut config = AppConfig::default();
    config.outcomes.duplicate_policy = DuplicatePolicy::Shadow;
    let rendered = toml::to_string_pretty(&config).expect("render config");
    assert!(rendered.contains("duplicate_policy = \"shadow\""));

    let parsed: AppConfig = toml::from_str(&rendered).expect("parse rendered config");
    assert_eq!(parsed.outcomes.duplicate_policy, DuplicatePolicy::Shadow);
    assert_eq!(parsed.engine.max_concurrent_nodes, config.engine.max_concurrent_nodes);
}
