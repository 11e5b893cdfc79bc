use std::io::Write;

use crate::config::models::{AppConfig, BroadcastBackend};

#[test]
fn test_default_config() {
    let config = AppConfig::default();
    assert!(config.validate().is_ok());

    assert_eq!(config.identity.freshness_window_seconds, 100);
    assert_eq!(config.identity.allocation_attempts, 3);
    assert_eq!(config.dispatcher.whitelist_ttl_seconds, 6 * 60 * 60);
    assert_eq!(config.dispatcher.blacklist_ttl_seconds, 5 * 60);
    assert_eq!(config.broadcast.backend, BroadcastBackend::Memory);
    assert!(!config.worker.enabled);
}

#[test]
fn test_config_from_toml() {
    let toml_content = r#"
[database]
url = "sqlite::memory:"
max_connections = 1

[dispatcher]
protocol_version = "v2"
broadcast_interval_seconds = 2
broadcast_backoff_max_seconds = 30

[identity]
freshness_window_seconds = 45

[broadcast]
backend = "redis"
redis_url = "redis://cache:6379"

[feature_flags.flags.revalidate_whitelisted_workers]
tenants = ["tenant-a"]
"#;

    let config = AppConfig::from_toml(toml_content).unwrap();
    assert_eq!(config.database.max_connections, 1);
    assert_eq!(config.dispatcher.protocol_version, "v2");
    assert_eq!(config.dispatcher.broadcast_interval_seconds, 2);
    // 未出现的字段保持默认值
    assert_eq!(config.dispatcher.max_broadcast_rounds, 20);
    assert_eq!(config.identity.freshness_window_seconds, 45);
    assert_eq!(config.broadcast.backend, BroadcastBackend::Redis);
    assert_eq!(
        config.feature_flags.flags["revalidate_whitelisted_workers"].tenants,
        vec!["tenant-a".to_string()]
    );
}

#[test]
fn test_backoff_cap_below_interval_rejected() {
    let toml_content = r#"
[dispatcher]
broadcast_interval_seconds = 10
broadcast_backoff_max_seconds = 5
"#;
    assert!(AppConfig::from_toml(toml_content).is_err());
}

#[test]
fn test_unknown_feature_flag_rejected() {
    let toml_content = r#"
[feature_flags.flags.no_such_flag]
enabled = true
"#;
    let err = AppConfig::from_toml(toml_content).unwrap_err();
    assert!(format!("{err:#}").contains("no_such_flag"));
}

#[test]
fn test_non_sqlite_database_rejected() {
    let mut config = AppConfig::default();
    config.database.url = "postgresql://localhost/dispatch".to_string();
    assert!(config.validate().is_err());
}

#[test]
fn test_load_from_file() {
    let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
    writeln!(
        file,
        r#"
[api]
bind_address = "127.0.0.1:9191"

[admission]
default_capacity = 4
"#
    )
    .unwrap();

    let config = AppConfig::load(file.path().to_str()).unwrap();
    assert_eq!(config.api.bind_address, "127.0.0.1:9191");
    assert_eq!(config.admission.default_capacity, 4);
    assert_eq!(config.identity.freshness_window_seconds, 100);
}

#[test]
fn test_load_missing_file_fails() {
    assert!(AppConfig::load(Some("/nonexistent/dispatch.toml")).is_err());
}

#[test]
fn test_to_toml_round_trip() {
    let config = AppConfig::default();
    let text = config.to_toml().unwrap();
    let parsed = AppConfig::from_toml(&text).unwrap();
    assert_eq!(parsed.dispatcher.protocol_version, config.dispatcher.protocol_version);
}
