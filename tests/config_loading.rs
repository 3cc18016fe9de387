use std::io::Write;

use cascade_core::config::AppConfig;
use cascade_core::error::CascadeError;

#[test]
fn test_load_full_config_from_file() {
    let toml_content = r#"
[engine]
database = "/tmp/cascade-test/cascade.db"
max_parallel_nodes = 8
node_timeout_secs = 90

[executor]
endpoint = "http://localhost:8700/execute"
api_key = "exec-key"
timeout_secs = 45

[reaper]
enabled = false
interval_secs = 30
stale_after_secs = 1200

[destinations]
webhook_timeout_secs = 5

[log]
log_dir = "/tmp/cascade-test/logs"
level = 3
"#;

    let mut tmp = tempfile::NamedTempFile::new().expect("create temp file");
    tmp.write_all(toml_content.as_bytes()).expect("write toml");

    let config = AppConfig::load(tmp.path()).expect("load config");

    assert_eq!(config.engine.max_parallel_nodes, 8);
    assert_eq!(config.engine.node_timeout_secs, 90);
    assert_eq!(
        config.database_path(),
        std::path::PathBuf::from("/tmp/cascade-test/cascade.db")
    );

    let executor = config.executor.as_ref().expect("executor present");
    assert_eq!(executor.endpoint, "http://localhost:8700/execute");
    assert_eq!(executor.api_key, Some("exec-key".to_string()));
    assert_eq!(executor.timeout_secs, 45);

    assert!(!config.reaper.enabled);
    assert_eq!(config.reaper.interval_secs, 30);
    assert_eq!(config.reaper.stale_after_secs, 1200);
    assert_eq!(config.destinations.webhook_timeout_secs, 5);

    let log = config.log.as_ref().expect("log present");
    assert!(log.enabled);
    assert_eq!(log.level, 3);
    assert_eq!(
        config.log_dir(),
        std::path::PathBuf::from("/tmp/cascade-test/logs")
    );
}

#[test]
fn test_env_var_expansion_in_config() {
    std::env::set_var("CASCADE_TEST_EXECUTOR_KEY", "expanded-key-value");

    let toml_content = r#"
[executor]
endpoint = "http://localhost:8700/execute"
api_key = "${CASCADE_TEST_EXECUTOR_KEY}"
"#;

    let mut tmp = tempfile::NamedTempFile::new().expect("create temp file");
    tmp.write_all(toml_content.as_bytes()).expect("write toml");

    let config = AppConfig::load(tmp.path()).expect("load config");
    assert_eq!(
        config.executor.expect("executor present").api_key,
        Some("expanded-key-value".to_string())
    );

    std::env::remove_var("CASCADE_TEST_EXECUTOR_KEY");
}

#[test]
fn test_empty_config_uses_defaults() {
    let mut tmp = tempfile::NamedTempFile::new().expect("create temp file");
    tmp.write_all(b"").expect("write toml");

    let config = AppConfig::load(tmp.path()).expect("load config");

    assert_eq!(config.engine.max_parallel_nodes, 4);
    assert_eq!(config.engine.node_timeout_secs, 300);
    assert!(config.executor.is_none());
    assert!(config.reaper.enabled);
    assert_eq!(config.reaper.interval_secs, 60);
    assert_eq!(config.reaper.stale_after_secs, 600);
    assert_eq!(config.destinations.webhook_timeout_secs, 15);
    assert!(config.log.is_none());
}

#[test]
fn test_invalid_values_are_rejected() {
    let toml_content = r#"
[engine]
max_parallel_nodes = 0
"#;

    let mut tmp = tempfile::NamedTempFile::new().expect("create temp file");
    tmp.write_all(toml_content.as_bytes()).expect("write toml");

    assert!(matches!(
        AppConfig::load(tmp.path()),
        Err(CascadeError::Config(_))
    ));
}

#[test]
fn test_missing_file_is_reported() {
    let result = AppConfig::load(std::path::Path::new("/nonexistent/cascade.toml"));
    assert!(matches!(result, Err(CascadeError::ConfigNotFound(_))));
}
