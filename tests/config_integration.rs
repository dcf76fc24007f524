use serial_test::serial;
use std::env;
use std::fs;
use uar_orchestrator::config::AppConfig;

const BIN: &str = "uar-orchestrator";

// Helper to clear environment variables that might interfere with tests
fn clear_env_vars() {
    unsafe {
        env::remove_var("UAR_SERVER__PORT");
        env::remove_var("UAR_CANCELLATION__BACKEND");
        env::remove_var("UAR_RUNTIME__DEFAULT_TIMEOUT_SECS");
        env::remove_var("CONFIG_FILE");
        env::remove_var("PORT");
        env::remove_var("PERSISTENCE_PROVIDER");
        env::remove_var("CANCELLATION_BACKEND");
        env::remove_var("RUN_TIMEOUT_SECS");
    }
}

#[test]
#[serial]
fn test_default_config() {
    clear_env_vars();

    let config = AppConfig::load_from_args([BIN]).expect("defaults should load");
    assert_eq!(config.server.port, 3000);
    assert_eq!(config.cancellation.backend, "memory");
    assert_eq!(config.persistence.provider, "memory");
    assert_eq!(config.runtime.default_timeout_secs, 600);
    assert_eq!(config.runtime.fuel(), Some(50_000));
    assert_eq!(config.runtime.event_retention_secs, 3600);
}

#[test]
#[serial]
fn test_env_override() {
    clear_env_vars();
    unsafe {
        env::set_var("UAR_SERVER__PORT", "9090");
        env::set_var("UAR_CANCELLATION__BACKEND", "surrealdb");
    }

    let config = AppConfig::load_from_args([BIN]).expect("Failed to load config");
    assert_eq!(config.server.port, 9090);
    assert_eq!(config.cancellation.backend, "surrealdb");

    clear_env_vars();
}

#[test]
#[serial]
fn test_cli_wins_over_env() {
    clear_env_vars();
    unsafe {
        env::set_var("UAR_RUNTIME__DEFAULT_TIMEOUT_SECS", "30");
    }

    let config = AppConfig::load_from_args([BIN, "--run-timeout-secs", "0", "--port", "8181"])
        .expect("Failed to load config");
    assert_eq!(config.runtime.default_timeout(), None);
    assert_eq!(config.server.port, 8181);

    clear_env_vars();
}

#[test]
#[serial]
fn test_file_load() {
    clear_env_vars();

    let dir = tempfile::tempdir().unwrap();
    let file_path = dir.path().join("uar.yaml");
    fs::write(
        &file_path,
        r#"
server:
  port: 7070
runtime:
  pause_poll_millis: 50
  workflows_dir: ./workflows
cancellation:
  backend: surrealdb
  url: mem://
"#,
    )
    .expect("Failed to write temp config");

    unsafe {
        env::set_var("CONFIG_FILE", &file_path);
    }

    let config = AppConfig::load_from_args([BIN]).expect("Failed to load config from file");
    assert_eq!(config.server.port, 7070);
    assert_eq!(config.runtime.pause_poll().as_millis(), 50);
    assert_eq!(config.runtime.workflows_dir.as_deref(), Some("./workflows"));
    assert_eq!(config.cancellation.url.as_deref(), Some("mem://"));

    clear_env_vars();
}

#[test]
#[serial]
fn test_missing_explicit_file_is_an_error() {
    clear_env_vars();
    let result = AppConfig::load_from_args([BIN, "--config", "does-not-exist.yaml"]);
    assert!(result.is_err());
}

#[test]
#[serial]
fn test_cwd_config_fallback() {
    clear_env_vars();

    let cwd_path = "config.yaml";
    fs::write(cwd_path, "server:\n  port: 6060\n").expect("Failed to write ./config.yaml");

    let config = AppConfig::load_from_args([BIN]);

    fs::remove_file(cwd_path).unwrap();
    assert_eq!(config.expect("Failed to load config").server.port, 6060);
}
