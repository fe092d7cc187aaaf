// ABOUTME: Tests for configuration loading and validation
// ABOUTME: Verifies TOML file discovery, env var overrides, and required field validation

use serial_test::serial;
use std::io::Write;

/// Helper to clear all config-related env vars
fn clear_config_env_vars() {
    for var in [
        "FIELDBOT_CONFIG_PATH",
        "MATRIX_HOME_SERVER",
        "MATRIX_USER_ID",
        "MATRIX_PASSWORD",
        "MATRIX_DEVICE_NAME",
        "ADMIN_RECIPIENT",
        "FIELDBOT_CREDENTIAL_PASSPHRASE",
        "FIELDBOT_DATABASE_PATH",
        "SERVER_PORT",
        "SERVER_HOST",
        "SERVER_API_KEY",
        "OUTBOX_POLL_INTERVAL_SECS",
    ] {
        std::env::remove_var(var);
    }
}

fn write_config(dir: &tempfile::TempDir, content: &str) -> std::path::PathBuf {
    let config_path = dir.path().join("config.toml");
    let mut file = std::fs::File::create(&config_path).unwrap();
    file.write_all(content.as_bytes()).unwrap();
    config_path
}

const FULL_CONFIG: &str = r#"
[matrix]
home_server = "https://matrix.example.org"
user_id = "@fieldbot:example.org"
password = "secret123"
bridge_server = "bridge.example.org"

[admin]
recipient = "6280000"

[commands]
marker = "/"
list_limit = 5

[server]
port = 8080

[database]
path = "/tmp/fieldbot-test.db"

[credentials]
passphrase = "correct horse"
"#;

#[test]
#[serial]
fn test_config_loads_from_toml_file() {
    clear_config_env_vars();
    let dir = tempfile::tempdir().unwrap();
    let config_path = write_config(&dir, FULL_CONFIG);
    std::env::set_var("FIELDBOT_CONFIG_PATH", &config_path);

    let config = fieldbot::config::Config::load().unwrap();

    assert_eq!(config.matrix.home_server, "https://matrix.example.org");
    assert_eq!(config.matrix.user_id, "@fieldbot:example.org");
    assert_eq!(config.matrix.password, Some("secret123".to_string()));
    assert_eq!(config.matrix.bridge_server_name(), "bridge.example.org");
    assert_eq!(config.admin.recipient, "6280000");
    assert_eq!(config.commands.marker, "/");
    assert_eq!(config.commands.list_limit, 5);
    assert_eq!(config.server.port, 8080);
    assert_eq!(config.database.path, "/tmp/fieldbot-test.db");

    clear_config_env_vars();
}

#[test]
#[serial]
fn test_config_env_var_overrides() {
    clear_config_env_vars();
    let dir = tempfile::tempdir().unwrap();
    let config_path = write_config(&dir, FULL_CONFIG);
    std::env::set_var("FIELDBOT_CONFIG_PATH", &config_path);
    std::env::set_var("MATRIX_HOME_SERVER", "https://override.example.org");
    std::env::set_var("ADMIN_RECIPIENT", "@ops:example.org");
    std::env::set_var("SERVER_PORT", "9999");
    std::env::set_var("SERVER_API_KEY", "k3y");
    std::env::set_var("FIELDBOT_DATABASE_PATH", "/tmp/override.db");

    let config = fieldbot::config::Config::load().unwrap();

    assert_eq!(config.matrix.home_server, "https://override.example.org");
    assert_eq!(config.admin.recipient, "@ops:example.org");
    assert_eq!(config.server.port, 9999);
    assert_eq!(config.server.api_key, Some("k3y".to_string()));
    assert_eq!(config.database.path, "/tmp/override.db");

    clear_config_env_vars();
}

#[test]
#[serial]
fn test_secrets_are_cleared_from_environment() {
    clear_config_env_vars();
    let dir = tempfile::tempdir().unwrap();
    let config_path = write_config(&dir, FULL_CONFIG);
    std::env::set_var("FIELDBOT_CONFIG_PATH", &config_path);
    std::env::set_var("MATRIX_PASSWORD", "from-env");
    std::env::set_var("FIELDBOT_CREDENTIAL_PASSPHRASE", "env passphrase");

    let config = fieldbot::config::Config::load().unwrap();

    assert_eq!(config.matrix.password, Some("from-env".to_string()));
    assert_eq!(
        config.credentials.passphrase,
        Some("env passphrase".to_string())
    );
    assert!(std::env::var("MATRIX_PASSWORD").is_err());
    assert!(std::env::var("FIELDBOT_CREDENTIAL_PASSPHRASE").is_err());

    clear_config_env_vars();
}

#[test]
#[serial]
fn test_invalid_port_override_is_rejected() {
    clear_config_env_vars();
    let dir = tempfile::tempdir().unwrap();
    let config_path = write_config(&dir, FULL_CONFIG);
    std::env::set_var("FIELDBOT_CONFIG_PATH", &config_path);
    std::env::set_var("SERVER_PORT", "not-a-port");

    assert!(fieldbot::config::Config::load().is_err());

    clear_config_env_vars();
}

#[test]
#[serial]
fn test_missing_passphrase_fails_validation_but_not_unvalidated_load() {
    clear_config_env_vars();
    let dir = tempfile::tempdir().unwrap();
    let without_passphrase = FULL_CONFIG.replace("passphrase = \"correct horse\"", "");
    let config_path = write_config(&dir, &without_passphrase);
    std::env::set_var("FIELDBOT_CONFIG_PATH", &config_path);

    let err = fieldbot::config::Config::load().unwrap_err();
    assert!(err.to_string().contains("credentials.passphrase"));

    let config = fieldbot::config::Config::load_unvalidated().unwrap();
    assert_eq!(config.database.path, "/tmp/fieldbot-test.db");

    clear_config_env_vars();
}

#[test]
#[serial]
fn test_invalid_user_id_fails_validation() {
    clear_config_env_vars();
    let dir = tempfile::tempdir().unwrap();
    let bad = FULL_CONFIG.replace("@fieldbot:example.org", "fieldbot");
    let config_path = write_config(&dir, &bad);
    std::env::set_var("FIELDBOT_CONFIG_PATH", &config_path);

    let err = fieldbot::config::Config::load().unwrap_err();
    assert!(err.to_string().contains("Invalid Matrix user ID"));

    clear_config_env_vars();
}
