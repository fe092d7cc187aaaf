// ABOUTME: Configuration parsing from TOML file with environment variable overrides
// ABOUTME: Validates required fields and provides sensible defaults for optional ones
use crate::paths;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub matrix: MatrixConfig,
    pub admin: AdminConfig,
    #[serde(default)]
    pub commands: CommandsConfig,
    #[serde(default)]
    pub connection: ConnectionConfig,
    #[serde(default)]
    pub outbox: OutboxConfig,
    #[serde(default)]
    pub status: StatusConfig,
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub credentials: CredentialsConfig,
}

#[derive(Clone, Serialize, Deserialize)]
pub struct MatrixConfig {
    pub home_server: String,
    pub user_id: String,
    /// Only used to provision a fresh credential when none is stored
    #[serde(skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
    #[serde(default = "default_device_name")]
    pub device_name: String,
    /// Localpart prefix of bridged phone users, e.g. "whatsapp_" for @whatsapp_628123:example.org
    #[serde(default = "default_puppet_prefix")]
    pub puppet_prefix: String,
    /// Server name of bridged phone users; defaults to the bot's own server
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bridge_server: Option<String>,
    /// The bot's own phone number, when the account is bridged
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phone: Option<String>,
}

// Custom Debug impl to redact sensitive fields
impl std::fmt::Debug for MatrixConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MatrixConfig")
            .field("home_server", &self.home_server)
            .field("user_id", &self.user_id)
            .field("password", &self.password.as_ref().map(|_| "[REDACTED]"))
            .field("device_name", &self.device_name)
            .field("puppet_prefix", &self.puppet_prefix)
            .field("bridge_server", &self.bridge_server)
            .field("phone", &self.phone)
            .finish()
    }
}

impl MatrixConfig {
    /// Server name used for bridged phone users
    pub fn bridge_server_name(&self) -> &str {
        match self.bridge_server.as_deref() {
            Some(server) => server,
            None => self
                .user_id
                .split_once(':')
                .map(|(_, server)| server)
                .unwrap_or_default(),
        }
    }
}

/// The single administrative alert recipient
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdminConfig {
    /// Room ID, user ID or phone number
    pub recipient: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandsConfig {
    #[serde(default = "default_marker")]
    pub marker: String,
    /// Commands the bot account may issue to itself
    #[serde(default = "default_self_allowed")]
    pub self_allowed: Vec<String>,
    #[serde(default = "default_list_limit")]
    pub list_limit: usize,
    #[serde(default = "default_country_code")]
    pub default_country_code: String,
}

impl Default for CommandsConfig {
    fn default() -> Self {
        Self {
            marker: default_marker(),
            self_allowed: default_self_allowed(),
            list_limit: default_list_limit(),
            default_country_code: default_country_code(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionConfig {
    #[serde(default = "default_base_delay_secs")]
    pub base_delay_secs: u64,
    #[serde(default = "default_max_delay_secs")]
    pub max_delay_secs: u64,
    /// Consecutive failures tolerated before auto-retry stops
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// Delay before re-provisioning after the server revoked the credential
    #[serde(default = "default_logout_restart_secs")]
    pub logout_restart_secs: u64,
    #[serde(default = "default_heartbeat_secs")]
    pub heartbeat_secs: u64,
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            base_delay_secs: default_base_delay_secs(),
            max_delay_secs: default_max_delay_secs(),
            max_retries: default_max_retries(),
            logout_restart_secs: default_logout_restart_secs(),
            heartbeat_secs: default_heartbeat_secs(),
            connect_timeout_secs: default_connect_timeout_secs(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutboxConfig {
    #[serde(default = "default_outbox_interval_secs")]
    pub poll_interval_secs: u64,
    #[serde(default = "default_outbox_batch_size")]
    pub batch_size: usize,
    /// Failed deliveries before a notification is dead-lettered (0 = unlimited)
    #[serde(default = "default_outbox_max_attempts")]
    pub max_attempts: u32,
}

impl Default for OutboxConfig {
    fn default() -> Self {
        Self {
            poll_interval_secs: default_outbox_interval_secs(),
            batch_size: default_outbox_batch_size(),
            max_attempts: default_outbox_max_attempts(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusConfig {
    #[serde(default = "default_status_interval_secs")]
    pub interval_secs: u64,
    #[serde(default = "default_status_path")]
    pub snapshot_path: String,
}

impl Default for StatusConfig {
    fn default() -> Self {
        Self {
            interval_secs: default_status_interval_secs(),
            snapshot_path: default_status_path(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_server_host")]
    pub host: String,
    #[serde(default = "default_server_port")]
    pub port: u16,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_server_host(),
            port: default_server_port(),
            api_key: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    #[serde(default = "default_database_path")]
    pub path: String,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: default_database_path(),
        }
    }
}

#[derive(Clone, Serialize, Deserialize)]
pub struct CredentialsConfig {
    #[serde(default = "default_credential_path")]
    pub path: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub passphrase: Option<String>,
}

impl std::fmt::Debug for CredentialsConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CredentialsConfig")
            .field("path", &self.path)
            .field("passphrase", &self.passphrase.as_ref().map(|_| "[REDACTED]"))
            .finish()
    }
}

impl Default for CredentialsConfig {
    fn default() -> Self {
        Self {
            path: default_credential_path(),
            passphrase: None,
        }
    }
}

fn default_device_name() -> String {
    "fieldbot".to_string()
}

fn default_puppet_prefix() -> String {
    "whatsapp_".to_string()
}

fn default_marker() -> String {
    "!".to_string()
}

fn default_self_allowed() -> Vec<String> {
    vec!["ping".to_string(), "status".to_string(), "info".to_string()]
}

fn default_list_limit() -> usize {
    10
}

fn default_country_code() -> String {
    "62".to_string()
}

fn default_base_delay_secs() -> u64 {
    2
}

fn default_max_delay_secs() -> u64 {
    60
}

fn default_max_retries() -> u32 {
    5
}

fn default_logout_restart_secs() -> u64 {
    10
}

fn default_heartbeat_secs() -> u64 {
    30
}

fn default_connect_timeout_secs() -> u64 {
    60
}

fn default_outbox_interval_secs() -> u64 {
    10
}

fn default_outbox_batch_size() -> usize {
    20
}

fn default_outbox_max_attempts() -> u32 {
    10
}

fn default_status_interval_secs() -> u64 {
    5
}

fn default_status_path() -> String {
    paths::status_file().to_string_lossy().to_string()
}

fn default_server_host() -> String {
    "127.0.0.1".to_string()
}

fn default_server_port() -> u16 {
    13100
}

fn default_database_path() -> String {
    paths::database_file().to_string_lossy().to_string()
}

fn default_credential_path() -> String {
    paths::credential_file().to_string_lossy().to_string()
}

/// Expand tilde (~) to home directory in paths
/// Logs a warning if expansion fails and falls back to the original path
fn expand_tilde(path: &str) -> String {
    if let Some(stripped) = path.strip_prefix("~/") {
        if let Some(base_dirs) = directories::BaseDirs::new() {
            return base_dirs
                .home_dir()
                .join(stripped)
                .to_string_lossy()
                .to_string();
        }
        tracing::warn!(
            path = %path,
            "Failed to expand tilde in path: could not determine home directory"
        );
    }
    path.to_string()
}

fn parse_env<T: std::str::FromStr>(name: &str, val: &str) -> Result<T> {
    val.parse()
        .map_err(|_| anyhow::anyhow!("{} must be a valid number, got: {}", name, val))
}

impl Config {
    /// Find the config file, checking multiple locations in order:
    /// 1. FIELDBOT_CONFIG_PATH env var (if set)
    /// 2. ./config.toml (current directory - for development)
    /// 3. ~/.config/fieldbot/config.toml (XDG config dir)
    fn find_config_file() -> Option<PathBuf> {
        if let Ok(env_path) = std::env::var("FIELDBOT_CONFIG_PATH") {
            let path = PathBuf::from(&env_path);
            if path.exists() {
                return Some(path);
            }
        }

        let local_config = PathBuf::from("config.toml");
        if local_config.exists() {
            return Some(local_config);
        }

        let xdg_config = paths::config_file();
        if xdg_config.exists() {
            return Some(xdg_config);
        }

        None
    }

    /// Load configuration from config.toml with environment variable overrides
    pub fn load() -> Result<Self> {
        let config = Self::load_unvalidated()?;
        config.validate()?;
        Ok(config)
    }

    /// Like [`Config::load`] but without validation; for offline tools that only
    /// need paths (status, database seeding)
    pub fn load_unvalidated() -> Result<Self> {
        let config_path = Self::find_config_file().context(
            "No config file found (set FIELDBOT_CONFIG_PATH or create ./config.toml)",
        )?;
        tracing::info!(path = %config_path.display(), "Loading configuration from file");
        let content = std::fs::read_to_string(&config_path)
            .with_context(|| format!("Failed to read {}", config_path.display()))?;
        let mut config = Self::from_toml(&content)
            .with_context(|| format!("Failed to parse {}", config_path.display()))?;

        config.apply_env_overrides()?;
        Ok(config)
    }

    /// Parse without environment overrides or validation
    pub fn from_toml(content: &str) -> Result<Self> {
        Ok(toml::from_str::<Config>(content)?)
    }

    fn apply_env_overrides(&mut self) -> Result<()> {
        if let Ok(val) = std::env::var("MATRIX_HOME_SERVER") {
            self.matrix.home_server = val;
        }
        if let Ok(val) = std::env::var("MATRIX_USER_ID") {
            self.matrix.user_id = val;
        }
        if let Ok(val) = std::env::var("MATRIX_PASSWORD") {
            self.matrix.password = Some(val);
            // Clear from environment to prevent exposure via /proc or ps
            std::env::remove_var("MATRIX_PASSWORD");
        }
        if let Ok(val) = std::env::var("MATRIX_DEVICE_NAME") {
            self.matrix.device_name = val;
        }
        if let Ok(val) = std::env::var("ADMIN_RECIPIENT") {
            self.admin.recipient = val;
        }
        if let Ok(val) = std::env::var("FIELDBOT_CREDENTIAL_PASSPHRASE") {
            self.credentials.passphrase = Some(val);
            std::env::remove_var("FIELDBOT_CREDENTIAL_PASSPHRASE");
        }
        if let Ok(val) = std::env::var("FIELDBOT_DATABASE_PATH") {
            self.database.path = val;
        }
        if let Ok(val) = std::env::var("SERVER_PORT") {
            self.server.port = parse_env("SERVER_PORT", &val)?;
        }
        if let Ok(val) = std::env::var("SERVER_HOST") {
            self.server.host = val;
        }
        if let Ok(val) = std::env::var("SERVER_API_KEY") {
            self.server.api_key = Some(val);
        }
        if let Ok(val) = std::env::var("OUTBOX_POLL_INTERVAL_SECS") {
            self.outbox.poll_interval_secs = parse_env("OUTBOX_POLL_INTERVAL_SECS", &val)?;
        }

        self.database.path = expand_tilde(&self.database.path);
        self.credentials.path = expand_tilde(&self.credentials.path);
        self.status.snapshot_path = expand_tilde(&self.status.snapshot_path);
        Ok(())
    }

    /// Reject configurations the gateway cannot run with
    pub fn validate(&self) -> Result<()> {
        if self.matrix.home_server.trim().is_empty() {
            anyhow::bail!(
                "matrix.home_server is required (set in config.toml or MATRIX_HOME_SERVER env var)"
            );
        }
        if !self.matrix.user_id.starts_with('@') || !self.matrix.user_id.contains(':') {
            anyhow::bail!("Invalid Matrix user ID: {}", self.matrix.user_id);
        }
        if self.admin.recipient.trim().is_empty() {
            anyhow::bail!("admin.recipient is required (set in config.toml or ADMIN_RECIPIENT)");
        }
        let mut marker = self.commands.marker.chars();
        if marker.next().is_none() || marker.next().is_some() {
            anyhow::bail!(
                "commands.marker must be exactly one character, got: {:?}",
                self.commands.marker
            );
        }
        if !self
            .commands
            .default_country_code
            .chars()
            .all(|c| c.is_ascii_digit())
        {
            anyhow::bail!("commands.default_country_code must contain digits only");
        }
        if self.connection.base_delay_secs == 0 {
            anyhow::bail!("connection.base_delay_secs must be at least 1");
        }
        if self.connection.max_delay_secs < self.connection.base_delay_secs {
            anyhow::bail!("connection.max_delay_secs must not be below base_delay_secs");
        }
        if self.credentials.passphrase.as_deref().unwrap_or("").is_empty() {
            anyhow::bail!(
                "credentials.passphrase is required (set FIELDBOT_CREDENTIAL_PASSPHRASE)"
            );
        }
        Ok(())
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.connection.heartbeat_secs.max(1))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINIMAL: &str = r#"
        [matrix]
        home_server = "https://matrix.example.org"
        user_id = "@fieldbot:example.org"
        password = "hunter2"

        [admin]
        recipient = "!ops:example.org"

        [credentials]
        passphrase = "correct horse"
    "#;

    #[test]
    fn test_minimal_config_defaults() {
        let config = Config::from_toml(MINIMAL).unwrap();
        assert_eq!(config.commands.marker, "!");
        assert_eq!(config.commands.self_allowed, vec!["ping", "status", "info"]);
        assert_eq!(config.connection.base_delay_secs, 2);
        assert_eq!(config.connection.max_delay_secs, 60);
        assert_eq!(config.connection.max_retries, 5);
        assert_eq!(config.outbox.max_attempts, 10);
        assert_eq!(config.server.port, 13100);
        assert_eq!(config.matrix.puppet_prefix, "whatsapp_");
        config.validate().unwrap();
    }

    #[test]
    fn test_bridge_server_defaults_to_bot_server() {
        let config = Config::from_toml(MINIMAL).unwrap();
        assert_eq!(config.matrix.bridge_server_name(), "example.org");
    }

    #[test]
    fn test_debug_redacts_secrets() {
        let config = Config::from_toml(MINIMAL).unwrap();
        let debug_str = format!("{:?}", config);
        assert!(!debug_str.contains("hunter2"), "password should be redacted");
        assert!(!debug_str.contains("correct horse"), "passphrase should be redacted");
        assert!(debug_str.contains("[REDACTED]"));
    }

    #[test]
    fn test_validate_rejects_multi_char_marker() {
        let mut config = Config::from_toml(MINIMAL).unwrap();
        config.commands.marker = "!!".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_requires_passphrase() {
        let mut config = Config::from_toml(MINIMAL).unwrap();
        config.credentials.passphrase = None;
        let err = config.validate().unwrap_err().to_string();
        assert!(err.contains("passphrase"));
    }

    #[test]
    fn test_validate_rejects_bad_user_id() {
        let mut config = Config::from_toml(MINIMAL).unwrap();
        config.matrix.user_id = "fieldbot".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_missing_admin_section_fails_to_parse() {
        let toml_str = r#"
            [matrix]
            home_server = "https://matrix.example.org"
            user_id = "@fieldbot:example.org"
        "#;
        assert!(Config::from_toml(toml_str).is_err());
    }
}
