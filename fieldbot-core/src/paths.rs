// ABOUTME: XDG Base Directory paths for config, data, logs and the chat credential
// ABOUTME: Falls back to local ./data and ./ paths when no home directory is available

use directories::ProjectDirs;
use std::path::PathBuf;

const QUALIFIER: &str = "com";
const ORGANIZATION: &str = "fieldbot";
const APPLICATION: &str = "fieldbot";

/// Get XDG-compliant directories for the application
pub fn project_dirs() -> Option<ProjectDirs> {
    ProjectDirs::from(QUALIFIER, ORGANIZATION, APPLICATION)
}

/// Data directory (e.g., ~/.local/share/fieldbot/), ./data if unavailable
pub fn data_dir() -> PathBuf {
    project_dirs()
        .map(|p| p.data_dir().to_path_buf())
        .unwrap_or_else(|| PathBuf::from("./data"))
}

/// e.g., ~/.local/share/fieldbot/logs/
pub fn log_dir() -> PathBuf {
    data_dir().join("logs")
}

/// Matrix crypto store (device keys, olm sessions)
pub fn crypto_store_dir() -> PathBuf {
    data_dir().join("crypto_store")
}

/// Encrypted chat credential
pub fn credential_file() -> PathBuf {
    data_dir().join("credential.enc")
}

/// Status snapshot readable by co-located processes
pub fn status_file() -> PathBuf {
    data_dir().join("status.json")
}

/// Default SQLite database holding jobs, technicians and the outbox
pub fn database_file() -> PathBuf {
    data_dir().join("fieldbot.db")
}

/// Config directory (e.g., ~/.config/fieldbot/), current directory if unavailable
pub fn config_dir() -> PathBuf {
    project_dirs()
        .map(|p| p.config_dir().to_path_buf())
        .unwrap_or_else(|| PathBuf::from("."))
}

/// e.g., ~/.config/fieldbot/config.toml
pub fn config_file() -> PathBuf {
    config_dir().join("config.toml")
}
