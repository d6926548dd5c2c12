//! Configuration loading for Ledgerflow.
//!
//! Reads `ledgerflow.toml` from a directory and deserializes it into
//! [`LedgerflowConfig`]. A missing or malformed file yields the defaults.

use std::path::{Path, PathBuf};

use ledgerflow_types::config::LedgerflowConfig;

pub const CONFIG_FILE: &str = "ledgerflow.toml";

/// Load configuration from `{dir}/ledgerflow.toml`.
pub async fn load_config(dir: &Path) -> LedgerflowConfig {
    let config_path = dir.join(CONFIG_FILE);

    let content = match tokio::fs::read_to_string(&config_path).await {
        Ok(content) => content,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            tracing::debug!(path = %config_path.display(), "no config file, using defaults");
            return LedgerflowConfig::default();
        }
        Err(err) => {
            tracing::warn!(path = %config_path.display(), error = %err, "failed to read config, using defaults");
            return LedgerflowConfig::default();
        }
    };

    match toml::from_str::<LedgerflowConfig>(&content) {
        Ok(config) => config,
        Err(err) => {
            tracing::warn!(path = %config_path.display(), error = %err, "failed to parse config, using defaults");
            LedgerflowConfig::default()
        }
    }
}

/// Data directory: `LEDGERFLOW_DATA_DIR`, else `~/.ledgerflow`.
pub fn resolve_data_dir() -> PathBuf {
    if let Ok(dir) = std::env::var("LEDGERFLOW_DATA_DIR") {
        return PathBuf::from(dir);
    }
    match dirs::home_dir() {
        Some(home) => home.join(".ledgerflow"),
        None => PathBuf::from(".ledgerflow"),
    }
}

pub fn default_database_url() -> String {
    format!("sqlite://{}?mode=rwc", resolve_data_dir().join("ledgerflow.db").display())
}

/// The configured database URL, falling back to the data directory.
pub fn database_url(config: &LedgerflowConfig) -> String {
    config
        .database_url
        .clone()
        .unwrap_or_else(default_database_url)
}
