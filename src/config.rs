//! TOML configuration for the attrwatch daemon.
//!
//! Every section has defaults; a file only needs to name what it changes.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

/// Environment variable naming the config file.
pub const CONFIG_ENV: &str = "ATTRWATCH_CONFIG";

/// Standard system location of the config file.
pub const SYSTEM_CONFIG_PATH: &str = "/etc/attrwatch/attrwatch.toml";

// ---------------------------------------------------------------------------
// Top-level config
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EngineConfig {
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub ingest: IngestConfig,
    #[serde(default)]
    pub api: ApiConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl EngineConfig {
    /// Load configuration from a TOML file at `path`.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file: {}", path.display()))?;
        let config: Self = toml::from_str(&content)
            .with_context(|| format!("failed to parse config file: {}", path.display()))?;
        info!(path = %path.display(), "loaded configuration");
        Ok(config)
    }

    /// An explicit path must load. Otherwise try `ATTRWATCH_CONFIG`, then the
    /// system location, then defaults.
    pub fn resolve(explicit: Option<&Path>) -> Result<Self> {
        match explicit {
            Some(path) => Self::load(path),
            None => Ok(Self::load_or_default()),
        }
    }

    pub fn load_or_default() -> Self {
        if let Ok(env_path) = std::env::var(CONFIG_ENV) {
            let path = Path::new(&env_path);
            match Self::load(path) {
                Ok(cfg) => return cfg,
                Err(e) => {
                    warn!(
                        path = %path.display(),
                        error = %e,
                        "ATTRWATCH_CONFIG set but file could not be loaded, trying fallback"
                    );
                }
            }
        }

        let system_path = Path::new(SYSTEM_CONFIG_PATH);
        if system_path.exists() {
            match Self::load(system_path) {
                Ok(cfg) => return cfg,
                Err(e) => {
                    warn!(
                        path = %system_path.display(),
                        error = %e,
                        "system config file exists but could not be loaded, using defaults"
                    );
                }
            }
        }

        debug!("no config file found, using compiled-in defaults");
        Self::default()
    }
}

// ---------------------------------------------------------------------------
// Storage
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// SQLite database holding history, classifications, alerts and entities.
    pub path: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("attrwatch.db"),
        }
    }
}

// ---------------------------------------------------------------------------
// Ingest
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IngestConfig {
    /// Evaluation shards. Updates for one attribute always land on the same
    /// shard.
    pub workers: usize,
    /// Pending updates per shard before submitters wait.
    pub queue_capacity: usize,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            workers: 4,
            queue_capacity: 1024,
        }
    }
}

// ---------------------------------------------------------------------------
// API
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ApiConfig {
    pub listen_address: String,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            listen_address: "127.0.0.1:8480".to_string(),
        }
    }
}

// ---------------------------------------------------------------------------
// Logging
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Default filter when `RUST_LOG` is unset.
    pub level: String,
    pub format: LogFormat,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Text,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    Text,
    Json,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults_are_sane() {
        let cfg = EngineConfig::default();
        assert_eq!(cfg.storage.path, PathBuf::from("attrwatch.db"));
        assert_eq!(cfg.ingest.workers, 4);
        assert_eq!(cfg.ingest.queue_capacity, 1024);
        assert_eq!(cfg.api.listen_address, "127.0.0.1:8480");
        assert_eq!(cfg.logging.level, "info");
        assert_eq!(cfg.logging.format, LogFormat::Text);
    }

    #[test]
    fn test_parse_full_toml() {
        let toml_str = r#"
[storage]
path = "/var/lib/attrwatch/history.db"

[ingest]
workers = 8
queue_capacity = 64

[api]
listen_address = "0.0.0.0:9000"

[logging]
level = "debug"
format = "json"
"#;
        let cfg: EngineConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(cfg.storage.path, PathBuf::from("/var/lib/attrwatch/history.db"));
        assert_eq!(cfg.ingest.workers, 8);
        assert_eq!(cfg.ingest.queue_capacity, 64);
        assert_eq!(cfg.api.listen_address, "0.0.0.0:9000");
        assert_eq!(cfg.logging.format, LogFormat::Json);
    }

    #[test]
    fn test_partial_toml_keeps_defaults() {
        let cfg: EngineConfig = toml::from_str("[ingest]\nworkers = 2\n").unwrap();
        assert_eq!(cfg.ingest.workers, 2);
        assert_eq!(cfg.ingest.queue_capacity, 1024);
        assert_eq!(cfg.api.listen_address, "127.0.0.1:8480");
    }

    #[test]
    fn test_empty_toml() {
        let cfg: EngineConfig = toml::from_str("").unwrap();
        assert_eq!(cfg.logging.level, "info");
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[logging]\nlevel = \"warn\"").unwrap();
        let cfg = EngineConfig::resolve(Some(file.path())).unwrap();
        assert_eq!(cfg.logging.level, "warn");
    }

    #[test]
    fn test_missing_explicit_file_errors() {
        assert!(EngineConfig::resolve(Some(Path::new("/nonexistent/attrwatch.toml"))).is_err());
    }
}
