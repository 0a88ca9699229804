use anyhow::Result;
use config::{Config, Environment, File};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Main configuration structure for chatflow
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct ChatflowConfig {
    /// Where instance state lives on disk
    pub storage: StorageConfig,
    /// Engine locking and caching behaviour
    pub engine: EngineConfig,
    /// Logging settings
    pub observability: ObservabilityConfig,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct StorageConfig {
    /// Storage root shared by every process working on the same workflows
    pub root: PathBuf,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct EngineConfig {
    /// Maximum wait for a per-instance lock
    pub lock_timeout_ms: u64,
    /// Sleep between lock attempts
    pub lock_poll_interval_ms: u64,
    /// Staleness bound for cached states and schemas
    pub cache_ttl_seconds: u64,
    /// Maximum cached instance states
    pub cache_max_capacity: u64,
    /// Used when `meta.automation_level` is absent
    pub default_automation_level: u8,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct ObservabilityConfig {
    /// Log level or EnvFilter directive
    pub log_level: String,
    /// Emit JSON log lines instead of human readable output
    pub json_logs: bool,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            root: PathBuf::from(".chatflow"),
        }
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            lock_timeout_ms: 30_000,
            lock_poll_interval_ms: 10,
            cache_ttl_seconds: 30,
            cache_max_capacity: 1024,
            default_automation_level: 60,
        }
    }
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            json_logs: false,
        }
    }
}

impl Default for ChatflowConfig {
    fn default() -> Self {
        Self {
            storage: StorageConfig::default(),
            engine: EngineConfig::default(),
            observability: ObservabilityConfig::default(),
        }
    }
}

impl EngineConfig {
    pub fn lock_timeout(&self) -> Duration {
        Duration::from_millis(self.lock_timeout_ms)
    }

    pub fn lock_poll_interval(&self) -> Duration {
        Duration::from_millis(self.lock_poll_interval_ms)
    }

    pub fn cache_ttl(&self) -> Duration {
        Duration::from_secs(self.cache_ttl_seconds)
    }
}

impl ChatflowConfig {
    /// Load configuration from multiple sources with precedence:
    /// 1. Default values
    /// 2. `chatflow.toml` in the working directory
    /// 3. Environment variables (`CHATFLOW__ENGINE__LOCK_TIMEOUT_MS=...`),
    ///    including any set by a `.env` file in the working directory
    pub fn load() -> Result<Self> {
        Self::load_env_file()?;
        Self::load_from(Path::new("chatflow.toml"))
    }

    /// Same as [`ChatflowConfig::load`] with an explicit config file path.
    pub fn load_from(path: &Path) -> Result<Self> {
        let mut builder = Config::builder().add_source(Config::try_from(&Self::default())?);

        if path.exists() {
            builder = builder.add_source(File::from(path));
        }

        builder = builder.add_source(
            Environment::with_prefix("CHATFLOW")
                .separator("__")
                .try_parsing(true),
        );

        let config: ChatflowConfig = builder.build()?.try_deserialize()?;
        tracing::debug!(
            root = ?config.storage.root,
            lock_timeout_ms = %config.engine.lock_timeout_ms,
            "Configuration loaded"
        );
        Ok(config)
    }

    /// Save configuration to file
    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let toml_content = toml::to_string_pretty(self)?;
        std::fs::write(path, toml_content)?;
        Ok(())
    }

    /// Load .env file if it exists
    pub fn load_env_file() -> Result<()> {
        Self::load_env_file_from(Path::new(".env"))
    }

    /// Load a dotenv file if it exists. Variables already set are kept.
    pub fn load_env_file_from(path: &Path) -> Result<()> {
        if path.exists() {
            dotenvy::from_path(path)?;
            tracing::info!(file = ?path, "Loaded environment variables from .env file");
        }
        Ok(())
    }
}
