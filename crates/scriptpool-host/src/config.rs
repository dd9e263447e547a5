use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use scriptpool_loader::LoaderConfig;
use scriptpool_types::ScriptError;

use crate::engine::EngineOptions;
use crate::pool::PoolConfig;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Config file not found: {0}")]
    NotFound(PathBuf),

    #[error("IO error reading config {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Failed to serialize config: {0}")]
    Serialize(#[from] toml::ser::Error),

    #[error("Invalid config: {0}")]
    Invalid(String),
}

impl From<ConfigError> for ScriptError {
    fn from(err: ConfigError) -> Self {
        ScriptError::Config(err.to_string())
    }
}

/// Everything the script host needs, as read from `config.toml`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HostConfig {
    /// Number of worker threads, each owning one engine (default: 10)
    #[serde(default = "default_pool_size")]
    pub pool_size: usize,

    /// Bound on host objects per evaluation (default: 1000)
    #[serde(default = "default_max_script_objects")]
    pub max_script_objects: usize,

    /// How long shutdown waits for running tasks in milliseconds (default: 10s)
    #[serde(default = "default_shutdown_grace")]
    pub shutdown_grace_ms: u64,

    /// Function called after a script's top level (default: "render")
    #[serde(default = "default_entry_function")]
    pub entry_function: String,

    /// Whether store changes are picked up while running (default: true)
    #[serde(default = "default_hot_reload")]
    pub hot_reload: bool,

    /// Store scan interval in milliseconds (default: 1000ms)
    #[serde(default = "default_hot_reload_interval")]
    pub hot_reload_interval_ms: u64,

    #[serde(flatten)]
    pub loader: LoaderConfig,
}

fn default_pool_size() -> usize {
    10
}

fn default_max_script_objects() -> usize {
    crate::bridge::DEFAULT_MAX_SCRIPT_OBJECTS
}

fn default_shutdown_grace() -> u64 {
    10_000
}

fn default_entry_function() -> String {
    "render".to_string()
}

fn default_hot_reload() -> bool {
    true
}

fn default_hot_reload_interval() -> u64 {
    1000
}

impl Default for HostConfig {
    fn default() -> Self {
        Self {
            pool_size: default_pool_size(),
            max_script_objects: default_max_script_objects(),
            shutdown_grace_ms: default_shutdown_grace(),
            entry_function: default_entry_function(),
            hot_reload: default_hot_reload(),
            hot_reload_interval_ms: default_hot_reload_interval(),
            loader: LoaderConfig::default(),
        }
    }
}

impl FromStr for HostConfig {
    type Err = ConfigError;

    fn from_str(content: &str) -> Result<Self, Self::Err> {
        let config: HostConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }
}

impl HostConfig {
    /// Default location: `<config dir>/scriptpool/config.toml`
    pub fn default_path() -> Option<PathBuf> {
        directories::ProjectDirs::from("", "", "scriptpool")
            .map(|dirs| dirs.config_dir().join("config.toml"))
    }

    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            return Err(ConfigError::NotFound(path.to_path_buf()));
        }

        let content = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let config = content.parse()?;
        tracing::info!("Loaded config from {}", path.display());
        Ok(config)
    }

    pub fn save(&self, path: &Path) -> Result<(), ConfigError> {
        let io = |source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        };

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(io)?;
        }
        let content = toml::to_string_pretty(self)?;
        fs::write(path, content).map_err(io)?;
        tracing::info!("Saved config to {}", path.display());
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.pool_size == 0 {
            return Err(ConfigError::Invalid("pool_size must be at least 1".into()));
        }
        if self.max_script_objects == 0 {
            return Err(ConfigError::Invalid(
                "max_script_objects must be at least 1".into(),
            ));
        }
        if self.entry_function.trim().is_empty() {
            return Err(ConfigError::Invalid("entry_function must not be empty".into()));
        }
        if self.loader.script_extensions.is_empty() {
            return Err(ConfigError::Invalid(
                "script_extensions must name at least one extension".into(),
            ));
        }
        Ok(())
    }

    pub fn pool_config(&self) -> PoolConfig {
        PoolConfig {
            size: self.pool_size,
            shutdown_grace: Duration::from_millis(self.shutdown_grace_ms),
        }
    }

    pub fn engine_options(&self) -> EngineOptions {
        EngineOptions {
            max_script_objects: self.max_script_objects,
            entry_function: self.entry_function.clone(),
        }
    }

    pub fn hot_reload_interval(&self) -> Duration {
        Duration::from_millis(self.hot_reload_interval_ms)
    }
}
