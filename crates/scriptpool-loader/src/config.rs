use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Where and how scripts are staged
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoaderConfig {
    /// Base directory for staged sources and build output
    /// (default: <data dir>/scriptpool/scripts)
    #[serde(default)]
    pub base_dir: Option<PathBuf>,

    /// Extensions treated as scripts by the change observer
    #[serde(default = "default_script_extensions")]
    pub script_extensions: Vec<String>,

    /// Dependency manifests; a change to one of these triggers an install
    /// before the next build
    #[serde(default = "default_config_files")]
    pub config_files: Vec<String>,

    #[serde(default)]
    pub build: BuildConfig,
}

/// External build tool settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BuildConfig {
    /// Command run in the project directory when manifests change
    #[serde(default)]
    pub install_command: Option<String>,

    /// Command turning `src/` into `out/`. Without one the native step is used.
    #[serde(default)]
    pub build_command: Option<String>,

    /// How many times to look for a finished artifact (default: 30)
    #[serde(default = "default_ready_attempts")]
    pub ready_attempts: u32,

    /// Delay between two looks in milliseconds (default: 100ms)
    #[serde(default = "default_ready_delay")]
    pub ready_delay_ms: u64,
}

fn default_script_extensions() -> Vec<String> {
    vec!["rhai".to_string()]
}

fn default_config_files() -> Vec<String> {
    vec!["package.json".to_string(), ".babelrc".to_string()]
}

fn default_ready_attempts() -> u32 {
    30
}

fn default_ready_delay() -> u64 {
    100
}

impl Default for LoaderConfig {
    fn default() -> Self {
        Self {
            base_dir: None,
            script_extensions: default_script_extensions(),
            config_files: default_config_files(),
            build: BuildConfig::default(),
        }
    }
}

impl Default for BuildConfig {
    fn default() -> Self {
        Self {
            install_command: None,
            build_command: None,
            ready_attempts: default_ready_attempts(),
            ready_delay_ms: default_ready_delay(),
        }
    }
}

impl LoaderConfig {
    /// Get the base directory (use provided or default)
    pub fn base_dir(&self) -> PathBuf {
        self.base_dir.clone().unwrap_or_else(|| {
            directories::ProjectDirs::from("", "", "scriptpool")
                .map(|dirs| dirs.data_dir().join("scripts"))
                .unwrap_or_else(|| PathBuf::from(".scriptpool"))
        })
    }

    /// Whether a file name is one of the configured dependency manifests
    pub fn is_config_file(&self, file_name: &str) -> bool {
        self.config_files.iter().any(|name| name == file_name)
    }
}

impl BuildConfig {
    pub fn ready_delay(&self) -> Duration {
        Duration::from_millis(self.ready_delay_ms)
    }
}
