//! taskloom configuration system
//!
//! # Configuration hierarchy
//!
//! ```text
//! Priority (high → low):
//! 1. CLI arguments
//! 2. Environment variables (TASKLOOM_MAX_THREADS, TASKLOOM_DEFAULT_TIMEOUT_MS)
//! 3. Config file (--config, or ~/.config/taskloom/config.toml)
//! 4. Default values
//! ```
//!
//! # Usage
//!
//! ```rust
//! use taskloom::util::config::load_user_config;
//!
//! let config = load_user_config().unwrap().apply_env();
//! assert!(config.capacity() >= 1);
//! ```

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::thread;
use std::time::Duration;

/// Environment override for [`LoomConfig::max_threads`].
pub const ENV_MAX_THREADS: &str = "TASKLOOM_MAX_THREADS";

/// Environment override for [`LoomConfig::default_timeout_ms`].
pub const ENV_DEFAULT_TIMEOUT_MS: &str = "TASKLOOM_DEFAULT_TIMEOUT_MS";

/// Scheduler configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoomConfig {
    /// Maximum concurrently running tasks. 0 picks `max(2, cores - 1)`.
    #[serde(default)]
    pub max_threads: usize,
    /// Worker thread name prefix.
    #[serde(default = "default_thread_name")]
    pub thread_name: String,
    /// Worker stack size in bytes. `None` keeps the platform default.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stack_size: Option<usize>,
    /// Timeout applied to tasks that set none. 0 disables it.
    #[serde(default)]
    pub default_timeout_ms: u64,
}

fn default_thread_name() -> String {
    "loom-worker".to_string()
}

impl Default for LoomConfig {
    fn default() -> Self {
        Self {
            max_threads: 0,
            thread_name: default_thread_name(),
            stack_size: None,
            default_timeout_ms: 0,
        }
    }
}

impl LoomConfig {
    /// Config with a fixed capacity.
    pub fn with_max_threads(max_threads: usize) -> Self {
        Self {
            max_threads,
            ..Self::default()
        }
    }

    /// Effective capacity.
    pub fn capacity(&self) -> usize {
        if self.max_threads > 0 {
            return self.max_threads;
        }
        let cores = thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(2);
        cores.saturating_sub(1).max(2)
    }

    /// Effective default timeout.
    pub fn default_timeout(&self) -> Option<Duration> {
        (self.default_timeout_ms > 0).then(|| Duration::from_millis(self.default_timeout_ms))
    }

    /// Apply environment overrides. Unparsable values are ignored.
    pub fn apply_env(self) -> Self {
        self.apply_vars(|key| std::env::var(key).ok())
    }

    fn apply_vars(
        mut self,
        var: impl Fn(&str) -> Option<String>,
    ) -> Self {
        if let Some(max_threads) = var(ENV_MAX_THREADS).and_then(|v| v.trim().parse().ok()) {
            self.max_threads = max_threads;
        }
        if let Some(timeout) = var(ENV_DEFAULT_TIMEOUT_MS).and_then(|v| v.trim().parse().ok()) {
            self.default_timeout_ms = timeout;
        }
        self
    }
}

/// Get the user config directory
pub fn get_config_dir() -> Option<PathBuf> {
    // Try XDG config directory on Unix
    if let Ok(xdg_config) = std::env::var("XDG_CONFIG_HOME") {
        return Some(PathBuf::from(xdg_config).join("taskloom"));
    }

    // Fallback to ~/.config/taskloom
    if let Ok(home) = std::env::var("HOME") {
        return Some(PathBuf::from(home).join(".config").join("taskloom"));
    }

    // On Windows, try %APPDATA%
    if let Ok(appdata) = std::env::var("APPDATA") {
        return Some(PathBuf::from(appdata).join("taskloom"));
    }

    None
}

/// Get the user config file path (~/.config/taskloom/config.toml)
pub fn get_config_path() -> Option<PathBuf> {
    get_config_dir().map(|dir| dir.join("config.toml"))
}

/// Load user-level configuration
/// Returns default config if file doesn't exist
pub fn load_user_config() -> Result<LoomConfig, ConfigError> {
    match get_config_path() {
        Some(path) if path.exists() => load_config_file(&path),
        _ => Ok(LoomConfig::default()),
    }
}

/// Load configuration from an explicit file.
pub fn load_config_file(path: &Path) -> Result<LoomConfig, ConfigError> {
    let content = fs::read_to_string(path).map_err(|source| ConfigError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    parse_config(&content)
}

/// Parse configuration from TOML text.
pub fn parse_config(content: &str) -> Result<LoomConfig, ConfigError> {
    Ok(toml::from_str(content)?)
}

/// Render configuration as TOML.
pub fn render_config(config: &LoomConfig) -> Result<String, ConfigError> {
    Ok(toml::to_string_pretty(config)?)
}

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// Reading the config file failed.
    #[error("failed to read config {}: {source}", path.display())]
    Io {
        /// File that could not be read.
        path: PathBuf,
        /// Underlying error.
        source: std::io::Error,
    },
    /// The file is not valid configuration.
    #[error("config parse error: {0}")]
    Parse(#[from] toml::de::Error),
    /// Rendering the configuration failed.
    #[error("config serialize error: {0}")]
    Serialize(#[from] toml::ser::Error),
}
