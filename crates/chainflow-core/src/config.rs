use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{ChainflowError, Result};

/// Top-level Chainflow configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub engine: EngineConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    /// JSONL run logging; disabled when the section is absent.
    #[serde(default)]
    pub log: Option<LogConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Ceiling on node transitions per run.
    #[serde(default = "default_max_steps")]
    pub max_steps: usize,
    /// Applied to tools that do not set their own timeout.
    #[serde(default = "default_step_timeout_secs")]
    pub step_timeout_secs: u64,
    /// Threshold for the built-in review graph.
    #[serde(default = "default_threshold")]
    pub default_threshold: f64,
    /// Capacity of the run event channel.
    #[serde(default = "default_event_capacity")]
    pub event_capacity: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_steps: default_max_steps(),
            step_timeout_secs: default_step_timeout_secs(),
            default_threshold: default_threshold(),
            event_capacity: default_event_capacity(),
        }
    }
}

fn default_max_steps() -> usize {
    100
}

fn default_step_timeout_secs() -> u64 {
    30
}

fn default_threshold() -> f64 {
    0.8
}

fn default_event_capacity() -> usize {
    256
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackend {
    #[default]
    Memory,
    Sqlite,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    #[serde(default)]
    pub backend: StorageBackend,
    /// Database file for the sqlite backend.
    #[serde(default = "default_db_path")]
    pub path: String,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            backend: StorageBackend::default(),
            path: default_db_path(),
        }
    }
}

fn default_db_path() -> String {
    "~/.chainflow/chainflow.db".to_string()
}

impl StorageConfig {
    /// Resolve the database path (expand ~).
    pub fn db_path(&self) -> PathBuf {
        expand_home(&self.path)
    }
}

/// JSONL run logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    /// Enable run logging (default: true when section is present).
    #[serde(default = "default_log_enabled")]
    pub enabled: bool,
    #[serde(default = "default_log_dir")]
    pub log_dir: String,
    /// 1 = run summary, 2 = per-node events.
    #[serde(default = "default_log_level")]
    pub level: u8,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            enabled: default_log_enabled(),
            log_dir: default_log_dir(),
            level: default_log_level(),
        }
    }
}

fn default_log_enabled() -> bool {
    true
}

fn default_log_dir() -> String {
    "~/.chainflow/logs".to_string()
}

fn default_log_level() -> u8 {
    2
}

impl LogConfig {
    pub fn log_path(&self) -> PathBuf {
        expand_home(&self.log_dir)
    }
}

impl AppConfig {
    /// Load config from a TOML file, with env var expansion.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|_| ChainflowError::ConfigNotFound(path.display().to_string()))?;

        let expanded = expand_env_vars(&content);

        let config: Self =
            toml::from_str(&expanded).map_err(|e| ChainflowError::Config(e.to_string()))?;
        config.check()?;
        Ok(config)
    }

    /// Like `load`, but a missing file yields the defaults.
    pub fn load_or_default(path: &Path) -> Result<Self> {
        match Self::load(path) {
            Err(ChainflowError::ConfigNotFound(_)) => Ok(Self::default()),
            other => other,
        }
    }

    fn check(&self) -> Result<()> {
        if self.engine.max_steps == 0 {
            return Err(ChainflowError::Config(
                "engine.max_steps must be at least 1".to_string(),
            ));
        }
        if self.engine.event_capacity == 0 {
            return Err(ChainflowError::Config(
                "engine.event_capacity must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

/// Expand `${ENV_VAR}` patterns in a string.
fn expand_env_vars(input: &str) -> String {
    let mut result = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();

    while let Some(c) = chars.next() {
        if c == '$' && chars.peek() == Some(&'{') {
            chars.next();
            let mut var_name = String::new();
            for c in chars.by_ref() {
                if c == '}' {
                    break;
                }
                var_name.push(c);
            }
            match std::env::var(&var_name) {
                Ok(val) => result.push_str(&val),
                // Keep original if env var not set
                Err(_) => result.push_str(&format!("${{{}}}", var_name)),
            }
        } else {
            result.push(c);
        }
    }
    result
}

fn expand_home(path: &str) -> PathBuf {
    if let Some(rest) = path.strip_prefix("~/") {
        if let Ok(home) = std::env::var("HOME") {
            return PathBuf::from(home).join(rest);
        }
    }
    PathBuf::from(path)
}
