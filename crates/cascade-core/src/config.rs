use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{CascadeError, Result};

/// Top-level cascade configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub engine: EngineConfig,
    #[serde(default)]
    pub executor: Option<ExecutorConfig>,
    #[serde(default)]
    pub reaper: ReaperConfig,
    #[serde(default)]
    pub destinations: DestinationsConfig,
    #[serde(default)]
    pub log: Option<LogConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// SQLite database path (`~` is expanded).
    #[serde(default = "default_database")]
    pub database: String,
    /// Upper bound on nodes executing concurrently within one run.
    #[serde(default = "default_max_parallel_nodes")]
    pub max_parallel_nodes: usize,
    /// Per-node executor timeout.
    #[serde(default = "default_node_timeout_secs")]
    pub node_timeout_secs: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            database: default_database(),
            max_parallel_nodes: default_max_parallel_nodes(),
            node_timeout_secs: default_node_timeout_secs(),
        }
    }
}

fn default_database() -> String { "~/.cascade/cascade.db".to_string() }
fn default_max_parallel_nodes() -> usize { 4 }
fn default_node_timeout_secs() -> u64 { 300 }

/// Remote node executor endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutorConfig {
    pub endpoint: String,
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default = "default_executor_timeout_secs")]
    pub timeout_secs: u64,
}

fn default_executor_timeout_secs() -> u64 { 120 }

/// Staleness reaper configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReaperConfig {
    #[serde(default = "default_reaper_enabled")]
    pub enabled: bool,
    /// Seconds between sweeps.
    #[serde(default = "default_reaper_interval_secs")]
    pub interval_secs: u64,
    /// Runs in pending/processing untouched for this long are failed.
    #[serde(default = "default_stale_after_secs")]
    pub stale_after_secs: u64,
}

impl Default for ReaperConfig {
    fn default() -> Self {
        Self {
            enabled: default_reaper_enabled(),
            interval_secs: default_reaper_interval_secs(),
            stale_after_secs: default_stale_after_secs(),
        }
    }
}

fn default_reaper_enabled() -> bool { true }
fn default_reaper_interval_secs() -> u64 { 60 }
fn default_stale_after_secs() -> u64 { 600 }

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DestinationsConfig {
    #[serde(default = "default_webhook_timeout_secs")]
    pub webhook_timeout_secs: u64,
}

impl Default for DestinationsConfig {
    fn default() -> Self {
        Self {
            webhook_timeout_secs: default_webhook_timeout_secs(),
        }
    }
}

fn default_webhook_timeout_secs() -> u64 { 15 }

/// JSONL run logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    /// Enable run logging (default: true when section is present).
    #[serde(default = "default_log_enabled")]
    pub enabled: bool,
    /// Directory for log files. Default: ~/.cascade/logs
    #[serde(default)]
    pub log_dir: Option<String>,
    /// 1 = run summary only, 2 = per node, 3 = per destination (default: 2).
    #[serde(default = "default_log_level")]
    pub level: u8,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            log_dir: None,
            level: 2,
        }
    }
}

fn default_log_enabled() -> bool { true }
fn default_log_level() -> u8 { 2 }

impl AppConfig {
    /// Load config from a TOML file, with env var expansion.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|_| CascadeError::ConfigNotFound(path.display().to_string()))?;
        Self::parse(&content)
    }

    /// Parse config from TOML text, with env var expansion.
    pub fn parse(content: &str) -> Result<Self> {
        let expanded = expand_env_vars(content);
        let config: Self =
            toml::from_str(&expanded).map_err(|e| CascadeError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.engine.max_parallel_nodes == 0 {
            return Err(CascadeError::Config(
                "engine.max_parallel_nodes must be at least 1".into(),
            ));
        }
        if self.reaper.stale_after_secs == 0 || self.reaper.stale_after_secs % 60 != 0 {
            return Err(CascadeError::Config(
                "reaper.stale_after_secs must be a positive whole number of minutes".into(),
            ));
        }
        Ok(())
    }

    /// Resolve the database path (expand ~).
    pub fn database_path(&self) -> PathBuf {
        expand_home(&self.engine.database)
    }

    /// Resolve the JSONL log directory.
    pub fn log_dir(&self) -> PathBuf {
        match self.log.as_ref().and_then(|l| l.log_dir.as_deref()) {
            Some(dir) => expand_home(dir),
            None => expand_home("~/.cascade/logs"),
        }
    }
}

fn expand_home(path: &str) -> PathBuf {
    if let Some(rest) = path.strip_prefix("~/") {
        if let Some(home) = dirs_home() {
            return home.join(rest);
        }
    }
    PathBuf::from(path)
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

fn dirs_home() -> Option<PathBuf> {
    std::env::var("HOME").ok().map(PathBuf::from)
}
