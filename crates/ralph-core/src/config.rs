//! Configuration parsing for the monitor daemon.
//!
//! Uses the key=value format of `.ralph/config`.
//! Precedence: CLI flags > `--config` file > `.ralph/config` > defaults.

use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

/// Workspace-relative location of the default config file.
pub const DEFAULT_CONFIG_PATH: &str = ".ralph/config";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    ReadError(#[from] std::io::Error),
    #[error("invalid config line: {0}")]
    InvalidLine(String),
    #[error("invalid boolean value for {key}: {value}")]
    InvalidBool { key: String, value: String },
    #[error("invalid integer value for {key}: {value}")]
    InvalidInt { key: String, value: String },
}

/// Monitor configuration.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct Config {
    // Artifacts
    pub artifact_dir: PathBuf,

    // Remote mode
    /// Container to exec into. Setting it switches the daemon to remote mode.
    pub container: Option<String>,
    pub remote_artifact_dir: PathBuf,
    pub docker_bin: String,
    pub remote_timeout_sec: u32,

    // Terminals
    pub tmux_bin: String,
    pub pty_rows: u16,
    pub pty_cols: u16,

    // Change detection
    pub poll_interval_ms: u64,
    pub settle_ms: u64,
    /// Keep polling the remote store while no observer is connected.
    pub poll_when_idle: bool,
    /// Fresh-mode loops with no log activity for this long are not running.
    pub stale_after_sec: u64,

    // Event fan-out
    pub event_capacity: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            artifact_dir: PathBuf::from(".claude"),
            container: None,
            remote_artifact_dir: PathBuf::from("/workspace/.claude"),
            docker_bin: "docker".to_string(),
            remote_timeout_sec: 10,
            tmux_bin: "tmux".to_string(),
            pty_rows: 24,
            pty_cols: 120,
            poll_interval_ms: 2000,
            settle_ms: 300,
            poll_when_idle: false,
            stale_after_sec: 300,
            event_capacity: 256,
        }
    }
}

impl Config {
    /// Load and merge values from a config file.
    pub fn load_file(&mut self, path: &Path) -> Result<(), ConfigError> {
        let content = std::fs::read_to_string(path)?;
        self.parse_content(&content)
    }

    /// Parse config content (key=value format).
    fn parse_content(&mut self, content: &str) -> Result<(), ConfigError> {
        for line in content.lines() {
            let trimmed = line.trim();

            if trimmed.is_empty() || trimmed.starts_with('#') {
                continue;
            }

            let Some((key, value)) = trimmed.split_once('=') else {
                return Err(ConfigError::InvalidLine(line.to_string()));
            };

            let key = key.trim();
            let value = Self::unquote(value.trim());

            self.apply_value(key, &value)?;
        }
        Ok(())
    }

    /// Remove surrounding quotes from a value.
    fn unquote(value: &str) -> String {
        if value.len() >= 2
            && ((value.starts_with('"') && value.ends_with('"'))
                || (value.starts_with('\'') && value.ends_with('\'')))
        {
            return value[1..value.len() - 1].to_string();
        }
        value.to_string()
    }

    fn apply_value(&mut self, key: &str, value: &str) -> Result<(), ConfigError> {
        match key {
            "artifact_dir" => self.artifact_dir = PathBuf::from(value),
            "container" => {
                self.container = if value.is_empty() {
                    None
                } else {
                    Some(value.to_string())
                }
            }
            "remote_artifact_dir" => self.remote_artifact_dir = PathBuf::from(value),
            "docker_bin" => self.docker_bin = value.to_string(),
            "remote_timeout_sec" => self.remote_timeout_sec = Self::parse_int(key, value)?,
            "tmux_bin" => self.tmux_bin = value.to_string(),
            "pty_rows" => self.pty_rows = Self::parse_int(key, value)?,
            "pty_cols" => self.pty_cols = Self::parse_int(key, value)?,
            "poll_interval_ms" => self.poll_interval_ms = Self::parse_nonzero(key, value)?,
            "settle_ms" => self.settle_ms = Self::parse_int(key, value)?,
            "stale_after_sec" => self.stale_after_sec = Self::parse_int(key, value)?,
            "event_capacity" => self.event_capacity = Self::parse_nonzero(key, value)?,
            "poll_when_idle" => self.poll_when_idle = Self::parse_bool(key, value)?,
            _ => {
                // Warn but don't fail for unknown keys
                eprintln!("Warning: unknown config key: {key}");
            }
        }
        Ok(())
    }

    fn parse_int<T: std::str::FromStr>(key: &str, value: &str) -> Result<T, ConfigError> {
        value.parse().map_err(|_| ConfigError::InvalidInt {
            key: key.to_string(),
            value: value.to_string(),
        })
    }

    /// Integer that must be at least 1.
    fn parse_nonzero<T: std::str::FromStr + Default + PartialEq>(
        key: &str,
        value: &str,
    ) -> Result<T, ConfigError> {
        let parsed: T = Self::parse_int(key, value)?;
        if parsed == T::default() {
            return Err(ConfigError::InvalidInt {
                key: key.to_string(),
                value: value.to_string(),
            });
        }
        Ok(parsed)
    }

    fn parse_bool(key: &str, value: &str) -> Result<bool, ConfigError> {
        match value.to_lowercase().as_str() {
            "true" | "1" | "yes" | "y" | "on" => Ok(true),
            "false" | "0" | "no" | "n" | "off" => Ok(false),
            _ => Err(ConfigError::InvalidBool {
                key: key.to_string(),
                value: value.to_string(),
            }),
        }
    }

    /// Resolve relative paths against a workspace root.
    pub fn resolve_paths(&mut self, workspace_root: &Path) {
        if self.artifact_dir.is_relative() {
            self.artifact_dir = workspace_root.join(&self.artifact_dir);
        }
    }

    pub fn is_remote(&self) -> bool {
        self.container.is_some()
    }

    /// Artifact root for the active mode.
    pub fn artifact_root(&self) -> &Path {
        if self.is_remote() {
            &self.remote_artifact_dir
        } else {
            &self.artifact_dir
        }
    }

    pub fn remote_timeout(&self) -> Duration {
        Duration::from_secs(u64::from(self.remote_timeout_sec))
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn settle_window(&self) -> Duration {
        Duration::from_millis(self.settle_ms)
    }

    pub fn stale_after(&self) -> chrono::Duration {
        chrono::Duration::seconds(i64::from(
            u32::try_from(self.stale_after_sec).unwrap_or(u32::MAX),
        ))
    }
}
