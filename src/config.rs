//! Configuration loading.
//!
//! Configuration is read from `config.toml` in the platform config directory
//! (`~/.config/timetracker/` on Linux). The file is optional and every field
//! has a default.

use crate::idle::{IdleReminder, DEFAULT_IDLE_THRESHOLD_MINS};
use crate::persistence::Database;
use crate::time_util::{parse_timezone, TimeWindow, WorkWindows};
use chrono::Duration;
use chrono_tz::Tz;
use directories::ProjectDirs;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file {path:?}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("Failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("Unknown timezone '{0}'")]
    InvalidTimezone(String),
    #[error("Invalid work window '{0}', expected HH:MM-HH:MM")]
    InvalidWindow(String),
}

#[derive(Debug, Deserialize, Default)]
pub struct Config {
    /// Default display timezone (IANA name)
    #[serde(default)]
    pub display_timezone: Option<String>,

    #[serde(default)]
    pub storage: StorageConfig,

    #[serde(default)]
    pub logging: LoggingConfig,

    #[serde(default)]
    pub idle: IdleConfig,
}

#[derive(Debug, Deserialize, Default)]
pub struct StorageConfig {
    /// Database file; defaults to the platform data directory
    pub path: Option<PathBuf>,
}

#[derive(Debug, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

fn default_log_level() -> String {
    "warn".to_string()
}

/// Idle reminder settings
#[derive(Debug, Deserialize)]
pub struct IdleConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Minutes without timer activity before a reminder
    #[serde(default = "default_threshold_minutes")]
    pub threshold_minutes: u32,

    /// Zone the work windows are expressed in
    #[serde(default = "default_idle_timezone")]
    pub timezone: String,

    /// Work windows as `HH:MM-HH:MM`
    #[serde(default = "default_windows")]
    pub windows: Vec<String>,
}

impl Default for IdleConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            threshold_minutes: default_threshold_minutes(),
            timezone: default_idle_timezone(),
            windows: default_windows(),
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_threshold_minutes() -> u32 {
    DEFAULT_IDLE_THRESHOLD_MINS as u32
}

fn default_idle_timezone() -> String {
    "Europe/Paris".to_string()
}

fn default_windows() -> Vec<String> {
    vec!["09:30-13:00".to_string(), "14:00-18:00".to_string()]
}

impl IdleConfig {
    /// Builds the idle reminder described by this section.
    pub fn reminder(&self) -> Result<IdleReminder, ConfigError> {
        if !self.enabled {
            return Ok(IdleReminder::disabled());
        }

        let timezone = parse_timezone(&self.timezone)
            .ok_or_else(|| ConfigError::InvalidTimezone(self.timezone.clone()))?;
        let windows = self
            .windows
            .iter()
            .map(|w| TimeWindow::parse(w).ok_or_else(|| ConfigError::InvalidWindow(w.clone())))
            .collect::<Result<Vec<_>, _>>()?;

        Ok(IdleReminder::new(
            WorkWindows { timezone, windows },
            Duration::minutes(i64::from(self.threshold_minutes)),
        ))
    }
}

impl Config {
    /// Loads configuration from the default path, or defaults if there is no file.
    pub fn load() -> Result<Self, ConfigError> {
        match Self::config_path() {
            Some(path) if path.exists() => Self::load_from(&path),
            _ => Ok(Self::default()),
        }
    }

    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Ok(toml::from_str(&content)?)
    }

    /// `<config dir>/config.toml`, if a home directory can be determined.
    pub fn config_path() -> Option<PathBuf> {
        ProjectDirs::from("com", "timetracker", "TimeTracker")
            .map(|dirs| dirs.config_dir().join("config.toml"))
    }

    pub fn database_path(&self) -> PathBuf {
        self.storage
            .path
            .clone()
            .unwrap_or_else(Database::default_path)
    }

    /// The configured display timezone, if set.
    pub fn display_timezone(&self) -> Result<Option<Tz>, ConfigError> {
        self.display_timezone
            .as_deref()
            .map(|name| {
                parse_timezone(name).ok_or_else(|| ConfigError::InvalidTimezone(name.to_string()))
            })
            .transpose()
    }
}
