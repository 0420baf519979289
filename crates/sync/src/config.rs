// Local configuration for the sync engine: `~/.tether/config.toml`.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::scheduler::SchedulerConfig;
use crate::security::{ensure_owner_only_dir, ensure_owner_only_file};
use crate::sync::SyncSettings;

/// Root directory for Tether global state: `~/.tether/`.
pub fn global_dir() -> Option<PathBuf> {
    dirs::home_dir().map(|h| h.join(".tether"))
}

/// Path to the global config file: `~/.tether/config.toml`.
pub fn global_config_path() -> Option<PathBuf> {
    global_dir().map(|d| d.join("config.toml"))
}

// ── Engine config ──────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct TetherConfig {
    /// Session store base URL (e.g. `https://api.tether.dev`).
    pub api_url: Option<String>,
    /// Platform recorded on created sessions.
    pub platform: String,
    pub organization_id: Option<String>,
    /// Data root holding `tasks/` and `state/`. Defaults to `~/.tether`.
    pub workspace_root: Option<PathBuf>,
    pub sync: SyncConfig,
    pub title: TitleConfig,
}

impl Default for TetherConfig {
    fn default() -> Self {
        Self {
            api_url: None,
            platform: "cli".into(),
            organization_id: None,
            workspace_root: None,
            sync: SyncConfig::default(),
            title: TitleConfig::default(),
        }
    }
}

impl TetherConfig {
    /// Load from `~/.tether/config.toml`. Returns defaults if the file
    /// doesn't exist or can't be parsed.
    pub fn load() -> Self {
        global_config_path().and_then(|p| Self::load_from(&p).ok()).unwrap_or_default()
    }

    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path).map_err(ConfigError::Io)?;
        toml::from_str(&contents).map_err(ConfigError::Parse)
    }

    /// Save to `~/.tether/config.toml`.
    pub fn save(&self) -> Result<(), ConfigError> {
        let path = global_config_path().ok_or_else(|| {
            ConfigError::Io(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                "could not determine home directory",
            ))
        })?;
        self.save_to(&path)
    }

    /// Save to a specific path (creates parent directories).
    pub fn save_to(&self, path: &Path) -> Result<(), ConfigError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(ConfigError::Io)?;
            ensure_owner_only_dir(parent)
                .map_err(|error| ConfigError::Io(std::io::Error::other(error.to_string())))?;
        }
        let contents = toml::to_string_pretty(self).map_err(ConfigError::Serialize)?;
        std::fs::write(path, contents).map_err(ConfigError::Io).and_then(|_| {
            ensure_owner_only_file(path)
                .map_err(|error| ConfigError::Io(std::io::Error::other(error.to_string())))
        })
    }

    /// Configured data root, falling back to `~/.tether`.
    pub fn data_root(&self) -> Option<PathBuf> {
        self.workspace_root.clone().or_else(global_dir)
    }

    pub fn sync_settings(&self) -> SyncSettings {
        SyncSettings {
            platform: self.platform.clone(),
            organization_id: self.organization_id.clone(),
            enabled: self.sync.enabled,
            ..SyncSettings::default()
        }
    }

    pub fn scheduler_config(&self) -> SchedulerConfig {
        SchedulerConfig::new(self.sync.debounce_ms, self.sync.queue_threshold)
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.sync.shutdown_timeout_secs)
    }

    pub fn completion_timeout(&self) -> Duration {
        Duration::from_secs(self.title.completion_timeout_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SyncConfig {
    /// `false` engages the kill-switch: queued changes are dropped.
    pub enabled: bool,
    /// Quiet window before a pass; clamped to 250..=10000.
    pub debounce_ms: u64,
    /// Queue length that triggers a pass without waiting.
    pub queue_threshold: usize,
    /// Upper bound on the final flush at shutdown.
    pub shutdown_timeout_secs: u64,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self { enabled: true, debounce_ms: 1_500, queue_threshold: 20, shutdown_timeout_secs: 10 }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct TitleConfig {
    pub completion_timeout_secs: u64,
}

impl Default for TitleConfig {
    fn default() -> Self {
        Self { completion_timeout_secs: 30 }
    }
}

// ── Errors ─────────────────────────────────────────────────────────

#[derive(Debug)]
pub enum ConfigError {
    Io(std::io::Error),
    Parse(toml::de::Error),
    Serialize(toml::ser::Error),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Io(e) => write!(f, "config I/O error: {e}"),
            Self::Parse(e) => write!(f, "config parse error: {e}"),
            Self::Serialize(e) => write!(f, "config serialize error: {e}"),
        }
    }
}

impl std::error::Error for ConfigError {}
