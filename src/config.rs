//! Persistent settings
//!
//! Settings live in a small JSON file. A missing file means defaults.

use crate::error::{AuditError, Result};
use serde::{Deserialize, Serialize};
use std::{
    fmt,
    path::{Path, PathBuf},
};

/// Default settings file, relative to the working directory
pub const DEFAULT_SETTINGS_FILE: &str = ".devaudit.json";

/// Default command used to reach the target
pub const DEFAULT_SHELL: &str = "sh -c";

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub struct Settings {
    /// Data directory whose store is the default baseline
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub diff_data_dir: Option<PathBuf>,

    /// Root of the packaged baselines, one directory per platform version
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub baseline_packages: Option<PathBuf>,

    /// Command prefix used to run scans, split on whitespace (no shell quoting)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub shell: Option<String>,
}

/// Settable keys
#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum SettingKey {
    DiffDataDir,
    BaselinePackages,
    Shell,
}

impl fmt::Display for SettingKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            SettingKey::DiffDataDir => "diff-data-dir",
            SettingKey::BaselinePackages => "baseline-packages",
            SettingKey::Shell => "shell",
        })
    }
}

impl Settings {
    /// Load settings from `path`; a missing file yields the defaults
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = match std::fs::read_to_string(path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Self::default()),
            Err(e) => return Err(e.into()),
        };
        serde_json::from_str(&content)
            .map_err(|e| AuditError::Config(format!("{}: {e}", path.display())))
    }

    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let content = serde_json::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    pub fn get(&self, key: SettingKey) -> Option<String> {
        match key {
            SettingKey::DiffDataDir => self.diff_data_dir.as_ref().map(|p| p.display().to_string()),
            SettingKey::BaselinePackages => self
                .baseline_packages
                .as_ref()
                .map(|p| p.display().to_string()),
            SettingKey::Shell => self.shell.clone(),
        }
    }

    /// Set a key; `None` unsets it
    pub fn set(&mut self, key: SettingKey, value: Option<&str>) {
        match key {
            SettingKey::DiffDataDir => self.diff_data_dir = value.map(PathBuf::from),
            SettingKey::BaselinePackages => self.baseline_packages = value.map(PathBuf::from),
            SettingKey::Shell => self.shell = value.map(str::to_string),
        }
    }

    pub fn shell(&self) -> &str {
        self.shell.as_deref().unwrap_or(DEFAULT_SHELL)
    }
}
