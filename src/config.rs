// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Configuration for torstream.
//!
//! Stored as pretty JSON at `<data_dir>/config.json`. A missing file yields
//! the defaults and missing fields take their per-field defaults, so older
//! config files keep loading.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

/// Environment variable overriding the data directory.
pub const DATA_DIR_ENV: &str = "TORSTREAM_HOME";

/// Config file name inside the data directory.
pub const CONFIG_FILE: &str = "config.json";

const DEFAULT_DATA_DIR: &str = ".torstream";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Config {
    /// Where content is written; `<data_dir>/downloads` when unset
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub download_dir: Option<PathBuf>,
    /// Download list file name inside the data directory
    #[serde(default = "default_store_file")]
    pub store_file: String,
    /// Minimum spacing of progress events in milliseconds
    #[serde(default = "default_progress_interval_ms")]
    pub progress_interval_ms: u64,
    /// Transfer rate of the simulated engine in bytes per second
    #[serde(default = "default_simulated_rate_bps")]
    pub simulated_rate_bps: u64,
    /// How long to wait for the download list file lock
    #[serde(default = "default_lock_timeout_secs")]
    pub lock_timeout_secs: u64,
}

fn default_store_file() -> String {
    "downloads.json".to_string()
}

fn default_progress_interval_ms() -> u64 {
    500
}

fn default_simulated_rate_bps() -> u64 {
    4 * 1024 * 1024
}

fn default_lock_timeout_secs() -> u64 {
    5
}

impl Default for Config {
    fn default() -> Self {
        Self {
            download_dir: None,
            store_file: default_store_file(),
            progress_interval_ms: default_progress_interval_ms(),
            simulated_rate_bps: default_simulated_rate_bps(),
            lock_timeout_secs: default_lock_timeout_secs(),
        }
    }
}

impl Config {
    /// Effective content directory.
    pub fn download_dir(&self, data_dir: &Path) -> PathBuf {
        self.download_dir
            .clone()
            .unwrap_or_else(|| data_dir.join("downloads"))
    }

    /// Path of the persisted download list.
    pub fn store_path(&self, data_dir: &Path) -> PathBuf {
        data_dir.join(&self.store_file)
    }

    pub fn progress_interval(&self) -> Duration {
        Duration::from_millis(self.progress_interval_ms)
    }

    pub fn lock_timeout(&self) -> Duration {
        Duration::from_secs(self.lock_timeout_secs.max(1))
    }

    /// Reject values that would make the program misbehave.
    pub fn validate(&self) -> Result<()> {
        let store_file = Path::new(&self.store_file);
        if self.store_file.trim().is_empty() || store_file.components().count() != 1 {
            anyhow::bail!(
                "store_file must be a plain file name, got '{}'",
                self.store_file
            );
        }
        if self.simulated_rate_bps == 0 {
            anyhow::bail!("simulated_rate_bps must be greater than zero");
        }
        Ok(())
    }
}

/// Resolve the data directory: explicit override, then `TORSTREAM_HOME`,
/// then `~/.torstream`. The directory is created if missing.
pub fn resolve_data_dir(override_dir: Option<&Path>) -> Result<PathBuf> {
    let from_env = std::env::var_os(DATA_DIR_ENV)
        .filter(|v| !v.is_empty())
        .map(PathBuf::from);
    let dir = choose_data_dir(override_dir, from_env, dirs::home_dir())?;

    if !dir.exists() {
        fs::create_dir_all(&dir)
            .with_context(|| format!("Failed to create data directory {}", dir.display()))?;
    }
    Ok(dir)
}

fn choose_data_dir(
    override_dir: Option<&Path>,
    from_env: Option<PathBuf>,
    home: Option<PathBuf>,
) -> Result<PathBuf> {
    if let Some(dir) = override_dir {
        return Ok(dir.to_path_buf());
    }
    if let Some(dir) = from_env {
        return Ok(dir);
    }
    let home = home.context("Could not find home directory; set TORSTREAM_HOME or pass --data-dir")?;
    Ok(home.join(DEFAULT_DATA_DIR))
}

pub fn load_config(data_dir: &Path) -> Result<Config> {
    let config_path = data_dir.join(CONFIG_FILE);
    let config: Config = if config_path.exists() {
        let content = fs::read_to_string(&config_path)
            .with_context(|| format!("Failed to read {}", config_path.display()))?;
        serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse {}", config_path.display()))?
    } else {
        Config::default()
    };

    config.validate()?;
    Ok(config)
}

pub fn save_config(data_dir: &Path, config: &Config) -> Result<()> {
    config.validate()?;
    let config_path = data_dir.join(CONFIG_FILE);
    let content = serde_json::to_string_pretty(config)?;
    fs::write(&config_path, content)
        .with_context(|| format!("Failed to write {}", config_path.display()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_missing_file_gives_defaults() {
        let dir = TempDir::new().unwrap();
        let config = load_config(dir.path()).unwrap();
        assert_eq!(config, Config::default());
        assert_eq!(config.download_dir(dir.path()), dir.path().join("downloads"));
        assert_eq!(config.store_path(dir.path()), dir.path().join("downloads.json"));
        assert_eq!(config.progress_interval(), Duration::from_millis(500));
    }

    #[test]
    fn test_partial_file_uses_field_defaults() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join(CONFIG_FILE), r#"{"progress_interval_ms": 250}"#).unwrap();

        let config = load_config(dir.path()).unwrap();
        assert_eq!(config.progress_interval_ms, 250);
        assert_eq!(config.store_file, "downloads.json");
        assert_eq!(config.lock_timeout_secs, 5);
    }

    #[test]
    fn test_save_then_load() {
        let dir = TempDir::new().unwrap();
        let config = Config {
            download_dir: Some(dir.path().join("media")),
            ..Config::default()
        };
        save_config(dir.path(), &config).unwrap();
        assert_eq!(load_config(dir.path()).unwrap(), config);
    }

    #[test]
    fn test_invalid_values_rejected() {
        let config = Config {
            store_file: "../escape.json".into(),
            ..Config::default()
        };
        assert!(config.validate().is_err());

        let config = Config {
            simulated_rate_bps: 0,
            ..Config::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_corrupt_file_is_error() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join(CONFIG_FILE), "{ nope").unwrap();
        assert!(load_config(dir.path()).is_err());
    }

    #[test]
    fn test_data_dir_precedence() {
        let explicit = PathBuf::from("/explicit");
        let env = Some(PathBuf::from("/from-env"));
        let home = Some(PathBuf::from("/home/user"));

        assert_eq!(
            choose_data_dir(Some(&explicit), env.clone(), home.clone()).unwrap(),
            explicit
        );
        assert_eq!(
            choose_data_dir(None, env, home.clone()).unwrap(),
            PathBuf::from("/from-env")
        );
        assert_eq!(
            choose_data_dir(None, None, home).unwrap(),
            PathBuf::from("/home/user/.torstream")
        );
        assert!(choose_data_dir(None, None, None).is_err());
    }
}
