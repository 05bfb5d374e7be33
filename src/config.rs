/*
 * resman - Game resource update and sync engine.
 * Copyright (C) 2025  resman contributors
 *
 * This program is free software: you can redistribute it and/or modify
 * it under the terms of the GNU General Public License as published by
 * the Free Software Foundation, either version 3 of the License, or
 * (at your option) any later version.
 *
 * This program is distributed in the hope that it will be useful,
 * but WITHOUT ANY WARRANTY; without even the implied warranty of
 * MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
 * GNU General Public License for more details.
 *
 * You should have received a copy of the GNU General Public License
 * along with this program.  If not, see <https://www.gnu.org/licenses/>.
 */

//! Engine configuration with validation and defaults.

use crate::scheduler::{MAX_ITEM_ERRORS, PARALLEL_JOBS, POLL_INTERVAL};
use anyhow::{Context, Result};
use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};

/// Consecutive errors on the active mirror before failing over
pub const MAX_MIRROR_ERRORS: usize = 10;

/// Main configuration structure for resman
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Maximum concurrent downloads per wave
    pub parallel_jobs: usize,

    /// Consecutive mirror errors before failover
    pub max_mirror_errors: usize,

    /// Failures of one file before the download is abandoned
    pub max_item_errors: usize,

    /// Longest wait of the transfer loop between stop-flag checks
    pub poll_interval_ms: u64,

    /// Connection timeout in seconds
    pub connect_timeout_secs: u64,

    /// Whole-request timeout in seconds (0 = unlimited)
    pub request_timeout_secs: u64,

    /// User agent sent to HTTP mirrors
    pub user_agent: String,

    /// Logging configuration
    pub logging: LoggingConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            parallel_jobs: PARALLEL_JOBS,
            max_mirror_errors: MAX_MIRROR_ERRORS,
            max_item_errors: MAX_ITEM_ERRORS,
            poll_interval_ms: POLL_INTERVAL.as_millis() as u64,
            connect_timeout_secs: 10,
            request_timeout_secs: 0,
            user_agent: format!("resman/{}", env!("CARGO_PKG_VERSION")),
            logging: LoggingConfig::default(),
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    pub level: String,

    /// Log file path (none = console only)
    pub file: Option<PathBuf>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            file: None,
        }
    }
}

impl Config {
    /// Load configuration with precedence:
    /// 1. ~/.config/resman/config.toml (user)
    /// 2. Environment variables (RESMAN_*)
    ///
    /// An unreadable, malformed or invalid configuration is ignored.
    pub fn load() -> Self {
        let mut config = Config::default();

        if let Some(config_dir) = dirs::config_dir() {
            let user_config = config_dir.join("resman").join("config.toml");
            if user_config.exists() {
                match Config::load_from(&user_config) {
                    Ok(parsed) => config = parsed,
                    Err(e) => tracing::warn!("ignoring {}: {:#}", user_config.display(), e),
                }
            }
        }

        let config = config.apply_env_overrides();
        if let Err(e) = config.validate() {
            tracing::warn!("invalid configuration ({}), using defaults", e);
            return Config::default();
        }
        config
    }

    /// Load configuration from an explicit file
    pub fn load_from(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("failed to read {}", path.display()))?;
        Config::from_toml_str(&content).with_context(|| format!("failed to parse {}", path.display()))
    }

    pub fn from_toml_str(content: &str) -> Result<Self> {
        Ok(toml::from_str::<Config>(content)?)
    }

    /// Apply environment variable overrides
    fn apply_env_overrides(mut self) -> Self {
        if let Ok(val) = std::env::var("RESMAN_PARALLEL_JOBS") {
            if let Ok(n) = val.parse() {
                self.parallel_jobs = n;
            }
        }

        if let Ok(val) = std::env::var("RESMAN_POLL_INTERVAL_MS") {
            if let Ok(n) = val.parse() {
                self.poll_interval_ms = n;
            }
        }

        if let Ok(val) = std::env::var("RESMAN_LOG_LEVEL") {
            self.logging.level = val;
        }

        self
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), String> {
        if self.parallel_jobs == 0 {
            return Err("parallel_jobs must be at least 1".to_string());
        }
        if self.parallel_jobs > 64 {
            return Err("parallel_jobs must be at most 64".to_string());
        }
        if self.max_mirror_errors == 0 {
            return Err("max_mirror_errors must be at least 1".to_string());
        }
        if self.max_item_errors == 0 {
            return Err("max_item_errors must be at least 1".to_string());
        }
        if self.poll_interval_ms == 0 {
            return Err("poll_interval_ms must be at least 1".to_string());
        }
        Ok(())
    }
}
