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

//! Logging setup for embedders.
//!
//! The library only emits `tracing` events. The embedding application calls
//! one of the `init*` functions once to install a subscriber; later calls fail
//! with [`TryInitError`] instead of panicking.

use crate::config::LoggingConfig;
use std::fs::OpenOptions;
use std::path::Path;
use tracing_subscriber::{
    fmt, layer::SubscriberExt, util::SubscriberInitExt, util::TryInitError, EnvFilter,
};

/// Initialize console logging at `info`
pub fn init() -> Result<(), TryInitError> {
    init_with_level("info")
}

/// Initialize console logging; `RUST_LOG` takes precedence over `level`
pub fn init_with_level(level: &str) -> Result<(), TryInitError> {
    tracing_subscriber::registry()
        .with(filter(level))
        .with(
            fmt::layer()
                .with_target(false)
                .with_thread_names(true)
                .compact(),
        )
        .try_init()
}

/// Initialize logging with an additional non-ANSI file sink
pub fn init_with_file(level: &str, log_file: Option<&Path>) -> Result<(), TryInitError> {
    let Some(path) = log_file else {
        return init_with_level(level);
    };

    if let Some(parent) = path.parent() {
        if let Err(e) = std::fs::create_dir_all(parent) {
            eprintln!("cannot create log directory {}: {}", parent.display(), e);
        }
    }

    match OpenOptions::new().create(true).append(true).open(path) {
        Ok(file) => {
            let file_layer = fmt::layer()
                .with_writer(file)
                .with_ansi(false)
                .with_target(true);

            tracing_subscriber::registry()
                .with(filter(level))
                .with(fmt::layer().with_thread_names(true).compact())
                .with(file_layer)
                .try_init()
        }
        Err(e) => {
            eprintln!("cannot open log file {}: {}", path.display(), e);
            init_with_level(level)
        }
    }
}

/// Initialize logging from the `[logging]` config section
pub fn init_from_config(config: &LoggingConfig) -> Result<(), TryInitError> {
    init_with_file(&config.level, config.file.as_deref())
}

fn filter(level: &str) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_second_init_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("logs").join("resman.log");
        // The subscriber is process-wide; keep it silent for the other tests.
        let config = LoggingConfig {
            level: "off".to_string(),
            file: Some(path.clone()),
        };

        // Only one subscriber per process; whichever call comes second must fail.
        let first = init_from_config(&config);
        let second = init_with_level("off");
        assert!(first.is_err() || second.is_err());
    }
}
