// SPDX-License-Identifier: MIT
// Copyright (c) 2026 Alfred Jean LLC

//! Logging setup for applications embedding the sync client.
//!
//! The filter comes from `RUST_LOG` and defaults to `info`. Cache and read
//! accounting log at `debug` under the `parley` and `parley::reads` targets.

use std::fs;
use std::path::Path;

use tracing_subscriber::EnvFilter;

use crate::error::Result;

const DEFAULT_FILTER: &str = "info";

/// Installs a global fmt subscriber writing to `log_path`, or to stderr
/// when no path is given.
///
/// Returns `Ok(false)` if a global subscriber was already installed.
pub fn init(log_path: Option<&Path>) -> Result<bool> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));

    let installed = match log_path {
        Some(path) => {
            if let Some(parent) = path.parent() {
                fs::create_dir_all(parent)?;
            }
            let file = fs::OpenOptions::new().create(true).append(true).open(path)?;
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_writer(file)
                .with_ansi(false)
                .try_init()
                .is_ok()
        }
        None => tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .try_init()
            .is_ok(),
    };
    Ok(installed)
}

#[cfg(test)]
#[path = "logging_tests.rs"]
mod tests;
