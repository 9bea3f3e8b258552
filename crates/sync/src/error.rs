// SPDX-License-Identifier: MIT
// Copyright (c) 2026 Alfred Jean LLC

//! Error types for the sync client.

use parley_core::ErrorKind;

use crate::backend::BackendError;

/// All possible errors returned by the sync client.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error(transparent)]
    Core(#[from] parley_core::Error),

    #[error("backend error: {0}")]
    Backend(#[from] BackendError),

    #[error("config error: {0}")]
    Config(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("toml error: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("no async runtime: {0}")]
    Runtime(#[from] tokio::runtime::TryCurrentError),
}

impl Error {
    /// Returns the user-facing category of this error, if any.
    pub fn kind(&self) -> Option<ErrorKind> {
        match self {
            Error::Core(e) => e.kind(),
            Error::Backend(e) => e.kind(),
            _ => None,
        }
    }
}

/// A specialized Result type for sync client operations.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
#[path = "error_tests.rs"]
mod tests;
