// SPDX-License-Identifier: MIT
// Copyright (c) 2026 Alfred Jean LLC

//! Client configuration.
//!
//! Configuration is read from a `parley.toml` file. Every field has a
//! default, so an empty file is a valid configuration:
//!
//! ```toml
//! [backend]
//! url = "ws://localhost:7890"   # or "mem:" for the in-process backend
//!
//! [cache]
//! ttl_secs = 604800
//! max_messages = 200
//!
//! [sync]
//! page_size = 50
//! conversation_debounce_ms = 250
//! ```

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use parley_core::CacheConfig;
use serde::{Deserialize, Serialize};

use crate::backend::ReconnectOptions;
use crate::coordinator::SyncOptions;
use crate::error::{Error, Result};

const CACHE_FILE_NAME: &str = "cache.db";

/// Top-level configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub backend: BackendConfig,
    #[serde(default)]
    pub cache: CacheSettings,
    #[serde(default)]
    pub sync: SyncSettings,
}

/// The kind of backend named by a URL.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendKind {
    /// In-process backend.
    Memory,
    /// Relay over WebSocket.
    WebSocket,
}

/// Backend connection settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackendConfig {
    /// Backend URL: `mem:` or `ws://...` / `wss://...`.
    #[serde(default = "default_url")]
    pub url: String,
    /// Maximum connection attempts before giving up (default: 10).
    #[serde(default = "default_reconnect_max_retries")]
    pub reconnect_max_retries: u32,
    /// Initial reconnection delay in milliseconds (default: 100).
    #[serde(default = "default_reconnect_initial_delay_ms")]
    pub reconnect_initial_delay_ms: u64,
    /// Maximum delay between reconnection attempts in seconds (default: 30).
    #[serde(default = "default_reconnect_max_delay_secs")]
    pub reconnect_max_delay_secs: u64,
}

impl Default for BackendConfig {
    fn default() -> Self {
        BackendConfig {
            url: default_url(),
            reconnect_max_retries: default_reconnect_max_retries(),
            reconnect_initial_delay_ms: default_reconnect_initial_delay_ms(),
            reconnect_max_delay_secs: default_reconnect_max_delay_secs(),
        }
    }
}

impl BackendConfig {
    /// Determines the backend kind from the URL, or None if unrecognized.
    pub fn kind(&self) -> Option<BackendKind> {
        if self.url == "mem:" || self.url.starts_with("mem://") {
            Some(BackendKind::Memory)
        } else if self.url.starts_with("ws://") || self.url.starts_with("wss://") {
            Some(BackendKind::WebSocket)
        } else {
            None
        }
    }

    pub fn reconnect_options(&self) -> ReconnectOptions {
        ReconnectOptions {
            max_retries: self.reconnect_max_retries,
            initial_delay_ms: self.reconnect_initial_delay_ms,
            max_delay_secs: self.reconnect_max_delay_secs,
        }
    }
}

fn default_url() -> String {
    "mem:".to_string()
}

fn default_reconnect_max_retries() -> u32 {
    10
}

fn default_reconnect_initial_delay_ms() -> u64 {
    100
}

fn default_reconnect_max_delay_secs() -> u64 {
    30
}

/// Local cache settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheSettings {
    /// Key namespace (default: "parley").
    #[serde(default = "default_namespace")]
    pub namespace: String,
    /// Entry lifetime in seconds (default: 7 days).
    #[serde(default = "default_ttl_secs")]
    pub ttl_secs: u64,
    /// Messages kept per conversation (default: 200).
    #[serde(default = "default_max_messages")]
    pub max_messages: usize,
    /// Keep the cache on disk. When false the cache lives in memory only.
    #[serde(default = "default_persist")]
    pub persist: bool,
    /// Cache database path. Defaults to the platform cache directory.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<PathBuf>,
}

impl Default for CacheSettings {
    fn default() -> Self {
        CacheSettings {
            namespace: default_namespace(),
            ttl_secs: default_ttl_secs(),
            max_messages: default_max_messages(),
            persist: default_persist(),
            path: None,
        }
    }
}

impl CacheSettings {
    pub fn cache_config(&self) -> CacheConfig {
        let ttl_secs = i64::try_from(self.ttl_secs).unwrap_or(i64::MAX);
        CacheConfig {
            namespace: self.namespace.clone(),
            ttl: chrono::Duration::try_seconds(ttl_secs).unwrap_or(chrono::Duration::MAX),
            max_messages: self.max_messages,
        }
    }

    /// Where the cache database lives, or None for an in-memory cache.
    pub fn resolved_path(&self) -> Option<PathBuf> {
        if !self.persist {
            return None;
        }
        self.path.clone().or_else(|| dirs::cache_dir().map(|d| d.join("parley").join(CACHE_FILE_NAME)))
    }
}

fn default_namespace() -> String {
    "parley".to_string()
}

fn default_ttl_secs() -> u64 {
    7 * 24 * 60 * 60
}

fn default_max_messages() -> usize {
    200
}

fn default_persist() -> bool {
    true
}

/// Coordinator tuning.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncSettings {
    /// Messages per historical fetch (default: 50).
    #[serde(default = "default_page_size")]
    pub page_size: usize,
    /// Quiet period before a burst of conversation-list snapshots is
    /// published, in milliseconds (default: 250).
    #[serde(default = "default_conversation_debounce_ms")]
    pub conversation_debounce_ms: u64,
    /// Log a warning once this many backend reads have been consumed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub read_warn_threshold: Option<u64>,
}

impl Default for SyncSettings {
    fn default() -> Self {
        SyncSettings {
            page_size: default_page_size(),
            conversation_debounce_ms: default_conversation_debounce_ms(),
            read_warn_threshold: None,
        }
    }
}

impl SyncSettings {
    pub fn conversation_debounce(&self) -> Duration {
        Duration::from_millis(self.conversation_debounce_ms)
    }

    pub fn sync_options(&self) -> SyncOptions {
        SyncOptions {
            page_size: self.page_size,
            conversation_debounce: self.conversation_debounce(),
            read_warn_threshold: self.read_warn_threshold,
        }
    }
}

fn default_page_size() -> usize {
    50
}

fn default_conversation_debounce_ms() -> u64 {
    250
}

impl Config {
    /// Parses configuration from TOML text.
    pub fn from_toml(content: &str) -> Result<Self> {
        let config: Config = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Loads configuration from a file.
    pub fn load(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("failed to read {}: {e}", path.display())))?;
        Self::from_toml(&content)
    }

    /// Loads `path` if it exists, defaults otherwise.
    pub fn load_or_default(path: &Path) -> Result<Self> {
        if path.exists() {
            Self::load(path)
        } else {
            Ok(Config::default())
        }
    }

    fn validate(&self) -> Result<()> {
        if self.backend.kind().is_none() {
            return Err(Error::Config(format!(
                "invalid backend url '{}': must be mem:, ws:// or wss://",
                self.backend.url
            )));
        }
        if self.sync.page_size == 0 {
            return Err(Error::Config("sync.page_size must be at least 1".to_string()));
        }
        if self.cache.max_messages == 0 {
            return Err(Error::Config("cache.max_messages must be at least 1".to_string()));
        }
        Ok(())
    }
}

#[cfg(test)]
#[path = "config_tests.rs"]
mod tests;
