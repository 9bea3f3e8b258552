// SPDX-License-Identifier: MIT
// Copyright (c) 2026 Alfred Jean LLC

//! parley: client-side conversation sync
//!
//! Keeps a local conversation and message cache consistent with a
//! push-based backend, with optimistic sends and read-cost accounting.
//!
//! ```no_run
//! # async fn demo() -> parley::Result<()> {
//! let config = parley::Config::load_or_default(std::path::Path::new("parley.toml"))?;
//! let sync = parley::open(&config, Some("alice".to_string()))?;
//! sync.initialize().await?;
//! sync.select_conversation("conv-000001").await?;
//! sync.send_message("hello")?;
//! # Ok(())
//! # }
//! ```

pub mod backend;
pub mod config;
pub mod coordinator;
pub mod debounce;
pub mod error;
pub mod logging;
pub mod state;

use std::sync::Arc;

use parley_core::{CacheStore, KvStore, MemoryKv, SqliteKv};
use tracing::info;

pub use backend::{
    Backend, BackendError, ChatBackend, LiveChannel, MemoryBackend, RemoteStore, Subscription,
    SubscriptionToken, WsBackend,
};
pub use config::{BackendConfig, BackendKind, CacheSettings, Config, SyncSettings};
pub use coordinator::{SyncCoordinator, SyncOptions};
pub use error::{Error, Result};
pub use state::{LiveActivity, LoadingFlags, SessionPhase, SurfacedError, SyncView};

/// Builds a coordinator from configuration.
///
/// The backend is chosen from `config.backend.url`. The cache lives in a
/// SQLite file unless `cache.persist` is off. Call
/// [`SyncCoordinator::initialize`] before use and
/// [`SyncCoordinator::cleanup`] when done.
pub fn open(config: &Config, user: Option<String>) -> Result<SyncCoordinator> {
    let backend = Backend::from_config(&config.backend)?;
    let kv: Arc<dyn KvStore> = match config.cache.resolved_path() {
        Some(path) => {
            info!(path = %path.display(), "opening cache");
            Arc::new(SqliteKv::open(&path)?)
        }
        None => Arc::new(MemoryKv::new()),
    };
    let cache = Arc::new(CacheStore::new(kv, config.cache.cache_config()));
    Ok(SyncCoordinator::new(backend, cache, user, config.sync.sync_options()))
}

#[cfg(test)]
#[path = "lib_tests.rs"]
mod tests;
