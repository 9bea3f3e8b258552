// SPDX-License-Identifier: MIT
// Copyright (c) 2026 Alfred Jean LLC

//! Versioned, TTL-bound, size-bounded local cache.
//!
//! Entries are JSON envelopes `{version, saved_at, payload}` stored in a
//! [`KvStore`] under:
//!
//! - `<ns>:conversations:<user_id>` for a user's conversation list
//! - `<ns>:messages:<conversation_id>` for the newest messages of a conversation
//!
//! An entry whose version differs from [`CACHE_VERSION`], whose age exceeds
//! the TTL, or which cannot be decoded is treated as absent and deleted on
//! read. The cache is an optimization: write failures are logged and never
//! fail the caller.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Duration, Utc};
use serde::de::{DeserializeOwned, IgnoredAny};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::clock::{ClockSource, SystemClock};
use crate::conversation::Conversation;
use crate::error::{Error, Result};
use crate::kv::KvStore;
use crate::message::Message;
use crate::reconcile::union_canonical;

/// Schema version stamped on every entry. Bump when the payload shape changes.
pub const CACHE_VERSION: u32 = 3;

/// Cache tuning.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheConfig {
    /// Key namespace, so several caches can share one store.
    pub namespace: String,
    /// Maximum age of an entry before it is treated as absent.
    pub ttl: Duration,
    /// Maximum number of messages kept per conversation (newest kept).
    pub max_messages: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        CacheConfig {
            namespace: "parley".to_string(),
            ttl: Duration::days(7),
            max_messages: 200,
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct Envelope<T> {
    version: u32,
    saved_at: DateTime<Utc>,
    payload: T,
}

/// Shared local cache for conversation lists and message pages.
pub struct CacheStore {
    kv: Arc<dyn KvStore>,
    clock: Arc<dyn ClockSource>,
    config: CacheConfig,
    /// One guard per key so read-modify-write cycles on different
    /// conversations never block each other.
    guards: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl CacheStore {
    /// Creates a cache over the given store using the system clock.
    pub fn new(kv: Arc<dyn KvStore>, config: CacheConfig) -> Self {
        Self::with_clock(kv, config, Arc::new(SystemClock))
    }

    /// Creates a cache with a custom clock source.
    pub fn with_clock(kv: Arc<dyn KvStore>, config: CacheConfig, clock: Arc<dyn ClockSource>) -> Self {
        CacheStore { kv, clock, config, guards: Mutex::new(HashMap::new()) }
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    fn conversations_key(&self, user_id: &str) -> String {
        format!("{}:conversations:{user_id}", self.config.namespace)
    }

    fn messages_key(&self, conversation_id: &str) -> String {
        format!("{}:messages:{conversation_id}", self.config.namespace)
    }

    /// Returns the guard for `key`. Guards nobody holds are dropped first,
    /// so the map only grows with concurrent access.
    fn guard(&self, key: &str) -> Arc<Mutex<()>> {
        let mut guards = self.guards.lock().unwrap_or_else(|e| e.into_inner());
        guards.retain(|k, g| k == key || Arc::strong_count(g) > 1);
        Arc::clone(guards.entry(key.to_string()).or_default())
    }

    #[cfg(test)]
    fn guard_count(&self) -> usize {
        self.guards.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    /// Returns the cached conversation list for a user.
    pub fn get_conversations(&self, user_id: &str) -> Option<Vec<Conversation>> {
        let key = self.conversations_key(user_id);
        let guard = self.guard(&key);
        let _held = guard.lock().unwrap_or_else(|e| e.into_inner());
        self.read_valid(&key)
    }

    /// Overwrites the cached conversation list for a user.
    pub fn set_conversations(&self, user_id: &str, conversations: &[Conversation]) {
        let key = self.conversations_key(user_id);
        let guard = self.guard(&key);
        let _held = guard.lock().unwrap_or_else(|e| e.into_inner());
        if let Err(e) = self.write(&key, &conversations) {
            warn!(key = %key, error = %e, "failed to cache conversation list");
        }
    }

    /// Returns the cached messages of a conversation, oldest first.
    pub fn get_messages(&self, conversation_id: &str) -> Option<Vec<Message>> {
        let key = self.messages_key(conversation_id);
        let guard = self.guard(&key);
        let _held = guard.lock().unwrap_or_else(|e| e.into_inner());
        self.read_valid(&key)
    }

    /// Merges messages into a conversation's cache entry and returns the
    /// stored result.
    ///
    /// Messages are unioned by id, temp-marked entries are never stored, the
    /// result is sorted by (timestamp, id) and only the newest
    /// `max_messages` are kept. An absent or invalid entry counts as empty.
    pub fn append_messages(&self, conversation_id: &str, new_messages: &[Message]) -> Vec<Message> {
        self.store_messages(conversation_id, new_messages, true)
    }

    /// Overwrites a conversation's cache entry with `messages`, under the
    /// same rules as [`CacheStore::append_messages`].
    pub fn replace_messages(&self, conversation_id: &str, messages: &[Message]) -> Vec<Message> {
        self.store_messages(conversation_id, messages, false)
    }

    fn store_messages(&self, conversation_id: &str, new_messages: &[Message], keep_existing: bool) -> Vec<Message> {
        let key = self.messages_key(conversation_id);
        let guard = self.guard(&key);
        let _held = guard.lock().unwrap_or_else(|e| e.into_inner());

        let existing: Option<Vec<Message>> = self.read_valid(&key);
        let base = if keep_existing { existing.as_deref().unwrap_or_default() } else { &[] };
        let mut merged = union_canonical(base, new_messages);
        if merged.len() > self.config.max_messages {
            let excess = merged.len() - self.config.max_messages;
            merged.drain(..excess);
        }

        let unchanged = match &existing {
            Some(stored) => *stored == merged,
            None => merged.is_empty(),
        };
        if !unchanged {
            if let Err(e) = self.write(&key, &merged) {
                warn!(key = %key, error = %e, "failed to cache messages");
            }
        }
        debug!(
            conversation = conversation_id,
            added = new_messages.len(),
            stored = merged.len(),
            replaced = !keep_existing,
            "cache store"
        );
        merged
    }

    /// Removes a conversation's message entry.
    pub fn clear(&self, conversation_id: &str) -> Result<()> {
        let key = self.messages_key(conversation_id);
        let guard = self.guard(&key);
        let _held = guard.lock().unwrap_or_else(|e| e.into_inner());
        self.kv.remove(&key)
    }

    /// Removes every entry under this cache's namespace.
    pub fn clear_all(&self) -> Result<()> {
        for key in self.kv.keys_with_prefix(&self.namespace_prefix())? {
            self.kv.remove(&key)?;
        }
        Ok(())
    }

    /// Removes every expired, version-mismatched or undecodable entry.
    ///
    /// Returns the number of entries removed.
    pub fn prune_stale(&self) -> Result<usize> {
        let mut removed = 0;
        for key in self.kv.keys_with_prefix(&self.namespace_prefix())? {
            let guard = self.guard(&key);
            let _held = guard.lock().unwrap_or_else(|e| e.into_inner());
            let Some(raw) = self.kv.get(&key)? else {
                continue;
            };
            if let Err(reason) = self.check::<IgnoredAny>(&raw) {
                debug!(key = %key, reason = %reason, "pruning cache entry");
                self.kv.remove(&key)?;
                removed += 1;
            }
        }
        Ok(removed)
    }

    fn namespace_prefix(&self) -> String {
        format!("{}:", self.config.namespace)
    }

    /// Reads and validates an entry, deleting it if it is unusable.
    fn read_valid<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        let raw = match self.kv.get(key) {
            Ok(Some(raw)) => raw,
            Ok(None) => return None,
            Err(e) => {
                warn!(key = %key, error = %e, "cache read failed");
                return None;
            }
        };

        match self.check::<T>(&raw) {
            Ok(payload) => Some(payload),
            Err(reason) => {
                debug!(key = %key, reason = %reason, "discarding cache entry");
                if let Err(e) = self.kv.remove(key) {
                    warn!(key = %key, error = %e, "failed to remove invalid cache entry");
                }
                None
            }
        }
    }

    /// Decodes an envelope and checks its version and age.
    fn check<T: DeserializeOwned>(&self, raw: &str) -> std::result::Result<T, Error> {
        let envelope: Envelope<T> =
            serde_json::from_str(raw).map_err(|e| Error::CacheCorrupt(format!("undecodable: {e}")))?;
        if envelope.version != CACHE_VERSION {
            return Err(Error::CacheCorrupt(format!(
                "version {} (expected {CACHE_VERSION})",
                envelope.version
            )));
        }
        let age = self.clock.now() - envelope.saved_at;
        if age > self.config.ttl {
            return Err(Error::CacheCorrupt(format!("expired {}s ago", (age - self.config.ttl).num_seconds())));
        }
        Ok(envelope.payload)
    }

    fn write<T: Serialize>(&self, key: &str, payload: &T) -> Result<()> {
        let envelope = Envelope { version: CACHE_VERSION, saved_at: self.clock.now(), payload };
        let json = serde_json::to_string(&envelope)?;
        self.kv.put(key, &json)
    }
}

#[cfg(test)]
#[path = "cache_tests.rs"]
mod tests;
