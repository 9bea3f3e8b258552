// SPDX-License-Identifier: MIT
// Copyright (c) 2026 Alfred Jean LLC

//! Backend abstraction: the push channel and the remote store.
//!
//! Provides trait-based seams that enable:
//! - An in-process backend for tests and demos ([`MemoryBackend`])
//! - A WebSocket client for the relay ([`WsBackend`])
//!
//! [`Backend`] picks one of the two at construction time from the
//! configured URL.

mod memory;
mod websocket;

use std::fmt;
use std::future::Future;
use std::pin::Pin;

use futures_util::stream::BoxStream;
use parley_core::{
    Conversation, ErrorKind, MembershipChange, MessageBatch, MessageId, MessageKey, MessagePage,
    NewConversation, SendRequest,
};

use crate::config::{BackendConfig, BackendKind};
use crate::error::{Error, Result};

pub use memory::MemoryBackend;
pub use websocket::{ReconnectOptions, WsBackend};

/// Boxed future returned by backend calls.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Error type for backend operations.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BackendError {
    #[error("not authenticated")]
    NotAuthenticated,

    /// The backend could not be reached.
    #[error("backend unavailable: {0}")]
    Unavailable(String),

    /// The backend refused the request.
    #[error("{message}")]
    Rejected { kind: Option<ErrorKind>, message: String },

    /// Connection closed unexpectedly.
    #[error("connection closed")]
    Closed,

    /// Serialization/deserialization failed.
    #[error("serialization error: {0}")]
    Serialization(String),
}

impl BackendError {
    pub fn kind(&self) -> Option<ErrorKind> {
        match self {
            BackendError::NotAuthenticated => Some(ErrorKind::NotAuthenticated),
            BackendError::Unavailable(_) | BackendError::Closed => {
                Some(ErrorKind::NetworkUnavailable)
            }
            BackendError::Rejected { kind, .. } => *kind,
            BackendError::Serialization(_) => None,
        }
    }

    /// Wraps a core error raised while serving a request.
    pub fn rejected(error: &parley_core::Error) -> Self {
        BackendError::Rejected { kind: error.kind(), message: error.to_string() }
    }
}

/// Result type for backend operations.
pub type BackendResult<T> = std::result::Result<T, BackendError>;

/// Handle identifying an open subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriptionToken(pub u64);

impl fmt::Display for SubscriptionToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "sub-{}", self.0)
    }
}

/// An open live subscription.
///
/// The stream yields items in delivery order. An `Err` item means the
/// subscription failed; the stream ends after it. The stream also ends,
/// without an error, once the subscription is closed with
/// [`LiveChannel::unsubscribe`].
pub struct Subscription<T> {
    pub token: SubscriptionToken,
    pub stream: BoxStream<'static, BackendResult<T>>,
}

impl<T> fmt::Debug for Subscription<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription").field("token", &self.token).finish_non_exhaustive()
    }
}

/// Push channel delivering live data.
pub trait LiveChannel: Send + Sync {
    /// Subscribes to messages of a conversation strictly newer than `after`.
    ///
    /// Messages already stored past the cursor are delivered first as one
    /// catch-up batch.
    fn subscribe_messages(
        &self,
        conversation_id: &str,
        after: Option<MessageKey>,
    ) -> BoxFuture<'_, BackendResult<Subscription<MessageBatch>>>;

    /// Subscribes to snapshots of a user's conversation list.
    fn subscribe_conversations(
        &self,
        user_id: &str,
    ) -> BoxFuture<'_, BackendResult<Subscription<Vec<Conversation>>>>;

    /// Closes a subscription. Unknown tokens are ignored.
    fn unsubscribe(&self, token: SubscriptionToken) -> BoxFuture<'_, ()>;
}

/// Request/response access to authoritative state.
pub trait RemoteStore: Send + Sync {
    /// Fetches up to `limit` messages strictly older than `before`, oldest first.
    fn fetch_messages(
        &self,
        conversation_id: &str,
        limit: usize,
        before: Option<MessageKey>,
    ) -> BoxFuture<'_, BackendResult<MessagePage>>;

    fn fetch_conversations(&self, user_id: &str) -> BoxFuture<'_, BackendResult<Vec<Conversation>>>;

    /// Sends a message and returns its canonical id.
    fn send_message(&self, request: SendRequest) -> BoxFuture<'_, BackendResult<MessageId>>;

    fn create_conversation(
        &self,
        request: NewConversation,
    ) -> BoxFuture<'_, BackendResult<Conversation>>;

    /// Applies a membership change on behalf of `actor_id`.
    fn mutate_membership(
        &self,
        conversation_id: &str,
        actor_id: &str,
        change: MembershipChange,
    ) -> BoxFuture<'_, BackendResult<Conversation>>;
}

/// Everything the coordinator needs from a backend.
pub trait ChatBackend: LiveChannel + RemoteStore + 'static {}

impl<T: LiveChannel + RemoteStore + 'static> ChatBackend for T {}

/// Backend selected from configuration.
pub enum Backend {
    Memory(MemoryBackend),
    WebSocket(WsBackend),
}

impl Backend {
    /// Builds the backend named by the configured URL.
    pub fn from_config(config: &BackendConfig) -> Result<Self> {
        match config.kind() {
            Some(BackendKind::Memory) => Ok(Backend::Memory(MemoryBackend::new())),
            Some(BackendKind::WebSocket) => {
                Ok(Backend::WebSocket(WsBackend::new(&config.url, config.reconnect_options())))
            }
            None => Err(Error::Config(format!(
                "invalid backend url '{}': must be mem:, ws:// or wss://",
                config.url
            ))),
        }
    }

    pub fn kind(&self) -> BackendKind {
        match self {
            Backend::Memory(_) => BackendKind::Memory,
            Backend::WebSocket(_) => BackendKind::WebSocket,
        }
    }
}

impl LiveChannel for Backend {
    fn subscribe_messages(
        &self,
        conversation_id: &str,
        after: Option<MessageKey>,
    ) -> BoxFuture<'_, BackendResult<Subscription<MessageBatch>>> {
        match self {
            Backend::Memory(b) => b.subscribe_messages(conversation_id, after),
            Backend::WebSocket(b) => b.subscribe_messages(conversation_id, after),
        }
    }

    fn subscribe_conversations(
        &self,
        user_id: &str,
    ) -> BoxFuture<'_, BackendResult<Subscription<Vec<Conversation>>>> {
        match self {
            Backend::Memory(b) => b.subscribe_conversations(user_id),
            Backend::WebSocket(b) => b.subscribe_conversations(user_id),
        }
    }

    fn unsubscribe(&self, token: SubscriptionToken) -> BoxFuture<'_, ()> {
        match self {
            Backend::Memory(b) => b.unsubscribe(token),
            Backend::WebSocket(b) => b.unsubscribe(token),
        }
    }
}

impl RemoteStore for Backend {
    fn fetch_messages(
        &self,
        conversation_id: &str,
        limit: usize,
        before: Option<MessageKey>,
    ) -> BoxFuture<'_, BackendResult<MessagePage>> {
        match self {
            Backend::Memory(b) => b.fetch_messages(conversation_id, limit, before),
            Backend::WebSocket(b) => b.fetch_messages(conversation_id, limit, before),
        }
    }

    fn fetch_conversations(&self, user_id: &str) -> BoxFuture<'_, BackendResult<Vec<Conversation>>> {
        match self {
            Backend::Memory(b) => b.fetch_conversations(user_id),
            Backend::WebSocket(b) => b.fetch_conversations(user_id),
        }
    }

    fn send_message(&self, request: SendRequest) -> BoxFuture<'_, BackendResult<MessageId>> {
        match self {
            Backend::Memory(b) => b.send_message(request),
            Backend::WebSocket(b) => b.send_message(request),
        }
    }

    fn create_conversation(
        &self,
        request: NewConversation,
    ) -> BoxFuture<'_, BackendResult<Conversation>> {
        match self {
            Backend::Memory(b) => b.create_conversation(request),
            Backend::WebSocket(b) => b.create_conversation(request),
        }
    }

    fn mutate_membership(
        &self,
        conversation_id: &str,
        actor_id: &str,
        change: MembershipChange,
    ) -> BoxFuture<'_, BackendResult<Conversation>> {
        match self {
            Backend::Memory(b) => b.mutate_membership(conversation_id, actor_id, change),
            Backend::WebSocket(b) => b.mutate_membership(conversation_id, actor_id, change),
        }
    }
}

#[cfg(test)]
#[path = "mod_tests.rs"]
mod tests;
