// SPDX-License-Identifier: MIT
// Copyright (c) 2026 Alfred Jean LLC

//! Message types.
//!
//! A message is either canonical (id issued by the backend) or temporary
//! (id issued locally for an optimistic send, carrying the [`TEMP_PREFIX`]
//! marker). Messages within a conversation are totally ordered by
//! [`MessageKey`]: timestamp first, id as tie-break.

use std::cmp::Ordering;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Marker prefix carried by every locally-issued message id.
pub const TEMP_PREFIX: &str = "temp-";

/// Maximum length of a last-message preview, in characters.
pub const PREVIEW_LEN: usize = 80;

/// Identifier of a message, canonical or temporary.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MessageId(String);

impl MessageId {
    /// Wraps a backend-issued id.
    pub fn new(id: impl Into<String>) -> Self {
        MessageId(id.into())
    }

    /// Generates a fresh temporary id.
    pub fn temp() -> Self {
        MessageId(format!("{TEMP_PREFIX}{}", uuid::Uuid::new_v4()))
    }

    /// Returns true if this id was issued locally for an optimistic send.
    pub fn is_temp(&self) -> bool {
        self.0.starts_with(TEMP_PREFIX)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for MessageId {
    fn from(s: &str) -> Self {
        MessageId(s.to_string())
    }
}

/// Content of a message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum MessageBody {
    /// Plain text.
    Text { text: String },
    /// A link to uploaded media.
    Attachment {
        url: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        name: Option<String>,
    },
    /// A system event such as a membership change. Rendering the payload
    /// into text is up to the caller.
    System {
        action: String,
        #[serde(default)]
        payload: serde_json::Value,
    },
}

impl MessageBody {
    /// Creates a text body.
    pub fn text(text: impl Into<String>) -> Self {
        MessageBody::Text { text: text.into() }
    }

    /// Creates an attachment body.
    pub fn attachment(url: impl Into<String>, name: Option<String>) -> Self {
        MessageBody::Attachment { url: url.into(), name }
    }

    /// Creates a system body.
    pub fn system(action: impl Into<String>, payload: serde_json::Value) -> Self {
        MessageBody::System { action: action.into(), payload }
    }

    /// Returns true if the body carries no user content.
    ///
    /// Whitespace-only text and blank attachment urls count as empty.
    pub fn is_blank(&self) -> bool {
        match self {
            MessageBody::Text { text } => text.trim().is_empty(),
            MessageBody::Attachment { url, .. } => url.trim().is_empty(),
            MessageBody::System { action, .. } => action.trim().is_empty(),
        }
    }

    /// Short single-line preview for conversation list summaries.
    pub fn preview(&self) -> String {
        match self {
            MessageBody::Text { text } => {
                let line = text.lines().next().unwrap_or_default();
                if line.chars().count() > PREVIEW_LEN {
                    let cut: String = line.chars().take(PREVIEW_LEN - 1).collect();
                    format!("{cut}…")
                } else {
                    line.to_string()
                }
            }
            MessageBody::Attachment { name: Some(name), .. } => format!("[attachment] {name}"),
            MessageBody::Attachment { name: None, .. } => "[attachment]".to_string(),
            MessageBody::System { action, .. } => format!("[{action}]"),
        }
    }
}

/// Total-order key of a message within its conversation.
///
/// Used as the live subscription cursor (deliver strictly after) and as the
/// exclusive upper bound for older-page fetches.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MessageKey {
    pub timestamp: DateTime<Utc>,
    pub id: MessageId,
}

impl MessageKey {
    pub fn new(timestamp: DateTime<Utc>, id: MessageId) -> Self {
        MessageKey { timestamp, id }
    }
}

impl Ord for MessageKey {
    fn cmp(&self, other: &Self) -> Ordering {
        self.timestamp.cmp(&other.timestamp).then_with(|| self.id.cmp(&other.id))
    }
}

impl PartialOrd for MessageKey {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for MessageKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.id, self.timestamp.to_rfc3339())
    }
}

/// A single message in a conversation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub id: MessageId,
    pub conversation_id: String,
    pub sender_id: String,
    pub body: MessageBody,
    pub created_at: DateTime<Utc>,
    /// Ordering timestamp assigned by the backend.
    pub timestamp: DateTime<Utc>,
    /// Client-generated id echoed back by backends that support it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_id: Option<String>,
}

impl Message {
    /// Returns the ordering key of this message.
    pub fn key(&self) -> MessageKey {
        MessageKey::new(self.timestamp, self.id.clone())
    }

    /// Returns true if this is an optimistic placeholder.
    pub fn is_temp(&self) -> bool {
        self.id.is_temp()
    }

    /// Compares two messages by (timestamp, id).
    pub fn order(a: &Message, b: &Message) -> Ordering {
        a.timestamp.cmp(&b.timestamp).then_with(|| a.id.cmp(&b.id))
    }
}

/// Returns the key of the newest message in a sorted sequence.
pub fn newest_key(messages: &[Message]) -> Option<MessageKey> {
    messages.iter().filter(|m| !m.is_temp()).map(Message::key).max()
}

/// Returns the key of the oldest message in a sorted sequence.
pub fn oldest_key(messages: &[Message]) -> Option<MessageKey> {
    messages.iter().filter(|m| !m.is_temp()).map(Message::key).min()
}

/// A push-delivered group of messages for one conversation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageBatch {
    pub conversation_id: String,
    pub messages: Vec<Message>,
}

impl MessageBatch {
    pub fn new(conversation_id: impl Into<String>, messages: Vec<Message>) -> Self {
        MessageBatch { conversation_id: conversation_id.into(), messages }
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }
}

/// One page of historical messages, oldest first.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessagePage {
    pub messages: Vec<Message>,
    /// Whether older messages exist before this page.
    pub has_more: bool,
}

/// A message submitted to the backend for sending.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SendRequest {
    pub conversation_id: String,
    pub sender_id: String,
    pub body: MessageBody,
    /// Client-generated id the backend may echo on the canonical message.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_id: Option<String>,
}

#[cfg(test)]
#[path = "message_tests.rs"]
mod tests;
