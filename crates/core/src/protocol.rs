// SPDX-License-Identifier: MIT
// Copyright (c) 2026 Alfred Jean LLC

//! WebSocket protocol messages between a sync client and the relay.
//!
//! The protocol is simple:
//! - Client sends requests (answered by id) and opens subscriptions under
//!   tokens it chooses
//! - Server answers requests and pushes subscription data tagged by token

use serde::{Deserialize, Serialize};

use crate::conversation::{Conversation, MembershipChange, NewConversation};
use crate::error::ErrorKind;
use crate::message::{Message, MessageId, MessageKey, MessagePage, SendRequest};

/// Request/response operations.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Request {
    /// Fetch a page of messages strictly older than `before`.
    FetchMessages {
        conversation_id: String,
        limit: usize,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        before: Option<MessageKey>,
    },
    /// Fetch a user's conversation list.
    FetchConversations { user_id: String },
    /// Send a message.
    SendMessage(SendRequest),
    /// Create a conversation.
    CreateConversation(NewConversation),
    /// Add or remove participants.
    MutateMembership {
        conversation_id: String,
        actor_id: String,
        change: MembershipChange,
    },
}

/// Successful results, one per [`Request`] variant.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Response {
    Messages { page: MessagePage },
    Conversations { conversations: Vec<Conversation> },
    Sent { id: MessageId },
    Conversation { conversation: Conversation },
}

/// Live data streams.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "topic", rename_all = "snake_case")]
pub enum Topic {
    /// Messages in a conversation strictly newer than `after`.
    Messages {
        conversation_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        after: Option<MessageKey>,
    },
    /// Snapshots of a user's conversation list.
    Conversations { user_id: String },
}

/// Messages sent from client to server.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    /// A request answered by a Response or Failure with the same id.
    Request {
        id: u64,
        request: Request,
    },

    /// Open a subscription.
    ///
    /// Data for it arrives tagged with `token`.
    Subscribe {
        token: u64,
        topic: Topic,
    },

    /// Close a subscription. Unknown tokens are ignored.
    Unsubscribe {
        token: u64,
    },

    /// Ping message for keepalive.
    Ping {
        /// Client-chosen ID echoed in Pong.
        id: u64,
    },
}

/// Messages sent from server to client.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    /// Successful answer to a request.
    Response {
        id: u64,
        result: Response,
    },

    /// Failed answer to a request.
    Failure {
        id: u64,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        kind: Option<ErrorKind>,
        message: String,
    },

    /// New messages for a message subscription, oldest first.
    Batch {
        token: u64,
        messages: Vec<Message>,
    },

    /// A conversation list snapshot for a conversation subscription.
    Conversations {
        token: u64,
        conversations: Vec<Conversation>,
    },

    /// Pong response to client Ping.
    Pong {
        /// Echoed from the Ping message.
        id: u64,
    },

    /// Error not tied to a request, such as an undecodable frame.
    Error {
        /// Human-readable error description.
        message: String,
    },
}

impl ClientMessage {
    pub fn request(id: u64, request: Request) -> Self {
        ClientMessage::Request { id, request }
    }

    pub fn subscribe(token: u64, topic: Topic) -> Self {
        ClientMessage::Subscribe { token, topic }
    }

    pub fn unsubscribe(token: u64) -> Self {
        ClientMessage::Unsubscribe { token }
    }

    pub fn ping(id: u64) -> Self {
        ClientMessage::Ping { id }
    }

    /// Serializes the message to JSON.
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    /// Deserializes the message from JSON.
    pub fn from_json(s: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(s)
    }
}

impl ServerMessage {
    pub fn response(id: u64, result: Response) -> Self {
        ServerMessage::Response { id, result }
    }

    /// Creates a Failure answer from a core error.
    pub fn failure(id: u64, error: &crate::error::Error) -> Self {
        ServerMessage::Failure { id, kind: error.kind(), message: error.to_string() }
    }

    pub fn batch(token: u64, messages: Vec<Message>) -> Self {
        ServerMessage::Batch { token, messages }
    }

    pub fn conversations(token: u64, conversations: Vec<Conversation>) -> Self {
        ServerMessage::Conversations { token, conversations }
    }

    pub fn pong(id: u64) -> Self {
        ServerMessage::Pong { id }
    }

    pub fn error(message: impl Into<String>) -> Self {
        ServerMessage::Error { message: message.into() }
    }

    /// Serializes the message to JSON.
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    /// Deserializes the message from JSON.
    pub fn from_json(s: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(s)
    }
}

#[cfg(test)]
#[path = "protocol_tests.rs"]
mod tests;
