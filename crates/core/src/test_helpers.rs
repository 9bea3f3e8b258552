// SPDX-License-Identifier: MIT
// Copyright (c) 2026 Alfred Jean LLC

//! Shared test helpers for core module tests.

use chrono::{DateTime, TimeZone, Utc};

use crate::message::{Message, MessageBody, MessageId};

/// Timestamp at the given number of seconds after a fixed base instant.
pub fn at(secs: i64) -> DateTime<Utc> {
    Utc.timestamp_opt(1_700_000_000 + secs, 0).single().unwrap_or(DateTime::<Utc>::MIN_UTC)
}

/// Create a canonical text message in conversation `c1` from `alice`.
pub fn msg(id: &str, secs: i64) -> Message {
    msg_from(id, secs, "alice", &format!("message {id}"))
}

/// Create a canonical text message with an explicit sender and text.
pub fn msg_from(id: &str, secs: i64, sender: &str, text: &str) -> Message {
    Message {
        id: MessageId::new(id),
        conversation_id: "c1".to_string(),
        sender_id: sender.to_string(),
        body: MessageBody::text(text),
        created_at: at(secs),
        timestamp: at(secs),
        client_id: None,
    }
}

/// Ids of a message sequence, for compact assertions.
pub fn ids(messages: &[Message]) -> Vec<String> {
    messages.iter().map(|m| m.id.to_string()).collect()
}
