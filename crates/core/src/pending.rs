// SPDX-License-Identifier: MIT
// Copyright (c) 2026 Alfred Jean LLC

//! Optimistic sends awaiting their canonical counterpart.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::message::{Message, MessageBody, MessageId, SendRequest};

/// Lifecycle of an optimistic send.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PendingState {
    /// Shown at the tail of the view, waiting for the canonical message.
    InFlight,
    /// The remote send failed. The entry is removed from the view.
    Failed,
    /// The canonical message arrived. The entry is removed from the view.
    Settled,
}

/// A locally-originated message that the backend has not confirmed yet.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingSend {
    pub temp_id: MessageId,
    /// Client-generated id sent along with the message.
    pub client_id: String,
    pub conversation_id: String,
    pub sender_id: String,
    pub body: MessageBody,
    /// Local time the user submitted the message.
    pub submitted_at: DateTime<Utc>,
    pub state: PendingState,
    /// Canonical id returned by the send call, once it has returned.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub canonical_id: Option<MessageId>,
}

impl PendingSend {
    /// Creates an in-flight entry with fresh temp and client ids.
    pub fn new(
        conversation_id: impl Into<String>,
        sender_id: impl Into<String>,
        body: MessageBody,
        submitted_at: DateTime<Utc>,
    ) -> Self {
        PendingSend {
            temp_id: MessageId::temp(),
            client_id: uuid::Uuid::new_v4().to_string(),
            conversation_id: conversation_id.into(),
            sender_id: sender_id.into(),
            body,
            submitted_at,
            state: PendingState::InFlight,
            canonical_id: None,
        }
    }

    pub fn is_in_flight(&self) -> bool {
        self.state == PendingState::InFlight
    }

    /// Renders the placeholder shown in the view.
    pub fn to_message(&self) -> Message {
        Message {
            id: self.temp_id.clone(),
            conversation_id: self.conversation_id.clone(),
            sender_id: self.sender_id.clone(),
            body: self.body.clone(),
            created_at: self.submitted_at,
            timestamp: self.submitted_at,
            client_id: Some(self.client_id.clone()),
        }
    }

    /// Builds the request handed to the backend.
    pub fn to_request(&self) -> SendRequest {
        SendRequest {
            conversation_id: self.conversation_id.clone(),
            sender_id: self.sender_id.clone(),
            body: self.body.clone(),
            client_id: Some(self.client_id.clone()),
        }
    }
}

/// Outstanding optimistic sends in submission order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PendingSet {
    entries: Vec<PendingSend>,
}

impl PendingSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds an entry.
    ///
    /// At most one outstanding entry may exist per (conversation, client id).
    pub fn insert(&mut self, pending: PendingSend) -> Result<()> {
        let duplicate = self.entries.iter().any(|p| {
            p.is_in_flight()
                && p.conversation_id == pending.conversation_id
                && p.client_id == pending.client_id
        });
        if duplicate {
            return Err(Error::DuplicatePending(pending.client_id));
        }
        self.entries.push(pending);
        Ok(())
    }

    pub fn get(&self, temp_id: &MessageId) -> Option<&PendingSend> {
        self.entries.iter().find(|p| &p.temp_id == temp_id)
    }

    /// Records the canonical id returned by a successful send call.
    pub fn record_canonical(&mut self, temp_id: &MessageId, canonical_id: MessageId) -> bool {
        match self.entries.iter_mut().find(|p| &p.temp_id == temp_id) {
            Some(entry) => {
                entry.canonical_id = Some(canonical_id);
                true
            }
            None => false,
        }
    }

    /// Removes an entry and returns it marked with the given final state.
    pub fn resolve(&mut self, temp_id: &MessageId, state: PendingState) -> Option<PendingSend> {
        let index = self.entries.iter().position(|p| &p.temp_id == temp_id)?;
        let mut entry = self.entries.remove(index);
        entry.state = state;
        Some(entry)
    }

    /// Removes every entry whose temp id is listed, marking them settled.
    pub fn settle_all(&mut self, temp_ids: &[MessageId]) -> Vec<PendingSend> {
        let mut settled = Vec::new();
        for temp_id in temp_ids {
            if let Some(entry) = self.resolve(temp_id, PendingState::Settled) {
                settled.push(entry);
            }
        }
        settled
    }

    pub fn as_slice(&self) -> &[PendingSend] {
        &self.entries
    }

    pub fn has_in_flight(&self) -> bool {
        self.entries.iter().any(PendingSend::is_in_flight)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
#[path = "pending_tests.rs"]
mod tests;
