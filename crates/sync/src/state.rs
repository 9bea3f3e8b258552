// SPDX-License-Identifier: MIT
// Copyright (c) 2026 Alfred Jean LLC

//! Observable state published by the coordinator.

use chrono::{DateTime, Utc};
use parley_core::{Conversation, ErrorKind, Message};
use serde::Serialize;

/// What the active conversation is doing while live.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LiveActivity {
    Idle,
    /// At least one optimistic send is in flight.
    Sending,
    /// An older page is being fetched.
    LoadingOlder,
}

/// Lifecycle of the active conversation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case", tag = "phase", content = "activity")]
pub enum SessionPhase {
    /// No conversation has been selected yet.
    Uninitialized,
    /// Cached messages are shown while the network load runs.
    Hydrating,
    /// Subscribed to live updates.
    Live(LiveActivity),
    /// No live subscription: left, torn down, or failed.
    Detached,
}

impl SessionPhase {
    pub fn is_live(&self) -> bool {
        matches!(self, SessionPhase::Live(_))
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct LoadingFlags {
    pub conversations: bool,
    pub messages: bool,
    pub older: bool,
}

/// An error shown to the user until dismissed or replaced.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SurfacedError {
    pub kind: ErrorKind,
    pub message: String,
    pub at: DateTime<Utc>,
}

/// Snapshot of everything a UI renders.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SyncView {
    /// The user's conversations, pinned first then most recent.
    pub conversations: Vec<Conversation>,
    pub active_conversation: Option<String>,
    /// Canonical messages in order, followed by in-flight sends.
    pub messages: Vec<Message>,
    pub phase: SessionPhase,
    pub loading: LoadingFlags,
    /// Whether older messages can be loaded.
    pub has_more: bool,
    pub last_error: Option<SurfacedError>,
}

impl Default for SyncView {
    fn default() -> Self {
        SyncView {
            conversations: Vec::new(),
            active_conversation: None,
            messages: Vec::new(),
            phase: SessionPhase::Uninitialized,
            loading: LoadingFlags::default(),
            has_more: false,
            last_error: None,
        }
    }
}

impl SyncView {
    /// Optimistic placeholders currently shown.
    pub fn pending(&self) -> impl Iterator<Item = &Message> {
        self.messages.iter().filter(|m| m.is_temp())
    }

    pub fn pending_count(&self) -> usize {
        self.pending().count()
    }

    pub fn conversation(&self, id: &str) -> Option<&Conversation> {
        self.conversations.iter().find(|c| c.id == id)
    }

    pub fn error_kind(&self) -> Option<ErrorKind> {
        self.last_error.as_ref().map(|e| e.kind)
    }
}
