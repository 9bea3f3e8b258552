// SPDX-License-Identifier: MIT
// Copyright (c) 2026 Alfred Jean LLC

//! Conversation types and membership rules.

use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::message::Message;

/// A group must keep at least this many participants.
pub const MIN_GROUP_SIZE: usize = 3;

/// Whether a conversation is one-to-one or a group.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConversationKind {
    /// Exactly two participants, membership is fixed.
    Direct,
    /// Three or more participants.
    Group,
}

impl ConversationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConversationKind::Direct => "direct",
            ConversationKind::Group => "group",
        }
    }
}

impl fmt::Display for ConversationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for ConversationKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "direct" => Ok(ConversationKind::Direct),
            "group" => Ok(ConversationKind::Group),
            _ => Err(Error::InvalidInput(format!(
                "invalid conversation kind: '{s}'\n  hint: valid kinds are: direct, group"
            ))),
        }
    }
}

/// Display-name resolution state.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", content = "name", rename_all = "snake_case")]
pub enum ConversationName {
    /// Nobody has resolved a name yet.
    #[default]
    Unresolved,
    /// Explicitly set by a participant.
    Custom(String),
    /// Derived from participant profiles by an external resolver.
    Resolved(String),
}

/// Summary of the most recent message, for list rendering.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageSummary {
    pub sender_id: String,
    pub preview: String,
    pub timestamp: DateTime<Utc>,
}

impl MessageSummary {
    pub fn of(message: &Message) -> Self {
        MessageSummary {
            sender_id: message.sender_id.clone(),
            preview: message.body.preview(),
            timestamp: message.timestamp,
        }
    }
}

/// A conversation between two or more users.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Conversation {
    pub id: String,
    pub participants: BTreeSet<String>,
    pub kind: ConversationKind,
    #[serde(default)]
    pub name: ConversationName,
    /// Users who pinned this conversation.
    #[serde(default)]
    pub pinned_by: BTreeSet<String>,
    pub last_activity: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_message: Option<MessageSummary>,
    /// Unread counts keyed by participant id.
    #[serde(default)]
    pub unread: BTreeMap<String, u32>,
    pub created_at: DateTime<Utc>,
}

impl Conversation {
    /// Checks the participant invariants.
    pub fn validate(&self) -> Result<()> {
        check_participants(self.kind, &self.participants)?;
        if let Some(stray) = self.unread.keys().find(|u| !self.participants.contains(*u)) {
            return Err(Error::InvalidInput(format!(
                "unread count for '{stray}' who is not a participant of {}",
                self.id
            )));
        }
        Ok(())
    }

    /// Unread count for one user.
    pub fn unread_for(&self, user_id: &str) -> u32 {
        self.unread.get(user_id).copied().unwrap_or(0)
    }

    pub fn is_pinned_by(&self, user_id: &str) -> bool {
        self.pinned_by.contains(user_id)
    }

    /// Name to show to `viewer`.
    pub fn display_name(&self, viewer: &str) -> String {
        match &self.name {
            ConversationName::Custom(name) | ConversationName::Resolved(name) => name.clone(),
            ConversationName::Unresolved => {
                let others: Vec<&str> = self
                    .participants
                    .iter()
                    .map(String::as_str)
                    .filter(|p| *p != viewer)
                    .collect();
                if others.is_empty() {
                    viewer.to_string()
                } else {
                    others.join(", ")
                }
            }
        }
    }

    /// Validates a membership change against the participants known locally.
    ///
    /// Runs before anything is sent to the backend.
    pub fn check_membership_change(&self, change: &MembershipChange) -> Result<()> {
        if self.kind == ConversationKind::Direct {
            return Err(Error::MembershipConstraintViolation(format!(
                "direct conversation {} has fixed membership",
                self.id
            )));
        }
        match change {
            MembershipChange::Add { user_ids } => {
                if user_ids.is_empty() {
                    return Err(Error::InvalidInput("no participants to add".to_string()));
                }
                if let Some(existing) = user_ids.iter().find(|u| self.participants.contains(*u)) {
                    return Err(Error::MembershipConstraintViolation(format!(
                        "'{existing}' is already a participant of {}",
                        self.id
                    )));
                }
                Ok(())
            }
            MembershipChange::Remove { user_id } => {
                if !self.participants.contains(user_id) {
                    return Err(Error::MembershipConstraintViolation(format!(
                        "'{user_id}' is not a participant of {}",
                        self.id
                    )));
                }
                let remaining = self.participants.len() - 1;
                if remaining < MIN_GROUP_SIZE {
                    return Err(Error::MembershipConstraintViolation(format!(
                        "group {} would drop to {remaining} participants (minimum {MIN_GROUP_SIZE})",
                        self.id
                    )));
                }
                Ok(())
            }
        }
    }

    /// Applies an already-validated membership change.
    pub fn apply_membership_change(&mut self, change: &MembershipChange) {
        match change {
            MembershipChange::Add { user_ids } => {
                for user in user_ids {
                    self.participants.insert(user.clone());
                }
            }
            MembershipChange::Remove { user_id } => {
                self.participants.remove(user_id);
                self.unread.remove(user_id);
                self.pinned_by.remove(user_id);
            }
        }
    }
}

/// Checks participant count rules for a conversation kind.
pub fn check_participants(kind: ConversationKind, participants: &BTreeSet<String>) -> Result<()> {
    if participants.iter().any(|p| p.trim().is_empty()) {
        return Err(Error::InvalidInput("participant ids must not be blank".to_string()));
    }
    match kind {
        ConversationKind::Direct if participants.len() != 2 => {
            Err(Error::MembershipConstraintViolation(format!(
                "direct conversations need exactly 2 participants, got {}",
                participants.len()
            )))
        }
        ConversationKind::Group if participants.len() < MIN_GROUP_SIZE => {
            Err(Error::MembershipConstraintViolation(format!(
                "groups need at least {MIN_GROUP_SIZE} participants, got {}",
                participants.len()
            )))
        }
        _ => Ok(()),
    }
}

/// A change to a group's participant set.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "change", rename_all = "snake_case")]
pub enum MembershipChange {
    Add { user_ids: Vec<String> },
    Remove { user_id: String },
}

impl MembershipChange {
    /// System message action recorded when the change is applied.
    pub fn action(&self) -> &'static str {
        match self {
            MembershipChange::Add { .. } => "members_added",
            MembershipChange::Remove { .. } => "member_removed",
        }
    }
}

/// Request to create a conversation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewConversation {
    pub kind: ConversationKind,
    pub creator_id: String,
    /// Participants including the creator.
    pub participants: BTreeSet<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

impl NewConversation {
    /// Builds a request, adding the creator to the participant set.
    pub fn new(
        kind: ConversationKind,
        creator_id: impl Into<String>,
        others: impl IntoIterator<Item = String>,
        name: Option<String>,
    ) -> Self {
        let creator_id = creator_id.into();
        let mut participants: BTreeSet<String> = others.into_iter().collect();
        participants.insert(creator_id.clone());
        NewConversation { kind, creator_id, participants, name }
    }

    pub fn validate(&self) -> Result<()> {
        check_participants(self.kind, &self.participants)
    }
}

/// Orders a conversation list for a viewer: their pinned conversations
/// first, then most recent activity, id as tie-break.
pub fn sort_for_viewer(conversations: &mut [Conversation], viewer: &str) {
    conversations.sort_by(|a, b| compare_for_viewer(a, b, viewer));
}

fn compare_for_viewer(a: &Conversation, b: &Conversation, viewer: &str) -> Ordering {
    b.is_pinned_by(viewer)
        .cmp(&a.is_pinned_by(viewer))
        .then_with(|| b.last_activity.cmp(&a.last_activity))
        .then_with(|| a.id.cmp(&b.id))
}

#[cfg(test)]
#[path = "conversation_tests.rs"]
mod tests;
