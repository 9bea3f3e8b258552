// SPDX-License-Identifier: MIT
// Copyright (c) 2026 Alfred Jean LLC

//! Authoritative conversation and message state.
//!
//! The ledger is what a backend holds: it issues canonical ids, assigns
//! strictly increasing ordering timestamps per conversation, keeps
//! conversation summaries (last activity, last message, unread counts) in
//! step with appended messages and records membership changes as system
//! messages. It is not synchronized; callers wrap it in a lock.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use chrono::Duration;
use serde_json::json;

use crate::clock::{ClockSource, SystemClock};
use crate::conversation::{
    sort_for_viewer, Conversation, ConversationKind, ConversationName, MembershipChange,
    MessageSummary, NewConversation,
};
use crate::error::{Error, Result};
use crate::message::{Message, MessageBody, MessageId, MessageKey, MessagePage, SendRequest};

pub struct Ledger {
    clock: Arc<dyn ClockSource>,
    conversations: BTreeMap<String, Conversation>,
    messages: HashMap<String, Vec<Message>>,
    next_message: u64,
    next_conversation: u64,
    echo_client_ids: bool,
}

impl Default for Ledger {
    fn default() -> Self {
        Self::new(Arc::new(SystemClock))
    }
}

impl Ledger {
    pub fn new(clock: Arc<dyn ClockSource>) -> Self {
        Ledger {
            clock,
            conversations: BTreeMap::new(),
            messages: HashMap::new(),
            next_message: 1,
            next_conversation: 1,
            echo_client_ids: true,
        }
    }

    /// Controls whether appended messages carry the sender's client id.
    pub fn set_echo_client_ids(&mut self, echo: bool) {
        self.echo_client_ids = echo;
    }

    pub fn conversation(&self, id: &str) -> Option<&Conversation> {
        self.conversations.get(id)
    }

    /// Conversations `user_id` participates in, ordered for that viewer.
    pub fn conversations_for(&self, user_id: &str) -> Vec<Conversation> {
        let mut list: Vec<Conversation> = self
            .conversations
            .values()
            .filter(|c| c.participants.contains(user_id))
            .cloned()
            .collect();
        sort_for_viewer(&mut list, user_id);
        list
    }

    /// Stores a fully-formed conversation, replacing any with the same id.
    pub fn insert_conversation(&mut self, conversation: Conversation) -> Result<()> {
        conversation.validate()?;
        self.conversations.insert(conversation.id.clone(), conversation);
        Ok(())
    }

    /// Creates a conversation.
    ///
    /// A direct conversation between the same two users is returned as is
    /// rather than duplicated.
    pub fn create_conversation(&mut self, request: &NewConversation) -> Result<Conversation> {
        request.validate()?;
        if request.kind == ConversationKind::Direct {
            let existing = self.conversations.values().find(|c| {
                c.kind == ConversationKind::Direct && c.participants == request.participants
            });
            if let Some(existing) = existing {
                return Ok(existing.clone());
            }
        }

        let now = self.clock.now();
        let id = format!("conv-{:06}", self.next_conversation);
        self.next_conversation += 1;
        let conversation = Conversation {
            id: id.clone(),
            participants: request.participants.clone(),
            kind: request.kind,
            name: request.name.clone().map(ConversationName::Custom).unwrap_or_default(),
            pinned_by: Default::default(),
            last_activity: now,
            last_message: None,
            unread: Default::default(),
            created_at: now,
        };
        self.conversations.insert(id, conversation.clone());
        Ok(conversation)
    }

    /// Appends a message and returns its canonical form.
    pub fn append_message(&mut self, request: &SendRequest) -> Result<Message> {
        if request.body.is_blank() {
            return Err(Error::InvalidInput("message body is empty".to_string()));
        }
        let conversation = self.conversation_mut(&request.conversation_id)?;
        if !conversation.participants.contains(&request.sender_id) {
            return Err(Error::SendFailure(format!(
                "'{}' is not a participant of {}",
                request.sender_id, request.conversation_id
            )));
        }
        let client_id = if self.echo_client_ids { request.client_id.clone() } else { None };
        Ok(self.push(&request.conversation_id, &request.sender_id, request.body.clone(), client_id))
    }

    /// Applies a membership change on behalf of `actor_id` and records it as
    /// a system message.
    pub fn apply_membership(
        &mut self,
        conversation_id: &str,
        actor_id: &str,
        change: &MembershipChange,
    ) -> Result<(Conversation, Message)> {
        let conversation = self.conversation_mut(conversation_id)?;
        conversation.check_membership_change(change)?;
        conversation.apply_membership_change(change);

        let payload = match change {
            MembershipChange::Add { user_ids } => json!({ "user_ids": user_ids }),
            MembershipChange::Remove { user_id } => json!({ "user_id": user_id }),
        };
        let body = MessageBody::system(change.action(), payload);
        let message = self.push(conversation_id, actor_id, body, None);
        let conversation = self.conversation_mut(conversation_id)?.clone();
        Ok((conversation, message))
    }

    /// Returns up to `limit` messages strictly older than `before`, oldest
    /// first.
    pub fn page(
        &self,
        conversation_id: &str,
        limit: usize,
        before: Option<&MessageKey>,
    ) -> Result<MessagePage> {
        if !self.conversations.contains_key(conversation_id) {
            return Err(unknown(conversation_id));
        }
        let all = self.messages.get(conversation_id).map(Vec::as_slice).unwrap_or_default();
        let end = match before {
            Some(bound) => all.partition_point(|m| m.key() < *bound),
            None => all.len(),
        };
        let start = end.saturating_sub(limit);
        Ok(MessagePage { messages: all[start..end].to_vec(), has_more: start > 0 })
    }

    /// Returns every message strictly newer than `after`, oldest first.
    pub fn messages_after(&self, conversation_id: &str, after: Option<&MessageKey>) -> Vec<Message> {
        let all = self.messages.get(conversation_id).map(Vec::as_slice).unwrap_or_default();
        let start = match after {
            Some(cursor) => all.partition_point(|m| m.key() <= *cursor),
            None => 0,
        };
        all[start..].to_vec()
    }

    /// Clears `user_id`'s unread count for a conversation.
    pub fn mark_read(&mut self, conversation_id: &str, user_id: &str) -> Result<()> {
        let conversation = self.conversation_mut(conversation_id)?;
        conversation.unread.remove(user_id);
        Ok(())
    }

    fn conversation_mut(&mut self, id: &str) -> Result<&mut Conversation> {
        self.conversations.get_mut(id).ok_or_else(|| unknown(id))
    }

    fn push(
        &mut self,
        conversation_id: &str,
        sender_id: &str,
        body: MessageBody,
        client_id: Option<String>,
    ) -> Message {
        let now = self.clock.now();
        let log = self.messages.entry(conversation_id.to_string()).or_default();
        let timestamp = match log.last() {
            Some(last) if last.timestamp >= now => last.timestamp + Duration::milliseconds(1),
            _ => now,
        };
        let message = Message {
            id: MessageId::new(format!("msg-{:08}", self.next_message)),
            conversation_id: conversation_id.to_string(),
            sender_id: sender_id.to_string(),
            body,
            created_at: now,
            timestamp,
            client_id,
        };
        self.next_message += 1;
        log.push(message.clone());

        if let Some(conversation) = self.conversations.get_mut(conversation_id) {
            conversation.last_activity = timestamp;
            conversation.last_message = Some(MessageSummary::of(&message));
            let others: Vec<String> =
                conversation.participants.iter().filter(|p| *p != sender_id).cloned().collect();
            for user in others {
                *conversation.unread.entry(user).or_insert(0) += 1;
            }
        }
        message
    }
}

fn unknown(conversation_id: &str) -> Error {
    Error::InvalidInput(format!("unknown conversation: {conversation_id}"))
}

#[cfg(test)]
#[path = "ledger_tests.rs"]
mod tests;
