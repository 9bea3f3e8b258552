// SPDX-License-Identifier: MIT
// Copyright (c) 2026 Alfred Jean LLC

//! Relay state.
//!
//! Wraps the authoritative ledger for shared access and fans changes out to
//! connections over a broadcast channel.

use std::collections::BTreeSet;
use std::sync::Arc;

use parley_core::protocol::{Request, Response};
use parley_core::{ClockSource, Conversation, Ledger, Message, MessageKey, Result, SystemClock};
use tokio::sync::{broadcast, Mutex};
use tracing::debug;

const EVENT_CAPACITY: usize = 1024;

/// A change to the ledger, as seen by subscriptions.
#[derive(Debug, Clone)]
pub enum Event {
    /// A message was appended. Carries the conversation's participants.
    Appended { message: Message, participants: BTreeSet<String> },
    /// A conversation changed. Carries everyone affected.
    Changed { participants: BTreeSet<String> },
}

impl Event {
    /// True if `user_id`'s conversation list is affected.
    pub fn concerns(&self, user_id: &str) -> bool {
        match self {
            Event::Appended { participants, .. } | Event::Changed { participants } => {
                participants.contains(user_id)
            }
        }
    }
}

/// Shared relay state.
#[derive(Clone)]
pub struct RelayState {
    inner: Arc<RelayStateInner>,
}

struct RelayStateInner {
    ledger: Mutex<Ledger>,
    events: broadcast::Sender<Event>,
}

impl Default for RelayState {
    fn default() -> Self {
        Self::new(Arc::new(SystemClock))
    }
}

impl RelayState {
    pub fn new(clock: Arc<dyn ClockSource>) -> Self {
        Self::from_ledger(Ledger::new(clock))
    }

    /// Serves an existing ledger.
    pub fn from_ledger(ledger: Ledger) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        RelayState { inner: Arc::new(RelayStateInner { ledger: Mutex::new(ledger), events }) }
    }

    /// Runs a request against the ledger, broadcasting what it changed.
    ///
    /// Events leave while the ledger lock is held, so subscribers see them
    /// in ledger order.
    pub async fn apply(&self, request: Request) -> Result<Response> {
        let mut ledger = self.inner.ledger.lock().await;
        match request {
            Request::FetchMessages { conversation_id, limit, before } => {
                let page = ledger.page(&conversation_id, limit, before.as_ref())?;
                Ok(Response::Messages { page })
            }
            Request::FetchConversations { user_id } => {
                Ok(Response::Conversations { conversations: ledger.conversations_for(&user_id) })
            }
            Request::SendMessage(request) => {
                let message = ledger.append_message(&request)?;
                let participants = participants_of(&ledger, &request.conversation_id);
                let id = message.id.clone();
                self.emit(Event::Appended { message, participants });
                Ok(Response::Sent { id })
            }
            Request::CreateConversation(request) => {
                let conversation = ledger.create_conversation(&request)?;
                self.emit(Event::Changed { participants: conversation.participants.clone() });
                Ok(Response::Conversation { conversation })
            }
            Request::MutateMembership { conversation_id, actor_id, change } => {
                let before = participants_of(&ledger, &conversation_id);
                let (conversation, message) =
                    ledger.apply_membership(&conversation_id, &actor_id, &change)?;

                // Removed members still need to see the conversation disappear.
                let mut affected = before;
                affected.extend(conversation.participants.iter().cloned());
                self.emit(Event::Appended { message, participants: conversation.participants.clone() });
                self.emit(Event::Changed { participants: affected });
                Ok(Response::Conversation { conversation })
            }
        }
    }

    /// Opens a message feed: the messages newer than `after` plus a receiver
    /// for everything appended from now on.
    ///
    /// Both are taken under the ledger lock, so nothing falls between them.
    pub async fn follow_messages(
        &self,
        conversation_id: &str,
        after: Option<&MessageKey>,
    ) -> (Vec<Message>, broadcast::Receiver<Event>) {
        let ledger = self.inner.ledger.lock().await;
        let events = self.inner.events.subscribe();
        (ledger.messages_after(conversation_id, after), events)
    }

    /// Opens a conversation-list feed: the current snapshot plus a receiver
    /// for later changes.
    pub async fn follow_conversations(&self, user_id: &str) -> (Vec<Conversation>, broadcast::Receiver<Event>) {
        let ledger = self.inner.ledger.lock().await;
        let events = self.inner.events.subscribe();
        (ledger.conversations_for(user_id), events)
    }

    pub async fn messages_after(&self, conversation_id: &str, after: Option<&MessageKey>) -> Vec<Message> {
        let ledger = self.inner.ledger.lock().await;
        ledger.messages_after(conversation_id, after)
    }

    pub async fn conversations_for(&self, user_id: &str) -> Vec<Conversation> {
        let ledger = self.inner.ledger.lock().await;
        ledger.conversations_for(user_id)
    }

    /// Runs `f` against the ledger without notifying subscribers.
    pub async fn with_ledger<R>(&self, f: impl FnOnce(&mut Ledger) -> R) -> R {
        let mut ledger = self.inner.ledger.lock().await;
        f(&mut ledger)
    }

    fn emit(&self, event: Event) {
        if self.inner.events.send(event).is_err() {
            debug!("no subscribers for ledger event");
        }
    }
}

fn participants_of(ledger: &Ledger, conversation_id: &str) -> BTreeSet<String> {
    ledger.conversation(conversation_id).map(|c| c.participants.clone()).unwrap_or_default()
}

#[cfg(test)]
#[path = "state_tests.rs"]
mod tests;
