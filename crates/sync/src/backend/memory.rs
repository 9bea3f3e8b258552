// SPDX-License-Identifier: MIT
// Copyright (c) 2026 Alfred Jean LLC

//! In-process backend.
//!
//! Holds authoritative state in a [`Ledger`] and pushes changes to
//! subscribers over a broadcast channel. Fault knobs (offline mode, failing
//! sends, held sends and fetches) let tests drive the coordinator through
//! every failure path without a network.

use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use futures_util::stream::{self, StreamExt};
use parley_core::{
    ClockSource, Conversation, Ledger, MembershipChange, Message, MessageBatch, MessageId,
    MessageKey, MessagePage, NewConversation, SendRequest, SystemClock,
};
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::AbortHandle;
use tracing::debug;

use super::{
    BackendError, BackendResult, BoxFuture, LiveChannel, RemoteStore, Subscription,
    SubscriptionToken,
};

const EVENT_CAPACITY: usize = 256;

#[derive(Debug, Clone)]
enum Event {
    /// A message was appended. Carries the conversation's participants.
    Appended { message: Message, participants: BTreeSet<String> },
    /// Messages re-delivered verbatim to message subscribers.
    Replayed { conversation_id: String, messages: Vec<Message> },
    /// A conversation changed. Carries everyone affected.
    Changed { participants: BTreeSet<String> },
    /// The backend went offline. Every subscription fails.
    Disconnected,
}

struct Inner {
    ledger: Mutex<Ledger>,
    events: broadcast::Sender<Event>,
    subscriptions: Mutex<HashMap<SubscriptionToken, AbortHandle>>,
    next_token: AtomicU64,
    offline: AtomicBool,
    fail_sends: AtomicBool,
    send_gate: watch::Sender<bool>,
    fetch_gate: watch::Sender<bool>,
    message_fetches: AtomicU64,
    conversation_fetches: AtomicU64,
    sends: AtomicU64,
    mutations: AtomicU64,
}

/// Authoritative state held in process memory.
#[derive(Clone)]
pub struct MemoryBackend {
    inner: Arc<Inner>,
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    /// Creates a backend whose ledger reads time from `clock`.
    pub fn with_clock(clock: Arc<dyn ClockSource>) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        MemoryBackend {
            inner: Arc::new(Inner {
                ledger: Mutex::new(Ledger::new(clock)),
                events,
                subscriptions: Mutex::new(HashMap::new()),
                next_token: AtomicU64::new(1),
                offline: AtomicBool::new(false),
                fail_sends: AtomicBool::new(false),
                send_gate: watch::Sender::new(true),
                fetch_gate: watch::Sender::new(true),
                message_fetches: AtomicU64::new(0),
                conversation_fetches: AtomicU64::new(0),
                sends: AtomicU64::new(0),
                mutations: AtomicU64::new(0),
            }),
        }
    }

    /// Runs `f` against the ledger without notifying subscribers.
    pub fn with_ledger<R>(&self, f: impl FnOnce(&mut Ledger) -> R) -> R {
        let mut ledger = self.inner.ledger.lock().unwrap_or_else(|e| e.into_inner());
        f(&mut ledger)
    }

    /// Creates a conversation directly, bypassing fault knobs.
    pub fn seed_conversation(&self, request: &NewConversation) -> parley_core::Result<Conversation> {
        let mut ledger = self.inner.ledger.lock().unwrap_or_else(|e| e.into_inner());
        let conversation = ledger.create_conversation(request)?;
        self.emit(Event::Changed { participants: conversation.participants.clone() });
        Ok(conversation)
    }

    /// Appends a message directly, bypassing fault knobs. Subscribers are
    /// notified as for a regular send.
    pub fn inject(&self, request: &SendRequest) -> parley_core::Result<Message> {
        let mut ledger = self.inner.ledger.lock().unwrap_or_else(|e| e.into_inner());
        self.append_locked(&mut ledger, request)
    }

    /// Delivers `messages` again to every subscriber of the conversation.
    pub fn replay(&self, conversation_id: &str, messages: Vec<Message>) {
        self.emit(Event::Replayed { conversation_id: conversation_id.to_string(), messages });
    }

    /// Takes the backend offline (every call fails, open subscriptions
    /// fail) or back online.
    pub fn set_offline(&self, offline: bool) {
        self.inner.offline.store(offline, Ordering::SeqCst);
        if offline {
            self.emit(Event::Disconnected);
        }
    }

    /// Makes every subsequent send fail.
    pub fn fail_sends(&self, fail: bool) {
        self.inner.fail_sends.store(fail, Ordering::SeqCst);
    }

    /// Holds sends until [`MemoryBackend::release_sends`].
    pub fn hold_sends(&self) {
        self.inner.send_gate.send_replace(false);
    }

    pub fn release_sends(&self) {
        self.inner.send_gate.send_replace(true);
    }

    /// Holds message and conversation fetches until
    /// [`MemoryBackend::release_fetches`].
    pub fn hold_fetches(&self) {
        self.inner.fetch_gate.send_replace(false);
    }

    pub fn release_fetches(&self) {
        self.inner.fetch_gate.send_replace(true);
    }

    /// Controls whether canonical messages echo the sender's client id.
    pub fn set_echo_client_ids(&self, echo: bool) {
        self.with_ledger(|ledger| ledger.set_echo_client_ids(echo));
    }

    /// Number of message page fetches served.
    pub fn message_fetches(&self) -> u64 {
        self.inner.message_fetches.load(Ordering::SeqCst)
    }

    /// Number of conversation list fetches served.
    pub fn conversation_fetches(&self) -> u64 {
        self.inner.conversation_fetches.load(Ordering::SeqCst)
    }

    /// Number of send calls received, including failed ones.
    pub fn sends(&self) -> u64 {
        self.inner.sends.load(Ordering::SeqCst)
    }

    /// Number of membership mutation calls received.
    pub fn mutations(&self) -> u64 {
        self.inner.mutations.load(Ordering::SeqCst)
    }

    /// Number of open subscriptions.
    pub fn subscription_count(&self) -> usize {
        let subs = self.inner.subscriptions.lock().unwrap_or_else(|e| e.into_inner());
        subs.iter().filter(|(_, handle)| !handle.is_finished()).count()
    }

    fn emit(&self, event: Event) {
        // No receivers is fine: nobody is subscribed.
        let _ = self.inner.events.send(event);
    }

    /// Appends while the ledger lock is held so events leave in ledger order.
    fn append_locked(&self, ledger: &mut Ledger, request: &SendRequest) -> parley_core::Result<Message> {
        let message = ledger.append_message(request)?;
        let participants = ledger
            .conversation(&request.conversation_id)
            .map(|c| c.participants.clone())
            .unwrap_or_default();
        self.emit(Event::Appended { message: message.clone(), participants });
        Ok(message)
    }

    fn check_online(&self) -> BackendResult<()> {
        if self.inner.offline.load(Ordering::SeqCst) {
            return Err(BackendError::Unavailable("memory backend is offline".to_string()));
        }
        Ok(())
    }

    async fn wait_gate(gate: &watch::Sender<bool>) {
        let mut rx = gate.subscribe();
        // The sender lives as long as the backend, so this only fails if it is gone.
        let _ = rx.wait_for(|open| *open).await;
    }

    /// Spawns the task feeding a subscription and registers it under a new token.
    fn open<T, F>(&self, pump: F) -> Subscription<T>
    where
        T: Send + 'static,
        F: FnOnce(mpsc::UnboundedSender<BackendResult<T>>) -> BoxFuture<'static, ()>,
    {
        let token = SubscriptionToken(self.inner.next_token.fetch_add(1, Ordering::SeqCst));
        let (tx, rx) = mpsc::unbounded_channel();
        let task = tokio::spawn(pump(tx));
        let mut subs = self.inner.subscriptions.lock().unwrap_or_else(|e| e.into_inner());
        subs.retain(|_, handle| !handle.is_finished());
        subs.insert(token, task.abort_handle());
        debug!(token = %token, "memory subscription opened");

        let stream = stream::unfold(rx, |mut rx| async move {
            let item = rx.recv().await?;
            Some((item, rx))
        });
        Subscription { token, stream: stream.boxed() }
    }
}

impl LiveChannel for MemoryBackend {
    fn subscribe_messages(
        &self,
        conversation_id: &str,
        after: Option<MessageKey>,
    ) -> BoxFuture<'_, BackendResult<Subscription<MessageBatch>>> {
        let conversation_id = conversation_id.to_string();
        Box::pin(async move {
            self.check_online()?;
            let inner = Arc::clone(&self.inner);
            Ok(self.open(move |tx| Box::pin(pump_messages(inner, conversation_id, after, tx))))
        })
    }

    fn subscribe_conversations(
        &self,
        user_id: &str,
    ) -> BoxFuture<'_, BackendResult<Subscription<Vec<Conversation>>>> {
        let user_id = user_id.to_string();
        Box::pin(async move {
            self.check_online()?;
            let inner = Arc::clone(&self.inner);
            Ok(self.open(move |tx| Box::pin(pump_conversations(inner, user_id, tx))))
        })
    }

    fn unsubscribe(&self, token: SubscriptionToken) -> BoxFuture<'_, ()> {
        Box::pin(async move {
            let handle = {
                let mut subs = self.inner.subscriptions.lock().unwrap_or_else(|e| e.into_inner());
                subs.remove(&token)
            };
            if let Some(handle) = handle {
                handle.abort();
                debug!(token = %token, "memory subscription closed");
            }
        })
    }
}

/// Feeds a message subscription: one catch-up batch, then live messages.
///
/// The event receiver is created before the catch-up read, and both happen
/// under the ledger lock, so nothing falls between them. Anything the
/// receiver repeats is filtered by the delivered cursor.
async fn pump_messages(
    inner: Arc<Inner>,
    conversation_id: String,
    after: Option<MessageKey>,
    tx: mpsc::UnboundedSender<BackendResult<MessageBatch>>,
) {
    let (mut events, catch_up) = {
        let ledger = inner.ledger.lock().unwrap_or_else(|e| e.into_inner());
        let events = inner.events.subscribe();
        (events, ledger.messages_after(&conversation_id, after.as_ref()))
    };
    let mut cursor = catch_up.iter().map(Message::key).max().or(after);
    if tx.send(Ok(MessageBatch::new(conversation_id.clone(), catch_up))).is_err() {
        return;
    }

    loop {
        let batch = match events.recv().await {
            Ok(Event::Appended { message, .. }) => {
                if message.conversation_id != conversation_id
                    || cursor.as_ref().is_some_and(|c| message.key() <= *c)
                {
                    continue;
                }
                cursor = Some(message.key());
                vec![message]
            }
            Ok(Event::Replayed { conversation_id: target, messages }) => {
                if target != conversation_id {
                    continue;
                }
                messages
            }
            Ok(Event::Changed { .. }) => continue,
            Ok(Event::Disconnected) => {
                let _ = tx.send(Err(BackendError::Unavailable("memory backend went offline".into())));
                return;
            }
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                debug!(skipped, conversation = %conversation_id, "subscriber lagged, catching up");
                let missed = {
                    let ledger = inner.ledger.lock().unwrap_or_else(|e| e.into_inner());
                    ledger.messages_after(&conversation_id, cursor.as_ref())
                };
                if missed.is_empty() {
                    continue;
                }
                cursor = missed.iter().map(Message::key).max().or(cursor);
                missed
            }
            Err(broadcast::error::RecvError::Closed) => return,
        };
        if tx.send(Ok(MessageBatch::new(conversation_id.clone(), batch))).is_err() {
            return;
        }
    }
}

/// Feeds a conversation-list subscription with a snapshot per relevant change.
async fn pump_conversations(
    inner: Arc<Inner>,
    user_id: String,
    tx: mpsc::UnboundedSender<BackendResult<Vec<Conversation>>>,
) {
    let snapshot = |inner: &Inner| {
        let ledger = inner.ledger.lock().unwrap_or_else(|e| e.into_inner());
        ledger.conversations_for(&user_id)
    };

    let mut events = inner.events.subscribe();
    if tx.send(Ok(snapshot(&inner))).is_err() {
        return;
    }

    loop {
        let relevant = match events.recv().await {
            Ok(Event::Appended { participants, .. }) | Ok(Event::Changed { participants }) => {
                participants.contains(&user_id)
            }
            Ok(Event::Replayed { .. }) => false,
            Ok(Event::Disconnected) => {
                let _ = tx.send(Err(BackendError::Unavailable("memory backend went offline".into())));
                return;
            }
            Err(broadcast::error::RecvError::Lagged(_)) => true,
            Err(broadcast::error::RecvError::Closed) => return,
        };
        if relevant && tx.send(Ok(snapshot(&inner))).is_err() {
            return;
        }
    }
}

impl RemoteStore for MemoryBackend {
    fn fetch_messages(
        &self,
        conversation_id: &str,
        limit: usize,
        before: Option<MessageKey>,
    ) -> BoxFuture<'_, BackendResult<MessagePage>> {
        let conversation_id = conversation_id.to_string();
        Box::pin(async move {
            Self::wait_gate(&self.inner.fetch_gate).await;
            self.check_online()?;
            self.inner.message_fetches.fetch_add(1, Ordering::SeqCst);
            self.with_ledger(|ledger| ledger.page(&conversation_id, limit, before.as_ref()))
                .map_err(|e| BackendError::rejected(&e))
        })
    }

    fn fetch_conversations(&self, user_id: &str) -> BoxFuture<'_, BackendResult<Vec<Conversation>>> {
        let user_id = user_id.to_string();
        Box::pin(async move {
            Self::wait_gate(&self.inner.fetch_gate).await;
            self.check_online()?;
            self.inner.conversation_fetches.fetch_add(1, Ordering::SeqCst);
            Ok(self.with_ledger(|ledger| ledger.conversations_for(&user_id)))
        })
    }

    fn send_message(&self, request: SendRequest) -> BoxFuture<'_, BackendResult<MessageId>> {
        Box::pin(async move {
            self.inner.sends.fetch_add(1, Ordering::SeqCst);
            Self::wait_gate(&self.inner.send_gate).await;
            self.check_online()?;
            if self.inner.fail_sends.load(Ordering::SeqCst) {
                return Err(BackendError::Rejected {
                    kind: Some(parley_core::ErrorKind::SendFailure),
                    message: "send rejected by memory backend".to_string(),
                });
            }
            let message = self.inject(&request).map_err(|e| BackendError::rejected(&e))?;
            Ok(message.id)
        })
    }

    fn create_conversation(
        &self,
        request: NewConversation,
    ) -> BoxFuture<'_, BackendResult<Conversation>> {
        Box::pin(async move {
            self.check_online()?;
            self.seed_conversation(&request).map_err(|e| BackendError::rejected(&e))
        })
    }

    fn mutate_membership(
        &self,
        conversation_id: &str,
        actor_id: &str,
        change: MembershipChange,
    ) -> BoxFuture<'_, BackendResult<Conversation>> {
        let conversation_id = conversation_id.to_string();
        let actor_id = actor_id.to_string();
        Box::pin(async move {
            self.inner.mutations.fetch_add(1, Ordering::SeqCst);
            self.check_online()?;
            let mut ledger = self.inner.ledger.lock().unwrap_or_else(|e| e.into_inner());
            let before = ledger
                .conversation(&conversation_id)
                .map(|c| c.participants.clone())
                .unwrap_or_default();
            let (conversation, message) = ledger
                .apply_membership(&conversation_id, &actor_id, &change)
                .map_err(|e| BackendError::rejected(&e))?;

            // Removed members still need to see the conversation disappear.
            let mut affected = before;
            affected.extend(conversation.participants.iter().cloned());
            self.emit(Event::Appended { message, participants: conversation.participants.clone() });
            self.emit(Event::Changed { participants: affected });
            Ok(conversation)
        })
    }
}

#[cfg(test)]
#[path = "memory_tests.rs"]
mod tests;
