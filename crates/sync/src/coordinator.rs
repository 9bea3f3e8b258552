// SPDX-License-Identifier: MIT
// Copyright (c) 2026 Alfred Jean LLC

//! Top-level sync orchestration.
//!
//! [`SyncCoordinator`] owns the session for one signed-in user: the
//! conversation list, the active conversation and its live subscription,
//! and optimistic sends. Every change is published as a [`SyncView`]
//! snapshot on a watch channel.
//!
//! Session mutations (hydration results, live batches, older pages, send
//! outcomes) all go through one session guard, which is never held across
//! an await. Each selection gets a new generation number; results tagged
//! with an older generation belong to an abandoned selection and are
//! dropped.

use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use futures_util::stream::{BoxStream, StreamExt};
use parley_core::conversation::sort_for_viewer;
use parley_core::message::{newest_key, oldest_key};
use parley_core::{
    CacheStore, ClockSource, Conversation, ConversationKind, ErrorKind, MembershipChange, Message,
    MessageBatch, MessageBody, MessageId, MessageKey, NewConversation, PendingSend, PendingSet,
    PendingState, ReadAccountant, ReadSource, ReadStats, SystemClock,
};
use tokio::sync::watch;
use tokio::task::AbortHandle;
use tracing::{debug, info, warn};

use crate::backend::{Backend, BackendError, BackendResult, ChatBackend, SubscriptionToken};
use crate::debounce::coalesce;
use crate::error::{Error, Result};
use crate::state::{LiveActivity, LoadingFlags, SessionPhase, SurfacedError, SyncView};

/// Coordinator tuning.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncOptions {
    /// Messages per historical fetch.
    pub page_size: usize,
    /// Quiet period before a burst of conversation-list snapshots is applied.
    pub conversation_debounce: Duration,
    /// Log a warning once this many backend reads have been consumed.
    pub read_warn_threshold: Option<u64>,
}

impl Default for SyncOptions {
    fn default() -> Self {
        SyncOptions {
            page_size: 50,
            conversation_debounce: Duration::from_millis(250),
            read_warn_threshold: None,
        }
    }
}

/// Handle to the sync engine. Clones share the same session.
pub struct SyncCoordinator<B: ChatBackend = Backend> {
    inner: Arc<Inner<B>>,
}

impl<B: ChatBackend> Clone for SyncCoordinator<B> {
    fn clone(&self) -> Self {
        SyncCoordinator { inner: Arc::clone(&self.inner) }
    }
}

struct Inner<B> {
    backend: B,
    cache: Arc<CacheStore>,
    accountant: ReadAccountant,
    clock: Arc<dyn ClockSource>,
    user: Option<String>,
    options: SyncOptions,
    session: Mutex<Session>,
    view: watch::Sender<SyncView>,
}

#[derive(Default)]
struct Session {
    initialized: bool,
    loading_conversations: bool,
    conversations: Vec<Conversation>,
    conversation_feed: Option<Feed>,
    /// Bumped on every selection change.
    generation: u64,
    active: Option<ActiveConversation>,
    /// Whether a conversation was ever selected.
    detached: bool,
    /// Optimistic sends across all conversations.
    pending: PendingSet,
    last_error: Option<SurfacedError>,
}

/// Where a selection gets its first page from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Hydration {
    /// Cached messages first; the network only on a miss.
    CacheFirst,
    /// Always one fresh page, which then replaces the cache entry.
    Network,
}

/// A live subscription and the task draining it.
struct Feed {
    token: SubscriptionToken,
    pump: AbortHandle,
}

struct ActiveConversation {
    id: String,
    generation: u64,
    /// Hydrating, Live(Idle) or Detached. Activity is derived when publishing.
    phase: SessionPhase,
    /// Canonical messages held for display, sorted.
    canonical: Vec<Message>,
    has_more: bool,
    loading_older: bool,
    feed: Option<Feed>,
}

impl ActiveConversation {
    fn new(id: &str, generation: u64) -> Self {
        ActiveConversation {
            id: id.to_string(),
            generation,
            phase: SessionPhase::Hydrating,
            canonical: Vec::new(),
            has_more: false,
            loading_older: false,
            feed: None,
        }
    }
}

impl Session {
    /// The active conversation, if it still belongs to `generation`.
    fn current(&mut self, generation: u64) -> Option<&mut ActiveConversation> {
        self.active.as_mut().filter(|a| a.generation == generation)
    }

    fn pending_for(&self, conversation_id: &str) -> Vec<PendingSend> {
        self.pending
            .as_slice()
            .iter()
            .filter(|p| p.conversation_id == conversation_id)
            .cloned()
            .collect()
    }

    /// Merges canonical messages into the active conversation of
    /// `generation` and settles the sends they confirm.
    fn absorb(&mut self, generation: u64, messages: &[Message]) {
        let Some(active) = self.active.as_mut().filter(|a| a.generation == generation) else {
            return;
        };
        let pending: Vec<PendingSend> = self
            .pending
            .as_slice()
            .iter()
            .filter(|p| p.conversation_id == active.id)
            .cloned()
            .collect();
        let reconciled = parley_core::reconcile(&active.canonical, messages, &pending);
        active.canonical = reconciled.canonical;
        let settled = self.pending.settle_all(&reconciled.settled);
        if !settled.is_empty() {
            debug!(settled = settled.len(), "optimistic sends reconciled");
        }
    }

    /// Drops the active conversation and returns its subscription token.
    fn detach(&mut self) -> Option<SubscriptionToken> {
        self.generation += 1;
        let active = self.active.take()?;
        self.detached = true;
        active.feed.map(|feed| {
            feed.pump.abort();
            feed.token
        })
    }

    fn upsert_conversation(&mut self, conversation: Conversation, viewer: &str) {
        self.conversations.retain(|c| c.id != conversation.id);
        if conversation.participants.contains(viewer) {
            self.conversations.push(conversation);
        }
        sort_for_viewer(&mut self.conversations, viewer);
    }
}

impl<B: ChatBackend> SyncCoordinator<B> {
    /// Creates a coordinator for `user`. Without a user every network
    /// operation fails with `NotAuthenticated`.
    pub fn new(backend: B, cache: Arc<CacheStore>, user: Option<String>, options: SyncOptions) -> Self {
        Self::with_clock(backend, cache, user, options, Arc::new(SystemClock))
    }

    /// Creates a coordinator that timestamps sends and errors with `clock`.
    pub fn with_clock(
        backend: B,
        cache: Arc<CacheStore>,
        user: Option<String>,
        options: SyncOptions,
        clock: Arc<dyn ClockSource>,
    ) -> Self {
        let accountant = match options.read_warn_threshold {
            Some(threshold) => ReadAccountant::with_warn_threshold(threshold),
            None => ReadAccountant::new(),
        };
        SyncCoordinator {
            inner: Arc::new(Inner {
                backend,
                cache,
                accountant,
                clock,
                user,
                options,
                session: Mutex::new(Session::default()),
                view: watch::Sender::new(SyncView::default()),
            }),
        }
    }

    pub fn backend(&self) -> &B {
        &self.inner.backend
    }

    pub fn user(&self) -> Option<&str> {
        self.inner.user.as_deref()
    }

    /// Current snapshot of the observable state.
    pub fn view(&self) -> SyncView {
        self.inner.view.borrow().clone()
    }

    /// Receiver notified on every state change.
    pub fn subscribe_view(&self) -> watch::Receiver<SyncView> {
        self.inner.view.subscribe()
    }

    pub fn read_stats(&self) -> ReadStats {
        self.inner.accountant.stats()
    }

    /// Loads the conversation list and starts following it.
    ///
    /// Stale cache entries are pruned first. A cached list is shown at once;
    /// otherwise the subscription's first snapshot is the initial load, so
    /// the list is read once either way. Calling this again once it has
    /// succeeded does nothing.
    pub async fn initialize(&self) -> Result<()> {
        let inner = &self.inner;
        let user = inner.require_user()?;
        {
            let mut session = inner.lock();
            if session.initialized {
                return Ok(());
            }
            session.initialized = true;
        }

        match inner.cache.prune_stale() {
            Ok(0) => {}
            Ok(removed) => debug!(removed, "pruned stale cache entries"),
            Err(e) => warn!(error = %e, "cache pruning failed"),
        }

        let cached = inner.cache.get_conversations(&user);
        let cold = cached.is_none();
        {
            let mut session = inner.lock();
            match cached {
                Some(cached) => {
                    // The subscription still reads the list, so nothing is saved.
                    inner.accountant.record_hit(ReadSource::ConversationList, 0);
                    session.conversations = cached;
                    sort_for_viewer(&mut session.conversations, &user);
                }
                None => session.loading_conversations = true,
            }
            inner.publish(&session);
        }

        let subscription = match inner.backend.subscribe_conversations(&user).await {
            Ok(subscription) => subscription,
            Err(e) => {
                inner.abandon_initialize(e.kind().unwrap_or(ErrorKind::SubscriptionFailure), &e);
                return Err(e.into());
            }
        };
        let token = subscription.token;
        let mut stream = subscription.stream;

        if cold {
            let loaded = match stream.next().await {
                Some(Ok(list)) => Ok(list),
                Some(Err(e)) => Err(e),
                None => Err(BackendError::Closed),
            };
            match loaded {
                Ok(list) => inner.apply_conversations(&user, list),
                Err(e) => {
                    inner.abandon_initialize(e.kind().unwrap_or(ErrorKind::SubscriptionFailure), &e);
                    inner.backend.unsubscribe(token).await;
                    return Err(e.into());
                }
            }
        }

        let snapshots = coalesce(stream, inner.options.conversation_debounce);
        let pump = tokio::spawn(pump_conversations(Arc::downgrade(inner), user.clone(), snapshots));
        let stale = {
            let mut session = inner.lock();
            session.conversation_feed.replace(Feed { token, pump: pump.abort_handle() })
        };
        if let Some(stale) = stale {
            stale.pump.abort();
            inner.backend.unsubscribe(stale.token).await;
        }
        info!(user = %user, "sync initialized");
        Ok(())
    }

    /// Makes `conversation_id` the active conversation.
    ///
    /// Cached messages are published before anything touches the network.
    /// With a cached cursor the live subscription starts strictly after it;
    /// without one, one page is fetched first and the subscription starts
    /// after that page. Selecting the conversation that is already
    /// hydrating or live does nothing.
    pub async fn select_conversation(&self, conversation_id: &str) -> Result<()> {
        let inner = &self.inner;
        inner.require_user()?;
        let (generation, previous) = {
            let mut session = inner.lock();
            let already = session.active.as_ref().is_some_and(|a| {
                a.id == conversation_id && matches!(a.phase, SessionPhase::Hydrating | SessionPhase::Live(_))
            });
            if already {
                return Ok(());
            }
            let previous = session.detach();
            let generation = session.generation;
            session.active = Some(ActiveConversation::new(conversation_id, generation));
            inner.publish(&session);
            (generation, previous)
        };
        if let Some(token) = previous {
            inner.backend.unsubscribe(token).await;
        }
        inner.hydrate(generation, conversation_id, Hydration::CacheFirst).await
    }

    /// Unsubscribes from the active conversation and clears it.
    pub async fn leave_conversation(&self) {
        let inner = &self.inner;
        let token = {
            let mut session = inner.lock();
            let token = session.detach();
            inner.publish(&session);
            token
        };
        if let Some(token) = token {
            inner.backend.unsubscribe(token).await;
        }
    }

    /// Sends a text message optimistically.
    ///
    /// The placeholder is shown at once and the send runs in the background
    /// on the current tokio runtime. Returns the placeholder's temp id, or
    /// `None` for blank input. Called outside a runtime it fails without
    /// queueing anything.
    pub fn send_message(&self, text: &str) -> Result<Option<MessageId>> {
        self.send_body(MessageBody::text(text))
    }

    /// Sends a link to already-uploaded media optimistically.
    pub fn send_attachment(&self, url: &str, name: Option<String>) -> Result<Option<MessageId>> {
        self.send_body(MessageBody::attachment(url, name))
    }

    fn send_body(&self, body: MessageBody) -> Result<Option<MessageId>> {
        if body.is_blank() {
            return Ok(None);
        }
        let inner = &self.inner;
        let user = inner.require_user()?;
        let runtime = tokio::runtime::Handle::try_current()?;
        let pending = {
            let mut session = inner.lock();
            let Some(conversation_id) = session.active.as_ref().map(|a| a.id.clone()) else {
                return Err(parley_core::Error::InvalidInput("no active conversation".to_string()).into());
            };
            let pending = PendingSend::new(conversation_id, user, body, inner.clock.now());
            session.pending.insert(pending.clone())?;
            inner.publish(&session);
            pending
        };

        let task_inner = Arc::clone(inner);
        let temp_id = pending.temp_id.clone();
        runtime.spawn(async move {
            let result = task_inner.backend.send_message(pending.to_request()).await;
            task_inner.finish_send(&pending, result);
        });
        Ok(Some(temp_id))
    }

    /// Fetches the page before the oldest message shown.
    ///
    /// Does nothing without an earlier page, while hydrating, or while a
    /// load is already running.
    pub async fn load_more_messages(&self) -> Result<()> {
        let inner = &self.inner;
        let (generation, conversation_id, before) = {
            let mut session = inner.lock();
            let Some(active) = session.active.as_mut() else {
                return Ok(());
            };
            if !active.has_more || active.loading_older || !active.phase.is_live() {
                return Ok(());
            }
            let Some(before) = oldest_key(&active.canonical) else {
                return Ok(());
            };
            active.loading_older = true;
            let request = (active.generation, active.id.clone(), before);
            inner.publish(&session);
            request
        };

        let fetched =
            inner.backend.fetch_messages(&conversation_id, inner.options.page_size, Some(before)).await;

        let mut session = inner.lock();
        let Some(active) = session.current(generation) else {
            debug!(conversation = %conversation_id, "discarding older page for abandoned conversation");
            return Ok(());
        };
        active.loading_older = false;
        match fetched {
            Ok(page) => {
                inner.accountant.record_miss(ReadSource::OlderPage, reads(page.messages.len()));
                active.has_more = page.has_more;
                inner.cache.append_messages(&conversation_id, &page.messages);
                session.absorb(generation, &page.messages);
                inner.publish(&session);
                Ok(())
            }
            Err(e) => {
                inner.surface(&mut session, e.kind().unwrap_or(ErrorKind::NetworkUnavailable), &e);
                Err(e.into())
            }
        }
    }

    /// Reloads the active conversation from the network.
    ///
    /// The cached cursor and pagination state are ignored and one fresh page
    /// is fetched. Displayed messages stay until that page lands, and the
    /// cache entry is only replaced once it has. A failed reload leaves both
    /// untouched. Optimistic sends in flight are kept. A conversation-list
    /// subscription that has ended is reopened.
    pub async fn refresh(&self) -> Result<()> {
        let inner = &self.inner;
        inner.require_user()?;
        let (reload, token, reinitialize) = {
            let mut session = inner.lock();
            let feed_ended = session.conversation_feed.as_ref().is_some_and(|f| f.pump.is_finished());
            let reinitialize = session.initialized && feed_ended;
            if reinitialize {
                session.initialized = false;
            }
            let shown = session.active.as_mut().map(|a| (a.id.clone(), std::mem::take(&mut a.canonical)));
            let token = session.detach();
            let reload = shown.map(|(id, canonical)| {
                let generation = session.generation;
                let mut active = ActiveConversation::new(&id, generation);
                active.canonical = canonical;
                session.active = Some(active);
                (generation, id)
            });
            inner.publish(&session);
            (reload, token, reinitialize)
        };
        if let Some(token) = token {
            inner.backend.unsubscribe(token).await;
        }
        if reinitialize {
            if let Err(e) = self.initialize().await {
                warn!(error = %e, "conversation list did not resume");
            }
        }
        let Some((generation, conversation_id)) = reload else {
            return Ok(());
        };
        info!(conversation = %conversation_id, "refreshing conversation");
        inner.hydrate(generation, &conversation_id, Hydration::Network).await
    }

    /// Tears the session down: unsubscribes everything.
    ///
    /// Displayed data is kept. [`SyncCoordinator::initialize`] may be
    /// called again afterwards.
    pub async fn cleanup(&self) {
        let inner = &self.inner;
        let tokens: Vec<SubscriptionToken> = {
            let mut session = inner.lock();
            let mut tokens = Vec::new();
            if let Some(feed) = session.conversation_feed.take() {
                feed.pump.abort();
                tokens.push(feed.token);
            }
            if session.active.is_some() {
                tokens.extend(session.detach());
            }
            session.initialized = false;
            inner.publish(&session);
            tokens
        };
        for token in tokens {
            inner.backend.unsubscribe(token).await;
        }
        info!("sync cleaned up");
    }

    /// Creates a conversation with the current user as creator.
    pub async fn create_conversation(
        &self,
        kind: ConversationKind,
        participants: impl IntoIterator<Item = String>,
        name: Option<String>,
    ) -> Result<Conversation> {
        let inner = &self.inner;
        let user = inner.require_user()?;
        let request = NewConversation::new(kind, user.clone(), participants, name);
        if let Err(e) = request.validate() {
            return Err(inner.reject(e));
        }
        match inner.backend.create_conversation(request).await {
            Ok(conversation) => {
                inner.apply_conversation(&user, conversation.clone());
                Ok(conversation)
            }
            Err(e) => {
                let mut session = inner.lock();
                inner.surface(&mut session, e.kind().unwrap_or(ErrorKind::NetworkUnavailable), &e);
                Err(e.into())
            }
        }
    }

    /// Adds participants to a group.
    pub async fn add_participants(&self, conversation_id: &str, user_ids: Vec<String>) -> Result<Conversation> {
        self.mutate_membership(conversation_id, MembershipChange::Add { user_ids }).await
    }

    /// Removes one participant from a group.
    pub async fn remove_participant(&self, conversation_id: &str, user_id: &str) -> Result<Conversation> {
        self.mutate_membership(conversation_id, MembershipChange::Remove { user_id: user_id.to_string() })
            .await
    }

    /// Validates against the participants known locally, then applies.
    async fn mutate_membership(&self, conversation_id: &str, change: MembershipChange) -> Result<Conversation> {
        let inner = &self.inner;
        let user = inner.require_user()?;
        let checked = {
            let session = inner.lock();
            match session.conversations.iter().find(|c| c.id == conversation_id) {
                Some(conversation) => conversation.check_membership_change(&change),
                None => Err(parley_core::Error::InvalidInput(format!(
                    "unknown conversation: {conversation_id}"
                ))),
            }
        };
        if let Err(e) = checked {
            return Err(inner.reject(e));
        }

        match inner.backend.mutate_membership(conversation_id, &user, change).await {
            Ok(conversation) => {
                inner.apply_conversation(&user, conversation.clone());
                Ok(conversation)
            }
            Err(e) => {
                let mut session = inner.lock();
                inner.surface(&mut session, e.kind().unwrap_or(ErrorKind::NetworkUnavailable), &e);
                Err(e.into())
            }
        }
    }

    /// Clears the surfaced error.
    pub fn dismiss_error(&self) {
        let mut session = self.inner.lock();
        if session.last_error.take().is_some() {
            self.inner.publish(&session);
        }
    }
}

impl<B: ChatBackend> Inner<B> {
    fn lock(&self) -> std::sync::MutexGuard<'_, Session> {
        self.session.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn require_user(&self) -> Result<String> {
        match &self.user {
            Some(user) => Ok(user.clone()),
            None => {
                let error = parley_core::Error::NotAuthenticated;
                let mut session = self.lock();
                self.surface(&mut session, ErrorKind::NotAuthenticated, &error);
                Err(error.into())
            }
        }
    }

    /// Surfaces a locally rejected request. Errors without a user-facing
    /// kind are returned but not shown.
    fn reject(&self, error: parley_core::Error) -> Error {
        if let Some(kind) = error.kind() {
            let mut session = self.lock();
            self.surface(&mut session, kind, &error);
        }
        error.into()
    }

    fn surface(&self, session: &mut Session, kind: ErrorKind, error: &dyn std::fmt::Display) {
        warn!(kind = %kind, error = %error, "sync error");
        session.last_error = Some(SurfacedError { kind, message: error.to_string(), at: self.clock.now() });
        self.publish(session);
    }

    fn publish(&self, session: &Session) {
        let pending = |id: &str| session.pending_for(id);
        let view = match &session.active {
            Some(active) => {
                let placeholders = pending(&active.id);
                let sending = placeholders.iter().any(PendingSend::is_in_flight);
                let mut messages = active.canonical.clone();
                messages.extend(placeholders.iter().filter(|p| p.is_in_flight()).map(PendingSend::to_message));
                let phase = match active.phase {
                    SessionPhase::Live(_) if active.loading_older => SessionPhase::Live(LiveActivity::LoadingOlder),
                    SessionPhase::Live(_) if sending => SessionPhase::Live(LiveActivity::Sending),
                    other => other,
                };
                SyncView {
                    conversations: session.conversations.clone(),
                    active_conversation: Some(active.id.clone()),
                    messages,
                    phase,
                    loading: LoadingFlags {
                        conversations: session.loading_conversations,
                        messages: active.phase == SessionPhase::Hydrating,
                        older: active.loading_older,
                    },
                    has_more: active.has_more,
                    last_error: session.last_error.clone(),
                }
            }
            None => SyncView {
                conversations: session.conversations.clone(),
                active_conversation: None,
                messages: Vec::new(),
                phase: if session.detached { SessionPhase::Detached } else { SessionPhase::Uninitialized },
                loading: LoadingFlags { conversations: session.loading_conversations, ..LoadingFlags::default() },
                has_more: false,
                last_error: session.last_error.clone(),
            },
        };
        self.view.send_replace(view);
    }

    /// Runs steps 1-3 of a selection for `generation`.
    async fn hydrate(self: &Arc<Self>, generation: u64, conversation_id: &str, mode: Hydration) -> Result<()> {
        let mut cursor = None;
        if mode == Hydration::CacheFirst {
            let cached = self.cache.get_messages(conversation_id).unwrap_or_default();
            cursor = newest_key(&cached);
            let mut session = self.lock();
            let Some(active) = session.current(generation) else {
                return Ok(());
            };
            if cursor.is_some() {
                self.accountant.record_hit(ReadSource::Messages, reads(cached.len()));
                // A full page, or an entry trimmed to the cache bound, may have older history.
                let full = self.options.page_size.min(self.cache.config().max_messages);
                active.has_more = cached.len() >= full;
                session.absorb(generation, &cached);
                self.publish(&session);
            }
        }

        if cursor.is_none() {
            let fetched = self.backend.fetch_messages(conversation_id, self.options.page_size, None).await;
            let mut session = self.lock();
            let Some(active) = session.current(generation) else {
                debug!(conversation = %conversation_id, "discarding page for abandoned conversation");
                return Ok(());
            };
            match fetched {
                Ok(page) => {
                    self.accountant.record_miss(ReadSource::Messages, reads(page.messages.len()));
                    active.has_more = page.has_more;
                    if mode == Hydration::Network {
                        active.canonical.clear();
                        self.cache.replace_messages(conversation_id, &page.messages);
                    } else {
                        self.cache.append_messages(conversation_id, &page.messages);
                    }
                    cursor = newest_key(&page.messages);
                    session.absorb(generation, &page.messages);
                    self.publish(&session);
                }
                Err(e) => {
                    active.phase = SessionPhase::Detached;
                    self.surface(&mut session, e.kind().unwrap_or(ErrorKind::NetworkUnavailable), &e);
                    return Err(e.into());
                }
            }
        }

        self.subscribe(generation, conversation_id, cursor).await
    }

    /// Step 3: opens the live subscription and starts draining it.
    async fn subscribe(
        self: &Arc<Self>,
        generation: u64,
        conversation_id: &str,
        cursor: Option<MessageKey>,
    ) -> Result<()> {
        let subscribed = self.backend.subscribe_messages(conversation_id, cursor.clone()).await;
        let orphan = {
            let mut session = self.lock();
            match (session.current(generation).is_some(), subscribed) {
                (true, Ok(subscription)) => {
                    let pump = tokio::spawn(pump_messages(
                        Arc::downgrade(self),
                        generation,
                        subscription.stream,
                    ));
                    if let Some(active) = session.current(generation) {
                        active.feed = Some(Feed { token: subscription.token, pump: pump.abort_handle() });
                        active.phase = SessionPhase::Live(LiveActivity::Idle);
                    }
                    self.publish(&session);
                    debug!(
                        conversation = %conversation_id,
                        cursor = cursor.map(|c| c.to_string()).unwrap_or_default(),
                        "live subscription opened"
                    );
                    None
                }
                (false, Ok(subscription)) => Some(subscription.token),
                (true, Err(e)) => {
                    if let Some(active) = session.current(generation) {
                        active.phase = SessionPhase::Detached;
                    }
                    self.surface(&mut session, e.kind().unwrap_or(ErrorKind::SubscriptionFailure), &e);
                    return Err(e.into());
                }
                (false, Err(_)) => None,
            }
        };
        if let Some(token) = orphan {
            self.backend.unsubscribe(token).await;
        }
        Ok(())
    }

    /// Step 4: reconciles a delivered batch into the active conversation.
    fn apply_batch(&self, generation: u64, batch: MessageBatch) {
        let mut session = self.lock();
        let current = session.current(generation).is_some_and(|a| a.id == batch.conversation_id);
        if !current {
            return;
        }
        if !batch.is_empty() {
            self.accountant.record_miss(ReadSource::LiveBatch, reads(batch.len()));
        }
        self.cache.append_messages(&batch.conversation_id, &batch.messages);
        session.absorb(generation, &batch.messages);
        self.publish(&session);
    }

    fn subscription_failed(&self, generation: u64, error: &dyn std::fmt::Display, kind: ErrorKind) {
        let mut session = self.lock();
        let Some(active) = session.current(generation) else {
            return;
        };
        active.phase = SessionPhase::Detached;
        active.feed = None;
        self.surface(&mut session, kind, error);
    }

    fn apply_conversations(&self, user: &str, mut conversations: Vec<Conversation>) {
        self.accountant.record_miss(ReadSource::ConversationList, reads(conversations.len()));
        sort_for_viewer(&mut conversations, user);
        self.cache.set_conversations(user, &conversations);
        let mut session = self.lock();
        session.loading_conversations = false;
        session.conversations = conversations;
        self.publish(&session);
    }

    /// Rolls back a failed `initialize` so it can be retried.
    fn abandon_initialize(&self, kind: ErrorKind, error: &dyn std::fmt::Display) {
        let mut session = self.lock();
        session.initialized = false;
        session.loading_conversations = false;
        self.surface(&mut session, kind, error);
    }

    fn apply_conversation(&self, user: &str, conversation: Conversation) {
        let mut session = self.lock();
        session.upsert_conversation(conversation, user);
        self.cache.set_conversations(user, &session.conversations);
        self.publish(&session);
    }

    /// Resolves an optimistic send once the backend has answered.
    fn finish_send(&self, pending: &PendingSend, result: BackendResult<MessageId>) {
        let mut session = self.lock();
        match result {
            Ok(canonical_id) => {
                let arrived = session.active.as_ref().is_some_and(|a| {
                    a.id == pending.conversation_id && a.canonical.iter().any(|m| m.id == canonical_id)
                });
                if arrived {
                    session.pending.resolve(&pending.temp_id, PendingState::Settled);
                } else {
                    session.pending.record_canonical(&pending.temp_id, canonical_id);
                }
                self.publish(&session);
            }
            Err(e) => {
                if session.pending.resolve(&pending.temp_id, PendingState::Failed).is_some() {
                    debug!(temp_id = %pending.temp_id, "optimistic send rolled back");
                }
                self.surface(&mut session, ErrorKind::SendFailure, &e);
            }
        }
    }
}

/// Drains a conversation's live subscription in arrival order.
async fn pump_messages<B: ChatBackend>(
    inner: Weak<Inner<B>>,
    generation: u64,
    mut stream: BoxStream<'static, BackendResult<MessageBatch>>,
) {
    while let Some(item) = stream.next().await {
        let Some(inner) = inner.upgrade() else {
            return;
        };
        match item {
            Ok(batch) => inner.apply_batch(generation, batch),
            Err(e) => {
                inner.subscription_failed(generation, &e, e.kind().unwrap_or(ErrorKind::SubscriptionFailure));
                return;
            }
        }
    }
}

/// Drains the coalesced conversation-list subscription.
async fn pump_conversations<B: ChatBackend>(
    inner: Weak<Inner<B>>,
    user: String,
    mut snapshots: BoxStream<'static, BackendResult<Vec<Conversation>>>,
) {
    while let Some(item) = snapshots.next().await {
        let Some(inner) = inner.upgrade() else {
            return;
        };
        match item {
            Ok(conversations) => inner.apply_conversations(&user, conversations),
            Err(e) => {
                let mut session = inner.lock();
                inner.surface(&mut session, e.kind().unwrap_or(ErrorKind::SubscriptionFailure), &e);
                return;
            }
        }
    }
}

/// Reads billed for a result of `len` documents. An empty result still
/// costs one read.
fn reads(len: usize) -> u64 {
    u64::try_from(len).unwrap_or(u64::MAX).max(1)
}

#[cfg(test)]
#[path = "coordinator_tests.rs"]
mod tests;
