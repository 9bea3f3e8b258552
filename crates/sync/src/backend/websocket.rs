// SPDX-License-Identifier: MIT
// Copyright (c) 2026 Alfred Jean LLC

//! WebSocket backend speaking the relay protocol.
//!
//! The connection is opened lazily on first use, with exponential backoff.
//! A writer task drains an outgoing queue into the socket; a reader task
//! routes responses to waiting requests by id and pushes subscription data
//! by token. When the connection drops, outstanding requests fail and
//! open subscriptions are re-established from their last delivered
//! message, or fail if the relay stays unreachable.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use futures_util::stream::{self, StreamExt};
use futures_util::SinkExt;
use parley_core::protocol::{ClientMessage, Request, Response, ServerMessage, Topic};
use parley_core::{
    Conversation, MembershipChange, MessageBatch, MessageId, MessageKey, MessagePage,
    NewConversation, SendRequest,
};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};

use super::{
    BackendError, BackendResult, BoxFuture, LiveChannel, RemoteStore, Subscription,
    SubscriptionToken,
};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Reconnection tuning.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectOptions {
    /// Maximum connection attempts before giving up.
    pub max_retries: u32,
    /// Initial delay for exponential backoff (milliseconds).
    pub initial_delay_ms: u64,
    /// Maximum delay between attempts (seconds).
    pub max_delay_secs: u64,
}

impl Default for ReconnectOptions {
    fn default() -> Self {
        ReconnectOptions { max_retries: 10, initial_delay_ms: 100, max_delay_secs: 30 }
    }
}

/// Answer to an outstanding request. `None` answers a ping.
type Reply = BackendResult<Option<Response>>;

enum Sink {
    Messages {
        conversation_id: String,
        /// Key of the newest message delivered, used to resume after a reconnect.
        cursor: Option<MessageKey>,
        tx: mpsc::UnboundedSender<BackendResult<MessageBatch>>,
    },
    Conversations {
        user_id: String,
        tx: mpsc::UnboundedSender<BackendResult<Vec<Conversation>>>,
    },
}

impl Sink {
    fn topic(&self) -> Topic {
        match self {
            Sink::Messages { conversation_id, cursor, .. } => Topic::Messages {
                conversation_id: conversation_id.clone(),
                after: cursor.clone(),
            },
            Sink::Conversations { user_id, .. } => Topic::Conversations { user_id: user_id.clone() },
        }
    }

    fn fail(&self, error: BackendError) {
        match self {
            Sink::Messages { tx, .. } => {
                let _ = tx.send(Err(error));
            }
            Sink::Conversations { tx, .. } => {
                let _ = tx.send(Err(error));
            }
        }
    }
}

struct Connection {
    id: u64,
    outgoing: mpsc::UnboundedSender<ClientMessage>,
    writer: JoinHandle<()>,
    reader: JoinHandle<()>,
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.writer.abort();
        self.reader.abort();
    }
}

struct Inner {
    url: String,
    options: ReconnectOptions,
    conn: tokio::sync::Mutex<Option<Connection>>,
    pending: Mutex<HashMap<u64, oneshot::Sender<Reply>>>,
    sinks: Mutex<HashMap<u64, Sink>>,
    next_id: AtomicU64,
    next_connection: AtomicU64,
}

/// Client for a parley relay.
#[derive(Clone)]
pub struct WsBackend {
    inner: Arc<Inner>,
}

impl WsBackend {
    /// Creates a backend for the relay at `url`. Nothing connects until the
    /// first call.
    pub fn new(url: &str, options: ReconnectOptions) -> Self {
        WsBackend {
            inner: Arc::new(Inner {
                url: url.to_string(),
                options,
                conn: tokio::sync::Mutex::new(None),
                pending: Mutex::new(HashMap::new()),
                sinks: Mutex::new(HashMap::new()),
                next_id: AtomicU64::new(1),
                next_connection: AtomicU64::new(1),
            }),
        }
    }

    pub fn url(&self) -> &str {
        &self.inner.url
    }

    /// Round-trips a ping through the relay.
    pub async fn ping(&self) -> BackendResult<()> {
        let id = self.inner.next_id();
        self.inner.call(id, ClientMessage::ping(id)).await.map(|_| ())
    }

    /// Returns true if a connection is currently open.
    pub async fn is_connected(&self) -> bool {
        let conn = self.inner.conn.lock().await;
        conn.as_ref().is_some_and(|c| !c.outgoing.is_closed())
    }

    async fn request(&self, request: Request) -> BackendResult<Response> {
        let id = self.inner.next_id();
        match self.inner.call(id, ClientMessage::request(id, request)).await? {
            Some(response) => Ok(response),
            None => Err(BackendError::Serialization(format!("request {id} answered by pong"))),
        }
    }

    async fn subscribe(&self, sink: Sink) -> BackendResult<SubscriptionToken> {
        let token = self.inner.next_id();
        let topic = sink.topic();
        self.inner.lock_sinks().insert(token, sink);
        let sent = match self.inner.outgoing().await {
            Ok(outgoing) => outgoing
                .send(ClientMessage::subscribe(token, topic))
                .map_err(|_| BackendError::Closed),
            Err(e) => Err(e),
        };
        if let Err(e) = sent {
            self.inner.lock_sinks().remove(&token);
            return Err(e);
        }
        debug!(token, "subscribed");
        Ok(SubscriptionToken(token))
    }
}

fn unexpected(response: Response) -> BackendError {
    BackendError::Serialization(format!("unexpected response: {response:?}"))
}

fn receiver_stream<T: Send + 'static>(
    rx: mpsc::UnboundedReceiver<BackendResult<T>>,
) -> futures_util::stream::BoxStream<'static, BackendResult<T>> {
    stream::unfold(rx, |mut rx| async move {
        let item = rx.recv().await?;
        Some((item, rx))
    })
    .boxed()
}

impl Inner {
    fn next_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::SeqCst)
    }

    fn lock_sinks(&self) -> std::sync::MutexGuard<'_, HashMap<u64, Sink>> {
        self.sinks.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn lock_pending(&self) -> std::sync::MutexGuard<'_, HashMap<u64, oneshot::Sender<Reply>>> {
        self.pending.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Sends a message and waits for the reply carrying `id`.
    async fn call(self: &Arc<Self>, id: u64, message: ClientMessage) -> Reply {
        let outgoing = self.outgoing().await?;
        let (tx, rx) = oneshot::channel();
        self.lock_pending().insert(id, tx);
        if outgoing.send(message).is_err() {
            self.lock_pending().remove(&id);
            return Err(BackendError::Closed);
        }
        rx.await.unwrap_or(Err(BackendError::Closed))
    }

    /// Returns the outgoing queue, connecting first if needed.
    async fn outgoing(self: &Arc<Self>) -> BackendResult<mpsc::UnboundedSender<ClientMessage>> {
        let mut conn = self.conn.lock().await;
        if let Some(existing) = conn.as_ref() {
            if !existing.outgoing.is_closed() && !existing.reader.is_finished() {
                return Ok(existing.outgoing.clone());
            }
        }
        let fresh = self.open().await?;
        let outgoing = fresh.outgoing.clone();
        *conn = Some(fresh);
        Ok(outgoing)
    }

    async fn open(self: &Arc<Self>) -> BackendResult<Connection> {
        let ws = connect_with_retry(&self.url, &self.options).await?;
        let id = self.next_connection.fetch_add(1, Ordering::SeqCst);
        info!(url = %self.url, connection = id, "connected to relay");
        let (mut sink, mut stream) = ws.split();

        let (outgoing, mut queue) = mpsc::unbounded_channel::<ClientMessage>();
        let writer = tokio::spawn(async move {
            while let Some(message) = queue.recv().await {
                let json = match message.to_json() {
                    Ok(json) => json,
                    Err(e) => {
                        warn!(error = %e, "failed to encode client message");
                        continue;
                    }
                };
                if let Err(e) = sink.send(WsMessage::Text(json.into())).await {
                    debug!(error = %e, "relay write failed");
                    break;
                }
            }
            let _ = sink.close().await;
        });

        let weak: Weak<Inner> = Arc::downgrade(self);
        let reader = tokio::spawn(async move {
            while let Some(frame) = stream.next().await {
                let text = match frame {
                    Ok(WsMessage::Text(text)) => text,
                    Ok(WsMessage::Close(_)) => break,
                    Ok(_) => continue,
                    Err(e) => {
                        debug!(error = %e, "relay read failed");
                        break;
                    }
                };
                let Some(inner) = weak.upgrade() else { return };
                match ServerMessage::from_json(&text) {
                    Ok(message) => inner.dispatch(message),
                    Err(e) => warn!(error = %e, "undecodable relay message"),
                }
            }
            let Some(inner) = weak.upgrade() else { return };
            let dead = {
                let mut conn = inner.conn.lock().await;
                if conn.as_ref().is_some_and(|c| c.id == id) {
                    conn.take()
                } else {
                    None
                }
            };
            tokio::spawn(inner.recover());
            // Dropping the connection aborts this task, so it goes last.
            drop(dead);
        });

        Ok(Connection { id, outgoing, writer, reader })
    }

    fn dispatch(&self, message: ServerMessage) {
        match message {
            ServerMessage::Response { id, result } => self.answer(id, Ok(Some(result))),
            ServerMessage::Failure { id, kind, message } => {
                self.answer(id, Err(BackendError::Rejected { kind, message }))
            }
            ServerMessage::Pong { id } => self.answer(id, Ok(None)),
            ServerMessage::Batch { token, messages } => {
                let mut sinks = self.lock_sinks();
                let Some(Sink::Messages { conversation_id, cursor, tx }) = sinks.get_mut(&token) else {
                    return;
                };
                if let Some(newest) = messages.iter().map(|m| m.key()).max() {
                    if cursor.as_ref().map_or(true, |c| newest > *c) {
                        *cursor = Some(newest);
                    }
                }
                let batch = MessageBatch::new(conversation_id.clone(), messages);
                if tx.send(Ok(batch)).is_err() {
                    sinks.remove(&token);
                }
            }
            ServerMessage::Conversations { token, conversations } => {
                let mut sinks = self.lock_sinks();
                let Some(Sink::Conversations { tx, .. }) = sinks.get(&token) else {
                    return;
                };
                if tx.send(Ok(conversations)).is_err() {
                    sinks.remove(&token);
                }
            }
            ServerMessage::Error { message } => warn!(message = %message, "relay error"),
        }
    }

    fn answer(&self, id: u64, reply: Reply) {
        match self.lock_pending().remove(&id) {
            Some(tx) => {
                let _ = tx.send(reply);
            }
            None => debug!(id, "reply for unknown request"),
        }
    }

    /// Handles a dropped connection.
    ///
    /// Boxed because it reconnects, and the reader of the new connection
    /// spawns it again.
    fn recover(self: Arc<Self>) -> BoxFuture<'static, ()> {
        Box::pin(async move {
            warn!(url = %self.url, "relay connection lost");
            let waiting: Vec<_> = self.lock_pending().drain().collect();
            for (_, tx) in waiting {
                let _ = tx.send(Err(BackendError::Closed));
            }

            let has_sinks = {
                let mut sinks = self.lock_sinks();
                sinks.retain(|_, sink| match sink {
                    Sink::Messages { tx, .. } => !tx.is_closed(),
                    Sink::Conversations { tx, .. } => !tx.is_closed(),
                });
                !sinks.is_empty()
            };
            if !has_sinks {
                return;
            }

            match self.outgoing().await {
                Ok(outgoing) => {
                    let sinks = self.lock_sinks();
                    for (token, sink) in sinks.iter() {
                        if outgoing.send(ClientMessage::subscribe(*token, sink.topic())).is_err() {
                            break;
                        }
                    }
                    info!(subscriptions = sinks.len(), "resubscribed after reconnect");
                }
                Err(e) => {
                    let sinks: Vec<Sink> = self.lock_sinks().drain().map(|(_, s)| s).collect();
                    for sink in sinks {
                        sink.fail(e.clone());
                    }
                }
            }
        })
    }
}

/// Connects with exponential backoff.
async fn connect_with_retry(url: &str, options: &ReconnectOptions) -> BackendResult<WsStream> {
    let mut attempt = 0;
    let mut delay_ms = options.initial_delay_ms;

    loop {
        attempt += 1;
        match tokio_tungstenite::connect_async(url).await {
            Ok((ws, _)) => return Ok(ws),
            Err(e) if attempt >= options.max_retries.max(1) => {
                return Err(BackendError::Unavailable(e.to_string()));
            }
            Err(e) => {
                debug!(attempt, error = %e, "connect failed, retrying");
                tokio::time::sleep(Duration::from_millis(delay_ms)).await;
                delay_ms = std::cmp::min(delay_ms * 2, options.max_delay_secs * 1000);
            }
        }
    }
}

impl LiveChannel for WsBackend {
    fn subscribe_messages(
        &self,
        conversation_id: &str,
        after: Option<MessageKey>,
    ) -> BoxFuture<'_, BackendResult<Subscription<MessageBatch>>> {
        let conversation_id = conversation_id.to_string();
        Box::pin(async move {
            let (tx, rx) = mpsc::unbounded_channel();
            let token = self.subscribe(Sink::Messages { conversation_id, cursor: after, tx }).await?;
            Ok(Subscription { token, stream: receiver_stream(rx) })
        })
    }

    fn subscribe_conversations(
        &self,
        user_id: &str,
    ) -> BoxFuture<'_, BackendResult<Subscription<Vec<Conversation>>>> {
        let user_id = user_id.to_string();
        Box::pin(async move {
            let (tx, rx) = mpsc::unbounded_channel();
            let token = self.subscribe(Sink::Conversations { user_id, tx }).await?;
            Ok(Subscription { token, stream: receiver_stream(rx) })
        })
    }

    fn unsubscribe(&self, token: SubscriptionToken) -> BoxFuture<'_, ()> {
        Box::pin(async move {
            // Dropping the sink ends the stream.
            if self.inner.lock_sinks().remove(&token.0).is_none() {
                return;
            }
            let conn = self.inner.conn.lock().await;
            if let Some(conn) = conn.as_ref() {
                let _ = conn.outgoing.send(ClientMessage::unsubscribe(token.0));
            }
        })
    }
}

impl RemoteStore for WsBackend {
    fn fetch_messages(
        &self,
        conversation_id: &str,
        limit: usize,
        before: Option<MessageKey>,
    ) -> BoxFuture<'_, BackendResult<MessagePage>> {
        let request =
            Request::FetchMessages { conversation_id: conversation_id.to_string(), limit, before };
        Box::pin(async move {
            match self.request(request).await? {
                Response::Messages { page } => Ok(page),
                other => Err(unexpected(other)),
            }
        })
    }

    fn fetch_conversations(&self, user_id: &str) -> BoxFuture<'_, BackendResult<Vec<Conversation>>> {
        let request = Request::FetchConversations { user_id: user_id.to_string() };
        Box::pin(async move {
            match self.request(request).await? {
                Response::Conversations { conversations } => Ok(conversations),
                other => Err(unexpected(other)),
            }
        })
    }

    fn send_message(&self, request: SendRequest) -> BoxFuture<'_, BackendResult<MessageId>> {
        Box::pin(async move {
            match self.request(Request::SendMessage(request)).await? {
                Response::Sent { id } => Ok(id),
                other => Err(unexpected(other)),
            }
        })
    }

    fn create_conversation(
        &self,
        request: NewConversation,
    ) -> BoxFuture<'_, BackendResult<Conversation>> {
        Box::pin(async move {
            match self.request(Request::CreateConversation(request)).await? {
                Response::Conversation { conversation } => Ok(conversation),
                other => Err(unexpected(other)),
            }
        })
    }

    fn mutate_membership(
        &self,
        conversation_id: &str,
        actor_id: &str,
        change: MembershipChange,
    ) -> BoxFuture<'_, BackendResult<Conversation>> {
        let request = Request::MutateMembership {
            conversation_id: conversation_id.to_string(),
            actor_id: actor_id.to_string(),
            change,
        };
        Box::pin(async move {
            match self.request(request).await? {
                Response::Conversation { conversation } => Ok(conversation),
                other => Err(unexpected(other)),
            }
        })
    }
}

#[cfg(test)]
#[path = "websocket_tests.rs"]
mod tests;
