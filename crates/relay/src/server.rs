// SPDX-License-Identifier: MIT
// Copyright (c) 2026 Alfred Jean LLC

//! WebSocket server implementation.
//!
//! Each connection answers requests in order and runs one forwarding task
//! per subscription. Forwarders and the request loop share an outgoing
//! queue that the connection drains into the socket.

use std::collections::HashMap;
use std::net::SocketAddr;

use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use parley_core::protocol::{ClientMessage, ServerMessage, Topic};
use parley_core::{Message, MessageKey};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc};
use tokio::task::AbortHandle;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::WebSocketStream;
use tracing::{debug, error, info, warn};

use crate::state::{Event, RelayState};

type BoxError = Box<dyn std::error::Error + Send + Sync>;
type WsSink = SplitSink<WebSocketStream<TcpStream>, WsMessage>;

/// Run the WebSocket server on the given address.
pub async fn run(addr: SocketAddr, state: RelayState) -> Result<(), BoxError> {
    let listener = TcpListener::bind(addr).await?;
    info!("Listening on: {}", addr);
    serve(listener, state).await
}

/// Accept connections from an already bound listener.
pub async fn serve(listener: TcpListener, state: RelayState) -> Result<(), BoxError> {
    loop {
        let (stream, peer_addr) = listener.accept().await?;
        let state = state.clone();

        tokio::spawn(async move {
            if let Err(e) = handle_connection(stream, peer_addr, state).await {
                error!("Connection error from {}: {}", peer_addr, e);
            }
        });
    }
}

/// Handle a single WebSocket connection.
pub(crate) async fn handle_connection(
    stream: TcpStream,
    peer_addr: SocketAddr,
    state: RelayState,
) -> Result<(), BoxError> {
    let ws_stream = tokio_tungstenite::accept_async(stream).await?;
    info!("New WebSocket connection from: {}", peer_addr);

    let (mut ws_sink, mut ws_stream) = ws_stream.split();
    let (outgoing, mut queue) = mpsc::unbounded_channel::<ServerMessage>();
    let mut session = Session::new(state, outgoing);

    let result = loop {
        tokio::select! {
            msg = ws_stream.next() => {
                match msg {
                    Some(Ok(WsMessage::Text(text))) => {
                        if let Some(reply) = session.handle_text(&text).await {
                            if let Err(e) = send(&mut ws_sink, &reply).await {
                                break Err(e);
                            }
                        }
                    }
                    Some(Ok(WsMessage::Close(_))) => {
                        info!("Client {} disconnected", peer_addr);
                        break Ok(());
                    }
                    Some(Ok(WsMessage::Ping(data))) => {
                        if let Err(e) = ws_sink.send(WsMessage::Pong(data)).await {
                            break Err(e.into());
                        }
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        error!("WebSocket error from {}: {}", peer_addr, e);
                        break Ok(());
                    }
                    None => {
                        info!("Client {} stream ended", peer_addr);
                        break Ok(());
                    }
                }
            }

            // The session holds a sender, so the queue never closes first.
            Some(pushed) = queue.recv() => {
                if let Err(e) = send(&mut ws_sink, &pushed).await {
                    warn!("Failed to push to {}: {}", peer_addr, e);
                    break Ok(());
                }
            }
        }
    };

    session.close();
    info!("Connection closed: {}", peer_addr);
    result
}

async fn send(sink: &mut WsSink, message: &ServerMessage) -> Result<(), BoxError> {
    let json = message.to_json()?;
    sink.send(WsMessage::Text(json.into())).await?;
    Ok(())
}

/// Per-connection state: the open subscriptions and the outgoing queue
/// their forwarders push into.
pub(crate) struct Session {
    state: RelayState,
    outgoing: mpsc::UnboundedSender<ServerMessage>,
    subscriptions: HashMap<u64, AbortHandle>,
}

impl Session {
    pub(crate) fn new(state: RelayState, outgoing: mpsc::UnboundedSender<ServerMessage>) -> Self {
        Session { state, outgoing, subscriptions: HashMap::new() }
    }

    /// Decodes and handles one text frame, returning the direct reply.
    pub(crate) async fn handle_text(&mut self, text: &str) -> Option<ServerMessage> {
        match serde_json::from_str::<ClientMessage>(text) {
            Ok(msg) => self.handle(msg).await,
            Err(e) => {
                warn!("Undecodable client message: {}", e);
                Some(ServerMessage::error(format!("undecodable message: {e}")))
            }
        }
    }

    pub(crate) async fn handle(&mut self, msg: ClientMessage) -> Option<ServerMessage> {
        debug!("Received message: {:?}", msg);

        match msg {
            ClientMessage::Request { id, request } => match self.state.apply(request).await {
                Ok(result) => Some(ServerMessage::response(id, result)),
                Err(e) => {
                    debug!("Request {} failed: {}", id, e);
                    Some(ServerMessage::failure(id, &e))
                }
            },

            ClientMessage::Subscribe { token, topic } => {
                // Resubscribing under a live token replaces the old feed.
                if let Some(old) = self.subscriptions.remove(&token) {
                    old.abort();
                }
                let state = self.state.clone();
                let outgoing = self.outgoing.clone();
                let task = match topic {
                    Topic::Messages { conversation_id, after } => {
                        tokio::spawn(forward_messages(state, token, conversation_id, after, outgoing))
                    }
                    Topic::Conversations { user_id } => {
                        tokio::spawn(forward_conversations(state, token, user_id, outgoing))
                    }
                };
                self.subscriptions.insert(token, task.abort_handle());
                debug!("Subscription {} opened", token);
                None
            }

            ClientMessage::Unsubscribe { token } => {
                if let Some(handle) = self.subscriptions.remove(&token) {
                    handle.abort();
                    debug!("Subscription {} closed", token);
                }
                None
            }

            ClientMessage::Ping { id } => {
                debug!("Ping received: {}", id);
                Some(ServerMessage::pong(id))
            }
        }
    }

    /// Number of subscriptions whose forwarder is still running.
    pub(crate) fn subscription_count(&self) -> usize {
        self.subscriptions.values().filter(|h| !h.is_finished()).count()
    }

    /// Stops every forwarder.
    pub(crate) fn close(&mut self) {
        for (_, handle) in self.subscriptions.drain() {
            handle.abort();
        }
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.close();
    }
}

/// Pushes a catch-up batch, then each message appended to the conversation.
async fn forward_messages(
    state: RelayState,
    token: u64,
    conversation_id: String,
    after: Option<MessageKey>,
    outgoing: mpsc::UnboundedSender<ServerMessage>,
) {
    let (catch_up, mut events) = state.follow_messages(&conversation_id, after.as_ref()).await;
    let mut cursor = catch_up.iter().map(Message::key).max().or(after);
    if outgoing.send(ServerMessage::batch(token, catch_up)).is_err() {
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
            Ok(Event::Changed { .. }) => continue,
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                warn!("Subscription {} lagged by {} events, catching up", token, skipped);
                let missed = state.messages_after(&conversation_id, cursor.as_ref()).await;
                if missed.is_empty() {
                    continue;
                }
                cursor = missed.iter().map(Message::key).max().or(cursor);
                missed
            }
            Err(broadcast::error::RecvError::Closed) => return,
        };
        if outgoing.send(ServerMessage::batch(token, batch)).is_err() {
            return;
        }
    }
}

/// Pushes a conversation-list snapshot now and after every relevant change.
async fn forward_conversations(
    state: RelayState,
    token: u64,
    user_id: String,
    outgoing: mpsc::UnboundedSender<ServerMessage>,
) {
    let (snapshot, mut events) = state.follow_conversations(&user_id).await;
    if outgoing.send(ServerMessage::conversations(token, snapshot)).is_err() {
        return;
    }

    loop {
        let relevant = match events.recv().await {
            Ok(event) => event.concerns(&user_id),
            Err(broadcast::error::RecvError::Lagged(_)) => true,
            Err(broadcast::error::RecvError::Closed) => return,
        };
        if !relevant {
            continue;
        }
        let snapshot = state.conversations_for(&user_id).await;
        if outgoing.send(ServerMessage::conversations(token, snapshot)).is_err() {
            return;
        }
    }
}

#[cfg(test)]
#[path = "server_tests.rs"]
mod tests;
