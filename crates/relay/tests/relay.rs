// SPDX-License-Identifier: MIT
// Copyright (c) 2026 Alfred Jean LLC

//! End-to-end: sync coordinators talking to a live relay over WebSocket.

#![allow(clippy::unwrap_used)]
#![allow(clippy::expect_used)]

use std::time::Duration;

use parley::{Config, SyncCoordinator, SyncView};
use parley_core::protocol::Request;
use parley_core::{ConversationKind, MessageBody, SendRequest};
use parley_relay::{serve, RelayState};
use tokio::net::TcpListener;
use tokio::time::timeout;

const WAIT: Duration = Duration::from_secs(10);

async fn start_relay() -> (String, RelayState) {
    let state = RelayState::default();
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(serve(listener, state.clone()));
    (format!("ws://{addr}"), state)
}

fn config(url: &str, cache: Option<&std::path::Path>) -> Config {
    let mut config = Config::default();
    config.backend.url = url.to_string();
    config.backend.reconnect_initial_delay_ms = 10;
    config.sync.conversation_debounce_ms = 10;
    match cache {
        Some(path) => config.cache.path = Some(path.to_path_buf()),
        None => config.cache.persist = false,
    }
    config
}

async fn wait_for(sync: &SyncCoordinator, pred: impl Fn(&SyncView) -> bool) -> SyncView {
    let mut rx = sync.subscribe_view();
    let view = timeout(WAIT, rx.wait_for(|v| pred(v)))
        .await
        .expect("timed out waiting for view")
        .expect("view channel closed");
    view.clone()
}

fn texts(view: &SyncView) -> Vec<String> {
    view.messages.iter().map(|m| m.body.preview()).collect()
}

#[tokio::test]
async fn send_round_trips_through_the_relay() {
    let (url, relay) = start_relay().await;
    let alice = parley::open(&config(&url, None), Some("alice".to_string())).unwrap();
    alice.initialize().await.unwrap();

    let conversation = alice
        .create_conversation(ConversationKind::Group, ["bob".to_string(), "carol".to_string()], None)
        .await
        .unwrap();
    alice.select_conversation(&conversation.id).await.unwrap();
    wait_for(&alice, |v| v.phase.is_live()).await;

    alice.send_message("hello").unwrap();
    let view = wait_for(&alice, |v| v.messages.len() == 1 && v.pending_count() == 0).await;
    assert_eq!(texts(&view), vec!["hello"]);
    assert!(!view.messages[0].is_temp());

    // A message from someone else arrives over the live subscription.
    relay
        .apply(Request::SendMessage(SendRequest {
            conversation_id: conversation.id.clone(),
            sender_id: "bob".to_string(),
            body: MessageBody::text("hi alice"),
            client_id: None,
        }))
        .await
        .unwrap();
    let view = wait_for(&alice, |v| v.messages.len() == 2).await;
    assert_eq!(texts(&view), vec!["hello", "hi alice"]);
    assert_eq!(relay.messages_after(&conversation.id, None).await.len(), 2);

    alice.cleanup().await;
}

#[tokio::test]
async fn two_clients_see_each_other() {
    let (url, _relay) = start_relay().await;
    let alice = parley::open(&config(&url, None), Some("alice".to_string())).unwrap();
    let bob = parley::open(&config(&url, None), Some("bob".to_string())).unwrap();
    alice.initialize().await.unwrap();
    bob.initialize().await.unwrap();

    let conversation = alice
        .create_conversation(ConversationKind::Group, ["bob".to_string(), "carol".to_string()], None)
        .await
        .unwrap();
    wait_for(&bob, |v| v.conversation(&conversation.id).is_some()).await;

    alice.select_conversation(&conversation.id).await.unwrap();
    bob.select_conversation(&conversation.id).await.unwrap();
    wait_for(&bob, |v| v.phase.is_live()).await;

    alice.send_message("ping").unwrap();
    let view = wait_for(&bob, |v| v.messages.len() == 1).await;
    assert_eq!(texts(&view), vec!["ping"]);
    assert_eq!(view.messages[0].sender_id, "alice");

    alice.cleanup().await;
    bob.cleanup().await;
}

#[tokio::test]
async fn reopened_client_hydrates_from_disk_cache() {
    let (url, relay) = start_relay().await;
    let dir = tempfile::tempdir().unwrap();
    let cache_path = dir.path().join("cache.db");

    let first = parley::open(&config(&url, Some(&cache_path)), Some("alice".to_string())).unwrap();
    first.initialize().await.unwrap();
    let conversation = first
        .create_conversation(ConversationKind::Group, ["bob".to_string(), "carol".to_string()], None)
        .await
        .unwrap();
    for text in ["one", "two", "three"] {
        relay
            .apply(Request::SendMessage(SendRequest {
                conversation_id: conversation.id.clone(),
                sender_id: "bob".to_string(),
                body: MessageBody::text(text),
                client_id: None,
            }))
            .await
            .unwrap();
    }
    first.select_conversation(&conversation.id).await.unwrap();
    wait_for(&first, |v| v.messages.len() == 3).await;
    first.cleanup().await;
    drop(first);

    let second = parley::open(&config(&url, Some(&cache_path)), Some("alice".to_string())).unwrap();
    second.initialize().await.unwrap();
    second.select_conversation(&conversation.id).await.unwrap();
    let view = wait_for(&second, |v| v.messages.len() == 3 && v.phase.is_live()).await;
    assert_eq!(texts(&view), vec!["one", "two", "three"]);
    assert!(second.read_stats().messages.hits >= 1);

    second.cleanup().await;
}
