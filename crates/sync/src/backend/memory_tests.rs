// SPDX-License-Identifier: MIT
// Copyright (c) 2026 Alfred Jean LLC

#![allow(clippy::unwrap_used)]

use std::time::Duration;

use parley_core::{ConversationKind, MessageBody};
use tokio::time::timeout;

use super::*;

const WAIT: Duration = Duration::from_secs(2);

fn group(backend: &MemoryBackend) -> Conversation {
    let request = NewConversation::new(
        ConversationKind::Group,
        "alice",
        ["bob".to_string(), "carol".to_string()],
        None,
    );
    backend.seed_conversation(&request).unwrap()
}

fn request(conversation_id: &str, sender: &str, text: &str) -> SendRequest {
    SendRequest {
        conversation_id: conversation_id.to_string(),
        sender_id: sender.to_string(),
        body: MessageBody::text(text),
        client_id: None,
    }
}

async fn next<T>(sub: &mut Subscription<T>) -> BackendResult<T> {
    timeout(WAIT, sub.stream.next()).await.unwrap().unwrap()
}

#[tokio::test]
async fn subscription_catches_up_then_streams_live() {
    let backend = MemoryBackend::new();
    let conv = group(&backend);
    let first = backend.inject(&request(&conv.id, "bob", "one")).unwrap();
    backend.inject(&request(&conv.id, "bob", "two")).unwrap();

    let mut sub = backend.subscribe_messages(&conv.id, Some(first.key())).await.unwrap();
    let catch_up = next(&mut sub).await.unwrap();
    assert_eq!(catch_up.len(), 1);
    assert_eq!(catch_up.messages[0].body, MessageBody::text("two"));

    backend.send_message(request(&conv.id, "alice", "three")).await.unwrap();
    let live = next(&mut sub).await.unwrap();
    assert_eq!(live.messages[0].body, MessageBody::text("three"));
}

#[tokio::test]
async fn catch_up_without_cursor_is_full_history() {
    let backend = MemoryBackend::new();
    let conv = group(&backend);
    backend.inject(&request(&conv.id, "bob", "one")).unwrap();

    let mut sub = backend.subscribe_messages(&conv.id, None).await.unwrap();
    assert_eq!(next(&mut sub).await.unwrap().len(), 1);
}

#[tokio::test]
async fn other_conversations_are_filtered() {
    let backend = MemoryBackend::new();
    let a = group(&backend);
    let b = backend
        .seed_conversation(&NewConversation::new(ConversationKind::Direct, "alice", ["dave".to_string()], None))
        .unwrap();

    let mut sub = backend.subscribe_messages(&a.id, None).await.unwrap();
    assert!(next(&mut sub).await.unwrap().is_empty());

    backend.inject(&request(&b.id, "dave", "elsewhere")).unwrap();
    backend.inject(&request(&a.id, "bob", "here")).unwrap();
    let batch = next(&mut sub).await.unwrap();
    assert_eq!(batch.messages[0].body, MessageBody::text("here"));
}

#[tokio::test]
async fn replay_redelivers_verbatim() {
    let backend = MemoryBackend::new();
    let conv = group(&backend);
    let m = backend.inject(&request(&conv.id, "bob", "one")).unwrap();

    let mut sub = backend.subscribe_messages(&conv.id, None).await.unwrap();
    next(&mut sub).await.unwrap();
    backend.replay(&conv.id, vec![m.clone()]);
    assert_eq!(next(&mut sub).await.unwrap().messages, vec![m]);
}

#[tokio::test]
async fn unsubscribe_ends_stream() {
    let backend = MemoryBackend::new();
    let conv = group(&backend);
    let mut sub = backend.subscribe_messages(&conv.id, None).await.unwrap();
    next(&mut sub).await.unwrap();
    assert_eq!(backend.subscription_count(), 1);

    backend.unsubscribe(sub.token).await;
    assert!(timeout(WAIT, sub.stream.next()).await.unwrap().is_none());
    assert_eq!(backend.subscription_count(), 0);
}

#[tokio::test]
async fn going_offline_fails_subscriptions_and_calls() {
    let backend = MemoryBackend::new();
    let conv = group(&backend);
    let mut sub = backend.subscribe_messages(&conv.id, None).await.unwrap();
    next(&mut sub).await.unwrap();

    backend.set_offline(true);
    assert!(matches!(next(&mut sub).await, Err(BackendError::Unavailable(_))));
    assert!(matches!(
        backend.fetch_messages(&conv.id, 10, None).await,
        Err(BackendError::Unavailable(_))
    ));
    assert!(backend.subscribe_conversations("alice").await.is_err());

    backend.set_offline(false);
    assert!(backend.fetch_messages(&conv.id, 10, None).await.is_ok());
}

#[tokio::test]
async fn failing_sends_are_rejected_as_send_failures() {
    let backend = MemoryBackend::new();
    let conv = group(&backend);
    backend.fail_sends(true);

    let err = backend.send_message(request(&conv.id, "alice", "hello")).await.unwrap_err();
    assert_eq!(err.kind(), Some(parley_core::ErrorKind::SendFailure));
    assert_eq!(backend.sends(), 1);
    assert!(backend.fetch_messages(&conv.id, 10, None).await.unwrap().messages.is_empty());
}

#[tokio::test]
async fn held_sends_wait_for_release() {
    let backend = MemoryBackend::new();
    let conv = group(&backend);
    backend.hold_sends();

    let sender = backend.clone();
    let id = conv.id.clone();
    let send = tokio::spawn(async move { sender.send_message(request(&id, "alice", "later")).await });
    tokio::task::yield_now().await;
    assert!(!send.is_finished());
    assert!(backend.fetch_messages(&conv.id, 10, None).await.unwrap().messages.is_empty());

    backend.release_sends();
    timeout(WAIT, send).await.unwrap().unwrap().unwrap();
    assert_eq!(backend.fetch_messages(&conv.id, 10, None).await.unwrap().messages.len(), 1);
}

#[tokio::test]
async fn conversation_snapshots_follow_relevant_changes() {
    let backend = MemoryBackend::new();
    let mut sub = backend.subscribe_conversations("alice").await.unwrap();
    assert!(next(&mut sub).await.unwrap().is_empty());

    let conv = group(&backend);
    assert_eq!(next(&mut sub).await.unwrap().len(), 1);

    backend.inject(&request(&conv.id, "bob", "ping")).unwrap();
    let snapshot = next(&mut sub).await.unwrap();
    assert_eq!(snapshot[0].unread_for("alice"), 1);
}

#[tokio::test]
async fn membership_changes_are_counted_and_validated() {
    let backend = MemoryBackend::new();
    let conv = group(&backend);

    let updated = backend
        .mutate_membership(&conv.id, "alice", MembershipChange::Add { user_ids: vec!["dave".into()] })
        .await
        .unwrap();
    assert!(updated.participants.contains("dave"));

    let err = backend
        .mutate_membership(&conv.id, "alice", MembershipChange::Add { user_ids: vec!["dave".into()] })
        .await
        .unwrap_err();
    assert_eq!(err.kind(), Some(parley_core::ErrorKind::MembershipConstraintViolation));
    assert_eq!(backend.mutations(), 2);
}

#[tokio::test]
async fn fetch_counters_track_calls() {
    let backend = MemoryBackend::new();
    let conv = group(&backend);
    backend.fetch_messages(&conv.id, 10, None).await.unwrap();
    backend.fetch_conversations("alice").await.unwrap();
    backend.fetch_conversations("bob").await.unwrap();
    assert_eq!(backend.message_fetches(), 1);
    assert_eq!(backend.conversation_fetches(), 2);
}
