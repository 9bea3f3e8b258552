// SPDX-License-Identifier: MIT
// Copyright (c) 2026 Alfred Jean LLC

#![allow(clippy::unwrap_used)]
#![allow(clippy::expect_used)]

use std::collections::HashSet;

use chrono::{TimeZone, Utc};
use parley_core::{CacheConfig, ManualClock, MemoryKv, SendRequest};
use tokio::time::timeout;

use super::*;
use crate::backend::MemoryBackend;

const WAIT: Duration = Duration::from_secs(5);

struct Harness {
    backend: MemoryBackend,
    cache: Arc<CacheStore>,
    clock: Arc<ManualClock>,
    sync: SyncCoordinator<MemoryBackend>,
}

fn options(page_size: usize) -> SyncOptions {
    SyncOptions { page_size, conversation_debounce: Duration::from_millis(10), read_warn_threshold: None }
}

fn harness() -> Harness {
    harness_with(options(50), Some("alice"))
}

fn harness_with(options: SyncOptions, user: Option<&str>) -> Harness {
    harness_with_cache(options, user, CacheConfig::default())
}

fn harness_with_cache(options: SyncOptions, user: Option<&str>, config: CacheConfig) -> Harness {
    let clock = Arc::new(ManualClock::new(Utc::now()));
    let backend = MemoryBackend::new();
    let cache = Arc::new(CacheStore::with_clock(Arc::new(MemoryKv::new()), config, clock.clone()));
    let sync = SyncCoordinator::with_clock(
        backend.clone(),
        Arc::clone(&cache),
        user.map(str::to_string),
        options,
        clock.clone(),
    );
    Harness { backend, cache, clock, sync }
}

fn group(backend: &MemoryBackend) -> Conversation {
    let request = NewConversation::new(
        ConversationKind::Group,
        "alice",
        ["bob".to_string(), "carol".to_string()],
        None,
    );
    backend.seed_conversation(&request).unwrap()
}

fn text(conversation_id: &str, sender: &str, body: &str) -> SendRequest {
    SendRequest {
        conversation_id: conversation_id.to_string(),
        sender_id: sender.to_string(),
        body: MessageBody::text(body),
        client_id: None,
    }
}

/// Appends `count` messages from bob to the backend.
fn inject_many(backend: &MemoryBackend, conversation_id: &str, count: usize) -> Vec<Message> {
    (0..count)
        .map(|i| backend.inject(&text(conversation_id, "bob", &format!("m{i}"))).unwrap())
        .collect()
}

fn canonical(conversation_id: &str, id: &str, secs: i64) -> Message {
    let at = Utc.timestamp_opt(1_700_000_000 + secs, 0).single().unwrap();
    Message {
        id: MessageId::new(id),
        conversation_id: conversation_id.to_string(),
        sender_id: "bob".to_string(),
        body: MessageBody::text(id),
        created_at: at,
        timestamp: at,
        client_id: None,
    }
}

async fn wait_for(sync: &SyncCoordinator<MemoryBackend>, pred: impl Fn(&SyncView) -> bool) -> SyncView {
    let mut rx = sync.subscribe_view();
    let view = timeout(WAIT, rx.wait_for(|v| pred(v)))
        .await
        .expect("timed out waiting for view")
        .expect("view channel closed");
    view.clone()
}

async fn wait_until(cond: impl Fn() -> bool) {
    timeout(WAIT, async {
        while !cond() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("timed out waiting for condition");
}

fn ids(view: &SyncView) -> Vec<String> {
    view.messages.iter().map(|m| m.id.to_string()).collect()
}

fn texts(view: &SyncView) -> Vec<String> {
    view.messages.iter().map(|m| m.body.preview()).collect()
}

#[tokio::test]
async fn cached_conversation_renders_before_network_then_grows_to_eleven() {
    let h = harness();
    let conv = group(&h.backend);
    let cached = inject_many(&h.backend, &conv.id, 10);
    h.cache.append_messages(&conv.id, &cached);
    h.backend.hold_fetches();

    h.sync.select_conversation(&conv.id).await.unwrap();
    let view = h.sync.view();
    assert_eq!(view.messages, cached);
    assert_eq!(view.phase, SessionPhase::Live(LiveActivity::Idle));
    assert_eq!(h.backend.message_fetches(), 0);
    assert_eq!(h.sync.read_stats().messages.hits, 1);

    h.backend.inject(&text(&conv.id, "bob", "eleven")).unwrap();
    let view = wait_for(&h.sync, |v| v.messages.len() == 11).await;
    assert_eq!(view.messages[10].body, MessageBody::text("eleven"));
    assert!(view.messages.windows(2).all(|w| w[0].key() < w[1].key()));
    assert_eq!(h.cache.get_messages(&conv.id).unwrap().len(), 11);
}

#[tokio::test]
async fn failed_send_shows_hello_then_rolls_back() {
    let h = harness();
    let conv = group(&h.backend);
    h.sync.select_conversation(&conv.id).await.unwrap();
    h.backend.fail_sends(true);
    h.backend.hold_sends();

    let temp_id = h.sync.send_message("hello").unwrap().unwrap();
    assert!(temp_id.is_temp());
    let view = h.sync.view();
    assert_eq!(texts(&view), vec!["hello"]);
    assert_eq!(view.pending_count(), 1);
    assert_eq!(view.phase, SessionPhase::Live(LiveActivity::Sending));

    h.backend.release_sends();
    let view = wait_for(&h.sync, |v| v.last_error.is_some()).await;
    assert!(view.messages.is_empty());
    assert_eq!(view.error_kind(), Some(ErrorKind::SendFailure));
    assert_eq!(view.phase, SessionPhase::Live(LiveActivity::Idle));
    assert_eq!(h.backend.sends(), 1);
    assert!(h.cache.get_messages(&conv.id).is_none());
}

#[tokio::test]
async fn successful_send_is_replaced_by_its_canonical_message() {
    let h = harness();
    let conv = group(&h.backend);
    h.sync.select_conversation(&conv.id).await.unwrap();
    h.backend.hold_sends();

    h.sync.send_message("hi").unwrap().unwrap();
    let view = h.sync.view();
    assert_eq!(view.messages.len(), 1);
    assert_eq!(view.pending_count(), 1);

    h.backend.release_sends();
    let view = wait_for(&h.sync, |v| v.pending_count() == 0 && v.messages.len() == 1).await;
    assert!(!view.messages[0].is_temp());
    assert_eq!(view.messages[0].body, MessageBody::text("hi"));
    assert!(view.last_error.is_none());

    let stored = h.cache.get_messages(&conv.id).unwrap();
    assert_eq!(stored.len(), 1);
    assert!(!stored[0].is_temp());
}

#[tokio::test]
async fn send_settles_without_client_id_echo() {
    let h = harness();
    h.backend.set_echo_client_ids(false);
    let conv = group(&h.backend);
    h.sync.select_conversation(&conv.id).await.unwrap();

    h.sync.send_message("no echo").unwrap().unwrap();
    let view = wait_for(&h.sync, |v| v.pending_count() == 0 && v.messages.len() == 1).await;
    assert_eq!(view.messages[0].client_id, None);
    assert_eq!(texts(&view), vec!["no echo"]);
}

#[tokio::test]
async fn identical_sends_each_settle_once() {
    let h = harness();
    let conv = group(&h.backend);
    h.sync.select_conversation(&conv.id).await.unwrap();
    h.backend.hold_sends();

    h.sync.send_message("ok").unwrap().unwrap();
    h.sync.send_message("ok").unwrap().unwrap();
    assert_eq!(h.sync.view().pending_count(), 2);

    h.backend.release_sends();
    let view = wait_for(&h.sync, |v| v.pending_count() == 0 && v.messages.len() == 2).await;
    assert_eq!(texts(&view), vec!["ok", "ok"]);
}

#[tokio::test]
async fn blank_send_is_a_no_op() {
    let h = harness();
    let conv = group(&h.backend);
    h.sync.select_conversation(&conv.id).await.unwrap();
    let before = h.sync.view();

    assert_eq!(h.sync.send_message("   \n\t").unwrap(), None);
    assert_eq!(h.sync.send_attachment(" ", None).unwrap(), None);
    assert_eq!(h.sync.view(), before);
    assert_eq!(h.backend.sends(), 0);
}

#[test]
fn send_outside_a_runtime_fails_without_queueing() {
    let runtime = tokio::runtime::Builder::new_current_thread().enable_all().build().unwrap();
    let h = runtime.block_on(async {
        let h = harness();
        let conv = group(&h.backend);
        h.sync.select_conversation(&conv.id).await.unwrap();
        h
    });

    let err = h.sync.send_message("hello").unwrap_err();
    assert!(matches!(err, Error::Runtime(_)));
    assert_eq!(h.sync.view().pending_count(), 0);
    assert!(h.sync.view().messages.is_empty());
    assert_eq!(h.backend.sends(), 0);
}

#[tokio::test]
async fn send_needs_an_active_conversation() {
    let h = harness();
    let err = h.sync.send_message("hello").unwrap_err();
    assert!(matches!(err, Error::Core(parley_core::Error::InvalidInput(_))));
    assert!(h.sync.view().messages.is_empty());
}

#[tokio::test]
async fn attachments_are_sent_optimistically() {
    let h = harness();
    let conv = group(&h.backend);
    h.sync.select_conversation(&conv.id).await.unwrap();

    h.sync.send_attachment("https://cdn.example.com/a.png", Some("a.png".into())).unwrap().unwrap();
    let view = wait_for(&h.sync, |v| v.pending_count() == 0 && v.messages.len() == 1).await;
    assert_eq!(texts(&view), vec!["[attachment] a.png"]);
}

#[tokio::test]
async fn duplicate_live_batches_do_not_duplicate_messages() {
    let h = harness();
    let conv = group(&h.backend);
    h.sync.select_conversation(&conv.id).await.unwrap();

    let once = h.backend.inject(&text(&conv.id, "bob", "once")).unwrap();
    wait_for(&h.sync, |v| v.messages.len() == 1).await;
    h.backend.replay(&conv.id, vec![once.clone()]);
    h.backend.replay(&conv.id, vec![once.clone()]);
    h.backend.inject(&text(&conv.id, "bob", "marker")).unwrap();

    let view = wait_for(&h.sync, |v| v.messages.iter().any(|m| m.body == MessageBody::text("marker"))).await;
    assert_eq!(texts(&view), vec!["once", "marker"]);
    let unique: HashSet<String> = ids(&view).into_iter().collect();
    assert_eq!(unique.len(), view.messages.len());
    assert_eq!(h.cache.get_messages(&conv.id).unwrap().len(), 2);
}

#[tokio::test]
async fn out_of_order_delivery_is_sorted() {
    let h = harness();
    let conv = group(&h.backend);
    h.sync.select_conversation(&conv.id).await.unwrap();

    let a = canonical(&conv.id, "canon-a", 1);
    let b = canonical(&conv.id, "canon-b", 2);
    h.backend.replay(&conv.id, vec![b]);
    h.backend.replay(&conv.id, vec![a]);

    let view = wait_for(&h.sync, |v| v.messages.len() == 2).await;
    assert_eq!(ids(&view), vec!["canon-a", "canon-b"]);
    let stored = h.cache.get_messages(&conv.id).unwrap();
    assert_eq!(stored[0].id, MessageId::new("canon-a"));
}

#[tokio::test]
async fn load_more_without_earlier_page_is_a_no_op() {
    let h = harness();
    let conv = group(&h.backend);
    inject_many(&h.backend, &conv.id, 3);
    h.sync.select_conversation(&conv.id).await.unwrap();
    assert_eq!(h.backend.message_fetches(), 1);

    let before = h.sync.view();
    assert!(!before.has_more);
    h.sync.load_more_messages().await.unwrap();
    assert_eq!(h.backend.message_fetches(), 1);
    assert_eq!(h.sync.view(), before);
}

#[tokio::test]
async fn pagination_walks_back_one_page_at_a_time() {
    let h = harness_with(options(2), Some("alice"));
    let conv = group(&h.backend);
    inject_many(&h.backend, &conv.id, 5);

    h.sync.select_conversation(&conv.id).await.unwrap();
    let view = h.sync.view();
    assert_eq!(texts(&view), vec!["m3", "m4"]);
    assert!(view.has_more);

    h.sync.load_more_messages().await.unwrap();
    let view = h.sync.view();
    assert_eq!(texts(&view), vec!["m1", "m2", "m3", "m4"]);
    assert!(view.has_more);

    h.sync.load_more_messages().await.unwrap();
    let view = h.sync.view();
    assert_eq!(texts(&view), vec!["m0", "m1", "m2", "m3", "m4"]);
    assert!(!view.has_more);
    assert!(!view.loading.older);

    h.sync.load_more_messages().await.unwrap();
    assert_eq!(h.backend.message_fetches(), 3);
    assert_eq!(h.sync.read_stats().older_page.misses, 2);
    assert_eq!(h.cache.get_messages(&conv.id).unwrap().len(), 5);
}

#[tokio::test]
async fn expired_cache_entry_is_a_miss() {
    let h = harness();
    let conv = group(&h.backend);
    let messages = inject_many(&h.backend, &conv.id, 2);
    h.cache.append_messages(&conv.id, &messages);
    h.clock.advance(chrono::Duration::days(8));

    h.sync.select_conversation(&conv.id).await.unwrap();
    assert_eq!(h.backend.message_fetches(), 1);
    let stats = h.sync.read_stats();
    assert_eq!(stats.messages.hits, 0);
    assert_eq!(stats.messages.misses, 1);
    assert_eq!(h.sync.view().messages, messages);
}

#[tokio::test]
async fn fresh_cache_entry_is_a_hit() {
    let h = harness();
    let conv = group(&h.backend);
    let messages = inject_many(&h.backend, &conv.id, 2);
    h.cache.append_messages(&conv.id, &messages);
    h.clock.advance(chrono::Duration::days(6));

    h.sync.select_conversation(&conv.id).await.unwrap();
    assert_eq!(h.backend.message_fetches(), 0);
    let stats = h.sync.read_stats();
    assert_eq!(stats.messages.hits, 1);
    assert_eq!(stats.messages.reads_saved, 2);
}

#[tokio::test]
async fn cache_bounded_below_page_size_still_offers_older_pages() {
    let config = CacheConfig { max_messages: 5, ..CacheConfig::default() };
    let h = harness_with_cache(options(10), Some("alice"), config);
    let conv = group(&h.backend);
    inject_many(&h.backend, &conv.id, 30);
    h.sync.select_conversation(&conv.id).await.unwrap();
    assert_eq!(h.cache.get_messages(&conv.id).unwrap().len(), 5);

    let reopened = SyncCoordinator::with_clock(
        h.backend.clone(),
        Arc::clone(&h.cache),
        Some("alice".to_string()),
        options(10),
        h.clock.clone(),
    );
    reopened.select_conversation(&conv.id).await.unwrap();
    let view = reopened.view();
    assert_eq!(view.messages.len(), 5);
    assert!(view.has_more);
    assert_eq!(h.backend.message_fetches(), 1);

    reopened.load_more_messages().await.unwrap();
    let view = reopened.view();
    assert_eq!(view.messages.len(), 15);
    assert_eq!(texts(&view)[0], "m15");
    assert!(view.has_more);
    assert_eq!(h.backend.message_fetches(), 2);
}

#[tokio::test]
async fn older_page_for_abandoned_conversation_is_discarded() {
    let h = harness_with(options(2), Some("alice"));
    let first = group(&h.backend);
    inject_many(&h.backend, &first.id, 5);
    let second = h
        .backend
        .seed_conversation(&NewConversation::new(ConversationKind::Direct, "alice", ["dave".to_string()], None))
        .unwrap();
    let other = inject_many(&h.backend, &second.id, 1);
    h.cache.append_messages(&second.id, &other);

    h.sync.select_conversation(&first.id).await.unwrap();
    h.backend.hold_fetches();
    let loader = h.sync.clone();
    let load = tokio::spawn(async move { loader.load_more_messages().await });
    let view = wait_for(&h.sync, |v| v.loading.older).await;
    assert_eq!(view.phase, SessionPhase::Live(LiveActivity::LoadingOlder));

    h.sync.select_conversation(&second.id).await.unwrap();
    h.backend.release_fetches();
    timeout(WAIT, load).await.unwrap().unwrap().unwrap();

    let view = h.sync.view();
    assert_eq!(view.active_conversation.as_deref(), Some(second.id.as_str()));
    assert_eq!(view.messages, other);
    assert!(!view.loading.older);
    assert_eq!(h.cache.get_messages(&first.id).unwrap().len(), 2);
}

#[tokio::test]
async fn reselecting_the_active_conversation_is_a_no_op() {
    let h = harness();
    let conv = group(&h.backend);
    h.sync.select_conversation(&conv.id).await.unwrap();
    h.sync.select_conversation(&conv.id).await.unwrap();
    assert_eq!(h.backend.message_fetches(), 1);
    assert_eq!(h.backend.subscription_count(), 1);
}

#[tokio::test]
async fn switching_conversations_detaches_the_previous_subscription() {
    let h = harness();
    let first = group(&h.backend);
    let second = h
        .backend
        .seed_conversation(&NewConversation::new(ConversationKind::Direct, "alice", ["dave".to_string()], None))
        .unwrap();

    h.sync.select_conversation(&first.id).await.unwrap();
    h.sync.select_conversation(&second.id).await.unwrap();
    assert_eq!(h.backend.subscription_count(), 1);

    h.backend.inject(&text(&first.id, "bob", "elsewhere")).unwrap();
    h.backend.inject(&text(&second.id, "dave", "here")).unwrap();
    let view = wait_for(&h.sync, |v| !v.messages.is_empty()).await;
    assert_eq!(texts(&view), vec!["here"]);
}

#[tokio::test]
async fn membership_violations_never_reach_the_backend() {
    let h = harness();
    let conv = group(&h.backend);
    h.sync.initialize().await.unwrap();

    let err = h.sync.remove_participant(&conv.id, "bob").await.unwrap_err();
    assert_eq!(err.kind(), Some(ErrorKind::MembershipConstraintViolation));
    let err = h.sync.add_participants(&conv.id, vec!["carol".into()]).await.unwrap_err();
    assert_eq!(err.kind(), Some(ErrorKind::MembershipConstraintViolation));
    assert_eq!(h.backend.mutations(), 0);
    assert_eq!(h.sync.view().error_kind(), Some(ErrorKind::MembershipConstraintViolation));

    let grown = h.sync.add_participants(&conv.id, vec!["dave".into()]).await.unwrap();
    assert_eq!(grown.participants.len(), 4);
    assert!(h.sync.view().conversation(&conv.id).unwrap().participants.contains("dave"));

    h.sync.remove_participant(&conv.id, "bob").await.unwrap();
    assert_eq!(h.backend.mutations(), 2);
}

#[tokio::test]
async fn membership_changes_need_a_known_conversation() {
    let h = harness();
    let err = h.sync.remove_participant("conv-missing", "bob").await.unwrap_err();
    assert!(matches!(err, Error::Core(parley_core::Error::InvalidInput(_))));
    assert_eq!(h.backend.mutations(), 0);
    assert!(h.sync.view().last_error.is_none());
}

#[tokio::test]
async fn create_conversation_validates_locally() {
    let h = harness();
    h.sync.initialize().await.unwrap();

    let err = h
        .sync
        .create_conversation(ConversationKind::Group, vec!["bob".to_string()], None)
        .await
        .unwrap_err();
    assert_eq!(err.kind(), Some(ErrorKind::MembershipConstraintViolation));
    assert!(h.backend.with_ledger(|l| l.conversations_for("alice").is_empty()));

    let direct = h
        .sync
        .create_conversation(ConversationKind::Direct, vec!["bob".to_string()], None)
        .await
        .unwrap();
    assert!(h.sync.view().conversation(&direct.id).is_some());
    assert_eq!(h.cache.get_conversations("alice").unwrap().len(), 1);
}

#[tokio::test]
async fn missing_user_is_not_authenticated() {
    let h = harness_with(options(50), None);
    let conv = group(&h.backend);

    let err = h.sync.initialize().await.unwrap_err();
    assert_eq!(err.kind(), Some(ErrorKind::NotAuthenticated));
    let err = h.sync.select_conversation(&conv.id).await.unwrap_err();
    assert_eq!(err.kind(), Some(ErrorKind::NotAuthenticated));
    assert_eq!(h.sync.view().error_kind(), Some(ErrorKind::NotAuthenticated));
    assert_eq!(h.backend.conversation_fetches(), 0);
    assert_eq!(h.backend.message_fetches(), 0);

    h.sync.dismiss_error();
    assert!(h.sync.view().last_error.is_none());
}

#[tokio::test]
async fn initialize_prefers_cached_conversation_list() {
    let h = harness();
    let conv = group(&h.backend);
    h.cache.set_conversations("alice", std::slice::from_ref(&conv));

    h.sync.initialize().await.unwrap();
    assert_eq!(h.backend.conversation_fetches(), 0);
    assert_eq!(h.sync.view().conversations, vec![conv]);
    assert_eq!(h.sync.read_stats().conversation_list.hits, 1);

    h.sync.initialize().await.unwrap();
    assert_eq!(h.backend.subscription_count(), 1);
}

#[tokio::test]
async fn initialize_reads_the_conversation_list_once() {
    let h = harness();
    group(&h.backend);

    h.sync.initialize().await.unwrap();
    assert_eq!(h.sync.view().conversations.len(), 1);
    assert_eq!(h.backend.conversation_fetches(), 0);
    let list = h.sync.read_stats().conversation_list;
    assert_eq!((list.hits, list.misses), (0, 1));
    assert_eq!(list.reads_consumed, 1);
    h.sync.cleanup().await;

    // Warm start: the cache shows the list but the subscription still reads it.
    h.sync.initialize().await.unwrap();
    wait_until(|| h.sync.read_stats().conversation_list.misses == 2).await;
    let list = h.sync.read_stats().conversation_list;
    assert_eq!(list.hits, 1);
    assert_eq!(list.reads_saved, 0);
    assert_eq!(list.reads_consumed, 2);
    assert_eq!(h.sync.read_stats().total.reads_saved, 0);
}

#[tokio::test]
async fn initialize_fetches_on_miss_and_follows_snapshots() {
    let h = harness();
    h.sync.initialize().await.unwrap();
    assert_eq!(h.backend.conversation_fetches(), 0);
    assert_eq!(h.sync.read_stats().conversation_list.misses, 1);
    assert!(h.sync.view().conversations.is_empty());
    assert!(!h.sync.view().loading.conversations);

    let conv = group(&h.backend);
    let view = wait_for(&h.sync, |v| v.conversations.len() == 1).await;
    assert_eq!(view.conversations[0].id, conv.id);
    assert_eq!(h.cache.get_conversations("alice").unwrap().len(), 1);
}

#[tokio::test]
async fn initialize_failure_is_surfaced_and_retryable() {
    let h = harness();
    h.backend.set_offline(true);
    let err = h.sync.initialize().await.unwrap_err();
    assert_eq!(err.kind(), Some(ErrorKind::NetworkUnavailable));
    assert_eq!(h.sync.view().error_kind(), Some(ErrorKind::NetworkUnavailable));

    assert!(!h.sync.view().loading.conversations);

    h.backend.set_offline(false);
    h.sync.initialize().await.unwrap();
    assert_eq!(h.backend.subscription_count(), 1);
    assert_eq!(h.sync.read_stats().conversation_list.misses, 1);
}

#[tokio::test]
async fn subscription_failure_keeps_displayed_messages() {
    let h = harness();
    let conv = group(&h.backend);
    inject_many(&h.backend, &conv.id, 2);
    h.sync.select_conversation(&conv.id).await.unwrap();

    h.backend.set_offline(true);
    let view = wait_for(&h.sync, |v| v.last_error.is_some()).await;
    assert_eq!(view.phase, SessionPhase::Detached);
    assert_eq!(view.messages.len(), 2);
    assert_eq!(view.error_kind(), Some(ErrorKind::NetworkUnavailable));
    assert_eq!(h.cache.get_messages(&conv.id).unwrap().len(), 2);

    h.backend.set_offline(false);
    h.sync.select_conversation(&conv.id).await.unwrap();
    assert!(h.sync.view().phase.is_live());
}

#[tokio::test]
async fn failed_hydration_fetch_detaches_with_error() {
    let h = harness();
    let conv = group(&h.backend);
    h.backend.set_offline(true);

    let err = h.sync.select_conversation(&conv.id).await.unwrap_err();
    assert_eq!(err.kind(), Some(ErrorKind::NetworkUnavailable));
    let view = h.sync.view();
    assert_eq!(view.phase, SessionPhase::Detached);
    assert_eq!(view.active_conversation.as_deref(), Some(conv.id.as_str()));
}

#[tokio::test]
async fn refresh_reloads_from_network_and_keeps_sends_in_flight() {
    let h = harness();
    let conv = group(&h.backend);
    let messages = inject_many(&h.backend, &conv.id, 3);
    h.cache.append_messages(&conv.id, &messages[..2]);
    h.sync.select_conversation(&conv.id).await.unwrap();
    wait_for(&h.sync, |v| v.messages.len() == 3).await;
    assert_eq!(h.backend.message_fetches(), 0);

    h.backend.hold_sends();
    h.sync.send_message("later").unwrap().unwrap();
    h.sync.refresh().await.unwrap();

    assert_eq!(h.backend.message_fetches(), 1);
    let view = h.sync.view();
    assert_eq!(view.messages.len(), 4);
    assert!(view.messages[3].is_temp());
    assert_eq!(view.phase, SessionPhase::Live(LiveActivity::Sending));
    assert_eq!(h.cache.get_messages(&conv.id).unwrap(), messages);

    h.backend.release_sends();
    let view = wait_for(&h.sync, |v| v.pending_count() == 0 && v.messages.len() == 4).await;
    assert_eq!(view.messages[3].body, MessageBody::text("later"));
}

#[tokio::test]
async fn refresh_while_offline_keeps_messages_and_cache() {
    let h = harness();
    let conv = group(&h.backend);
    let messages = inject_many(&h.backend, &conv.id, 3);
    h.sync.select_conversation(&conv.id).await.unwrap();
    assert_eq!(h.sync.view().messages, messages);

    h.backend.set_offline(true);
    let err = h.sync.refresh().await.unwrap_err();
    assert_eq!(err.kind(), Some(ErrorKind::NetworkUnavailable));
    let view = h.sync.view();
    assert_eq!(view.messages, messages);
    assert_eq!(view.phase, SessionPhase::Detached);
    assert_eq!(view.error_kind(), Some(ErrorKind::NetworkUnavailable));
    assert_eq!(h.cache.get_messages(&conv.id).unwrap(), messages);

    h.backend.set_offline(false);
    h.sync.refresh().await.unwrap();
    let view = h.sync.view();
    assert!(view.phase.is_live());
    assert_eq!(view.messages, messages);
}

#[tokio::test]
async fn refresh_replaces_cache_entry_with_the_fresh_page() {
    let h = harness();
    let conv = group(&h.backend);
    let messages = inject_many(&h.backend, &conv.id, 2);
    let gone = canonical(&conv.id, "canon-gone", -100);
    h.cache.append_messages(&conv.id, &[gone, messages[0].clone(), messages[1].clone()]);
    h.sync.select_conversation(&conv.id).await.unwrap();
    assert_eq!(h.sync.view().messages.len(), 3);

    h.sync.refresh().await.unwrap();
    assert_eq!(h.sync.view().messages, messages);
    assert_eq!(h.cache.get_messages(&conv.id).unwrap(), messages);
    assert_eq!(h.sync.read_stats().messages.misses, 1);
}

#[tokio::test]
async fn leave_conversation_detaches() {
    let h = harness();
    let conv = group(&h.backend);
    h.sync.select_conversation(&conv.id).await.unwrap();
    assert_eq!(h.backend.subscription_count(), 1);

    h.sync.leave_conversation().await;
    let view = h.sync.view();
    assert_eq!(view.phase, SessionPhase::Detached);
    assert_eq!(view.active_conversation, None);
    assert!(view.messages.is_empty());
    assert_eq!(h.backend.subscription_count(), 0);
}

#[tokio::test]
async fn cleanup_unsubscribes_everything() {
    let h = harness();
    let conv = group(&h.backend);
    h.sync.initialize().await.unwrap();
    h.sync.select_conversation(&conv.id).await.unwrap();
    assert_eq!(h.backend.subscription_count(), 2);

    h.sync.cleanup().await;
    assert_eq!(h.backend.subscription_count(), 0);
    assert_eq!(h.sync.view().phase, SessionPhase::Detached);

    h.sync.initialize().await.unwrap();
    assert_eq!(h.backend.subscription_count(), 1);
}

#[tokio::test]
async fn view_starts_uninitialized() {
    let h = harness();
    let view = h.sync.view();
    assert_eq!(view.phase, SessionPhase::Uninitialized);
    assert_eq!(view, SyncView::default());
}
