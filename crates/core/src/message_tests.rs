// SPDX-License-Identifier: MIT
// Copyright (c) 2026 Alfred Jean LLC

#![allow(clippy::unwrap_used)]

use super::*;
use crate::test_helpers::{at, msg};
use yare::parameterized;

#[test]
fn temp_ids_carry_marker() {
    let id = MessageId::temp();
    assert!(id.is_temp());
    assert!(id.as_str().starts_with(TEMP_PREFIX));
    assert_ne!(MessageId::temp(), id);
}

#[test]
fn canonical_ids_are_not_temp() {
    assert!(!MessageId::new("m-1").is_temp());
    assert!(!MessageId::from("template").is_temp());
}

#[test]
fn key_orders_by_timestamp_then_id() {
    let a = MessageKey::new(at(1), MessageId::new("b"));
    let b = MessageKey::new(at(2), MessageId::new("a"));
    let c = MessageKey::new(at(2), MessageId::new("b"));
    assert!(a < b);
    assert!(b < c);
}

#[test]
fn newest_and_oldest_skip_temp_entries() {
    let mut temp = msg("x", 99);
    temp.id = MessageId::temp();
    let messages = vec![msg("a", 1), msg("b", 5), temp];

    assert_eq!(newest_key(&messages).unwrap().id, MessageId::new("b"));
    assert_eq!(oldest_key(&messages).unwrap().id, MessageId::new("a"));
    assert!(newest_key(&[]).is_none());
}

#[parameterized(
    empty_text = { MessageBody::text(""), true },
    whitespace_text = { MessageBody::text("  \n\t "), true },
    text = { MessageBody::text(" hi "), false },
    blank_url = { MessageBody::attachment(" ", None), true },
    url = { MessageBody::attachment("https://x/y.png", None), false },
)]
fn body_blankness(body: MessageBody, blank: bool) {
    assert_eq!(body.is_blank(), blank);
}

#[test]
fn preview_truncates_long_first_line() {
    let long = "x".repeat(200);
    let preview = MessageBody::text(format!("{long}\nsecond")).preview();
    assert_eq!(preview.chars().count(), PREVIEW_LEN);
    assert!(preview.ends_with('…'));

    assert_eq!(MessageBody::text("a\nb").preview(), "a");
    assert_eq!(MessageBody::attachment("u", Some("cat.png".into())).preview(), "[attachment] cat.png");
    assert_eq!(MessageBody::system("member_added", serde_json::Value::Null).preview(), "[member_added]");
}

#[test]
fn body_serializes_with_kind_tag() {
    let json = serde_json::to_value(MessageBody::text("hello")).unwrap();
    assert_eq!(json["kind"], "text");
    assert_eq!(json["text"], "hello");

    let back: MessageBody = serde_json::from_value(json).unwrap();
    assert_eq!(back, MessageBody::text("hello"));
}

#[test]
fn message_without_client_id_omits_field() {
    let json = serde_json::to_value(msg("m1", 1)).unwrap();
    assert!(json.get("client_id").is_none());
    assert_eq!(json["id"], "m1");
}
