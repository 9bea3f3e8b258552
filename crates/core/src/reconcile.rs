// SPDX-License-Identifier: MIT
// Copyright (c) 2026 Alfred Jean LLC

//! Merge canonical messages with optimistic sends into one ordered view.
//!
//! Merge rules:
//! - Canonical messages are unioned by id; on conflict the incoming copy wins
//! - Temp-marked messages never enter the canonical sequence
//! - The canonical sequence is sorted by (timestamp, id)
//! - In-flight optimistic sends follow all canonical messages, in submission order
//! - Each newly-arrived canonical message settles at most one pending send
//!
//! Merging is idempotent and tolerates repeated delivery of the same batch.

use std::collections::{BTreeMap, HashSet};

use chrono::Duration;

use crate::message::{Message, MessageId};
use crate::pending::PendingSend;

/// Allowed clock skew between the device and the backend when matching a
/// canonical message to a send by content.
pub const CORRELATION_SKEW_SECS: i64 = 5;

/// Result of a merge, with the canonical part kept separate.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Reconciled {
    /// Canonical messages sorted by (timestamp, id).
    pub canonical: Vec<Message>,
    /// Placeholders for sends still in flight, in submission order.
    pub pending_tail: Vec<Message>,
    /// Temp ids of pending sends settled by this merge.
    pub settled: Vec<MessageId>,
}

impl Reconciled {
    /// The visible sequence: canonical messages followed by placeholders.
    pub fn view(&self) -> Vec<Message> {
        let mut view = Vec::with_capacity(self.canonical.len() + self.pending_tail.len());
        view.extend(self.canonical.iter().cloned());
        view.extend(self.pending_tail.iter().cloned());
        view
    }

    pub fn into_view(mut self) -> Vec<Message> {
        self.canonical.append(&mut self.pending_tail);
        self.canonical
    }
}

/// Merges `incoming` into `current` and appends unreconciled sends.
pub fn merge(current: &[Message], incoming: &[Message], pending: &[PendingSend]) -> Vec<Message> {
    reconcile(current, incoming, pending).into_view()
}

/// Detailed form of [`merge`].
pub fn reconcile(current: &[Message], incoming: &[Message], pending: &[PendingSend]) -> Reconciled {
    let settled = correlate(current, incoming, pending);
    let canonical = union_canonical(current, incoming);
    let pending_tail = pending
        .iter()
        .filter(|p| p.is_in_flight() && !settled.contains(&p.temp_id))
        .map(PendingSend::to_message)
        .collect();

    Reconciled { canonical, pending_tail, settled }
}

/// Unions two message sequences by id and sorts the result.
///
/// Temp-marked entries are dropped, so a canonical message always wins over
/// its placeholder. On an id conflict the copy from `incoming` wins.
pub fn union_canonical(current: &[Message], incoming: &[Message]) -> Vec<Message> {
    let mut by_id: BTreeMap<&MessageId, &Message> = BTreeMap::new();
    for message in current.iter().chain(incoming.iter()) {
        if message.is_temp() {
            continue;
        }
        by_id.insert(&message.id, message);
    }

    let mut merged: Vec<Message> = by_id.into_values().cloned().collect();
    merged.sort_by(Message::order);
    merged
}

/// Finds the pending sends settled by newly-arrived canonical messages.
///
/// Matching, in order of preference: the canonical id returned by the send
/// call, the client id echoed by the backend, and finally same conversation,
/// sender and body with a timestamp no earlier than the submission time
/// (minus [`CORRELATION_SKEW_SECS`]). The last rule is ambiguous for identical
/// messages sent in quick succession; taking the oldest submission first keeps
/// the view consistent either way.
fn correlate(current: &[Message], incoming: &[Message], pending: &[PendingSend]) -> Vec<MessageId> {
    let known: HashSet<&MessageId> = current.iter().map(|m| &m.id).collect();
    let mut open: Vec<&PendingSend> = pending.iter().filter(|p| p.is_in_flight()).collect();
    let mut seen: HashSet<&MessageId> = HashSet::new();
    let mut settled = Vec::new();
    let skew = Duration::seconds(CORRELATION_SKEW_SECS);

    for message in incoming {
        if open.is_empty() {
            break;
        }
        if message.is_temp() || known.contains(&message.id) || !seen.insert(&message.id) {
            continue;
        }

        let by_canonical_id =
            || open.iter().position(|p| p.canonical_id.as_ref() == Some(&message.id));
        let by_client_id = || {
            message
                .client_id
                .as_ref()
                .and_then(|cid| open.iter().position(|p| &p.client_id == cid))
        };
        let by_content = || {
            if message.client_id.is_some() {
                return None;
            }
            open.iter().position(|p| {
                p.canonical_id.is_none()
                    && p.conversation_id == message.conversation_id
                    && p.sender_id == message.sender_id
                    && p.body == message.body
                    && message.timestamp >= p.submitted_at - skew
            })
        };

        if let Some(index) = by_canonical_id().or_else(by_client_id).or_else(by_content) {
            settled.push(open.remove(index).temp_id.clone());
        }
    }

    settled
}

#[cfg(test)]
#[path = "reconcile_tests.rs"]
mod tests;
