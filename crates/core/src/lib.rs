// SPDX-License-Identifier: MIT
// Copyright (c) 2026 Alfred Jean LLC

//! parley-core: shared library for the parley sync engine
//!
//! This crate provides the data model, local cache, reconciliation and read
//! accounting used by the sync client, plus the authoritative ledger and
//! wire protocol shared with the relay.

pub mod accountant;
pub mod cache;
pub mod clock;
pub mod conversation;
pub mod error;
pub mod kv;
pub mod ledger;
pub mod message;
pub mod pending;
pub mod protocol;
pub mod reconcile;

#[cfg(test)]
mod test_helpers;

pub use accountant::{ReadAccountant, ReadSource, ReadStats, SourceStats};
pub use cache::{CacheConfig, CacheStore, CACHE_VERSION};
pub use clock::{ClockSource, ManualClock, SystemClock};
pub use conversation::{
    Conversation, ConversationKind, ConversationName, MembershipChange, MessageSummary,
    NewConversation, MIN_GROUP_SIZE,
};
pub use error::{Error, ErrorKind, Result};
pub use kv::{KvStore, MemoryKv, SqliteKv};
pub use ledger::Ledger;
pub use message::{
    Message, MessageBatch, MessageBody, MessageId, MessageKey, MessagePage, SendRequest,
};
pub use pending::{PendingSend, PendingSet, PendingState};
pub use reconcile::{merge, reconcile, union_canonical, Reconciled};
