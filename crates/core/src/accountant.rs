// SPDX-License-Identifier: MIT
// Copyright (c) 2026 Alfred Jean LLC

//! Read-cost accounting.
//!
//! Every logical read is recorded as either a cache hit (backend reads
//! saved) or a miss (backend reads consumed), per source. Counters are
//! plain atomics: recording never blocks and cannot fail.

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

/// Where a read came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReadSource {
    ConversationList,
    Messages,
    OlderPage,
    LiveBatch,
}

impl ReadSource {
    pub const ALL: [ReadSource; 4] = [
        ReadSource::ConversationList,
        ReadSource::Messages,
        ReadSource::OlderPage,
        ReadSource::LiveBatch,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ReadSource::ConversationList => "conversation_list",
            ReadSource::Messages => "messages",
            ReadSource::OlderPage => "older_page",
            ReadSource::LiveBatch => "live_batch",
        }
    }

    fn index(self) -> usize {
        self as usize
    }
}

impl fmt::Display for ReadSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Debug, Default)]
struct Counters {
    hits: AtomicU64,
    misses: AtomicU64,
    saved: AtomicU64,
    consumed: AtomicU64,
}

impl Counters {
    fn snapshot(&self) -> SourceStats {
        SourceStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            reads_saved: self.saved.load(Ordering::Relaxed),
            reads_consumed: self.consumed.load(Ordering::Relaxed),
        }
    }
}

/// Counters for one read source.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceStats {
    pub hits: u64,
    pub misses: u64,
    pub reads_saved: u64,
    pub reads_consumed: u64,
}

impl SourceStats {
    /// Fraction of logical reads served from cache, 0.0 when nothing was read.
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }

    fn add(&mut self, other: &SourceStats) {
        self.hits += other.hits;
        self.misses += other.misses;
        self.reads_saved += other.reads_saved;
        self.reads_consumed += other.reads_consumed;
    }
}

/// Point-in-time view of the accountant.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ReadStats {
    pub total: SourceStats,
    pub conversation_list: SourceStats,
    pub messages: SourceStats,
    pub older_page: SourceStats,
    pub live_batch: SourceStats,
}

impl ReadStats {
    pub fn hit_rate(&self) -> f64 {
        self.total.hit_rate()
    }

    pub fn source(&self, source: ReadSource) -> &SourceStats {
        match source {
            ReadSource::ConversationList => &self.conversation_list,
            ReadSource::Messages => &self.messages,
            ReadSource::OlderPage => &self.older_page,
            ReadSource::LiveBatch => &self.live_batch,
        }
    }
}

/// Lock-free read-cost counters.
#[derive(Debug, Default)]
pub struct ReadAccountant {
    sources: [Counters; 4],
    warn_threshold: Option<u64>,
    warned: AtomicBool,
}

impl ReadAccountant {
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates an accountant that logs a warning once consumed reads exceed
    /// `threshold`.
    pub fn with_warn_threshold(threshold: u64) -> Self {
        ReadAccountant { warn_threshold: Some(threshold), ..Self::default() }
    }

    /// Records a read served from cache.
    pub fn record_hit(&self, source: ReadSource, saved: u64) {
        let counters = &self.sources[source.index()];
        counters.hits.fetch_add(1, Ordering::Relaxed);
        counters.saved.fetch_add(saved, Ordering::Relaxed);
        debug!(target: "parley::reads", source = %source, saved, "cache hit");
    }

    /// Records a read that went to the backend.
    pub fn record_miss(&self, source: ReadSource, consumed: u64) {
        let counters = &self.sources[source.index()];
        counters.misses.fetch_add(1, Ordering::Relaxed);
        counters.consumed.fetch_add(consumed, Ordering::Relaxed);
        debug!(target: "parley::reads", source = %source, consumed, "backend read");

        if let Some(threshold) = self.warn_threshold {
            let total = self.consumed_total();
            if total > threshold && !self.warned.swap(true, Ordering::Relaxed) {
                warn!(consumed = total, threshold, "backend reads exceeded warning threshold");
            }
        }
    }

    fn consumed_total(&self) -> u64 {
        self.sources.iter().map(|c| c.consumed.load(Ordering::Relaxed)).sum()
    }

    /// Returns aggregate and per-source counters.
    pub fn stats(&self) -> ReadStats {
        let per: Vec<SourceStats> = self.sources.iter().map(Counters::snapshot).collect();
        let mut total = SourceStats::default();
        for s in &per {
            total.add(s);
        }
        ReadStats {
            total,
            conversation_list: per[ReadSource::ConversationList.index()],
            messages: per[ReadSource::Messages.index()],
            older_page: per[ReadSource::OlderPage.index()],
            live_batch: per[ReadSource::LiveBatch.index()],
        }
    }
}

#[cfg(test)]
#[path = "accountant_tests.rs"]
mod tests;
