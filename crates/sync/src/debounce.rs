// SPDX-License-Identifier: MIT
// Copyright (c) 2026 Alfred Jean LLC

//! Quiescence-window coalescing for bursty streams.
//!
//! A backend may push several conversation-list snapshots in quick
//! succession (one per message in a burst). Only the last snapshot of a
//! burst matters, so [`coalesce`] holds each item until the stream has been
//! quiet for a full window and then yields the newest one.

use std::time::Duration;

use futures_util::stream::{self, BoxStream, Stream, StreamExt};
use tracing::trace;

/// Yields the newest item of each burst once `window` passes without a new
/// item. When the source ends, the held item is yielded immediately.
pub fn coalesce<S>(source: S, window: Duration) -> BoxStream<'static, S::Item>
where
    S: Stream + Send + 'static,
    S::Item: Send + 'static,
{
    let source = source.boxed().fuse();
    stream::unfold((source, false), move |(mut source, finished)| async move {
        if finished {
            return None;
        }
        let mut latest = source.next().await?;
        let mut dropped = 0usize;
        loop {
            match tokio::time::timeout(window, source.next()).await {
                Ok(Some(item)) => {
                    latest = item;
                    dropped += 1;
                }
                Ok(None) => return Some((latest, (source, true))),
                Err(_) => {
                    if dropped > 0 {
                        trace!(dropped, "coalesced burst");
                    }
                    return Some((latest, (source, false)));
                }
            }
        }
    })
    .boxed()
}

#[cfg(test)]
#[path = "debounce_tests.rs"]
mod tests;
