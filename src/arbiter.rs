//! Sequence arbitration across the two redundant feed copies.
//!
//! Per channel, each distinct sequence number is accepted exactly once:
//! whichever copy's frame is processed first wins and the other copy's
//! frame is dropped when it later arrives. The arbiter is deliberately
//! order-agnostic between primary and secondary — it never correlates
//! the two paths by time, only by sequence number — which tolerates
//! reordering and differing latency between the multicast paths.
//!
//! Duplicates are the expected steady-state outcome for the slower
//! feed, so they are counted, never reported as errors. Gaps are not
//! recovered; the arbiter guarantees at-most-once delivery downstream,
//! nothing more.

use std::collections::HashMap;

use crate::channel::StreamId;

/// Arbitration outcome for one candidate frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    /// First sighting of this sequence number (or an unsequenced
    /// frame); pass it downstream.
    Accepted,
    /// Already seen via the other copy (or genuinely replayed); drop
    /// silently.
    Duplicate,
}

#[derive(Debug, Default)]
struct StreamState {
    /// Highest accepted sequence number; 0 means none seen.
    last_seq: i64,
    accepted: u64,
    duplicates: u64,
}

/// Per-stream duplicate suppression state.
///
/// Thread-confined to the processing thread; streams are tracked
/// lazily on first sighting so the arbiter needs no channel table.
#[derive(Debug, Default)]
pub struct FeedArbiter {
    streams: HashMap<StreamId, StreamState>,
}

/// Diagnostic counters for one stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamStats {
    pub last_seq: i64,
    pub accepted: u64,
    pub duplicates: u64,
}

impl FeedArbiter {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Decides whether a frame with sequence `seq` on `stream` is the
    /// first copy seen.
    ///
    /// `seq == 0` (unsequenced, e.g. heartbeats) is always accepted and
    /// leaves the stream state untouched.
    pub fn accept(&mut self, stream: StreamId, seq: i32) -> Verdict {
        if seq == 0 {
            return Verdict::Accepted;
        }

        let state = self.streams.entry(stream).or_default();
        let seq = i64::from(seq);
        if seq <= state.last_seq {
            state.duplicates += 1;
            Verdict::Duplicate
        } else {
            state.last_seq = seq;
            state.accepted += 1;
            Verdict::Accepted
        }
    }

    /// Counters for one stream, if it has seen any sequenced frame.
    #[must_use]
    pub fn stats(&self, stream: StreamId) -> Option<StreamStats> {
        self.streams.get(&stream).map(|s| StreamStats {
            last_seq: s.last_seq,
            accepted: s.accepted,
            duplicates: s.duplicates,
        })
    }

    /// Total frames accepted across all streams.
    #[must_use]
    pub fn total_accepted(&self) -> u64 {
        self.streams.values().map(|s| s.accepted).sum()
    }

    /// Total duplicates dropped across all streams.
    #[must_use]
    pub fn total_duplicates(&self) -> u64 {
        self.streams.values().map(|s| s.duplicates).sum()
    }
}
