//! Sequence-numbered bounded ring buffers for captured console/network
//! activity.
//!
//! Sequence numbers are monotonic for the lifetime of the buffer and never
//! reused, so a client can poll with a `sinceSeq` cursor and miss nothing
//! that is still retained.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;

/// An entry paired with its assigned sequence number.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SeqEntry<T> {
    /// Monotonic sequence number, 1-based.
    pub seq: u64,
    /// The captured entry.
    #[serde(flatten)]
    pub entry: T,
}

/// Bounded ring with monotonic sequence numbers. Oldest entries are evicted
/// when the capacity is exceeded; sequence numbers keep counting.
#[derive(Debug)]
pub struct RingBuffer<T> {
    entries: VecDeque<SeqEntry<T>>,
    next_seq: u64,
    capacity: usize,
}

impl<T: Clone> RingBuffer<T> {
    /// A ring holding at most `capacity` entries (min 1).
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: VecDeque::new(),
            next_seq: 1,
            capacity: capacity.max(1),
        }
    }

    /// Append an entry, returning its sequence number.
    pub fn push(&mut self, entry: T) -> u64 {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.entries.push_back(SeqEntry { seq, entry });
        while self.entries.len() > self.capacity {
            let _ = self.entries.pop_front();
        }
        seq
    }

    /// Entries with `seq` strictly greater than the cursor, oldest first.
    #[must_use]
    pub fn since(&self, since_seq: u64) -> Vec<SeqEntry<T>> {
        self.entries
            .iter()
            .filter(|e| e.seq > since_seq)
            .cloned()
            .collect()
    }

    /// Highest sequence number handed out so far (0 when empty).
    #[must_use]
    pub fn latest_seq(&self) -> u64 {
        self.next_seq - 1
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// One captured console message (`Runtime.consoleAPICalled`).
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConsoleEntry {
    /// Console level (`log`, `warn`, `error`, ...).
    pub level: String,
    /// Flattened message text.
    pub text: String,
    /// Target the message originated from, when known.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub target_id: Option<String>,
    /// Capture time.
    pub timestamp: DateTime<Utc>,
}

/// One captured network response (`Network.responseReceived`).
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NetworkEntry {
    /// Request URL.
    pub url: String,
    /// HTTP status code.
    pub status: u16,
    /// MIME type of the response.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mime_type: Option<String>,
    /// Target the response belongs to, when known.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub target_id: Option<String>,
    /// Capture time.
    pub timestamp: DateTime<Utc>,
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
