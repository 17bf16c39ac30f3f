//! Bounded ring buffer of recent outbound envelopes.
//!
//! Every session-scoped envelope passes through here before it reaches any
//! browser, which is what makes reconnect replay ("give me everything after
//! message X") reproduce delivery order exactly.

use chrono::Utc;
use quay_protocol::Envelope;
use uuid::Uuid;

/// Default capacity of a session's replay buffer.
pub const DEFAULT_CAPACITY: usize = 1000;

/// One buffered envelope.
#[derive(Debug, Clone)]
pub struct BufferedEntry {
    /// Process-unique entry ID.
    pub id: String,
    /// Monotonic sequence number within this buffer.
    pub seq: u64,
    /// Push time, Unix milliseconds.
    pub epoch_millis: i64,
    /// The envelope as it was sent live.
    pub envelope: Envelope,
}

/// Fixed-capacity ring of recent envelopes with suffix queries.
///
/// Push is O(1); queries are O(capacity). Entry IDs are UUIDs, so an ID that
/// has been evicted can never match a live entry.
pub struct MessageBuffer {
    entries: Vec<Option<BufferedEntry>>,
    write_index: usize,
    count: usize,
    next_seq: u64,
}

impl MessageBuffer {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        assert!(capacity > 0, "buffer capacity must be positive");
        Self {
            entries: vec![None; capacity],
            write_index: 0,
            count: 0,
            next_seq: 0,
        }
    }

    /// Append an envelope, evicting the oldest entry at capacity.
    /// Returns the new entry's ID.
    pub fn push(&mut self, envelope: Envelope) -> String {
        let id = Uuid::new_v4().to_string();
        let entry = BufferedEntry {
            id: id.clone(),
            seq: self.next_seq,
            epoch_millis: Utc::now().timestamp_millis(),
            envelope,
        };
        self.next_seq += 1;

        self.entries[self.write_index] = Some(entry);
        self.write_index = (self.write_index + 1) % self.entries.len();
        if self.count < self.entries.len() {
            self.count += 1;
        }
        id
    }

    /// Number of live entries.
    pub fn len(&self) -> usize {
        self.count
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    /// All live entries in append order.
    pub fn get_all(&self) -> Vec<BufferedEntry> {
        self.iter_ordered().cloned().collect()
    }

    /// Every entry strictly after the one with `id`, in append order.
    /// Empty when `id` is not (or no longer) in the buffer.
    pub fn get_after(&self, id: &str) -> Vec<BufferedEntry> {
        let mut found = false;
        let mut result = Vec::new();
        for entry in self.iter_ordered() {
            if found {
                result.push(entry.clone());
            } else if entry.id == id {
                found = true;
            }
        }
        if found { result } else { Vec::new() }
    }

    /// Iterate entries oldest-first.
    fn iter_ordered(&self) -> impl Iterator<Item = &BufferedEntry> {
        let capacity = self.entries.len();
        let start = if self.count == capacity {
            self.write_index
        } else {
            0
        };
        (0..self.count).filter_map(move |offset| {
            self.entries[(start + offset) % capacity].as_ref()
        })
    }
}

impl Default for MessageBuffer {
    fn default() -> Self {
        Self::new()
    }
}
