//! Sequence-tagged scrollback ring.
//!
//! Every PTY output chunk gets a monotonically increasing sequence
//! number. The ring evicts whole chunks from the front once the byte
//! budget is exceeded; a snapshot reports the last sequence number it
//! covers so a subscriber can splice replay and live stream without gaps
//! or duplicates.

use std::collections::VecDeque;

pub struct SeqScrollback {
    chunks: VecDeque<(u64, Vec<u8>)>,
    bytes: usize,
    capacity: usize,
    next_seq: u64,
    truncated: bool,
}

/// Snapshot of the ring for attach replay.
pub struct ScrollbackSnapshot {
    pub bytes: Vec<u8>,
    pub last_seq: u64,
    pub truncated: bool,
}

impl SeqScrollback {
    pub fn new(capacity: usize) -> Self {
        Self {
            chunks: VecDeque::new(),
            bytes: 0,
            capacity,
            // Sequence numbers start at 1 so `last_seq == 0` always
            // means "replay covered no output".
            next_seq: 1,
            truncated: false,
        }
    }

    /// Append a chunk, returning its sequence number.
    pub fn push(&mut self, data: &[u8]) -> u64 {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.bytes += data.len();
        self.chunks.push_back((seq, data.to_vec()));
        // Never evict the newest chunk, even when it alone exceeds the
        // budget; a subscriber must always see the latest output.
        while self.bytes > self.capacity && self.chunks.len() > 1 {
            if let Some((_, evicted)) = self.chunks.pop_front() {
                self.bytes -= evicted.len();
                self.truncated = true;
            }
        }
        seq
    }

    /// Sequence number of the most recent chunk, or 0 before any output.
    pub fn last_seq(&self) -> u64 {
        self.next_seq.saturating_sub(1)
    }

    pub fn snapshot(&self) -> ScrollbackSnapshot {
        let mut bytes = Vec::with_capacity(self.bytes);
        for (_, chunk) in &self.chunks {
            bytes.extend_from_slice(chunk);
        }
        ScrollbackSnapshot {
            bytes,
            last_seq: self.last_seq(),
            truncated: self.truncated,
        }
    }

    pub fn len_bytes(&self) -> usize {
        self.bytes
    }
}
