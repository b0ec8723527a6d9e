//! Per-source retransmission cache with priority-weighted completion.
//!
//! Every sent or forwarded Zombiegram stays cached until enough distinct
//! neighbors acknowledged it. "Enough" scales with the neighbor count, with
//! whether the message originated here, and with its priority: urgent
//! messages insist on broader mesh coverage, own messages have a higher bar
//! than forwarded ones, and a lone-neighbor node never retransmits forwarded
//! traffic forever.
//!
//! One cache instance covers one source id; a global cache would collide on
//! sequence numbers.

use std::collections::{HashMap, HashSet};

use tracing::debug;

use crate::errors::RouterError;
use crate::zombiegram::Zombiegram;

const OWN_MESSAGE_PROPAGATION: f64 = 0.5;
const NEIGHBOR_MESSAGE_PROPAGATION: f64 = 0.3;
/// Threshold scale per priority: low, normal, high, urgent.
const PRIORITY_PROPAGATION_WEIGHTS: [f64; 4] = [0.7, 0.8, 0.9, 1.0];

#[derive(Debug)]
struct CacheEntry {
    acked_by: HashSet<u32>,
    message: Zombiegram,
    is_own: bool,
}

/// Outstanding messages of a single source, keyed by sequence number.
#[derive(Debug, Default)]
pub struct RetransmissionCache {
    entries: HashMap<u8, CacheEntry>,
}

impl RetransmissionCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Cache a sent-out Zombiegram.
    ///
    /// # Errors
    /// [`RouterError::AckCacheCollision`] when the sequence number is already
    /// cached. A collision within the wrap window means pathological traffic
    /// or a retention bug and is surfaced upward instead of overwriting.
    pub fn add(&mut self, message: Zombiegram, is_own: bool) -> Result<(), RouterError> {
        let seq_num = message.seq_num();
        if self.entries.contains_key(&seq_num) {
            return Err(RouterError::AckCacheCollision { seq_num });
        }
        self.entries.insert(
            seq_num,
            CacheEntry { acked_by: HashSet::new(), message, is_own },
        );
        Ok(())
    }

    /// Record an acknowledgement from `from_source` for `seq_num`.
    ///
    /// Unknown sequence numbers are ignored: the entry may already have been
    /// retired by a previous maintenance tick. Returns whether the ack
    /// counted (repeat acks from the same neighbor do not).
    pub fn record_ack(&mut self, from_source: u32, seq_num: u8) -> bool {
        match self.entries.get_mut(&seq_num) {
            Some(entry) => entry.acked_by.insert(from_source),
            None => {
                debug!(seq_num, "ack for a seq_num not in the cache, already retired?");
                false
            }
        }
    }

    /// Acknowledgement count for a cached sequence number.
    pub fn ack_count(&self, seq_num: u8) -> Option<usize> {
        self.entries.get(&seq_num).map(|entry| entry.acked_by.len())
    }

    /// Retire entries whose ack count reached the completion threshold and
    /// return the survivors for re-sending, plus the number retired.
    ///
    /// A neighbor count of zero wipes the whole cache: with nobody in range
    /// there is nothing left to satisfy.
    pub fn drain_completed(&mut self, neighbor_count: usize) -> (Vec<Zombiegram>, usize) {
        if neighbor_count == 0 {
            let wiped = self.entries.len();
            self.entries.clear();
            return (Vec::new(), wiped);
        }

        let own_base = neighbor_count as f64 * OWN_MESSAGE_PROPAGATION;
        let neighbor_base = if neighbor_count > 1 {
            neighbor_count as f64 * NEIGHBOR_MESSAGE_PROPAGATION
        } else {
            0.0
        };

        let mut pending = Vec::new();
        let mut wiped = 0;
        self.entries.retain(|_, entry| {
            let base = if entry.is_own { own_base } else { neighbor_base };
            let threshold =
                base * PRIORITY_PROPAGATION_WEIGHTS[entry.message.priority() as usize];
            if entry.acked_by.len() as f64 >= threshold {
                wiped += 1;
                false
            } else {
                pending.push(entry.message.clone());
                true
            }
        });
        (pending, wiped)
    }
}
