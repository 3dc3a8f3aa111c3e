//! Bounded FIFO table of recently relayed record keys

use super::types::RecordKey;
use std::collections::{HashSet, VecDeque};

/// Remembers the last `capacity` keys; the oldest key is forgotten first
#[derive(Debug)]
pub struct DedupTable {
    seen: HashSet<RecordKey>,
    order: VecDeque<RecordKey>,
    capacity: usize,
}

impl DedupTable {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            seen: HashSet::with_capacity(capacity),
            order: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    /// Record `key`; returns false if it was already present
    pub fn insert(&mut self, key: RecordKey) -> bool {
        if self.seen.contains(&key) {
            return false;
        }
        if self.order.len() >= self.capacity {
            if let Some(oldest) = self.order.pop_front() {
                self.seen.remove(&oldest);
            }
        }
        self.seen.insert(key.clone());
        self.order.push_back(key);
        true
    }

    pub fn contains(&self, key: &RecordKey) -> bool {
        self.seen.contains(key)
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}
