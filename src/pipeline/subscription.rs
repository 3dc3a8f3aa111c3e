//! Bounded drop-oldest subscriber queues for bucket updates
//!
//! Publishing never blocks and never fails: when a subscriber's queue is
//! full, its oldest pending update is discarded and its dropped counter is
//! incremented. A slow or stalled observer therefore cannot hold back
//! ingestion.

use super::types::{AggregateBucket, BucketKey, RecordKey};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, Weak};
use tokio::sync::Notify;

/// One bucket-updated event
#[derive(Debug, Clone, PartialEq)]
pub struct BucketUpdate {
    pub key: BucketKey,
    /// Bucket state right after the update
    pub bucket: AggregateBucket,
    /// Record that caused the update
    pub record: RecordKey,
}

struct SubscriberQueue {
    buffer: Mutex<VecDeque<BucketUpdate>>,
    capacity: usize,
    dropped: AtomicU64,
    notify: Notify,
}

impl SubscriberQueue {
    fn push(&self, update: BucketUpdate) {
        {
            let mut buffer = self.buffer.lock().unwrap_or_else(PoisonError::into_inner);
            if buffer.len() >= self.capacity {
                buffer.pop_front();
                self.dropped.fetch_add(1, Ordering::Relaxed);
            }
            buffer.push_back(update);
        }
        self.notify.notify_one();
    }

    fn pop(&self) -> Option<BucketUpdate> {
        self.buffer
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pop_front()
    }

    fn len(&self) -> usize {
        self.buffer.lock().unwrap_or_else(PoisonError::into_inner).len()
    }
}

/// Receiving end of a bucket-update subscription
///
/// The sequence is infinite: `next()` waits until another update is
/// published. Dropping the subscription unregisters it.
pub struct Subscription {
    queue: Arc<SubscriberQueue>,
}

impl Subscription {
    /// Wait for the next update
    pub async fn next(&mut self) -> BucketUpdate {
        loop {
            if let Some(update) = self.queue.pop() {
                return update;
            }
            self.queue.notify.notified().await;
        }
    }

    /// Take the next update if one is already queued
    pub fn try_next(&mut self) -> Option<BucketUpdate> {
        self.queue.pop()
    }

    /// Drain everything currently queued
    pub fn drain(&mut self) -> Vec<BucketUpdate> {
        let mut buffer = self.queue.buffer.lock().unwrap_or_else(PoisonError::into_inner);
        let drained: Vec<BucketUpdate> = buffer.drain(..).collect();
        drained
    }

    /// Number of updates discarded because this subscriber fell behind
    pub fn dropped_count(&self) -> u64 {
        self.queue.dropped.load(Ordering::Relaxed)
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.queue.capacity
    }
}

/// Fan-out registry owned by the aggregation engine
pub struct SubscriberRegistry {
    subscribers: Vec<Weak<SubscriberQueue>>,
    capacity: usize,
}

impl SubscriberRegistry {
    pub fn new(capacity: usize) -> Self {
        Self {
            subscribers: Vec::new(),
            capacity: capacity.max(1),
        }
    }

    pub fn subscribe(&mut self) -> Subscription {
        let queue = Arc::new(SubscriberQueue {
            buffer: Mutex::new(VecDeque::with_capacity(self.capacity)),
            capacity: self.capacity,
            dropped: AtomicU64::new(0),
            notify: Notify::new(),
        });
        self.subscribers.push(Arc::downgrade(&queue));
        Subscription { queue }
    }

    /// Deliver to every live subscriber, pruning dropped ones
    pub fn publish(&mut self, update: &BucketUpdate) {
        self.subscribers.retain(|weak| match weak.upgrade() {
            Some(queue) => {
                queue.push(update.clone());
                true
            }
            None => false,
        });
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.iter().filter(|w| w.strong_count() > 0).count()
    }
}
