// =============================================================================
// Fan-Out Hub — publish/subscribe broadcaster with per-subscriber queues
// =============================================================================
//
// Delivers each published event to every matching subscription in
// registration order, at most once per subscriber. Every subscriber is served
// through its own bounded outbound queue; when that queue is full the oldest
// queued event for that subscriber is dropped — the publisher never blocks, so
// a slow consumer cannot stall delivery to the others.
//
// Unsubscribe is effective immediately: the queue is closed and cleared, and
// nothing further is delivered even if events were already queued.
// =============================================================================

use std::collections::VecDeque;
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use tokio::sync::Notify;
use tracing::{debug, info};
use uuid::Uuid;

use crate::types::StreamEvent;

// =============================================================================
// Subscriber queue
// =============================================================================

struct QueueState {
    items: VecDeque<StreamEvent>,
    closed: bool,
    dropped: u64,
}

/// Bounded single-consumer queue between the hub and one subscriber.
struct SubscriberQueue {
    state: Mutex<QueueState>,
    notify: Notify,
    capacity: usize,
}

impl SubscriberQueue {
    fn new(capacity: usize) -> Self {
        Self {
            state: Mutex::new(QueueState {
                items: VecDeque::with_capacity(capacity),
                closed: false,
                dropped: 0,
            }),
            notify: Notify::new(),
            capacity,
        }
    }

    /// Enqueue, evicting the oldest queued event when full. No-op when closed.
    fn push(&self, event: StreamEvent) {
        {
            let mut state = self.state.lock();
            if state.closed {
                return;
            }
            if state.items.len() == self.capacity {
                state.items.pop_front();
                state.dropped += 1;
                debug!(dropped = state.dropped, "subscriber queue full — oldest event dropped");
            }
            state.items.push_back(event);
        }
        self.notify.notify_one();
    }

    async fn recv(&self) -> Option<StreamEvent> {
        loop {
            {
                let mut state = self.state.lock();
                // Closed wins over queued items: unsubscribed consumers never
                // see already-queued events.
                if state.closed {
                    return None;
                }
                if let Some(event) = state.items.pop_front() {
                    return Some(event);
                }
            }
            self.notify.notified().await;
        }
    }

    fn close(&self) {
        {
            let mut state = self.state.lock();
            state.closed = true;
            state.items.clear();
        }
        self.notify.notify_one();
    }

    fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    fn dropped(&self) -> u64 {
        self.state.lock().dropped
    }
}

// =============================================================================
// Subscription
// =============================================================================

/// One live consumer's end of the hub. Dropping it unsubscribes.
pub struct Subscription {
    id: Uuid,
    queue: Arc<SubscriberQueue>,
}

impl Subscription {
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Next event, or `None` once unsubscribed.
    pub async fn recv(&mut self) -> Option<StreamEvent> {
        self.queue.recv().await
    }

    /// Events dropped for this subscriber due to queue overflow.
    pub fn dropped(&self) -> u64 {
        self.queue.dropped()
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.queue.close();
    }
}

// =============================================================================
// FanOutHub
// =============================================================================

struct SubscriberEntry {
    id: Uuid,
    /// `Some` restricts delivery to one instrument; control events always
    /// pass.
    filter: Option<String>,
    queue: Arc<SubscriberQueue>,
}

pub struct FanOutHub {
    /// Registration order is delivery order.
    subscribers: RwLock<Vec<SubscriberEntry>>,
    queue_capacity: usize,
}

impl FanOutHub {
    pub fn new(queue_capacity: usize) -> Self {
        Self {
            subscribers: RwLock::new(Vec::new()),
            queue_capacity,
        }
    }

    /// Register a consumer, optionally filtered to a single instrument.
    pub fn subscribe(&self, filter: Option<String>) -> Subscription {
        let id = Uuid::new_v4();
        let queue = Arc::new(SubscriberQueue::new(self.queue_capacity));
        self.subscribers.write().push(SubscriberEntry {
            id,
            filter: filter.clone(),
            queue: queue.clone(),
        });
        info!(id = %id, filter = ?filter, "subscriber registered");
        Subscription { id, queue }
    }

    /// Remove a consumer. Effective immediately — already-queued events are
    /// discarded. Returns false for unknown ids.
    pub fn unsubscribe(&self, id: Uuid) -> bool {
        let mut subs = self.subscribers.write();
        let before = subs.len();
        subs.retain(|entry| {
            if entry.id == id {
                entry.queue.close();
                false
            } else {
                true
            }
        });
        let removed = subs.len() < before;
        if removed {
            info!(id = %id, "subscriber removed");
        }
        removed
    }

    /// Deliver an event to every matching subscriber. Never blocks.
    pub fn publish(&self, event: &StreamEvent) {
        let mut subs = self.subscribers.write();
        // Prune consumers that went away by dropping their Subscription.
        subs.retain(|entry| !entry.queue.is_closed());

        for entry in subs.iter() {
            let matches = match (event.instrument(), entry.filter.as_deref()) {
                (Some(instrument), Some(filter)) => instrument == filter,
                _ => true,
            };
            if matches {
                entry.queue.push(event.clone());
            }
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.read().len()
    }
}

// =============================================================================
// Tests
// =============================================================================
