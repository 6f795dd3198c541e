//! Process-local event bus
//!
//! Multi-subscriber publish channel for façade integration. Delivery is
//! best-effort: each subscriber owns a bounded ring and the oldest event
//! is dropped on overflow, so a stalled subscriber never blocks sync.

use std::collections::VecDeque;
use std::sync::{Arc, Condvar, Mutex, Weak};
use std::time::Duration;

use crate::sync::SyncStats;

/// Per-subscriber buffer capacity
const SUBSCRIBER_BUFFER: usize = 256;

#[derive(Debug, Clone)]
pub enum Event {
    SyncStarted {
        account_id: String,
    },
    SyncCompleted {
        account_id: String,
        stats: SyncStats,
    },
    MessageClassified {
        message_id: i64,
    },
    PendingFailed {
        operation_id: i64,
        error: String,
    },
    AccountError {
        account_id: String,
        error: String,
    },
}

struct Shared {
    queue: Mutex<VecDeque<Event>>,
    available: Condvar,
    capacity: usize,
}

/// Publish side; clone-free, share behind `Arc`
#[derive(Default)]
pub struct EventBus {
    subscribers: Mutex<Vec<Weak<Shared>>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a subscriber with a bounded buffer
    pub fn subscribe(&self) -> EventReceiver {
        self.subscribe_with_capacity(SUBSCRIBER_BUFFER)
    }

    pub fn subscribe_with_capacity(&self, capacity: usize) -> EventReceiver {
        let shared = Arc::new(Shared {
            queue: Mutex::new(VecDeque::new()),
            available: Condvar::new(),
            capacity: capacity.max(1),
        });
        self.subscribers.lock().unwrap().push(Arc::downgrade(&shared));
        EventReceiver { shared }
    }

    /// Deliver an event to every live subscriber, dropping the oldest
    /// buffered event when a ring is full
    pub fn publish(&self, event: Event) {
        let mut subscribers = self.subscribers.lock().unwrap();
        subscribers.retain(|weak| {
            let Some(shared) = weak.upgrade() else {
                return false;
            };
            let mut queue = shared.queue.lock().unwrap();
            if queue.len() >= shared.capacity {
                queue.pop_front();
            }
            queue.push_back(event.clone());
            shared.available.notify_one();
            true
        });
    }
}

/// Receive side handed to the façade; dropping it unsubscribes
pub struct EventReceiver {
    shared: Arc<Shared>,
}

impl EventReceiver {
    /// Next buffered event, if any
    pub fn try_recv(&self) -> Option<Event> {
        self.shared.queue.lock().unwrap().pop_front()
    }

    /// Block up to `timeout` for the next event
    pub fn recv_timeout(&self, timeout: Duration) -> Option<Event> {
        let mut queue = self.shared.queue.lock().unwrap();
        if let Some(event) = queue.pop_front() {
            return Some(event);
        }
        let (mut queue, result) = self
            .shared
            .available
            .wait_timeout(queue, timeout)
            .unwrap();
        if result.timed_out() && queue.is_empty() {
            return None;
        }
        queue.pop_front()
    }
}
