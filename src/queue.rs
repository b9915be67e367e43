//! FIFO event queue with drain-as-removal semantics.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use tracing::warn;

use crate::event::EventEnvelope;
use crate::storage::{PersistedProperty, PropertyStore};

/// Ordered in-memory queue of pending envelopes.
///
/// Insertion order is the only ordering guarantee. Draining removes
/// envelopes, so concurrently triggered flushes always operate on disjoint
/// queue contents. Every mutation writes the queue back to the property
/// store when a durable backend is configured.
pub(crate) struct EventQueue {
    inner: Mutex<VecDeque<EventEnvelope>>,
    store: Arc<dyn PropertyStore>,
}

impl EventQueue {
    pub fn new(store: Arc<dyn PropertyStore>) -> Self {
        Self {
            inner: Mutex::new(VecDeque::new()),
            store,
        }
    }

    /// Append an envelope, returning the new queue length.
    pub fn enqueue(&self, envelope: EventEnvelope) -> usize {
        let len = {
            let mut queue = self.inner.lock().unwrap_or_else(|e| e.into_inner());
            queue.push_back(envelope);
            queue.len()
        };
        self.persist();
        len
    }

    /// Remove and return the oldest `min(max_count, len)` envelopes.
    pub fn drain(&self, max_count: usize) -> Vec<EventEnvelope> {
        let batch: Vec<EventEnvelope> = {
            let mut queue = self.inner.lock().unwrap_or_else(|e| e.into_inner());
            let take = max_count.min(queue.len());
            queue.drain(..take).collect()
        };
        if !batch.is_empty() {
            self.persist();
        }
        batch
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Reload envelopes persisted by a prior client life and merge them at
    /// the front, oldest-first, so FIFO order is preserved.
    pub fn restore(&self) {
        if !self.store.is_durable() {
            return;
        }
        let Some(raw) = self.store.get_item(PersistedProperty::Queue) else {
            return;
        };
        let restored: Vec<EventEnvelope> = match serde_json::from_str(&raw) {
            Ok(envelopes) => envelopes,
            Err(e) => {
                warn!(error = %e, "Discarding unreadable persisted queue");
                return;
            }
        };
        if restored.is_empty() {
            return;
        }
        {
            let mut queue = self.inner.lock().unwrap_or_else(|e| e.into_inner());
            for envelope in restored.into_iter().rev() {
                queue.push_front(envelope);
            }
        }
        self.persist();
    }

    fn persist(&self) {
        if !self.store.is_durable() {
            return;
        }
        let serialized = {
            let queue = self.inner.lock().unwrap_or_else(|e| e.into_inner());
            serde_json::to_string(&queue.iter().collect::<Vec<_>>())
        };
        match serialized {
            Ok(json) => self.store.set_item(PersistedProperty::Queue, json),
            Err(e) => warn!(error = %e, "Failed to persist event queue"),
        }
    }
}
