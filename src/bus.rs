//! Internal notification bus.
//!
//! Observers (tests, instrumentation) subscribe to a wildcard channel of
//! named notifications. The bus is closed when shutdown resolves; nothing
//! fires afterwards.

use std::sync::atomic::{AtomicBool, Ordering};

use tokio::sync::broadcast;

/// Outcome summary attached to a flush notification, one per finalized
/// batch delivery.
#[derive(Clone, Debug)]
pub struct FlushSummary {
    /// Envelopes in the batch.
    pub batch_size: usize,
    /// Envelopes the server accepted.
    pub delivered: usize,
    /// Envelopes that failed permanently.
    pub failed: usize,
}

#[derive(Clone, Debug)]
pub enum Notification {
    /// A batch delivery was finalized (success, partial, or exhausted).
    Flush(FlushSummary),
    /// The client completed shutdown. Always the last notification.
    Shutdown,
}

impl Notification {
    pub fn name(&self) -> &'static str {
        match self {
            Notification::Flush(_) => "flush",
            Notification::Shutdown => "shutdown",
        }
    }
}

pub struct NotificationBus {
    tx: broadcast::Sender<Notification>,
    closed: AtomicBool,
}

impl NotificationBus {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(256);
        Self {
            tx,
            closed: AtomicBool::new(false),
        }
    }

    /// Subscribe to every notification (the wildcard channel). Callers
    /// filter by [`Notification::name`] or by matching the variant.
    pub fn subscribe(&self) -> broadcast::Receiver<Notification> {
        self.tx.subscribe()
    }

    pub(crate) fn emit(&self, notification: Notification) {
        if self.closed.load(Ordering::SeqCst) {
            return;
        }
        // Send fails when there are no subscribers; that is fine.
        let _ = self.tx.send(notification);
    }

    pub(crate) fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

impl Default for NotificationBus {
    fn default() -> Self {
        Self::new()
    }
}
