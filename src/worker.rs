//! Flush scheduling and the shared pipeline state.
//!
//! One background task per client drives timer-based flushes; enqueue-side
//! threshold triggers and explicit flush calls wake it early. Flush cycles
//! are serialized by a mutex so overlapping triggers never drain the same
//! envelopes twice; drain-as-removal keeps concurrent cycles on disjoint
//! queue contents even then.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tokio::sync::{Mutex, Notify};
use tracing::debug;

use crate::bus::NotificationBus;
use crate::config::ClientConfig;
use crate::queue::EventQueue;
use crate::sender::BatchSender;
use crate::Result;

pub(crate) struct Pipeline {
    pub config: ClientConfig,
    pub queue: EventQueue,
    pub bus: NotificationBus,
    sender: BatchSender,
    flush_lock: Mutex<()>,
    flush_signal: Notify,
    shutdown: AtomicBool,
}

impl Pipeline {
    pub fn new(
        config: ClientConfig,
        queue: EventQueue,
        sender: BatchSender,
        bus: NotificationBus,
    ) -> Self {
        Self {
            config,
            queue,
            bus,
            sender,
            flush_lock: Mutex::new(()),
            flush_signal: Notify::new(),
            shutdown: AtomicBool::new(false),
        }
    }

    /// Wake the background task for an immediate flush. Fire-and-forget.
    pub fn trigger_flush(&self) {
        self.flush_signal.notify_one();
    }

    pub fn is_shut_down(&self) -> bool {
        self.shutdown.load(Ordering::SeqCst)
    }

    /// Flip the shutdown flag. Returns false when it was already set.
    pub fn begin_shutdown(&self) -> bool {
        !self.shutdown.swap(true, Ordering::SeqCst)
    }

    /// Drain-and-send until the queue is empty.
    ///
    /// Holds the flush lock for the whole cycle, so a second caller joins
    /// behind the in-flight one rather than racing it. Returns the last
    /// terminal delivery error, if any; per-envelope completions and the
    /// one-per-batch error log have already happened by then.
    pub async fn flush_cycle(&self) -> Result<()> {
        let _guard = self.flush_lock.lock().await;

        let mut last_error = None;
        loop {
            let batch = self.queue.drain(self.config.flush_at);
            if batch.is_empty() {
                break;
            }
            if self.config.debug {
                debug!(batch_size = batch.len(), "Flushing event batch");
            }
            if let Err(e) = self.sender.deliver(batch, &self.bus).await {
                last_error = Some(e);
            }
        }

        match last_error {
            None => Ok(()),
            Some(e) => Err(e),
        }
    }

    /// Background loop: flush every `flush_interval`, or sooner when the
    /// enqueue path signals that `flush_at` was reached. Exits on shutdown;
    /// the final drain is performed by the shutdown caller after joining.
    pub async fn run(self: Arc<Self>) {
        let mut ticker = tokio::time::interval(self.config.flush_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        // Consume the immediate first tick.
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if self.is_shut_down() {
                        break;
                    }
                    let _ = self.flush_cycle().await;
                }
                _ = self.flush_signal.notified() => {
                    if self.is_shut_down() {
                        break;
                    }
                    let _ = self.flush_cycle().await;
                }
            }
        }

        debug!("Flush worker stopped");
    }
}
