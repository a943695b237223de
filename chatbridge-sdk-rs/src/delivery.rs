use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use tokio::sync::mpsc::{self, error::TrySendError};
use tracing::debug;

/// Per-session outbound queue size used when none is configured.
pub const DEFAULT_CHANNEL_CAPACITY: usize = 100;

/// Bounded, non-blocking outbound queue from a session to its transport.
///
/// `try_send` never waits: when the queue is full the item is dropped and the
/// drop counter is incremented. Items are delivered strictly FIFO.
pub struct DeliveryChannel<T> {
    tx: mpsc::Sender<T>,
    dropped: Arc<AtomicU64>,
    closed: Arc<AtomicBool>,
    capacity: usize,
}

impl<T> Clone for DeliveryChannel<T> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
            dropped: Arc::clone(&self.dropped),
            closed: Arc::clone(&self.closed),
            capacity: self.capacity,
        }
    }
}

/// Creates a delivery channel and the receiving half the transport drains.
pub fn delivery_channel<T>(capacity: usize) -> (DeliveryChannel<T>, mpsc::Receiver<T>) {
    let capacity = capacity.max(1);
    let (tx, rx) = mpsc::channel(capacity);
    (
        DeliveryChannel {
            tx,
            dropped: Arc::new(AtomicU64::new(0)),
            closed: Arc::new(AtomicBool::new(false)),
            capacity,
        },
        rx,
    )
}

impl<T> DeliveryChannel<T> {
    /// Returns `true` if the item was queued.
    pub fn try_send(&self, item: T) -> bool {
        if self.closed.load(Ordering::Acquire) {
            return false;
        }
        match self.tx.try_send(item) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                false
            }
            Err(TrySendError::Closed(_)) => {
                debug!("delivery channel receiver is gone");
                false
            }
        }
    }

    /// Stops accepting items. Items already queued stay readable.
    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire) || self.tx.is_closed()
    }

    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}
