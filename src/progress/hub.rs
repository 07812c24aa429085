//! Progress broadcast hub
//!
//! Fans progress, notification and error events out to any number of
//! subscribers. Each subscriber owns a bounded queue; publishing never
//! blocks, and a subscriber whose queue is full or whose receiver is gone is
//! dropped. Intermediate samples are throttled per operation, while the first
//! and terminal samples of an operation are always delivered.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, warn};

use super::types::{BroadcastEvent, ProgressSample};

/// Default queue depth per subscriber
pub const DEFAULT_QUEUE_CAPACITY: usize = 256;

/// Minimum spacing between intermediate samples of one operation
pub const DEFAULT_THROTTLE: Duration = Duration::from_millis(100);

/// Subscriber handle returned by [`ProgressHub::subscribe`]
pub struct Subscription {
    id: u64,
    receiver: mpsc::Receiver<BroadcastEvent>,
    cancel_tx: broadcast::Sender<String>,
}

impl Subscription {
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Next event; `None` once the hub has dropped this subscriber.
    pub async fn recv(&mut self) -> Option<BroadcastEvent> {
        self.receiver.recv().await
    }

    /// Non-blocking variant of [`Subscription::recv`]
    pub fn try_recv(&mut self) -> Option<BroadcastEvent> {
        self.receiver.try_recv().ok()
    }

    /// Forward a cancel intent for an operation to whoever runs it.
    pub fn request_cancel(&self, operation_id: &str) {
        debug!("Subscriber {} requested cancel of {}", self.id, operation_id);
        // No listener just means no operation manager is attached
        let _ = self.cancel_tx.send(operation_id.to_string());
    }
}

pub struct ProgressHub {
    subscribers: Mutex<HashMap<u64, mpsc::Sender<BroadcastEvent>>>,
    next_id: AtomicU64,
    queue_capacity: usize,
    throttle: Duration,
    /// Last delivery instant of each running operation
    last_delivery: Mutex<HashMap<String, Instant>>,
    cancel_tx: broadcast::Sender<String>,
}

impl Default for ProgressHub {
    fn default() -> Self {
        Self::new()
    }
}

impl ProgressHub {
    pub fn new() -> Self {
        Self::with_settings(DEFAULT_QUEUE_CAPACITY, DEFAULT_THROTTLE)
    }

    pub fn with_settings(queue_capacity: usize, throttle: Duration) -> Self {
        let (cancel_tx, _) = broadcast::channel(64);
        Self {
            subscribers: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            queue_capacity: queue_capacity.max(1),
            throttle,
            last_delivery: Mutex::new(HashMap::new()),
            cancel_tx,
        }
    }

    /// Register a new subscriber.
    pub fn subscribe(&self) -> Subscription {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = mpsc::channel(self.queue_capacity);
        self.subscribers.lock().insert(id, tx);
        debug!("Progress subscriber {} attached", id);
        Subscription {
            id,
            receiver: rx,
            cancel_tx: self.cancel_tx.clone(),
        }
    }

    pub fn unsubscribe(&self, id: u64) {
        if self.subscribers.lock().remove(&id).is_some() {
            debug!("Progress subscriber {} detached", id);
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.lock().len()
    }

    /// Stream of operation ids subscribers asked to cancel.
    pub fn cancel_requests(&self) -> broadcast::Receiver<String> {
        self.cancel_tx.subscribe()
    }

    /// Publish a sample, subject to per-operation throttling.
    /// Returns whether it was delivered.
    pub fn publish(&self, sample: &ProgressSample) -> bool {
        {
            let mut last = self.last_delivery.lock();
            if sample.status.is_terminal() {
                last.remove(&sample.operation_id);
            } else {
                let now = Instant::now();
                match last.get(&sample.operation_id) {
                    Some(at) if now.duration_since(*at) < self.throttle => return false,
                    _ => {
                        last.insert(sample.operation_id.clone(), now);
                    }
                }
            }
        }

        self.broadcast(BroadcastEvent::progress(sample));
        true
    }

    pub fn notify(&self, operation_id: Option<&str>, message: impl Into<String>) {
        self.broadcast(BroadcastEvent::notification(operation_id, message));
    }

    pub fn error(&self, operation_id: Option<&str>, message: impl Into<String>) {
        self.broadcast(BroadcastEvent::error(operation_id, message));
    }

    /// Deliver an event to every subscriber without blocking.
    pub fn broadcast(&self, event: BroadcastEvent) {
        let mut subscribers = self.subscribers.lock();
        subscribers.retain(|id, tx| match tx.try_send(event.clone()) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                warn!("Progress subscriber {} is not keeping up, dropping it", id);
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                debug!("Progress subscriber {} went away", id);
                false
            }
        });
    }
}
