// In-process fan-out of committed state changes to every live push channel.
// Each subscriber gets its own bounded queue; a subscriber that cannot take
// an event (closed or full) is removed on the spot so nobody still registered
// ever misses one.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::time::Instant;
use tracing::{debug, warn};

use super::protocol::PushEvent;
use crate::error::SyncError;

pub type SubscriberId = u64;

struct Subscriber {
    tx: mpsc::Sender<Arc<PushEvent>>,
    since: Instant,
}

/// Outcome of one [`BroadcastHub::publish`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DeliveryReport {
    pub delivered: usize,
    pub dropped: usize,
}

pub struct BroadcastHub {
    subscribers: Mutex<HashMap<SubscriberId, Subscriber>>,
    next_id: AtomicU64,
    buffer: usize,
}

impl BroadcastHub {
    pub fn new(buffer: usize) -> Arc<Self> {
        Arc::new(Self {
            subscribers: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            buffer: buffer.max(1),
        })
    }

    /// Register a new live channel
    pub fn subscribe(self: &Arc<Self>) -> Subscription {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::channel(self.buffer);

        let total = {
            let mut subscribers = self.subscribers.lock();
            subscribers.insert(
                id,
                Subscriber {
                    tx,
                    since: Instant::now(),
                },
            );
            subscribers.len()
        };
        debug!(subscriber = id, total, "Subscriber registered");

        Subscription {
            id,
            rx,
            hub: Arc::downgrade(self),
        }
    }

    /// Remove a subscriber; returns false if it was already gone
    pub fn unsubscribe(&self, id: SubscriberId) -> bool {
        let removed = self.subscribers.lock().remove(&id);
        if let Some(subscriber) = &removed {
            debug!(
                subscriber = id,
                connected_for = ?subscriber.since.elapsed(),
                "Subscriber removed"
            );
        }
        removed.is_some()
    }

    /// Hand `event` to every registered subscriber
    ///
    /// A failed hand-off removes that subscriber and moves on to the rest.
    pub fn publish(&self, event: PushEvent) -> DeliveryReport {
        let event = Arc::new(event);
        let mut report = DeliveryReport::default();
        let mut subscribers = self.subscribers.lock();

        subscribers.retain(|id, subscriber| match deliver(*id, subscriber, &event) {
            Ok(()) => {
                report.delivered += 1;
                true
            }
            Err(err) => {
                warn!(category = ?err.category(), "{err}");
                report.dropped += 1;
                false
            }
        });

        debug!(
            delivered = report.delivered,
            dropped = report.dropped,
            "Published push event"
        );
        report
    }

    /// Drop every subscriber, closing their channels
    pub fn close_all(&self) -> usize {
        let mut subscribers = self.subscribers.lock();
        let count = subscribers.len();
        subscribers.clear();
        count
    }

    pub fn len(&self) -> usize {
        self.subscribers.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn deliver(
    id: SubscriberId,
    subscriber: &Subscriber,
    event: &Arc<PushEvent>,
) -> Result<(), SyncError> {
    match subscriber.tx.try_send(event.clone()) {
        Ok(()) => Ok(()),
        Err(TrySendError::Full(_)) | Err(TrySendError::Closed(_)) => Err(SyncError::Delivery(id)),
    }
}

/// Receiving end of one registration; unsubscribes itself on drop
pub struct Subscription {
    id: SubscriberId,
    rx: mpsc::Receiver<Arc<PushEvent>>,
    hub: Weak<BroadcastHub>,
}

impl Subscription {
    pub fn id(&self) -> SubscriberId {
        self.id
    }

    /// Next event, or `None` once the hub has dropped this subscriber
    pub async fn recv(&mut self) -> Option<Arc<PushEvent>> {
        self.rx.recv().await
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(hub) = self.hub.upgrade() {
            hub.unsubscribe(self.id);
        }
    }
}
