//! Bounded stage queues with a backpressure threshold.
//!
//! A queue holds at most `capacity` items. Producers suspend as soon as
//! occupancy reaches the high-water mark (`ceil(capacity * threshold)`) and
//! resume once a consumer takes an item and occupancy falls back below it.

use std::sync::Arc;

use tokio::sync::{mpsc, Notify};
use tracing::trace;

struct Shared {
    /// Signalled whenever an item leaves the queue or the receiver goes away
    drained: Notify,
    high_water: usize,
}

/// Producer half. Cheap to clone.
pub struct QueueSender<T> {
    tx: mpsc::Sender<T>,
    shared: Arc<Shared>,
}

/// Consumer half.
pub struct QueueReceiver<T> {
    rx: mpsc::Receiver<T>,
    shared: Arc<Shared>,
}

/// Create a stage queue.
///
/// `capacity` is clamped to at least 1 and `threshold` to (0, 1].
pub fn stage_queue<T>(capacity: usize, threshold: f64) -> (QueueSender<T>, QueueReceiver<T>) {
    let capacity = capacity.max(1);
    let threshold = if threshold.is_finite() && threshold > 0.0 {
        threshold.min(1.0)
    } else {
        1.0
    };
    let high_water = ((capacity as f64 * threshold).ceil() as usize).clamp(1, capacity);

    let (tx, rx) = mpsc::channel(capacity);
    let shared = Arc::new(Shared {
        drained: Notify::new(),
        high_water,
    });
    (
        QueueSender {
            tx,
            shared: shared.clone(),
        },
        QueueReceiver { rx, shared },
    )
}

impl<T> Clone for QueueSender<T> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
            shared: self.shared.clone(),
        }
    }
}

impl<T> QueueSender<T> {
    /// Items currently queued.
    pub fn occupancy(&self) -> usize {
        self.tx.max_capacity() - self.tx.capacity()
    }

    pub fn high_water(&self) -> usize {
        self.shared.high_water
    }

    /// Whether a producer would suspend right now.
    pub fn is_saturated(&self) -> bool {
        self.occupancy() >= self.shared.high_water
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }

    /// Submit an item, waiting while the queue is at or above its
    /// high-water mark. Returns the item if the consumer is gone.
    pub async fn send(&self, item: T) -> Result<(), T> {
        loop {
            // Register before checking so a drain between the check and the
            // await is not missed.
            let drained = self.shared.drained.notified();

            if self.tx.is_closed() || !self.is_saturated() {
                break;
            }
            trace!(occupancy = self.occupancy(), high_water = self.shared.high_water, "Queue saturated, waiting");
            drained.await;
        }
        self.tx.send(item).await.map_err(|e| e.0)
    }
}

impl<T> QueueReceiver<T> {
    /// Next item, or None once every sender is dropped and the queue is
    /// empty.
    pub async fn recv(&mut self) -> Option<T> {
        let item = self.rx.recv().await;
        if item.is_some() {
            self.shared.drained.notify_waiters();
        }
        item
    }

    pub fn try_recv(&mut self) -> Option<T> {
        let item = self.rx.try_recv().ok();
        if item.is_some() {
            self.shared.drained.notify_waiters();
        }
        item
    }

    /// Items currently queued.
    pub fn len(&self) -> usize {
        self.rx.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rx.is_empty()
    }

    /// Stop accepting items. Already queued items can still be received.
    pub fn close(&mut self) {
        self.rx.close();
        self.shared.drained.notify_waiters();
    }
}

impl<T> Drop for QueueReceiver<T> {
    fn drop(&mut self) {
        self.shared.drained.notify_waiters();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_test::{assert_pending, assert_ready, task};

    #[test]
    fn test_high_water_mark() {
        let (tx, _rx) = stage_queue::<u32>(10, 0.8);
        assert_eq!(tx.high_water(), 8);

        let (tx, _rx) = stage_queue::<u32>(3, 0.5);
        assert_eq!(tx.high_water(), 2);

        let (tx, _rx) = stage_queue::<u32>(0, 0.0);
        assert_eq!(tx.high_water(), 1);
    }

    #[tokio::test]
    async fn test_producer_suspends_at_threshold() {
        let (tx, mut rx) = stage_queue::<u32>(4, 0.5);
        tx.send(1).await.unwrap();
        tx.send(2).await.unwrap();
        assert!(tx.is_saturated());

        let mut blocked = task::spawn(tx.send(3));
        assert_pending!(blocked.poll());

        assert_eq!(rx.recv().await, Some(1));
        assert!(blocked.is_woken());
        assert_ready!(blocked.poll()).unwrap();
        assert_eq!(tx.occupancy(), 2);
    }

    #[tokio::test]
    async fn test_closed_receiver_releases_producer() {
        let (tx, rx) = stage_queue::<u32>(2, 0.5);
        tx.send(1).await.unwrap();

        let mut blocked = task::spawn(tx.send(2));
        assert_pending!(blocked.poll());

        drop(rx);
        assert!(blocked.is_woken());
        assert_eq!(assert_ready!(blocked.poll()), Err(2));
    }

    #[tokio::test]
    async fn test_occupancy_never_exceeds_capacity() {
        let (tx, mut rx) = stage_queue::<u32>(8, 0.75);
        let producer = tokio::spawn({
            let tx = tx.clone();
            async move {
                for i in 0..100 {
                    tx.send(i).await.unwrap();
                    assert!(tx.occupancy() <= 8);
                }
            }
        });
        drop(tx);

        let mut received = Vec::new();
        while let Some(i) = rx.recv().await {
            received.push(i);
        }
        producer.await.unwrap();
        assert_eq!(received, (0..100).collect::<Vec<_>>());
    }
}
