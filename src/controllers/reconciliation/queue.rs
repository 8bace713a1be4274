use std::sync::{Mutex, MutexGuard, PoisonError};

use tokio::sync::mpsc::{self, error::TrySendError};
use tracing::{debug, warn};

use super::ReconcileWork;
use crate::{Error, Result};

/// Retry queue length past which every overflow is reported
pub const RETRY_HIGH_WATER: usize = 1000;

#[derive(Default)]
struct Overflow {
    retry: Vec<ReconcileWork>,
    dropped: u64,
}

/// Bounded work channel with an unbounded overflow list.
///
/// Admission never blocks. Work the channel cannot take is parked in the
/// retry list and moved back by [`WorkQueue::drain_retry`].
pub(super) struct WorkQueue {
    capacity: usize,
    tx: mpsc::Sender<ReconcileWork>,
    rx: tokio::sync::Mutex<mpsc::Receiver<ReconcileWork>>,
    overflow: Mutex<Overflow>,
}

impl WorkQueue {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        let (tx, rx) = mpsc::channel(capacity);
        WorkQueue {
            capacity,
            tx,
            rx: tokio::sync::Mutex::new(rx),
            overflow: Mutex::new(Overflow::default()),
        }
    }

    fn overflow(&self) -> MutexGuard<'_, Overflow> {
        self.overflow.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Offers `work` to the channel, parking it in the retry list when full.
    ///
    /// Parked work is still owned by the queue; the error only tells the
    /// caller that it was deferred.
    pub fn admit(&self, work: ReconcileWork) -> Result<()> {
        let work = match self.tx.try_send(work) {
            Ok(()) => return Ok(()),
            Err(TrySendError::Full(work) | TrySendError::Closed(work)) => work,
        };

        let deployment_id = work.deployment_id;
        let (retry_len, dropped) = {
            let mut overflow = self.overflow();
            overflow.retry.push(work);
            overflow.dropped += 1;
            (overflow.retry.len(), overflow.dropped)
        };

        warn!(
            deployment_id = %deployment_id,
            retry_queue_size = retry_len,
            dropped_total = dropped,
            "Work queue full, added to retry queue"
        );
        if retry_len > RETRY_HIGH_WATER {
            warn!(
                retry_queue_size = retry_len,
                high_water = RETRY_HIGH_WATER,
                "Retry queue above high-water mark, workers are not keeping up"
            );
        }
        Err(Error::QueueFull)
    }

    /// Next item for a worker; `None` once the channel is closed.
    pub async fn next(&self) -> Option<ReconcileWork> {
        self.rx.lock().await.recv().await
    }

    pub fn len(&self) -> usize {
        self.capacity - self.tx.capacity()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn retry_len(&self) -> usize {
        self.overflow().retry.len()
    }

    pub fn dropped(&self) -> u64 {
        self.overflow().dropped
    }

    /// Moves parked work back into the channel, oldest first.
    ///
    /// Does nothing unless at least a fifth of the channel is free, and never
    /// moves more than the free slots. Returns how many items moved.
    pub fn drain_retry(&self) -> usize {
        let mut overflow = self.overflow();
        if overflow.retry.is_empty() {
            return 0;
        }

        let free = self.capacity - self.len();
        if free < self.capacity / 5 {
            debug!(free, capacity = self.capacity, "Work queue too busy to drain retries");
            return 0;
        }

        let to_move = free.min(overflow.retry.len());
        let mut moved = 0;
        let mut batch = overflow.retry.drain(..to_move).collect::<Vec<_>>().into_iter();
        let mut rejected = Vec::new();
        for work in batch.by_ref() {
            match self.tx.try_send(work) {
                Ok(()) => moved += 1,
                Err(TrySendError::Full(work) | TrySendError::Closed(work)) => {
                    rejected.push(work);
                    break;
                }
            }
        }
        rejected.extend(batch);
        if !rejected.is_empty() {
            overflow.retry.splice(0..0, rejected);
        }
        moved
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;
    use uuid::Uuid;

    use super::*;

    fn work() -> ReconcileWork {
        ReconcileWork {
            deployment_id: Uuid::new_v4(),
            priority: 0,
            attempt: 1,
            scheduled_at: Utc::now(),
        }
    }

    #[test]
    fn overflow_is_parked_not_lost() {
        let queue = WorkQueue::new(10);
        for _ in 0..10 {
            queue.admit(work()).unwrap();
        }
        assert!(matches!(queue.admit(work()), Err(Error::QueueFull)));
        assert!(matches!(queue.admit(work()), Err(Error::QueueFull)));

        assert_eq!(queue.len(), 10);
        assert_eq!(queue.retry_len(), 2);
        assert_eq!(queue.dropped(), 2);
    }

    #[tokio::test]
    async fn drain_waits_for_a_fifth_of_capacity() {
        let queue = WorkQueue::new(10);
        for _ in 0..13 {
            let _ = queue.admit(work());
        }
        assert_eq!(queue.drain_retry(), 0);

        // one free slot is below the threshold
        queue.next().await.unwrap();
        assert_eq!(queue.drain_retry(), 0);
        assert_eq!(queue.retry_len(), 3);

        queue.next().await.unwrap();
        assert_eq!(queue.drain_retry(), 2);
        assert_eq!(queue.retry_len(), 1);
        assert_eq!(queue.len(), 10);
        assert_eq!(queue.dropped(), 3);
    }

    #[tokio::test]
    async fn drain_keeps_order() {
        let queue = WorkQueue::new(5);
        let items: Vec<ReconcileWork> = (0..7).map(|_| work()).collect();
        for item in &items {
            let _ = queue.admit(item.clone());
        }
        for _ in 0..5 {
            queue.next().await.unwrap();
        }
        assert_eq!(queue.drain_retry(), 2);
        assert_eq!(queue.next().await.unwrap().deployment_id, items[5].deployment_id);
        assert_eq!(queue.next().await.unwrap().deployment_id, items[6].deployment_id);
    }
}
