//! Bounded multi-producer multi-consumer queue with async waits.

use crossbeam_queue::ArrayQueue;
use tokio::sync::Notify;

/// Lock-free bounded FIFO. Producers and consumers can either try without
/// blocking or wait for room / items.
pub(crate) struct WorkQueue<T> {
    items: ArrayQueue<T>,
    not_empty: Notify,
    not_full: Notify,
}

impl<T> WorkQueue<T> {
    pub(crate) fn new(capacity: usize) -> Self {
        Self {
            items: ArrayQueue::new(capacity.max(1)),
            not_empty: Notify::new(),
            not_full: Notify::new(),
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.items.len()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub(crate) fn is_full(&self) -> bool {
        self.items.is_full()
    }

    /// Hands the item back when the queue is full.
    pub(crate) fn try_push(&self, item: T) -> Result<(), T> {
        self.items.push(item)?;
        self.not_empty.notify_one();
        Ok(())
    }

    pub(crate) fn try_pop(&self) -> Option<T> {
        let item = self.items.pop()?;
        self.not_full.notify_one();
        Some(item)
    }

    /// Waits for room, then pushes. Cancel safe: a dropped future drops its
    /// item without enqueueing it.
    pub(crate) async fn push(&self, mut item: T) {
        loop {
            let notified = self.not_full.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            match self.try_push(item) {
                Ok(()) => return,
                Err(back) => item = back,
            }
            notified.await;
        }
    }

    /// Waits for an item.
    pub(crate) async fn pop(&self) -> T {
        loop {
            let notified = self.not_empty.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if let Some(item) = self.try_pop() {
                return item;
            }
            notified.await;
        }
    }

    /// Waits until at least one slot is free.
    pub(crate) async fn wait_not_full(&self) {
        loop {
            let notified = self.not_full.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if !self.is_full() {
                return;
            }
            notified.await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    #[tokio::test]
    async fn pop_waits_for_push() {
        let queue = Arc::new(WorkQueue::new(2));
        let consumer = {
            let queue = Arc::clone(&queue);
            tokio::spawn(async move { queue.pop().await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        queue.try_push(7).unwrap();
        assert_eq!(consumer.await.unwrap(), 7);
    }

    #[tokio::test]
    async fn push_waits_for_room() {
        let queue = Arc::new(WorkQueue::new(1));
        queue.try_push(1).unwrap();
        assert_eq!(queue.try_push(2), Err(2));
        let producer = {
            let queue = Arc::clone(&queue);
            tokio::spawn(async move { queue.push(2).await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(!producer.is_finished());
        assert_eq!(queue.try_pop(), Some(1));
        producer.await.unwrap();
        assert_eq!(queue.try_pop(), Some(2));
    }

    #[test]
    fn fifo_order() {
        let queue = WorkQueue::new(4);
        for i in 0..4 {
            queue.try_push(i).unwrap();
        }
        assert!(queue.is_full());
        let drained: Vec<_> = std::iter::from_fn(|| queue.try_pop()).collect();
        assert_eq!(drained, [0, 1, 2, 3]);
    }
}
