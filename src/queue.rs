//! # Bounded Queue
//!
//! FIFO queue of [`Message`]s with a hard capacity, a `working` flag, and
//! a graded back-pressure sleep applied to the caller after every
//! successful enqueue. Grounded on
//! `ActiveQueue::enqueue`/`congestionControl` in the original
//! implementation: the same four occupancy thresholds and sleep
//! durations are reproduced here.

use crate::message::Message;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::{Mutex, Notify};

/// Result of an `enqueue` attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnqueueOutcome {
    /// Accepted; carries the new queue length.
    Accepted(usize),
    /// Rejected because the queue is at capacity.
    Rejected,
}

/// Bounded FIFO of [`Message`]s. `capacity == 0` means unbounded.
pub struct BoundedQueue {
    capacity: usize,
    inner: Mutex<VecDeque<Message>>,
    working: AtomicBool,
    item_added: Notify,
}

impl BoundedQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            inner: Mutex::new(VecDeque::new()),
            working: AtomicBool::new(true),
            item_added: Notify::new(),
        }
    }

    /// Attempt to enqueue `message`. On success, applies the graded
    /// back-pressure sleep before returning so the caller (the publishing
    /// application task) is throttled proportionally to occupancy.
    pub async fn enqueue(&self, message: Message) -> EnqueueOutcome {
        let len = {
            let mut guard = self.inner.lock().await;
            if self.capacity != 0 && guard.len() >= self.capacity {
                return EnqueueOutcome::Rejected;
            }
            guard.push_back(message);
            guard.len()
        };
        self.item_added.notify_one();
        self.congestion_sleep(len).await;
        EnqueueOutcome::Accepted(len)
    }

    /// Dequeue the oldest message, if any.
    pub async fn dequeue(&self) -> Option<Message> {
        self.inner.lock().await.pop_front()
    }

    /// Dequeue the oldest message, waiting for one to arrive if the queue
    /// is currently empty. Used by the sender task's drain loop.
    pub async fn dequeue_wait(&self) -> Message {
        loop {
            if let Some(msg) = self.dequeue().await {
                return msg;
            }
            self.item_added.notified().await;
        }
    }

    pub async fn is_full(&self) -> bool {
        if self.capacity == 0 {
            return false;
        }
        self.inner.lock().await.len() >= self.capacity
    }

    pub async fn size(&self) -> usize {
        self.inner.lock().await.len()
    }

    pub fn set_working(&self, working: bool) {
        self.working.store(working, Ordering::SeqCst);
    }

    pub fn working(&self) -> bool {
        self.working.load(Ordering::SeqCst)
    }

    /// Graded back-pressure: <50% occupancy → no sleep, <60% → 1ms,
    /// <75% → 5ms, <90% → 10ms, ≥90% → 100ms. Unbounded queues never
    /// sleep.
    async fn congestion_sleep(&self, current_len: usize) {
        if self.capacity == 0 {
            return;
        }
        let pct = (current_len * 100) / self.capacity;
        let sleep_ms = if pct < 50 {
            0
        } else if pct < 60 {
            1
        } else if pct < 75 {
            5
        } else if pct < 90 {
            10
        } else {
            100
        };
        if sleep_ms > 0 {
            tokio::time::sleep(Duration::from_millis(sleep_ms)).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn rejects_when_full() {
        let queue = BoundedQueue::new(2);
        assert_eq!(
            queue.enqueue(Message::new("s")).await,
            EnqueueOutcome::Accepted(1)
        );
        assert_eq!(
            queue.enqueue(Message::new("s")).await,
            EnqueueOutcome::Accepted(2)
        );
        assert_eq!(queue.enqueue(Message::new("s")).await, EnqueueOutcome::Rejected);
        assert!(queue.is_full().await);
    }

    #[tokio::test]
    async fn unbounded_queue_never_rejects() {
        let queue = BoundedQueue::new(0);
        for _ in 0..1000 {
            assert!(matches!(
                queue.enqueue(Message::new("s")).await,
                EnqueueOutcome::Accepted(_)
            ));
        }
        assert!(!queue.is_full().await);
    }

    #[tokio::test]
    async fn fifo_order_preserved() {
        let queue = BoundedQueue::new(0);
        for i in 0..5 {
            queue.enqueue(Message::new(format!("s{i}"))).await;
        }
        for i in 0..5 {
            let msg = queue.dequeue().await.unwrap();
            assert_eq!(msg.service_id, format!("s{i}"));
        }
        assert!(queue.dequeue().await.is_none());
    }

    #[tokio::test]
    async fn working_flag_toggles() {
        let queue = BoundedQueue::new(1);
        assert!(queue.working());
        queue.set_working(false);
        assert!(!queue.working());
    }
}
