use std::collections::BinaryHeap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard};

use serde_json::Value;
use tokio::sync::futures::Notified;
use tokio::sync::{oneshot, Notify};
use tokio::time::Instant;

use crate::client::rpc::{CallResponse, ResolvedOptions};

/// A call parked because its window was full.
///
/// The reply channel reaches back to the caller awaiting inside
/// `call`. If the caller has given up, the send fails and the response
/// is dropped; the window slot it consumed is not returned.
pub(crate) struct QueuedRequest {
    pub(crate) name: String,
    pub(crate) args: Value,
    pub(crate) options: ResolvedOptions,
    pub(crate) reply: oneshot::Sender<CallResponse>,
    pub(crate) enqueued_at: Instant,
    seq: u64,
}

impl PartialEq for QueuedRequest {
    fn eq(&self, other: &Self) -> bool {
        self.options.priority == other.options.priority && self.seq == other.seq
    }
}

impl Eq for QueuedRequest {}

impl PartialOrd for QueuedRequest {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for QueuedRequest {
    // Max-heap order: higher priority first, then earlier arrival.
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.options
            .priority
            .cmp(&other.options.priority)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

/// Overflow queue for rate-limited calls, drained by a single task.
pub(crate) struct PendingQueue {
    heap: Mutex<BinaryHeap<QueuedRequest>>,
    seq: AtomicU64,
    notify: Notify,
}

impl PendingQueue {
    pub(crate) fn new() -> Self {
        Self {
            heap: Mutex::new(BinaryHeap::new()),
            seq: AtomicU64::new(0),
            notify: Notify::new(),
        }
    }

    /// Parks a request and wakes the drain task. Returns the queue
    /// depth after the push.
    pub(crate) fn push(
        &self,
        name: String,
        args: Value,
        options: ResolvedOptions,
        reply: oneshot::Sender<CallResponse>,
    ) -> usize {
        let request = QueuedRequest {
            name,
            args,
            options,
            reply,
            enqueued_at: Instant::now(),
            seq: self.seq.fetch_add(1, Ordering::SeqCst),
        };
        let depth = {
            let mut heap = self.lock();
            heap.push(request);
            heap.len()
        };
        self.notify.notify_one();
        depth
    }

    /// Takes the highest-priority request, oldest first within a
    /// priority.
    pub(crate) fn pop(&self) -> Option<QueuedRequest> {
        self.lock().pop()
    }

    pub(crate) fn len(&self) -> usize {
        self.lock().len()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Future that resolves once a push (or a [`wake`](Self::wake))
    /// has happened. A permit is stored if nobody is waiting, so a
    /// push between `pop` returning `None` and this await cannot be
    /// lost.
    pub(crate) fn notified(&self) -> Notified<'_> {
        self.notify.notified()
    }

    pub(crate) fn wake(&self) {
        self.notify.notify_one();
    }

    fn lock(&self) -> MutexGuard<'_, BinaryHeap<QueuedRequest>> {
        self.heap
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn push(queue: &PendingQueue, name: &str, priority: i32) {
        let (tx, _rx) = oneshot::channel();
        let options = ResolvedOptions {
            priority,
            ..ResolvedOptions::default()
        };
        queue.push(name.to_string(), json!({}), options, tx);
    }

    fn drain_names(queue: &PendingQueue) -> Vec<String> {
        let mut names = Vec::new();
        while let Some(request) = queue.pop() {
            names.push(request.name);
        }
        names
    }

    #[test]
    fn test_pop_orders_by_priority_desc() {
        let queue = PendingQueue::new();
        push(&queue, "low", 1);
        push(&queue, "high", 10);
        push(&queue, "mid", 5);

        assert_eq!(drain_names(&queue), vec!["high", "mid", "low"]);
    }

    #[test]
    fn test_equal_priority_is_fifo() {
        let queue = PendingQueue::new();
        push(&queue, "first", 0);
        push(&queue, "second", 0);
        push(&queue, "third", 0);

        assert_eq!(drain_names(&queue), vec!["first", "second", "third"]);
    }

    #[test]
    fn test_len_tracks_pushes_and_pops() {
        let queue = PendingQueue::new();
        assert_eq!(queue.len(), 0);
        push(&queue, "a", 0);
        push(&queue, "b", 0);
        assert_eq!(queue.len(), 2);
        queue.pop();
        assert_eq!(queue.len(), 1);
    }

    #[test]
    fn test_pop_empty_returns_none() {
        let queue = PendingQueue::new();
        assert!(queue.pop().is_none());
    }

    #[tokio::test]
    async fn test_push_wakes_a_parked_waiter() {
        let queue = std::sync::Arc::new(PendingQueue::new());
        let waiter = {
            let queue = queue.clone();
            tokio::spawn(async move {
                queue.notified().await;
                queue.pop().map(|request| request.name)
            })
        };
        // Let the waiter park before pushing.
        tokio::task::yield_now().await;
        push(&queue, "wakeup", 0);

        let name = waiter.await.unwrap();
        assert_eq!(name, Some("wakeup".to_string()));
    }

    #[tokio::test]
    async fn test_permit_is_stored_when_nobody_waits() {
        let queue = PendingQueue::new();
        push(&queue, "early", 0);
        // The push happened before anyone awaited; the stored permit
        // must complete this immediately.
        queue.notified().await;
        assert_eq!(queue.len(), 1);
    }
}
