//! In-process delay queue for commands.
//!
//! Entries become runnable at their due instant and are handed out in due
//! order, ties broken by insertion order. Any number of workers may wait on
//! the same queue.

use std::cmp::{Ordering, Reverse};
use std::collections::BinaryHeap;
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tokio::sync::Notify;
use tokio::time::Instant;

use super::command::Command;

/// A command waiting in the queue
#[derive(Debug, Clone)]
pub struct QueuedCommand {
    pub command: Command,
    /// 1-based attempt number this entry will run as
    pub attempt: u32,
    due: Instant,
    seq: u64,
}

impl PartialEq for QueuedCommand {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for QueuedCommand {}

impl PartialOrd for QueuedCommand {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for QueuedCommand {
    fn cmp(&self, other: &Self) -> Ordering {
        (self.due, self.seq).cmp(&(other.due, other.seq))
    }
}

#[derive(Default)]
struct Inner {
    heap: Mutex<BinaryHeap<Reverse<QueuedCommand>>>,
    notify: Notify,
    seq: AtomicU64,
}

/// Shared handle to the delay queue
#[derive(Clone, Default)]
pub struct CommandQueue {
    inner: Arc<Inner>,
}

/// Result of polling the queue without waiting
pub(crate) enum Poll {
    Ready(QueuedCommand),
    /// Nothing due yet; the earliest entry becomes due at this instant
    Pending(Instant),
    Empty,
}

impl CommandQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a first attempt of `command` after `delay`
    pub fn push(&self, command: Command, delay: Duration) {
        self.push_attempt(command, delay, 1);
    }

    pub(crate) fn push_attempt(&self, command: Command, delay: Duration, attempt: u32) {
        let entry = QueuedCommand {
            command,
            attempt,
            due: Instant::now() + delay,
            seq: self.inner.seq.fetch_add(1, AtomicOrdering::Relaxed),
        };
        self.inner
            .heap
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(Reverse(entry));
        self.inner.notify.notify_one();
    }

    pub fn len(&self) -> usize {
        self.inner
            .heap
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub(crate) fn poll(&self) -> Poll {
        let mut heap = self.inner.heap.lock().unwrap_or_else(PoisonError::into_inner);
        let due = match heap.peek() {
            Some(Reverse(head)) => head.due,
            None => return Poll::Empty,
        };
        if due > Instant::now() {
            return Poll::Pending(due);
        }
        match heap.pop() {
            Some(Reverse(entry)) => Poll::Ready(entry),
            None => Poll::Empty,
        }
    }

    /// Wait for the next due command
    pub async fn next(&self) -> QueuedCommand {
        loop {
            let notified = self.inner.notify.notified();
            match self.poll() {
                Poll::Ready(entry) => return entry,
                Poll::Pending(due) => {
                    tokio::select! {
                        _ = tokio::time::sleep_until(due) => {}
                        _ = notified => {}
                    }
                }
                Poll::Empty => notified.await,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ready(job: &str) -> Command {
        Command::ActionReady {
            job_id: job.to_string(),
        }
    }

    #[tokio::test]
    async fn test_due_order_then_insertion_order() {
        let queue = CommandQueue::new();
        queue.push(ready("late"), Duration::from_millis(40));
        queue.push(ready("first"), Duration::ZERO);
        queue.push(ready("second"), Duration::ZERO);
        assert_eq!(queue.len(), 3);

        assert_eq!(queue.next().await.command, ready("first"));
        assert_eq!(queue.next().await.command, ready("second"));
        assert!(matches!(queue.poll(), Poll::Pending(_)));
        assert_eq!(queue.next().await.command, ready("late"));
        assert!(queue.is_empty());
    }

    #[tokio::test]
    async fn test_waiting_worker_wakes_on_push() {
        let queue = CommandQueue::new();
        let waiter = {
            let queue = queue.clone();
            tokio::spawn(async move { queue.next().await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        queue.push(ready("job"), Duration::ZERO);

        let entry = tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(entry.command, ready("job"));
        assert_eq!(entry.attempt, 1);
    }
}
