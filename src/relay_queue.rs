use std::collections::VecDeque;
use std::fmt::{Display, Formatter};
use std::sync::Mutex;

use tokio::sync::Notify;

/// Error returned when enqueueing into a queue that was closed.
#[derive(Debug, Eq, PartialEq)]
pub struct Stopped;

impl Display for Stopped {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "queue is stopped")
    }
}

impl std::error::Error for Stopped {}

/// A small bounded FIFO handing packets from the receive upcall to the relay task.
///
/// Enqueueing blocks while the queue is full, which propagates backpressure to the upstream
///  connection instead of buffering without bound. Closing the queue drops any backlog and
///  poisons both ends: enqueue fails with [Stopped], dequeue returns `None` immediately.
pub struct RelayQueue<T> {
    capacity: usize,
    state: Mutex<QueueState<T>>,
    readable: Notify,
    writable: Notify,
}

struct QueueState<T> {
    items: VecDeque<T>,
    closed: bool,
}

impl<T> RelayQueue<T> {
    pub fn new(capacity: usize) -> RelayQueue<T> {
        RelayQueue {
            capacity,
            state: Mutex::new(QueueState {
                items: VecDeque::new(),
                closed: false,
            }),
            readable: Notify::new(),
            writable: Notify::new(),
        }
    }

    /// Append an item, waiting for space if the queue is full.
    pub async fn enqueue(&self, item: T) -> Result<(), Stopped> {
        loop {
            {
                let mut state = self.state.lock().unwrap();
                if state.closed {
                    return Err(Stopped);
                }
                if state.items.len() < self.capacity {
                    state.items.push_back(item);
                    self.readable.notify_one();
                    return Ok(());
                }
            }
            self.writable.notified().await;
        }
    }

    /// Remove the oldest item, waiting for one if the queue is empty. `None` means the queue
    ///  was closed.
    pub async fn dequeue(&self) -> Option<T> {
        loop {
            {
                let mut state = self.state.lock().unwrap();
                if state.closed {
                    return None;
                }
                if let Some(item) = state.items.pop_front() {
                    self.writable.notify_one();
                    return Some(item);
                }
            }
            self.readable.notified().await;
        }
    }

    /// Close the queue, discarding any backlog and waking all waiters. Idempotent.
    pub fn close(&self) {
        {
            let mut state = self.state.lock().unwrap();
            state.closed = true;
            state.items.clear();
        }
        self.readable.notify_waiters();
        self.writable.notify_waiters();
    }

    pub fn len(&self) -> usize {
        self.state.lock().unwrap().items.len()
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().unwrap().closed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;
    use tokio::time::timeout;

    #[tokio::test]
    async fn test_fifo_order() {
        let queue = RelayQueue::new(4);

        queue.enqueue(1).await.unwrap();
        queue.enqueue(2).await.unwrap();
        queue.enqueue(3).await.unwrap();

        assert_eq!(queue.dequeue().await, Some(1));
        assert_eq!(queue.dequeue().await, Some(2));
        assert_eq!(queue.dequeue().await, Some(3));
        assert_eq!(queue.len(), 0);
    }

    #[tokio::test]
    async fn test_enqueue_blocks_when_full() {
        let queue = Arc::new(RelayQueue::new(2));
        queue.enqueue(1).await.unwrap();
        queue.enqueue(2).await.unwrap();

        let writer = {
            let queue = queue.clone();
            tokio::spawn(async move {
                queue.enqueue(3).await.unwrap();
            })
        };

        // the writer cannot make progress until a slot opens up
        assert!(timeout(Duration::from_millis(50), queue.enqueue(99)).await.is_err());

        assert_eq!(queue.dequeue().await, Some(1));
        writer.await.unwrap();
        assert_eq!(queue.dequeue().await, Some(2));
        assert_eq!(queue.dequeue().await, Some(3));
    }

    #[tokio::test]
    async fn test_dequeue_waits_for_item() {
        let queue = Arc::new(RelayQueue::new(2));

        let reader = {
            let queue = queue.clone();
            tokio::spawn(async move {
                queue.dequeue().await
            })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        queue.enqueue(7).await.unwrap();

        assert_eq!(reader.await.unwrap(), Some(7));
    }

    #[tokio::test]
    async fn test_close_poisons_both_ends() {
        let queue = RelayQueue::new(4);
        queue.enqueue(1).await.unwrap();

        queue.close();
        assert!(queue.is_closed());
        assert_eq!(queue.len(), 0); // backlog is discarded

        assert_eq!(queue.dequeue().await, None);
        assert_eq!(queue.enqueue(2).await, Err(Stopped));

        // idempotent
        queue.close();
        assert_eq!(queue.dequeue().await, None);
    }

    #[tokio::test]
    async fn test_close_wakes_blocked_reader() {
        let queue = Arc::new(RelayQueue::<u32>::new(2));

        let reader = {
            let queue = queue.clone();
            tokio::spawn(async move {
                queue.dequeue().await
            })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        queue.close();

        assert_eq!(reader.await.unwrap(), None);
    }
}
