//! Pending ICE candidate queue.
//!
//! Remote candidates can trickle in before the answer that completes the
//! handshake; they are parked here and drained into the peer connection
//! once the remote description is set. The queue is bounded and carries an
//! explicit closed flag checked under the lock, so pushes racing a
//! teardown are dropped instead of panicking.

use std::collections::VecDeque;
use std::sync::Mutex;

use tokio::sync::Notify;

const DEFAULT_CAPACITY: usize = 64;

struct QueueState {
    buffer: VecDeque<String>,
    closed: bool,
}

/// Bounded queue of ICE candidate SDP fragments.
pub struct CandidateQueue {
    state: Mutex<QueueState>,
    notify: Notify,
    capacity: usize,
}

impl Default for CandidateQueue {
    fn default() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }
}

impl CandidateQueue {
    /// Create a queue holding at most `capacity` pending candidates.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            state: Mutex::new(QueueState {
                buffer: VecDeque::new(),
                closed: false,
            }),
            notify: Notify::new(),
            capacity,
        }
    }

    /// Enqueue a candidate. Returns false when the queue is closed or
    /// full; the candidate is dropped silently in either case.
    pub fn push(&self, candidate: String) -> bool {
        {
            let mut state = self.state.lock().unwrap();
            if state.closed || state.buffer.len() >= self.capacity {
                return false;
            }
            state.buffer.push_back(candidate);
        }
        self.notify.notify_one();
        true
    }

    /// Dequeue the next candidate, waiting while the queue is open and
    /// empty. Returns None once the queue is closed and drained.
    pub async fn pop(&self) -> Option<String> {
        loop {
            {
                let mut state = self.state.lock().unwrap();
                if let Some(candidate) = state.buffer.pop_front() {
                    return Some(candidate);
                }
                if state.closed {
                    return None;
                }
            }
            self.notify.notified().await;
        }
    }

    /// Close the queue. Idempotent; pending pops wake up and drain.
    pub fn close(&self) {
        self.state.lock().unwrap().closed = true;
        self.notify.notify_waiters();
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;

    #[tokio::test]
    async fn test_push_pop_fifo() {
        let queue = CandidateQueue::default();
        assert!(queue.push("a".to_string()));
        assert!(queue.push("b".to_string()));
        assert_eq!(queue.pop().await.as_deref(), Some("a"));
        assert_eq!(queue.pop().await.as_deref(), Some("b"));
    }

    #[tokio::test]
    async fn test_push_after_close_is_swallowed() {
        let queue = CandidateQueue::default();
        queue.close();
        queue.close();
        assert!(!queue.push("a".to_string()));
        assert_eq!(queue.pop().await, None);
    }

    #[tokio::test]
    async fn test_close_drains_remaining() {
        let queue = CandidateQueue::default();
        queue.push("a".to_string());
        queue.close();
        assert_eq!(queue.pop().await.as_deref(), Some("a"));
        assert_eq!(queue.pop().await, None);
    }

    #[tokio::test]
    async fn test_bounded() {
        let queue = CandidateQueue::with_capacity(1);
        assert!(queue.push("a".to_string()));
        assert!(!queue.push("b".to_string()));
    }

    #[tokio::test]
    async fn test_pop_wakes_on_push() {
        let queue = Arc::new(CandidateQueue::default());

        let waiter = {
            let queue = queue.clone();
            tokio::spawn(async move { queue.pop().await })
        };

        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        queue.push("late".to_string());
        assert_eq!(waiter.await.unwrap().as_deref(), Some("late"));
    }

    #[tokio::test]
    async fn test_pop_wakes_on_close() {
        let queue = Arc::new(CandidateQueue::default());

        let waiter = {
            let queue = queue.clone();
            tokio::spawn(async move { queue.pop().await })
        };

        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        queue.close();
        assert_eq!(waiter.await.unwrap(), None);
    }
}
