//! Bounded, drainable queues.
//!
//! The frame queues need one operation `tokio::mpsc` cannot offer: an
//! interruption must empty a stage's pending data from *outside* the
//! consumer task. So the queue is a mutex-guarded deque with two wakeup
//! channels, cancellable on both ends through the owning processor's
//! token.

use crate::error::{AgentError, Result};
use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Duration;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

/// A bounded FIFO with blocking push/pop and synchronous drain.
#[derive(Debug)]
pub struct BoundedQueue<T> {
    inner: Mutex<VecDeque<T>>,
    capacity: usize,
    space: Notify,
    items: Notify,
}

impl<T> BoundedQueue<T> {
    /// Create a queue holding at most `capacity` items.
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(VecDeque::new()),
            capacity: capacity.max(1),
            space: Notify::new(),
            items: Notify::new(),
        }
    }

    /// Current queue depth.
    pub fn len(&self) -> usize {
        lock(&self.inner).len()
    }

    /// Whether the queue is empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Append an item, blocking while the queue is full.
    ///
    /// # Errors
    ///
    /// Returns [`AgentError::Cancelled`] if `cancel` fires while blocked
    /// (or had already fired).
    pub async fn push(&self, item: T, cancel: &CancellationToken) -> Result<()> {
        let mut pending = Some(item);
        loop {
            {
                let mut queue = lock(&self.inner);
                if queue.len() < self.capacity {
                    if let Some(value) = pending.take() {
                        queue.push_back(value);
                    }
                    self.items.notify_one();
                    return Ok(());
                }
            }
            if cancel.is_cancelled() {
                return Err(AgentError::Cancelled);
            }
            tokio::select! {
                () = cancel.cancelled() => return Err(AgentError::Cancelled),
                () = self.space.notified() => {}
            }
        }
    }

    /// Remove the oldest item, blocking while the queue is empty.
    ///
    /// # Errors
    ///
    /// Returns [`AgentError::Cancelled`] if `cancel` fires while blocked.
    pub async fn pop(&self, cancel: &CancellationToken) -> Result<T> {
        loop {
            {
                let mut queue = lock(&self.inner);
                if let Some(value) = queue.pop_front() {
                    self.space.notify_one();
                    return Ok(value);
                }
            }
            if cancel.is_cancelled() {
                return Err(AgentError::Cancelled);
            }
            tokio::select! {
                () = cancel.cancelled() => return Err(AgentError::Cancelled),
                () = self.items.notified() => {}
            }
        }
    }

    /// Like [`pop`](Self::pop), but gives up after `timeout` and returns
    /// `Ok(None)`.
    ///
    /// # Errors
    ///
    /// Returns [`AgentError::Cancelled`] if `cancel` fires while blocked.
    pub async fn pop_timeout(
        &self,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<Option<T>> {
        match tokio::time::timeout(timeout, self.pop(cancel)).await {
            Ok(result) => result.map(Some),
            Err(_elapsed) => Ok(None),
        }
    }

    /// Discard every pending item, waking any pushers blocked on capacity.
    ///
    /// Returns the number of items discarded.
    pub fn drain(&self) -> usize {
        let drained = {
            let mut queue = lock(&self.inner);
            let count = queue.len();
            queue.clear();
            count
        };
        if drained > 0 {
            self.space.notify_waiters();
        }
        drained
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}
