//! Pending-item queue shared by the enqueueing caller and the worker.
//!
//! Strict FIFO: no priorities, no reordering. Items can only leave the
//! queue from the head (dispatch) or by explicit removal before they run.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use thiserror::Error;
use tokio::sync::Notify;
use uuid::Uuid;

use crate::item::TestItem;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum QueueError {
    #[error("test queue is closed")]
    Closed,
}

#[derive(Default)]
struct QueueState {
    items: VecDeque<Arc<TestItem>>,
    closed: bool,
}

#[derive(Default)]
pub struct TestQueue {
    state: Mutex<QueueState>,
    wake: Notify,
}

impl TestQueue {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Append to the tail.
    pub fn push(&self, item: TestItem) -> Result<Arc<TestItem>, QueueError> {
        let item = Arc::new(item);
        {
            let mut state = self.state();
            if state.closed {
                return Err(QueueError::Closed);
            }
            state.items.push_back(Arc::clone(&item));
        }
        self.wake.notify_one();
        Ok(item)
    }

    /// Take the head item, if any.
    pub fn pop(&self) -> Option<Arc<TestItem>> {
        self.state().items.pop_front()
    }

    /// Drop every pending item, returning how many were removed.
    pub fn clear(&self) -> usize {
        let mut state = self.state();
        let removed = state.items.len();
        state.items.clear();
        removed
    }

    /// Remove a pending item by id.
    pub fn remove(&self, id: Uuid) -> Option<Arc<TestItem>> {
        let mut state = self.state();
        let pos = state.items.iter().position(|i| i.id == id)?;
        state.items.remove(pos)
    }

    pub fn contains(&self, id: Uuid) -> bool {
        self.state().items.iter().any(|i| i.id == id)
    }

    pub fn snapshot(&self) -> Vec<Arc<TestItem>> {
        self.state().items.iter().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.state().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Refuse all further pushes. Pending items stay queued.
    pub fn close(&self) {
        self.state().closed = true;
    }

    pub fn is_closed(&self) -> bool {
        self.state().closed
    }

    /// Wake a worker blocked in [`TestQueue::wait`].
    pub fn wake(&self) {
        self.wake.notify_one();
    }

    /// Block until something is pushed, [`TestQueue::wake`] is called, or
    /// `max_wait` elapses.
    pub async fn wait(&self, max_wait: Duration) {
        let _ = tokio::time::timeout(max_wait, self.wake.notified()).await;
    }
}
