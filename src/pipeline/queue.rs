//! Unbounded FIFO linking two adjacent workers.
//!
//! `ItemQueue` is a thin handle over a crossbeam unbounded channel. Cloning the
//! handle shares the same queue, which is how `Pipeline::connect` makes the
//! output queue of worker *i* the input queue of worker *i+1*.

use crate::pipeline::error::{PipelineError, PipelineResult};
use crossbeam_channel::{unbounded, Receiver, RecvTimeoutError, Sender, TryRecvError};
use std::time::Duration;

pub struct ItemQueue<T> {
    tx: Sender<T>,
    rx: Receiver<T>,
}

impl<T> ItemQueue<T> {
    pub fn new() -> Self {
        let (tx, rx) = unbounded();
        Self { tx, rx }
    }

    /// Enqueue without blocking.
    pub fn push(&self, item: T) -> PipelineResult<()> {
        self.tx
            .send(item)
            .map_err(|_| PipelineError::QueueDisconnected)
    }

    /// Pop with a bounded wait. `Ok(None)` means the wait timed out.
    pub fn pop(&self, timeout: Duration) -> PipelineResult<Option<T>> {
        match self.rx.recv_timeout(timeout) {
            Ok(item) => Ok(Some(item)),
            Err(RecvTimeoutError::Timeout) => Ok(None),
            Err(RecvTimeoutError::Disconnected) => Err(PipelineError::QueueDisconnected),
        }
    }

    /// Pop without waiting.
    pub fn try_pop(&self) -> Option<T> {
        match self.rx.try_recv() {
            Ok(item) => Some(item),
            Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => None,
        }
    }

    /// Remove and return everything currently queued.
    pub fn drain(&self) -> Vec<T> {
        self.rx.try_iter().collect()
    }

    pub fn len(&self) -> usize {
        self.rx.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rx.is_empty()
    }

    /// Whether two handles refer to the same underlying queue.
    pub fn same_queue(&self, other: &ItemQueue<T>) -> bool {
        self.rx.same_channel(&other.rx)
    }
}

impl<T> Clone for ItemQueue<T> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
            rx: self.rx.clone(),
        }
    }
}

impl<T> Default for ItemQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> std::fmt::Debug for ItemQueue<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ItemQueue").field("len", &self.len()).finish()
    }
}
