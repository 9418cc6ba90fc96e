//! Consumer side of the last queue.
//!
//! With locking enabled the sink acts as one more downstream peer: it holds the
//! tail baton while the caller handles a delivered item, exactly like a worker
//! holds its `prev_baton` while processing. The last worker therefore cannot
//! enqueue the next item until the previous [`Delivery`] is dropped.
//!
//! Drop each delivery before asking for the next one. Holding a delivery across
//! `recv` makes the next acquire wait on yourself until the baton timeout.

use crate::pipeline::baton::{Baton, BatonGuard};
use crate::pipeline::error::{PipelineError, PipelineResult};
use crate::pipeline::queue::ItemQueue;
use crate::pipeline::signal::StopSignal;
use std::ops::Deref;
use std::sync::Arc;
use std::time::Duration;

pub struct OrderedSink<T> {
    queue: ItemQueue<T>,
    baton: Option<Arc<Baton>>,
    baton_timeout: Option<Duration>,
    stop: StopSignal,
}

impl<T> OrderedSink<T> {
    /// Sink without baton participation.
    pub fn unlocked(queue: ItemQueue<T>) -> Self {
        Self {
            queue,
            baton: None,
            baton_timeout: None,
            stop: StopSignal::new(),
        }
    }

    /// Sink that takes part in the handoff on `baton`. Every locked sink counts
    /// as one downstream peer of `baton` until dropped.
    pub fn locked(queue: ItemQueue<T>, baton: Arc<Baton>, baton_timeout: Option<Duration>) -> Self {
        baton.attach();
        Self {
            queue,
            baton: Some(baton),
            baton_timeout,
            stop: StopSignal::new(),
        }
    }

    pub fn is_locked(&self) -> bool {
        self.baton.is_some()
    }

    /// Signal that interrupts a pending baton wait in [`OrderedSink::recv`].
    pub fn stop_signal(&self) -> StopSignal {
        self.stop.clone()
    }

    /// Wait up to `timeout` for the next item.
    ///
    /// `Ok(None)` means nothing arrived in time. A baton wait that hits the
    /// configured deadline is logged and the item is delivered unguarded.
    pub fn recv(&self, timeout: Duration) -> PipelineResult<Option<Delivery<T>>> {
        let Some(item) = self.queue.pop(timeout)? else {
            return Ok(None);
        };

        let Some(baton) = &self.baton else {
            return Ok(Some(Delivery { item, guard: None }));
        };

        match baton.lock(self.baton_timeout, &self.stop) {
            Ok(guard) => Ok(Some(Delivery {
                item,
                guard: Some(guard),
            })),
            Err(PipelineError::BatonTimeout { waited, .. }) => {
                tracing::warn!(
                    "Sink timed out after {:?} on baton '{}'; delivering unguarded",
                    waited,
                    baton.name()
                );
                Ok(Some(Delivery { item, guard: None }))
            }
            Err(e) => Err(e),
        }
    }

    /// Receive and unwrap the next item, releasing the baton immediately.
    pub fn recv_item(&self, timeout: Duration) -> PipelineResult<Option<T>> {
        Ok(self.recv(timeout)?.map(Delivery::into_inner))
    }

    /// Collect items until `count` have arrived or a receive times out.
    pub fn collect(&self, count: usize, timeout: Duration) -> PipelineResult<Vec<T>> {
        let mut items = Vec::with_capacity(count);
        while items.len() < count {
            match self.recv_item(timeout)? {
                Some(item) => items.push(item),
                None => break,
            }
        }
        Ok(items)
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }
}

impl<T> Drop for OrderedSink<T> {
    fn drop(&mut self) {
        if let Some(baton) = &self.baton {
            baton.detach();
        }
    }
}

/// One delivered item. The tail baton stays held until this is dropped.
pub struct Delivery<T> {
    item: T,
    guard: Option<BatonGuard>,
}

impl<T> Delivery<T> {
    /// Take the item and release the baton.
    pub fn into_inner(self) -> T {
        let Delivery { item, guard } = self;
        drop(guard);
        item
    }

    /// True when the tail baton is held for this delivery.
    pub fn is_guarded(&self) -> bool {
        self.guard.is_some()
    }
}

impl<T> Deref for Delivery<T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.item
    }
}
