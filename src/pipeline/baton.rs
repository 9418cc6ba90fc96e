//! Baton: a binary lock whose ownership is handed between adjacent workers.
//!
//! A baton is not used to protect data. Worker *i* owns baton *i* and takes it
//! around every enqueue; worker *i+1* takes the same baton (its `prev_baton`)
//! for the whole time it spends on an item it popped. The pair of acquires is
//! what keeps bursts from interleaving downstream.
//!
//! Every successful acquire bumps a generation counter and wakes all waiters.
//! A producer that just released the baton can therefore wait for the
//! generation to move ([`Baton::wait_for_handoff`]) and know that its
//! downstream neighbour has claimed the item, instead of sleeping and hoping.
//!
//! All waits are bounded by an optional deadline and by a [`StopSignal`].

use crate::pipeline::error::{PipelineError, PipelineResult};
use crate::pipeline::signal::{StopSignal, WAIT_SLICE};
use parking_lot::{Condvar, Mutex, MutexGuard};
use std::sync::Arc;
use std::time::{Duration, Instant};

#[derive(Debug, Default)]
struct BatonState {
    held: bool,
    /// Number of successful acquires so far.
    generation: u64,
    /// Downstream peers waiting on this baton as their `prev_baton`.
    attached: usize,
}

#[derive(Debug)]
pub struct Baton {
    name: String,
    state: Mutex<BatonState>,
    cond: Condvar,
}

impl Baton {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            state: Mutex::new(BatonState::default()),
            cond: Condvar::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_locked(&self) -> bool {
        self.state.lock().held
    }

    /// Number of successful acquires since creation.
    pub fn generation(&self) -> u64 {
        self.state.lock().generation
    }

    /// Block until the baton is free, then take it.
    ///
    /// `timeout` of `None` waits without a deadline; the wait still ends with
    /// [`PipelineError::Cancelled`] once `stop` fires.
    pub fn acquire(&self, timeout: Option<Duration>, stop: &StopSignal) -> PipelineResult<()> {
        let mut state = self.wait_until(|s| !s.held, timeout, stop)?;
        state.held = true;
        state.generation += 1;
        drop(state);
        self.cond.notify_all();
        Ok(())
    }

    /// Take the baton if it is free. Never blocks.
    pub fn try_acquire(&self) -> bool {
        let mut state = self.state.lock();
        if state.held {
            return false;
        }
        state.held = true;
        state.generation += 1;
        drop(state);
        self.cond.notify_all();
        true
    }

    /// Release the baton, returning the generation it was held under.
    ///
    /// Releasing an unheld baton is rejected rather than silently ignored.
    pub fn release(&self) -> PipelineResult<u64> {
        let mut state = self.state.lock();
        if !state.held {
            return Err(PipelineError::BatonNotHeld(self.name.clone()));
        }
        state.held = false;
        let generation = state.generation;
        drop(state);
        self.cond.notify_all();
        Ok(generation)
    }

    /// Block until someone acquires the baton after generation `since`.
    ///
    /// Returns immediately when no downstream peer is attached, and wakes up
    /// if the peer detaches while we wait.
    pub fn wait_for_handoff(
        &self,
        since: u64,
        timeout: Option<Duration>,
        stop: &StopSignal,
    ) -> PipelineResult<()> {
        self.wait_until(|s| s.generation > since || s.attached == 0, timeout, stop)
            .map(drop)
    }

    /// Acquire and return a guard that releases on drop.
    pub fn lock(
        self: &Arc<Self>,
        timeout: Option<Duration>,
        stop: &StopSignal,
    ) -> PipelineResult<BatonGuard> {
        self.acquire(timeout, stop)?;
        Ok(BatonGuard {
            baton: self.clone(),
        })
    }

    /// Register a downstream peer. Each call must be paired with one
    /// [`Baton::detach`].
    pub fn attach(&self) {
        self.state.lock().attached += 1;
    }

    pub fn detach(&self) {
        let mut state = self.state.lock();
        state.attached = state.attached.saturating_sub(1);
        drop(state);
        self.cond.notify_all();
    }

    pub fn is_attached(&self) -> bool {
        self.state.lock().attached > 0
    }

    /// Number of downstream peers currently attached.
    pub fn peers(&self) -> usize {
        self.state.lock().attached
    }

    fn wait_until<F>(
        &self,
        ready: F,
        timeout: Option<Duration>,
        stop: &StopSignal,
    ) -> PipelineResult<MutexGuard<'_, BatonState>>
    where
        F: Fn(&BatonState) -> bool,
    {
        let start = Instant::now();
        let deadline = timeout.map(|t| start + t);
        let mut state = self.state.lock();
        while !ready(&state) {
            if stop.is_stopped() {
                return Err(PipelineError::Cancelled);
            }
            let now = Instant::now();
            let slice_end = match deadline {
                Some(d) if now >= d => {
                    return Err(PipelineError::BatonTimeout {
                        baton: self.name.clone(),
                        waited: now - start,
                    });
                }
                Some(d) => d.min(now + WAIT_SLICE),
                None => now + WAIT_SLICE,
            };
            self.cond.wait_until(&mut state, slice_end);
        }
        Ok(state)
    }
}

/// Holds a baton until dropped.
#[derive(Debug)]
pub struct BatonGuard {
    baton: Arc<Baton>,
}

impl BatonGuard {
    pub fn baton(&self) -> &Baton {
        &self.baton
    }
}

impl Drop for BatonGuard {
    fn drop(&mut self) {
        if let Err(e) = self.baton.release() {
            tracing::warn!("Baton guard release failed: {}", e);
        }
    }
}
