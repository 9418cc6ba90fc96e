//! Cooperative stop signal shared between a container and its worker thread.
//!
//! Every blocking wait in the pipeline takes a `&StopSignal`: queue pops are
//! bounded by the poll timeout and baton waits re-check the signal every
//! [`WAIT_SLICE`], so a stop request interrupts them without a poll cycle.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Longest uninterrupted condvar wait inside a cancellable wait.
pub const WAIT_SLICE: Duration = Duration::from_millis(10);

#[derive(Debug, Clone, Default)]
pub struct StopSignal {
    stopped: Arc<AtomicBool>,
}

impl StopSignal {
    pub fn new() -> Self {
        Self::default()
    }

    /// Request a stop. Idempotent.
    pub fn stop(&self) {
        self.stopped.store(true, Ordering::SeqCst);
    }

    #[inline]
    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    /// Sleep for up to `duration`, returning early if a stop is requested.
    /// Returns `true` if the signal fired.
    pub fn sleep(&self, duration: Duration) -> bool {
        let deadline = std::time::Instant::now() + duration;
        loop {
            if self.is_stopped() {
                return true;
            }
            let now = std::time::Instant::now();
            if now >= deadline {
                return false;
            }
            std::thread::sleep((deadline - now).min(WAIT_SLICE));
        }
    }
}
