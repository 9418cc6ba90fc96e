//! Monitoring events emitted by workers.
//!
//! Each worker reports when it starts and finishes an input item, when a stage
//! fails and when a baton wait hits its deadline. Consumers (status
//! publishers, liveness monitors, tests) read them from a crossbeam channel.
//!
//! The channel is bounded. Events that arrive while it is full are dropped,
//! so a receiver that is never read costs at most [`EVENT_CAPACITY`] events.

use crate::pipeline::worker::WorkerState;
use chrono::{DateTime, Utc};
use crossbeam_channel::{bounded, Receiver, Sender, TrySendError};
use serde::Serialize;

/// Events buffered before new ones are dropped.
pub const EVENT_CAPACITY: usize = 4096;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WorkerEventKind {
    WorkerStarted,
    WorkerStopped,
    ItemStarted {
        sequence: u64,
    },
    ItemCompleted {
        sequence: u64,
        emitted: usize,
    },
    StageFailed {
        sequence: u64,
        emitted: usize,
        message: String,
    },
    /// Item abandoned because the worker was stopped mid-protocol.
    ItemAbandoned {
        sequence: u64,
    },
    BatonTimeout {
        baton: String,
        phase: WorkerState,
    },
}

#[derive(Debug, Clone, Serialize)]
pub struct WorkerEvent {
    pub stage: String,
    pub at: DateTime<Utc>,
    #[serde(flatten)]
    pub kind: WorkerEventKind,
}

/// Sending half handed to workers. A disabled sender drops every event.
#[derive(Debug, Clone, Default)]
pub struct EventSender {
    tx: Option<Sender<WorkerEvent>>,
}

impl EventSender {
    pub fn disabled() -> Self {
        Self::default()
    }

    pub fn send(&self, stage: &str, kind: WorkerEventKind) {
        let Some(tx) = &self.tx else {
            return;
        };
        let event = WorkerEvent {
            stage: stage.to_string(),
            at: Utc::now(),
            kind,
        };
        match tx.try_send(event) {
            Ok(()) | Err(TrySendError::Disconnected(_)) => {}
            Err(TrySendError::Full(event)) => {
                tracing::trace!("Event queue full, dropping {:?}", event.kind);
            }
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.tx.is_some()
    }
}

/// Create a connected event sender/receiver pair holding up to
/// [`EVENT_CAPACITY`] events.
pub fn event_channel() -> (EventSender, Receiver<WorkerEvent>) {
    event_channel_with_capacity(EVENT_CAPACITY)
}

pub fn event_channel_with_capacity(capacity: usize) -> (EventSender, Receiver<WorkerEvent>) {
    let (tx, rx) = bounded(capacity);
    (EventSender { tx: Some(tx) }, rx)
}
