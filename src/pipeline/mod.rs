//! Ordered multi-threaded stage pipeline.
//!
//! Items flow through a chain of stages, one worker thread per stage,
//! connected by unbounded queues. Every stage may turn one input into a burst
//! of zero or more outputs.
//!
//! # Architecture
//!
//! ```text
//! [Container: Worker(stage 0)] ──q0──► [Container: Worker(stage 1)] ──q1──► OrderedSink
//!          own baton 0 ◄──────────────────── prev_baton
//! ```
//!
//! # Ordering
//!
//! With `use_lock` enabled, adjacent workers pass a [`Baton`] back and forth
//! so that every item of burst N is seen downstream before any item of burst
//! N+1, across the whole chain. Without it stages run freely and only the
//! per-queue FIFO order holds. See [`worker`] for the four-phase protocol.
//!
//! # Design
//!
//! - **One protocol** - the handoff lives in the worker; stages only emit.
//! - **Rendezvous, not sleep** - a producer waits for the baton generation to
//!   advance instead of pausing and hoping downstream caught up.
//! - **Bounded, cancellable waits** - every blocking call observes a
//!   [`StopSignal`] and an optional deadline.

pub mod baton;
pub mod container;
pub mod error;
pub mod event;
pub mod executor;
pub mod marker;
pub mod queue;
pub mod signal;
pub mod sink;
pub mod stage;
pub mod worker;

pub use baton::{Baton, BatonGuard};
pub use container::Container;
pub use error::{PipelineError, PipelineResult, StageError};
pub use event::{
    event_channel, event_channel_with_capacity, EventSender, WorkerEvent, WorkerEventKind,
    EVENT_CAPACITY,
};
pub use executor::{connect, Pipeline, PipelineBuilder};
pub use marker::{MarkBursts, Marked};
pub use queue::ItemQueue;
pub use signal::StopSignal;
pub use sink::{Delivery, OrderedSink};
pub use stage::{
    stage_factory, BurstSink, FnStage, Stage, StageContext, StageFactory, StageRegistry,
};
pub use worker::{StageStats, Worker, WorkerHandle, WorkerSettings, WorkerState};
