//! Worker thread: runs one stage and the baton handoff protocol.
//!
//! # Loop
//!
//! The worker repeatedly pops its input queue with a bounded timeout. A timeout
//! only re-checks the stop signal, so shutdown latency is at most one poll
//! interval. Without an input queue the worker idles in short sleeps until one
//! is wired in.
//!
//! # Handoff protocol (`use_lock = true`)
//!
//! For every consumed item:
//!
//! 1. **Wait upstream**: acquire `prev_baton`. Upstream took it around the
//!    enqueue of this item and waits for us to claim it.
//! 2. **Produce**: for each emitted item, acquire the own baton, enqueue,
//!    release, then wait until the downstream worker has claimed the baton
//!    (generation advanced). Downstream holds it until it has finished with
//!    that item, so the next enqueue cannot overtake it.
//! 3. **Wait downstream drain**: acquire and release the own baton once more,
//!    which blocks until downstream finished the last item of the burst.
//! 4. **Release upstream**: release `prev_baton`.
//!
//! Phases 3 and 4 run even when the stage fails or emits nothing; skipping them
//! would leave upstream blocked forever. A baton wait that hits the configured
//! deadline is logged and the worker proceeds without holding that baton. A
//! stop request interrupts any wait; the current item is then abandoned after
//! releasing whatever the worker holds.

use crate::config::StageConfig;
use crate::pipeline::baton::Baton;
use crate::pipeline::error::{PipelineError, PipelineResult, StageError};
use crate::pipeline::event::{EventSender, WorkerEventKind};
use crate::pipeline::queue::ItemQueue;
use crate::pipeline::signal::StopSignal;
use crate::pipeline::stage::{BurstSink, Stage, StageContext};
use parking_lot::Mutex;
use serde::Serialize;
use std::any::Any;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

/// Where a worker currently is in its loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
#[repr(u8)]
pub enum WorkerState {
    Idle = 0,
    WaitingForUpstream = 1,
    ProducingBurst = 2,
    WaitingForDownstreamDrain = 3,
    Stopped = 4,
}

impl WorkerState {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => WorkerState::Idle,
            1 => WorkerState::WaitingForUpstream,
            2 => WorkerState::ProducingBurst,
            3 => WorkerState::WaitingForDownstreamDrain,
            _ => WorkerState::Stopped,
        }
    }
}

#[derive(Debug)]
struct SharedState(AtomicU8);

impl SharedState {
    fn new() -> Self {
        Self(AtomicU8::new(WorkerState::Stopped as u8))
    }

    fn get(&self) -> WorkerState {
        WorkerState::from_u8(self.0.load(Ordering::Acquire))
    }

    fn set(&self, state: WorkerState) {
        self.0.store(state as u8, Ordering::Release);
    }
}

/// Protocol settings shared by every worker of a pipeline.
#[derive(Debug, Clone, PartialEq)]
pub struct WorkerSettings {
    /// Run the baton handoff protocol
    pub use_lock: bool,
    /// Input queue pop timeout
    pub poll_timeout: Duration,
    /// Deadline for one baton wait, `None` = until stopped
    pub baton_timeout: Option<Duration>,
    /// Sleep between checks while no input queue is wired
    pub idle_retry: Duration,
}

impl Default for WorkerSettings {
    fn default() -> Self {
        Self {
            use_lock: false,
            poll_timeout: Duration::from_millis(crate::config::DEFAULT_POLL_TIMEOUT_MS),
            baton_timeout: Some(Duration::from_millis(
                crate::config::DEFAULT_BATON_TIMEOUT_MS,
            )),
            idle_retry: Duration::from_millis(crate::config::DEFAULT_IDLE_RETRY_MS),
        }
    }
}

/// Counters updated by the worker thread.
#[derive(Debug, Default)]
pub struct WorkerStats {
    consumed: AtomicU64,
    completed: AtomicU64,
    emitted: AtomicU64,
    failures: AtomicU64,
    baton_timeouts: AtomicU64,
    abandoned: AtomicU64,
}

impl WorkerStats {
    pub fn snapshot(&self, stage: &str) -> StageStats {
        StageStats {
            stage: stage.to_string(),
            consumed: self.consumed.load(Ordering::Acquire),
            completed: self.completed.load(Ordering::Acquire),
            emitted: self.emitted.load(Ordering::Acquire),
            failures: self.failures.load(Ordering::Relaxed),
            baton_timeouts: self.baton_timeouts.load(Ordering::Relaxed),
            abandoned: self.abandoned.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time copy of a worker's counters.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct StageStats {
    pub stage: String,
    /// Input items popped
    pub consumed: u64,
    /// Input items fully handled, whatever the outcome
    pub completed: u64,
    /// Output items enqueued
    pub emitted: u64,
    /// Items whose stage call failed or panicked
    pub failures: u64,
    /// Baton waits that hit their deadline
    pub baton_timeouts: u64,
    /// Items dropped because of a stop request
    pub abandoned: u64,
}

/// Queue and baton references a worker reads on every poll.
///
/// Shared between the worker thread and whoever rewires it, so a new input
/// queue or upstream baton is picked up at the next poll.
pub(crate) struct WorkerLinks<T> {
    input: Mutex<Option<ItemQueue<T>>>,
    prev: Mutex<PrevLink>,
}

/// Upstream baton plus whether this worker is counted among its peers.
#[derive(Default)]
struct PrevLink {
    baton: Option<Arc<Baton>>,
    attached: bool,
}

impl<T> WorkerLinks<T> {
    pub(crate) fn new() -> Self {
        Self {
            input: Mutex::new(None),
            prev: Mutex::new(PrevLink::default()),
        }
    }

    pub(crate) fn input_queue(&self) -> Option<ItemQueue<T>> {
        self.input.lock().clone()
    }

    pub(crate) fn set_input_queue(&self, queue: Option<ItemQueue<T>>) {
        *self.input.lock() = queue;
    }

    pub(crate) fn prev_baton(&self) -> Option<Arc<Baton>> {
        self.prev.lock().baton.clone()
    }

    /// Swap the upstream baton, moving this worker's attachment along.
    pub(crate) fn set_prev_baton(&self, baton: Option<Arc<Baton>>) {
        let mut link = self.prev.lock();
        if let (Some(old), true) = (&link.baton, link.attached) {
            old.detach();
        }
        if let Some(new) = &baton {
            new.attach();
        }
        link.attached = baton.is_some();
        link.baton = baton;
    }

    /// Attach to the upstream baton unless already attached.
    fn attach_prev(&self) {
        let mut link = self.prev.lock();
        if link.attached {
            return;
        }
        if let Some(baton) = &link.baton {
            baton.attach();
            link.attached = true;
        }
    }

    fn detach_prev(&self) {
        let mut link = self.prev.lock();
        if let (Some(baton), true) = (&link.baton, link.attached) {
            baton.detach();
        }
        link.attached = false;
    }
}

impl<T> Drop for WorkerLinks<T> {
    fn drop(&mut self) {
        self.detach_prev();
    }
}

/// A stage plus its queues and batons, ready to be started on a thread.
pub struct Worker<T> {
    config: StageConfig,
    stage: Box<dyn Stage<T>>,
    settings: WorkerSettings,
    links: Arc<WorkerLinks<T>>,
    output: ItemQueue<T>,
    baton: Arc<Baton>,
    events: EventSender,
    stats: Arc<WorkerStats>,
    state: Arc<SharedState>,
}

impl<T: Send + 'static> Worker<T> {
    pub fn new(
        config: StageConfig,
        stage: Box<dyn Stage<T>>,
        settings: WorkerSettings,
        output: ItemQueue<T>,
        baton: Arc<Baton>,
    ) -> Self {
        Self {
            config,
            stage,
            settings,
            links: Arc::new(WorkerLinks::new()),
            output,
            baton,
            events: EventSender::disabled(),
            stats: Arc::new(WorkerStats::default()),
            state: Arc::new(SharedState::new()),
        }
    }

    pub fn with_events(mut self, events: EventSender) -> Self {
        self.events = events;
        self
    }

    pub(crate) fn with_links(mut self, links: Arc<WorkerLinks<T>>) -> Self {
        self.links = links;
        self
    }

    pub(crate) fn with_stats(mut self, stats: Arc<WorkerStats>) -> Self {
        self.stats = stats;
        self
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    pub fn set_input_queue(&self, queue: Option<ItemQueue<T>>) {
        self.links.set_input_queue(queue);
    }

    pub fn set_prev_baton(&self, baton: Option<Arc<Baton>>) {
        self.links.set_prev_baton(baton);
    }

    pub fn output_queue(&self) -> &ItemQueue<T> {
        &self.output
    }

    pub fn baton(&self) -> &Arc<Baton> {
        &self.baton
    }

    /// Spawn the processing loop on its own thread and return immediately.
    pub fn start(self) -> PipelineResult<WorkerHandle<T>> {
        let name = self.config.name.clone();
        let stop = StopSignal::new();
        let links = self.links.clone();
        let stats = self.stats.clone();
        let state = self.state.clone();
        state.set(WorkerState::Idle);
        links.attach_prev();

        let runner = WorkerLoop {
            worker: self,
            stop: stop.clone(),
            next_sequence: 0,
        };
        let thread = std::thread::Builder::new()
            .name(format!("satflow-{}", name))
            .spawn(move || runner.run())
            .map_err(|e| {
                links.detach_prev();
                state.set(WorkerState::Stopped);
                PipelineError::Spawn(e.to_string())
            })?;

        Ok(WorkerHandle {
            name,
            links,
            stop,
            thread: Some(thread),
            stats,
            state,
        })
    }
}

/// Handle to a running worker thread.
pub struct WorkerHandle<T> {
    name: String,
    links: Arc<WorkerLinks<T>>,
    stop: StopSignal,
    thread: Option<JoinHandle<()>>,
    stats: Arc<WorkerStats>,
    state: Arc<SharedState>,
}

impl<T> WorkerHandle<T> {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Signal the loop to exit without waiting for it.
    pub fn request_stop(&self) {
        self.stop.stop();
    }

    /// Signal the loop to exit and join the thread. Idempotent.
    pub fn stop(&mut self) {
        let Some(thread) = self.thread.take() else {
            return;
        };
        tracing::debug!("Stopping worker '{}'", self.name);
        self.stop.stop();
        if thread.join().is_err() {
            tracing::error!("Worker '{}' thread panicked", self.name);
        }
        self.state.set(WorkerState::Stopped);
        tracing::debug!("Worker '{}' stopped", self.name);
    }

    pub fn is_alive(&self) -> bool {
        self.thread.as_ref().is_some_and(|t| !t.is_finished())
    }

    pub fn state(&self) -> WorkerState {
        self.state.get()
    }

    pub fn stats(&self) -> StageStats {
        self.stats.snapshot(&self.name)
    }

    pub fn set_input_queue(&self, queue: Option<ItemQueue<T>>) {
        self.links.set_input_queue(queue);
    }

    pub fn set_prev_baton(&self, baton: Option<Arc<Baton>>) {
        self.links.set_prev_baton(baton);
    }
}

impl<T> Drop for WorkerHandle<T> {
    fn drop(&mut self) {
        self.stop();
    }
}

struct WorkerLoop<T> {
    worker: Worker<T>,
    stop: StopSignal,
    next_sequence: u64,
}

impl<T: Send + 'static> WorkerLoop<T> {
    fn run(mut self) {
        let name = self.worker.config.name.clone();
        tracing::info!("Worker '{}' started", name);

        self.worker.stage.on_start(&self.worker.config);
        self.worker.events.send(&name, WorkerEventKind::WorkerStarted);

        let settings = self.worker.settings.clone();
        while !self.stop.is_stopped() {
            let Some(input) = self.worker.links.input_queue() else {
                self.stop.sleep(settings.idle_retry.min(settings.poll_timeout));
                continue;
            };

            match input.pop(settings.poll_timeout) {
                Ok(Some(item)) => {
                    self.handle_item(item);
                    self.worker.stats.completed.fetch_add(1, Ordering::Release);
                }
                Ok(None) => continue,
                Err(e) => {
                    tracing::warn!("Worker '{}' input queue error: {}", name, e);
                    self.stop.sleep(settings.idle_retry);
                }
            }
        }

        self.worker.stage.on_stop();
        self.worker.links.detach_prev();
        self.worker.state.set(WorkerState::Stopped);
        self.worker.events.send(&name, WorkerEventKind::WorkerStopped);
        tracing::info!("Worker '{}' stopped", name);
    }

    fn handle_item(&mut self, item: T) {
        let sequence = self.next_sequence;
        self.next_sequence += 1;

        let worker = &mut self.worker;
        let stop = &self.stop;
        let name = worker.config.name.as_str();
        let timeout = worker.settings.baton_timeout;
        let locked = worker.settings.use_lock;

        worker.stats.consumed.fetch_add(1, Ordering::Release);
        worker
            .events
            .send(name, WorkerEventKind::ItemStarted { sequence });
        tracing::debug!("Worker '{}' received item {}", name, sequence);

        // Phase 1: wait for upstream to hand over the item.
        let prev = if locked { worker.links.prev_baton() } else { None };
        let mut upstream_held = false;
        if let Some(prev) = &prev {
            worker.state.set(WorkerState::WaitingForUpstream);
            tracing::debug!("Worker '{}' acquires upstream baton '{}'", name, prev.name());
            match prev.acquire(timeout, stop) {
                Ok(()) => upstream_held = true,
                Err(PipelineError::BatonTimeout { .. }) => note_baton_timeout(
                    name,
                    prev,
                    WorkerState::WaitingForUpstream,
                    &worker.stats,
                    &worker.events,
                ),
                Err(_) => {
                    abandon(name, sequence, &worker.stats, &worker.events);
                    worker.state.set(WorkerState::Idle);
                    return;
                }
            }
        }

        // Phase 2: run the stage, handing off each emitted item.
        worker.state.set(WorkerState::ProducingBurst);
        let mut writer = BurstWriter {
            stage: name,
            output: &worker.output,
            baton: if locked { Some(worker.baton.as_ref()) } else { None },
            timeout,
            stop,
            stats: &worker.stats,
            events: &worker.events,
            emitted: 0,
        };
        let result = {
            let stage = &mut worker.stage;
            let mut ctx = StageContext::new(&worker.config, sequence, &mut writer);
            catch_unwind(AssertUnwindSafe(|| stage.process(item, &mut ctx)))
        };
        let emitted = writer.emitted;

        let failure = match result {
            Ok(Ok(())) => None,
            Ok(Err(e)) => Some(e),
            Err(payload) => Some(StageError::Panicked(panic_message(payload.as_ref()))),
        };

        if failure.as_ref().is_some_and(StageError::is_cancelled) {
            release_upstream(name, prev.as_deref(), upstream_held);
            abandon(name, sequence, &worker.stats, &worker.events);
            worker.state.set(WorkerState::Idle);
            return;
        }
        if let Some(err) = &failure {
            tracing::error!(
                "Stage '{}' failed on item {} after emitting {} item(s): {}",
                name,
                sequence,
                emitted,
                err
            );
            worker.stats.failures.fetch_add(1, Ordering::Relaxed);
            worker.events.send(
                name,
                WorkerEventKind::StageFailed {
                    sequence,
                    emitted,
                    message: err.to_string(),
                },
            );
        }

        // Phase 3: wait until downstream has finished with the burst.
        if locked {
            worker.state.set(WorkerState::WaitingForDownstreamDrain);
            match worker.baton.acquire(timeout, stop) {
                Ok(()) => {
                    if let Err(e) = worker.baton.release() {
                        tracing::warn!("Worker '{}' drain release failed: {}", name, e);
                    }
                }
                Err(PipelineError::BatonTimeout { .. }) => note_baton_timeout(
                    name,
                    &worker.baton,
                    WorkerState::WaitingForDownstreamDrain,
                    &worker.stats,
                    &worker.events,
                ),
                Err(_) => {
                    release_upstream(name, prev.as_deref(), upstream_held);
                    abandon(name, sequence, &worker.stats, &worker.events);
                    worker.state.set(WorkerState::Idle);
                    return;
                }
            }
        }

        // Phase 4: let upstream move on.
        release_upstream(name, prev.as_deref(), upstream_held);
        worker.state.set(WorkerState::Idle);

        if failure.is_none() {
            worker
                .events
                .send(name, WorkerEventKind::ItemCompleted { sequence, emitted });
            tracing::debug!("Worker '{}' finished item {} ({} emitted)", name, sequence, emitted);
        }
    }
}

/// Enqueues one burst, running the per-item handoff when locking is on.
struct BurstWriter<'a, T> {
    stage: &'a str,
    output: &'a ItemQueue<T>,
    baton: Option<&'a Baton>,
    timeout: Option<Duration>,
    stop: &'a StopSignal,
    stats: &'a WorkerStats,
    events: &'a EventSender,
    emitted: usize,
}

impl<T> BurstSink<T> for BurstWriter<'_, T> {
    fn emit(&mut self, item: T) -> PipelineResult<()> {
        match self.baton {
            None => self.output.push(item)?,
            Some(baton) => {
                let held = match baton.acquire(self.timeout, self.stop) {
                    Ok(()) => true,
                    Err(PipelineError::BatonTimeout { .. }) => {
                        note_baton_timeout(
                            self.stage,
                            baton,
                            WorkerState::ProducingBurst,
                            self.stats,
                            self.events,
                        );
                        false
                    }
                    Err(e) => return Err(e),
                };

                let pushed = self.output.push(item);
                let released_at = if held {
                    match baton.release() {
                        Ok(generation) => Some(generation),
                        Err(e) => {
                            tracing::warn!("Stage '{}' own baton release failed: {}", self.stage, e);
                            None
                        }
                    }
                } else {
                    None
                };
                pushed?;

                if let Some(generation) = released_at {
                    match baton.wait_for_handoff(generation, self.timeout, self.stop) {
                        Ok(()) => {}
                        Err(PipelineError::BatonTimeout { .. }) => note_baton_timeout(
                            self.stage,
                            baton,
                            WorkerState::ProducingBurst,
                            self.stats,
                            self.events,
                        ),
                        Err(e) => return Err(e),
                    }
                }
            }
        }
        self.emitted += 1;
        self.stats.emitted.fetch_add(1, Ordering::Release);
        Ok(())
    }

    fn emitted(&self) -> usize {
        self.emitted
    }
}

fn release_upstream(stage: &str, prev: Option<&Baton>, held: bool) {
    let Some(prev) = prev else {
        return;
    };
    if !held {
        return;
    }
    tracing::debug!("Worker '{}' releases upstream baton '{}'", stage, prev.name());
    if let Err(e) = prev.release() {
        tracing::warn!("Worker '{}' upstream release failed: {}", stage, e);
    }
}

fn note_baton_timeout(
    stage: &str,
    baton: &Baton,
    phase: WorkerState,
    stats: &WorkerStats,
    events: &EventSender,
) {
    tracing::warn!(
        "Worker '{}' timed out on baton '{}' while {:?}; proceeding without it",
        stage,
        baton.name(),
        phase
    );
    stats.baton_timeouts.fetch_add(1, Ordering::Relaxed);
    events.send(
        stage,
        WorkerEventKind::BatonTimeout {
            baton: baton.name().to_string(),
            phase,
        },
    );
}

fn abandon(stage: &str, sequence: u64, stats: &WorkerStats, events: &EventSender) {
    tracing::warn!("Worker '{}' abandoned item {} on stop", stage, sequence);
    stats.abandoned.fetch_add(1, Ordering::Relaxed);
    events.send(stage, WorkerEventKind::ItemAbandoned { sequence });
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::event::{event_channel, WorkerEvent};
    use crate::pipeline::stage::FnStage;
    use crossbeam_channel::Receiver;
    use std::time::Instant;

    fn settings(use_lock: bool) -> WorkerSettings {
        WorkerSettings {
            use_lock,
            poll_timeout: Duration::from_millis(20),
            baton_timeout: Some(Duration::from_secs(5)),
            idle_retry: Duration::from_millis(10),
        }
    }

    fn worker_with<F>(name: &str, use_lock: bool, func: F) -> Worker<u32>
    where
        F: FnMut(u32) -> Result<Vec<u32>, StageError> + Send + 'static,
    {
        Worker::new(
            StageConfig::new(name, "test"),
            Box::new(FnStage::new(name, func)),
            settings(use_lock),
            ItemQueue::new(),
            Arc::new(Baton::new(name)),
        )
    }

    fn wait_for<P>(rx: &Receiver<WorkerEvent>, pred: P) -> WorkerEvent
    where
        P: Fn(&WorkerEventKind) -> bool,
    {
        let deadline = Instant::now() + Duration::from_secs(5);
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            let event = rx.recv_timeout(remaining).expect("timed out waiting for event");
            if pred(&event.kind) {
                return event;
            }
        }
    }

    #[test]
    fn test_fan_out_preserves_burst_order() {
        let input = ItemQueue::new();
        let worker = worker_with("fan", false, |x| Ok(vec![x * 10, x * 10 + 1, x * 10 + 2]));
        worker.set_input_queue(Some(input.clone()));
        let output = worker.output_queue().clone();
        let mut handle = worker.start().unwrap();

        input.push(1).unwrap();
        input.push(2).unwrap();

        let mut seen = Vec::new();
        while seen.len() < 6 {
            if let Some(v) = output.pop(Duration::from_secs(5)).unwrap() {
                seen.push(v);
            } else {
                break;
            }
        }
        assert_eq!(seen, vec![10, 11, 12, 20, 21, 22]);
        handle.stop();
        assert_eq!(handle.stats().consumed, 2);
        assert_eq!(handle.stats().emitted, 6);
    }

    #[test]
    fn test_empty_burst_releases_prev_baton() {
        let (events, rx) = event_channel();
        let input = ItemQueue::new();
        let prev = Arc::new(Baton::new("upstream"));
        let worker = worker_with("dropper", true, |_| Ok(Vec::new())).with_events(events);
        worker.set_input_queue(Some(input.clone()));
        worker.set_prev_baton(Some(prev.clone()));
        let output = worker.output_queue().clone();
        let mut handle = worker.start().unwrap();

        for i in 0..3 {
            input.push(i).unwrap();
            let event = wait_for(&rx, |k| matches!(k, WorkerEventKind::ItemCompleted { .. }));
            assert_eq!(
                event.kind,
                WorkerEventKind::ItemCompleted {
                    sequence: i as u64,
                    emitted: 0
                }
            );
            assert!(!prev.is_locked());
        }

        assert!(output.is_empty());
        handle.stop();
        assert_eq!(handle.stats().consumed, 3);
    }

    fn wait_for_state<T>(handle: &WorkerHandle<T>, state: WorkerState) -> bool {
        let deadline = Instant::now() + Duration::from_secs(5);
        while handle.state() != state && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(2));
        }
        handle.state() == state
    }

    #[test]
    fn test_prev_baton_held_until_downstream_drains() {
        let (events, rx) = event_channel();
        let input = ItemQueue::new();
        let prev = Arc::new(Baton::new("upstream"));
        let worker = worker_with("middle", true, |x| Ok(vec![x])).with_events(events);
        worker.set_input_queue(Some(input.clone()));
        worker.set_prev_baton(Some(prev.clone()));
        let own = worker.baton().clone();
        let output = worker.output_queue().clone();
        // The test plays the downstream worker
        own.attach();
        let mut handle = worker.start().unwrap();

        input.push(4).unwrap();
        assert_eq!(output.pop(Duration::from_secs(5)).unwrap(), Some(4));
        let downstream = StopSignal::new();
        own.acquire(Some(Duration::from_secs(5)), &downstream).unwrap();

        // Burst is out, but downstream still works on its last item
        assert!(wait_for_state(&handle, WorkerState::WaitingForDownstreamDrain));
        assert!(prev.is_locked());
        std::thread::sleep(Duration::from_millis(50));
        assert_eq!(handle.state(), WorkerState::WaitingForDownstreamDrain);
        assert!(prev.is_locked());
        assert!(rx
            .try_iter()
            .all(|e| !matches!(e.kind, WorkerEventKind::ItemCompleted { .. })));

        own.release().unwrap();
        wait_for(&rx, |k| matches!(k, WorkerEventKind::ItemCompleted { .. }));
        assert!(!prev.is_locked());
        assert!(!own.is_locked());
        assert_eq!(handle.stats().baton_timeouts, 0);

        handle.stop();
        own.detach();
    }

    #[test]
    fn test_next_emit_waits_for_downstream_claim() {
        let input = ItemQueue::new();
        let worker = worker_with("fan", true, |x| Ok(vec![x, x + 1]));
        worker.set_input_queue(Some(input.clone()));
        let own = worker.baton().clone();
        let output = worker.output_queue().clone();
        own.attach();
        let mut handle = worker.start().unwrap();

        input.push(10).unwrap();
        assert_eq!(output.pop(Duration::from_secs(5)).unwrap(), Some(10));
        // Nobody has claimed the first item, so the second is not enqueued
        std::thread::sleep(Duration::from_millis(50));
        assert!(output.is_empty());
        assert_eq!(handle.state(), WorkerState::ProducingBurst);

        let downstream = StopSignal::new();
        own.acquire(Some(Duration::from_secs(5)), &downstream).unwrap();
        std::thread::sleep(Duration::from_millis(30));
        // Claimed and still held: the next enqueue waits for the release
        assert!(output.is_empty());

        own.release().unwrap();
        assert_eq!(output.pop(Duration::from_secs(5)).unwrap(), Some(11));
        own.acquire(Some(Duration::from_secs(5)), &downstream).unwrap();
        own.release().unwrap();

        assert!(wait_for_state(&handle, WorkerState::Idle));
        handle.stop();
        own.detach();
    }

    #[test]
    fn test_stage_failure_mid_burst_still_releases() {
        let (events, rx) = event_channel();
        let input = ItemQueue::new();
        let prev = Arc::new(Baton::new("upstream"));
        let worker = Worker::new(
            StageConfig::new("flaky", "test"),
            Box::new(FlakyStage),
            settings(true),
            ItemQueue::new(),
            Arc::new(Baton::new("flaky")),
        )
        .with_events(events);
        worker.set_input_queue(Some(input.clone()));
        worker.set_prev_baton(Some(prev.clone()));
        let output = worker.output_queue().clone();
        let mut handle = worker.start().unwrap();

        input.push(1).unwrap();
        let failed = wait_for(&rx, |k| matches!(k, WorkerEventKind::StageFailed { .. }));
        match failed.kind {
            WorkerEventKind::StageFailed { emitted, .. } => assert_eq!(emitted, 1),
            other => panic!("unexpected event {:?}", other),
        }

        input.push(2).unwrap();
        wait_for(&rx, |k| matches!(k, WorkerEventKind::ItemCompleted { .. }));
        assert!(!prev.is_locked());

        assert_eq!(output.drain(), vec![1, 2, 2]);
        handle.stop();
        let stats = handle.stats();
        assert_eq!(stats.failures, 1);
        assert_eq!(stats.emitted, 3);
    }

    struct FlakyStage;

    impl Stage<u32> for FlakyStage {
        fn name(&self) -> &str {
            "flaky"
        }

        fn process(&mut self, item: u32, ctx: &mut StageContext<'_, u32>) -> Result<(), StageError> {
            ctx.emit(item)?;
            if item == 1 {
                return Err(StageError::failed("scene could not be resampled"));
            }
            ctx.emit(item)?;
            Ok(())
        }
    }

    #[test]
    fn test_panicking_stage_is_contained() {
        let (events, rx) = event_channel();
        let input = ItemQueue::new();
        let worker = worker_with("panicky", false, |x| {
            if x == 0 {
                panic!("bad scene");
            }
            Ok(vec![x])
        })
        .with_events(events);
        worker.set_input_queue(Some(input.clone()));
        let output = worker.output_queue().clone();
        let mut handle = worker.start().unwrap();

        input.push(0).unwrap();
        let failed = wait_for(&rx, |k| matches!(k, WorkerEventKind::StageFailed { .. }));
        match failed.kind {
            WorkerEventKind::StageFailed { message, .. } => assert!(message.contains("bad scene")),
            other => panic!("unexpected event {:?}", other),
        }

        input.push(5).unwrap();
        assert_eq!(output.pop(Duration::from_secs(5)).unwrap(), Some(5));
        assert!(handle.is_alive());
        handle.stop();
    }

    #[test]
    fn test_stop_returns_within_poll_interval() {
        let input: ItemQueue<u32> = ItemQueue::new();
        let mut s = settings(false);
        s.poll_timeout = Duration::from_millis(100);
        let worker = Worker::new(
            StageConfig::new("idle", "test"),
            Box::new(FnStage::new("idle", |x: u32| Ok::<_, StageError>(vec![x]))),
            s,
            ItemQueue::new(),
            Arc::new(Baton::new("idle")),
        );
        worker.set_input_queue(Some(input));
        let mut handle = worker.start().unwrap();
        std::thread::sleep(Duration::from_millis(30));

        let start = Instant::now();
        handle.stop();
        assert!(start.elapsed() <= Duration::from_millis(150));
        assert!(!handle.is_alive());
        assert_eq!(handle.state(), WorkerState::Stopped);
    }

    #[test]
    fn test_stop_interrupts_upstream_wait() {
        let (events, rx) = event_channel();
        let input = ItemQueue::new();
        let prev = Arc::new(Baton::new("upstream"));
        let mut s = settings(true);
        s.baton_timeout = None;
        let worker = Worker::new(
            StageConfig::new("blocked", "test"),
            Box::new(FnStage::new("blocked", |x: u32| Ok::<_, StageError>(vec![x]))),
            s,
            ItemQueue::new(),
            Arc::new(Baton::new("blocked")),
        )
        .with_events(events);
        worker.set_input_queue(Some(input.clone()));
        worker.set_prev_baton(Some(prev.clone()));
        let mut handle = worker.start().unwrap();

        // Upstream never hands the baton over
        assert!(prev.try_acquire());
        input.push(1).unwrap();
        wait_for(&rx, |k| matches!(k, WorkerEventKind::ItemStarted { .. }));
        let deadline = Instant::now() + Duration::from_secs(5);
        while handle.state() != WorkerState::WaitingForUpstream && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(5));
        }
        assert_eq!(handle.state(), WorkerState::WaitingForUpstream);

        let start = Instant::now();
        handle.stop();
        assert!(start.elapsed() < Duration::from_secs(1));
        wait_for(&rx, |k| matches!(k, WorkerEventKind::ItemAbandoned { .. }));
        assert_eq!(handle.stats().abandoned, 1);
        // Still held by the test, never released by the worker
        assert!(prev.is_locked());
    }

    #[test]
    fn test_upstream_timeout_force_proceeds() {
        let input = ItemQueue::new();
        let prev = Arc::new(Baton::new("upstream"));
        let mut s = settings(true);
        s.baton_timeout = Some(Duration::from_millis(30));
        let worker = Worker::new(
            StageConfig::new("impatient", "test"),
            Box::new(FnStage::new("impatient", |x: u32| Ok::<_, StageError>(vec![x + 1]))),
            s,
            ItemQueue::new(),
            Arc::new(Baton::new("impatient")),
        );
        worker.set_input_queue(Some(input.clone()));
        worker.set_prev_baton(Some(prev.clone()));
        let output = worker.output_queue().clone();
        let mut handle = worker.start().unwrap();

        assert!(prev.try_acquire());
        input.push(1).unwrap();
        assert_eq!(output.pop(Duration::from_secs(5)).unwrap(), Some(2));
        handle.stop();

        assert_eq!(handle.stats().baton_timeouts, 1);
        assert!(prev.is_locked());
        prev.release().unwrap();
    }

    #[test]
    fn test_input_queue_wired_while_running() {
        let worker = worker_with("late", false, |x| Ok(vec![x]));
        let output = worker.output_queue().clone();
        let mut handle = worker.start().unwrap();
        std::thread::sleep(Duration::from_millis(30));
        assert_eq!(handle.state(), WorkerState::Idle);

        let input = ItemQueue::new();
        handle.set_input_queue(Some(input.clone()));
        input.push(42).unwrap();
        assert_eq!(output.pop(Duration::from_secs(5)).unwrap(), Some(42));
        handle.stop();
    }

    #[test]
    fn test_prev_baton_attach_follows_wiring() {
        let worker = worker_with("link", true, |x| Ok(vec![x]));
        let a = Arc::new(Baton::new("a"));
        let b = Arc::new(Baton::new("b"));

        worker.set_prev_baton(Some(a.clone()));
        assert!(a.is_attached());

        worker.set_prev_baton(Some(b.clone()));
        assert!(!a.is_attached());
        assert!(b.is_attached());

        let mut handle = worker.start().unwrap();
        handle.stop();
        assert!(!b.is_attached());
    }
}
