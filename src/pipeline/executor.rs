//! Pipeline executor: builds, wires and drives a chain of containers.
//!
//! ```text
//! producer ─► input ─► [stage 0] ─► q0 ─► [stage 1] ─► ... ─► output ─► OrderedSink
//!                       baton 0 ◄──────── prev_baton
//! ```
//!
//! The pipeline owns the producer-facing input queue, the consumer-facing
//! output queue and the tail baton. They survive restarts and reloads, so
//! producers and sinks can be held across them.

use crate::config::{PipelineConfig, StageConfig};
use crate::pipeline::baton::Baton;
use crate::pipeline::container::Container;
use crate::pipeline::error::{PipelineError, PipelineResult};
use crate::pipeline::event::{event_channel, EventSender, WorkerEvent};
use crate::pipeline::queue::ItemQueue;
use crate::pipeline::sink::OrderedSink;
use crate::pipeline::stage::{StageFactory, StageRegistry};
use crate::pipeline::worker::{StageStats, WorkerSettings};
use crossbeam_channel::Receiver;
use std::collections::HashSet;
use std::sync::Arc;

/// Wire adjacent containers: each one reads the previous one's output queue
/// and, with locking on, waits on its baton.
///
/// Only call this while the affected workers are stopped, or when the change
/// is a plain rewire of a stopped neighbour.
pub fn connect<T: Send + 'static>(containers: &[Container<T>], use_lock: bool) {
    for pair in containers.windows(2) {
        let (upstream, downstream) = (&pair[0], &pair[1]);
        downstream.set_input_queue(Some(upstream.output_queue().clone()));
        downstream.set_prev_baton(use_lock.then(|| upstream.baton().clone()));
        tracing::debug!(
            "Connected '{}' -> '{}' (lock: {})",
            upstream.name(),
            downstream.name(),
            use_lock
        );
    }
}

pub struct Pipeline<T> {
    name: String,
    settings: WorkerSettings,
    containers: Vec<Container<T>>,
    input: ItemQueue<T>,
    output: ItemQueue<T>,
    tail_baton: Arc<Baton>,
    events: EventSender,
    event_rx: Option<Receiver<WorkerEvent>>,
    running: bool,
}

impl<T: Send + 'static> Pipeline<T> {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn use_lock(&self) -> bool {
        self.settings.use_lock
    }

    pub fn settings(&self) -> &WorkerSettings {
        &self.settings
    }

    pub fn len(&self) -> usize {
        self.containers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.containers.is_empty()
    }

    pub fn stage_names(&self) -> Vec<&str> {
        self.containers.iter().map(Container::name).collect()
    }

    pub fn container(&self, name: &str) -> Option<&Container<T>> {
        self.containers.iter().find(|c| c.name() == name)
    }

    /// Start every worker, head first. On failure the ones already started are
    /// stopped again.
    pub fn start(&mut self) -> PipelineResult<()> {
        if self.running {
            return Err(PipelineError::AlreadyRunning(self.name.clone()));
        }
        tracing::info!(
            "Starting pipeline '{}' with {} stage(s), lock {}",
            self.name,
            self.containers.len(),
            if self.settings.use_lock { "on" } else { "off" }
        );

        for i in 0..self.containers.len() {
            if let Err(e) = self.containers[i].start() {
                tracing::error!(
                    "Stage '{}' failed to start: {}",
                    self.containers[i].name(),
                    e
                );
                self.stop_all();
                return Err(e);
            }
        }
        self.running = true;
        Ok(())
    }

    /// Signal every worker, then join them. Idempotent.
    pub fn stop(&mut self) {
        if !self.running {
            return;
        }
        self.stop_all();
        self.running = false;
        tracing::info!("Pipeline '{}' stopped", self.name);
    }

    fn stop_all(&mut self) {
        for container in &self.containers {
            container.request_stop();
        }
        for container in &mut self.containers {
            container.stop();
        }
    }

    pub fn is_running(&self) -> bool {
        self.running
    }

    /// True when every worker thread is alive.
    pub fn is_alive(&self) -> bool {
        self.running && self.containers.iter().all(Container::is_alive)
    }

    /// Restart a single stage in place. Its queues and batons are kept.
    pub fn restart_stage(&mut self, name: &str) -> PipelineResult<()> {
        let container = self
            .containers
            .iter_mut()
            .find(|c| c.name() == name)
            .ok_or_else(|| PipelineError::UnknownStage(name.to_string()))?;
        tracing::info!("Restarting stage '{}'", name);
        container.restart()
    }

    /// Rebuild the chain from a new configuration.
    ///
    /// All workers are stopped, the stage list is rebuilt and rewired around
    /// the same input queue, output queue and tail baton, then restarted if the
    /// pipeline was running. Items still sitting in intermediate queues are
    /// discarded.
    pub fn reload(&mut self, config: &PipelineConfig, registry: &StageRegistry<T>) -> PipelineResult<()> {
        config
            .validate()
            .map_err(|e| PipelineError::InvalidTopology(e.to_string()))?;
        let stages = resolve_factories(config, registry)?;

        let was_running = self.running;
        self.stop();

        let discarded: usize = self
            .containers
            .iter()
            .take(self.containers.len().saturating_sub(1))
            .map(|c| c.output_queue().drain().len())
            .sum();
        if discarded > 0 {
            tracing::warn!(
                "Reload of '{}' discarded {} in-flight item(s)",
                self.name,
                discarded
            );
        }

        self.name = config.name.clone();
        self.settings = config.worker_settings();
        self.containers = assemble(
            stages,
            &self.settings,
            &self.input,
            &self.output,
            &self.tail_baton,
            &self.events,
        );
        tracing::info!("Pipeline '{}' reloaded: {:?}", self.name, self.stage_names());

        if was_running {
            self.start()?;
        }
        Ok(())
    }

    /// Producer-facing queue feeding the first stage.
    pub fn input(&self) -> &ItemQueue<T> {
        &self.input
    }

    pub fn push(&self, item: T) -> PipelineResult<()> {
        self.input.push(item)
    }

    /// Raw output queue of the last stage. Use [`Pipeline::sink`] to take part
    /// in the ordering handoff.
    pub fn output(&self) -> &ItemQueue<T> {
        &self.output
    }

    /// Consumer for the last queue, locked when the pipeline is.
    pub fn sink(&self) -> OrderedSink<T> {
        if self.settings.use_lock {
            OrderedSink::locked(
                self.output.clone(),
                self.tail_baton.clone(),
                self.settings.baton_timeout,
            )
        } else {
            OrderedSink::unlocked(self.output.clone())
        }
    }

    /// Take the event stream. Only available when built with events enabled,
    /// and only once. Events are dropped while the buffer is full.
    pub fn take_events(&mut self) -> Option<Receiver<WorkerEvent>> {
        self.event_rx.take()
    }

    pub fn stats(&self) -> Vec<StageStats> {
        self.containers.iter().map(Container::stats).collect()
    }

    /// True once every stage has finished everything fed to it, given that
    /// `fed` items were pushed into the input queue in total.
    ///
    /// Stages are checked head first, so a finished stage's emitted count is
    /// final by the time its downstream neighbour is compared against it.
    /// Items still waiting in the output queue are not considered.
    pub fn is_drained(&self, fed: u64) -> bool {
        let mut expected = fed;
        for container in &self.containers {
            let stats = container.stats();
            if stats.completed != expected {
                return false;
            }
            expected = stats.emitted;
        }
        true
    }
}

fn resolve_factories<T>(
    config: &PipelineConfig,
    registry: &StageRegistry<T>,
) -> PipelineResult<Vec<(StageConfig, StageFactory<T>)>> {
    config
        .stages
        .iter()
        .map(|stage| Ok((stage.clone(), registry.factory(&stage.kind)?)))
        .collect()
}

fn assemble<T: Send + 'static>(
    stages: Vec<(StageConfig, StageFactory<T>)>,
    settings: &WorkerSettings,
    input: &ItemQueue<T>,
    output: &ItemQueue<T>,
    tail_baton: &Arc<Baton>,
    events: &EventSender,
) -> Vec<Container<T>> {
    let last = stages.len().saturating_sub(1);
    let containers: Vec<Container<T>> = stages
        .into_iter()
        .enumerate()
        .map(|(i, (config, factory))| {
            let container =
                Container::new(config, factory, settings.clone()).with_events(events.clone());
            if i == last {
                container.with_output(output.clone(), tail_baton.clone())
            } else {
                container
            }
        })
        .collect();

    if let Some(head) = containers.first() {
        head.set_input_queue(Some(input.clone()));
        head.set_prev_baton(None);
    }
    connect(&containers, settings.use_lock);
    containers
}

/// Builds a [`Pipeline`] from explicit stages or from configuration.
pub struct PipelineBuilder<T> {
    name: String,
    settings: WorkerSettings,
    stages: Vec<(StageConfig, StageFactory<T>)>,
    events: bool,
}

impl<T: Send + 'static> PipelineBuilder<T> {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            settings: WorkerSettings::default(),
            stages: Vec::new(),
            events: false,
        }
    }

    /// Resolve every stage kind in `config` against `registry`.
    pub fn from_config(config: &PipelineConfig, registry: &StageRegistry<T>) -> PipelineResult<Self> {
        config
            .validate()
            .map_err(|e| PipelineError::InvalidTopology(e.to_string()))?;
        Ok(Self {
            name: config.name.clone(),
            settings: config.worker_settings(),
            stages: resolve_factories(config, registry)?,
            events: false,
        })
    }

    pub fn settings(mut self, settings: WorkerSettings) -> Self {
        self.settings = settings;
        self
    }

    pub fn use_lock(mut self, use_lock: bool) -> Self {
        self.settings.use_lock = use_lock;
        self
    }

    pub fn stage(mut self, config: StageConfig, factory: StageFactory<T>) -> Self {
        self.stages.push((config, factory));
        self
    }

    /// Collect worker events, available through [`Pipeline::take_events`].
    ///
    /// Up to [`EVENT_CAPACITY`](crate::pipeline::EVENT_CAPACITY) unread events
    /// are buffered; later ones are dropped until the receiver catches up.
    pub fn with_events(mut self) -> Self {
        self.events = true;
        self
    }

    pub fn build(self) -> PipelineResult<Pipeline<T>> {
        if self.stages.is_empty() {
            return Err(PipelineError::InvalidTopology(
                "pipeline needs at least one stage".to_string(),
            ));
        }
        let mut seen = HashSet::new();
        for (config, _) in &self.stages {
            if !seen.insert(config.name.as_str()) {
                return Err(PipelineError::InvalidTopology(format!(
                    "duplicate stage name '{}'",
                    config.name
                )));
            }
        }

        let (events, event_rx) = if self.events {
            let (tx, rx) = event_channel();
            (tx, Some(rx))
        } else {
            (EventSender::disabled(), None)
        };

        let input = ItemQueue::new();
        let output = ItemQueue::new();
        let tail_baton = Arc::new(Baton::new(format!("{}.tail", self.name)));
        let containers = assemble(
            self.stages,
            &self.settings,
            &input,
            &output,
            &tail_baton,
            &events,
        );

        Ok(Pipeline {
            name: self.name,
            settings: self.settings,
            containers,
            input,
            output,
            tail_baton,
            events,
            event_rx,
            running: false,
        })
    }
}
