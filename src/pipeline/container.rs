//! Container: lifecycle owner for one worker.
//!
//! A container keeps everything that must survive a worker restart: the stage
//! factory and config, the output queue, the own baton and the wiring links.
//! Restarting builds a fresh stage instance and a fresh thread around the same
//! queues, so neighbours never need to be rewired.

use crate::config::StageConfig;
use crate::pipeline::baton::Baton;
use crate::pipeline::error::{PipelineError, PipelineResult};
use crate::pipeline::event::EventSender;
use crate::pipeline::queue::ItemQueue;
use crate::pipeline::stage::StageFactory;
use crate::pipeline::worker::{
    StageStats, Worker, WorkerHandle, WorkerLinks, WorkerSettings, WorkerState, WorkerStats,
};
use std::sync::Arc;

pub struct Container<T> {
    config: StageConfig,
    factory: StageFactory<T>,
    settings: WorkerSettings,
    output: ItemQueue<T>,
    baton: Arc<Baton>,
    links: Arc<WorkerLinks<T>>,
    stats: Arc<WorkerStats>,
    events: EventSender,
    handle: Option<WorkerHandle<T>>,
}

impl<T: Send + 'static> Container<T> {
    /// Create a stopped container with a new output queue and baton.
    pub fn new(config: StageConfig, factory: StageFactory<T>, settings: WorkerSettings) -> Self {
        let baton = Arc::new(Baton::new(config.name.clone()));
        Self {
            config,
            factory,
            settings,
            output: ItemQueue::new(),
            baton,
            links: Arc::new(WorkerLinks::new()),
            stats: Arc::new(WorkerStats::default()),
            events: EventSender::disabled(),
            handle: None,
        }
    }

    /// Use an existing output queue and baton (the tail of a pipeline).
    pub fn with_output(mut self, output: ItemQueue<T>, baton: Arc<Baton>) -> Self {
        self.output = output;
        self.baton = baton;
        self
    }

    pub fn with_events(mut self, events: EventSender) -> Self {
        self.events = events;
        self
    }

    /// Build a fresh stage and start a worker thread around it.
    pub fn start(&mut self) -> PipelineResult<()> {
        if self.handle.is_some() {
            return Err(PipelineError::AlreadyRunning(self.config.name.clone()));
        }

        let stage = (self.factory)(&self.config)?;
        let worker = Worker::new(
            self.config.clone(),
            stage,
            self.settings.clone(),
            self.output.clone(),
            self.baton.clone(),
        )
        .with_links(self.links.clone())
        .with_stats(self.stats.clone())
        .with_events(self.events.clone());

        self.handle = Some(worker.start()?);
        tracing::info!("Container '{}' started ({})", self.config.name, self.config.kind);
        Ok(())
    }

    /// Stop and join the worker. Calling it on a stopped container is a no-op.
    pub fn stop(&mut self) {
        if let Some(mut handle) = self.handle.take() {
            handle.stop();
            tracing::info!("Container '{}' stopped", self.config.name);
        }
    }

    /// Signal the worker without joining it.
    pub fn request_stop(&self) {
        if let Some(handle) = &self.handle {
            handle.request_stop();
        }
    }

    pub fn restart(&mut self) -> PipelineResult<()> {
        self.stop();
        self.start()
    }

    /// Swap in a new config and factory. A running worker is restarted with them.
    pub fn reload(&mut self, config: StageConfig, factory: StageFactory<T>) -> PipelineResult<()> {
        let was_running = self.handle.is_some();
        self.stop();
        self.config = config;
        self.factory = factory;
        if was_running {
            self.start()?;
        }
        Ok(())
    }

    /// Replace protocol settings; they apply from the next start.
    pub fn set_settings(&mut self, settings: WorkerSettings) {
        self.settings = settings;
    }

    /// True while the worker thread is running.
    pub fn is_alive(&self) -> bool {
        self.handle.as_ref().is_some_and(WorkerHandle::is_alive)
    }

    pub fn is_started(&self) -> bool {
        self.handle.is_some()
    }

    pub fn set_input_queue(&self, queue: Option<ItemQueue<T>>) {
        self.links.set_input_queue(queue);
    }

    pub fn set_prev_baton(&self, baton: Option<Arc<Baton>>) {
        self.links.set_prev_baton(baton);
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    pub fn config(&self) -> &StageConfig {
        &self.config
    }

    pub fn output_queue(&self) -> &ItemQueue<T> {
        &self.output
    }

    pub fn baton(&self) -> &Arc<Baton> {
        &self.baton
    }

    pub fn state(&self) -> WorkerState {
        self.handle
            .as_ref()
            .map(WorkerHandle::state)
            .unwrap_or(WorkerState::Stopped)
    }

    /// Counters accumulated across restarts.
    pub fn stats(&self) -> StageStats {
        self.stats.snapshot(&self.config.name)
    }
}
