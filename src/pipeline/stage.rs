//! Stage abstraction: the domain logic a worker wraps.
//!
//! A stage consumes one item and emits a burst of zero or more items through
//! its [`StageContext`]. Emission is streaming: each `emit` runs the handoff
//! for that item immediately, so a stage that fails halfway leaves a partial
//! burst downstream and the worker still completes the protocol for it.
//!
//! Stages are created from a [`StageConfig`] by a [`StageFactory`], looked up
//! by kind in a [`StageRegistry`].

use crate::config::StageConfig;
use crate::pipeline::error::{PipelineError, PipelineResult, StageError};
use std::collections::HashMap;
use std::sync::Arc;

/// Receives the items of one burst, in emission order.
pub trait BurstSink<T> {
    fn emit(&mut self, item: T) -> PipelineResult<()>;

    /// Items emitted so far in this burst.
    fn emitted(&self) -> usize;
}

/// Collecting sink, handy for driving a stage outside a worker.
impl<T> BurstSink<T> for Vec<T> {
    fn emit(&mut self, item: T) -> PipelineResult<()> {
        self.push(item);
        Ok(())
    }

    fn emitted(&self) -> usize {
        self.len()
    }
}

/// Per-item context passed to [`Stage::process`].
pub struct StageContext<'a, T> {
    config: &'a StageConfig,
    sequence: u64,
    sink: &'a mut dyn BurstSink<T>,
}

impl<'a, T> StageContext<'a, T> {
    pub fn new(config: &'a StageConfig, sequence: u64, sink: &'a mut dyn BurstSink<T>) -> Self {
        Self {
            config,
            sequence,
            sink,
        }
    }

    /// Emit one item of the burst.
    pub fn emit(&mut self, item: T) -> PipelineResult<()> {
        self.sink.emit(item)
    }

    pub fn emit_all<I>(&mut self, items: I) -> PipelineResult<()>
    where
        I: IntoIterator<Item = T>,
    {
        for item in items {
            self.sink.emit(item)?;
        }
        Ok(())
    }

    pub fn emitted(&self) -> usize {
        self.sink.emitted()
    }

    pub fn config(&self) -> &'a StageConfig {
        self.config
    }

    pub fn stage_name(&self) -> &str {
        &self.config.name
    }

    /// Zero-based index of the input item within this worker's lifetime.
    pub fn sequence(&self) -> u64 {
        self.sequence
    }
}

/// Domain transform from one item to a burst of items.
pub trait Stage<T>: Send {
    /// Human-readable kind of this stage.
    fn name(&self) -> &str;

    /// Process one input item, emitting its burst through `ctx`.
    fn process(&mut self, item: T, ctx: &mut StageContext<'_, T>) -> Result<(), StageError>;

    /// Called on the worker thread before the first item.
    fn on_start(&mut self, _config: &StageConfig) {}

    /// Called on the worker thread after the loop exits.
    fn on_stop(&mut self) {}
}

/// Stage built from a closure returning the whole burst.
pub struct FnStage<F> {
    name: String,
    func: F,
}

impl<F> FnStage<F> {
    pub fn new(name: impl Into<String>, func: F) -> Self {
        Self {
            name: name.into(),
            func,
        }
    }
}

impl<T, F> Stage<T> for FnStage<F>
where
    F: FnMut(T) -> Result<Vec<T>, StageError> + Send,
{
    fn name(&self) -> &str {
        &self.name
    }

    fn process(&mut self, item: T, ctx: &mut StageContext<'_, T>) -> Result<(), StageError> {
        let burst = (self.func)(item)?;
        ctx.emit_all(burst)?;
        Ok(())
    }
}

/// Builds a fresh stage instance from its configuration.
pub type StageFactory<T> =
    Arc<dyn Fn(&StageConfig) -> PipelineResult<Box<dyn Stage<T>>> + Send + Sync>;

/// Wrap a closure as a [`StageFactory`].
pub fn stage_factory<T, F>(f: F) -> StageFactory<T>
where
    F: Fn(&StageConfig) -> PipelineResult<Box<dyn Stage<T>>> + Send + Sync + 'static,
{
    Arc::new(f)
}

/// Stage kinds available to configuration-driven pipelines.
pub struct StageRegistry<T> {
    factories: HashMap<String, StageFactory<T>>,
}

impl<T> StageRegistry<T> {
    pub fn new() -> Self {
        Self {
            factories: HashMap::new(),
        }
    }

    /// Register a factory under `kind`, replacing any previous one.
    pub fn register<F>(&mut self, kind: impl Into<String>, f: F) -> &mut Self
    where
        F: Fn(&StageConfig) -> PipelineResult<Box<dyn Stage<T>>> + Send + Sync + 'static,
    {
        self.factories.insert(kind.into(), Arc::new(f));
        self
    }

    pub fn factory(&self, kind: &str) -> PipelineResult<StageFactory<T>> {
        self.factories
            .get(kind)
            .cloned()
            .ok_or_else(|| PipelineError::UnknownStageKind(kind.to_string()))
    }

    pub fn create(&self, config: &StageConfig) -> PipelineResult<Box<dyn Stage<T>>> {
        (self.factory(&config.kind)?)(config)
    }

    pub fn contains(&self, kind: &str) -> bool {
        self.factories.contains_key(kind)
    }

    /// Registered kinds, sorted.
    pub fn kinds(&self) -> Vec<&str> {
        let mut kinds: Vec<&str> = self.factories.keys().map(String::as_str).collect();
        kinds.sort_unstable();
        kinds
    }
}

impl<T> Default for StageRegistry<T> {
    fn default() -> Self {
        Self::new()
    }
}
