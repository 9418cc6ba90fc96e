//! Test stages and pipeline builders
//!
//! Items are `(source, index)` pairs: `source` is the position of the input
//! the item derives from, `index` its position inside the burst.

use super::fast_settings;
use parking_lot::Mutex;
use satflow::config::StageConfig;
use satflow::pipeline::{
    stage_factory, Pipeline, PipelineBuilder, Stage, StageContext, StageError, StageFactory,
};
use std::collections::HashSet;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

pub type Item = (u32, u32);

/// Head stage: for input `(src, _)` emits `bursts[src]` items `(src, 0..n)`.
/// Sources beyond the list emit a single item.
pub struct BurstStage {
    bursts: Vec<usize>,
    jitter: bool,
}

impl Stage<Item> for BurstStage {
    fn name(&self) -> &str {
        "burst"
    }

    fn process(&mut self, (src, _): Item, ctx: &mut StageContext<'_, Item>) -> Result<(), StageError> {
        let len = self.bursts.get(src as usize).copied().unwrap_or(1);
        for k in 0..len as u32 {
            if self.jitter {
                thread::sleep(Duration::from_micros(((src * 7 + k * 3) % 5) as u64 * 200));
            }
            ctx.emit((src, k))?;
        }
        Ok(())
    }
}

pub fn burst_factory(bursts: Vec<usize>, jitter: bool) -> StageFactory<Item> {
    stage_factory(move |_cfg: &StageConfig| {
        Ok(Box::new(BurstStage {
            bursts: bursts.clone(),
            jitter,
        }) as Box<dyn Stage<Item>>)
    })
}

/// Pass-through stage that records every input it sees.
pub struct RecordingStage {
    seen: Arc<Mutex<Vec<Item>>>,
    delay: Option<Duration>,
}

impl Stage<Item> for RecordingStage {
    fn name(&self) -> &str {
        "recording"
    }

    fn process(&mut self, item: Item, ctx: &mut StageContext<'_, Item>) -> Result<(), StageError> {
        self.seen.lock().push(item);
        if let Some(delay) = self.delay {
            thread::sleep(delay);
        }
        ctx.emit(item)?;
        Ok(())
    }
}

pub fn recording_factory(
    seen: Arc<Mutex<Vec<Item>>>,
    delay: Option<Duration>,
) -> StageFactory<Item> {
    stage_factory(move |_cfg: &StageConfig| {
        Ok(Box::new(RecordingStage {
            seen: seen.clone(),
            delay,
        }) as Box<dyn Stage<Item>>)
    })
}

/// Emits part of the burst, then fails for the listed sources.
pub struct FailingStage {
    fail_on: HashSet<u32>,
}

impl Stage<Item> for FailingStage {
    fn name(&self) -> &str {
        "failing"
    }

    fn process(&mut self, (src, _): Item, ctx: &mut StageContext<'_, Item>) -> Result<(), StageError> {
        ctx.emit((src, 0))?;
        if self.fail_on.contains(&src) {
            return Err(StageError::failed(format!("source {} is corrupt", src)));
        }
        ctx.emit((src, 1))?;
        Ok(())
    }
}

pub fn failing_factory(fail_on: &[u32]) -> StageFactory<Item> {
    let fail_on: HashSet<u32> = fail_on.iter().copied().collect();
    stage_factory(move |_cfg: &StageConfig| {
        Ok(Box::new(FailingStage {
            fail_on: fail_on.clone(),
        }) as Box<dyn Stage<Item>>)
    })
}

/// Builder for a test chain with recorded stage inputs
pub struct ChainBuilder {
    use_lock: bool,
    stages: Vec<(String, StageFactory<Item>)>,
    events: bool,
}

impl ChainBuilder {
    pub fn new(use_lock: bool) -> Self {
        Self {
            use_lock,
            stages: Vec::new(),
            events: false,
        }
    }

    pub fn stage(mut self, name: &str, factory: StageFactory<Item>) -> Self {
        self.stages.push((name.to_string(), factory));
        self
    }

    pub fn with_events(mut self) -> Self {
        self.events = true;
        self
    }

    pub fn build(self) -> Pipeline<Item> {
        let mut builder = PipelineBuilder::new("test-chain").settings(fast_settings(self.use_lock));
        for (name, factory) in self.stages {
            builder = builder.stage(StageConfig::new(name, "test"), factory);
        }
        if self.events {
            builder = builder.with_events();
        }
        builder.build().expect("test chain should build")
    }
}

/// Push `count` inputs `(0, 0)..(count-1, 0)`.
pub fn feed(pipeline: &Pipeline<Item>, count: u32) {
    for src in 0..count {
        pipeline.push((src, 0)).expect("push input");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_chain_builder() {
        let pipeline = ChainBuilder::new(true)
            .stage("a", burst_factory(vec![2], false))
            .stage("b", recording_factory(Arc::new(Mutex::new(Vec::new())), None))
            .build();
        assert_eq!(pipeline.stage_names(), vec!["a", "b"]);
        assert!(pipeline.use_lock());
    }
}
