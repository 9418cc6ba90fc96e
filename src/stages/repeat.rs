//! Emits each item `count` times. `count = 0` drops every item.

use crate::config::StageConfig;
use crate::pipeline::{PipelineError, PipelineResult, Stage, StageContext, StageError};

pub struct RepeatStage {
    name: String,
    count: usize,
}

impl RepeatStage {
    pub fn from_config(config: &StageConfig) -> PipelineResult<Self> {
        let count = config.get_int("count").unwrap_or(1);
        let count = usize::try_from(count).map_err(|_| PipelineError::StageBuild {
            stage: config.name.clone(),
            message: format!("count must be non-negative, got {}", count),
        })?;
        Ok(Self {
            name: config.name.clone(),
            count,
        })
    }
}

impl<T: Clone> Stage<T> for RepeatStage {
    fn name(&self) -> &str {
        &self.name
    }

    fn process(&mut self, item: T, ctx: &mut StageContext<'_, T>) -> Result<(), StageError> {
        if self.count == 0 {
            return Ok(());
        }
        for _ in 1..self.count {
            ctx.emit(item.clone())?;
        }
        ctx.emit(item)?;
        Ok(())
    }
}
