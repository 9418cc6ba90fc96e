//! Forwards every item unchanged.

use crate::config::StageConfig;
use crate::pipeline::{Stage, StageContext, StageError};

pub struct PassthroughStage {
    name: String,
}

impl PassthroughStage {
    pub fn from_config(config: &StageConfig) -> Self {
        Self {
            name: config.name.clone(),
        }
    }
}

impl<T> Stage<T> for PassthroughStage {
    fn name(&self) -> &str {
        &self.name
    }

    fn process(&mut self, item: T, ctx: &mut StageContext<'_, T>) -> Result<(), StageError> {
        ctx.emit(item)?;
        Ok(())
    }
}
