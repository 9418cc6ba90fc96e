//! Drops items that do not contain `pattern` (or that do, with `invert = true`).
//!
//! A dropped item is an empty burst: the worker still completes the handoff.

use crate::config::StageConfig;
use crate::pipeline::{PipelineError, PipelineResult, Stage, StageContext, StageError};

pub struct FilterStage {
    name: String,
    pattern: String,
    invert: bool,
}

impl FilterStage {
    pub fn from_config(config: &StageConfig) -> PipelineResult<Self> {
        let pattern = config
            .get_str("pattern")
            .ok_or_else(|| PipelineError::StageBuild {
                stage: config.name.clone(),
                message: "missing 'pattern' setting".to_string(),
            })?
            .to_string();
        Ok(Self {
            name: config.name.clone(),
            pattern,
            invert: config.get_bool("invert").unwrap_or(false),
        })
    }
}

impl Stage<String> for FilterStage {
    fn name(&self) -> &str {
        &self.name
    }

    fn process(&mut self, item: String, ctx: &mut StageContext<'_, String>) -> Result<(), StageError> {
        // Pass if: matches XOR invert
        if item.contains(self.pattern.as_str()) != self.invert {
            ctx.emit(item)?;
        }
        Ok(())
    }
}
