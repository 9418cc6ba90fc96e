//! Splits one text item into several on a separator.
//!
//! Settings: `separator` (default `","`), `trim` (default `true`),
//! `skip_empty` (default `true`).

use crate::config::StageConfig;
use crate::pipeline::{PipelineError, PipelineResult, Stage, StageContext, StageError};

pub struct SplitStage {
    name: String,
    separator: String,
    trim: bool,
    skip_empty: bool,
}

impl SplitStage {
    pub fn from_config(config: &StageConfig) -> PipelineResult<Self> {
        let separator = config.get_str("separator").unwrap_or(",").to_string();
        if separator.is_empty() {
            return Err(PipelineError::StageBuild {
                stage: config.name.clone(),
                message: "separator must not be empty".to_string(),
            });
        }
        Ok(Self {
            name: config.name.clone(),
            separator,
            trim: config.get_bool("trim").unwrap_or(true),
            skip_empty: config.get_bool("skip_empty").unwrap_or(true),
        })
    }
}

impl Stage<String> for SplitStage {
    fn name(&self) -> &str {
        &self.name
    }

    fn process(&mut self, item: String, ctx: &mut StageContext<'_, String>) -> Result<(), StageError> {
        for part in item.split(self.separator.as_str()) {
            let part = if self.trim { part.trim() } else { part };
            if self.skip_empty && part.is_empty() {
                continue;
            }
            ctx.emit(part.to_string())?;
        }
        Ok(())
    }
}
