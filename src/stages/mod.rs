//! Built-in stages for text items.
//!
//! These cover the shapes a stage can take: pass one item through
//! (`passthrough`), fan out (`split`, `repeat`), drop (`filter`), and batch
//! until an end-of-burst marker ([`Batcher`]).

mod batch;
mod filter;
mod passthrough;
mod repeat;
mod split;

pub use batch::Batcher;
pub use filter::FilterStage;
pub use passthrough::PassthroughStage;
pub use repeat::RepeatStage;
pub use split::SplitStage;

use crate::pipeline::{Stage, StageRegistry};

/// Registry with every built-in text stage registered under its kind.
pub fn builtin_registry() -> StageRegistry<String> {
    let mut registry = StageRegistry::new();
    registry
        .register("passthrough", |cfg| {
            Ok(Box::new(PassthroughStage::from_config(cfg)) as Box<dyn Stage<String>>)
        })
        .register("split", |cfg| {
            Ok(Box::new(SplitStage::from_config(cfg)?) as Box<dyn Stage<String>>)
        })
        .register("repeat", |cfg| {
            Ok(Box::new(RepeatStage::from_config(cfg)?) as Box<dyn Stage<String>>)
        })
        .register("filter", |cfg| {
            Ok(Box::new(FilterStage::from_config(cfg)?) as Box<dyn Stage<String>>)
        });
    registry
}
