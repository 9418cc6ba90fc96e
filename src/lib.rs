//! # satflow: ordered multi-stage worker pipeline
//!
//! A chain of independently threaded stages passing items through queues.
//! Each stage consumes one item and may fan out zero, one or many items. With
//! strict ordering enabled, a lock-handoff ("baton") protocol between adjacent
//! workers guarantees that every output derived from input K appears
//! downstream before any output derived from input K+1, across the whole
//! chain, while stages still run on their own threads.
//!
//! ## Architecture
//!
//! - **Pipeline**: builds and wires [`pipeline::Container`]s, owns the
//!   producer input queue, the tail queue and the tail baton
//! - **Worker**: one thread per stage running the handoff protocol
//! - **Stages**: domain logic behind the [`pipeline::Stage`] trait, built from
//!   configuration through a [`pipeline::StageRegistry`]
//! - **Communication**: crossbeam channels for queues and monitoring events
//!
//! ## Example
//!
//! ```no_run
//! use satflow::config::{ConfigValue, PipelineConfig, StageConfig};
//! use satflow::pipeline::PipelineBuilder;
//! use satflow::stages::builtin_registry;
//! use std::time::Duration;
//!
//! fn main() -> anyhow::Result<()> {
//!     let config = PipelineConfig::new("demo")
//!         .with_lock(true)
//!         .with_stage(
//!             StageConfig::new("segments", "split")
//!                 .with_setting("separator", ConfigValue::from(",")),
//!         )
//!         .with_stage(StageConfig::new("writer", "passthrough"));
//!
//!     let mut pipeline = PipelineBuilder::from_config(&config, &builtin_registry())?.build()?;
//!     let sink = pipeline.sink();
//!     pipeline.start()?;
//!
//!     pipeline.push("a,b".to_string())?;
//!     pipeline.push("c".to_string())?;
//!     for item in sink.collect(3, Duration::from_secs(1))? {
//!         println!("{}", item);
//!     }
//!
//!     pipeline.stop();
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod error;
pub mod pipeline;
pub mod stages;

// Re-export commonly used types
pub use config::{PipelineConfig, StageConfig};
pub use error::{Result, SatflowError};
pub use pipeline::{Pipeline, PipelineBuilder, PipelineError, Stage, StageError};
