//! Error handling for satflow
//!
//! This module defines the crate-level error type and a Result alias used by
//! the configuration layer and the binary. Errors raised inside the worker
//! threads live in [`crate::pipeline::error`].

use crate::pipeline::PipelineError;
use thiserror::Error;

/// Main error type for satflow operations
#[derive(Error, Debug)]
pub enum SatflowError {
    /// Errors related to configuration loading/saving/validation
    #[error("Configuration error: {0}")]
    Config(String),

    /// Errors raised by the pipeline runtime
    #[error("Pipeline error: {0}")]
    Pipeline(#[from] PipelineError),

    /// TOML parse errors
    #[error("TOML parse error: {0}")]
    TomlParse(#[from] toml::de::Error),

    /// TOML serialization errors
    #[error("TOML serialization error: {0}")]
    TomlSerialize(#[from] toml::ser::Error),

    /// IO errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Generic errors with context
    #[error("{context}: {source}")]
    WithContext {
        context: String,
        #[source]
        source: Box<SatflowError>,
    },
}

impl SatflowError {
    /// Add context to an error
    pub fn with_context(self, context: impl Into<String>) -> Self {
        SatflowError::WithContext {
            context: context.into(),
            source: Box::new(self),
        }
    }
}

/// Result type alias for satflow operations
pub type Result<T> = std::result::Result<T, SatflowError>;

/// Extension trait for adding context to Results
pub trait ResultExt<T> {
    /// Add context to an error result
    fn context(self, context: impl Into<String>) -> Result<T>;

    /// Add context lazily to an error result
    fn with_context<F>(self, f: F) -> Result<T>
    where
        F: FnOnce() -> String;
}

impl<T, E> ResultExt<T> for std::result::Result<T, E>
where
    E: Into<SatflowError>,
{
    fn context(self, context: impl Into<String>) -> Result<T> {
        self.map_err(|e| e.into().with_context(context))
    }

    fn with_context<F>(self, f: F) -> Result<T>
    where
        F: FnOnce() -> String,
    {
        self.map_err(|e| e.into().with_context(f()))
    }
}
