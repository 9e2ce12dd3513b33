//! Error types for astack.
//!
//! Taxonomy:
//! - Expected failures: bad input, unknown arrays, values that do not fit a dtype
//! - Run failures: provisioning or per-item computation aborted the batch
//! - Infrastructure failures: filesystem I/O
//! - Invariant violations: bugs, should not happen

use super::{ConfigError, FunctionError, TypeError};
use thiserror::Error;

/// Top-level error type for astack.
#[derive(Debug, Error)]
pub enum AstackError {
    // ═══════════════════════════════════════════════════════════════════
    // EXPECTED — bad input or a store that does not look like we assumed
    // ═══════════════════════════════════════════════════════════════════

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Parse error: {0}")]
    ParseError(String),

    #[error("Array not found: {0}")]
    ArrayNotFound(String),

    #[error("Array already exists: {0}")]
    ArrayExists(String),

    #[error("Invalid array name: '{0}'")]
    InvalidArrayName(String),

    #[error("Type error: {0}")]
    Type(#[from] TypeError),

    #[error("Index {index} out of bounds for array '{name}' of length {len}")]
    IndexOutOfBounds { name: String, index: u64, len: u64 },

    #[error("Cannot resize '{name}' to {requested}: growth bound is {max}")]
    ResizeExceedsBound { name: String, requested: u64, max: u64 },

    #[error("Cannot shrink '{name}' to {requested}: {processed} items already processed")]
    ShrinkBelowWatermark {
        name: String,
        requested: u64,
        processed: u64,
    },

    // ═══════════════════════════════════════════════════════════════════
    // RUN — the batch was aborted
    // ═══════════════════════════════════════════════════════════════════

    #[error("Failed to provision dataset '{dataset}': {source}")]
    Provisioning {
        dataset: String,
        #[source]
        source: Box<AstackError>,
    },

    #[error("Encountered error while running '{dataset}' at index {index}: {source}")]
    Computation {
        dataset: String,
        index: u64,
        #[source]
        source: FunctionError,
    },

    // ═══════════════════════════════════════════════════════════════════
    // INFRASTRUCTURE
    // ═══════════════════════════════════════════════════════════════════

    #[error("IO error: {context}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },

    // ═══════════════════════════════════════════════════════════════════
    // INVARIANT VIOLATED — bug, should not happen
    // ═══════════════════════════════════════════════════════════════════

    #[error("Watermark of '{name}' cannot move back from {current} to {requested}")]
    WatermarkRegression {
        name: String,
        current: u64,
        requested: u64,
    },

    #[error("Internal error: {0}")]
    Internal(String),
}

impl AstackError {
    /// Create an IO error with context.
    pub fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        Self::Io {
            context: context.into(),
            source,
        }
    }

    /// Wrap a store failure hit while provisioning `dataset`.
    pub fn provisioning(dataset: impl Into<String>, source: AstackError) -> Self {
        Self::Provisioning {
            dataset: dataset.into(),
            source: Box::new(source),
        }
    }

    /// Name of the dataset whose provisioning or computation aborted the run.
    pub fn dataset(&self) -> Option<&str> {
        match self {
            Self::Provisioning { dataset, .. } | Self::Computation { dataset, .. } => {
                Some(dataset)
            }
            _ => None,
        }
    }

    /// Recover the error returned by the item function, unchanged.
    ///
    /// Returns `Err(self)` for anything that is not a computation failure.
    pub fn into_function_error(self) -> std::result::Result<FunctionError, Self> {
        match self {
            Self::Computation { source, .. } => Ok(source),
            other => Err(other),
        }
    }
}

/// Result type alias for astack.
pub type Result<T> = std::result::Result<T, AstackError>;
