//! Error types for compute execution

use thiserror::Error;

use crate::graph::ValueId;

/// A failed call into a compute backend
///
/// Every driver status other than success is collapsed into this type:
/// the operation that failed plus whatever the backend could say about it.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{operation} failed: {message}")]
pub struct BackendError {
    /// Name of the backend operation (e.g. `cuMemAlloc`, `allocate`)
    pub operation: String,
    /// Backend supplied description
    pub message: String,
}

impl BackendError {
    pub fn new(operation: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            operation: operation.into(),
            message: message.into(),
        }
    }
}

/// Main error type for a compute execution
#[derive(Debug, Error)]
pub enum ComputeError {
    /// A backend/driver call failed
    #[error("backend error: {0}")]
    Backend(#[from] BackendError),

    /// The reflected program does not have exactly one entry point
    #[error("expected exactly one entry point, found {0}")]
    EntryPointCount(usize),

    /// The compiled program has no compute-stage kernel
    #[error("compiled program has no compute kernel")]
    MissingComputeKernel,

    /// A value was given a second device allocation
    #[error("value {0} already has a device allocation")]
    DuplicateAllocation(ValueId),

    /// A pointer slot does not fit inside its parameter block
    #[error("slot at offset {offset} (+{width} bytes) is outside value {container} of {size} bytes")]
    SlotOutOfBounds {
        container: ValueId,
        offset: usize,
        width: usize,
        size: usize,
    },

    /// The reflected thread group cannot run as a single block on this device
    #[error("thread group {requested:?} has {threads} threads, kernel allows at most {max}")]
    ThreadGroupTooLarge {
        requested: [u32; 3],
        threads: u64,
        max: u32,
    },

    /// A resource shape the engine cannot back with device memory (strict mode only)
    #[error("unsupported resource for value {value}: {shape}")]
    UnsupportedResource { value: ValueId, shape: String },

    /// The resource layout does not match the reflection
    #[error("layout error: {0}")]
    Layout(String),

    /// Reflection metadata could not be parsed
    #[error("reflection parse error: {0}")]
    Reflection(#[from] serde_json::Error),

    /// Invalid configuration value
    #[error("invalid configuration: {0}")]
    Config(String),
}

/// Specialized Result type for compute operations
pub type Result<T> = std::result::Result<T, ComputeError>;
