//! Harp Compute: reflected-layout compute kernel runner
//!
//! Runs a compiled GPU compute kernel against resources described by
//! shader reflection, and reads the results back for validation.
//!
//! # Architecture
//!
//! - **reflection**: typed reflection model (parameters, type layouts, entry points)
//! - **graph**: resource graph of values and binding locations
//! - **layout**: binds reflection plus test inputs into a resource graph
//! - **backend**: backend traits, device scoring, one-time driver init,
//!   host emulator
//! - **engine**: allocate / patch / upload / launch / read-back passes
//!
//! The CUDA driver backend is provided by the separate `harp-compute-cuda`
//! crate.

// ============================================================================
// Core Modules
// ============================================================================

pub mod backend;
pub mod config;
pub mod engine;
pub mod error;
pub mod graph;
pub mod layout;
pub mod reflection;

// ============================================================================
// Re-exports
// ============================================================================

pub use backend::{
    ComputeBackend, ComputeContext, DeviceAddress, FunctionAttributes, HostBackend, KernelArgs,
    LaunchConfig,
};
pub use config::{DeviceSelection, ExecutionConfig, StreamMode};
pub use engine::{ComputeRunner, ExecutionOutcome, ExecutionStats};
pub use error::{BackendError, ComputeError, Result};
pub use graph::{BindLocation, ResourceGraph, Value, ValueId};
pub use layout::{
    BindRoot, BoundEntry, BoundResources, CompiledKernel, CompiledProgram, EntryKind, InputEntry,
    ResourceLayout,
};
pub use reflection::{
    EntryPointReflection, ProgramReflection, ResourceClass, ResourceShape, Stage, TypeKind,
    TypeLayout, VarLayout,
};

// ============================================================================
// Prelude
// ============================================================================

/// Prelude module with commonly used types and traits
pub mod prelude {
    pub use crate::backend::{ComputeBackend, ComputeContext, HostBackend};
    pub use crate::config::ExecutionConfig;
    pub use crate::engine::ComputeRunner;
    pub use crate::layout::{CompiledProgram, InputEntry, ResourceLayout};
    pub use crate::reflection::{EntryPointReflection, ProgramReflection, TypeLayout, VarLayout};
}
