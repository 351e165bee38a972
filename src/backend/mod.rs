//! Compute backend trait definitions
//!
//! These traits are the seam between the execution engine and a concrete
//! driver. A backend hands out one [`ComputeContext`] per execution; the
//! context owns everything created through it (allocations, modules,
//! streams), and each of those releases its device object on drop.
//!
//! Backends:
//! - [`host::HostBackend`]: in-process emulation over host memory
//! - `harp-compute-cuda`: CUDA driver backend (separate crate)

pub mod device;
pub mod host;
pub mod init;

pub use device::{select_fastest_device, ComputeMode, DeviceProperties};
pub use host::{HostBackend, HostInvocation, HostStats};
pub use init::DriverInit;

use crate::config::DeviceSelection;
use crate::error::BackendError;

/// Anything that may resolve to an address in device memory
pub trait DeviceAddress {
    /// Address of the first byte, `None` when nothing is resident on the device
    fn device_address(&self) -> Option<u64>;

    /// Bytes requested for the allocation
    fn byte_len(&self) -> usize;
}

/// Static attributes of a loaded kernel function
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FunctionAttributes {
    pub max_threads_per_block: u32,
    /// Statically declared shared memory
    pub shared_size_bytes: u32,
}

/// Launch geometry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LaunchConfig {
    pub grid_dim: [u32; 3],
    pub block_dim: [u32; 3],
    /// Dynamic shared memory
    pub shared_mem_bytes: u32,
}

impl LaunchConfig {
    /// One thread block of the given dimensions
    pub fn single_block(block_dim: [u32; 3]) -> Self {
        Self {
            grid_dim: [1, 1, 1],
            block_dim,
            shared_mem_bytes: 0,
        }
    }
}

/// The two kernel parameters of the calling convention
///
/// Kernels receive exactly two pointer-sized arguments, passed by address,
/// in this order: the entry-point uniform block, then the global uniform
/// block. A missing block is passed as a null address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct KernelArgs {
    pub entry_point_uniform: u64,
    pub global_uniform: u64,
}

impl KernelArgs {
    /// Argument values in calling-convention order
    pub fn values(&self) -> [u64; 2] {
        [self.entry_point_uniform, self.global_uniform]
    }
}

/// A compute driver that can hand out execution contexts
pub trait ComputeBackend {
    type Context: ComputeContext;

    /// Human readable backend name
    fn name(&self) -> &str;

    /// Initialize the driver (once per process) and create a context
    fn acquire(&self, selection: DeviceSelection) -> Result<Self::Context, BackendError>;

    /// Whether a context can be created at all
    fn can_create_device(&self) -> bool {
        match self.acquire(DeviceSelection::Auto) {
            Ok(_) => true,
            Err(e) => {
                log::info!("{} backend unavailable: {}", self.name(), e);
                false
            }
        }
    }
}

/// A live context on one device
///
/// Dropping the context tears it down; everything created from it must be
/// dropped first.
pub trait ComputeContext {
    type Allocation: DeviceAddress;
    type Module;
    type Function;
    type Stream;

    /// Ordinal of the device the context is bound to
    fn device_ordinal(&self) -> usize;

    fn allocate(&self, byte_len: usize) -> Result<Self::Allocation, BackendError>;

    fn copy_to_device(&self, dst: &Self::Allocation, src: &[u8]) -> Result<(), BackendError>;

    fn copy_to_host(&self, src: &Self::Allocation, dst: &mut [u8]) -> Result<(), BackendError>;

    fn load_module(&self, image: &[u8]) -> Result<Self::Module, BackendError>;

    fn get_function(&self, module: &Self::Module, name: &str)
        -> Result<Self::Function, BackendError>;

    fn function_attributes(&self, function: &Self::Function)
        -> Result<FunctionAttributes, BackendError>;

    fn create_stream(&self) -> Result<Self::Stream, BackendError>;

    /// Enqueue a launch; `None` uses the default stream
    fn launch(
        &self,
        function: &Self::Function,
        config: &LaunchConfig,
        args: KernelArgs,
        stream: Option<&Self::Stream>,
    ) -> Result<(), BackendError>;

    /// Block until `stream` drains, or the whole device when `None`
    fn synchronize(&self, stream: Option<&Self::Stream>) -> Result<(), BackendError>;
}
