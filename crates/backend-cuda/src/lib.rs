//! CUDA driver backend for harp-compute
//!
//! Runs kernels through the CUDA driver API (`cudarc`'s `result` layer):
//! one primary context per execution, `cuMemAlloc` per value, synchronous
//! copies, and `cuLaunchKernel` with the two uniform-block pointers.
//!
//! # Features
//!
//! - `cuda-runtime`: Enable the driver calls (requires the CUDA driver).
//!   Without it every acquisition fails and [`can_create_device`] is `false`.
//!
//! # Usage
//!
//! ```ignore
//! use harp_compute::{ComputeRunner, ExecutionConfig};
//! use harp_compute_cuda::CudaBackend;
//!
//! let runner = ComputeRunner::new(CudaBackend::new(), ExecutionConfig::from_env()?);
//! let outcome = runner.execute(&program, &layout)?;
//! ```

mod buffer;
mod device;
mod kernel;

pub use buffer::CudaAllocation;
pub use device::{driver_status, ensure_driver, CudaContext};
pub use kernel::{CudaFunction, CudaModule, CudaStream};

#[cfg(feature = "cuda-runtime")]
pub use device::query_devices;

use harp_compute::backend::{
    ComputeBackend, ComputeContext, FunctionAttributes, KernelArgs, LaunchConfig,
};
use harp_compute::config::DeviceSelection;
use harp_compute::error::BackendError;

/// The CUDA driver backend
#[derive(Debug, Clone, Copy, Default)]
pub struct CudaBackend;

impl CudaBackend {
    pub fn new() -> Self {
        Self
    }
}

/// Whether a CUDA context can be created on this machine
pub fn can_create_device() -> bool {
    CudaBackend::new().can_create_device()
}

#[cfg(feature = "cuda-runtime")]
impl ComputeBackend for CudaBackend {
    type Context = CudaContext;

    fn name(&self) -> &str {
        "CUDA"
    }

    fn acquire(&self, selection: DeviceSelection) -> Result<CudaContext, BackendError> {
        let devices = query_devices()?;
        let ordinal = match selection {
            DeviceSelection::Auto => harp_compute::backend::select_fastest_device(&devices)
                .ok_or_else(|| BackendError::new("select device", "no eligible CUDA device"))?,
            DeviceSelection::Ordinal(n) if n < devices.len() => n,
            DeviceSelection::Ordinal(n) => {
                return Err(BackendError::new(
                    "select device",
                    format!("CUDA device {} does not exist ({} present)", n, devices.len()),
                ))
            }
        };
        CudaContext::new(ordinal)
    }
}

#[cfg(not(feature = "cuda-runtime"))]
impl ComputeBackend for CudaBackend {
    type Context = CudaContext;

    fn name(&self) -> &str {
        "CUDA"
    }

    fn acquire(&self, _selection: DeviceSelection) -> Result<CudaContext, BackendError> {
        ensure_driver()?;
        Err(BackendError::new(
            "acquire",
            "CUDA runtime not available. Rebuild with --features cuda-runtime",
        ))
    }
}

#[cfg(feature = "cuda-runtime")]
impl ComputeContext for CudaContext {
    type Allocation = CudaAllocation;
    type Module = CudaModule;
    type Function = CudaFunction;
    type Stream = CudaStream;

    fn device_ordinal(&self) -> usize {
        self.ordinal()
    }

    fn allocate(&self, byte_len: usize) -> Result<CudaAllocation, BackendError> {
        CudaAllocation::new(byte_len)
    }

    fn copy_to_device(&self, dst: &CudaAllocation, src: &[u8]) -> Result<(), BackendError> {
        dst.copy_from_host(src)
    }

    fn copy_to_host(&self, src: &CudaAllocation, dst: &mut [u8]) -> Result<(), BackendError> {
        src.copy_to_host(dst)
    }

    fn load_module(&self, image: &[u8]) -> Result<CudaModule, BackendError> {
        CudaModule::load(image)
    }

    fn get_function(&self, module: &CudaModule, name: &str) -> Result<CudaFunction, BackendError> {
        module.function(name)
    }

    fn function_attributes(&self, function: &CudaFunction) -> Result<FunctionAttributes, BackendError> {
        function.attributes()
    }

    fn create_stream(&self) -> Result<CudaStream, BackendError> {
        CudaStream::new()
    }

    fn launch(
        &self,
        function: &CudaFunction,
        config: &LaunchConfig,
        args: KernelArgs,
        stream: Option<&CudaStream>,
    ) -> Result<(), BackendError> {
        function.launch(config, args, stream)
    }

    fn synchronize(&self, stream: Option<&CudaStream>) -> Result<(), BackendError> {
        match stream {
            Some(stream) => stream.synchronize(),
            None => cudarc::driver::result::ctx::synchronize()
                .map_err(|e| BackendError::new("cuCtxSynchronize", e.to_string())),
        }
    }
}

#[cfg(not(feature = "cuda-runtime"))]
impl ComputeContext for CudaContext {
    type Allocation = CudaAllocation;
    type Module = CudaModule;
    type Function = CudaFunction;
    type Stream = CudaStream;

    fn device_ordinal(&self) -> usize {
        match *self {}
    }

    fn allocate(&self, _byte_len: usize) -> Result<CudaAllocation, BackendError> {
        match *self {}
    }

    fn copy_to_device(&self, _dst: &CudaAllocation, _src: &[u8]) -> Result<(), BackendError> {
        match *self {}
    }

    fn copy_to_host(&self, _src: &CudaAllocation, _dst: &mut [u8]) -> Result<(), BackendError> {
        match *self {}
    }

    fn load_module(&self, _image: &[u8]) -> Result<CudaModule, BackendError> {
        match *self {}
    }

    fn get_function(&self, _module: &CudaModule, _name: &str) -> Result<CudaFunction, BackendError> {
        match *self {}
    }

    fn function_attributes(&self, _function: &CudaFunction) -> Result<FunctionAttributes, BackendError> {
        match *self {}
    }

    fn create_stream(&self) -> Result<CudaStream, BackendError> {
        match *self {}
    }

    fn launch(
        &self,
        _function: &CudaFunction,
        _config: &LaunchConfig,
        _args: KernelArgs,
        _stream: Option<&CudaStream>,
    ) -> Result<(), BackendError> {
        match *self {}
    }

    fn synchronize(&self, _stream: Option<&CudaStream>) -> Result<(), BackendError> {
        match *self {}
    }
}
