//! CUDA modules, functions, streams and launches

#[cfg(feature = "cuda-runtime")]
use crate::device::driver_error;
#[cfg(feature = "cuda-runtime")]
use cudarc::driver::{result, sys};
#[cfg(feature = "cuda-runtime")]
use harp_compute::backend::{FunctionAttributes, KernelArgs, LaunchConfig};
#[cfg(feature = "cuda-runtime")]
use harp_compute::error::BackendError;
#[cfg(feature = "cuda-runtime")]
use std::ffi::{c_int, c_void, CString};

/// A loaded module, unloaded on drop
#[cfg(feature = "cuda-runtime")]
pub struct CudaModule {
    module: sys::CUmodule,
}

#[cfg(feature = "cuda-runtime")]
pub struct CudaFunction {
    function: sys::CUfunction,
    name: String,
}

/// A non-blocking stream, destroyed on drop
#[cfg(feature = "cuda-runtime")]
pub struct CudaStream {
    stream: sys::CUstream,
}

/// Stub types (when cuda-runtime feature is disabled)
#[cfg(not(feature = "cuda-runtime"))]
pub enum CudaModule {}
#[cfg(not(feature = "cuda-runtime"))]
pub enum CudaFunction {}
#[cfg(not(feature = "cuda-runtime"))]
pub enum CudaStream {}

#[cfg(feature = "cuda-runtime")]
impl CudaModule {
    /// Load a PTX or cubin image
    pub(crate) fn load(image: &[u8]) -> Result<Self, BackendError> {
        // PTX text must be NUL-terminated
        let mut image = image.to_vec();
        if image.last() != Some(&0) {
            image.push(0);
        }

        // SAFETY: `image` outlives the call and is NUL-terminated
        let module = unsafe { result::module::load_data(image.as_ptr() as *const c_void) }
            .map_err(driver_error("cuModuleLoadData"))?;
        log::debug!("Loaded CUDA module ({} bytes)", image.len());
        Ok(Self { module })
    }

    pub(crate) fn function(&self, name: &str) -> Result<CudaFunction, BackendError> {
        let symbol = CString::new(name)
            .map_err(|e| BackendError::new("cuModuleGetFunction", e.to_string()))?;
        // SAFETY: the module is loaded for as long as `self` lives
        let function = unsafe { result::module::get_function(self.module, symbol) }
            .map_err(driver_error("cuModuleGetFunction"))?;
        Ok(CudaFunction {
            function,
            name: name.to_string(),
        })
    }
}

#[cfg(feature = "cuda-runtime")]
impl Drop for CudaModule {
    fn drop(&mut self) {
        // SAFETY: unloaded exactly once
        if let Err(e) = unsafe { result::module::unload(self.module) } {
            log::warn!("cuModuleUnload failed: {}", e);
        }
    }
}

#[cfg(feature = "cuda-runtime")]
impl CudaFunction {
    pub(crate) fn attributes(&self) -> Result<FunctionAttributes, BackendError> {
        let attribute = |attrib| {
            let mut value: c_int = 0;
            // SAFETY: `function` belongs to a loaded module and `value` outlives the call
            unsafe { sys::cuFuncGetAttribute(&mut value, attrib, self.function) }
                .result()
                .map_err(driver_error("cuFuncGetAttribute"))?;
            Ok::<_, BackendError>(value)
        };
        let max_threads =
            attribute(sys::CUfunction_attribute::CU_FUNC_ATTRIBUTE_MAX_THREADS_PER_BLOCK)?;
        let shared_size = attribute(sys::CUfunction_attribute::CU_FUNC_ATTRIBUTE_SHARED_SIZE_BYTES)?;

        Ok(FunctionAttributes {
            max_threads_per_block: max_threads.max(0) as u32,
            shared_size_bytes: shared_size.max(0) as u32,
        })
    }

    /// Enqueue a launch with the two uniform-block pointers as arguments
    pub(crate) fn launch(
        &self,
        config: &LaunchConfig,
        args: KernelArgs,
        stream: Option<&CudaStream>,
    ) -> Result<(), BackendError> {
        let [mut entry_point_uniform, mut global_uniform] = args.values();
        let mut params = [
            &mut entry_point_uniform as *mut u64 as *mut c_void,
            &mut global_uniform as *mut u64 as *mut c_void,
        ];
        let [gx, gy, gz] = config.grid_dim;
        let [bx, by, bz] = config.block_dim;

        log::debug!(
            "cuLaunchKernel '{}' grid {:?} block {:?}",
            self.name,
            config.grid_dim,
            config.block_dim
        );

        // SAFETY: the kernel takes exactly two pointer-sized parameters and
        // `params` outlives the call
        unsafe {
            result::launch_kernel(
                self.function,
                (gx, gy, gz),
                (bx, by, bz),
                config.shared_mem_bytes,
                stream.map_or(std::ptr::null_mut(), |s| s.stream),
                &mut params,
            )
        }
        .map_err(driver_error("cuLaunchKernel"))
    }
}

#[cfg(feature = "cuda-runtime")]
impl CudaStream {
    pub(crate) fn new() -> Result<Self, BackendError> {
        let stream = result::stream::create(result::stream::StreamKind::NonBlocking)
            .map_err(driver_error("cuStreamCreate"))?;
        Ok(Self { stream })
    }

    pub(crate) fn synchronize(&self) -> Result<(), BackendError> {
        // SAFETY: the stream is live
        unsafe { result::stream::synchronize(self.stream) }.map_err(driver_error("cuStreamSynchronize"))
    }
}

#[cfg(feature = "cuda-runtime")]
impl Drop for CudaStream {
    fn drop(&mut self) {
        // SAFETY: destroyed exactly once
        if let Err(e) = unsafe { result::stream::destroy(self.stream) } {
            log::warn!("cuStreamDestroy failed: {}", e);
        }
    }
}
