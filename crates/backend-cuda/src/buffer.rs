//! CUDA device allocations

use harp_compute::backend::DeviceAddress;

#[cfg(feature = "cuda-runtime")]
use crate::device::driver_error;
#[cfg(feature = "cuda-runtime")]
use cudarc::driver::{result, sys};
#[cfg(feature = "cuda-runtime")]
use harp_compute::error::BackendError;

/// One `cuMemAlloc` block, freed on drop
#[cfg(feature = "cuda-runtime")]
pub struct CudaAllocation {
    ptr: sys::CUdeviceptr,
    /// Requested size; the driver block is at least one byte
    len: usize,
}

/// Stub CUDA allocation (when cuda-runtime feature is disabled)
#[cfg(not(feature = "cuda-runtime"))]
pub enum CudaAllocation {}

#[cfg(feature = "cuda-runtime")]
impl CudaAllocation {
    pub(crate) fn new(len: usize) -> Result<Self, BackendError> {
        // cuMemAlloc rejects zero-sized requests
        // SAFETY: the returned pointer is owned by this allocation
        let ptr = unsafe { result::malloc_sync(len.max(1)) }.map_err(driver_error("cuMemAlloc"))?;
        Ok(Self { ptr, len })
    }

    pub(crate) fn copy_from_host(&self, src: &[u8]) -> Result<(), BackendError> {
        if src.len() > self.len {
            return Err(BackendError::new(
                "cuMemcpyHtoD",
                format!("{} bytes do not fit an allocation of {}", src.len(), self.len),
            ));
        }
        // SAFETY: `ptr` is a live allocation of at least `src.len()` bytes
        unsafe { result::memcpy_htod_sync(self.ptr, src) }.map_err(driver_error("cuMemcpyHtoD"))
    }

    pub(crate) fn copy_to_host(&self, dst: &mut [u8]) -> Result<(), BackendError> {
        if dst.len() > self.len {
            return Err(BackendError::new(
                "cuMemcpyDtoH",
                format!("{} bytes requested from an allocation of {}", dst.len(), self.len),
            ));
        }
        // SAFETY: `ptr` is a live allocation of at least `dst.len()` bytes
        unsafe { result::memcpy_dtoh_sync(dst, self.ptr) }.map_err(driver_error("cuMemcpyDtoH"))
    }
}

#[cfg(feature = "cuda-runtime")]
impl Drop for CudaAllocation {
    fn drop(&mut self) {
        // SAFETY: `ptr` came from cuMemAlloc and is freed once
        if let Err(e) = unsafe { result::free_sync(self.ptr) } {
            log::warn!("cuMemFree of {:#x} failed: {}", self.ptr, e);
        }
    }
}

#[cfg(feature = "cuda-runtime")]
impl DeviceAddress for CudaAllocation {
    fn device_address(&self) -> Option<u64> {
        Some(self.ptr)
    }

    fn byte_len(&self) -> usize {
        self.len
    }
}

#[cfg(not(feature = "cuda-runtime"))]
impl DeviceAddress for CudaAllocation {
    fn device_address(&self) -> Option<u64> {
        match *self {}
    }

    fn byte_len(&self) -> usize {
        match *self {}
    }
}
