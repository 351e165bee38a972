//! CUDA driver initialization, device enumeration and contexts

use harp_compute::backend::DriverInit;
use harp_compute::error::BackendError;

#[cfg(feature = "cuda-runtime")]
use cudarc::driver::{result, sys, DriverError};
#[cfg(feature = "cuda-runtime")]
use harp_compute::backend::{ComputeMode, DeviceProperties};

/// `cuInit` runs at most once per process; failure is cached
static DRIVER: DriverInit = DriverInit::new();

#[cfg(feature = "cuda-runtime")]
pub(crate) fn driver_error(operation: &'static str) -> impl FnOnce(DriverError) -> BackendError {
    move |e| BackendError::new(operation, e.to_string())
}

/// Initialize the CUDA driver
#[cfg(feature = "cuda-runtime")]
pub fn ensure_driver() -> Result<(), BackendError> {
    DRIVER.ensure(|| result::init().map_err(|e| e.to_string()))
}

#[cfg(not(feature = "cuda-runtime"))]
pub fn ensure_driver() -> Result<(), BackendError> {
    DRIVER.ensure(|| {
        Err("CUDA runtime not available. Rebuild with --features cuda-runtime".to_string())
    })
}

/// Outcome of driver initialization, `None` if it has not been attempted
pub fn driver_status() -> Option<bool> {
    DRIVER.status()
}

/// Properties of every visible CUDA device
#[cfg(feature = "cuda-runtime")]
pub fn query_devices() -> Result<Vec<DeviceProperties>, BackendError> {
    ensure_driver()?;

    let count = result::device::get_count().map_err(driver_error("cuDeviceGetCount"))?;
    let mut devices = Vec::with_capacity(count.max(0) as usize);

    for ordinal in 0..count {
        let device = result::device::get(ordinal).map_err(driver_error("cuDeviceGet"))?;
        let attribute = |attrib| {
            // SAFETY: `device` was returned by cuDeviceGet
            unsafe { result::device::get_attribute(device, attrib) }
                .map_err(driver_error("cuDeviceGetAttribute"))
        };

        let major = attribute(sys::CUdevice_attribute::CU_DEVICE_ATTRIBUTE_COMPUTE_CAPABILITY_MAJOR)?;
        let minor = attribute(sys::CUdevice_attribute::CU_DEVICE_ATTRIBUTE_COMPUTE_CAPABILITY_MINOR)?;
        let sm_count = attribute(sys::CUdevice_attribute::CU_DEVICE_ATTRIBUTE_MULTIPROCESSOR_COUNT)?;
        let clock_rate = attribute(sys::CUdevice_attribute::CU_DEVICE_ATTRIBUTE_CLOCK_RATE)?;
        let compute_mode = attribute(sys::CUdevice_attribute::CU_DEVICE_ATTRIBUTE_COMPUTE_MODE)?;
        let name = result::device::get_name(device).unwrap_or_else(|_| format!("CUDA Device {}", ordinal));

        let properties = DeviceProperties::new(
            ordinal as usize,
            major.max(0) as u32,
            minor.max(0) as u32,
            sm_count.max(0) as u32,
            clock_rate.max(0) as u32,
        )
        .with_name(name)
        .with_compute_mode(ComputeMode::from_raw(compute_mode));

        log::debug!(
            "CUDA device {}: {} (sm_{}{}, {} SMs, {} kHz, {:?})",
            ordinal,
            properties.name,
            properties.major,
            properties.minor,
            properties.multiprocessor_count,
            properties.clock_rate_khz,
            properties.compute_mode
        );
        devices.push(properties);
    }

    Ok(devices)
}

/// A primary context on one device, made current on the calling thread
#[cfg(feature = "cuda-runtime")]
pub struct CudaContext {
    ordinal: usize,
    device: sys::CUdevice,
}

/// Stub CUDA context (when cuda-runtime feature is disabled)
#[cfg(not(feature = "cuda-runtime"))]
pub enum CudaContext {}

#[cfg(feature = "cuda-runtime")]
impl CudaContext {
    pub(crate) fn new(ordinal: usize) -> Result<Self, BackendError> {
        let device = result::device::get(ordinal as i32).map_err(driver_error("cuDeviceGet"))?;

        // SAFETY: `device` is valid; the retained context is released in Drop
        let handle = unsafe { result::primary_ctx::retain(device) }
            .map_err(driver_error("cuDevicePrimaryCtxRetain"))?;
        let context = Self { ordinal, device };

        // SAFETY: the context was just retained
        unsafe { result::ctx::set_current(handle) }
            .map_err(driver_error("cuCtxSetCurrent"))?;

        log::info!("CUDA context created on device {}", ordinal);
        Ok(context)
    }

    pub fn ordinal(&self) -> usize {
        self.ordinal
    }
}

#[cfg(feature = "cuda-runtime")]
impl Drop for CudaContext {
    fn drop(&mut self) {
        // SAFETY: paired with the retain in `new`
        match unsafe { result::primary_ctx::release(self.device) } {
            Ok(()) => log::info!("CUDA context on device {} released", self.ordinal),
            Err(e) => log::warn!("Failed to release CUDA context on device {}: {}", self.ordinal, e),
        }
    }
}
