//! Host emulator backend
//!
//! Implements the backend traits over a host-memory heap. Kernels are Rust
//! closures registered by name; "device" addresses are fake but stable and
//! distinct, so pointer slots patched by the engine can be followed from
//! inside a host kernel. Every driver call is counted in [`HostStats`], and
//! allocation/upload failures can be injected.

use std::cell::RefCell;
use std::collections::{BTreeMap, HashMap};
use std::rc::Rc;

use super::device::{select_fastest_device, DeviceProperties};
use super::init::DriverInit;
use super::{
    ComputeBackend, ComputeContext, DeviceAddress, FunctionAttributes, KernelArgs, LaunchConfig,
};
use crate::config::DeviceSelection;
use crate::error::BackendError;

/// First address handed out by the heap
const HEAP_BASE: u64 = 0x1_0000_0000;
/// Allocation alignment
const HEAP_ALIGN: u64 = 256;

pub const DEFAULT_MAX_THREADS_PER_BLOCK: u32 = 1024;

/// A kernel body run on the host
pub type HostKernel = dyn Fn(&mut HostInvocation<'_>) -> Result<(), String>;

/// Counters for every call made through the backend
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HostStats {
    pub init_attempts: usize,
    pub contexts_created: usize,
    pub contexts_destroyed: usize,
    pub allocations: usize,
    pub frees: usize,
    pub uploads: usize,
    pub downloads: usize,
    pub modules_loaded: usize,
    pub streams_created: usize,
    pub launches: usize,
    pub device_syncs: usize,
    pub stream_syncs: usize,
    /// Geometry and arguments of the most recent launch
    pub last_launch: Option<(LaunchConfig, KernelArgs)>,
}

impl HostStats {
    /// Allocations not yet freed
    pub fn live_allocations(&self) -> usize {
        self.allocations.saturating_sub(self.frees)
    }
}

/// Emulated device memory
#[derive(Debug, Default)]
struct HostHeap {
    blocks: BTreeMap<u64, Vec<u8>>,
    next: u64,
}

impl HostHeap {
    fn alloc(&mut self, len: usize) -> u64 {
        if self.next == 0 {
            self.next = HEAP_BASE;
        }
        let address = self.next;
        // Zero-length blocks still get a distinct address
        let span = (len.max(1) as u64).div_ceil(HEAP_ALIGN) * HEAP_ALIGN;
        self.next += span;
        self.blocks.insert(address, vec![0; len]);
        address
    }

    fn free(&mut self, address: u64) -> bool {
        self.blocks.remove(&address).is_some()
    }

    /// Block containing `address` and the offset into it
    fn resolve(&self, address: u64) -> Option<(u64, usize)> {
        let (&base, block) = self.blocks.range(..=address).next_back()?;
        let offset = (address - base) as usize;
        if offset < block.len() || (offset == 0 && block.is_empty()) {
            Some((base, offset))
        } else {
            None
        }
    }

    fn read(&self, address: u64, len: usize) -> Result<&[u8], String> {
        let (base, offset) = self
            .resolve(address)
            .ok_or_else(|| format!("read of unmapped address {:#x}", address))?;
        self.blocks
            .get(&base)
            .and_then(|block| block.get(offset..offset.checked_add(len)?))
            .ok_or_else(|| format!("read of {} bytes at {:#x} overruns its block", len, address))
    }

    fn write(&mut self, address: u64, bytes: &[u8]) -> Result<(), String> {
        let (base, offset) = self
            .resolve(address)
            .ok_or_else(|| format!("write to unmapped address {:#x}", address))?;
        let block = self
            .blocks
            .get_mut(&base)
            .ok_or_else(|| format!("write to unmapped address {:#x}", address))?;
        let dst = offset
            .checked_add(bytes.len())
            .and_then(|end| block.get_mut(offset..end))
            .ok_or_else(|| {
                format!("write of {} bytes at {:#x} overruns its block", bytes.len(), address)
            })?;
        dst.copy_from_slice(bytes);
        Ok(())
    }
}

#[derive(Debug, Default)]
struct HostState {
    heap: HostHeap,
    stats: HostStats,
}

type SharedState = Rc<RefCell<HostState>>;

/// View of emulated device memory handed to a running host kernel
pub struct HostInvocation<'a> {
    heap: &'a mut HostHeap,
    args: KernelArgs,
    block_dim: [u32; 3],
}

impl HostInvocation<'_> {
    /// Address of the entry-point uniform block (first kernel argument)
    pub fn entry_point_uniform(&self) -> u64 {
        self.args.entry_point_uniform
    }

    /// Address of the global uniform block (second kernel argument)
    pub fn global_uniform(&self) -> u64 {
        self.args.global_uniform
    }

    pub fn block_dim(&self) -> [u32; 3] {
        self.block_dim
    }

    pub fn read(&self, address: u64, len: usize) -> Result<Vec<u8>, String> {
        self.heap.read(address, len).map(<[u8]>::to_vec)
    }

    pub fn write(&mut self, address: u64, bytes: &[u8]) -> Result<(), String> {
        self.heap.write(address, bytes)
    }

    pub fn read_u64(&self, address: u64) -> Result<u64, String> {
        let mut raw = [0u8; 8];
        raw.copy_from_slice(self.heap.read(address, 8)?);
        Ok(u64::from_le_bytes(raw))
    }

    pub fn read_u32(&self, address: u64) -> Result<u32, String> {
        let mut raw = [0u8; 4];
        raw.copy_from_slice(self.heap.read(address, 4)?);
        Ok(u32::from_le_bytes(raw))
    }

    pub fn write_u32(&mut self, address: u64, value: u32) -> Result<(), String> {
        self.heap.write(address, &value.to_le_bytes())
    }

    /// Length of the allocation starting at `address`
    pub fn allocation_len(&self, address: u64) -> Option<usize> {
        self.heap.blocks.get(&address).map(Vec::len)
    }
}

/// In-process emulation of a compute driver
pub struct HostBackend {
    devices: Vec<DeviceProperties>,
    kernels: Rc<HashMap<String, Rc<HostKernel>>>,
    max_threads_per_block: u32,
    init: DriverInit,
    init_error: Option<String>,
    fail_allocation_after: Option<usize>,
    fail_upload_after: Option<usize>,
    state: SharedState,
}

impl Default for HostBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl HostBackend {
    /// A backend with a single emulation device and no kernels
    pub fn new() -> Self {
        Self {
            devices: vec![DeviceProperties::new(0, 9999, 9999, 1, 1).with_name("Host Emulator")],
            kernels: Rc::new(HashMap::new()),
            max_threads_per_block: DEFAULT_MAX_THREADS_PER_BLOCK,
            init: DriverInit::new(),
            init_error: None,
            fail_allocation_after: None,
            fail_upload_after: None,
            state: SharedState::default(),
        }
    }

    /// Replace the emulated device list
    pub fn with_devices(mut self, devices: Vec<DeviceProperties>) -> Self {
        self.devices = devices;
        self
    }

    /// Register a kernel under its entry-point name
    pub fn with_kernel<F>(mut self, name: impl Into<String>, kernel: F) -> Self
    where
        F: Fn(&mut HostInvocation<'_>) -> Result<(), String> + 'static,
    {
        Rc::make_mut(&mut self.kernels).insert(name.into(), Rc::new(kernel));
        self
    }

    pub fn with_max_threads_per_block(mut self, max: u32) -> Self {
        self.max_threads_per_block = max;
        self
    }

    /// Make driver initialization fail
    pub fn failing_init(mut self, message: impl Into<String>) -> Self {
        self.init_error = Some(message.into());
        self
    }

    /// Let `successes` allocations through, then fail every later one
    pub fn fail_allocation_after(mut self, successes: usize) -> Self {
        self.fail_allocation_after = Some(successes);
        self
    }

    /// Let `successes` uploads through, then fail every later one
    pub fn fail_upload_after(mut self, successes: usize) -> Self {
        self.fail_upload_after = Some(successes);
        self
    }

    /// Snapshot of the call counters
    pub fn stats(&self) -> HostStats {
        self.state.borrow().stats.clone()
    }

    /// Bytes currently held by emulated allocations
    pub fn live_bytes(&self) -> usize {
        self.state.borrow().heap.blocks.values().map(Vec::len).sum()
    }
}

impl ComputeBackend for HostBackend {
    type Context = HostContext;

    fn name(&self) -> &str {
        "host"
    }

    fn acquire(&self, selection: DeviceSelection) -> Result<HostContext, BackendError> {
        self.init.ensure(|| {
            self.state.borrow_mut().stats.init_attempts += 1;
            match &self.init_error {
                Some(message) => Err(message.clone()),
                None => Ok(()),
            }
        })?;

        let ordinal = match selection {
            DeviceSelection::Auto => select_fastest_device(&self.devices)
                .ok_or_else(|| BackendError::new("select device", "no eligible device"))?,
            DeviceSelection::Ordinal(n) => {
                if !self.devices.iter().any(|d| d.ordinal == n) {
                    return Err(BackendError::new(
                        "select device",
                        format!("device {} does not exist", n),
                    ));
                }
                n
            }
        };

        self.state.borrow_mut().stats.contexts_created += 1;
        log::info!("Host emulator context created on device {}", ordinal);

        Ok(HostContext {
            ordinal,
            kernels: Rc::clone(&self.kernels),
            max_threads_per_block: self.max_threads_per_block,
            fail_allocation_after: self.fail_allocation_after,
            fail_upload_after: self.fail_upload_after,
            state: Rc::clone(&self.state),
        })
    }
}

/// A context on an emulated device
pub struct HostContext {
    ordinal: usize,
    kernels: Rc<HashMap<String, Rc<HostKernel>>>,
    max_threads_per_block: u32,
    fail_allocation_after: Option<usize>,
    fail_upload_after: Option<usize>,
    state: SharedState,
}

impl Drop for HostContext {
    fn drop(&mut self) {
        self.state.borrow_mut().stats.contexts_destroyed += 1;
        log::info!("Host emulator context on device {} destroyed", self.ordinal);
    }
}

/// An emulated device allocation, freed on drop
pub struct HostAllocation {
    address: u64,
    len: usize,
    state: SharedState,
}

impl DeviceAddress for HostAllocation {
    fn device_address(&self) -> Option<u64> {
        Some(self.address)
    }

    fn byte_len(&self) -> usize {
        self.len
    }
}

impl Drop for HostAllocation {
    fn drop(&mut self) {
        let mut state = self.state.borrow_mut();
        if state.heap.free(self.address) {
            state.stats.frees += 1;
        } else {
            log::warn!("Double free of host allocation at {:#x}", self.address);
        }
    }
}

pub struct HostModule {
    image_len: usize,
}

pub struct HostFunction {
    name: String,
    kernel: Rc<HostKernel>,
}

pub struct HostStream {
    id: usize,
}

impl ComputeContext for HostContext {
    type Allocation = HostAllocation;
    type Module = HostModule;
    type Function = HostFunction;
    type Stream = HostStream;

    fn device_ordinal(&self) -> usize {
        self.ordinal
    }

    fn allocate(&self, byte_len: usize) -> Result<HostAllocation, BackendError> {
        let mut state = self.state.borrow_mut();
        if let Some(limit) = self.fail_allocation_after {
            if state.stats.allocations >= limit {
                return Err(BackendError::new("allocate", "injected out-of-memory"));
            }
        }

        let address = state.heap.alloc(byte_len);
        state.stats.allocations += 1;
        Ok(HostAllocation {
            address,
            len: byte_len,
            state: Rc::clone(&self.state),
        })
    }

    fn copy_to_device(&self, dst: &HostAllocation, src: &[u8]) -> Result<(), BackendError> {
        let mut state = self.state.borrow_mut();
        if let Some(limit) = self.fail_upload_after {
            if state.stats.uploads >= limit {
                return Err(BackendError::new("copy to device", "injected transfer failure"));
            }
        }

        state
            .heap
            .write(dst.address, src)
            .map_err(|e| BackendError::new("copy to device", e))?;
        state.stats.uploads += 1;
        Ok(())
    }

    fn copy_to_host(&self, src: &HostAllocation, dst: &mut [u8]) -> Result<(), BackendError> {
        let mut state = self.state.borrow_mut();
        let bytes = state
            .heap
            .read(src.address, dst.len())
            .map_err(|e| BackendError::new("copy to host", e))?;
        dst.copy_from_slice(bytes);
        state.stats.downloads += 1;
        Ok(())
    }

    fn load_module(&self, image: &[u8]) -> Result<HostModule, BackendError> {
        self.state.borrow_mut().stats.modules_loaded += 1;
        Ok(HostModule {
            image_len: image.len(),
        })
    }

    fn get_function(&self, module: &HostModule, name: &str) -> Result<HostFunction, BackendError> {
        let kernel = self.kernels.get(name).ok_or_else(|| {
            BackendError::new(
                "get function",
                format!("no kernel named '{}' in module ({} bytes)", name, module.image_len),
            )
        })?;
        Ok(HostFunction {
            name: name.to_string(),
            kernel: Rc::clone(kernel),
        })
    }

    fn function_attributes(&self, _function: &HostFunction) -> Result<FunctionAttributes, BackendError> {
        Ok(FunctionAttributes {
            max_threads_per_block: self.max_threads_per_block,
            shared_size_bytes: 0,
        })
    }

    fn create_stream(&self) -> Result<HostStream, BackendError> {
        let mut state = self.state.borrow_mut();
        state.stats.streams_created += 1;
        Ok(HostStream {
            id: state.stats.streams_created,
        })
    }

    fn launch(
        &self,
        function: &HostFunction,
        config: &LaunchConfig,
        args: KernelArgs,
        stream: Option<&HostStream>,
    ) -> Result<(), BackendError> {
        let mut state = self.state.borrow_mut();
        state.stats.launches += 1;
        state.stats.last_launch = Some((*config, args));

        log::debug!(
            "Host launch '{}' block {:?} on stream {:?}",
            function.name,
            config.block_dim,
            stream.map(|s| s.id)
        );

        let mut invocation = HostInvocation {
            heap: &mut state.heap,
            args,
            block_dim: config.block_dim,
        };
        (function.kernel)(&mut invocation)
            .map_err(|e| BackendError::new(format!("launch '{}'", function.name), e))
    }

    fn synchronize(&self, stream: Option<&HostStream>) -> Result<(), BackendError> {
        let mut state = self.state.borrow_mut();
        match stream {
            Some(_) => state.stats.stream_syncs += 1,
            None => state.stats.device_syncs += 1,
        }
        Ok(())
    }
}
