#![allow(dead_code)]

use harp_compute::backend::{HostBackend, HostInvocation};
use harp_compute::prelude::*;

pub const ENTRY_POINT: &str = "computeMain";

pub fn init_logger() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// Global parameters `input` and `output`, both byte-address buffers
pub fn copy_reflection() -> ProgramReflection {
    ProgramReflection::new()
        .with_parameter(VarLayout::new("input", 0, TypeLayout::byte_address_buffer()))
        .with_parameter(VarLayout::new("output", 8, TypeLayout::byte_address_buffer()))
        .with_entry_point(EntryPointReflection::compute(ENTRY_POINT, [1, 1, 1]))
}

/// Copies the whole `input` allocation into `output`
pub fn copy_kernel(inv: &mut HostInvocation<'_>) -> Result<(), String> {
    let globals = inv.global_uniform();
    let input = inv.read_u64(globals)?;
    let output = inv.read_u64(globals + 8)?;
    let len = inv
        .allocation_len(input)
        .ok_or_else(|| format!("input pointer {:#x} is not an allocation", input))?;
    let bytes = inv.read(input, len)?;
    inv.write(output, &bytes)
}

pub fn copy_backend() -> HostBackend {
    HostBackend::new().with_kernel(ENTRY_POINT, copy_kernel)
}

pub fn program() -> CompiledProgram {
    CompiledProgram::compute(b"host kernel image".to_vec())
}

/// Deterministic test bytes
pub fn pattern(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i * 7 % 251) as u8).collect()
}

/// Every allocation made through the backend has been freed and every
/// context torn down
pub fn assert_released(backend: &HostBackend) {
    let stats = backend.stats();
    assert_eq!(stats.live_allocations(), 0, "allocation/free mismatch: {:?}", stats);
    assert_eq!(backend.live_bytes(), 0);
    assert_eq!(stats.contexts_created, stats.contexts_destroyed);
}
