//! Upload, launch and read-back

use crate::backend::{ComputeContext, KernelArgs, LaunchConfig};
use crate::error::{ComputeError, Result};
use crate::graph::{DeviceTargets, ResourceGraph};
use crate::layout::BoundEntry;
use crate::reflection::{EntryPointReflection, ProgramReflection};

/// The single entry point of a program
pub(crate) fn single_entry_point(reflection: &ProgramReflection) -> Result<&EntryPointReflection> {
    match reflection.entry_points.as_slice() {
        [entry_point] => Ok(entry_point),
        entry_points => {
            log::error!(
                "Expected exactly one entry point, found {}",
                entry_points.len()
            );
            Err(ComputeError::EntryPointCount(entry_points.len()))
        }
    }
}

/// Copy host bytes of every allocated value to the device
pub(crate) fn upload_all<C: ComputeContext>(
    context: &C,
    graph: &ResourceGraph,
    targets: &DeviceTargets<C::Allocation>,
) -> Result<usize> {
    let mut uploaded = 0;
    for (id, value) in graph.values() {
        let (Some(data), Some(allocation)) = (value.data.as_deref(), targets.get(id)) else {
            continue;
        };
        if data.is_empty() {
            continue;
        }
        context.copy_to_device(allocation, data)?;
        uploaded += 1;
    }
    log::debug!("Uploaded {} value(s)", uploaded);
    Ok(uploaded)
}

/// Kernel arguments for the graph's uniform blocks
pub(crate) fn kernel_args<C: ComputeContext>(
    graph: &ResourceGraph,
    targets: &DeviceTargets<C::Allocation>,
) -> KernelArgs {
    let address = |id| targets.address(id).unwrap_or(0);
    KernelArgs {
        entry_point_uniform: graph.entry_point_value().map_or(0, address),
        global_uniform: graph.root_value().map_or(0, address),
    }
}

/// Launch one thread block sized by the reflected thread group
pub(crate) fn launch<C: ComputeContext>(
    context: &C,
    function: &C::Function,
    entry_point: &EntryPointReflection,
    args: KernelArgs,
    stream: Option<&C::Stream>,
) -> Result<()> {
    let attributes = context.function_attributes(function)?;
    let block_dim = entry_point.thread_group_size;
    let threads = entry_point.thread_count().ok_or_else(|| {
        log::error!("Thread group {:?} overflows a thread count", block_dim);
        ComputeError::Layout(format!(
            "entry point '{}' has a thread group {:?} too large to count",
            entry_point.name, block_dim
        ))
    })?;

    if threads == 0 {
        return Err(ComputeError::Layout(format!(
            "entry point '{}' has an empty thread group {:?}",
            entry_point.name, block_dim
        )));
    }
    if threads > u64::from(attributes.max_threads_per_block) {
        log::error!(
            "Thread group {:?} ({} threads) exceeds the kernel limit of {}",
            block_dim,
            threads,
            attributes.max_threads_per_block
        );
        return Err(ComputeError::ThreadGroupTooLarge {
            requested: block_dim,
            threads,
            max: attributes.max_threads_per_block,
        });
    }

    let config = LaunchConfig::single_block(block_dim);
    log::debug!(
        "Launching '{}': block {:?}, {} bytes static shared memory, args {:#x} {:#x}",
        entry_point.name,
        block_dim,
        attributes.shared_size_bytes,
        args.entry_point_uniform,
        args.global_uniform
    );
    context.launch(function, &config, args, stream)?;
    Ok(())
}

/// Read every output entry back into its value's host bytes
pub(crate) fn download_outputs<C: ComputeContext>(
    context: &C,
    graph: &mut ResourceGraph,
    targets: &DeviceTargets<C::Allocation>,
    entries: &[BoundEntry],
) -> Result<usize> {
    let mut downloaded = 0;
    for entry in entries.iter().filter(|e| e.is_output) {
        let Some(id) = entry.value else {
            continue;
        };
        let Some(allocation) = targets.get(id) else {
            log::warn!("Output value {} has no device memory, nothing to read back", id);
            continue;
        };
        let Some(value) = graph.value_mut(id) else {
            continue;
        };

        let size = value.size;
        let data = value.data.get_or_insert_with(|| vec![0; size]);
        if data.is_empty() {
            continue;
        }
        context.copy_to_host(allocation, data)?;
        downloaded += 1;
    }
    log::debug!("Downloaded {} output(s)", downloaded);
    Ok(downloaded)
}
