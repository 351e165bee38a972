//! Patch pass
//!
//! Writes the device address of each bound value into its pointer slot.
//! Runs after every allocation exists and before anything is uploaded, so
//! a parameter block always travels to the device with final addresses.

use crate::backend::DeviceAddress;
use crate::error::Result;
use crate::graph::{DeviceTargets, ResourceGraph};
use crate::reflection::ResourceClass;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum PatchRule {
    WriteAddress,
    Skip,
}

pub(crate) fn patch_rule(class: ResourceClass) -> PatchRule {
    match class {
        ResourceClass::ConstantBuffer
        | ResourceClass::ParameterBlock
        | ResourceClass::StructuredBuffer
        | ResourceClass::ByteAddressBuffer => PatchRule::WriteAddress,
        // Unbounded arrays are passed as a pointer
        ResourceClass::Array { element_count: 0 } => PatchRule::WriteAddress,
        _ => PatchRule::Skip,
    }
}

/// Patch every binding location; returns the number of slots written
///
/// A bound value without an allocation gets a null address.
pub(crate) fn patch_all<A: DeviceAddress>(
    graph: &mut ResourceGraph,
    targets: &DeviceTargets<A>,
) -> Result<usize> {
    let writes: Vec<_> = graph
        .bindings()
        .iter()
        .filter_map(|(location, value)| {
            let value = (*value)?;
            match patch_rule(location.layout.resource_class()) {
                PatchRule::WriteAddress => {
                    Some((location.clone(), targets.address(value).unwrap_or(0)))
                }
                PatchRule::Skip => None,
            }
        })
        .collect();

    for (location, address) in &writes {
        log::trace!(
            "Patch {}+{} <- {:#x}",
            location.container,
            location.offset,
            address
        );
        graph.write_pointer(location, *address)?;
    }

    Ok(writes.len())
}
