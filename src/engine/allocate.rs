//! Allocation pass
//!
//! Gives every eligible value one device allocation of `size` bytes.

use crate::backend::ComputeContext;
use crate::error::{ComputeError, Result};
use crate::graph::{DeviceTargets, ResourceGraph, Value, ValueId};
use crate::reflection::ResourceClass;

/// What the allocation pass does with a value of a given class
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum AllocationRule {
    /// Allocate `size` bytes of device memory
    Device,
    /// Recognized but not backed by memory yet
    Placeholder,
    Skip,
}

pub(crate) fn allocation_rule(class: ResourceClass) -> AllocationRule {
    match class {
        ResourceClass::ConstantBuffer
        | ResourceClass::ParameterBlock
        | ResourceClass::StructuredBuffer
        | ResourceClass::ByteAddressBuffer => AllocationRule::Device,
        // Unbounded arrays live in their own allocation behind a pointer
        ResourceClass::Array { element_count: 0 } => AllocationRule::Device,
        ResourceClass::Texture2D => AllocationRule::Placeholder,
        ResourceClass::Texture1D
        | ResourceClass::Texture3D
        | ResourceClass::TextureCube
        | ResourceClass::TextureBuffer
        | ResourceClass::Array { .. }
        | ResourceClass::Scalar
        | ResourceClass::Unsupported => AllocationRule::Skip,
    }
}

/// Allocate device memory for every value; returns the number of allocations
///
/// The first failure aborts the pass. Allocations already made stay in
/// `targets` and are released by its owner.
pub(crate) fn allocate_all<C: ComputeContext>(
    context: &C,
    graph: &ResourceGraph,
    targets: &mut DeviceTargets<C::Allocation>,
    strict: bool,
) -> Result<usize> {
    let mut allocated = 0;

    for (id, value) in graph.values() {
        let class = value.class();
        if strict && class.is_texture() {
            log::error!("Texture value {} ({:?}) cannot be backed by device memory", id, class);
            return Err(ComputeError::UnsupportedResource {
                value: id,
                shape: format!("{:?}", class),
            });
        }

        match allocation_rule(class) {
            AllocationRule::Device => {
                let allocation = context.allocate(value.size)?;
                targets.insert(id, allocation)?;
                allocated += 1;
            }
            AllocationRule::Placeholder => texture_placeholder(id, value),
            AllocationRule::Skip => {
                if class.is_texture()
                    || matches!(class, ResourceClass::Array { .. } | ResourceClass::Unsupported)
                {
                    log::warn!("Value {} ({:?}) is not supported, leaving it unbound", id, class);
                }
            }
        }
    }

    log::debug!("Allocated {} of {} values", allocated, graph.len());
    Ok(allocated)
}

fn texture_placeholder(id: ValueId, value: &Value) {
    let components = value
        .layout
        .as_ref()
        .map_or(1, |layout| layout.texel_component_count());
    log::debug!(
        "Texture2D value {} has {} component(s) per texel; no device memory is created",
        id,
        components
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{ComputeBackend, HostBackend};
    use crate::config::DeviceSelection;
    use crate::reflection::{ResourceShape, TypeLayout};
    use rstest::rstest;

    #[rstest]
    #[case(ResourceClass::ConstantBuffer, AllocationRule::Device)]
    #[case(ResourceClass::ParameterBlock, AllocationRule::Device)]
    #[case(ResourceClass::StructuredBuffer, AllocationRule::Device)]
    #[case(ResourceClass::ByteAddressBuffer, AllocationRule::Device)]
    #[case(ResourceClass::Texture2D, AllocationRule::Placeholder)]
    #[case(ResourceClass::Texture1D, AllocationRule::Skip)]
    #[case(ResourceClass::Texture3D, AllocationRule::Skip)]
    #[case(ResourceClass::TextureCube, AllocationRule::Skip)]
    #[case(ResourceClass::Array { element_count: 0 }, AllocationRule::Device)]
    #[case(ResourceClass::Array { element_count: 4 }, AllocationRule::Skip)]
    #[case(ResourceClass::Scalar, AllocationRule::Skip)]
    fn test_allocation_rule(#[case] class: ResourceClass, #[case] rule: AllocationRule) {
        assert_eq!(allocation_rule(class), rule);
    }

    #[test]
    fn test_strict_mode_rejects_textures() {
        let backend = HostBackend::new();
        let context = backend.acquire(DeviceSelection::Auto).unwrap();
        let mut graph = ResourceGraph::new();
        graph.add_value(Value::zeroed(None, 8));
        let texture = TypeLayout::texture(ResourceShape::Texture2D, TypeLayout::vector(4, 4));
        let texture = graph.add_value(Value::uninit(Some(texture), 64));

        let mut targets = DeviceTargets::new(graph.len());
        assert_eq!(allocate_all(&context, &graph, &mut targets, false).unwrap(), 1);
        drop(targets);

        let mut targets = DeviceTargets::new(graph.len());
        let err = allocate_all(&context, &graph, &mut targets, true).unwrap_err();
        assert!(matches!(err, ComputeError::UnsupportedResource { value, .. } if value == texture));
        assert_eq!(targets.live(), 1);
    }
}
