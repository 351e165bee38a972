//! Resource layout binding
//!
//! Turns a [`ProgramReflection`] plus a list of test-input entries into a
//! [`ResourceGraph`]. The global and entry-point uniform blocks become the
//! root values; every nested constant buffer or parameter block gets a
//! zeroed default value; each input entry is then bound at the location its
//! dotted binding path names.

use std::collections::HashMap;

use crate::error::{ComputeError, Result};
use crate::graph::{BindLocation, ResourceGraph, Value, ValueId};
use crate::reflection::{ProgramReflection, ResourceClass, Stage, TypeKind, VarLayout};

/// What an input entry describes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryKind {
    /// Bytes for a uniform field or a constant buffer's contents
    Uniform,
    Buffer,
    Texture,
}

/// One test-input entry
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InputEntry {
    /// Dotted path, e.g. `params.data`
    pub binding: String,
    pub kind: EntryKind,
    /// Initial content; `None` for pure outputs
    pub data: Option<Vec<u8>>,
    /// Byte size of the resource
    pub size: usize,
    /// Read back after execution
    pub is_output: bool,
}

impl InputEntry {
    pub fn uniform(binding: impl Into<String>, data: Vec<u8>) -> Self {
        Self {
            binding: binding.into(),
            kind: EntryKind::Uniform,
            size: data.len(),
            data: Some(data),
            is_output: false,
        }
    }

    pub fn buffer(binding: impl Into<String>, data: Vec<u8>) -> Self {
        Self {
            binding: binding.into(),
            kind: EntryKind::Buffer,
            size: data.len(),
            data: Some(data),
            is_output: false,
        }
    }

    /// A buffer with no initial content that is read back
    pub fn output_buffer(binding: impl Into<String>, size: usize) -> Self {
        Self {
            binding: binding.into(),
            kind: EntryKind::Buffer,
            data: None,
            size,
            is_output: true,
        }
    }

    pub fn texture(binding: impl Into<String>, size: usize) -> Self {
        Self {
            binding: binding.into(),
            kind: EntryKind::Texture,
            data: None,
            size,
            is_output: false,
        }
    }

    /// Mark the entry to be read back
    pub fn as_output(mut self) -> Self {
        self.is_output = true;
        self
    }
}

/// Reflection plus the entries to bind against it
#[derive(Debug, Clone)]
pub struct ResourceLayout {
    pub reflection: ProgramReflection,
    pub entries: Vec<InputEntry>,
}

impl ResourceLayout {
    pub fn new(reflection: ProgramReflection) -> Self {
        Self {
            reflection,
            entries: Vec::new(),
        }
    }

    pub fn with_entry(mut self, entry: InputEntry) -> Self {
        self.entries.push(entry);
        self
    }
}

/// A compiled kernel for one pipeline stage
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompiledKernel {
    pub stage: Stage,
    /// Backend-loadable image (PTX text, cubin, ...)
    pub code: Vec<u8>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CompiledProgram {
    pub kernels: Vec<CompiledKernel>,
}

impl CompiledProgram {
    /// A program holding a single compute kernel
    pub fn compute(code: impl Into<Vec<u8>>) -> Self {
        Self {
            kernels: vec![CompiledKernel {
                stage: Stage::Compute,
                code: code.into(),
            }],
        }
    }

    pub fn compute_kernel(&self) -> Option<&CompiledKernel> {
        self.kernels.iter().find(|k| k.stage == Stage::Compute)
    }
}

/// The value an input entry produced
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BoundEntry {
    /// `None` when the entry was written straight into a uniform block
    pub value: Option<ValueId>,
    pub is_output: bool,
}

/// A bound graph and the per-entry bookkeeping needed to read results back
#[derive(Debug, Clone, Default)]
pub struct BoundResources {
    pub graph: ResourceGraph,
    pub entries: Vec<BoundEntry>,
}

/// Binds a layout into a fresh [`ResourceGraph`]
pub struct BindRoot<'a> {
    reflection: &'a ProgramReflection,
    graph: ResourceGraph,
    /// Default value of each constant buffer / parameter block slot
    defaults: HashMap<(ValueId, usize), ValueId>,
}

impl<'a> BindRoot<'a> {
    /// Create the uniform blocks and default values for `reflection`
    pub fn new(reflection: &'a ProgramReflection) -> Result<Self> {
        let mut root = Self {
            reflection,
            graph: ResourceGraph::new(),
            defaults: HashMap::new(),
        };

        if reflection.uniform_size > 0 {
            let id = root.graph.add_value(Value::zeroed(None, reflection.uniform_size));
            root.graph.set_root_value(id)?;
            root.add_default_values(id, 0, &reflection.parameters)?;
        }

        if let Some(entry_point) = reflection.entry_point(0) {
            if entry_point.uniform_size > 0 {
                let id = root.graph.add_value(Value::zeroed(None, entry_point.uniform_size));
                root.graph.set_entry_point_value(id)?;
                root.add_default_values(id, 0, &entry_point.parameters)?;
            }
        }

        Ok(root)
    }

    /// Bind every entry and hand back the finished graph
    pub fn bind(mut self, entries: &[InputEntry]) -> Result<BoundResources> {
        let mut bound = Vec::with_capacity(entries.len());
        for (index, entry) in entries.iter().enumerate() {
            let value = self.bind_entry(index, entry)?;
            bound.push(BoundEntry {
                value,
                is_output: entry.is_output,
            });
        }

        log::debug!(
            "Bound {} entries into {} values, {} binding locations",
            entries.len(),
            self.graph.len(),
            self.graph.bindings().len()
        );

        Ok(BoundResources {
            graph: self.graph,
            entries: bound,
        })
    }

    pub fn graph(&self) -> &ResourceGraph {
        &self.graph
    }

    fn add_default_values(
        &mut self,
        container: ValueId,
        base: usize,
        fields: &[VarLayout],
    ) -> Result<()> {
        for field in fields {
            let offset = base + field.offset;
            let layout = &field.type_layout;

            if layout.resource_class().is_parameter_memory() {
                let element_fields = layout.element_layout().map(|e| e.fields()).unwrap_or(&[]);
                let size = layout.element_layout().map_or(0, |e| e.size);
                let value = self.graph.add_value(Value::zeroed(Some(layout.clone()), size));
                self.graph.bind(
                    BindLocation::new(container, offset, layout.clone()),
                    Some(value),
                )?;
                self.defaults.insert((container, offset), value);
                self.add_default_values(value, 0, element_fields)?;
            } else if let TypeKind::Struct { fields } = &layout.kind {
                self.add_default_values(container, offset, fields)?;
            }
        }
        Ok(())
    }

    /// Resolve a dotted binding path to its slot
    pub fn find(&self, path: &str) -> Result<BindLocation> {
        let mut segments = path.split('.');
        let first = segments
            .next()
            .filter(|s| !s.is_empty())
            .ok_or_else(|| ComputeError::Layout("empty binding path".to_string()))?;

        let entry_point = self.reflection.entry_point(0);
        let (mut container, mut field) = if let Some(field) =
            self.reflection.parameters.iter().find(|p| p.name == first)
        {
            (self.graph.root_value(), field)
        } else if let Some(field) = entry_point
            .and_then(|e| e.parameters.iter().find(|p| p.name == first))
        {
            (self.graph.entry_point_value(), field)
        } else {
            return Err(ComputeError::Layout(format!("no parameter named '{}'", first)));
        };
        let mut base = 0;

        for segment in segments {
            let layout = &field.type_layout;
            let parent = container
                .ok_or_else(|| ComputeError::Layout(format!("'{}' has no uniform block", path)))?;
            let fields = if layout.resource_class().is_parameter_memory() {
                container = self.defaults.get(&(parent, base + field.offset)).copied();
                base = 0;
                layout.element_layout().map(|e| e.fields()).unwrap_or(&[])
            } else if let TypeKind::Struct { fields } = &layout.kind {
                base += field.offset;
                fields.as_slice()
            } else {
                return Err(ComputeError::Layout(format!(
                    "'{}' in '{}' has no fields",
                    field.name, path
                )));
            };

            field = fields.iter().find(|f| f.name == segment).ok_or_else(|| {
                ComputeError::Layout(format!("no field named '{}' in '{}'", segment, path))
            })?;
        }

        let container = container
            .ok_or_else(|| ComputeError::Layout(format!("'{}' has no uniform block", path)))?;
        Ok(BindLocation::new(
            container,
            base + field.offset,
            field.type_layout.clone(),
        ))
    }

    fn bind_entry(&mut self, index: usize, entry: &InputEntry) -> Result<Option<ValueId>> {
        let location = self.find(&entry.binding)?;
        let data = entry.data.as_deref().unwrap_or(&[]);
        let class = location.layout.resource_class();

        if class.is_parameter_memory() {
            let id = self
                .defaults
                .get(&(location.container, location.offset))
                .copied()
                .ok_or_else(|| {
                    ComputeError::Layout(format!("no default value for '{}'", entry.binding))
                })?;
            let value = self
                .graph
                .value_mut(id)
                .ok_or_else(|| ComputeError::Layout(format!("unknown value {}", id)))?;
            copy_into(value, 0, data, &entry.binding)?;
            value.user_index = Some(index);
            return Ok(Some(id));
        }

        if class == ResourceClass::Scalar || entry.kind == EntryKind::Uniform {
            if data.len() > location.layout.size {
                return Err(ComputeError::Layout(format!(
                    "{} bytes do not fit '{}' ({} bytes)",
                    data.len(),
                    entry.binding,
                    location.layout.size
                )));
            }
            let container = self
                .graph
                .value_mut(location.container)
                .ok_or_else(|| ComputeError::Layout(format!("unknown value {}", location.container)))?;
            copy_into(container, location.offset, data, &entry.binding)?;
            return Ok(None);
        }

        if data.len() > entry.size {
            return Err(ComputeError::Layout(format!(
                "'{}' has {} bytes of data but a size of {}",
                entry.binding,
                data.len(),
                entry.size
            )));
        }
        let value = match &entry.data {
            Some(bytes) => {
                let mut bytes = bytes.clone();
                bytes.resize(entry.size, 0);
                Value::with_data(Some(location.layout.clone()), bytes)
            }
            None => Value::uninit(Some(location.layout.clone()), entry.size),
        };
        let id = self.graph.add_value(value.with_user_index(index));
        self.graph.bind(location, Some(id))?;
        Ok(Some(id))
    }
}

/// Copy `data` into a value's host bytes at `offset`
fn copy_into(value: &mut Value, offset: usize, data: &[u8], binding: &str) -> Result<()> {
    let size = value.size;
    let bytes = value.data.get_or_insert_with(|| vec![0; size]);
    let dst = offset
        .checked_add(data.len())
        .and_then(|end| bytes.get_mut(offset..end))
        .ok_or_else(|| {
            ComputeError::Layout(format!(
                "{} bytes for '{}' do not fit at offset {} of a {} byte block",
                data.len(),
                binding,
                offset,
                size
            ))
        })?;
    dst.copy_from_slice(data);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reflection::{EntryPointReflection, TypeLayout};

    fn nested_reflection() -> ProgramReflection {
        let params = TypeLayout::structure(
            16,
            vec![
                VarLayout::new("scale", 0, TypeLayout::scalar(4)),
                VarLayout::new("data", 8, TypeLayout::byte_address_buffer()),
            ],
        );
        ProgramReflection::new()
            .with_parameter(VarLayout::new("input", 0, TypeLayout::byte_address_buffer()))
            .with_parameter(VarLayout::new("params", 8, TypeLayout::constant_buffer(params)))
            .with_entry_point(
                EntryPointReflection::compute("computeMain", [1, 1, 1])
                    .with_parameter(VarLayout::new("count", 0, TypeLayout::scalar(4))),
            )
    }

    #[test]
    fn test_uniform_blocks_and_defaults() {
        let reflection = nested_reflection();
        let root = BindRoot::new(&reflection).unwrap();
        let graph = root.graph();

        // root, entry point, params default
        assert_eq!(graph.len(), 3);
        assert_eq!(graph.value(graph.root_value().unwrap()).unwrap().size, 16);
        assert_eq!(graph.value(graph.entry_point_value().unwrap()).unwrap().size, 4);
        assert_eq!(graph.bindings().len(), 1);
    }

    #[test]
    fn test_find_nested_path() {
        let reflection = nested_reflection();
        let root = BindRoot::new(&reflection).unwrap();

        let input = root.find("input").unwrap();
        assert_eq!(input.container, root.graph().root_value().unwrap());
        assert_eq!(input.offset, 0);

        let data = root.find("params.data").unwrap();
        assert_ne!(data.container, input.container);
        assert_eq!(data.offset, 8);
        assert_eq!(data.layout.resource_class(), ResourceClass::ByteAddressBuffer);

        let count = root.find("count").unwrap();
        assert_eq!(count.container, root.graph().entry_point_value().unwrap());

        assert!(root.find("missing").is_err());
        assert!(root.find("input.x").is_err());
        assert!(root.find("").is_err());
    }

    #[test]
    fn test_bind_entries() {
        let reflection = nested_reflection();
        let bound = BindRoot::new(&reflection)
            .unwrap()
            .bind(&[
                InputEntry::buffer("input", vec![1, 2, 3]),
                InputEntry::output_buffer("params.data", 32),
                InputEntry::uniform("params", 2.0f32.to_le_bytes().to_vec()),
                InputEntry::uniform("count", 7u32.to_le_bytes().to_vec()),
            ])
            .unwrap();
        let graph = &bound.graph;

        let input = bound.entries[0].value.unwrap();
        assert_eq!(graph.data(input), Some(&[1u8, 2, 3][..]));
        assert_eq!(graph.value(input).unwrap().user_index, Some(0));

        let output = bound.entries[1].value.unwrap();
        assert!(bound.entries[1].is_output);
        assert_eq!(graph.value(output).unwrap().size, 32);
        assert!(graph.data(output).is_none());

        let params = bound.entries[2].value.unwrap();
        assert_eq!(&graph.data(params).unwrap()[..4], &2.0f32.to_le_bytes());
        assert_eq!(graph.value(params).unwrap().user_index, Some(2));

        assert_eq!(bound.entries[3].value, None);
        let entry_point = graph.entry_point_value().unwrap();
        assert_eq!(graph.data(entry_point), Some(&7u32.to_le_bytes()[..]));
    }

    #[test]
    fn test_oversized_uniform_is_rejected() {
        let reflection = nested_reflection();
        let result = BindRoot::new(&reflection)
            .unwrap()
            .bind(&[InputEntry::uniform("count", vec![0; 8])]);
        assert!(matches!(result, Err(ComputeError::Layout(_))));
    }

    #[test]
    fn test_compute_kernel_lookup() {
        let program = CompiledProgram {
            kernels: vec![CompiledKernel {
                stage: Stage::Vertex,
                code: vec![1],
            }],
        };
        assert!(program.compute_kernel().is_none());
        assert_eq!(CompiledProgram::compute(vec![2]).compute_kernel().unwrap().code, vec![2]);
    }
}
