//! Shader reflection model
//!
//! A typed, already-validated description of a compiled program: its global
//! parameters, the layout of every parameter type, and its entry points.
//! The model can be built in code or deserialized from JSON.
//!
//! # JSON shape
//!
//! ```json
//! {
//!   "uniform_size": 16,
//!   "parameters": [
//!     { "name": "input", "offset": 0,
//!       "type": { "kind": "resource", "size": 8, "shape": "structured_buffer" } }
//!   ],
//!   "entry_points": [
//!     { "name": "computeMain", "thread_group_size": [4, 1, 1] }
//!   ]
//! }
//! ```

use serde::{Deserialize, Serialize};

use crate::error::Result;

/// Size of a device pointer slot in parameter memory
pub const POINTER_SIZE: usize = std::mem::size_of::<u64>();

/// Pipeline stage of an entry point or compiled kernel
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    #[default]
    Compute,
    Vertex,
    Fragment,
}

/// Base shape of a resource type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ResourceShape {
    #[serde(rename = "texture_1d")]
    Texture1D,
    #[serde(rename = "texture_2d")]
    Texture2D,
    #[serde(rename = "texture_3d")]
    Texture3D,
    #[serde(rename = "texture_cube")]
    TextureCube,
    #[serde(rename = "texture_buffer")]
    TextureBuffer,
    #[serde(rename = "structured_buffer")]
    StructuredBuffer,
    #[serde(rename = "byte_address_buffer")]
    ByteAddressBuffer,
    #[serde(rename = "unknown")]
    Unknown,
}

/// Kind of a reflected type, with the nested layouts each kind carries
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TypeKind {
    Scalar,
    Vector {
        element_count: usize,
    },
    Matrix,
    Struct {
        #[serde(default)]
        fields: Vec<VarLayout>,
    },
    /// `element_count == 0` means an unbounded array passed as a pointer
    Array {
        element_count: usize,
        element: Box<TypeLayout>,
    },
    ConstantBuffer {
        element: Box<TypeLayout>,
    },
    ParameterBlock {
        element: Box<TypeLayout>,
    },
    Resource {
        shape: ResourceShape,
        #[serde(default)]
        result: Option<Box<TypeLayout>>,
    },
    SamplerState,
}

/// Layout of a reflected type
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TypeLayout {
    /// Bytes the type occupies in the parameter memory that contains it
    pub size: usize,
    #[serde(flatten)]
    pub kind: TypeKind,
}

/// A named field/parameter and its byte offset within its parent
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VarLayout {
    pub name: String,
    #[serde(default)]
    pub offset: usize,
    #[serde(rename = "type")]
    pub type_layout: TypeLayout,
}

/// How the engine treats a value or binding location
///
/// This is the closed set the allocation and patch passes dispatch on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResourceClass {
    ConstantBuffer,
    ParameterBlock,
    StructuredBuffer,
    ByteAddressBuffer,
    Texture1D,
    Texture2D,
    Texture3D,
    TextureCube,
    TextureBuffer,
    Array { element_count: usize },
    Scalar,
    Unsupported,
}

impl ResourceClass {
    /// Classes whose Values are a block of parameter memory with nested slots
    pub fn is_parameter_memory(&self) -> bool {
        matches!(self, ResourceClass::ConstantBuffer | ResourceClass::ParameterBlock)
    }

    pub fn is_texture(&self) -> bool {
        matches!(
            self,
            ResourceClass::Texture1D
                | ResourceClass::Texture2D
                | ResourceClass::Texture3D
                | ResourceClass::TextureCube
                | ResourceClass::TextureBuffer
        )
    }
}

impl TypeLayout {
    pub fn new(size: usize, kind: TypeKind) -> Self {
        Self { size, kind }
    }

    pub fn scalar(size: usize) -> Self {
        Self::new(size, TypeKind::Scalar)
    }

    pub fn vector(element_count: usize, element_size: usize) -> Self {
        Self::new(element_count * element_size, TypeKind::Vector { element_count })
    }

    pub fn structure(size: usize, fields: Vec<VarLayout>) -> Self {
        Self::new(size, TypeKind::Struct { fields })
    }

    pub fn array(element_count: usize, element: TypeLayout) -> Self {
        let size = if element_count == 0 {
            POINTER_SIZE
        } else {
            element_count * element.size
        };
        Self::new(
            size,
            TypeKind::Array {
                element_count,
                element: Box::new(element),
            },
        )
    }

    /// An array with no declared length, passed as a pointer
    pub fn unbounded_array(element: TypeLayout) -> Self {
        Self::array(0, element)
    }

    pub fn constant_buffer(element: TypeLayout) -> Self {
        Self::new(
            POINTER_SIZE,
            TypeKind::ConstantBuffer {
                element: Box::new(element),
            },
        )
    }

    pub fn parameter_block(element: TypeLayout) -> Self {
        Self::new(
            POINTER_SIZE,
            TypeKind::ParameterBlock {
                element: Box::new(element),
            },
        )
    }

    pub fn resource(shape: ResourceShape, result: Option<TypeLayout>) -> Self {
        Self::new(
            POINTER_SIZE,
            TypeKind::Resource {
                shape,
                result: result.map(Box::new),
            },
        )
    }

    pub fn structured_buffer(element: TypeLayout) -> Self {
        Self::resource(ResourceShape::StructuredBuffer, Some(element))
    }

    pub fn byte_address_buffer() -> Self {
        Self::resource(ResourceShape::ByteAddressBuffer, None)
    }

    pub fn texture(shape: ResourceShape, texel: TypeLayout) -> Self {
        Self::resource(shape, Some(texel))
    }

    /// Resource class the engine dispatches on
    pub fn resource_class(&self) -> ResourceClass {
        match &self.kind {
            TypeKind::ConstantBuffer { .. } => ResourceClass::ConstantBuffer,
            TypeKind::ParameterBlock { .. } => ResourceClass::ParameterBlock,
            TypeKind::Array { element_count, .. } => ResourceClass::Array {
                element_count: *element_count,
            },
            TypeKind::Resource { shape, .. } => match shape {
                ResourceShape::StructuredBuffer => ResourceClass::StructuredBuffer,
                ResourceShape::ByteAddressBuffer => ResourceClass::ByteAddressBuffer,
                ResourceShape::Texture1D => ResourceClass::Texture1D,
                ResourceShape::Texture2D => ResourceClass::Texture2D,
                ResourceShape::Texture3D => ResourceClass::Texture3D,
                ResourceShape::TextureCube => ResourceClass::TextureCube,
                ResourceShape::TextureBuffer => ResourceClass::TextureBuffer,
                ResourceShape::Unknown => ResourceClass::Unsupported,
            },
            TypeKind::Scalar | TypeKind::Vector { .. } | TypeKind::Matrix => ResourceClass::Scalar,
            TypeKind::Struct { .. } | TypeKind::SamplerState => ResourceClass::Unsupported,
        }
    }

    /// Layout of the memory a constant buffer or parameter block points at
    pub fn element_layout(&self) -> Option<&TypeLayout> {
        match &self.kind {
            TypeKind::ConstantBuffer { element }
            | TypeKind::ParameterBlock { element }
            | TypeKind::Array { element, .. } => Some(element),
            _ => None,
        }
    }

    /// Fields of a struct type
    pub fn fields(&self) -> &[VarLayout] {
        match &self.kind {
            TypeKind::Struct { fields } => fields,
            _ => &[],
        }
    }

    /// Components per texel of a texture (vector element count, else 1)
    pub fn texel_component_count(&self) -> usize {
        match &self.kind {
            TypeKind::Resource {
                result: Some(result),
                ..
            } => match result.kind {
                TypeKind::Vector { element_count } => element_count,
                _ => 1,
            },
            _ => 1,
        }
    }
}

impl VarLayout {
    pub fn new(name: impl Into<String>, offset: usize, type_layout: TypeLayout) -> Self {
        Self {
            name: name.into(),
            offset,
            type_layout,
        }
    }
}

fn default_thread_group_size() -> [u32; 3] {
    [1, 1, 1]
}

/// A reflected entry point
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntryPointReflection {
    pub name: String,
    #[serde(default)]
    pub stage: Stage,
    #[serde(default = "default_thread_group_size")]
    pub thread_group_size: [u32; 3],
    /// Entry-point-local uniform parameters
    #[serde(default)]
    pub parameters: Vec<VarLayout>,
    /// Size of the entry-point uniform block
    #[serde(default)]
    pub uniform_size: usize,
}

impl EntryPointReflection {
    pub fn compute(name: impl Into<String>, thread_group_size: [u32; 3]) -> Self {
        Self {
            name: name.into(),
            stage: Stage::Compute,
            thread_group_size,
            parameters: Vec::new(),
            uniform_size: 0,
        }
    }

    /// Add an entry-point uniform parameter, growing the uniform block to fit
    pub fn with_parameter(mut self, parameter: VarLayout) -> Self {
        self.uniform_size = self
            .uniform_size
            .max(parameter.offset + parameter.type_layout.size);
        self.parameters.push(parameter);
        self
    }

    /// Total threads in one thread group, `None` if the product overflows
    pub fn thread_count(&self) -> Option<u64> {
        self.thread_group_size
            .iter()
            .try_fold(1u64, |total, &n| total.checked_mul(u64::from(n)))
    }
}

/// Reflection of a whole compiled program
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ProgramReflection {
    /// Global (root) uniform parameters
    #[serde(default)]
    pub parameters: Vec<VarLayout>,
    /// Size of the global uniform block
    #[serde(default)]
    pub uniform_size: usize,
    #[serde(default)]
    pub entry_points: Vec<EntryPointReflection>,
}

impl ProgramReflection {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse a reflection document
    pub fn from_json(source: &str) -> Result<Self> {
        Ok(serde_json::from_str(source)?)
    }

    /// Add a global parameter, growing the global uniform block to fit
    pub fn with_parameter(mut self, parameter: VarLayout) -> Self {
        self.uniform_size = self
            .uniform_size
            .max(parameter.offset + parameter.type_layout.size);
        self.parameters.push(parameter);
        self
    }

    pub fn with_entry_point(mut self, entry_point: EntryPointReflection) -> Self {
        self.entry_points.push(entry_point);
        self
    }

    pub fn entry_point_count(&self) -> usize {
        self.entry_points.len()
    }

    pub fn entry_point(&self, index: usize) -> Option<&EntryPointReflection> {
        self.entry_points.get(index)
    }

    pub fn compute_thread_group_size(&self, index: usize) -> Option<[u32; 3]> {
        self.entry_point(index).map(|e| e.thread_group_size)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resource_class_dispatch() {
        let int = TypeLayout::scalar(4);
        assert_eq!(
            TypeLayout::constant_buffer(int.clone()).resource_class(),
            ResourceClass::ConstantBuffer
        );
        assert_eq!(
            TypeLayout::structured_buffer(int.clone()).resource_class(),
            ResourceClass::StructuredBuffer
        );
        assert_eq!(
            TypeLayout::byte_address_buffer().resource_class(),
            ResourceClass::ByteAddressBuffer
        );
        assert_eq!(
            TypeLayout::unbounded_array(int.clone()).resource_class(),
            ResourceClass::Array { element_count: 0 }
        );
        assert_eq!(
            TypeLayout::texture(ResourceShape::TextureCube, int.clone()).resource_class(),
            ResourceClass::TextureCube
        );
        assert_eq!(TypeLayout::vector(3, 4).resource_class(), ResourceClass::Scalar);
        assert_eq!(
            TypeLayout::new(0, TypeKind::SamplerState).resource_class(),
            ResourceClass::Unsupported
        );
    }

    #[test]
    fn test_texel_component_count() {
        let float4 = TypeLayout::vector(4, 4);
        assert_eq!(
            TypeLayout::texture(ResourceShape::Texture2D, float4).texel_component_count(),
            4
        );
        assert_eq!(
            TypeLayout::texture(ResourceShape::Texture2D, TypeLayout::scalar(4))
                .texel_component_count(),
            1
        );
    }

    #[test]
    fn test_parse_json() {
        let source = r#"{
            "uniform_size": 24,
            "parameters": [
                { "name": "input", "offset": 0,
                  "type": { "kind": "resource", "size": 8, "shape": "structured_buffer",
                            "result": { "kind": "scalar", "size": 4 } } },
                { "name": "params", "offset": 8,
                  "type": { "kind": "constant_buffer", "size": 8,
                            "element": { "kind": "struct", "size": 8, "fields": [
                                { "name": "scale", "offset": 0, "type": { "kind": "scalar", "size": 4 } }
                            ] } } },
                { "name": "tex", "offset": 16,
                  "type": { "kind": "resource", "size": 8, "shape": "texture_3d" } }
            ],
            "entry_points": [
                { "name": "computeMain", "thread_group_size": [4, 2, 1] }
            ]
        }"#;

        let reflection = ProgramReflection::from_json(source).unwrap();
        assert_eq!(reflection.uniform_size, 24);
        assert_eq!(reflection.entry_point_count(), 1);
        assert_eq!(reflection.compute_thread_group_size(0), Some([4, 2, 1]));
        assert_eq!(reflection.entry_points[0].stage, Stage::Compute);
        assert_eq!(
            reflection.parameters[0].type_layout.resource_class(),
            ResourceClass::StructuredBuffer
        );
        let params = &reflection.parameters[1].type_layout;
        assert_eq!(params.resource_class(), ResourceClass::ConstantBuffer);
        assert_eq!(params.element_layout().unwrap().fields()[0].name, "scale");
        assert_eq!(
            reflection.parameters[2].type_layout.resource_class(),
            ResourceClass::Texture3D
        );
    }

    #[test]
    fn test_unknown_shape_is_unsupported() {
        let source = r#"{ "kind": "resource", "size": 8, "shape": "unknown" }"#;
        let layout: TypeLayout = serde_json::from_str(source).unwrap();
        assert_eq!(layout.resource_class(), ResourceClass::Unsupported);
    }

    #[test]
    fn test_builders_grow_uniform_blocks() {
        let reflection = ProgramReflection::new()
            .with_parameter(VarLayout::new("a", 0, TypeLayout::byte_address_buffer()))
            .with_parameter(VarLayout::new("b", 16, TypeLayout::byte_address_buffer()))
            .with_entry_point(
                EntryPointReflection::compute("main", [8, 8, 1])
                    .with_parameter(VarLayout::new("n", 0, TypeLayout::scalar(4))),
            );
        assert_eq!(reflection.uniform_size, 24);
        assert_eq!(reflection.entry_points[0].uniform_size, 4);
        assert_eq!(reflection.entry_points[0].thread_count(), Some(64));
    }

    #[test]
    fn test_thread_count_overflow() {
        let huge = EntryPointReflection::compute("main", [u32::MAX; 3]);
        assert_eq!(huge.thread_count(), None);
        let wide = EntryPointReflection::compute("main", [u32::MAX, u32::MAX, 1]);
        assert_eq!(wide.thread_count(), Some(u64::from(u32::MAX) * u64::from(u32::MAX)));
    }
}
