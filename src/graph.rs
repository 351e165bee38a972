//! Resource graph
//!
//! An arena of [`Value`]s addressed by [`ValueId`], plus the list of
//! binding locations that reference them. Locations hold ids, never
//! ownership, so aliasing and self-references need no lifetime handling.
//! Device allocations live in a separate [`DeviceTargets`] table so the
//! graph itself stays backend independent.

use std::fmt;

use crate::backend::DeviceAddress;
use crate::error::{ComputeError, Result};
use crate::reflection::{ResourceClass, TypeLayout, POINTER_SIZE};

/// Stable index of a value in its [`ResourceGraph`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ValueId(usize);

impl ValueId {
    pub fn index(self) -> usize {
        self.0
    }
}

impl fmt::Display for ValueId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// One binding-resolvable entity
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Value {
    /// Layout the value was created for; `None` is treated as a constant buffer
    pub layout: Option<TypeLayout>,
    pub size: usize,
    /// Host bytes, always `size` long when present
    pub data: Option<Vec<u8>>,
    /// Index of the test-input entry this value came from
    pub user_index: Option<usize>,
}

impl Value {
    /// A value with zeroed host memory
    pub fn zeroed(layout: Option<TypeLayout>, size: usize) -> Self {
        Self {
            layout,
            size,
            data: Some(vec![0; size]),
            user_index: None,
        }
    }

    /// A value initialized from host bytes
    pub fn with_data(layout: Option<TypeLayout>, data: Vec<u8>) -> Self {
        Self {
            layout,
            size: data.len(),
            data: Some(data),
            user_index: None,
        }
    }

    /// A value with no host content (pure output)
    pub fn uninit(layout: Option<TypeLayout>, size: usize) -> Self {
        Self {
            layout,
            size,
            data: None,
            user_index: None,
        }
    }

    pub fn with_user_index(mut self, index: usize) -> Self {
        self.user_index = Some(index);
        self
    }

    pub fn class(&self) -> ResourceClass {
        self.layout
            .as_ref()
            .map_or(ResourceClass::ConstantBuffer, TypeLayout::resource_class)
    }
}

/// A pointer-sized slot inside some parameter memory block
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BindLocation {
    /// Value whose host bytes contain the slot
    pub container: ValueId,
    pub offset: usize,
    pub layout: TypeLayout,
}

impl BindLocation {
    pub fn new(container: ValueId, offset: usize, layout: TypeLayout) -> Self {
        Self {
            container,
            offset,
            layout,
        }
    }
}

/// Append-only arena of values and their bindings
#[derive(Debug, Clone, Default)]
pub struct ResourceGraph {
    values: Vec<Value>,
    bindings: Vec<(BindLocation, Option<ValueId>)>,
    root: Option<ValueId>,
    entry_point: Option<ValueId>,
}

impl ResourceGraph {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_value(&mut self, value: Value) -> ValueId {
        let id = ValueId(self.values.len());
        self.values.push(value);
        id
    }

    /// Record that `location` resolves to `value`
    pub fn bind(&mut self, location: BindLocation, value: Option<ValueId>) -> Result<()> {
        self.check_id(location.container)?;
        if let Some(value) = value {
            self.check_id(value)?;
        }
        self.bindings.push((location, value));
        Ok(())
    }

    /// Set the global uniform block
    pub fn set_root_value(&mut self, id: ValueId) -> Result<()> {
        self.check_id(id)?;
        self.root = Some(id);
        Ok(())
    }

    /// Set the entry-point uniform block
    pub fn set_entry_point_value(&mut self, id: ValueId) -> Result<()> {
        self.check_id(id)?;
        self.entry_point = Some(id);
        Ok(())
    }

    pub fn root_value(&self) -> Option<ValueId> {
        self.root
    }

    pub fn entry_point_value(&self) -> Option<ValueId> {
        self.entry_point
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn value(&self, id: ValueId) -> Option<&Value> {
        self.values.get(id.0)
    }

    pub fn value_mut(&mut self, id: ValueId) -> Option<&mut Value> {
        self.values.get_mut(id.0)
    }

    pub fn values(&self) -> impl Iterator<Item = (ValueId, &Value)> {
        self.values.iter().enumerate().map(|(i, v)| (ValueId(i), v))
    }

    pub fn bindings(&self) -> &[(BindLocation, Option<ValueId>)] {
        &self.bindings
    }

    /// Host bytes of a value, if it has any
    pub fn data(&self, id: ValueId) -> Option<&[u8]> {
        self.value(id).and_then(|v| v.data.as_deref())
    }

    /// Write a device address into the pointer slot at `location`
    pub fn write_pointer(&mut self, location: &BindLocation, address: u64) -> Result<()> {
        let container = location.container;
        let value = self
            .values
            .get_mut(container.0)
            .ok_or_else(|| ComputeError::Layout(format!("unknown container value {}", container)))?;
        let size = value.size;
        let data = value.data.as_mut().ok_or_else(|| {
            ComputeError::Layout(format!("container value {} has no host memory", container))
        })?;

        let end = location.offset.checked_add(POINTER_SIZE);
        match end {
            Some(end) if end <= data.len() => {
                data[location.offset..end].copy_from_slice(&address.to_le_bytes());
                Ok(())
            }
            _ => Err(ComputeError::SlotOutOfBounds {
                container,
                offset: location.offset,
                width: POINTER_SIZE,
                size,
            }),
        }
    }

    /// Read back a pointer slot (little endian)
    pub fn read_pointer(&self, location: &BindLocation) -> Option<u64> {
        let data = self.data(location.container)?;
        let end = location.offset.checked_add(POINTER_SIZE)?;
        let bytes = data.get(location.offset..end)?;
        let mut raw = [0u8; POINTER_SIZE];
        raw.copy_from_slice(bytes);
        Some(u64::from_le_bytes(raw))
    }

    fn check_id(&self, id: ValueId) -> Result<()> {
        if id.0 < self.values.len() {
            Ok(())
        } else {
            Err(ComputeError::Layout(format!("unknown value {}", id)))
        }
    }
}

/// Device allocations of one execution, one optional slot per value
///
/// Allocations are released when taken out by [`release_all`](Self::release_all)
/// or when the table is dropped, whichever happens first.
pub struct DeviceTargets<A: DeviceAddress> {
    slots: Vec<Option<A>>,
}

impl<A: DeviceAddress> DeviceTargets<A> {
    pub fn new(value_count: usize) -> Self {
        Self {
            slots: (0..value_count).map(|_| None).collect(),
        }
    }

    /// Attach an allocation to a value; a value is allocated at most once
    pub fn insert(&mut self, id: ValueId, allocation: A) -> Result<()> {
        if id.0 >= self.slots.len() {
            self.slots.resize_with(id.0 + 1, || None);
        }
        let slot = &mut self.slots[id.0];
        if slot.is_some() {
            return Err(ComputeError::DuplicateAllocation(id));
        }
        *slot = Some(allocation);
        Ok(())
    }

    pub fn get(&self, id: ValueId) -> Option<&A> {
        self.slots.get(id.0).and_then(Option::as_ref)
    }

    /// Device address for a value, if it was allocated
    pub fn address(&self, id: ValueId) -> Option<u64> {
        self.get(id).and_then(DeviceAddress::device_address)
    }

    /// Number of live allocations
    pub fn live(&self) -> usize {
        self.slots.iter().filter(|s| s.is_some()).count()
    }

    /// Release every allocation, returning how many were released
    pub fn release_all(&mut self) -> usize {
        let mut released = 0;
        for slot in &mut self.slots {
            if let Some(allocation) = slot.take() {
                drop(allocation);
                released += 1;
            }
        }
        released
    }
}

impl<A: DeviceAddress> Drop for DeviceTargets<A> {
    fn drop(&mut self) {
        let released = self.release_all();
        if released > 0 {
            log::debug!("Released {} device allocation(s) on drop", released);
        }
    }
}
