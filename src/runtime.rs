//! The backend capability interface.
//!
//! The core never talks to a graphics API directly; everything it needs
//! from the backend is expressed through [`RuntimeDevice`]. A backend
//! implements the trait once and the compiler works unchanged on top of
//! it.

use crate::error::Result;
use crate::resource::ResourceDesc;

/// Backend handle to a created memory heap.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub struct HeapHandle(pub u64);

/// Backend handle to a created resource.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub struct ResourceHandle(pub u64);

/// Memory footprint of a resource as reported by the backend.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct MemoryRequirements {
    pub size: u64,
    pub alignment: u64,
    pub memory_type_index: u32,
}

impl MemoryRequirements {
    pub const ZERO: MemoryRequirements = MemoryRequirements {
        size: 0,
        alignment: 1,
        memory_type_index: 0,
    };
}

/// Capabilities the memory planner and the allocate phase require from a
/// backend.
pub trait RuntimeDevice {
    /// Size, alignment and memory type for a resource with `desc`.
    fn describe_memory(&self, desc: &ResourceDesc) -> MemoryRequirements;

    fn create_heap(&mut self, memory_type_index: u32, size: u64) -> Result<HeapHandle>;

    fn destroy_heap(&mut self, heap: HeapHandle);

    fn create_resource(
        &mut self,
        desc: &ResourceDesc,
        heap: HeapHandle,
        offset: u64,
    ) -> Result<ResourceHandle>;

    fn destroy_resource(&mut self, resource: ResourceHandle);

    /// Size used when the planner has to create a heap and no placement
    /// demands more.
    fn default_heap_size(&self) -> u64 {
        64 * 1024 * 1024
    }

    /// Placement alignment every heap guarantees.
    fn heap_alignment(&self) -> u64 {
        64 * 1024
    }
}

/// A backend that creates nothing. Sizes are a deterministic function of
/// the descriptor, which makes it the reference device for tests and for
/// dry-run compilation without a graphics API.
pub struct NullDevice {
    next_handle: u64,
}

impl NullDevice {
    pub fn new() -> NullDevice {
        NullDevice { next_handle: 1 }
    }

    fn take_handle(&mut self) -> u64 {
        let handle = self.next_handle;
        self.next_handle += 1;
        handle
    }
}

impl Default for NullDevice {
    fn default() -> NullDevice {
        NullDevice::new()
    }
}

impl RuntimeDevice for NullDevice {
    fn describe_memory(&self, desc: &ResourceDesc) -> MemoryRequirements {
        use crate::resource::ResourceFlags;

        let size = if desc.is_buffer() {
            desc.width
        } else {
            let bpp = desc.format.bytes_per_pixel().max(1) as u64;
            let layers = desc.image_array_layers().max(1) as u64;
            let mut size = 0u64;
            for mip in 0..desc.mip_levels.max(1) {
                let w = (desc.width >> mip).max(1);
                let h = ((desc.height as u64) >> mip).max(1);
                size += w * h * bpp * layers * desc.sample_count.max(1) as u64;
            }
            size
        };
        let alignment = if desc.is_buffer() { 256 } else { 65_536 };
        let memory_type_index = if desc.flags.contains(ResourceFlags::CPU_ACCESSIBLE) {
            1
        } else {
            0
        };
        MemoryRequirements {
            size: size.max(1),
            alignment,
            memory_type_index,
        }
    }

    fn create_heap(&mut self, _memory_type_index: u32, _size: u64) -> Result<HeapHandle> {
        Ok(HeapHandle(self.take_handle()))
    }

    fn destroy_heap(&mut self, _heap: HeapHandle) {}

    fn create_resource(
        &mut self,
        _desc: &ResourceDesc,
        _heap: HeapHandle,
        _offset: u64,
    ) -> Result<ResourceHandle> {
        Ok(ResourceHandle(self.take_handle()))
    }

    fn destroy_resource(&mut self, _resource: ResourceHandle) {}

    fn default_heap_size(&self) -> u64 {
        16 * 1024 * 1024
    }
}
