//! Resource descriptors, declarations, and per-frame instances.
//!
//! A declaration is what the program body states; an instance is the
//! materialized resource for a given frame, carrying the resolved
//! descriptor, access union, heap placement and lifetime.

use bitflags::bitflags;

use crate::access::{AccessAttr, AccessFlags, ASPECT_COLOR, ASPECT_DEPTH, ASPECT_STENCIL};
use crate::arena::{ArenaRef, NameBuf};
use crate::graph::INDEX_NONE;
use crate::runtime::{MemoryRequirements, ResourceHandle};

/// Identifies a declared resource within one graph build.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct ResourceId(pub u32);

impl ResourceId {
    pub const INVALID: ResourceId = ResourceId(INDEX_NONE);

    pub fn index(self) -> usize {
        self.0 as usize
    }
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum ResourceType {
    Buffer,
    Image1D,
    Image2D,
    Image3D,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub enum Format {
    Unknown,
    R8Unorm,
    R8G8B8A8Unorm,
    B8G8R8A8Unorm,
    R16G16B16A16Float,
    R32G32B32A32Float,
    R16Float,
    R32Float,
    R32Uint,
    D32Float,
    D24UnormS8Uint,
}

impl Format {
    pub fn aspect_mask(self) -> u32 {
        match self {
            Format::D32Float => ASPECT_DEPTH,
            Format::D24UnormS8Uint => ASPECT_DEPTH | ASPECT_STENCIL,
            _ => ASPECT_COLOR,
        }
    }

    pub fn bytes_per_pixel(self) -> u32 {
        match self {
            Format::Unknown => 0,
            Format::R8Unorm => 1,
            Format::R16Float => 2,
            Format::R8G8B8A8Unorm
            | Format::B8G8R8A8Unorm
            | Format::R32Float
            | Format::R32Uint
            | Format::D32Float
            | Format::D24UnormS8Uint => 4,
            Format::R16G16B16A16Float => 8,
            Format::R32G32B32A32Float => 16,
        }
    }
}

bitflags! {
    pub struct ResourceFlags: u32 {
        /// Contents must be preserved across frames.
        const PERSISTENT = 1 << 0;
        /// The CPU maps this resource; it is an external output for
        /// dead-code purposes and is never aliased.
        const CPU_ACCESSIBLE = 1 << 1;
        /// Placement must not share memory with any other resource even
        /// when lifetimes permit.
        const NO_ALIASING = 1 << 2;
    }
}

/// A resource description as declared by the program body.
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct ResourceDesc {
    pub ty: ResourceType,
    pub flags: ResourceFlags,
    pub format: Format,
    /// Image width, or buffer byte size.
    pub width: u64,
    pub height: u32,
    pub depth_or_array_layers: u32,
    pub mip_levels: u32,
    pub sample_count: u32,
    pub temporal_layers: u32,
}

impl ResourceDesc {
    pub fn buffer(size: u64) -> ResourceDesc {
        ResourceDesc {
            ty: ResourceType::Buffer,
            flags: ResourceFlags::empty(),
            format: Format::Unknown,
            width: size,
            height: 1,
            depth_or_array_layers: 1,
            mip_levels: 1,
            sample_count: 1,
            temporal_layers: 1,
        }
    }

    pub fn image_2d(format: Format, width: u32, height: u32) -> ResourceDesc {
        ResourceDesc {
            ty: ResourceType::Image2D,
            flags: ResourceFlags::empty(),
            format,
            width: width as u64,
            height,
            depth_or_array_layers: 1,
            mip_levels: 1,
            sample_count: 1,
            temporal_layers: 1,
        }
    }

    pub fn with_flags(mut self, flags: ResourceFlags) -> ResourceDesc {
        self.flags |= flags;
        self
    }

    pub fn with_mips(mut self, mip_levels: u32) -> ResourceDesc {
        self.mip_levels = mip_levels;
        self
    }

    pub fn with_array_layers(mut self, layers: u32) -> ResourceDesc {
        self.depth_or_array_layers = layers;
        self
    }

    pub fn with_temporal_layers(mut self, layers: u32) -> ResourceDesc {
        self.temporal_layers = layers;
        self
    }

    pub fn is_buffer(&self) -> bool {
        self.ty == ResourceType::Buffer
    }

    pub fn image_array_layers(&self) -> u32 {
        match self.ty {
            ResourceType::Buffer | ResourceType::Image3D => 1,
            _ => self.depth_or_array_layers,
        }
    }

    /// Zero counts mean "one" in a declared descriptor.
    pub fn normalized(mut self) -> ResourceDesc {
        if self.temporal_layers == 0 {
            self.temporal_layers = 1;
        }
        if self.mip_levels == 0 {
            self.mip_levels = 1;
        }
        if self.sample_count == 0 {
            self.sample_count = 1;
        }
        if self.depth_or_array_layers == 0 {
            self.depth_or_array_layers = 1;
        }
        self
    }
}

/// A view of (a slice of) a resource passed as a node argument.
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct ResourceView {
    pub resource: ResourceId,
    pub base_mip_level: u32,
    /// `u32::MAX` selects all remaining levels.
    pub mip_levels: u32,
    pub base_array_layer: u32,
    /// `u32::MAX` selects all remaining layers.
    pub array_layers: u32,
    pub view_format: Format,
    /// How many frames back the temporal layer selection reaches.
    pub temporal_layer_offset: u32,
}

impl ResourceView {
    pub fn whole(resource: ResourceId) -> ResourceView {
        ResourceView {
            resource,
            base_mip_level: 0,
            mip_levels: !0u32,
            base_array_layer: 0,
            array_layers: !0u32,
            view_format: Format::Unknown,
            temporal_layer_offset: 0,
        }
    }

    pub fn mip(mut self, level: u32) -> ResourceView {
        self.base_mip_level = level;
        self.mip_levels = 1;
        self
    }

    pub fn array_slice(mut self, base: u32, count: u32) -> ResourceView {
        self.base_array_layer = base;
        self.array_layers = count;
        self
    }

    pub fn temporal(mut self, frames_back: u32) -> ResourceView {
        self.temporal_layer_offset = frames_back;
        self
    }
}

/// A resource declared during one graph build.
#[derive(Clone, Debug)]
pub struct ResourceDecl {
    pub name: NameBuf,
    /// Handle to the descriptor variable in the frame arena.
    pub desc_var: ArenaRef,
    /// Signature parameter backing an external resource, or `INDEX_NONE`.
    pub source_param: u32,
}

impl ResourceDecl {
    pub fn is_external(&self) -> bool {
        self.source_param != INDEX_NONE
    }
}

impl Default for ResourceDecl {
    fn default() -> ResourceDecl {
        ResourceDecl {
            name: NameBuf::new(),
            desc_var: ArenaRef::EMPTY,
            source_param: INDEX_NONE,
        }
    }
}

/// Inclusive command-index range over which a resource's contents must be
/// preserved.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct Lifetime {
    pub begin: u32,
    pub end: u32,
}

impl Lifetime {
    pub const UNUSED: Lifetime = Lifetime {
        begin: INDEX_NONE,
        end: 0,
    };

    pub fn is_unused(&self) -> bool {
        self.begin == INDEX_NONE
    }

    pub fn extend(&mut self, cmd_index: u32) {
        if self.is_unused() {
            *self = Lifetime {
                begin: cmd_index,
                end: cmd_index,
            };
        } else {
            self.begin = self.begin.min(cmd_index);
            self.end = self.end.max(cmd_index);
        }
    }

    pub fn overlaps(&self, other: &Lifetime) -> bool {
        if self.is_unused() || other.is_unused() {
            return false;
        }
        self.begin <= other.end && other.begin <= self.end
    }
}

/// Where an instance landed inside a heap.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct HeapPlacement {
    pub heap_index: u32,
    pub offset: u64,
}

/// The materialized resource for a given frame.
#[derive(Clone, Debug)]
pub struct ResourceInstance {
    /// The declaration slot (stable id) this instance belongs to.
    pub decl_slot: u32,
    pub temporal_layer: u32,
    pub desc: ResourceDesc,
    pub name: NameBuf,
    pub is_external: bool,
    pub all_accesses: AccessAttr,
    pub initial_access: AccessAttr,
    pub lifetime: Lifetime,
    pub requirements: MemoryRequirements,
    pub placement: Option<HeapPlacement>,
    pub runtime_handle: Option<ResourceHandle>,
    pub is_aliased: bool,
    /// Frame index of the last update that used this instance; drives
    /// deferred destruction.
    pub last_used_frame: u64,
}

impl ResourceInstance {
    pub fn new(
        decl_slot: u32,
        temporal_layer: u32,
        desc: ResourceDesc,
        name: NameBuf,
    ) -> ResourceInstance {
        ResourceInstance {
            decl_slot,
            temporal_layer,
            desc,
            name,
            is_external: false,
            all_accesses: AccessAttr::UNKNOWN,
            initial_access: AccessAttr::UNKNOWN,
            lifetime: Lifetime::UNUSED,
            requirements: MemoryRequirements::ZERO,
            placement: None,
            runtime_handle: None,
            is_aliased: false,
            last_used_frame: 0,
        }
    }

    /// Temporal and persistent instances keep their contents across
    /// frames, so their placements must never be aliased or moved.
    pub fn is_cross_frame(&self) -> bool {
        self.desc.temporal_layers > 1 || self.desc.flags.contains(ResourceFlags::PERSISTENT)
    }

    pub fn is_external_output(&self) -> bool {
        self.is_external
            || self.is_cross_frame()
            || self.desc.flags.contains(ResourceFlags::CPU_ACCESSIBLE)
            || self
                .all_accesses
                .flags
                .intersects(AccessFlags::ALL_CPU | AccessFlags::PRESENT)
    }
}
