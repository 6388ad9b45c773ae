//! Access vocabulary: how a node touches a subresource.
//!
//! An access attribute is a pair of access-flag bits and shader-stage
//! bits. The analyzer compares attributes of successive accesses to the
//! same subresource range to decide whether a transition is required.

use bitflags::bitflags;
use smallvec::SmallVec;

bitflags! {
    /// How a subresource is accessed by a node.
    ///
    /// The flags partition into read-only accesses, write accesses, and
    /// discard bits that modify lifetime semantics across the access.
    pub struct AccessFlags: u32 {
        const INDIRECT_ARGS         = 1 << 0;
        const INDEX_BUFFER          = 1 << 1;
        const VERTEX_BUFFER         = 1 << 2;
        const CONSTANT_BUFFER       = 1 << 3;
        const SHADER_RESOURCE       = 1 << 4;
        const SHADING_RATE          = 1 << 5;
        const RENDER_TARGET         = 1 << 6;
        const UNORDERED_ACCESS      = 1 << 7;
        const DEPTH_READ            = 1 << 8;
        const DEPTH_WRITE           = 1 << 9;
        const STENCIL_READ          = 1 << 10;
        const STENCIL_WRITE         = 1 << 11;
        const STREAM_OUT            = 1 << 12;
        const COPY_SRC              = 1 << 13;
        const COPY_DEST             = 1 << 14;
        const RESOLVE_SRC           = 1 << 15;
        const RESOLVE_DEST          = 1 << 16;
        const PRESENT               = 1 << 17;
        const CPU_READ              = 1 << 18;
        const CPU_WRITE             = 1 << 19;

        /// The data may be discarded entering this access; no transition
        /// from the prior contents is required.
        const DISCARD_BEFORE         = 1 << 20;
        /// The data need not be preserved past this access.
        const DISCARD_AFTER          = 1 << 21;
        /// Discard bits applying to the stencil aspect only.
        const STENCIL_DISCARD_BEFORE = 1 << 22;
        const STENCIL_DISCARD_AFTER  = 1 << 23;

        /// The access clears the subresource through fixed-function
        /// machinery (render target / depth-stencil clears).
        const CLEAR                 = 1 << 24;
        /// No view object is created for this access.
        const NO_VIEW               = 1 << 25;
        /// Ordering against other relaxed accesses of the same kind is
        /// not required.
        const RELAXED_ORDER         = 1 << 26;

        const ALL_GPU_WRITE = Self::RENDER_TARGET.bits
            | Self::UNORDERED_ACCESS.bits
            | Self::DEPTH_WRITE.bits
            | Self::STENCIL_WRITE.bits
            | Self::STREAM_OUT.bits
            | Self::COPY_DEST.bits
            | Self::RESOLVE_DEST.bits;

        const ALL_GPU_READONLY = Self::INDIRECT_ARGS.bits
            | Self::INDEX_BUFFER.bits
            | Self::VERTEX_BUFFER.bits
            | Self::CONSTANT_BUFFER.bits
            | Self::SHADER_RESOURCE.bits
            | Self::SHADING_RATE.bits
            | Self::DEPTH_READ.bits
            | Self::STENCIL_READ.bits
            | Self::COPY_SRC.bits
            | Self::RESOLVE_SRC.bits
            | Self::PRESENT.bits;

        const ALL_GPU = Self::ALL_GPU_WRITE.bits | Self::ALL_GPU_READONLY.bits;

        const ALL_CPU = Self::CPU_READ.bits | Self::CPU_WRITE.bits;

        const DEPTH_STENCIL_READ = Self::DEPTH_READ.bits | Self::STENCIL_READ.bits;
        const DEPTH_STENCIL_WRITE = Self::DEPTH_WRITE.bits | Self::STENCIL_WRITE.bits;
        const DEPTH_STENCIL = Self::DEPTH_STENCIL_READ.bits | Self::DEPTH_STENCIL_WRITE.bits;

        const ALL_ACCESS_MASK = Self::ALL_GPU.bits | Self::ALL_CPU.bits | Self::CLEAR.bits;
    }
}

bitflags! {
    /// Shader stages an access is visible to.
    pub struct ShaderStageFlags: u32 {
        const VS = 1 << 0;
        const PS = 1 << 1;
        const GS = 1 << 2;
        const CS = 1 << 3;
        const HS = 1 << 4;
        const DS = 1 << 5;
        const RAYTRACING = 1 << 6;
        const AS = 1 << 7;
        const MS = 1 << 8;

        const ALL = Self::VS.bits
            | Self::PS.bits
            | Self::GS.bits
            | Self::CS.bits
            | Self::HS.bits
            | Self::DS.bits
            | Self::RAYTRACING.bits
            | Self::AS.bits
            | Self::MS.bits;

        const ALL_GFX = Self::ALL.bits & !Self::CS.bits;
    }
}

impl Default for AccessFlags {
    fn default() -> AccessFlags {
        AccessFlags::empty()
    }
}

impl Default for ShaderStageFlags {
    fn default() -> ShaderStageFlags {
        ShaderStageFlags::empty()
    }
}

/// The access attribute attached to a parameter or a subresource state.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub struct AccessAttr {
    pub flags: AccessFlags,
    pub stages: ShaderStageFlags,
}

impl AccessAttr {
    pub const UNKNOWN: AccessAttr = AccessAttr {
        flags: AccessFlags::empty(),
        stages: ShaderStageFlags::empty(),
    };

    pub fn new(flags: AccessFlags, stages: ShaderStageFlags) -> AccessAttr {
        AccessAttr { flags, stages }
    }

    pub fn is_unknown(&self) -> bool {
        self.flags & AccessFlags::ALL_ACCESS_MASK == AccessFlags::empty()
    }

    pub fn is_write(&self) -> bool {
        self.flags
            .intersects(AccessFlags::ALL_GPU_WRITE | AccessFlags::CPU_WRITE | AccessFlags::CLEAR)
    }

    pub fn is_read_only(&self) -> bool {
        !self.is_write() && !self.is_unknown()
    }

    pub fn discards_before(&self) -> bool {
        self.flags.contains(AccessFlags::DISCARD_BEFORE)
    }

    pub fn discards_after(&self) -> bool {
        self.flags.contains(AccessFlags::DISCARD_AFTER)
    }

    /// Merges the stage bits and the non-semantic modifier bits of two
    /// attributes known to be mergeable.
    pub fn merged_with(&self, other: &AccessAttr) -> AccessAttr {
        AccessAttr {
            flags: self.flags | other.flags,
            stages: self.stages | other.stages,
        }
    }

    /// Whether a subsequent access with attribute `next` can execute
    /// against the state established for `self` without a transition.
    ///
    /// Writes never merge with anything, including other writes of the
    /// same kind (ordering between two writers matters). Read-only
    /// accesses merge when they agree on every read kind that requires a
    /// distinct resource state: depth/stencil read states are exclusive
    /// with non-depth read states.
    pub fn is_mergeable_with(&self, next: &AccessAttr) -> bool {
        if self.is_unknown() || next.is_unknown() {
            return false;
        }
        if self.is_write() || next.is_write() {
            return false;
        }
        if next.discards_before() {
            return false;
        }
        let combined = self.flags | next.flags;
        // Depth-stencil read state is distinct from shader-resource
        // state on every backend we target.
        let depth_read = combined.intersects(AccessFlags::DEPTH_STENCIL_READ);
        let non_depth_read =
            combined.intersects(AccessFlags::ALL_GPU_READONLY & !AccessFlags::DEPTH_STENCIL_READ);
        if depth_read && non_depth_read && !combined.contains(AccessFlags::SHADER_RESOURCE) {
            return false;
        }
        // Present is a terminal state.
        if combined.contains(AccessFlags::PRESENT) && combined != AccessFlags::PRESENT {
            return false;
        }
        true
    }
}

//--------------------------------------------------------------------------------------------------
// Subresource ranges

pub const ASPECT_COLOR: u32 = 1 << 0;
pub const ASPECT_DEPTH: u32 = 1 << 1;
pub const ASPECT_STENCIL: u32 = 1 << 2;

/// Most complements a clip can produce: one for aspects, two for array
/// layers, two for mips.
pub const MAX_CLIP_COMPLEMENTS: usize = 5;

pub type ClipComplements = SmallVec<[SubresourceRange; MAX_CLIP_COMPLEMENTS]>;

/// A packed (aspect, array-layer range, mip range) slice of a resource.
///
/// Layer and mip bounds are stored half-open. The packing budget matches
/// the descriptor widths: 8 aspect bits, 24+22 layer bits, 5+5 mip bits.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub struct SubresourceRange {
    pub aspect_mask: u32,
    pub base_array_layer: u32,
    pub array_layer_end: u32,
    pub base_mip_level: u32,
    pub mip_level_end: u32,
}

impl SubresourceRange {
    pub fn new(
        aspect_mask: u32,
        base_array_layer: u32,
        array_layer_end: u32,
        base_mip_level: u32,
        mip_level_end: u32,
    ) -> SubresourceRange {
        debug_assert!(array_layer_end > base_array_layer);
        debug_assert!(mip_level_end > base_mip_level);
        SubresourceRange {
            aspect_mask,
            base_array_layer,
            array_layer_end,
            base_mip_level,
            mip_level_end,
        }
    }

    /// The whole-resource range for a resource with the given counts.
    pub fn whole(aspect_mask: u32, array_layers: u32, mip_levels: u32) -> SubresourceRange {
        SubresourceRange::new(aspect_mask, 0, array_layers.max(1), 0, mip_levels.max(1))
    }

    pub fn array_layer_count(&self) -> u32 {
        self.array_layer_end - self.base_array_layer
    }

    pub fn mip_level_count(&self) -> u32 {
        self.mip_level_end - self.base_mip_level
    }

    pub fn num_subresources(&self) -> u32 {
        self.aspect_mask.count_ones() * self.array_layer_count() * self.mip_level_count()
    }

    pub fn intersects(lhs: &SubresourceRange, rhs: &SubresourceRange) -> bool {
        !((lhs.base_mip_level >= rhs.mip_level_end)
            || (rhs.base_mip_level >= lhs.mip_level_end)
            || (lhs.base_array_layer >= rhs.array_layer_end)
            || (rhs.base_array_layer >= lhs.array_layer_end)
            || ((lhs.aspect_mask & rhs.aspect_mask) == 0))
    }

    /// Clips `lhs` against `rhs`.
    ///
    /// Returns `None` when the ranges are disjoint. Otherwise returns the
    /// intersection, and appends to `complements` the parts of `lhs`
    /// outside `rhs` (at most [`MAX_CLIP_COMPLEMENTS`] disjoint ranges:
    /// the 2.5D clip peels aspects first, then array layers, then mips).
    pub fn clip(
        lhs: &SubresourceRange,
        rhs: &SubresourceRange,
        complements: &mut ClipComplements,
    ) -> Option<SubresourceRange> {
        if !SubresourceRange::intersects(lhs, rhs) {
            return None;
        }

        // Aspect planes of lhs not present in rhs.
        let complement_aspects = lhs.aspect_mask & !rhs.aspect_mask;
        if complement_aspects != 0 {
            complements.push(SubresourceRange::new(
                complement_aspects,
                lhs.base_array_layer,
                lhs.array_layer_end,
                lhs.base_mip_level,
                lhs.mip_level_end,
            ));
        }
        let aspects = lhs.aspect_mask & rhs.aspect_mask;

        // Array layers below and above rhs.
        let mut base_layer = lhs.base_array_layer;
        let mut layer_end = lhs.array_layer_end;
        if rhs.base_array_layer > base_layer {
            complements.push(SubresourceRange::new(
                aspects,
                base_layer,
                rhs.base_array_layer,
                lhs.base_mip_level,
                lhs.mip_level_end,
            ));
            base_layer = rhs.base_array_layer;
        }
        if layer_end > rhs.array_layer_end {
            complements.push(SubresourceRange::new(
                aspects,
                rhs.array_layer_end,
                layer_end,
                lhs.base_mip_level,
                lhs.mip_level_end,
            ));
            layer_end = rhs.array_layer_end;
        }

        // Mips below and above rhs, restricted to the intersected layers.
        let mut base_mip = lhs.base_mip_level;
        let mut mip_end = lhs.mip_level_end;
        if rhs.base_mip_level > base_mip {
            complements.push(SubresourceRange::new(
                aspects,
                base_layer,
                layer_end,
                base_mip,
                rhs.base_mip_level,
            ));
            base_mip = rhs.base_mip_level;
        }
        if mip_end > rhs.mip_level_end {
            complements.push(SubresourceRange::new(
                aspects,
                base_layer,
                layer_end,
                rhs.mip_level_end,
                mip_end,
            ));
            mip_end = rhs.mip_level_end;
        }

        Some(SubresourceRange::new(
            aspects, base_layer, layer_end, base_mip, mip_end,
        ))
    }
}

impl Default for SubresourceRange {
    fn default() -> SubresourceRange {
        SubresourceRange::new(ASPECT_COLOR, 0, 1, 0, 1)
    }
}

//--------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn range(layers: (u32, u32), mips: (u32, u32)) -> SubresourceRange {
        SubresourceRange::new(ASPECT_COLOR, layers.0, layers.1, mips.0, mips.1)
    }

    #[test]
    fn clip_disjoint() {
        let mut c = ClipComplements::new();
        assert_eq!(
            SubresourceRange::clip(&range((0, 4), (0, 1)), &range((4, 8), (0, 1)), &mut c),
            None
        );
        assert!(c.is_empty());
    }

    #[test]
    fn clip_contained() {
        let mut c = ClipComplements::new();
        let hit = SubresourceRange::clip(&range((0, 2), (0, 1)), &range((0, 8), (0, 4)), &mut c);
        assert_eq!(hit, Some(range((0, 2), (0, 1))));
        assert!(c.is_empty());
    }

    #[test]
    fn clip_produces_five_complements() {
        let lhs = SubresourceRange::new(ASPECT_COLOR | ASPECT_DEPTH, 0, 10, 0, 10);
        let rhs = SubresourceRange::new(ASPECT_COLOR, 3, 6, 3, 6);
        let mut c = ClipComplements::new();
        let hit = SubresourceRange::clip(&lhs, &rhs, &mut c).unwrap();
        assert_eq!(hit, SubresourceRange::new(ASPECT_COLOR, 3, 6, 3, 6));
        assert_eq!(c.len(), MAX_CLIP_COMPLEMENTS);
    }

    #[test]
    fn clip_pieces_cover_lhs_exactly() {
        // union(intersection, complements) == lhs and pieces are disjoint,
        // checked by counting subresources and pairwise intersection.
        let lhs = SubresourceRange::new(ASPECT_COLOR | ASPECT_DEPTH, 2, 9, 1, 7);
        let rhs = SubresourceRange::new(ASPECT_COLOR | ASPECT_STENCIL, 4, 6, 0, 5);
        let mut pieces = ClipComplements::new();
        let hit = SubresourceRange::clip(&lhs, &rhs, &mut pieces).unwrap();
        pieces.push(hit);

        let total: u32 = pieces.iter().map(|p| p.num_subresources()).sum();
        assert_eq!(total, lhs.num_subresources());
        for (i, a) in pieces.iter().enumerate() {
            assert!(SubresourceRange::intersects(a, &lhs));
            for b in pieces.iter().skip(i + 1) {
                assert!(!SubresourceRange::intersects(a, b));
            }
        }
    }

    #[test]
    fn read_read_merges() {
        let srv_ps = AccessAttr::new(AccessFlags::SHADER_RESOURCE, ShaderStageFlags::PS);
        let srv_cs = AccessAttr::new(AccessFlags::SHADER_RESOURCE, ShaderStageFlags::CS);
        assert!(srv_ps.is_mergeable_with(&srv_cs));
        let merged = srv_ps.merged_with(&srv_cs);
        assert_eq!(merged.stages, ShaderStageFlags::PS | ShaderStageFlags::CS);
    }

    #[test]
    fn write_never_merges() {
        let rt = AccessAttr::new(AccessFlags::RENDER_TARGET, ShaderStageFlags::empty());
        let srv = AccessAttr::new(AccessFlags::SHADER_RESOURCE, ShaderStageFlags::PS);
        assert!(!rt.is_mergeable_with(&srv));
        assert!(!srv.is_mergeable_with(&rt));
        assert!(!rt.is_mergeable_with(&rt));
    }

    #[test]
    fn depth_read_excludes_plain_reads() {
        let depth = AccessAttr::new(AccessFlags::DEPTH_READ, ShaderStageFlags::empty());
        let copy = AccessAttr::new(AccessFlags::COPY_SRC, ShaderStageFlags::empty());
        assert!(!depth.is_mergeable_with(&copy));
        // Depth read combined with SRV sampling is one state.
        let depth_srv = AccessAttr::new(
            AccessFlags::DEPTH_READ | AccessFlags::SHADER_RESOURCE,
            ShaderStageFlags::PS,
        );
        assert!(depth.is_mergeable_with(&depth_srv));
    }
}
