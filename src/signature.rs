//! Node and parameter declarations.
//!
//! A node declaration describes the shape of one node kind: its
//! parameters, their access attributes and fixed-function semantics, the
//! queues it can run on, and the derived render-pass layout backends use
//! to open a render pass without inspecting arguments.

use bitflags::bitflags;
use smallvec::SmallVec;

use crate::access::{AccessAttr, AccessFlags, ShaderStageFlags};
use crate::arena::NameBuf;
use crate::error::{Error, Result};
use crate::graph::INDEX_NONE;

/// Placeholder semantic index resolved to "next free slot" during
/// signature initialization.
pub const SEMANTIC_INDEX_APPEND: u32 = !0u32;

pub const MAX_RENDER_TARGETS: u32 = 8;

/// Fixed-function meaning of a parameter.
///
/// Declaration order matters: dynamic render state comes first, then
/// fixed-function resource bindings, then user bindings. Sorting by this
/// enum groups parameters the way backends consume them.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[repr(u32)]
pub enum Semantic {
    Unspecified = 0,

    // Dynamic render states.
    Viewport,
    Scissor,
    ColorClearValue,
    DepthClearValue,
    StencilClearValue,

    // Fixed-function resource bindings.
    VertexBuffer,
    IndexBuffer,
    IndirectArgs,
    IndirectCount,
    StreamOutBuffer,
    RenderTarget,
    DepthStencilTarget,
    ShadingRateImage,
    ResolveTarget,

    // User bindings.
    UserBinding,
}

impl Semantic {
    pub fn is_dynamic_render_state(self) -> bool {
        self >= Semantic::Viewport && self <= Semantic::StencilClearValue
    }

    pub fn is_fixed_function_binding(self) -> bool {
        self >= Semantic::VertexBuffer && self <= Semantic::ResolveTarget
    }

    /// Access implied by a fixed-function binding semantic.
    fn implied_access(self) -> AccessFlags {
        match self {
            Semantic::VertexBuffer => AccessFlags::VERTEX_BUFFER,
            Semantic::IndexBuffer => AccessFlags::INDEX_BUFFER,
            Semantic::IndirectArgs | Semantic::IndirectCount => AccessFlags::INDIRECT_ARGS,
            Semantic::StreamOutBuffer => AccessFlags::STREAM_OUT,
            Semantic::RenderTarget => AccessFlags::RENDER_TARGET,
            Semantic::DepthStencilTarget => {
                AccessFlags::DEPTH_WRITE | AccessFlags::STENCIL_WRITE
            }
            Semantic::ShadingRateImage => AccessFlags::SHADING_RATE,
            Semantic::ResolveTarget => {
                AccessFlags::RENDER_TARGET | AccessFlags::RESOLVE_DEST
            }
            _ => AccessFlags::empty(),
        }
    }
}

bitflags! {
    pub struct ParamFlags: u32 {
        /// The parameter is written by the node body and readable by the
        /// caller after the call.
        const OUT = 1 << 0;
        const OPTIONAL = 1 << 1;
        /// The parameter binds a resource view rather than plain data.
        const RESOURCE = 1 << 2;
    }
}

bitflags! {
    pub struct NodeDeclFlags: u32 {
        const GRAPHICS = 1 << 0;
        const COMPUTE = 1 << 1;
        const COPY = 1 << 2;
        /// Hint: schedule onto an async queue when possible.
        const PREFER_ASYNC = 1 << 3;
        /// Hint: transitions for this node should ride the render pass.
        const PREFER_RENDER_PASS = 1 << 4;
        /// The node must never be removed by dead-code elimination
        /// (debug markers and other observable side effects).
        const SIDE_EFFECT = 1 << 5;
    }
}

/// Explicit attribute attached to a parameter by the program author.
#[derive(Copy, Clone, Debug, Default, PartialEq)]
pub struct ParamAttr {
    pub access: AccessAttr,
    pub semantic: Option<Semantic>,
    pub semantic_index: u32,
}

impl ParamAttr {
    pub fn access(flags: AccessFlags, stages: ShaderStageFlags) -> ParamAttr {
        ParamAttr {
            access: AccessAttr::new(flags, stages),
            semantic: None,
            semantic_index: 0,
        }
    }

    pub fn semantic(semantic: Semantic, semantic_index: u32) -> ParamAttr {
        ParamAttr {
            access: AccessAttr::UNKNOWN,
            semantic: Some(semantic),
            semantic_index,
        }
    }

    pub fn semantic_append(semantic: Semantic) -> ParamAttr {
        ParamAttr::semantic(semantic, SEMANTIC_INDEX_APPEND)
    }

    pub fn with_access(mut self, flags: AccessFlags, stages: ShaderStageFlags) -> ParamAttr {
        self.access = AccessAttr::new(flags, stages);
        self
    }
}

/// User-facing parameter description.
#[derive(Clone, Debug)]
pub struct ParamDesc {
    pub name: String,
    pub type_size: u32,
    /// 0 = scalar, `u32::MAX` = unbounded (runtime determined).
    pub array_size: u32,
    pub flags: ParamFlags,
    pub attr: Option<ParamAttr>,
}

impl ParamDesc {
    pub fn new(name: &str, type_size: u32) -> ParamDesc {
        ParamDesc {
            name: name.to_owned(),
            type_size,
            array_size: 0,
            flags: ParamFlags::empty(),
            attr: None,
        }
    }

    pub fn resource(name: &str, attr: ParamAttr) -> ParamDesc {
        ParamDesc {
            name: name.to_owned(),
            type_size: ::std::mem::size_of::<crate::resource::ResourceView>() as u32,
            array_size: 0,
            flags: ParamFlags::RESOURCE,
            attr: Some(attr),
        }
    }

    /// An entry-point parameter backing an externally owned resource; the
    /// caller supplies its descriptor every update.
    pub fn external_resource(name: &str) -> ParamDesc {
        ParamDesc {
            name: name.to_owned(),
            type_size: ::std::mem::size_of::<crate::resource::ResourceDesc>() as u32,
            array_size: 0,
            flags: ParamFlags::RESOURCE,
            attr: None,
        }
    }

    pub fn value<T>(name: &str) -> ParamDesc {
        ParamDesc::new(name, ::std::mem::size_of::<T>() as u32)
    }

    pub fn array(mut self, array_size: u32) -> ParamDesc {
        self.array_size = array_size;
        self
    }

    pub fn with_flags(mut self, flags: ParamFlags) -> ParamDesc {
        self.flags |= flags;
        self
    }

    pub fn with_attr(mut self, attr: ParamAttr) -> ParamDesc {
        self.attr = Some(attr);
        self
    }
}

/// User-facing node description.
#[derive(Clone, Debug)]
pub struct NodeDesc {
    pub name: String,
    pub flags: NodeDeclFlags,
    pub params: Vec<ParamDesc>,
}

impl NodeDesc {
    pub fn new(name: &str, flags: NodeDeclFlags, params: Vec<ParamDesc>) -> NodeDesc {
        NodeDesc {
            name: name.to_owned(),
            flags,
            params,
        }
    }
}

/// Describes the signature of the entry point of a render graph.
#[derive(Clone, Debug, Default)]
pub struct SignatureDesc {
    pub params: Vec<ParamDesc>,
    pub node_descs: Vec<NodeDesc>,
    /// 0 derives the count from the resource parameters.
    pub max_external_resources: u32,
}

/// Resolves the effective access attribute of a parameter: explicit bits
/// plus bits inferred from the fixed-function semantic.
fn access_attr_from_param_attr(attr: &ParamAttr) -> AccessAttr {
    let mut access = attr.access;

    if let Some(semantic) = attr.semantic {
        if semantic.is_fixed_function_binding() {
            let mut implied = semantic.implied_access();
            // An explicit read-only depth/stencil attribute masks off the
            // implied write bit for the matching aspect.
            if access.flags.contains(AccessFlags::DEPTH_READ) {
                implied &= !AccessFlags::DEPTH_WRITE;
            }
            if access.flags.contains(AccessFlags::STENCIL_READ) {
                implied &= !AccessFlags::STENCIL_WRITE;
            }
            access.flags |= implied;
            access.stages = ShaderStageFlags::empty();
        }
    }

    access
}

/// Queue capability a single access forces onto its node.
fn required_queue_flags(decl_flags: NodeDeclFlags, access: &AccessAttr) -> NodeDeclFlags {
    let gfx_compute_only =
        AccessFlags::ALL_GPU - (AccessFlags::COPY_SRC | AccessFlags::COPY_DEST);
    let gfx_only =
        AccessFlags::ALL_GPU - (AccessFlags::INDIRECT_ARGS | AccessFlags::CONSTANT_BUFFER);
    let stage_dependent = AccessFlags::SHADER_RESOURCE | AccessFlags::UNORDERED_ACCESS;

    if !access.flags.intersects(AccessFlags::ALL_GPU) {
        return NodeDeclFlags::empty();
    }
    if !access.flags.intersects(gfx_compute_only) {
        return NodeDeclFlags::COPY;
    }
    // SRV/UAV requirements depend on the shader stages; a compute node
    // declaration keeps SRV/UAV accesses on the compute queue even when
    // legacy stage masks include graphics stages.
    if !access.flags.intersects(gfx_only)
        || (access.flags.intersects(stage_dependent)
            && (!access.stages.intersects(ShaderStageFlags::ALL_GFX)
                || decl_flags.contains(NodeDeclFlags::COMPUTE)))
    {
        return NodeDeclFlags::COMPUTE;
    }
    NodeDeclFlags::GRAPHICS
}

/// Collapses declared and required queue bits into the single strongest
/// capability.
fn calc_node_decl_flags(declared: NodeDeclFlags, required: NodeDeclFlags) -> NodeDeclFlags {
    let queue_mask = NodeDeclFlags::GRAPHICS | NodeDeclFlags::COMPUTE | NodeDeclFlags::COPY;
    let combined = (declared | required) & queue_mask;

    let strongest = if combined.contains(NodeDeclFlags::GRAPHICS) {
        NodeDeclFlags::GRAPHICS
    } else if combined.contains(NodeDeclFlags::COMPUTE) {
        NodeDeclFlags::COMPUTE
    } else if combined.contains(NodeDeclFlags::COPY) {
        NodeDeclFlags::COPY
    } else {
        NodeDeclFlags::empty()
    };

    (declared - queue_mask) | strongest
}

/// One parameter of a node declaration with its derived attributes.
#[derive(Clone, Debug, PartialEq)]
pub struct NodeParamDecl {
    pub name: NameBuf,
    pub type_size: u32,
    pub num_elements: u32,
    pub flags: ParamFlags,
    pub is_array: bool,
    pub is_unbounded_array: bool,
    pub access: AccessAttr,
    pub semantic: Option<Semantic>,
    pub base_semantic_index: u32,
    /// Offset of this parameter's accesses in the node's access list.
    pub access_offset: u32,
}

impl NodeParamDecl {
    fn new(desc: &ParamDesc, num_accesses: &mut u32) -> NodeParamDecl {
        let num_elements = if desc.array_size == !0u32 {
            0
        } else if desc.array_size == 0 {
            1
        } else {
            desc.array_size
        };

        let (access, semantic, base_semantic_index) = match &desc.attr {
            Some(attr) => (
                access_attr_from_param_attr(attr),
                attr.semantic,
                attr.semantic_index,
            ),
            None => (AccessAttr::UNKNOWN, None, 0),
        };

        let access_offset = *num_accesses;
        if !access.is_unknown() {
            *num_accesses += num_elements;
        }

        NodeParamDecl {
            name: NameBuf::from_str(&desc.name),
            type_size: desc.type_size,
            num_elements,
            flags: desc.flags,
            is_array: desc.array_size != 0,
            is_unbounded_array: desc.array_size == !0u32,
            access,
            semantic,
            base_semantic_index,
            access_offset,
        }
    }

    pub fn is_resource(&self) -> bool {
        self.flags.contains(ParamFlags::RESOURCE)
    }

    pub fn is_output_resource(&self) -> bool {
        self.flags
            .contains(ParamFlags::RESOURCE | ParamFlags::OUT)
    }

    pub fn is_optional(&self) -> bool {
        self.flags.contains(ParamFlags::OPTIONAL)
    }

    pub fn byte_size(&self) -> usize {
        self.type_size as usize * self.num_elements.max(1) as usize
    }
}

/// Parameters sharing one semantic, in semantic-index order.
#[derive(Clone, Debug, PartialEq)]
pub struct SemanticKind {
    pub semantic: Semantic,
    pub params: Vec<u32>,
}

/// A reference to one element of one parameter.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct ParamElementRef {
    pub param: u32,
    pub array_offset: u32,
}

/// Compact per-declaration description of the render pass a graphics node
/// opens: target masks plus parameter refs for each fixed-function slot.
///
/// `param_refs` is laid out in sections: render targets, the depth
/// stencil target, resolve targets, viewports, scissor rects, clear
/// values (colors, then depth, then stencil).
#[derive(Clone, Debug, Default, PartialEq)]
pub struct RenderPassInfo {
    pub param_refs: Vec<ParamElementRef>,
    pub render_targets_mask: u32,
    pub resolve_targets_mask: u32,
    pub render_target_clear_mask: u32,
    pub has_depth_stencil: bool,
    pub clear_depth: bool,
    pub clear_stencil: bool,
    pub resolve_depth_stencil: bool,
    /// The node only clears; there are no target semantics, just a clear
    /// access flag.
    pub clear_only: bool,
    resolve_refs_offset: u32,
    viewport_refs_offset: u32,
    scissor_refs_offset: u32,
    clear_value_refs_offset: u32,
}

impl RenderPassInfo {
    pub fn render_target_count(&self) -> u32 {
        self.render_targets_mask.count_ones()
    }

    pub fn render_target_refs(&self) -> &[ParamElementRef] {
        &self.param_refs[..self.render_target_count() as usize]
    }

    pub fn depth_stencil_ref(&self) -> Option<&ParamElementRef> {
        if self.has_depth_stencil {
            self.param_refs.get(self.render_target_count() as usize)
        } else {
            None
        }
    }

    pub fn resolve_target_refs(&self) -> &[ParamElementRef] {
        let begin = self.resolve_refs_offset as usize;
        let count = self.resolve_targets_mask.count_ones() as usize;
        &self.param_refs[begin..begin + count]
    }

    pub fn viewport_refs(&self) -> &[ParamElementRef] {
        &self.param_refs[self.viewport_refs_offset as usize..self.scissor_refs_offset as usize]
    }

    pub fn scissor_refs(&self) -> &[ParamElementRef] {
        &self.param_refs[self.scissor_refs_offset as usize..self.clear_value_refs_offset as usize]
    }

    pub fn color_clear_value_refs(&self) -> &[ParamElementRef] {
        let begin = self.clear_value_refs_offset as usize;
        let count = self.render_target_clear_mask.count_ones() as usize;
        &self.param_refs[begin..begin + count]
    }

    pub fn depth_clear_value_ref(&self) -> Option<&ParamElementRef> {
        if self.clear_depth {
            let idx = self.clear_value_refs_offset as usize
                + self.render_target_clear_mask.count_ones() as usize;
            self.param_refs.get(idx)
        } else {
            None
        }
    }

    pub fn stencil_clear_value_ref(&self) -> Option<&ParamElementRef> {
        if self.clear_stencil {
            let idx = self.clear_value_refs_offset as usize
                + self.render_target_clear_mask.count_ones() as usize
                + self.clear_depth as usize;
            self.param_refs.get(idx)
        } else {
            None
        }
    }
}

/// A fully derived node declaration.
#[derive(Clone, Debug, PartialEq)]
pub struct NodeDeclInfo {
    pub name: NameBuf,
    pub params: Vec<NodeParamDecl>,
    pub flags: NodeDeclFlags,
    pub semantic_kinds: Vec<SemanticKind>,
    pub num_accesses: u32,
    pub render_pass_info: Option<RenderPassInfo>,
}

impl NodeDeclInfo {
    /// Defaults to a graphics node when no queue flag is set.
    pub fn maybe_graphics_node(&self) -> bool {
        !self
            .flags
            .intersects(NodeDeclFlags::COMPUTE | NodeDeclFlags::COPY)
    }

    pub fn builtin_marker(name: &str) -> NodeDeclInfo {
        NodeDeclInfo {
            name: NameBuf::from_str(name),
            params: Vec::new(),
            flags: NodeDeclFlags::SIDE_EFFECT,
            semantic_kinds: Vec::new(),
            num_accesses: 0,
            render_pass_info: None,
        }
    }
}

#[derive(Copy, Clone)]
struct ParamSemanticKey {
    param_index: u32,
    semantic: Semantic,
    semantic_index: u32,
}

/// Builds a [`NodeDeclInfo`] from a user description: derives per-param
/// access attributes, resolves `APPEND` semantic indices, groups
/// semantics, and synthesizes the render-pass info.
pub fn init_node_decl(desc: &NodeDesc) -> Result<NodeDeclInfo> {
    let mut num_accesses = 0u32;
    let mut required_queue = NodeDeclFlags::empty();
    let mut sorted: SmallVec<[ParamSemanticKey; 32]> = SmallVec::new();

    let mut params = Vec::with_capacity(desc.params.len());
    for (idx, param_desc) in desc.params.iter().enumerate() {
        let param = NodeParamDecl::new(param_desc, &mut num_accesses);
        if let Some(semantic) = param.semantic {
            sorted.push(ParamSemanticKey {
                param_index: idx as u32,
                semantic,
                semantic_index: param.base_semantic_index,
            });
        }
        required_queue |= required_queue_flags(desc.flags, &param.access);
        params.push(param);
    }

    let mut decl = NodeDeclInfo {
        name: NameBuf::from_str(&desc.name),
        params,
        flags: calc_node_decl_flags(desc.flags, required_queue),
        semantic_kinds: Vec::new(),
        num_accesses,
        render_pass_info: None,
    };

    let maybe_graphics = decl.maybe_graphics_node();
    let mut has_render_pass_info = false;
    let mut has_targets = false;

    if !sorted.is_empty() {
        // First sort by (semantic, param index) to resolve append order.
        sorted.sort_by(|a, b| {
            (a.semantic, a.param_index).cmp(&(b.semantic, b.param_index))
        });

        let mut prev_semantic = None;
        let mut next_semantic_index = 0u32;
        for key in sorted.iter_mut() {
            if Some(key.semantic) != prev_semantic {
                prev_semantic = Some(key.semantic);
                next_semantic_index = 0;
            }
            if key.semantic_index == SEMANTIC_INDEX_APPEND {
                key.semantic_index = next_semantic_index;
                decl.params[key.param_index as usize].base_semantic_index = key.semantic_index;
            }
            next_semantic_index =
                key.semantic_index + decl.params[key.param_index as usize].num_elements;
        }

        // Re-sort by (semantic, semantic index) for backend consumption.
        sorted.sort_by(|a, b| {
            (a.semantic, a.semantic_index).cmp(&(b.semantic, b.semantic_index))
        });

        let mut kind: Option<SemanticKind> = None;
        for (i, key) in sorted.iter().enumerate() {
            if let Some(next) = sorted.get(i + 1) {
                if next.semantic == key.semantic
                    && key.semantic_index
                        + decl.params[key.param_index as usize].num_elements
                        > next.semantic_index
                {
                    return Err(Error::InvalidProgram);
                }
            }

            let same_kind = kind
                .as_ref()
                .map_or(false, |k| k.semantic == key.semantic);
            if same_kind {
                if let Some(k) = kind.as_mut() {
                    k.params.push(key.param_index);
                }
            } else {
                if let Some(k) = kind.take() {
                    decl.semantic_kinds.push(k);
                }
                kind = Some(SemanticKind {
                    semantic: key.semantic,
                    params: vec![key.param_index],
                });
            }

            if maybe_graphics {
                match key.semantic {
                    Semantic::Viewport
                    | Semantic::Scissor
                    | Semantic::ColorClearValue
                    | Semantic::DepthClearValue
                    | Semantic::StencilClearValue => has_render_pass_info = true,
                    Semantic::RenderTarget
                    | Semantic::DepthStencilTarget
                    | Semantic::ResolveTarget => {
                        has_render_pass_info = true;
                        has_targets = true;
                    }
                    _ => {}
                }
            }
        }
        if let Some(k) = kind.take() {
            decl.semantic_kinds.push(k);
        }
    }

    if maybe_graphics && !has_render_pass_info {
        // Clear-only nodes carry no target semantics, just a clear access.
        has_render_pass_info = decl.params.iter().any(|p| {
            p.access.flags.contains(AccessFlags::CLEAR)
                && p.access.flags.intersects(
                    AccessFlags::RENDER_TARGET | AccessFlags::DEPTH_STENCIL_WRITE,
                )
        });
    }

    if has_render_pass_info {
        decl.render_pass_info = Some(gather_render_pass_info(&decl, has_targets)?);
    }

    Ok(decl)
}

fn gather_render_pass_info(decl: &NodeDeclInfo, has_targets: bool) -> Result<RenderPassInfo> {
    let mut info = RenderPassInfo::default();

    let push_ref = |info: &mut RenderPassInfo, param: u32, array_offset: u32| -> Result<()> {
        if info.param_refs.len() >= 128 {
            return Err(Error::IndexOutOfBounds);
        }
        info.param_refs.push(ParamElementRef {
            param,
            array_offset,
        });
        Ok(())
    };

    if !has_targets {
        // Clear-only: find the single cleared target access.
        for (param_id, param) in decl.params.iter().enumerate() {
            if param.access.flags.contains(AccessFlags::CLEAR)
                && param.access.flags.intersects(
                    AccessFlags::RENDER_TARGET | AccessFlags::DEPTH_STENCIL_WRITE,
                )
                && param.base_semantic_index == 0
                && param.num_elements == 1
            {
                info.clear_only = true;
                if param.access.flags.contains(AccessFlags::RENDER_TARGET) {
                    info.render_targets_mask = 1;
                } else {
                    info.has_depth_stencil = true;
                }
                push_ref(&mut info, param_id as u32, 0)?;
                break;
            }
        }
    } else {
        // Render target slots in semantic-index order.
        let mut cleared_by_access = 0u32;
        for_each_semantic_element(decl, Semantic::RenderTarget, |param_id, elem, slot| {
            if slot >= MAX_RENDER_TARGETS {
                return Err(Error::IndexOutOfBounds);
            }
            info.render_targets_mask |= 1 << slot;
            if decl.params[param_id as usize]
                .access
                .flags
                .contains(AccessFlags::CLEAR)
            {
                cleared_by_access |= 1 << slot;
            }
            push_ref(&mut info, param_id, elem)
        })?;

        for_each_semantic_element(decl, Semantic::DepthStencilTarget, |param_id, elem, _| {
            info.has_depth_stencil = true;
            let access = decl.params[param_id as usize].access;
            if access.flags.contains(AccessFlags::CLEAR) {
                info.clear_depth = true;
                info.clear_stencil = access.flags.contains(AccessFlags::STENCIL_WRITE);
            }
            push_ref(&mut info, param_id, elem)
        })?;

        info.resolve_refs_offset = info.param_refs.len() as u32;
        for_each_semantic_element(decl, Semantic::ResolveTarget, |param_id, elem, slot| {
            if slot >= MAX_RENDER_TARGETS {
                return Err(Error::IndexOutOfBounds);
            }
            info.resolve_targets_mask |= 1 << slot;
            push_ref(&mut info, param_id, elem)
        })?;

        info.render_target_clear_mask = cleared_by_access;
    }

    info.viewport_refs_offset = info.param_refs.len() as u32;
    for_each_semantic_element(decl, Semantic::Viewport, |param_id, elem, _| {
        push_ref(&mut info, param_id, elem)
    })?;

    info.scissor_refs_offset = info.param_refs.len() as u32;
    for_each_semantic_element(decl, Semantic::Scissor, |param_id, elem, _| {
        push_ref(&mut info, param_id, elem)
    })?;

    info.clear_value_refs_offset = info.param_refs.len() as u32;
    for_each_semantic_element(decl, Semantic::ColorClearValue, |param_id, elem, slot| {
        info.render_target_clear_mask |= 1 << slot.min(31);
        push_ref(&mut info, param_id, elem)
    })?;
    for_each_semantic_element(decl, Semantic::DepthClearValue, |param_id, elem, _| {
        info.clear_depth = true;
        push_ref(&mut info, param_id, elem)
    })?;
    for_each_semantic_element(decl, Semantic::StencilClearValue, |param_id, elem, _| {
        info.clear_stencil = true;
        push_ref(&mut info, param_id, elem)
    })?;

    Ok(info)
}

/// Visits `(param, element, semantic slot)` of every element bound to
/// `semantic`, in semantic-index order.
fn for_each_semantic_element<F>(decl: &NodeDeclInfo, semantic: Semantic, mut f: F) -> Result<()>
where
    F: FnMut(u32, u32, u32) -> Result<()>,
{
    if let Some(kind) = decl.semantic_kinds.iter().find(|k| k.semantic == semantic) {
        for &param_id in &kind.params {
            let param = &decl.params[param_id as usize];
            for elem in 0..param.num_elements {
                f(param_id, elem, param.base_semantic_index + elem)?;
            }
        }
    }
    Ok(())
}

/// Entry-point parameter declaration (no semantics beyond resource-ness).
#[derive(Clone, Debug)]
pub struct ParamDecl {
    pub name: NameBuf,
    pub type_size: u32,
    pub num_elements: u32,
    pub flags: ParamFlags,
    pub is_unbounded_array: bool,
    pub access: AccessAttr,
}

impl ParamDecl {
    fn new(desc: &ParamDesc) -> ParamDecl {
        let num_elements = if desc.array_size == !0u32 {
            0
        } else if desc.array_size == 0 {
            1
        } else {
            desc.array_size
        };
        ParamDecl {
            name: NameBuf::from_str(&desc.name),
            type_size: desc.type_size,
            num_elements,
            flags: desc.flags,
            is_unbounded_array: desc.array_size == !0u32,
            access: desc
                .attr
                .as_ref()
                .map(access_attr_from_param_attr)
                .unwrap_or(AccessAttr::UNKNOWN),
        }
    }

    pub fn is_resource(&self) -> bool {
        self.flags.contains(ParamFlags::RESOURCE)
    }

    pub fn byte_size(&self) -> usize {
        self.type_size as usize * self.num_elements.max(1) as usize
    }
}

/// The parsed signature of a render graph: entry parameters plus all node
/// declarations.
pub struct Signature {
    params: Vec<ParamDecl>,
    node_decls: Vec<NodeDeclInfo>,
    max_external_resources: u32,
    external_resource_param_ids: Vec<u32>,
}

impl Signature {
    pub fn new(desc: &SignatureDesc) -> Result<Signature> {
        let params: Vec<ParamDecl> = desc.params.iter().map(ParamDecl::new).collect();

        let derived_res_count: u32 = params
            .iter()
            .filter(|p| p.is_resource())
            .map(|p| p.num_elements)
            .sum();
        let max_external_resources =
            if desc.max_external_resources == 0 || desc.max_external_resources == !0u32 {
                derived_res_count
            } else {
                desc.max_external_resources
            };

        let mut external_resource_param_ids = vec![INDEX_NONE; max_external_resources as usize];
        let mut slot = 0usize;
        for (param_id, param) in params.iter().enumerate() {
            if param.is_resource() {
                for _ in 0..param.num_elements {
                    if slot < external_resource_param_ids.len() {
                        external_resource_param_ids[slot] = param_id as u32;
                    }
                    slot += 1;
                }
            }
        }

        let node_decls = desc
            .node_descs
            .iter()
            .map(init_node_decl)
            .collect::<Result<Vec<_>>>()?;

        Ok(Signature {
            params,
            node_decls,
            max_external_resources,
            external_resource_param_ids,
        })
    }

    pub fn node_decls(&self) -> &[NodeDeclInfo] {
        &self.node_decls
    }

    pub fn node_decl(&self, decl_id: u32) -> Option<&NodeDeclInfo> {
        self.node_decls.get(decl_id as usize)
    }

    pub fn find_node_decl_by_name(&self, name: &str) -> Option<u32> {
        self.node_decls
            .iter()
            .position(|d| d.name.as_str() == name)
            .map(|i| i as u32)
    }

    pub fn param_decls(&self) -> &[ParamDecl] {
        &self.params
    }

    pub fn max_external_resources(&self) -> u32 {
        self.max_external_resources
    }

    /// The entry parameter backing external resource slot `resource_id`.
    pub fn external_resource_param_id(&self, resource_id: u32) -> u32 {
        self.external_resource_param_ids
            .get(resource_id as usize)
            .copied()
            .unwrap_or(INDEX_NONE)
    }
}
