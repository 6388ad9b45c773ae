//! The top-level API consumed by program bodies.
//!
//! A program body declares resources and variables, calls nodes, opens
//! subgraphs, and drops scheduler barriers; everything lands here. The
//! builder owns the frame arena, the graph, the command list and the
//! per-frame resource declarations, and forwards block markers to the
//! persistent id generator of the current program instance.

use std::sync::Arc;

use bitflags::bitflags;
use lazy_static::lazy_static;

use crate::arena::{Arena, ArenaRef, NameBuf};
use crate::callback::NodeCallback;
use crate::error::{Error, Result};
use crate::graph::{Graph, NodeId, SubgraphFlags, SubgraphId, INDEX_NONE};
use crate::program::{
    IndexKind, NodeImpl, ProgramInstanceId, ProgramRegistry, Subprogram, NUM_INDEX_KINDS,
};
use crate::resource::{ResourceDecl, ResourceDesc, ResourceId, ResourceView};
use crate::signature::{init_node_decl, NodeDesc, NodeDeclInfo, Signature};

/// Built-in node declaration ids (negative, table index is `-(id + 1)`).
pub const BUILTIN_NODE_INVALID: i32 = -1;
pub const BUILTIN_NODE_SCHEDULER_BARRIER: i32 = -2;
pub const BUILTIN_NODE_SUBGRAPH_BEGIN: i32 = -3;
pub const BUILTIN_NODE_SUBGRAPH_END: i32 = -4;
pub const BUILTIN_NODE_SUBROUTINE_BEGIN: i32 = -5;
pub const BUILTIN_NODE_SUBROUTINE_END: i32 = -6;

/// Node declaration ids at or above this index are dynamic declarations
/// registered during the current build.
pub const DYNAMIC_NODE_DECL_BASE: u32 = 1 << 30;

lazy_static! {
    static ref BUILTIN_NODE_DECLS: [NodeDeclInfo; 6] = [
        NodeDeclInfo::builtin_marker("invalid"),
        NodeDeclInfo::builtin_marker("scheduler_barrier"),
        NodeDeclInfo::builtin_marker("subgraph_begin"),
        NodeDeclInfo::builtin_marker("subgraph_end"),
        NodeDeclInfo::builtin_marker("subroutine_begin"),
        NodeDeclInfo::builtin_marker("subroutine_end"),
    ];
}

pub fn builtin_node_decl(decl_id: i32) -> Result<&'static NodeDeclInfo> {
    let index = -(decl_id as i64 + 1);
    if index < 0 {
        return Err(Error::InvalidArguments);
    }
    BUILTIN_NODE_DECLS
        .get(index as usize)
        .ok_or(Error::InvalidArguments)
}

bitflags! {
    /// Per-call node flags.
    pub struct NodeCallFlags: u32 {
        /// Prefer scheduling this call onto an async queue.
        const PREFER_ASYNC = 1 << 0;
    }
}

/// One argument of a node call.
pub enum NodeArg<'a> {
    /// Plain data, copied into the frame arena.
    Data(&'a [u8]),
    /// A single resource view.
    Resource(ResourceView),
    /// An array-of-views parameter.
    Resources(&'a [ResourceView]),
}

impl<'a> NodeArg<'a> {
    pub fn value<T: Copy>(value: &'a T) -> NodeArg<'a> {
        let bytes = unsafe {
            ::std::slice::from_raw_parts(
                value as *const T as *const u8,
                ::std::mem::size_of::<T>(),
            )
        };
        NodeArg::Data(bytes)
    }
}

/// The per-node payload: declaration reference, program instance, frozen
/// arguments, and the resolved callback.
pub struct CmdInfo {
    pub node_decl_id: i32,
    pub program_instance: ProgramInstanceId,
    /// Persistent id of this call site, or `INDEX_NONE` for transient
    /// calls outside any stable block.
    pub stable_node_id: u32,
    pub user_tag: u32,
    pub call_flags: NodeCallFlags,
    /// One frame-arena range per parameter.
    pub args: Vec<ArenaRef>,
    pub callback: Option<NodeCallback>,
    pub node: NodeId,
}

impl CmdInfo {
    pub fn is_builtin(&self) -> bool {
        self.node_decl_id < 0
    }
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
enum BuildState {
    Ready,
    Building,
    Closed,
}

/// Everything one build produces: the arena holding argument data and
/// descriptors, the graph, the command list, and the per-frame
/// declarations. The render graph keeps two of these and swaps them on a
/// successful update, so a failed build never disturbs the frame the
/// published schedule refers to.
pub struct FrameState {
    pub(crate) arena: Arena,
    pub(crate) graph: Graph,
    pub(crate) cmds: Vec<CmdInfo>,
    pub(crate) resource_decls: Vec<ResourceDecl>,
    pub(crate) dynamic_node_decls: Vec<NodeDeclInfo>,
    pub(crate) param_vars: Vec<ArenaRef>,
    pub(crate) param_outputs: Vec<Vec<ResourceId>>,
}

impl FrameState {
    pub(crate) fn new(arena_block_size: usize, num_params: usize) -> FrameState {
        FrameState {
            arena: Arena::new(arena_block_size),
            graph: Graph::new(),
            cmds: Vec::new(),
            resource_decls: Vec::new(),
            dynamic_node_decls: Vec::new(),
            param_vars: vec![ArenaRef::EMPTY; num_params],
            param_outputs: vec![Vec::new(); num_params],
        }
    }

    pub fn graph(&self) -> &Graph {
        &self.graph
    }

    pub fn cmds(&self) -> &[CmdInfo] {
        &self.cmds
    }

    pub fn resource_decls(&self) -> &[ResourceDecl] {
        &self.resource_decls
    }
}

/// Builds one frame's graph. Long lived: persistent slot mappings and the
/// program registry survive across frames, per-frame storage is reset by
/// `begin`.
pub struct GraphBuilder {
    state: BuildState,
    build_status: Option<Error>,

    pub(crate) frame: FrameState,

    pub(crate) registry: ProgramRegistry,
    root_program: ProgramInstanceId,
    current_program: ProgramInstanceId,
    program_stack: Vec<ProgramInstanceId>,

    signature: Arc<Signature>,

    current_subgraph: u32,
    subgraph_stack: Vec<SubgraphId>,
    barrier_scope: u32,

    /// Next persistent resource declaration slot; external slots occupy
    /// `0..max_external_resources`.
    next_resource_slot: u32,
    disallow_unbound_nodes: bool,
}

impl GraphBuilder {
    pub fn new(
        root: Arc<Subprogram>,
        frame_arena_block_size: usize,
        disallow_unbound_nodes: bool,
    ) -> GraphBuilder {
        let signature = root.signature_arc();
        let mut registry = ProgramRegistry::new();
        let root_program = registry.create_root(root);
        let num_params = signature.param_decls().len();
        GraphBuilder {
            state: BuildState::Ready,
            build_status: None,
            frame: FrameState::new(frame_arena_block_size, num_params),
            registry,
            root_program,
            current_program: root_program,
            program_stack: Vec::new(),
            signature: signature.clone(),
            current_subgraph: INDEX_NONE,
            subgraph_stack: Vec::new(),
            barrier_scope: 0,
            next_resource_slot: signature.max_external_resources(),
            disallow_unbound_nodes,
        }
    }

    /// Exchanges the just-built frame with the caller's published one.
    pub(crate) fn swap_frame(&mut self, other: &mut FrameState) {
        ::std::mem::swap(&mut self.frame, other);
    }

    pub fn signature(&self) -> &Signature {
        &self.signature
    }

    pub fn graph(&self) -> &Graph {
        &self.frame.graph
    }

    pub fn cmds(&self) -> &[CmdInfo] {
        &self.frame.cmds
    }

    pub fn resource_decls(&self) -> &[ResourceDecl] {
        &self.frame.resource_decls
    }

    fn ensure_building(&self) -> Result<()> {
        if self.state != BuildState::Building {
            return Err(Error::InvalidOperation);
        }
        Ok(())
    }

    /// Opens the builder for a new frame and seeds entry parameter
    /// variables and external resource slots from `args`.
    pub fn begin(&mut self, args: &[NodeArg]) -> Result<()> {
        if self.state == BuildState::Building {
            return Err(Error::InvalidOperation);
        }
        self.state = BuildState::Building;
        let result = self.begin_impl(args);
        if result.is_err() {
            self.state = BuildState::Ready;
        }
        result
    }

    fn begin_impl(&mut self, args: &[NodeArg]) -> Result<()> {
        self.build_status = None;

        self.frame.arena.reset();
        self.frame.graph.reset();
        self.frame.cmds.clear();
        self.frame.dynamic_node_decls.clear();
        self.frame.resource_decls.clear();
        self.frame.resource_decls.resize(
            self.signature.max_external_resources() as usize,
            ResourceDecl::default(),
        );
        self.current_program = self.root_program;
        self.program_stack.clear();
        self.registry
            .get_mut(self.root_program)
            .id_generator
            .begin_call_entry();
        self.current_subgraph = INDEX_NONE;
        self.subgraph_stack.clear();
        self.barrier_scope = 0;
        for outputs in &mut self.frame.param_outputs {
            outputs.clear();
        }

        // Entry parameter variables, initialized from the update args.
        let params = self.signature.param_decls();
        for (i, param) in params.iter().enumerate() {
            let size = param.byte_size();
            let var = self.frame.arena.alloc(size, 4)?;
            if let Some(arg) = args.get(i) {
                match arg {
                    NodeArg::Data(bytes) => {
                        if bytes.len() > size {
                            return Err(Error::TypeMismatch);
                        }
                        self.frame
                            .arena
                            .bytes_mut(var.slice(0, bytes.len()))
                            .copy_from_slice(bytes);
                    }
                    NodeArg::Resource(_) | NodeArg::Resources(_) => {
                        return Err(Error::InvalidArguments);
                    }
                }
            }
            self.frame.param_vars[i] = var;
        }

        // External resource slots come from the resource-typed entry
        // parameters, one slot per element.
        let mut slot = 0u32;
        for (param_id, param) in params.iter().enumerate() {
            if !param.is_resource() {
                continue;
            }
            let elem_size = param.type_size as usize;
            for elem in 0..param.num_elements {
                if (slot as usize) >= self.frame.resource_decls.len() {
                    break;
                }
                let decl = &mut self.frame.resource_decls[slot as usize];
                decl.name = param.name;
                decl.desc_var =
                    self.frame.param_vars[param_id].slice(elem as usize * elem_size, elem_size);
                decl.source_param = param_id as u32;
                slot += 1;
            }
        }

        Ok(())
    }

    /// Closes the build and reports the first recorded failure.
    pub fn end(&mut self) -> Result<()> {
        if self.state != BuildState::Building {
            return Err(Error::InvalidOperation);
        }
        self.state = BuildState::Closed;
        if !self.subgraph_stack.is_empty() {
            return Err(Error::InvalidProgram);
        }
        match self.build_status.take() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    /// Program-body abort: records the error; the build fails at `end`.
    pub fn abort(&mut self, error: Error) {
        if self.build_status.is_none() {
            self.build_status = Some(error);
        }
    }

    //----------------------------------------------------------------------------------------------
    // Variables and data

    pub fn allocate_data(&mut self, size: usize, align: usize) -> Result<ArenaRef> {
        self.ensure_building()?;
        self.frame.arena.alloc(size, align.max(4))
    }

    /// Declares a frame-lifetime variable holding `value`.
    pub fn declare_variable<T: Copy>(&mut self, value: T) -> Result<ArenaRef> {
        self.ensure_building()?;
        self.frame.arena.store_value(value)
    }

    pub fn variable<T: Copy>(&self, var: ArenaRef) -> Result<T> {
        self.frame.arena.read::<T>(var)
    }

    pub fn set_variable<T: Copy>(&mut self, var: ArenaRef, value: T) -> Result<()> {
        self.frame.arena.write::<T>(var, value)
    }

    //----------------------------------------------------------------------------------------------
    // Entry parameters

    pub fn param_variable(&self, param_id: u32) -> Result<ArenaRef> {
        self.frame
            .param_vars
            .get(param_id as usize)
            .copied()
            .ok_or(Error::IndexOutOfBounds)
    }

    pub fn param<T: Copy>(&self, param_id: u32) -> Result<T> {
        let var = self.param_variable(param_id)?;
        self.frame.arena.read::<T>(var)
    }

    /// The external resource slot bound to element `array_index` of a
    /// resource-typed entry parameter.
    pub fn param_resource_id(&self, param_id: u32, array_index: u32) -> Result<ResourceId> {
        let params = self.signature.param_decls();
        let param = params
            .get(param_id as usize)
            .ok_or(Error::IndexOutOfBounds)?;
        if !param.is_resource() {
            return Err(Error::InvalidArguments);
        }
        if array_index >= param.num_elements {
            return Err(Error::IndexOutOfBounds);
        }
        let mut slot = 0u32;
        for p in &params[..param_id as usize] {
            if p.is_resource() {
                slot += p.num_elements;
            }
        }
        Ok(ResourceId(slot + array_index))
    }

    /// Records which resources back an output parameter, so callers can
    /// observe them after the update.
    pub fn notify_out_param_resources(
        &mut self,
        param_id: u32,
        resources: &[ResourceId],
    ) -> Result<()> {
        self.ensure_building()?;
        let outputs = self
            .frame
            .param_outputs
            .get_mut(param_id as usize)
            .ok_or(Error::IndexOutOfBounds)?;
        outputs.clear();
        outputs.extend_from_slice(resources);
        Ok(())
    }

    pub fn output_param_resources(&self, param_id: u32) -> &[ResourceId] {
        self.frame
            .param_outputs
            .get(param_id as usize)
            .map(|v| v.as_slice())
            .unwrap_or(&[])
    }

    pub(crate) fn all_output_param_resources(&self) -> impl Iterator<Item = ResourceId> + '_ {
        self.frame.param_outputs.iter().flatten().copied()
    }

    //----------------------------------------------------------------------------------------------
    // Resources

    /// Declares a transient resource. `local_resource_id` is the
    /// declaration's index within the current block for stable identity;
    /// `INDEX_NONE` declares an unstable one-off.
    pub fn declare_resource(
        &mut self,
        local_resource_id: u32,
        desc: &ResourceDesc,
        name: &str,
    ) -> Result<ResourceId> {
        self.ensure_building()?;

        let desc_var = self.frame.arena.store_value(desc.normalized())?;

        let slot = if local_resource_id == INDEX_NONE {
            let slot = self.next_resource_slot;
            self.next_resource_slot = slot.checked_add(1).ok_or(Error::IntegerOverflow)?;
            slot
        } else {
            let max_external = self.signature.max_external_resources();
            let instance = self.registry.get_mut(self.current_program);
            let stable_id = instance
                .id_generator
                .generate(IndexKind::Resource, local_resource_id)?
                as usize;
            if instance.resource_slots.len() <= stable_id {
                instance.resource_slots.resize(stable_id + 1, INDEX_NONE);
            }
            if instance.resource_slots[stable_id] == INDEX_NONE {
                // First frame this declaration is reached: allocate the
                // persistent slot.
                let slot = self.next_resource_slot;
                self.next_resource_slot = slot.checked_add(1).ok_or(Error::IntegerOverflow)?;
                instance.resource_slots[stable_id] = slot;
                debug_assert!(slot >= max_external);
            }
            instance.resource_slots[stable_id]
        };

        if self.frame.resource_decls.len() <= slot as usize {
            self.frame
                .resource_decls
                .resize(slot as usize + 1, ResourceDecl::default());
        }
        let decl = &mut self.frame.resource_decls[slot as usize];
        decl.name = NameBuf::from_str(name);
        decl.desc_var = desc_var;
        decl.source_param = INDEX_NONE;

        Ok(ResourceId(slot))
    }

    pub fn set_resource_name(&mut self, resource: ResourceId, name: &str) -> Result<()> {
        self.ensure_building()?;
        let decl = self
            .frame
            .resource_decls
            .get_mut(resource.index())
            .ok_or(Error::InvalidArguments)?;
        decl.name = NameBuf::from_str(name);
        Ok(())
    }

    pub(crate) fn resource_desc(&self, resource: ResourceId) -> Result<ResourceDesc> {
        let decl = self
            .frame
            .resource_decls
            .get(resource.index())
            .ok_or(Error::InvalidArguments)?;
        if decl.desc_var.is_empty() {
            return Err(Error::InvalidArguments);
        }
        Ok(self
            .frame
            .arena
            .read::<ResourceDesc>(decl.desc_var)?
            .normalized())
    }

    //----------------------------------------------------------------------------------------------
    // Node declarations

    /// Registers a node declaration for this build only.
    pub fn declare_dynamic_node(&mut self, desc: &NodeDesc) -> Result<u32> {
        self.ensure_building()?;
        let decl = init_node_decl(desc)?;
        let id = DYNAMIC_NODE_DECL_BASE + self.frame.dynamic_node_decls.len() as u32;
        self.frame.dynamic_node_decls.push(decl);
        Ok(id)
    }

    /// Resolves the declaration of a recorded command.
    pub fn cmd_node_decl(&self, cmd: &CmdInfo) -> Result<&NodeDeclInfo> {
        resolve_node_decl(&self.registry, &self.frame.dynamic_node_decls, cmd)
    }

    //----------------------------------------------------------------------------------------------
    // Node calls

    /// Adds a node invocation. Subroutine-bound declarations expand into
    /// the nested program body bracketed by subroutine markers.
    pub fn add_node(
        &mut self,
        node_decl_id: u32,
        args: &[NodeArg],
        call_flags: NodeCallFlags,
        node_local_id: u32,
        user_tag: u32,
    ) -> Result<NodeId> {
        self.ensure_building()?;

        let program_arc = self.registry.get(self.current_program).program.clone();

        // Stable identity of this call site.
        let stable_node_id = if node_local_id == INDEX_NONE {
            INDEX_NONE
        } else {
            self.registry
                .get(self.current_program)
                .id_generator
                .generate(IndexKind::Node, node_local_id)?
        };

        // Subroutine expansion replaces the call with begin/end markers
        // around the nested body.
        if node_decl_id < DYNAMIC_NODE_DECL_BASE {
            if let NodeImpl::Program(sub) = program_arc.node_impl(node_decl_id) {
                let sub = sub.clone();
                return self.expand_subroutine(&sub, args, stable_node_id);
            }
        }

        let cmd_args = {
            let decl = if node_decl_id >= DYNAMIC_NODE_DECL_BASE {
                self.frame
                    .dynamic_node_decls
                    .get((node_decl_id - DYNAMIC_NODE_DECL_BASE) as usize)
                    .ok_or(Error::InvalidArguments)?
            } else {
                program_arc
                    .signature()
                    .node_decl(node_decl_id)
                    .ok_or(Error::InvalidArguments)?
            };
            copy_node_args(
                &mut self.frame.arena,
                &self.frame.resource_decls,
                decl,
                args,
            )?
        };

        let callback = match program_arc.node_impl(node_decl_id) {
            NodeImpl::Callback(cb) => Some(cb.clone()),
            _ => match program_arc.default_node_impl() {
                Some(cb) => Some(cb.clone()),
                None if self.disallow_unbound_nodes
                    && node_decl_id < DYNAMIC_NODE_DECL_BASE =>
                {
                    return Err(Error::UnrecognizedCommand);
                }
                None => None,
            },
        };

        let node = self.push_cmd(CmdInfo {
            node_decl_id: node_decl_id as i32,
            program_instance: self.current_program,
            stable_node_id,
            user_tag,
            call_flags,
            args: cmd_args,
            callback,
            node: NodeId(0),
        });

        if stable_node_id != INDEX_NONE {
            let instance = self.registry.get_mut(self.current_program);
            if instance.cmd_slots.len() <= stable_node_id as usize {
                instance
                    .cmd_slots
                    .resize(stable_node_id as usize + 1, INDEX_NONE);
            }
            instance.cmd_slots[stable_node_id as usize] = node.0;
        }
        Ok(node)
    }

    fn expand_subroutine(
        &mut self,
        sub: &Arc<Subprogram>,
        args: &[NodeArg],
        allocation_id: u32,
    ) -> Result<NodeId> {
        let begin = self.add_builtin_node(BUILTIN_NODE_SUBROUTINE_BEGIN)?;

        let child = self.registry.instance_for_call(sub, allocation_id);
        self.program_stack.push(self.current_program);
        self.current_program = child;
        self.registry
            .get_mut(child)
            .id_generator
            .begin_call_entry();

        let entry = sub.entry().cloned();
        let result = match entry {
            Some(entry) => (*entry)(self, args),
            None => Ok(()),
        };

        self.current_program = self
            .program_stack
            .pop()
            .ok_or(Error::InternalError)?;
        self.add_builtin_node(BUILTIN_NODE_SUBROUTINE_END)?;

        result?;
        Ok(begin)
    }

    fn add_builtin_node(&mut self, node_decl_id: i32) -> Result<NodeId> {
        debug_assert!(builtin_node_decl(node_decl_id).is_ok());
        Ok(self.push_cmd(CmdInfo {
            node_decl_id,
            program_instance: self.current_program,
            stable_node_id: INDEX_NONE,
            user_tag: 0,
            call_flags: NodeCallFlags::empty(),
            args: Vec::new(),
            callback: None,
            node: NodeId(0),
        }))
    }

    fn push_cmd(&mut self, mut cmd: CmdInfo) -> NodeId {
        let cmd_index = self.frame.cmds.len() as i32;
        let node = self.frame.graph.add_node(cmd_index);
        {
            let n = self.frame.graph.node_mut(node);
            n.subgraph = self.current_subgraph;
            n.barrier_scope = self.barrier_scope;
        }
        if self.current_subgraph != INDEX_NONE {
            self.frame
                .graph
                .subgraph_mut(SubgraphId(self.current_subgraph))
                .end_node = node;
        }
        cmd.node = node;
        self.frame.cmds.push(cmd);
        node
    }

    /// Adds an explicit ordering dependency between two recorded nodes.
    pub fn add_dependency(&mut self, before: NodeId, after: NodeId) -> Result<()> {
        self.ensure_building()?;
        if before.index() >= self.frame.graph.num_nodes()
            || after.index() >= self.frame.graph.num_nodes()
        {
            return Err(Error::InvalidArguments);
        }
        self.frame.graph.add_edge(before, after)
    }

    /// Splits the schedule: nodes before the barrier are never reordered
    /// past it.
    pub fn schedule_barrier(&mut self) -> Result<()> {
        self.ensure_building()?;
        self.add_builtin_node(BUILTIN_NODE_SCHEDULER_BARRIER)?;
        self.barrier_scope += 1;
        Ok(())
    }

    //----------------------------------------------------------------------------------------------
    // Subgraphs

    pub fn begin_subgraph(&mut self, flags: SubgraphFlags) -> Result<SubgraphId> {
        self.ensure_building()?;
        let begin_node = self.add_builtin_node(BUILTIN_NODE_SUBGRAPH_BEGIN)?;
        let subgraph = self
            .frame
            .graph
            .add_subgraph(self.current_subgraph, flags, begin_node);
        self.frame.graph.node_mut(begin_node).subgraph = subgraph.0;
        self.subgraph_stack.push(subgraph);
        self.current_subgraph = subgraph.0;
        Ok(subgraph)
    }

    pub fn end_subgraph(&mut self) -> Result<()> {
        self.ensure_building()?;
        let subgraph = match self.subgraph_stack.pop() {
            Some(sg) => sg,
            None => return Err(Error::InvalidOperation),
        };
        let end_node = self.add_builtin_node(BUILTIN_NODE_SUBGRAPH_END)?;
        let parent = self.frame.graph.subgraph(subgraph).parent_subgraph;
        self.frame.graph.node_mut(end_node).subgraph = subgraph.0;
        self.frame.graph.subgraph_mut(subgraph).end_node = end_node;
        self.current_subgraph = parent;
        Ok(())
    }

    //----------------------------------------------------------------------------------------------
    // Block markers

    pub fn enter_function(
        &mut self,
        resource_counts: [u32; NUM_INDEX_KINDS],
        num_children: u32,
    ) -> Result<()> {
        self.ensure_building()?;
        self.registry
            .get_mut(self.current_program)
            .id_generator
            .enter_function(resource_counts, num_children)
    }

    pub fn enter_loop(
        &mut self,
        resource_counts: [u32; NUM_INDEX_KINDS],
        local_loop_index: u32,
        num_children: u32,
    ) -> Result<()> {
        self.ensure_building()?;
        self.registry
            .get_mut(self.current_program)
            .id_generator
            .enter_loop(resource_counts, local_loop_index, num_children)
    }

    pub fn loop_iteration(&mut self) -> Result<()> {
        self.ensure_building()?;
        self.registry
            .get_mut(self.current_program)
            .id_generator
            .loop_iteration()
    }

    pub fn exit_loop(&mut self) -> Result<()> {
        self.ensure_building()?;
        self.registry
            .get_mut(self.current_program)
            .id_generator
            .exit_loop()
    }
}

/// Resolves a command's node declaration against the registry, the
/// dynamic declarations of the current build, and the built-in table.
pub(crate) fn resolve_node_decl<'a>(
    registry: &'a ProgramRegistry,
    dynamic_node_decls: &'a [NodeDeclInfo],
    cmd: &CmdInfo,
) -> Result<&'a NodeDeclInfo> {
    if cmd.node_decl_id < 0 {
        return builtin_node_decl(cmd.node_decl_id);
    }
    let decl_id = cmd.node_decl_id as u32;
    if decl_id >= DYNAMIC_NODE_DECL_BASE {
        return dynamic_node_decls
            .get((decl_id - DYNAMIC_NODE_DECL_BASE) as usize)
            .ok_or(Error::InvalidArguments);
    }
    registry
        .get(cmd.program_instance)
        .program
        .signature()
        .node_decl(decl_id)
        .ok_or(Error::InvalidArguments)
}

/// Copies node-call arguments into the frame arena, one range per
/// parameter, validating against the declaration.
fn copy_node_args(
    arena: &mut Arena,
    resource_decls: &[ResourceDecl],
    decl: &NodeDeclInfo,
    args: &[NodeArg],
) -> Result<Vec<ArenaRef>> {
    if args.len() > decl.params.len() {
        return Err(Error::InvalidArguments);
    }

    let mut out = Vec::with_capacity(decl.params.len());
    for (i, param) in decl.params.iter().enumerate() {
        let arg = match args.get(i) {
            Some(arg) => arg,
            None => {
                if param.is_optional() {
                    out.push(ArenaRef::EMPTY);
                    continue;
                }
                return Err(Error::InvalidArguments);
            }
        };
        let stored = match arg {
            NodeArg::Data(bytes) => {
                if param.is_resource() {
                    return Err(Error::InvalidArguments);
                }
                let expected = param.byte_size();
                if param.is_unbounded_array {
                    if param.type_size != 0 && bytes.len() % param.type_size as usize != 0 {
                        return Err(Error::TypeMismatch);
                    }
                } else if bytes.len() != expected {
                    return Err(Error::TypeMismatch);
                }
                arena.store_bytes(bytes)?
            }
            NodeArg::Resource(view) => {
                if !param.is_resource() {
                    return Err(Error::InvalidArguments);
                }
                if view.resource.index() >= resource_decls.len() {
                    return Err(Error::InvalidArguments);
                }
                if !param.is_unbounded_array && param.num_elements != 1 {
                    return Err(Error::IndexOutOfBounds);
                }
                arena.store_value(*view)?
            }
            NodeArg::Resources(views) => {
                if !param.is_resource() {
                    return Err(Error::InvalidArguments);
                }
                if !param.is_unbounded_array && views.len() != param.num_elements as usize {
                    return Err(Error::IndexOutOfBounds);
                }
                for view in views.iter() {
                    if view.resource.index() >= resource_decls.len() {
                        return Err(Error::InvalidArguments);
                    }
                }
                arena.store_slice(views)?
            }
        };
        out.push(stored);
    }
    Ok(out)
}
