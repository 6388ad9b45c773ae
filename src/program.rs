//! Subprograms, program instances, and stable-id generation.
//!
//! Program bodies may declare nodes and resources inside loops and nested
//! subroutine calls. The persistent id generator assigns each such
//! declaration the same id on every frame, which is what lets the memory
//! planner carry placements forward. The program is modeled as a tree of
//! blocks; a block declares a fixed count of ids per kind and has a fixed
//! number of child blocks, and each dynamic occurrence of a block (a loop
//! iteration, a call) is a block instance holding the base offsets into
//! the per-kind id ranges.

use std::sync::Arc;

use fxhash::FxHashMap;

use crate::callback::NodeCallback;
use crate::error::{Error, Result};
use crate::graph::INDEX_NONE;
use crate::signature::Signature;

/// Id kinds tracked by the generator.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum IndexKind {
    Node = 0,
    Resource = 1,
}

pub const NUM_INDEX_KINDS: usize = 2;

#[derive(Copy, Clone)]
struct BlockInfo {
    num_resources: [u32; NUM_INDEX_KINDS],
    local_index: u32,
    num_children: u32,
    children_id_base: u32,
}

impl BlockInfo {
    fn uninit() -> BlockInfo {
        BlockInfo {
            num_resources: [0; NUM_INDEX_KINDS],
            local_index: INDEX_NONE,
            num_children: 0,
            children_id_base: INDEX_NONE,
        }
    }

    fn is_initialized(&self) -> bool {
        self.local_index != INDEX_NONE
    }
}

#[derive(Copy, Clone)]
struct BlockInstance {
    reached: bool,
    block_id: u32,
    next_iteration: u32,
    offsets: [u32; NUM_INDEX_KINDS],
}

impl BlockInstance {
    fn unreached() -> BlockInstance {
        BlockInstance {
            reached: false,
            block_id: 0,
            next_iteration: INDEX_NONE,
            offsets: [0; NUM_INDEX_KINDS],
        }
    }
}

/// Assigns ids that are stable across frames for structurally identical
/// marker streams. A mismatched block shape between frames is an
/// [`Error::InvalidProgram`].
pub struct PersistentIdGenerator {
    num_indices_total: [u32; NUM_INDEX_KINDS],
    blocks: Vec<BlockInfo>,
    block_stack: Vec<u32>,
    block_instance_stack: Vec<u32>,
    block_instances: Vec<BlockInstance>,
    current_block_instance: u32,
}

impl PersistentIdGenerator {
    pub fn new() -> PersistentIdGenerator {
        PersistentIdGenerator {
            num_indices_total: [0; NUM_INDEX_KINDS],
            blocks: Vec::new(),
            block_stack: Vec::new(),
            block_instance_stack: Vec::new(),
            block_instances: Vec::new(),
            current_block_instance: INDEX_NONE,
        }
    }

    /// Starts a fresh call entry; the lexical block path restarts at the
    /// root while instances persist.
    pub fn begin_call_entry(&mut self) {
        self.block_stack.clear();
        self.block_instance_stack.clear();
    }

    pub fn enter_function(
        &mut self,
        resource_counts: [u32; NUM_INDEX_KINDS],
        num_children: u32,
    ) -> Result<()> {
        let block_id = self.init_block_info(resource_counts, INDEX_NONE, num_children)?;
        self.block_stack.push(block_id);

        let root_instance = if self.block_instances.is_empty() {
            self.alloc_block_instances(1 + num_children)
        } else {
            0
        };

        self.init_block_instance(block_id, root_instance)?;
        self.current_block_instance = root_instance;
        Ok(())
    }

    pub fn enter_loop(
        &mut self,
        resource_counts: [u32; NUM_INDEX_KINDS],
        local_loop_index: u32,
        num_children: u32,
    ) -> Result<()> {
        let block_id = self.init_block_info(resource_counts, local_loop_index, num_children)?;
        self.block_stack.push(block_id);
        self.block_instance_stack.push(self.current_block_instance);
        Ok(())
    }

    pub fn exit_loop(&mut self) -> Result<()> {
        if self.block_stack.is_empty() {
            return Err(Error::InvalidProgram);
        }
        self.block_stack.pop();

        let parent = self
            .block_instance_stack
            .pop()
            .ok_or(Error::InvalidProgram)?;
        self.current_block_instance = parent;
        Ok(())
    }

    pub fn loop_iteration(&mut self) -> Result<()> {
        let block_id = *self.block_stack.last().ok_or(Error::InvalidProgram)?;
        let parent_id = *self
            .block_instance_stack
            .last()
            .ok_or(Error::InvalidProgram)?;

        let first_iteration = parent_id == self.current_block_instance;
        let block_info = self.blocks[block_id as usize];

        let prev_instance_id = if first_iteration {
            // The parent's instance range reserves one slot per child
            // block right after itself.
            self.current_block_instance + 1 + block_info.local_index
        } else {
            if block_id != self.block_instances[self.current_block_instance as usize].block_id {
                return Err(Error::InvalidProgram);
            }
            self.current_block_instance
        };

        if self.block_instances[prev_instance_id as usize].next_iteration == INDEX_NONE {
            let new_range = self.alloc_block_instances(1 + block_info.num_children);
            self.block_instances[prev_instance_id as usize].next_iteration = new_range;
        }

        let current = self.block_instances[prev_instance_id as usize].next_iteration;
        self.init_block_instance(block_id, current)?;
        self.current_block_instance = current;
        Ok(())
    }

    /// Returns the stable id of declaration `local_index` of `kind` inside
    /// the current block instance.
    pub fn generate(&self, kind: IndexKind, local_index: u32) -> Result<u32> {
        let instance = self
            .block_instances
            .get(self.current_block_instance as usize)
            .ok_or(Error::InvalidProgram)?;
        let block = &self.blocks[instance.block_id as usize];
        if local_index >= block.num_resources[kind as usize] {
            return Err(Error::InvalidProgram);
        }
        Ok(instance.offsets[kind as usize] + local_index)
    }

    pub fn total(&self, kind: IndexKind) -> u32 {
        self.num_indices_total[kind as usize]
    }

    /// Forgets everything, including block shapes. Stable ids restart
    /// from zero.
    pub fn reset(&mut self) {
        self.num_indices_total = [0; NUM_INDEX_KINDS];
        self.blocks.clear();
        self.block_stack.clear();
        self.block_instance_stack.clear();
        self.block_instances.clear();
        self.current_block_instance = INDEX_NONE;
    }

    fn init_block_info(
        &mut self,
        resource_counts: [u32; NUM_INDEX_KINDS],
        local_loop_index: u32,
        num_children: u32,
    ) -> Result<u32> {
        let (block_id, local_index) = if self.block_stack.is_empty() {
            if local_loop_index != INDEX_NONE {
                return Err(Error::InvalidProgram);
            }
            if self.blocks.is_empty() {
                self.blocks.reserve(1 + num_children as usize);
                self.blocks.push(BlockInfo::uninit());
            }
            (0u32, 0u32)
        } else {
            let parent_block_id = *self.block_stack.last().ok_or(Error::InternalError)?;

            // Lazily allocate the block-id range for the parent's children.
            if self.blocks[parent_block_id as usize].children_id_base == INDEX_NONE {
                let num_children_of_parent = self.blocks[parent_block_id as usize].num_children;
                self.blocks[parent_block_id as usize].children_id_base = self.blocks.len() as u32;
                self.blocks.resize(
                    self.blocks.len() + num_children_of_parent as usize,
                    BlockInfo::uninit(),
                );
            }

            if local_loop_index >= self.blocks[parent_block_id as usize].num_children {
                return Err(Error::InvalidProgram);
            }
            (
                self.blocks[parent_block_id as usize].children_id_base + local_loop_index,
                local_loop_index,
            )
        };

        let block_info = &mut self.blocks[block_id as usize];
        if !block_info.is_initialized() {
            block_info.num_resources = resource_counts;
            block_info.local_index = local_index;
            block_info.num_children = num_children;
        } else if block_info.num_resources != resource_counts
            || block_info.local_index != local_index
            || block_info.num_children != num_children
        {
            return Err(Error::InvalidProgram);
        }

        Ok(block_id)
    }

    fn alloc_block_instances(&mut self, count: u32) -> u32 {
        let offset = self.block_instances.len() as u32;
        self.block_instances
            .resize(self.block_instances.len() + count as usize, BlockInstance::unreached());
        offset
    }

    fn init_block_instance(&mut self, block_id: u32, instance_id: u32) -> Result<()> {
        let block_info = self.blocks[block_id as usize];
        let instance = &mut self.block_instances[instance_id as usize];

        if !instance.reached {
            instance.reached = true;
            instance.block_id = block_id;
            instance.next_iteration = INDEX_NONE;
            for kind in 0..NUM_INDEX_KINDS {
                instance.offsets[kind] = self.num_indices_total[kind];
                self.num_indices_total[kind] += block_info.num_resources[kind];
            }
        } else {
            if instance.block_id != block_id {
                return Err(Error::InvalidProgram);
            }
            for kind in 0..NUM_INDEX_KINDS {
                if instance.offsets[kind] + block_info.num_resources[kind]
                    > self.num_indices_total[kind]
                {
                    return Err(Error::InvalidProgram);
                }
            }
        }
        Ok(())
    }
}

//--------------------------------------------------------------------------------------------------
// Subprograms

/// Implementation bound to one node declaration of a subprogram.
#[derive(Clone)]
pub enum NodeImpl {
    Unbound,
    Callback(NodeCallback),
    /// The node expands into a nested subprogram call.
    Program(Arc<Subprogram>),
}

/// A program body: builds the graph through the builder it is handed.
/// Errors returned here abort the current update.
pub type BuildFn =
    dyn Fn(&mut crate::builder::GraphBuilder, &[crate::builder::NodeArg]) -> Result<()>
        + Send
        + Sync;

/// An entry description: a signature plus per-node implementation
/// bindings and an optional build function standing in for the compiled
/// program body.
pub struct Subprogram {
    signature: Arc<Signature>,
    entry: Option<Arc<BuildFn>>,
    node_impls: Vec<NodeImpl>,
    default_node_impl: Option<NodeCallback>,
}

impl Subprogram {
    pub fn new(signature: Arc<Signature>) -> Subprogram {
        let node_impls = vec![NodeImpl::Unbound; signature.node_decls().len()];
        Subprogram {
            signature,
            entry: None,
            node_impls,
            default_node_impl: None,
        }
    }

    pub fn with_entry<F>(signature: Arc<Signature>, entry: F) -> Subprogram
    where
        F: Fn(&mut crate::builder::GraphBuilder, &[crate::builder::NodeArg]) -> Result<()>
            + Send
            + Sync
            + 'static,
    {
        let mut program = Subprogram::new(signature);
        program.entry = Some(Arc::new(entry));
        program
    }

    pub fn set_entry<F>(&mut self, entry: F)
    where
        F: Fn(&mut crate::builder::GraphBuilder, &[crate::builder::NodeArg]) -> Result<()>
            + Send
            + Sync
            + 'static,
    {
        self.entry = Some(Arc::new(entry));
    }

    pub fn entry(&self) -> Option<&Arc<BuildFn>> {
        self.entry.as_ref()
    }

    pub fn signature(&self) -> &Signature {
        &self.signature
    }

    pub fn signature_arc(&self) -> Arc<Signature> {
        self.signature.clone()
    }

    pub fn node_impl(&self, decl_id: u32) -> &NodeImpl {
        static UNBOUND: NodeImpl = NodeImpl::Unbound;
        self.node_impls.get(decl_id as usize).unwrap_or(&UNBOUND)
    }

    pub fn default_node_impl(&self) -> Option<&NodeCallback> {
        self.default_node_impl.as_ref()
    }

    pub fn bind(&mut self, decl_id: u32, callback: NodeCallback) -> Result<()> {
        let slot = self
            .node_impls
            .get_mut(decl_id as usize)
            .ok_or(Error::InvalidArguments)?;
        *slot = NodeImpl::Callback(callback);
        Ok(())
    }

    pub fn bind_by_name(&mut self, name: &str, callback: NodeCallback) -> Result<u32> {
        let decl_id = self
            .signature
            .find_node_decl_by_name(name)
            .ok_or(Error::UnknownNode)?;
        self.bind(decl_id, callback)?;
        Ok(decl_id)
    }

    pub fn bind_subprogram(&mut self, decl_id: u32, program: Arc<Subprogram>) -> Result<()> {
        let slot = self
            .node_impls
            .get_mut(decl_id as usize)
            .ok_or(Error::InvalidArguments)?;
        *slot = NodeImpl::Program(program);
        Ok(())
    }

    pub fn bind_default(&mut self, callback: NodeCallback) {
        self.default_node_impl = Some(callback);
    }
}

/// Identifies a [`ProgramInstance`] in the registry.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub struct ProgramInstanceId(pub u32);

/// Per-invocation identity of a subprogram: owns the stable-id state and
/// the persistent slot mappings for declarations made by that invocation.
pub struct ProgramInstance {
    pub program: Arc<Subprogram>,
    pub id_generator: PersistentIdGenerator,
    /// Stable node id to the graph node recorded by the latest build.
    pub cmd_slots: Vec<u32>,
    /// Stable resource id to persistent resource declaration slot.
    pub resource_slots: Vec<u32>,
}

impl ProgramInstance {
    fn new(program: Arc<Subprogram>) -> ProgramInstance {
        ProgramInstance {
            program,
            id_generator: PersistentIdGenerator::new(),
            cmd_slots: Vec::new(),
            resource_slots: Vec::new(),
        }
    }
}

/// Program instances are created lazily on first invocation and persist
/// across frames, keyed by `(subprogram identity, allocation id)`.
pub struct ProgramRegistry {
    instances: Vec<ProgramInstance>,
    by_key: FxHashMap<(usize, u32), ProgramInstanceId>,
}

impl ProgramRegistry {
    pub fn new() -> ProgramRegistry {
        ProgramRegistry {
            instances: Vec::new(),
            by_key: FxHashMap::default(),
        }
    }

    pub fn create_root(&mut self, program: Arc<Subprogram>) -> ProgramInstanceId {
        let id = ProgramInstanceId(self.instances.len() as u32);
        self.instances.push(ProgramInstance::new(program));
        id
    }

    /// Finds or creates the instance of `program` for the call site
    /// identified by `allocation_id`.
    pub fn instance_for_call(
        &mut self,
        program: &Arc<Subprogram>,
        allocation_id: u32,
    ) -> ProgramInstanceId {
        let key = (Arc::as_ptr(program) as usize, allocation_id);
        if let Some(&id) = self.by_key.get(&key) {
            return id;
        }
        let id = ProgramInstanceId(self.instances.len() as u32);
        self.instances.push(ProgramInstance::new(program.clone()));
        self.by_key.insert(key, id);
        id
    }

    pub fn get(&self, id: ProgramInstanceId) -> &ProgramInstance {
        &self.instances[id.0 as usize]
    }

    pub fn get_mut(&mut self, id: ProgramInstanceId) -> &mut ProgramInstance {
        &mut self.instances[id.0 as usize]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn counts(nodes: u32, resources: u32) -> [u32; NUM_INDEX_KINDS] {
        [nodes, resources]
    }

    /// Replays a body of the shape
    /// `fn main { decl r0; loop 3 { decl n0, r0 } decl n0 }`
    /// and records the generated ids.
    fn run_body(gen: &mut PersistentIdGenerator) -> Vec<u32> {
        let mut out = Vec::new();
        gen.begin_call_entry();
        gen.enter_function(counts(1, 1), 1).unwrap();
        out.push(gen.generate(IndexKind::Resource, 0).unwrap());
        gen.enter_loop(counts(1, 1), 0, 0).unwrap();
        for _ in 0..3 {
            gen.loop_iteration().unwrap();
            out.push(gen.generate(IndexKind::Node, 0).unwrap());
            out.push(gen.generate(IndexKind::Resource, 0).unwrap());
        }
        gen.exit_loop().unwrap();
        out.push(gen.generate(IndexKind::Node, 0).unwrap());
        out
    }

    #[test]
    fn ids_are_stable_across_frames() {
        let mut gen = PersistentIdGenerator::new();
        let first = run_body(&mut gen);
        let second = run_body(&mut gen);
        let third = run_body(&mut gen);
        assert_eq!(first, second);
        assert_eq!(first, third);
    }

    #[test]
    fn loop_iterations_get_distinct_ids() {
        let mut gen = PersistentIdGenerator::new();
        let ids = run_body(&mut gen);
        // resource in function, (node, resource) x 3 iterations, node in function
        assert_eq!(ids.len(), 8);
        let mut nodes: Vec<u32> = vec![ids[1], ids[3], ids[5], ids[7]];
        nodes.sort();
        nodes.dedup();
        assert_eq!(nodes.len(), 4);
        assert_eq!(gen.total(IndexKind::Node), 4);
        assert_eq!(gen.total(IndexKind::Resource), 4);
    }

    #[test]
    fn extra_iterations_extend_previous_assignment() {
        let mut gen = PersistentIdGenerator::new();
        let run = |gen: &mut PersistentIdGenerator, iterations: u32| -> Vec<u32> {
            let mut out = Vec::new();
            gen.begin_call_entry();
            gen.enter_function(counts(0, 0), 1).unwrap();
            gen.enter_loop(counts(1, 0), 0, 0).unwrap();
            for _ in 0..iterations {
                gen.loop_iteration().unwrap();
                out.push(gen.generate(IndexKind::Node, 0).unwrap());
            }
            gen.exit_loop().unwrap();
            out
        };
        let short = run(&mut gen, 2);
        let long = run(&mut gen, 4);
        assert_eq!(&long[..2], &short[..]);
        assert_eq!(gen.total(IndexKind::Node), 4);
    }

    #[test]
    fn changed_block_shape_is_invalid() {
        let mut gen = PersistentIdGenerator::new();
        gen.begin_call_entry();
        gen.enter_function(counts(1, 0), 1).unwrap();
        gen.enter_loop(counts(2, 0), 0, 0).unwrap();
        gen.loop_iteration().unwrap();
        gen.exit_loop().unwrap();

        gen.begin_call_entry();
        gen.enter_function(counts(1, 0), 1).unwrap();
        // Same loop now declares a different count.
        assert_eq!(
            gen.enter_loop(counts(3, 0), 0, 0),
            Err(Error::InvalidProgram)
        );
    }

    #[test]
    fn out_of_range_local_index_is_invalid() {
        let mut gen = PersistentIdGenerator::new();
        gen.begin_call_entry();
        gen.enter_function(counts(1, 0), 0).unwrap();
        assert_eq!(
            gen.generate(IndexKind::Node, 1),
            Err(Error::InvalidProgram)
        );
    }

    #[test]
    fn unbalanced_exit_is_invalid() {
        let mut gen = PersistentIdGenerator::new();
        gen.begin_call_entry();
        gen.enter_function(counts(0, 0), 0).unwrap();
        assert_eq!(gen.exit_loop(), Err(Error::InvalidProgram));
    }

    #[test]
    fn registry_reuses_instance_per_call_site() {
        let sig = Arc::new(Signature::new(&Default::default()).unwrap());
        let prog = Arc::new(Subprogram::new(sig));
        let mut registry = ProgramRegistry::new();
        let a = registry.instance_for_call(&prog, 7);
        let b = registry.instance_for_call(&prog, 7);
        let c = registry.instance_for_call(&prog, 8);
        assert_eq!(a, b);
        assert_ne!(a, c);
    }
}
