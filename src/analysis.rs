//! Access analysis and transition synthesis.
//!
//! Walks the command stream in program order, tracking the state of every
//! subresource range. Each incompatible successive access gets a
//! transition node spliced into the graph between the prior producer and
//! the consumer. The walk also records the flattened per-command access
//! lists and the dependency edges that make the schedule honor data flow:
//! producer to consumer, and write-after-read edges from every reader
//! since the last writer.

use fxhash::FxHashMap;
use log::debug;
use smallvec::SmallVec;

use crate::access::{AccessAttr, ClipComplements, SubresourceRange};
use crate::arena::Arena;
use crate::builder::{resolve_node_decl, CmdInfo};
use crate::error::{Error, Result};
use crate::graph::{transition_cmd_id, Graph, NodeId, INDEX_NONE};
use crate::program::ProgramRegistry;
use crate::resource::{ResourceDecl, ResourceInstance, ResourceView};
use crate::signature::NodeDeclInfo;

/// A change of subresource state. Transitions form a per-subresource
/// chain through `prev_transition`, linking monotonically backward; the
/// first transition of a chain leaves the implicit `UNKNOWN` state.
#[derive(Clone, Debug)]
pub struct Transition {
    pub prev_transition: u32,
    pub node: NodeId,
    pub resource_instance: u32,
    pub range: SubresourceRange,
    pub prev_access: AccessAttr,
    pub access: AccessAttr,
}

impl Transition {
    /// Preamble transitions leave the undefined initial state.
    pub fn is_initial(&self) -> bool {
        self.prev_access.is_unknown()
    }
}

/// One flattened access of one command: `(param, element)` resolved to a
/// resource instance and subresource range.
#[derive(Clone, Debug)]
pub struct SubresourceAccess {
    pub param: u32,
    pub array_offset: u32,
    pub resource_instance: u32,
    pub range: SubresourceRange,
    pub access: AccessAttr,
}

/// Output of the analysis phase.
#[derive(Default)]
pub struct AccessAnalysis {
    pub transitions: Vec<Transition>,
    pub accesses: Vec<SubresourceAccess>,
    /// `(first, count)` into `accesses` per command.
    pub cmd_access_ranges: Vec<(u32, u32)>,
}

impl AccessAnalysis {
    pub fn cmd_accesses(&self, cmd_index: usize) -> &[SubresourceAccess] {
        match self.cmd_access_ranges.get(cmd_index) {
            Some(&(first, count)) => &self.accesses[first as usize..(first + count) as usize],
            None => &[],
        }
    }

    pub fn clear(&mut self) {
        self.transitions.clear();
        self.accesses.clear();
        self.cmd_access_ranges.clear();
    }
}

#[derive(Copy, Clone)]
struct SlotEntry {
    base: u32,
    layers: u32,
}

/// Rollback point for [`ResourceCache::restore`].
pub struct ResourceCacheSnapshot {
    instances: Vec<ResourceInstance>,
    by_slot: FxHashMap<u32, SlotEntry>,
    num_retired: usize,
}

/// Persistent resource instances keyed by declaration slot. Descriptor
/// compatible instances carry forward across frames; a changed descriptor
/// retires the old instance and allocates a fresh one.
pub struct ResourceCache {
    pub instances: Vec<ResourceInstance>,
    by_slot: FxHashMap<u32, SlotEntry>,
    /// Runtime handles whose instances were retired this frame.
    pub retired_handles: Vec<crate::runtime::ResourceHandle>,
}

impl ResourceCache {
    pub fn new() -> ResourceCache {
        ResourceCache {
            instances: Vec::new(),
            by_slot: FxHashMap::default(),
            retired_handles: Vec::new(),
        }
    }

    pub fn snapshot(&self) -> ResourceCacheSnapshot {
        ResourceCacheSnapshot {
            instances: self.instances.clone(),
            by_slot: self.by_slot.clone(),
            num_retired: self.retired_handles.len(),
        }
    }

    /// Rolls the cache back to `snapshot`. Handles retired since the
    /// snapshot reattach to their instances; runtime resources created
    /// since belong to no surviving instance and are retired for
    /// deferred destruction instead.
    pub fn restore(&mut self, snapshot: ResourceCacheSnapshot) {
        let kept: fxhash::FxHashSet<crate::runtime::ResourceHandle> = snapshot
            .instances
            .iter()
            .filter_map(|i| i.runtime_handle)
            .collect();
        let mut orphans = Vec::new();
        for instance in &self.instances {
            if let Some(handle) = instance.runtime_handle {
                if !kept.contains(&handle) {
                    orphans.push(handle);
                }
            }
        }
        self.instances = snapshot.instances;
        self.by_slot = snapshot.by_slot;
        self.retired_handles.truncate(snapshot.num_retired);
        self.retired_handles.extend(orphans);
    }

    /// Instance index backing `slot` for the temporal layer active at
    /// `frame_index`, offset `frames_back` frames into the past.
    pub fn instance_index(&self, slot: u32, frame_index: u64, frames_back: u32) -> Option<u32> {
        let entry = self.by_slot.get(&slot)?;
        let layers = entry.layers as u64;
        let layer = (frame_index + layers - (frames_back as u64 % layers)) % layers;
        Some(entry.base + layer as u32)
    }

    /// Re-resolves instances against this frame's declarations.
    pub fn resolve(
        &mut self,
        resource_decls: &[ResourceDecl],
        arena: &Arena,
        frame_index: u64,
    ) -> Result<()> {
        // Per-frame state restarts for every instance; placements and
        // runtime handles persist for stability.
        for instance in &mut self.instances {
            instance.all_accesses = AccessAttr::UNKNOWN;
            instance.initial_access = AccessAttr::UNKNOWN;
            instance.lifetime = crate::resource::Lifetime::UNUSED;
            instance.is_aliased = false;
        }

        for (slot, decl) in resource_decls.iter().enumerate() {
            if decl.desc_var.is_empty() {
                continue;
            }
            let slot = slot as u32;
            let desc = arena
                .read::<crate::resource::ResourceDesc>(decl.desc_var)?
                .normalized();

            let reusable = match self.by_slot.get(&slot) {
                Some(entry) => {
                    let existing = &self.instances[entry.base as usize];
                    existing.desc == desc
                }
                None => false,
            };

            if !reusable {
                if let Some(entry) = self.by_slot.get(&slot).copied() {
                    for layer in 0..entry.layers {
                        let old = &mut self.instances[(entry.base + layer) as usize];
                        old.decl_slot = INDEX_NONE;
                        if let Some(handle) = old.runtime_handle.take() {
                            self.retired_handles.push(handle);
                        }
                        old.placement = None;
                    }
                    debug!(
                        "resource slot {} descriptor changed, instance retired",
                        slot
                    );
                }
                let base = self.instances.len() as u32;
                for layer in 0..desc.temporal_layers {
                    let mut instance = ResourceInstance::new(slot, layer, desc, decl.name);
                    instance.is_external = decl.is_external();
                    self.instances.push(instance);
                }
                self.by_slot.insert(
                    slot,
                    SlotEntry {
                        base,
                        layers: desc.temporal_layers,
                    },
                );
            } else {
                let entry = self.by_slot[&slot];
                for layer in 0..entry.layers {
                    let instance = &mut self.instances[(entry.base + layer) as usize];
                    instance.name = decl.name;
                    instance.is_external = decl.is_external();
                    instance.last_used_frame = frame_index;
                }
            }
        }
        Ok(())
    }
}

/// Per-subresource tracking record during the walk.
#[derive(Clone)]
struct SubresRecord {
    range: SubresourceRange,
    access: AccessAttr,
    /// Node that established the current state: the latest transition, or
    /// the writer for discard-entered states. `INDEX_NONE` before first
    /// use.
    producer: u32,
    /// Last writer in program order, kept for write-after-write and
    /// direct prior-writer edges.
    last_writer: u32,
    /// Readers since the last writer, for write-after-read edges.
    readers: SmallVec<[NodeId; 4]>,
    /// Head of the transition chain for this range.
    transition_head: u32,
}

pub struct AnalysisInput<'a> {
    pub graph: &'a mut Graph,
    pub cmds: &'a [CmdInfo],
    pub arena: &'a Arena,
    pub registry: &'a ProgramRegistry,
    pub dynamic_node_decls: &'a [NodeDeclInfo],
    pub resource_decls: &'a [ResourceDecl],
}

/// Runs the access walk, mutating the graph with transition nodes and
/// dependency edges.
pub fn run(
    input: AnalysisInput,
    cache: &mut ResourceCache,
    frame_index: u64,
    output: &mut AccessAnalysis,
) -> Result<()> {
    output.clear();

    let AnalysisInput {
        graph,
        cmds,
        arena,
        registry,
        dynamic_node_decls,
        resource_decls,
    } = input;

    let mut states: FxHashMap<u32, Vec<SubresRecord>> = FxHashMap::default();

    for (cmd_index, cmd) in cmds.iter().enumerate() {
        let first_access = output.accesses.len() as u32;

        if !cmd.is_builtin() {
            let decl = resolve_node_decl(registry, dynamic_node_decls, cmd)?;
            collect_cmd_accesses(
                cmd, decl, arena, resource_decls, cache, frame_index, output,
            )?;
        }

        let count = output.accesses.len() as u32 - first_access;
        output.cmd_access_ranges.push((first_access, count));

        for access_index in first_access..first_access + count {
            let access = output.accesses[access_index as usize].clone();
            apply_access(graph, cmd.node, &access, cache, &mut states, output)?;
        }
    }

    debug!(
        "access analysis: {} accesses, {} transitions",
        output.accesses.len(),
        output.transitions.len()
    );
    Ok(())
}

/// Flattens the resource arguments of one command into subresource
/// accesses.
fn collect_cmd_accesses(
    cmd: &CmdInfo,
    decl: &NodeDeclInfo,
    arena: &Arena,
    resource_decls: &[ResourceDecl],
    cache: &ResourceCache,
    frame_index: u64,
    output: &mut AccessAnalysis,
) -> Result<()> {
    for (param_index, param) in decl.params.iter().enumerate() {
        if !param.is_resource() || param.access.is_unknown() {
            continue;
        }
        let arg = match cmd.args.get(param_index) {
            Some(arg) if !arg.is_empty() => *arg,
            _ => continue,
        };
        let view_size = ::std::mem::size_of::<ResourceView>();
        let num_views = arg.len() / view_size;
        if !param.is_unbounded_array && num_views > param.num_elements as usize {
            return Err(Error::IndexOutOfBounds);
        }
        for elem in 0..num_views {
            let view = arena.read::<ResourceView>(arg.slice(elem * view_size, view_size))?;
            if view.resource.index() >= resource_decls.len() {
                return Err(Error::InvalidArguments);
            }
            let instance_index = cache
                .instance_index(
                    view.resource.0,
                    frame_index,
                    view.temporal_layer_offset,
                )
                .ok_or(Error::InvalidArguments)?;
            let desc = cache.instances[instance_index as usize].desc;
            let range = view_range(&view, &desc)?;
            output.accesses.push(SubresourceAccess {
                param: param_index as u32,
                array_offset: elem as u32,
                resource_instance: instance_index,
                range,
                access: param.access,
            });
        }
    }
    Ok(())
}

/// Resolves a view's subresource range against the resource descriptor.
fn view_range(
    view: &ResourceView,
    desc: &crate::resource::ResourceDesc,
) -> Result<SubresourceRange> {
    let aspect = if view.view_format != crate::resource::Format::Unknown {
        view.view_format.aspect_mask()
    } else {
        desc.format.aspect_mask()
    };
    let max_layers = desc.image_array_layers().max(1);
    let max_mips = desc.mip_levels.max(1);

    let layer_end = if view.array_layers == !0u32 {
        max_layers
    } else {
        view.base_array_layer + view.array_layers
    };
    let mip_end = if view.mip_levels == !0u32 {
        max_mips
    } else {
        view.base_mip_level + view.mip_levels
    };
    if layer_end > max_layers
        || mip_end > max_mips
        || view.base_array_layer >= layer_end
        || view.base_mip_level >= mip_end
    {
        return Err(Error::IndexOutOfBounds);
    }
    Ok(SubresourceRange::new(
        aspect,
        view.base_array_layer,
        layer_end,
        view.base_mip_level,
        mip_end,
    ))
}

fn apply_access(
    graph: &mut Graph,
    node: NodeId,
    access: &SubresourceAccess,
    cache: &mut ResourceCache,
    states: &mut FxHashMap<u32, Vec<SubresRecord>>,
    output: &mut AccessAnalysis,
) -> Result<()> {
    let instance_index = access.resource_instance;

    {
        let instance = &mut cache.instances[instance_index as usize];
        if instance.initial_access.is_unknown() {
            instance.initial_access = access.access;
        }
        instance.all_accesses = instance.all_accesses.merged_with(&access.access);
    }

    let records = states.entry(instance_index).or_insert_with(|| {
        let desc = &cache.instances[instance_index as usize].desc;
        vec![SubresRecord {
            range: SubresourceRange::whole(
                desc.format.aspect_mask(),
                desc.image_array_layers(),
                desc.mip_levels,
            ),
            access: AccessAttr::UNKNOWN,
            producer: INDEX_NONE,
            last_writer: INDEX_NONE,
            readers: SmallVec::new(),
            transition_head: INDEX_NONE,
        }]
    });

    let mut next_records: Vec<SubresRecord> = Vec::with_capacity(records.len() + 2);

    for record in records.drain(..) {
        let mut complements = ClipComplements::new();
        let hit = SubresourceRange::clip(&record.range, &access.range, &mut complements);

        let hit = match hit {
            None => {
                next_records.push(record);
                continue;
            }
            Some(hit) => hit,
        };

        // Parts of the record outside the access keep their state.
        for range in complements.drain() {
            let mut leftover = record.clone();
            leftover.range = range;
            next_records.push(leftover);
        }

        let mut updated = SubresRecord {
            range: hit,
            access: access.access,
            producer: record.producer,
            last_writer: record.last_writer,
            readers: record.readers.clone(),
            transition_head: record.transition_head,
        };

        let is_write = access.access.is_write();

        if record.access.is_mergeable_with(&access.access) {
            // Same state, no transition. Order after the producer and the
            // prior writer.
            updated.access = record.access.merged_with(&access.access);
            add_edge_once(graph, record.producer, node)?;
            add_edge_once(graph, record.last_writer, node)?;
            updated.readers.push(node);
        } else if access.access.discards_before() {
            // The contents are discarded entering this access: the state
            // record resets without a transition, but hazard ordering
            // against the prior writer and readers remains.
            add_edge_once(graph, record.last_writer, node)?;
            for reader in &record.readers {
                if *reader != node {
                    graph.add_edge(*reader, node)?;
                }
            }
            updated.producer = node.0;
            updated.last_writer = if is_write { node.0 } else { record.last_writer };
            updated.readers = SmallVec::new();
            if !is_write {
                updated.readers.push(node);
            }
        } else {
            // Incompatible: synthesize a transition node between the
            // prior producer and this node.
            let transition_index = output.transitions.len() as u32;
            let transition_node = graph.add_node(transition_cmd_id(transition_index));
            {
                let consumer = *graph.node(node);
                let t = graph.node_mut(transition_node);
                t.subgraph = consumer.subgraph;
                t.barrier_scope = consumer.barrier_scope;
            }

            add_edge_once(graph, record.producer, transition_node)?;
            if record.last_writer != record.producer {
                add_edge_once(graph, record.last_writer, transition_node)?;
            }
            if is_write {
                // Write-after-read: all readers since the last writer
                // complete before the state changes.
                for reader in &record.readers {
                    graph.add_edge(*reader, transition_node)?;
                }
            }
            graph.add_edge(transition_node, node)?;

            output.transitions.push(Transition {
                prev_transition: record.transition_head,
                node: transition_node,
                resource_instance: instance_index,
                range: hit,
                prev_access: record.access,
                access: access.access,
            });

            updated.transition_head = transition_index;
            updated.producer = transition_node.0;
            updated.last_writer = if is_write { node.0 } else { record.last_writer };
            updated.readers = SmallVec::new();
            if !is_write {
                updated.readers.push(node);
            }
        }

        next_records.push(updated);
    }

    *records = next_records;
    Ok(())
}

fn add_edge_once(graph: &mut Graph, src: u32, dst: NodeId) -> Result<()> {
    if src != INDEX_NONE && src != dst.0 {
        graph.add_edge(NodeId(src), dst)?;
    }
    Ok(())
}
