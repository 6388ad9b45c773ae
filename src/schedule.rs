//! Command scheduling.
//!
//! Topological ordering of the analyzed graph under program-order,
//! subgraph-atomicity, queue-affinity and memory-saving constraints,
//! followed by batch construction with cross-queue fences.

use bitflags::bitflags;
use log::debug;

use crate::analysis::AccessAnalysis;
use crate::builder::CmdInfo;
use crate::error::{Error, Result};
use crate::graph::{Graph, NodeId, INDEX_NONE};
use crate::program::ProgramRegistry;
use crate::signature::{NodeDeclFlags, NodeDeclInfo};

bitflags! {
    /// Per-update scheduling behavior.
    pub struct ScheduleFlags: u32 {
        /// Schedule in stable program order.
        const KEEP_PROGRAM_ORDER = 1 << 0;
        /// Bias the order toward shorter resource lifetimes.
        const PREFER_MEMORY_SAVING = 1 << 1;
        /// Pick among ready nodes with a seeded RNG; for testing.
        const RANDOM_ORDER = 1 << 2;
        /// Among ready nodes prefer the queue of the previous node.
        const MINIMIZE_COMPUTE_GFX_SWITCH = 1 << 3;
        const DISABLE_DEAD_CODE_ELIMINATION = 1 << 4;
        /// Never move work onto async queues.
        const WORKLOAD_TYPE_PIPELINING_DISABLE = 1 << 5;
        /// Among ready nodes prefer a queue different from the previous
        /// node, promoting async overlap.
        const WORKLOAD_TYPE_PIPELINING_AGGRESSIVE = 1 << 6;

        // Reserved bits carried for interface stability.
        const ALLOW_SPLIT_BARRIERS = 1 << 16;
        /// Reuse the previous schedule when inputs are unchanged.
        const AVOID_RESCHEDULE = 1 << 17;
        const ALLOW_FRAME_OVERLAP = 1 << 21;
        const PREFER_RENDERPASS_TRANSITIONS = 1 << 22;
        const DISABLE_RENDERPASS_TRANSITIONS = 1 << 23;

        /// Sentinel: use the creation-time flags.
        const DEFAULT = 1 << 30;
    }
}

impl ScheduleFlags {
    pub const DEFAULT_PERFORMANCE: ScheduleFlags = ScheduleFlags::DEFAULT;
    pub const DEFAULT_MEMORY: ScheduleFlags = ScheduleFlags::PREFER_MEMORY_SAVING;

    pub fn validate(self) -> Result<()> {
        if self.contains(
            ScheduleFlags::MINIMIZE_COMPUTE_GFX_SWITCH
                | ScheduleFlags::WORKLOAD_TYPE_PIPELINING_AGGRESSIVE,
        ) {
            return Err(Error::InvalidArguments);
        }
        if self.contains(
            ScheduleFlags::PREFER_RENDERPASS_TRANSITIONS
                | ScheduleFlags::DISABLE_RENDERPASS_TRANSITIONS,
        ) {
            return Err(Error::InvalidArguments);
        }
        Ok(())
    }
}

pub const QUEUE_GRAPHICS: u32 = 0;
pub const QUEUE_COMPUTE: u32 = 1;
pub const QUEUE_COPY: u32 = 2;

/// What a scheduled entry executes.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum CmdRef {
    /// Index into the frame's command list.
    Cmd(u32),
    /// Index into the analysis transition list.
    Transition(u32),
}

/// One scheduled entry of the output stream.
#[derive(Copy, Clone, Debug)]
pub struct RuntimeCmd {
    pub node: NodeId,
    pub cmd_ref: CmdRef,
    pub queue_index: u32,
    pub batch_id: u32,
}

/// A maximal run of same-queue commands with no intervening cross-queue
/// fence.
#[derive(Clone, Debug)]
pub struct CommandBatch {
    pub queue_index: u32,
    pub cmd_begin: u32,
    pub num_cmds: u32,
    /// Fence signaled at the end of the batch, `INDEX_NONE` if none.
    pub signal_fence: u32,
    /// Fences waited on before the batch starts.
    pub wait_fences: Vec<u32>,
}

#[derive(Clone, Default)]
pub struct ScheduleOutput {
    pub cmds: Vec<RuntimeCmd>,
    pub batches: Vec<CommandBatch>,
    pub num_fences: u32,
    /// Node id to scheduled position; `INDEX_NONE` for eliminated nodes.
    pub node_positions: Vec<u32>,
}

impl ScheduleOutput {
    pub fn clear(&mut self) {
        self.cmds.clear();
        self.batches.clear();
        self.num_fences = 0;
        self.node_positions.clear();
    }

    pub fn is_node_scheduled(&self, node: NodeId) -> bool {
        self.node_positions
            .get(node.index())
            .map_or(false, |&p| p != INDEX_NONE)
    }
}

pub struct ScheduleInput<'a> {
    pub graph: &'a Graph,
    pub cmds: &'a [CmdInfo],
    pub analysis: &'a AccessAnalysis,
    pub registry: &'a ProgramRegistry,
    pub dynamic_node_decls: &'a [NodeDeclInfo],
    /// Instances counting as external outputs for dead-code elimination.
    pub external_output_instances: &'a [bool],
    pub flags: ScheduleFlags,
    pub random_seed: u64,
}

struct XorShift64 {
    state: u64,
}

impl XorShift64 {
    fn new(seed: u64) -> XorShift64 {
        XorShift64 {
            state: if seed == 0 { 0x9e37_79b9_7f4a_7c15 } else { seed },
        }
    }

    fn next(&mut self) -> u64 {
        let mut x = self.state;
        x ^= x << 13;
        x ^= x >> 7;
        x ^= x << 17;
        self.state = x;
        x
    }
}

struct Unit {
    /// Members in program order.
    nodes: Vec<NodeId>,
    queue: u32,
    barrier_scope: u32,
    order_key: u64,
    in_degree: u32,
    /// Lifetime pressure delta for `PREFER_MEMORY_SAVING`: +1 per
    /// instance whose lifetime this unit opens, -1 per instance it
    /// closes.
    memory_score: i32,
}

pub fn run(input: ScheduleInput, output: &mut ScheduleOutput) -> Result<()> {
    input.flags.validate()?;
    output.clear();

    let graph = input.graph;
    let num_nodes = graph.num_nodes();
    output.node_positions.resize(num_nodes, INDEX_NONE);

    let queues = assign_queues(&input)?;
    let live = if input
        .flags
        .contains(ScheduleFlags::DISABLE_DEAD_CODE_ELIMINATION)
    {
        vec![true; num_nodes]
    } else {
        eliminate_dead_code(&input)?
    };

    // Contract atomic subgraphs into single units.
    let mut node_unit = vec![INDEX_NONE; num_nodes];
    let mut units: Vec<Unit> = Vec::new();

    for index in 0..num_nodes {
        let node = NodeId(index as u32);
        if !live[index] || node_unit[index] != INDEX_NONE {
            continue;
        }
        let unit_id = units.len() as u32;
        let members = atomic_group(graph, node, &live);
        for member in &members {
            node_unit[member.index()] = unit_id;
        }
        let queue = members
            .iter()
            .map(|n| queues[n.index()])
            .find(|&q| q != INDEX_NONE)
            .unwrap_or(QUEUE_GRAPHICS);
        let barrier_scope = members
            .iter()
            .map(|n| graph.node(*n).barrier_scope)
            .min()
            .unwrap_or(0);
        let order_key = members.iter().map(|n| order_key(graph, *n)).min().unwrap_or(0);
        units.push(Unit {
            nodes: members,
            queue,
            barrier_scope,
            order_key,
            in_degree: 0,
            memory_score: 0,
        });
    }

    // In-degrees over cross-unit edges. Duplicate edges count twice on
    // both sides, which cancels out.
    for index in 0..num_nodes {
        if node_unit[index] == INDEX_NONE {
            continue;
        }
        for edge in graph.out_edges(NodeId(index as u32)) {
            let dst_unit = node_unit[edge.dst.index()];
            if dst_unit != INDEX_NONE && dst_unit != node_unit[index] {
                units[dst_unit as usize].in_degree += 1;
            }
        }
    }

    // Sequential subgraphs chain their member units in program order.
    let mut sequential_chains: Vec<(u32, u32)> = Vec::new();
    for subgraph in graph.subgraphs() {
        if !subgraph.is_sequential() {
            continue;
        }
        let mut prev: Option<u32> = None;
        for index in subgraph.begin_node.index()..=subgraph.end_node.index().min(num_nodes - 1) {
            let unit = node_unit[index];
            if unit == INDEX_NONE {
                continue;
            }
            if let Some(prev_unit) = prev {
                if prev_unit != unit {
                    units[unit as usize].in_degree += 1;
                    sequential_chains.push((prev_unit, unit));
                }
            }
            if prev != Some(unit) {
                prev = Some(unit);
            }
        }
    }

    // Memory-saving scores.
    if input.flags.contains(ScheduleFlags::PREFER_MEMORY_SAVING) {
        compute_memory_scores(&input, &node_unit, &mut units);
    }

    // Barrier scopes: a unit is not ready until every unit of a smaller
    // scope has been scheduled.
    let mut scope_remaining: Vec<u32> = Vec::new();
    for unit in &units {
        let scope = unit.barrier_scope as usize;
        if scope_remaining.len() <= scope {
            scope_remaining.resize(scope + 1, 0);
        }
        scope_remaining[scope] += 1;
    }
    let mut current_scope = 0usize;

    let mut ready: Vec<u32> = units
        .iter()
        .enumerate()
        .filter(|(_, u)| u.in_degree == 0)
        .map(|(i, _)| i as u32)
        .collect();

    let mut rng = XorShift64::new(input.random_seed);
    let keep_program_order = input.flags.contains(ScheduleFlags::KEEP_PROGRAM_ORDER);
    let random_order =
        input.flags.contains(ScheduleFlags::RANDOM_ORDER) && !keep_program_order;
    let prefer_same_queue = input
        .flags
        .contains(ScheduleFlags::MINIMIZE_COMPUTE_GFX_SWITCH);
    let prefer_other_queue = input
        .flags
        .contains(ScheduleFlags::WORKLOAD_TYPE_PIPELINING_AGGRESSIVE);
    let prefer_memory = input.flags.contains(ScheduleFlags::PREFER_MEMORY_SAVING);

    let mut last_queue = QUEUE_GRAPHICS;
    let mut scheduled_units = 0usize;

    while scheduled_units < units.len() {
        while current_scope < scope_remaining.len() && scope_remaining[current_scope] == 0 {
            current_scope += 1;
        }

        // Only units of the current barrier scope may run.
        let eligible: Vec<usize> = ready
            .iter()
            .enumerate()
            .filter(|(_, &u)| units[u as usize].barrier_scope as usize == current_scope)
            .map(|(i, _)| i)
            .collect();
        if eligible.is_empty() {
            return Err(Error::InvalidProgram);
        }

        let pick_pos = if random_order {
            eligible[(rng.next() % eligible.len() as u64) as usize]
        } else {
            let mut best = eligible[0];
            for &candidate in &eligible[1..] {
                let a = &units[ready[candidate] as usize];
                let b = &units[ready[best] as usize];
                if better_candidate(
                    a,
                    b,
                    last_queue,
                    keep_program_order,
                    prefer_same_queue,
                    prefer_other_queue,
                    prefer_memory,
                ) {
                    best = candidate;
                }
            }
            best
        };

        let unit_id = ready.swap_remove(pick_pos);
        let unit_nodes = units[unit_id as usize].nodes.clone();
        let unit_queue = units[unit_id as usize].queue;
        let unit_scope = units[unit_id as usize].barrier_scope;
        scheduled_units += 1;
        scope_remaining[unit_scope as usize] -= 1;
        last_queue = unit_queue;

        for node in &unit_nodes {
            let position = output.cmds.len() as u32;
            output.node_positions[node.index()] = position;
            let graph_node = graph.node(*node);
            let cmd_ref = if graph_node.is_transition() {
                CmdRef::Transition(graph_node.transition_index())
            } else {
                CmdRef::Cmd(graph_node.cmd_index())
            };
            output.cmds.push(RuntimeCmd {
                node: *node,
                cmd_ref,
                queue_index: unit_queue,
                batch_id: 0,
            });
        }

        // Release successors.
        for node in unit_nodes {
            for edge in graph.out_edges(node) {
                let dst_unit = node_unit[edge.dst.index()];
                if dst_unit == INDEX_NONE || dst_unit == unit_id {
                    continue;
                }
                let u = &mut units[dst_unit as usize];
                u.in_degree -= 1;
                if u.in_degree == 0 {
                    ready.push(dst_unit);
                }
            }
        }
        for &(src, dst) in &sequential_chains {
            if src == unit_id {
                let u = &mut units[dst as usize];
                u.in_degree -= 1;
                if u.in_degree == 0 {
                    ready.push(dst);
                }
            }
        }
    }

    build_batches(graph, &live, output);

    debug!(
        "schedule: {} cmds in {} batches, {} fences",
        output.cmds.len(),
        output.batches.len(),
        output.num_fences
    );
    Ok(())
}

/// Collects the node's atomic group: all live members of its outermost
/// atomic subgraph, in program order; or the node alone.
fn atomic_group(graph: &Graph, node: NodeId, live: &[bool]) -> Vec<NodeId> {
    let mut outermost = INDEX_NONE;
    let mut current = graph.node(node).subgraph;
    while current != INDEX_NONE {
        let subgraph = &graph.subgraphs()[current as usize];
        if subgraph.is_atomic() {
            outermost = current;
        }
        current = subgraph.parent_subgraph;
    }
    if outermost == INDEX_NONE {
        return vec![node];
    }
    let subgraph = &graph.subgraphs()[outermost as usize];
    let mut members = Vec::new();
    for index in subgraph.begin_node.index()..graph.num_nodes() {
        let candidate = NodeId(index as u32);
        let candidate_subgraph = graph.node(candidate).subgraph;
        let is_member = candidate_subgraph == outermost
            || graph.is_parent_subgraph(outermost, candidate_subgraph);
        if is_member && live[index] {
            members.push(candidate);
        }
        // Transitions are appended past the end marker but belong to the
        // subgraph of their consumer, so the scan covers the whole node
        // range.
    }
    // Members execute in program order, each transition riding just
    // before its consumer.
    members.sort_by_key(|n| order_key(graph, *n));
    members
}

/// Sort key approximating program order: commands order by their own
/// index, transitions by their consumer's index (just before it).
fn order_key(graph: &Graph, node: NodeId) -> u64 {
    let graph_node = graph.node(node);
    if graph_node.is_transition() {
        let consumer = graph
            .out_edges(node)
            .iter()
            .map(|e| e.dst.0)
            .min()
            .unwrap_or(node.0);
        (consumer as u64) << 1
    } else {
        ((node.0 as u64) << 1) | 1
    }
}

fn better_candidate(
    a: &Unit,
    b: &Unit,
    last_queue: u32,
    keep_program_order: bool,
    prefer_same_queue: bool,
    prefer_other_queue: bool,
    prefer_memory: bool,
) -> bool {
    if keep_program_order {
        return a.order_key < b.order_key;
    }
    if prefer_same_queue {
        let a_match = a.queue == last_queue;
        let b_match = b.queue == last_queue;
        if a_match != b_match {
            return a_match;
        }
    }
    if prefer_other_queue {
        let a_differs = a.queue != last_queue;
        let b_differs = b.queue != last_queue;
        if a_differs != b_differs {
            return a_differs;
        }
    }
    if prefer_memory && a.memory_score != b.memory_score {
        return a.memory_score < b.memory_score;
    }
    a.order_key < b.order_key
}

fn assign_queues(input: &ScheduleInput) -> Result<Vec<u32>> {
    let graph = input.graph;
    let mut queues = vec![INDEX_NONE; graph.num_nodes()];

    let async_allowed = !input
        .flags
        .contains(ScheduleFlags::WORKLOAD_TYPE_PIPELINING_DISABLE);

    for (index, node) in graph.nodes().iter().enumerate() {
        if node.is_transition() {
            continue;
        }
        let cmd = &input.cmds[node.cmd_index() as usize];
        let decl =
            crate::builder::resolve_node_decl(input.registry, input.dynamic_node_decls, cmd)?;
        queues[index] = queue_for(decl, cmd, async_allowed);
    }

    // Transitions execute on their consumer's queue.
    for (index, node) in graph.nodes().iter().enumerate() {
        if !node.is_transition() {
            continue;
        }
        let consumer_queue = graph
            .out_edges(NodeId(index as u32))
            .iter()
            .filter_map(|e| {
                let q = queues[e.dst.index()];
                if q == INDEX_NONE {
                    None
                } else {
                    Some(q)
                }
            })
            .min()
            .unwrap_or(QUEUE_GRAPHICS);
        queues[index] = consumer_queue;
    }

    Ok(queues)
}

fn queue_for(decl: &NodeDeclInfo, cmd: &CmdInfo, async_allowed: bool) -> u32 {
    if decl.flags.contains(NodeDeclFlags::COPY) {
        return QUEUE_COPY;
    }
    if decl.flags.contains(NodeDeclFlags::COMPUTE) {
        let prefers_async = decl.flags.contains(NodeDeclFlags::PREFER_ASYNC)
            || cmd
                .call_flags
                .contains(crate::builder::NodeCallFlags::PREFER_ASYNC);
        if prefers_async && async_allowed {
            return QUEUE_COMPUTE;
        }
    }
    QUEUE_GRAPHICS
}

/// Reverse reachability from external outputs. A node is live iff its
/// writes transitively reach an external output, or it has observable
/// side effects.
fn eliminate_dead_code(input: &ScheduleInput) -> Result<Vec<bool>> {
    let graph = input.graph;
    let num_nodes = graph.num_nodes();
    let mut live = vec![false; num_nodes];
    let mut work: Vec<NodeId> = Vec::new();

    for (index, node) in graph.nodes().iter().enumerate() {
        if node.is_transition() {
            continue;
        }
        let cmd = &input.cmds[node.cmd_index() as usize];
        let decl =
            crate::builder::resolve_node_decl(input.registry, input.dynamic_node_decls, cmd)?;
        let accesses = input.analysis.cmd_accesses(node.cmd_index() as usize);

        let is_root = decl.flags.contains(NodeDeclFlags::SIDE_EFFECT)
            || accesses.iter().any(|a| {
                a.access.is_write()
                    && input
                        .external_output_instances
                        .get(a.resource_instance as usize)
                        .copied()
                        .unwrap_or(false)
            });
        if is_root {
            live[index] = true;
            work.push(NodeId(index as u32));
        }
    }

    while let Some(node) = work.pop() {
        for edge in graph.in_edges(node) {
            if !live[edge.src.index()] {
                live[edge.src.index()] = true;
                work.push(edge.src);
            }
        }
    }

    let removed = live.iter().filter(|l| !**l).count();
    if removed > 0 {
        debug!("dead code elimination removed {} nodes", removed);
    }
    Ok(live)
}

fn compute_memory_scores(input: &ScheduleInput, node_unit: &[u32], units: &mut [Unit]) {
    let num_instances = input
        .analysis
        .accesses
        .iter()
        .map(|a| a.resource_instance + 1)
        .max()
        .unwrap_or(0) as usize;
    let mut first_user = vec![INDEX_NONE; num_instances];
    let mut last_user = vec![INDEX_NONE; num_instances];

    for (cmd_index, cmd) in input.cmds.iter().enumerate() {
        let unit = node_unit[cmd.node.index()];
        if unit == INDEX_NONE {
            continue;
        }
        for access in input.analysis.cmd_accesses(cmd_index) {
            let slot = access.resource_instance as usize;
            if first_user[slot] == INDEX_NONE {
                first_user[slot] = unit;
            }
            last_user[slot] = unit;
        }
    }
    for slot in 0..num_instances {
        if first_user[slot] != INDEX_NONE {
            units[first_user[slot] as usize].memory_score += 1;
        }
        if last_user[slot] != INDEX_NONE {
            units[last_user[slot] as usize].memory_score -= 1;
        }
    }
}

/// Splits the stream into maximal same-queue runs and wires cross-queue
/// fences: a signal at the producer's batch end, a wait at the consumer's
/// batch start.
fn build_batches(graph: &Graph, live: &[bool], output: &mut ScheduleOutput) {
    if output.cmds.is_empty() {
        return;
    }

    let mut batches: Vec<CommandBatch> = Vec::new();
    let mut batch_of_position: Vec<u32> = vec![0; output.cmds.len()];

    let mut begin = 0usize;
    for position in 0..=output.cmds.len() {
        let split = position == output.cmds.len()
            || output.cmds[position].queue_index != output.cmds[begin].queue_index;
        if !split {
            continue;
        }
        let batch_id = batches.len() as u32;
        for p in begin..position {
            batch_of_position[p] = batch_id;
            output.cmds[p].batch_id = batch_id;
        }
        batches.push(CommandBatch {
            queue_index: output.cmds[begin].queue_index,
            cmd_begin: begin as u32,
            num_cmds: (position - begin) as u32,
            signal_fence: INDEX_NONE,
            wait_fences: Vec::new(),
        });
        begin = position;
    }

    // Cross-queue dependencies become signal/wait pairs.
    let mut num_fences = 0u32;
    for edge in graph.edges() {
        if edge.src.index() >= live.len()
            || edge.dst.index() >= live.len()
            || !live[edge.src.index()]
            || !live[edge.dst.index()]
        {
            continue;
        }
        let src_pos = output.node_positions[edge.src.index()];
        let dst_pos = output.node_positions[edge.dst.index()];
        if src_pos == INDEX_NONE || dst_pos == INDEX_NONE {
            continue;
        }
        let src_batch = batch_of_position[src_pos as usize];
        let dst_batch = batch_of_position[dst_pos as usize];
        if src_batch == dst_batch
            || batches[src_batch as usize].queue_index == batches[dst_batch as usize].queue_index
        {
            continue;
        }
        let fence = if batches[src_batch as usize].signal_fence == INDEX_NONE {
            let fence = num_fences;
            num_fences += 1;
            batches[src_batch as usize].signal_fence = fence;
            fence
        } else {
            batches[src_batch as usize].signal_fence
        };
        let waits = &mut batches[dst_batch as usize].wait_fences;
        if !waits.contains(&fence) {
            waits.push(fence);
        }
    }

    output.batches = batches;
    output.num_fences = num_fences;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::access::{AccessFlags, ShaderStageFlags};
    use crate::analysis::{AccessAnalysis, AnalysisInput, ResourceCache};
    use crate::builder::{GraphBuilder, NodeArg, NodeCallFlags};
    use crate::graph::SubgraphFlags;
    use crate::program::Subprogram;
    use crate::resource::{Format, ResourceDesc, ResourceFlags, ResourceView};
    use crate::signature::{
        NodeDesc, ParamAttr, ParamDesc, Semantic, Signature, SignatureDesc,
    };
    use std::sync::Arc;

    fn program() -> Arc<Subprogram> {
        let sig = Signature::new(&SignatureDesc {
            params: vec![],
            node_descs: vec![
                NodeDesc::new(
                    "draw",
                    NodeDeclFlags::empty(),
                    vec![ParamDesc::resource(
                        "target",
                        ParamAttr::semantic(Semantic::RenderTarget, 0),
                    )],
                ),
                NodeDesc::new(
                    "sample",
                    NodeDeclFlags::empty(),
                    vec![ParamDesc::resource(
                        "source",
                        ParamAttr::access(AccessFlags::SHADER_RESOURCE, ShaderStageFlags::PS),
                    )],
                ),
                NodeDesc::new(
                    "simulate",
                    NodeDeclFlags::COMPUTE | NodeDeclFlags::PREFER_ASYNC,
                    vec![ParamDesc::resource(
                        "buffer",
                        ParamAttr::access(AccessFlags::UNORDERED_ACCESS, ShaderStageFlags::CS),
                    )],
                ),
            ],
            max_external_resources: 0,
        })
        .unwrap();
        Arc::new(Subprogram::new(Arc::new(sig)))
    }

    struct Analyzed {
        builder: GraphBuilder,
        analysis: AccessAnalysis,
        cache: ResourceCache,
    }

    fn analyze(mut builder: GraphBuilder) -> Analyzed {
        let mut cache = ResourceCache::new();
        cache
            .resolve(&builder.frame.resource_decls, &builder.frame.arena, 0)
            .unwrap();
        let mut analysis = AccessAnalysis::default();
        crate::analysis::run(
            AnalysisInput {
                graph: &mut builder.frame.graph,
                cmds: &builder.frame.cmds,
                arena: &builder.frame.arena,
                registry: &builder.registry,
                dynamic_node_decls: &builder.frame.dynamic_node_decls,
                resource_decls: &builder.frame.resource_decls,
            },
            &mut cache,
            0,
            &mut analysis,
        )
        .unwrap();
        Analyzed {
            builder,
            analysis,
            cache,
        }
    }

    fn schedule(analyzed: &Analyzed, flags: ScheduleFlags, seed: u64) -> ScheduleOutput {
        let external: Vec<bool> = analyzed
            .cache
            .instances
            .iter()
            .map(|i| i.is_external_output())
            .collect();
        let mut output = ScheduleOutput::default();
        run(
            ScheduleInput {
                graph: &analyzed.builder.frame.graph,
                cmds: &analyzed.builder.frame.cmds,
                analysis: &analyzed.analysis,
                registry: &analyzed.builder.registry,
                dynamic_node_decls: &analyzed.builder.frame.dynamic_node_decls,
                external_output_instances: &external,
                flags,
                random_seed: seed,
            },
            &mut output,
        )
        .unwrap();
        output
    }

    fn persistent_tex(builder: &mut GraphBuilder, local: u32, name: &str) -> ResourceView {
        let id = builder
            .declare_resource(
                local,
                &ResourceDesc::image_2d(Format::R8G8B8A8Unorm, 32, 32)
                    .with_flags(ResourceFlags::PERSISTENT),
                name,
            )
            .unwrap();
        ResourceView::whole(id)
    }

    fn assert_topological(output: &ScheduleOutput, graph: &crate::graph::Graph) {
        for edge in graph.edges() {
            let src = output.node_positions[edge.src.index()];
            let dst = output.node_positions[edge.dst.index()];
            if src != INDEX_NONE && dst != INDEX_NONE {
                assert!(src < dst, "edge {:?} violated", edge);
            }
        }
    }

    #[test]
    fn program_order_is_kept() {
        let mut builder = GraphBuilder::new(program(), 4096, false);
        builder.begin(&[]).unwrap();
        builder.enter_function([8, 8], 0).unwrap();
        let tex = persistent_tex(&mut builder, 0, "a");
        let n0 = builder
            .add_node(0, &[NodeArg::Resource(tex)], NodeCallFlags::empty(), 0, 0)
            .unwrap();
        let n1 = builder
            .add_node(1, &[NodeArg::Resource(tex)], NodeCallFlags::empty(), 1, 0)
            .unwrap();
        builder.end().unwrap();

        let analyzed = analyze(builder);
        let output = schedule(
            &analyzed,
            ScheduleFlags::KEEP_PROGRAM_ORDER | ScheduleFlags::DISABLE_DEAD_CODE_ELIMINATION,
            0,
        );
        assert_topological(&output, &analyzed.builder.frame.graph);
        assert!(
            output.node_positions[n0.index()] < output.node_positions[n1.index()]
        );
    }

    #[test]
    fn random_order_is_still_topological() {
        let mut builder = GraphBuilder::new(program(), 4096, false);
        builder.begin(&[]).unwrap();
        builder.enter_function([16, 16], 0).unwrap();
        for i in 0..4 {
            let tex = persistent_tex(&mut builder, i, "t");
            builder
                .add_node(
                    0,
                    &[NodeArg::Resource(tex)],
                    NodeCallFlags::empty(),
                    i * 2,
                    0,
                )
                .unwrap();
            builder
                .add_node(
                    1,
                    &[NodeArg::Resource(tex)],
                    NodeCallFlags::empty(),
                    i * 2 + 1,
                    0,
                )
                .unwrap();
        }
        builder.end().unwrap();

        let analyzed = analyze(builder);
        for seed in 1..6u64 {
            let output = schedule(
                &analyzed,
                ScheduleFlags::RANDOM_ORDER | ScheduleFlags::DISABLE_DEAD_CODE_ELIMINATION,
                seed,
            );
            assert_topological(&output, &analyzed.builder.frame.graph);
        }
    }

    #[test]
    fn conflicting_pipelining_flags_rejected() {
        let flags = ScheduleFlags::MINIMIZE_COMPUTE_GFX_SWITCH
            | ScheduleFlags::WORKLOAD_TYPE_PIPELINING_AGGRESSIVE;
        assert_eq!(flags.validate(), Err(Error::InvalidArguments));
        let flags = ScheduleFlags::PREFER_RENDERPASS_TRANSITIONS
            | ScheduleFlags::DISABLE_RENDERPASS_TRANSITIONS;
        assert_eq!(flags.validate(), Err(Error::InvalidArguments));
    }

    #[test]
    fn dead_node_is_removed_unless_disabled() {
        let mut builder = GraphBuilder::new(program(), 4096, false);
        builder.begin(&[]).unwrap();
        builder.enter_function([8, 8], 0).unwrap();
        // Transient resource written but never observed.
        let dead_tex = builder
            .declare_resource(
                0,
                &ResourceDesc::image_2d(Format::R8G8B8A8Unorm, 8, 8),
                "scratch",
            )
            .unwrap();
        let dead = builder
            .add_node(
                0,
                &[NodeArg::Resource(ResourceView::whole(dead_tex))],
                NodeCallFlags::empty(),
                0,
                0,
            )
            .unwrap();
        let live_tex = persistent_tex(&mut builder, 1, "output");
        let live = builder
            .add_node(0, &[NodeArg::Resource(live_tex)], NodeCallFlags::empty(), 1, 0)
            .unwrap();
        builder.end().unwrap();

        let analyzed = analyze(builder);
        let output = schedule(&analyzed, ScheduleFlags::empty(), 0);
        assert!(!output.is_node_scheduled(dead));
        assert!(output.is_node_scheduled(live));

        let output = schedule(
            &analyzed,
            ScheduleFlags::DISABLE_DEAD_CODE_ELIMINATION,
            0,
        );
        assert!(output.is_node_scheduled(dead));
    }

    #[test]
    fn atomic_subgraph_is_not_interleaved() {
        let mut builder = GraphBuilder::new(program(), 4096, false);
        builder.begin(&[]).unwrap();
        builder.enter_function([16, 16], 0).unwrap();
        let t0 = persistent_tex(&mut builder, 0, "t0");
        let t1 = persistent_tex(&mut builder, 1, "t1");

        let n1 = builder
            .add_node(0, &[NodeArg::Resource(t0)], NodeCallFlags::empty(), 0, 0)
            .unwrap();
        builder.begin_subgraph(SubgraphFlags::ATOMIC).unwrap();
        let n2 = builder
            .add_node(1, &[NodeArg::Resource(t0)], NodeCallFlags::empty(), 1, 0)
            .unwrap();
        let n3 = builder
            .add_node(0, &[NodeArg::Resource(t1)], NodeCallFlags::empty(), 2, 0)
            .unwrap();
        let n4 = builder
            .add_node(1, &[NodeArg::Resource(t1)], NodeCallFlags::empty(), 3, 0)
            .unwrap();
        builder.end_subgraph().unwrap();
        let n5 = builder
            .add_node(0, &[NodeArg::Resource(t0)], NodeCallFlags::empty(), 4, 0)
            .unwrap();
        builder.end().unwrap();

        let analyzed = analyze(builder);
        let output = schedule(
            &analyzed,
            ScheduleFlags::DISABLE_DEAD_CODE_ELIMINATION,
            0,
        );
        assert_topological(&output, &analyzed.builder.frame.graph);

        let p2 = output.node_positions[n2.index()];
        let p4 = output.node_positions[n4.index()];
        for outside in &[n1, n5] {
            let p = output.node_positions[outside.index()];
            assert!(
                p < p2 || p > p4,
                "node {:?} interleaved into atomic subgraph",
                outside
            );
        }
        let p3 = output.node_positions[n3.index()];
        assert!(p2 < p3 && p3 < p4);
    }

    #[test]
    fn async_compute_crosses_queues_with_fences() {
        let mut builder = GraphBuilder::new(program(), 4096, false);
        builder.begin(&[]).unwrap();
        builder.enter_function([8, 8], 0).unwrap();
        let buf_id = builder
            .declare_resource(
                0,
                &ResourceDesc::buffer(4096).with_flags(ResourceFlags::PERSISTENT),
                "particles",
            )
            .unwrap();
        let buf = ResourceView::whole(buf_id);
        let tex = persistent_tex(&mut builder, 1, "frame");

        let sim = builder
            .add_node(2, &[NodeArg::Resource(buf)], NodeCallFlags::empty(), 0, 0)
            .unwrap();
        let draw = builder
            .add_node(0, &[NodeArg::Resource(tex)], NodeCallFlags::empty(), 1, 0)
            .unwrap();
        builder.add_dependency(sim, draw).unwrap();
        builder.end().unwrap();

        let analyzed = analyze(builder);
        let output = schedule(&analyzed, ScheduleFlags::KEEP_PROGRAM_ORDER, 0);

        let sim_cmd = &output.cmds[output.node_positions[sim.index()] as usize];
        let draw_cmd = &output.cmds[output.node_positions[draw.index()] as usize];
        assert_eq!(sim_cmd.queue_index, QUEUE_COMPUTE);
        assert_eq!(draw_cmd.queue_index, QUEUE_GRAPHICS);
        assert_ne!(sim_cmd.batch_id, draw_cmd.batch_id);

        let producer = &output.batches[sim_cmd.batch_id as usize];
        let consumer = &output.batches[draw_cmd.batch_id as usize];
        assert_ne!(producer.signal_fence, INDEX_NONE);
        assert!(consumer.wait_fences.contains(&producer.signal_fence));
        assert_eq!(output.num_fences, 1);
    }

    #[test]
    fn scheduler_barrier_partitions_the_stream() {
        let mut builder = GraphBuilder::new(program(), 4096, false);
        builder.begin(&[]).unwrap();
        builder.enter_function([8, 8], 0).unwrap();
        let t0 = persistent_tex(&mut builder, 0, "a");
        let t1 = persistent_tex(&mut builder, 1, "b");
        let before = builder
            .add_node(0, &[NodeArg::Resource(t0)], NodeCallFlags::empty(), 0, 0)
            .unwrap();
        builder.schedule_barrier().unwrap();
        let after = builder
            .add_node(0, &[NodeArg::Resource(t1)], NodeCallFlags::empty(), 1, 0)
            .unwrap();
        builder.end().unwrap();

        let analyzed = analyze(builder);
        // No data dependency between the two draws; the barrier still
        // forces the declared order.
        let output = schedule(&analyzed, ScheduleFlags::empty(), 0);
        assert!(
            output.node_positions[before.index()] < output.node_positions[after.index()]
        );
    }
}
