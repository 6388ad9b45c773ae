//! The render graph façade.
//!
//! Owns the builder, the analyzer, the scheduler and the memory planner,
//! and drives them as a phase pipeline on every `update`. A failed update
//! keeps the previous successful frame's schedule and resources; the
//! error surfaces through the return value.

use std::sync::Arc;
use std::time::Instant;

use bitflags::bitflags;
use log::debug;

use crate::analysis::{self, AccessAnalysis, AnalysisInput, ResourceCache};
use crate::arena::NameBuf;
use crate::builder::{resolve_node_decl, CmdInfo, FrameState, GraphBuilder, NodeArg};
use crate::callback::{CallbackContext, CommandBuffer};
use crate::error::{Error, Result};
use crate::graph::{Graph, NodeId, INDEX_NONE};
use crate::memory::{self, Heap, MemoryPlanFlags, MemoryPlanInput};
use crate::program::Subprogram;
use crate::resource::{HeapPlacement, Lifetime, ResourceDecl, ResourceDesc, ResourceId};
use crate::runtime::{ResourceHandle, RuntimeDevice};
use crate::schedule::{self, CmdRef, ScheduleFlags, ScheduleInput, ScheduleOutput};
use crate::access::AccessAttr;

bitflags! {
    /// Creation-time behavior of a render graph.
    pub struct RenderGraphFlags: u32 {
        /// Fail node calls whose declaration has no callback bound and no
        /// default.
        const DISALLOW_UNBOUND_NODES = 1 << 0;
        const NO_GPU_MEMORY_ALIASING = 1 << 1;
        const NO_LIFETIME_ANALYSIS = 1 << 2;
    }
}

/// One stage of the update pipeline.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum PhaseKind {
    Build,
    Analyze,
    Schedule,
    Allocate,
    Finalize,
}

pub const DEFAULT_PHASES: [PhaseKind; 5] = [
    PhaseKind::Build,
    PhaseKind::Analyze,
    PhaseKind::Schedule,
    PhaseKind::Allocate,
    PhaseKind::Finalize,
];

pub struct RenderGraphCreateInfo {
    pub flags: RenderGraphFlags,
    /// Default scheduling flags, used when an update passes
    /// `ScheduleFlags::DEFAULT`.
    pub schedule_flags: ScheduleFlags,
    pub frame_arena_block_size: usize,
    /// Overrides the phase pipeline; `None` runs [`DEFAULT_PHASES`].
    pub phases: Option<Vec<PhaseKind>>,
}

impl Default for RenderGraphCreateInfo {
    fn default() -> RenderGraphCreateInfo {
        RenderGraphCreateInfo {
            flags: RenderGraphFlags::empty(),
            schedule_flags: ScheduleFlags::empty(),
            frame_arena_block_size: 64 * 1024,
            phases: None,
        }
    }
}

pub struct UpdateInfo<'a> {
    pub frame_index: u64,
    /// Highest frame index the GPU has fully completed; gates deferred
    /// destruction.
    pub gpu_completed_frame_index: u64,
    pub schedule_flags: ScheduleFlags,
    pub random_seed: u64,
    pub args: &'a [NodeArg<'a>],
    /// Replaces the default build (which invokes the entry point with
    /// `args`).
    pub build_override: Option<&'a dyn Fn(&mut GraphBuilder, &[NodeArg]) -> Result<()>>,
}

impl<'a> UpdateInfo<'a> {
    pub fn frame(frame_index: u64) -> UpdateInfo<'a> {
        UpdateInfo {
            frame_index,
            gpu_completed_frame_index: frame_index.saturating_sub(2),
            schedule_flags: ScheduleFlags::DEFAULT,
            random_seed: 0,
            args: &[],
            build_override: None,
        }
    }
}

pub struct RecordInfo {
    pub command_buffer: CommandBuffer,
    pub cmd_begin: u32,
    pub num_cmds: u32,
}

//--------------------------------------------------------------------------------------------------
// Diagnostics

#[derive(Clone, Debug)]
pub struct ResourceDiagnostic {
    pub name: NameBuf,
    pub decl_slot: u32,
    pub temporal_layer: u32,
    pub desc: ResourceDesc,
    pub all_accesses: AccessAttr,
    pub initial_access: AccessAttr,
    pub lifetime: Lifetime,
    pub placement: Option<HeapPlacement>,
    pub is_aliased: bool,
    pub is_external: bool,
}

#[derive(Clone, Debug)]
pub struct CmdDiagnostic {
    pub position: u32,
    pub node: NodeId,
    pub queue_index: u32,
    pub batch_id: u32,
    pub name: NameBuf,
    /// `(before, after)` accesses for transitions.
    pub transition: Option<(AccessAttr, AccessAttr)>,
}

#[derive(Clone, Debug)]
pub struct HeapDiagnostic {
    pub memory_type_index: u32,
    pub size: u64,
    pub used_size: u64,
    pub max_used_size: u64,
}

#[derive(Clone, Debug, Default)]
pub struct DiagnosticInfo {
    pub resources: Vec<ResourceDiagnostic>,
    pub cmds: Vec<CmdDiagnostic>,
    pub heaps: Vec<HeapDiagnostic>,
}

//--------------------------------------------------------------------------------------------------

pub struct RenderGraph {
    device: Box<dyn RuntimeDevice>,
    builder: GraphBuilder,
    /// The frame state the published schedule, analysis and diagnostics
    /// refer to. The builder works on its own frame; the two are swapped
    /// only when an update succeeds, so a failed update leaves everything
    /// the caller can observe pointing at the previous frame.
    published: FrameState,
    root: Arc<Subprogram>,
    analysis: AccessAnalysis,
    schedule: ScheduleOutput,
    cache: ResourceCache,
    heaps: Vec<Heap>,
    phases: Vec<PhaseKind>,
    flags: RenderGraphFlags,
    default_schedule_flags: ScheduleFlags,
    deferred_destroy: Vec<(u64, ResourceHandle)>,
    last_update_succeeded: bool,
    last_cmd_count: usize,
}

impl RenderGraph {
    pub fn create(
        device: Box<dyn RuntimeDevice>,
        root: Arc<Subprogram>,
        info: &RenderGraphCreateInfo,
    ) -> Result<RenderGraph> {
        info.schedule_flags.validate()?;
        let builder = GraphBuilder::new(
            root.clone(),
            info.frame_arena_block_size,
            info.flags.contains(RenderGraphFlags::DISALLOW_UNBOUND_NODES),
        );
        let num_params = builder.signature().param_decls().len();
        Ok(RenderGraph {
            device,
            builder,
            published: FrameState::new(info.frame_arena_block_size, num_params),
            root,
            analysis: AccessAnalysis::default(),
            schedule: ScheduleOutput::default(),
            cache: ResourceCache::new(),
            heaps: Vec::new(),
            phases: info
                .phases
                .clone()
                .unwrap_or_else(|| DEFAULT_PHASES.to_vec()),
            flags: info.flags,
            default_schedule_flags: info.schedule_flags,
            deferred_destroy: Vec::new(),
            last_update_succeeded: false,
            last_cmd_count: 0,
        })
    }

    pub fn signature(&self) -> &crate::signature::Signature {
        self.builder.signature()
    }

    pub fn scheduled_cmds(&self) -> &ScheduleOutput {
        &self.schedule
    }

    /// Graph of the published frame.
    pub fn frame_graph(&self) -> &Graph {
        self.published.graph()
    }

    /// Command list of the published frame.
    pub fn frame_cmds(&self) -> &[CmdInfo] {
        self.published.cmds()
    }

    pub fn frame_resource_decls(&self) -> &[ResourceDecl] {
        self.published.resource_decls()
    }

    /// Resources reported for an output parameter by the published frame.
    pub fn output_param_resources(&self, param_id: u32) -> &[ResourceId] {
        self.published
            .param_outputs
            .get(param_id as usize)
            .map(|v| v.as_slice())
            .unwrap_or(&[])
    }

    pub fn heaps(&self) -> &[Heap] {
        &self.heaps
    }

    /// Runs the phase pipeline for one frame.
    pub fn update(&mut self, info: &UpdateInfo) -> Result<()> {
        let result = self.update_impl(info);
        self.last_update_succeeded = result.is_ok();
        if let Err(err) = result {
            debug!("update failed: {}; previous schedule retained", err);
        }
        result
    }

    fn update_impl(&mut self, info: &UpdateInfo) -> Result<()> {
        let schedule_flags = if info.schedule_flags.contains(ScheduleFlags::DEFAULT) {
            self.default_schedule_flags
        } else {
            info.schedule_flags
        };
        schedule_flags.validate()?;

        let mut memory_flags = MemoryPlanFlags::empty();
        if self.flags.contains(RenderGraphFlags::NO_GPU_MEMORY_ALIASING) {
            memory_flags |= MemoryPlanFlags::NO_GPU_MEMORY_ALIASING;
        }
        if self.flags.contains(RenderGraphFlags::NO_LIFETIME_ANALYSIS) {
            memory_flags |= MemoryPlanFlags::NO_LIFETIME_ANALYSIS;
        }

        // The cache is mutated in place by the analyze and allocate
        // phases; roll it back on failure so the retained schedule and
        // analysis still describe consistent resources.
        let cache_snapshot = self.cache.snapshot();
        let result = self.run_phases(info, schedule_flags, memory_flags);
        if result.is_err() {
            self.cache.restore(cache_snapshot);
        }
        result
    }

    fn run_phases(
        &mut self,
        info: &UpdateInfo,
        schedule_flags: ScheduleFlags,
        memory_flags: MemoryPlanFlags,
    ) -> Result<()> {
        // New outputs are staged and only published by the finalize
        // phase; the builder works on its own frame, swapped with the
        // published one on success. A failed update keeps the previous
        // frame, schedule and analysis intact.
        let mut pending_analysis = AccessAnalysis::default();
        let mut pending_schedule = ScheduleOutput::default();
        let mut built = false;
        let mut analyzed = false;
        let mut scheduled = false;

        let phases = self.phases.clone();
        for phase in phases {
            let phase_start = Instant::now();
            match phase {
                PhaseKind::Build => {
                    self.builder.begin(info.args)?;
                    let build_result = match info.build_override {
                        Some(build) => build(&mut self.builder, info.args),
                        None => match self.root.entry().cloned() {
                            Some(entry) => (*entry)(&mut self.builder, info.args),
                            None => Ok(()),
                        },
                    };
                    if let Err(err) = build_result {
                        self.builder.abort(err);
                    }
                    self.builder.end()?;
                    built = true;
                }
                PhaseKind::Analyze => {
                    self.cache.resolve(
                        &self.builder.frame.resource_decls,
                        &self.builder.frame.arena,
                        info.frame_index,
                    )?;
                    analysis::run(
                        AnalysisInput {
                            graph: &mut self.builder.frame.graph,
                            cmds: &self.builder.frame.cmds,
                            arena: &self.builder.frame.arena,
                            registry: &self.builder.registry,
                            dynamic_node_decls: &self.builder.frame.dynamic_node_decls,
                            resource_decls: &self.builder.frame.resource_decls,
                        },
                        &mut self.cache,
                        info.frame_index,
                        &mut pending_analysis,
                    )?;
                    analyzed = true;
                }
                PhaseKind::Schedule => {
                    if schedule_flags.contains(ScheduleFlags::AVOID_RESCHEDULE)
                        && self.last_update_succeeded
                        && self.builder.frame.cmds.len() == self.last_cmd_count
                    {
                        debug!("schedule phase skipped, inputs unchanged");
                        // Clone rather than move: the published schedule
                        // must survive a failure in a later phase.
                        pending_schedule = self.schedule.clone();
                        scheduled = true;
                    } else {
                        let external = self.external_output_instances();
                        schedule::run(
                            ScheduleInput {
                                graph: &self.builder.frame.graph,
                                cmds: &self.builder.frame.cmds,
                                analysis: &pending_analysis,
                                registry: &self.builder.registry,
                                dynamic_node_decls: &self.builder.frame.dynamic_node_decls,
                                external_output_instances: &external,
                                flags: schedule_flags,
                                random_seed: info.random_seed,
                            },
                            &mut pending_schedule,
                        )?;
                        scheduled = true;
                    }
                }
                PhaseKind::Allocate => {
                    memory::begin_frame(&mut self.heaps);
                    memory::run(
                        MemoryPlanInput {
                            analysis: &pending_analysis,
                            schedule: &pending_schedule,
                            flags: memory_flags,
                        },
                        &mut self.cache,
                        &mut self.heaps,
                        self.device.as_mut(),
                    )?;
                }
                PhaseKind::Finalize => {
                    if built {
                        self.builder.swap_frame(&mut self.published);
                    }
                    if analyzed {
                        self.analysis = ::std::mem::replace(
                            &mut pending_analysis,
                            AccessAnalysis::default(),
                        );
                    }
                    if scheduled {
                        self.schedule = ::std::mem::replace(
                            &mut pending_schedule,
                            ScheduleOutput::default(),
                        );
                        self.last_cmd_count = self.published.cmds.len();
                    }
                    for handle in self.cache.retired_handles.drain(..) {
                        self.deferred_destroy.push((info.frame_index, handle));
                    }
                    let completed = info.gpu_completed_frame_index;
                    let device = &mut self.device;
                    self.deferred_destroy.retain(|(frame, handle)| {
                        if *frame <= completed {
                            device.destroy_resource(*handle);
                            false
                        } else {
                            true
                        }
                    });
                }
            }
            debug!("phase {:?} took {}us", phase, phase_start.elapsed().as_micros());
        }

        Ok(())
    }

    /// Instances counting as external outputs for dead-code elimination:
    /// persistent, temporal or CPU visible resources, entry resources,
    /// and resources reported through output parameters.
    fn external_output_instances(&self) -> Vec<bool> {
        let mut external: Vec<bool> = self
            .cache
            .instances
            .iter()
            .map(|i| i.is_external_output())
            .collect();
        for resource in self.builder.all_output_param_resources() {
            for (index, instance) in self.cache.instances.iter().enumerate() {
                if instance.decl_slot == resource.0 {
                    external[index] = true;
                }
            }
        }
        external
    }

    /// Records a range of the published command stream by invoking node
    /// callbacks. May be called concurrently on disjoint ranges with
    /// independent command buffers.
    pub fn record_commands(&self, info: &RecordInfo) -> Result<()> {
        let begin = info.cmd_begin as usize;
        let end = begin
            .checked_add(info.num_cmds as usize)
            .ok_or(Error::IntegerOverflow)?;
        if end > self.schedule.cmds.len() {
            return Err(Error::InvalidArguments);
        }

        let mut first_error = None;
        for runtime_cmd in &self.schedule.cmds[begin..end] {
            let cmd_index = match runtime_cmd.cmd_ref {
                CmdRef::Cmd(index) => index as usize,
                // Barrier recording is the backend's concern.
                CmdRef::Transition(_) => continue,
            };
            let cmd = self
                .published
                .cmds
                .get(cmd_index)
                .ok_or(Error::InternalError)?;
            let callback = match &cmd.callback {
                Some(cb) => cb,
                None => continue,
            };
            let decl = resolve_node_decl(
                &self.builder.registry,
                &self.published.dynamic_node_decls,
                cmd,
            )?;
            let mut context = CallbackContext::new(
                info.command_buffer,
                cmd,
                decl,
                &self.published.arena,
                &self.cache.instances,
                self.analysis.cmd_accesses(cmd_index),
            );
            let result = (*callback.func)(&mut context);
            let reported = context.take_error();
            if first_error.is_none() {
                first_error = result.err().or(reported);
            }
        }

        match first_error {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    /// Read-only view of this frame's resources, commands and heaps.
    pub fn diagnostic_info(&self) -> DiagnosticInfo {
        let mut info = DiagnosticInfo::default();

        for instance in &self.cache.instances {
            if instance.decl_slot == INDEX_NONE {
                continue;
            }
            info.resources.push(ResourceDiagnostic {
                name: instance.name,
                decl_slot: instance.decl_slot,
                temporal_layer: instance.temporal_layer,
                desc: instance.desc,
                all_accesses: instance.all_accesses,
                initial_access: instance.initial_access,
                lifetime: instance.lifetime,
                placement: instance.placement,
                is_aliased: instance.is_aliased,
                is_external: instance.is_external,
            });
        }

        for (position, runtime_cmd) in self.schedule.cmds.iter().enumerate() {
            let (name, transition) = match runtime_cmd.cmd_ref {
                CmdRef::Cmd(index) => {
                    let cmd = &self.published.cmds[index as usize];
                    let name = resolve_node_decl(
                        &self.builder.registry,
                        &self.published.dynamic_node_decls,
                        cmd,
                    )
                    .map(|d| d.name)
                    .unwrap_or_default();
                    (name, None)
                }
                CmdRef::Transition(index) => {
                    let transition = &self.analysis.transitions[index as usize];
                    (
                        NameBuf::from_str("transition"),
                        Some((transition.prev_access, transition.access)),
                    )
                }
            };
            info.cmds.push(CmdDiagnostic {
                position: position as u32,
                node: runtime_cmd.node,
                queue_index: runtime_cmd.queue_index,
                batch_id: runtime_cmd.batch_id,
                name,
                transition,
            });
        }

        for heap in &self.heaps {
            info.heaps.push(HeapDiagnostic {
                memory_type_index: heap.memory_type_index,
                size: heap.size,
                used_size: heap.used_size,
                max_used_size: heap.max_used_size,
            });
        }

        info
    }
}

impl Drop for RenderGraph {
    fn drop(&mut self) {
        for (_, handle) in self.deferred_destroy.drain(..) {
            self.device.destroy_resource(handle);
        }
        for instance in &mut self.cache.instances {
            if let Some(handle) = instance.runtime_handle.take() {
                self.device.destroy_resource(handle);
            }
        }
        for heap in &mut self.heaps {
            if let Some(handle) = heap.runtime_handle.take() {
                self.device.destroy_heap(handle);
            }
        }
    }
}
