//! Memory planning: heap selection and offset assignment with aliasing.
//!
//! Each transient instance gets a byte range inside a heap such that any
//! two ranges that share bytes have disjoint effective lifetimes. Prior
//! placements are reused whenever the new requirements and lifetimes
//! still permit, so descriptor-stable frames do not shuffle memory.

use log::debug;

use crate::analysis::{AccessAnalysis, ResourceCache};
use crate::error::{Error, Result};
use crate::graph::INDEX_NONE;
use crate::resource::{HeapPlacement, Lifetime, ResourceFlags};
use crate::runtime::{HeapHandle, RuntimeDevice};
use crate::schedule::{CmdRef, ScheduleOutput};

/// A backend memory block placements are carved from.
#[derive(Clone, Debug)]
pub struct Heap {
    pub memory_type_index: u32,
    pub alignment: u64,
    pub size: u64,
    /// High-water mark of the current frame's placements.
    pub used_size: u64,
    /// Highest `used_size` ever observed.
    pub max_used_size: u64,
    pub runtime_handle: Option<HeapHandle>,
}

bitflags::bitflags! {
    pub struct MemoryPlanFlags: u32 {
        /// Place every resource in a private range even when lifetimes
        /// would permit sharing.
        const NO_GPU_MEMORY_ALIASING = 1 << 0;
        /// Treat every resource as live for the whole frame.
        const NO_LIFETIME_ANALYSIS = 1 << 1;
    }
}

#[derive(Clone)]
struct Placed {
    instance: usize,
    offset: u64,
    size: u64,
    lifetime: Lifetime,
}

pub struct MemoryPlanInput<'a> {
    pub analysis: &'a AccessAnalysis,
    pub schedule: &'a ScheduleOutput,
    pub flags: MemoryPlanFlags,
}

/// Assigns heap ranges and creates runtime resources for every transient
/// instance used this frame.
pub fn run(
    input: MemoryPlanInput,
    cache: &mut ResourceCache,
    heaps: &mut Vec<Heap>,
    device: &mut dyn RuntimeDevice,
) -> Result<()> {
    compute_lifetimes(&input, cache);

    // Whole-frame lifetime covers every scheduled command.
    let frame_span = Lifetime {
        begin: 0,
        end: input.schedule.cmds.len().saturating_sub(1) as u32,
    };

    // Gather the instances that need placement, in lifetime order with
    // larger blocks first among equals.
    let mut order: Vec<usize> = Vec::new();
    for (index, instance) in cache.instances.iter_mut().enumerate() {
        if instance.decl_slot == INDEX_NONE || instance.is_external {
            continue;
        }
        let used = !instance.lifetime.is_unused();
        if !used && !instance.is_cross_frame() {
            continue;
        }
        instance.requirements = device.describe_memory(&instance.desc);
        order.push(index);
    }
    // Cross-frame instances go first: their placements must not move, so
    // they claim their prior ranges before transients are packed.
    order.sort_by(|&a, &b| {
        let ia = &cache.instances[a];
        let ib = &cache.instances[b];
        let ka = (
            !ia.is_cross_frame(),
            ia.lifetime.begin,
            ::std::cmp::Reverse(ia.requirements.size),
        );
        let kb = (
            !ib.is_cross_frame(),
            ib.lifetime.begin,
            ::std::cmp::Reverse(ib.requirements.size),
        );
        ka.cmp(&kb)
    });

    let mut placed: Vec<Vec<Placed>> = vec![Vec::new(); heaps.len()];

    for &index in &order {
        let (requirements, lifetime, prior, no_alias) = {
            let instance = &cache.instances[index];
            let no_alias = input
                .flags
                .contains(MemoryPlanFlags::NO_GPU_MEMORY_ALIASING)
                || input.flags.contains(MemoryPlanFlags::NO_LIFETIME_ANALYSIS)
                || instance.desc.flags.contains(ResourceFlags::NO_ALIASING)
                || instance.is_cross_frame();
            (
                instance.requirements,
                instance.lifetime,
                instance.placement,
                no_alias,
            )
        };
        // The usage lifetime is what diagnostics report; placement
        // conflicts use the whole frame when aliasing is off or the
        // contents must survive frame boundaries.
        let effective_lifetime = if no_alias { frame_span } else { lifetime };

        // Try to keep the prior placement.
        let mut placement: Option<HeapPlacement> = None;
        if let Some(prior) = prior {
            if let Some(heap) = heaps.get(prior.heap_index as usize) {
                let fits = heap.memory_type_index == requirements.memory_type_index
                    && prior.offset % requirements.alignment == 0
                    && prior.offset + requirements.size <= heap.size
                    && range_is_free(
                        &placed[prior.heap_index as usize],
                        prior.offset,
                        requirements.size,
                        &effective_lifetime,
                    );
                if fits {
                    placement = Some(prior);
                }
            }
        }

        if placement.is_none() {
            placement = Some(place_instance(
                heaps,
                &mut placed,
                device,
                &requirements,
                &effective_lifetime,
            )?);
        }

        let placement = placement.ok_or(Error::InternalError)?;
        placed[placement.heap_index as usize].push(Placed {
            instance: index,
            offset: placement.offset,
            size: requirements.size,
            lifetime: effective_lifetime,
        });

        let heap = &mut heaps[placement.heap_index as usize];
        heap.used_size = heap.used_size.max(placement.offset + requirements.size);
        heap.max_used_size = heap.max_used_size.max(heap.used_size);

        let instance = &mut cache.instances[index];
        let moved = instance.placement != Some(placement);
        instance.placement = Some(placement);
        if moved {
            // The old backing range may still be in flight; retire the
            // handle through the deferred-destruction queue.
            if let Some(handle) = instance.runtime_handle.take() {
                cache.retired_handles.push(handle);
            }
        }
        if instance.runtime_handle.is_none() {
            let heap_handle = heaps[placement.heap_index as usize]
                .runtime_handle
                .ok_or(Error::InternalError)?;
            let handle =
                device.create_resource(&instance.desc, heap_handle, placement.offset)?;
            instance.runtime_handle = Some(handle);
        }
    }

    // Aliasing marks: two placements sharing bytes of one heap.
    for heap_placements in &placed {
        for (i, a) in heap_placements.iter().enumerate() {
            for b in heap_placements.iter().skip(i + 1) {
                if a.offset < b.offset + b.size && b.offset < a.offset + a.size {
                    cache.instances[a.instance].is_aliased = true;
                    cache.instances[b.instance].is_aliased = true;
                }
            }
        }
    }

    debug!(
        "memory plan: {} placements across {} heaps",
        order.len(),
        heaps.len()
    );
    Ok(())
}

/// Extends instance lifetimes over the scheduled stream. Transitions
/// count as uses of their resource.
fn compute_lifetimes(input: &MemoryPlanInput, cache: &mut ResourceCache) {
    for (position, cmd) in input.schedule.cmds.iter().enumerate() {
        match cmd.cmd_ref {
            CmdRef::Cmd(cmd_index) => {
                for access in input.analysis.cmd_accesses(cmd_index as usize) {
                    let instance = &mut cache.instances[access.resource_instance as usize];
                    instance.lifetime.extend(position as u32);
                }
            }
            CmdRef::Transition(transition_index) => {
                let transition = &input.analysis.transitions[transition_index as usize];
                let instance =
                    &mut cache.instances[transition.resource_instance as usize];
                instance.lifetime.extend(position as u32);
            }
        }
    }
}

fn range_is_free(placements: &[Placed], offset: u64, size: u64, lifetime: &Lifetime) -> bool {
    placements.iter().all(|p| {
        offset >= p.offset + p.size
            || p.offset >= offset + size
            || !p.lifetime.overlaps(lifetime)
    })
}

/// Finds the lowest conflict-free offset in a matching heap, creating or
/// growing heaps as required.
fn place_instance(
    heaps: &mut Vec<Heap>,
    placed: &mut Vec<Vec<Placed>>,
    device: &mut dyn RuntimeDevice,
    requirements: &crate::runtime::MemoryRequirements,
    lifetime: &Lifetime,
) -> Result<HeapPlacement> {
    for (heap_index, heap) in heaps.iter().enumerate() {
        if heap.memory_type_index != requirements.memory_type_index {
            continue;
        }
        if let Some(offset) = find_offset(
            &placed[heap_index],
            heap.size,
            requirements.size,
            requirements.alignment,
            lifetime,
        ) {
            return Ok(HeapPlacement {
                heap_index: heap_index as u32,
                offset,
            });
        }
    }

    // No heap fits: create one.
    let alignment = device.heap_alignment();
    let size = requirements
        .size
        .max(device.default_heap_size())
        .checked_add(alignment - 1)
        .ok_or(Error::IntegerOverflow)?
        / alignment
        * alignment;
    let handle = device.create_heap(requirements.memory_type_index, size)?;
    let heap_index = heaps.len() as u32;
    heaps.push(Heap {
        memory_type_index: requirements.memory_type_index,
        alignment,
        size,
        used_size: 0,
        max_used_size: 0,
        runtime_handle: Some(handle),
    });
    placed.push(Vec::new());
    debug!(
        "created heap {} (type {}, {} bytes)",
        heap_index, requirements.memory_type_index, size
    );
    Ok(HeapPlacement {
        heap_index,
        offset: 0,
    })
}

/// Lowest aligned offset in `[0, heap_size)` whose byte range is free of
/// lifetime-overlapping placements.
fn find_offset(
    placements: &[Placed],
    heap_size: u64,
    size: u64,
    alignment: u64,
    lifetime: &Lifetime,
) -> Option<u64> {
    // Conflicting intervals, sorted by offset; gaps between them are the
    // candidate positions.
    let mut conflicts: Vec<(u64, u64)> = placements
        .iter()
        .filter(|p| p.lifetime.overlaps(lifetime))
        .map(|p| (p.offset, p.offset + p.size))
        .collect();
    conflicts.sort();

    let mut cursor = 0u64;
    for (begin, end) in conflicts {
        let aligned = align_up(cursor, alignment);
        if aligned + size <= begin {
            return Some(aligned);
        }
        cursor = cursor.max(end);
    }
    let aligned = align_up(cursor, alignment);
    if aligned + size <= heap_size {
        Some(aligned)
    } else {
        None
    }
}

fn align_up(v: u64, alignment: u64) -> u64 {
    (v + alignment - 1) / alignment * alignment
}

/// Per-frame reset of heap usage; placements recompute each update.
pub fn begin_frame(heaps: &mut [Heap]) {
    for heap in heaps {
        heap.used_size = 0;
    }
}
