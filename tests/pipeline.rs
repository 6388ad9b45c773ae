//! End-to-end scenarios: build, analyze, schedule, allocate, record.

use std::cell::Cell;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use passgraph::access::{AccessFlags, ShaderStageFlags};
use passgraph::builder::{GraphBuilder, NodeArg, NodeCallFlags};
use passgraph::callback::CommandBuffer;
use passgraph::graph::{SubgraphFlags, INDEX_NONE};
use passgraph::render_graph::{
    RenderGraph, RenderGraphCreateInfo, RenderGraphFlags, RecordInfo, UpdateInfo,
};
use passgraph::resource::{Format, ResourceDesc, ResourceFlags, ResourceView};
use passgraph::schedule::CmdRef;
use passgraph::signature::{
    NodeDesc, NodeDeclFlags, ParamAttr, ParamDesc, Semantic, Signature, SignatureDesc,
};
use passgraph::{NodeCallback, NodeId, NullDevice, ScheduleFlags, Subprogram};

const DRAW: u32 = 0;
const SAMPLE: u32 = 1;

fn test_signature() -> Signature {
    Signature::new(&SignatureDesc {
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
        ],
        max_external_resources: 0,
    })
    .unwrap()
}

fn create_graph(program: Arc<Subprogram>) -> RenderGraph {
    RenderGraph::create(
        Box::new(NullDevice::new()),
        program,
        &RenderGraphCreateInfo::default(),
    )
    .unwrap()
}

fn stable_flags() -> ScheduleFlags {
    ScheduleFlags::KEEP_PROGRAM_ORDER | ScheduleFlags::DISABLE_DEAD_CODE_ELIMINATION
}

fn update_with(
    graph: &mut RenderGraph,
    frame: u64,
    flags: ScheduleFlags,
    build: &dyn Fn(&mut GraphBuilder, &[NodeArg]) -> passgraph::Result<()>,
) {
    let info = UpdateInfo {
        schedule_flags: flags,
        build_override: Some(build),
        ..UpdateInfo::frame(frame)
    };
    graph.update(&info).unwrap();
}

fn image(width: u32, height: u32) -> ResourceDesc {
    ResourceDesc::image_2d(Format::R8G8B8A8Unorm, width, height)
}

fn draw_call(builder: &mut GraphBuilder, decl: u32, view: ResourceView, local: u32) {
    builder
        .add_node(
            decl,
            &[NodeArg::Resource(view)],
            NodeCallFlags::empty(),
            local,
            0,
        )
        .unwrap();
}

//--------------------------------------------------------------------------------------------------

#[test]
fn linear_pipeline_transitions_and_placement() {
    let mut graph = create_graph(Arc::new(Subprogram::new(Arc::new(test_signature()))));

    update_with(&mut graph, 0, stable_flags(), &|builder, _| {
        builder.enter_function([16, 16], 0)?;
        let x = builder.declare_resource(0, &image(128, 128), "x")?;
        let view = ResourceView::whole(x);
        draw_call(builder, DRAW, view, 0); // A writes as render target
        draw_call(builder, SAMPLE, view, 1); // B reads as shader resource
        draw_call(builder, DRAW, view, 2); // C writes as render target
        Ok(())
    });

    let diag = graph.diagnostic_info();

    // Two state changes between the three nodes, plus the initial
    // transition out of the undefined state.
    let transitions: Vec<_> = diag.cmds.iter().filter(|c| c.transition.is_some()).collect();
    assert_eq!(transitions.len(), 3);
    let real: Vec<_> = transitions
        .iter()
        .filter(|c| !c.transition.unwrap().0.is_unknown())
        .collect();
    assert_eq!(real.len(), 2);
    assert!(real[0]
        .transition
        .unwrap()
        .1
        .flags
        .contains(AccessFlags::SHADER_RESOURCE));
    assert!(real[1]
        .transition
        .unwrap()
        .1
        .flags
        .contains(AccessFlags::RENDER_TARGET));

    // X lives from the first command to the last and sits at offset 0,
    // unaliased.
    assert_eq!(diag.resources.len(), 1);
    let x = &diag.resources[0];
    assert_eq!(x.lifetime.begin, 0);
    assert_eq!(x.lifetime.end as usize, diag.cmds.len() - 1);
    let placement = x.placement.unwrap();
    assert_eq!(placement.offset, 0);
    assert!(!x.is_aliased);
    assert_eq!(diag.heaps.len(), 1);
    assert!(diag.heaps[0].used_size >= 128 * 128 * 4);
}

#[test]
fn read_after_read_coalesces() {
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
                "sample_ps",
                NodeDeclFlags::empty(),
                vec![ParamDesc::resource(
                    "source",
                    ParamAttr::access(AccessFlags::SHADER_RESOURCE, ShaderStageFlags::PS),
                )],
            ),
            NodeDesc::new(
                "sample_cs",
                NodeDeclFlags::COMPUTE,
                vec![ParamDesc::resource(
                    "source",
                    ParamAttr::access(AccessFlags::SHADER_RESOURCE, ShaderStageFlags::CS),
                )],
            ),
        ],
        max_external_resources: 0,
    })
    .unwrap();
    let mut graph = create_graph(Arc::new(Subprogram::new(Arc::new(sig))));

    update_with(&mut graph, 0, stable_flags(), &|builder, _| {
        builder.enter_function([16, 16], 0)?;
        let x = builder.declare_resource(0, &image(64, 64), "x")?;
        let view = ResourceView::whole(x);
        draw_call(builder, 0, view, 0);
        draw_call(builder, 1, view, 1); // pixel-stage read
        draw_call(builder, 2, view, 2); // compute-stage read merges
        Ok(())
    });

    let diag = graph.diagnostic_info();
    let real: Vec<_> = diag
        .cmds
        .iter()
        .filter_map(|c| c.transition)
        .filter(|(before, _)| !before.is_unknown())
        .collect();
    // One transition before the first read; the second read merges into
    // the combined read state.
    assert_eq!(real.len(), 1);
    let (_, after) = real[0];
    assert!(after.stages.contains(ShaderStageFlags::PS));

    let x = &diag.resources[0];
    assert!(x.all_accesses.stages.contains(ShaderStageFlags::PS | ShaderStageFlags::CS));
}

#[test]
fn disjoint_mip_writes_are_independent() {
    let mut graph = create_graph(Arc::new(Subprogram::new(Arc::new(test_signature()))));

    update_with(&mut graph, 0, stable_flags(), &|builder, _| {
        builder.enter_function([16, 16], 0)?;
        let x = builder.declare_resource(0, &image(64, 64).with_mips(2), "x")?;
        draw_call(builder, DRAW, ResourceView::whole(x).mip(0), 0);
        draw_call(builder, DRAW, ResourceView::whole(x).mip(1), 1);
        Ok(())
    });

    let diag = graph.diagnostic_info();
    // One resource, two independent initial transitions, no ordering
    // between the two writers.
    assert_eq!(diag.resources.len(), 1);
    let transitions: Vec<_> = diag
        .cmds
        .iter()
        .filter_map(|c| c.transition)
        .collect();
    assert_eq!(transitions.len(), 2);
    assert!(transitions.iter().all(|(before, _)| before.is_unknown()));
}

#[test]
fn disjoint_lifetimes_alias_unless_disabled() {
    let build = |builder: &mut GraphBuilder, _: &[NodeArg]| -> passgraph::Result<()> {
        builder.enter_function([16, 16], 0)?;
        let r1 = builder.declare_resource(0, &image(256, 256), "r1")?;
        let r2 = builder.declare_resource(1, &image(256, 256), "r2")?;
        let v1 = ResourceView::whole(r1);
        let v2 = ResourceView::whole(r2);
        draw_call(builder, DRAW, v1, 0);
        draw_call(builder, SAMPLE, v1, 1); // last use of r1
        draw_call(builder, DRAW, v2, 2); // first use of r2
        draw_call(builder, SAMPLE, v2, 3);
        Ok(())
    };

    let mut graph = create_graph(Arc::new(Subprogram::new(Arc::new(test_signature()))));
    update_with(&mut graph, 0, stable_flags(), &build);
    let diag = graph.diagnostic_info();
    let r1 = &diag.resources[0];
    let r2 = &diag.resources[1];
    assert!(r1.lifetime.end < r2.lifetime.begin);
    assert_eq!(r1.placement.unwrap(), r2.placement.unwrap());
    assert!(r1.is_aliased && r2.is_aliased);

    // Same frame with aliasing disabled: distinct offsets.
    let mut graph = RenderGraph::create(
        Box::new(NullDevice::new()),
        Arc::new(Subprogram::new(Arc::new(test_signature()))),
        &RenderGraphCreateInfo {
            flags: RenderGraphFlags::NO_GPU_MEMORY_ALIASING,
            ..Default::default()
        },
    )
    .unwrap();
    update_with(&mut graph, 0, stable_flags(), &build);
    let diag = graph.diagnostic_info();
    let r1 = &diag.resources[0];
    let r2 = &diag.resources[1];
    assert_ne!(
        r1.placement.unwrap().offset,
        r2.placement.unwrap().offset
    );
    assert!(!r1.is_aliased && !r2.is_aliased);
}

#[test]
fn temporal_layers_rotate_across_frames() {
    let mut graph = create_graph(Arc::new(Subprogram::new(Arc::new(test_signature()))));

    let build = |builder: &mut GraphBuilder, _: &[NodeArg]| -> passgraph::Result<()> {
        builder.enter_function([16, 16], 0)?;
        let history = builder.declare_resource(
            0,
            &image(64, 64).with_temporal_layers(3),
            "history",
        )?;
        // Write this frame's layer, read last frame's.
        draw_call(builder, DRAW, ResourceView::whole(history), 0);
        draw_call(builder, SAMPLE, ResourceView::whole(history).temporal(1), 1);
        Ok(())
    };

    update_with(&mut graph, 0, stable_flags(), &build);
    let diag = graph.diagnostic_info();
    assert_eq!(diag.resources.len(), 3);

    // Each update touches two of the three instances (current write,
    // previous read); the third idles.
    let used = diag
        .resources
        .iter()
        .filter(|r| !r.lifetime.is_unused())
        .count();
    assert_eq!(used, 2);

    // The written instance rotates with the frame index.
    let mut written_layers = Vec::new();
    for frame in 0..3u64 {
        update_with(&mut graph, frame, stable_flags(), &build);
        let diag = graph.diagnostic_info();
        let writer = diag
            .resources
            .iter()
            .find(|r| {
                !r.lifetime.is_unused()
                    && r.all_accesses.flags.contains(AccessFlags::RENDER_TARGET)
            })
            .unwrap();
        written_layers.push(writer.temporal_layer);
    }
    written_layers.sort();
    written_layers.dedup();
    assert_eq!(written_layers.len(), 3);
}

#[test]
fn atomic_subgraph_end_to_end() {
    let mut graph = create_graph(Arc::new(Subprogram::new(Arc::new(test_signature()))));

    update_with(
        &mut graph,
        0,
        ScheduleFlags::DISABLE_DEAD_CODE_ELIMINATION,
        &|builder, _| {
            builder.enter_function([16, 16], 0)?;
            let a = builder.declare_resource(0, &image(32, 32), "a")?;
            let b = builder.declare_resource(1, &image(32, 32), "b")?;
            draw_call(builder, DRAW, ResourceView::whole(a), 0);
            builder.begin_subgraph(SubgraphFlags::ATOMIC)?;
            draw_call(builder, SAMPLE, ResourceView::whole(a), 1);
            draw_call(builder, DRAW, ResourceView::whole(b), 2);
            draw_call(builder, SAMPLE, ResourceView::whole(b), 3);
            builder.end_subgraph()?;
            draw_call(builder, DRAW, ResourceView::whole(a), 4);
            Ok(())
        },
    );

    // Subgraph members occupy a contiguous run of the schedule.
    let schedule = graph.scheduled_cmds();
    let member_positions: Vec<usize> = schedule
        .cmds
        .iter()
        .enumerate()
        .filter(|(_, c)| {
            graph.frame_graph().node(c.node).subgraph != INDEX_NONE
        })
        .map(|(i, _)| i)
        .collect();
    assert!(!member_positions.is_empty());
    let first = member_positions[0];
    for (offset, position) in member_positions.iter().enumerate() {
        assert_eq!(*position, first + offset);
    }
}

#[test]
fn replay_produces_identical_streams() {
    let mut graph = create_graph(Arc::new(Subprogram::new(Arc::new(test_signature()))));

    let build = |builder: &mut GraphBuilder, _: &[NodeArg]| -> passgraph::Result<()> {
        builder.enter_function([16, 16], 1)?;
        let x = builder.declare_resource(0, &image(64, 64), "x")?;
        builder.enter_loop([2, 0], 0, 0)?;
        for i in 0..3 {
            builder.loop_iteration()?;
            draw_call(builder, DRAW, ResourceView::whole(x), 0);
            draw_call(builder, SAMPLE, ResourceView::whole(x), 1);
            let _ = i;
        }
        builder.exit_loop()?;
        Ok(())
    };

    let capture = |graph: &RenderGraph| -> Vec<(CmdRef, u32, u32)> {
        graph
            .scheduled_cmds()
            .cmds
            .iter()
            .map(|c| (c.cmd_ref, c.queue_index, c.batch_id))
            .collect()
    };
    let stable_ids = |graph: &RenderGraph| -> Vec<u32> {
        graph
            .frame_cmds()
            .iter()
            .map(|c| c.stable_node_id)
            .collect()
    };

    update_with(&mut graph, 0, stable_flags(), &build);
    let first = capture(&graph);
    let first_ids = stable_ids(&graph);
    let first_placements: Vec<_> = graph
        .diagnostic_info()
        .resources
        .iter()
        .map(|r| r.placement)
        .collect();

    update_with(&mut graph, 1, stable_flags(), &build);
    assert_eq!(capture(&graph), first);
    assert_eq!(stable_ids(&graph), first_ids);
    let second_placements: Vec<_> = graph
        .diagnostic_info()
        .resources
        .iter()
        .map(|r| r.placement)
        .collect();
    assert_eq!(second_placements, first_placements);
}

#[test]
fn dead_code_elimination_end_to_end() {
    let mut graph = create_graph(Arc::new(Subprogram::new(Arc::new(test_signature()))));

    update_with(&mut graph, 0, ScheduleFlags::empty(), &|builder, _| {
        builder.enter_function([16, 16], 0)?;
        let scratch = builder.declare_resource(0, &image(32, 32), "scratch")?;
        let output = builder.declare_resource(
            1,
            &image(32, 32).with_flags(ResourceFlags::PERSISTENT),
            "output",
        )?;
        draw_call(builder, DRAW, ResourceView::whole(scratch), 0);
        draw_call(builder, DRAW, ResourceView::whole(output), 1);
        Ok(())
    });

    let diag = graph.diagnostic_info();
    // Only the persistent write and its transition survive.
    let names: Vec<&str> = diag
        .cmds
        .iter()
        .filter(|c| c.transition.is_none())
        .map(|c| c.name.as_str())
        .collect();
    assert_eq!(names, vec!["draw"]);
    let scratch = diag.resources.iter().find(|r| r.name.as_str() == "scratch").unwrap();
    assert!(scratch.lifetime.is_unused());
    assert!(scratch.placement.is_none());
}

#[test]
fn record_commands_invokes_bound_callbacks() {
    let sig = Arc::new(test_signature());
    let mut program = Subprogram::new(sig);
    let hits = Arc::new(AtomicUsize::new(0));
    let hits_in_callback = hits.clone();
    program
        .bind_by_name(
            "draw",
            NodeCallback::new(move |ctx| {
                let view = ctx.arg_resource_view(0)?;
                let resource = ctx.arg_resource(0, 0)?;
                assert_eq!(view.resource.0, resource.decl_slot);
                assert!(ctx
                    .arg_access(0, 0)?
                    .flags
                    .contains(AccessFlags::RENDER_TARGET));
                assert!(ctx.render_targets_info().is_some());
                hits_in_callback.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }),
        )
        .unwrap();

    let mut graph = create_graph(Arc::new(program));
    update_with(&mut graph, 0, stable_flags(), &|builder, _| {
        builder.enter_function([16, 16], 0)?;
        let x = builder.declare_resource(0, &image(16, 16), "x")?;
        draw_call(builder, DRAW, ResourceView::whole(x), 0);
        draw_call(builder, SAMPLE, ResourceView::whole(x), 1);
        Ok(())
    });

    let schedule_len = graph.scheduled_cmds().cmds.len() as u32;
    graph
        .record_commands(&RecordInfo {
            command_buffer: CommandBuffer(1),
            cmd_begin: 0,
            num_cmds: schedule_len,
        })
        .unwrap();
    assert_eq!(hits.load(Ordering::SeqCst), 1);
}

#[test]
fn unknown_node_binding_fails() {
    let sig = Arc::new(test_signature());
    let mut program = Subprogram::new(sig);
    let result = program.bind_by_name("no_such_node", NodeCallback::new(|_| Ok(())));
    assert_eq!(result.err(), Some(passgraph::Error::UnknownNode));
}

#[test]
fn zero_access_node_without_side_effect_is_dead() {
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
                "prepare_constants",
                NodeDeclFlags::empty(),
                vec![ParamDesc::value::<u32>("count")],
            ),
            NodeDesc::new("debug_marker", NodeDeclFlags::SIDE_EFFECT, vec![]),
        ],
        max_external_resources: 0,
    })
    .unwrap();
    let mut graph = create_graph(Arc::new(Subprogram::new(Arc::new(sig))));

    let helper = Cell::new(NodeId(0));
    let marker = Cell::new(NodeId(0));
    let build = |builder: &mut GraphBuilder, _: &[NodeArg]| -> passgraph::Result<()> {
        builder.enter_function([16, 16], 0)?;
        let out = builder.declare_resource(
            0,
            &image(16, 16).with_flags(ResourceFlags::PERSISTENT),
            "out",
        )?;
        let count = 4u32;
        helper.set(builder.add_node(
            1,
            &[NodeArg::value(&count)],
            NodeCallFlags::empty(),
            1,
            0,
        )?);
        marker.set(builder.add_node(2, &[], NodeCallFlags::empty(), 2, 0)?);
        draw_call(builder, DRAW, ResourceView::whole(out), 0);
        Ok(())
    };
    update_with(&mut graph, 0, ScheduleFlags::empty(), &build);

    // A data-only node writes nothing and declares no side effect, so
    // nothing can depend on it and elimination removes it. The marker
    // node survives on its side-effect flag alone.
    let schedule = graph.scheduled_cmds();
    assert!(!schedule.is_node_scheduled(helper.get()));
    assert!(schedule.is_node_scheduled(marker.get()));
}

#[test]
fn failed_update_retains_previous_frame() {
    let sig = Arc::new(test_signature());
    let mut program = Subprogram::new(sig);
    let hits = Arc::new(AtomicUsize::new(0));
    let hits_in_callback = hits.clone();
    program
        .bind_by_name(
            "draw",
            NodeCallback::new(move |_| {
                hits_in_callback.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }),
        )
        .unwrap();
    let mut graph = create_graph(Arc::new(program));

    let good = |builder: &mut GraphBuilder, _: &[NodeArg]| -> passgraph::Result<()> {
        builder.enter_function([16, 16], 0)?;
        let x = builder.declare_resource(0, &image(32, 32), "x")?;
        draw_call(builder, DRAW, ResourceView::whole(x), 0);
        draw_call(builder, SAMPLE, ResourceView::whole(x), 1);
        Ok(())
    };
    update_with(&mut graph, 0, stable_flags(), &good);
    let good_schedule_len = graph.scheduled_cmds().cmds.len();
    let good_cmd_count = graph.frame_cmds().len();

    // The next frame's body builds a dependency cycle; the update fails
    // in the scheduler, well after the builder rebuilt its frame and the
    // cache resolved the new declarations.
    let bad = |builder: &mut GraphBuilder, _: &[NodeArg]| -> passgraph::Result<()> {
        builder.enter_function([16, 16], 0)?;
        let x = builder.declare_resource(0, &image(32, 32), "x")?;
        let a = builder.add_node(
            DRAW,
            &[NodeArg::Resource(ResourceView::whole(x))],
            NodeCallFlags::empty(),
            1,
            0,
        )?;
        let b = builder.add_node(
            SAMPLE,
            &[NodeArg::Resource(ResourceView::whole(x))],
            NodeCallFlags::empty(),
            2,
            0,
        )?;
        builder.add_dependency(b, a)?;
        Ok(())
    };
    let info = UpdateInfo {
        schedule_flags: stable_flags(),
        build_override: Some(&bad),
        ..UpdateInfo::frame(1)
    };
    assert_eq!(graph.update(&info), Err(passgraph::Error::InvalidProgram));

    // The published frame, schedule and resources are still frame 0's,
    // and recording against the retained schedule works.
    assert_eq!(graph.scheduled_cmds().cmds.len(), good_schedule_len);
    assert_eq!(graph.frame_cmds().len(), good_cmd_count);
    graph
        .record_commands(&RecordInfo {
            command_buffer: CommandBuffer(1),
            cmd_begin: 0,
            num_cmds: good_schedule_len as u32,
        })
        .unwrap();
    assert_eq!(hits.load(Ordering::SeqCst), 1);

    // An application-level build error is retained-safe too.
    let aborting = |_: &mut GraphBuilder, _: &[NodeArg]| -> passgraph::Result<()> {
        Err(passgraph::Error::OutOfMemory)
    };
    let info = UpdateInfo {
        schedule_flags: stable_flags(),
        build_override: Some(&aborting),
        ..UpdateInfo::frame(2)
    };
    assert_eq!(graph.update(&info), Err(passgraph::Error::OutOfMemory));
    graph
        .record_commands(&RecordInfo {
            command_buffer: CommandBuffer(1),
            cmd_begin: 0,
            num_cmds: good_schedule_len as u32,
        })
        .unwrap();
    assert_eq!(hits.load(Ordering::SeqCst), 2);
}
