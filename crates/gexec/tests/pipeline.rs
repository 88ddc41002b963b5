mod common;

use std::sync::mpsc;
use std::sync::Arc;

use gexec::{
    BuildStatus, GraphProfile, InstanceId, Invocation, PartitionId, Partitioner, Pipeline,
    Placement, RuntimeContext, RuntimeError, RuntimeOptions, RuntimeResult, SessionId, Subgraph,
    Tensor,
};
use gexec_backend_ref::{RefAllocator, RefDevice};

use common::{context, feature_profile, map_f32, scalar};

fn three_stage(device: &Arc<RefDevice>) -> (Arc<RuntimeContext>, Vec<Subgraph>) {
    device.register_graph("add1", feature_profile(1024), map_f32(|x| x + 1.0));
    device.register_graph("mul2", feature_profile(1024), map_f32(|x| x * 2.0));
    device.register_graph("add10", feature_profile(1024), map_f32(|x| x + 10.0));
    let ctx = context(device, RuntimeOptions::default());
    let partitions = vec![
        Subgraph::new("add1", 1),
        Subgraph::new("mul2", 1),
        Subgraph::new("add10", 1),
    ];
    (ctx, partitions)
}

/// Skips the middle partition when the first one produced a large value.
struct Threshold;

impl Partitioner for Threshold {
    fn first(&self, _inputs: &[Tensor]) -> RuntimeResult<PartitionId> {
        Ok(PartitionId(0))
    }

    fn next(&self, current: PartitionId, outputs: &[Tensor]) -> RuntimeResult<Option<PartitionId>> {
        match current.0 {
            0 => {
                let value = outputs[0].to_f32_vec()?[0];
                Ok(Some(PartitionId(if value > 5.0 { 2 } else { 1 })))
            }
            1 => Ok(Some(PartitionId(2))),
            _ => Ok(None),
        }
    }
}

#[test]
fn partitions_chain_outputs_into_inputs() -> anyhow::Result<()> {
    let device = Arc::new(RefDevice::default());
    let (ctx, partitions) = three_stage(&device);
    let pipeline = Pipeline::sequential(ctx, partitions)?;

    let input = Tensor::from_f32([2], &[1.0, 2.0])?;
    let outputs = pipeline.execute_direct(Invocation::new(SessionId(1), vec![input]))?;
    assert_eq!(outputs.len(), 1);
    assert!(outputs[0].is_host());
    assert_eq!(outputs[0].to_f32_vec()?, vec![14.0, 16.0]);
    assert_eq!(device.compile_count(), 3);
    assert_eq!(device.live_copies(), 0);
    Ok(())
}

#[test]
fn partitioner_can_skip_partitions_based_on_data() -> anyhow::Result<()> {
    let device = Arc::new(RefDevice::default());
    let (ctx, partitions) = three_stage(&device);
    let pipeline = Pipeline::new(ctx, partitions, Arc::new(Threshold))?;

    let small = pipeline.execute_direct(Invocation::new(SessionId(1), vec![scalar(1.0)]))?;
    assert_eq!(small[0].to_f32_vec()?, vec![14.0]);

    let large = pipeline.execute_direct(Invocation::new(SessionId(1), vec![scalar(9.0)]))?;
    assert_eq!(large[0].to_f32_vec()?, vec![20.0]);
    assert_eq!(device.compile_count(), 3, "partitions are shared across paths");
    Ok(())
}

#[test]
fn single_partition_calls_take_the_fast_path() -> anyhow::Result<()> {
    let device = Arc::new(RefDevice::default());
    device.register_graph("add1", feature_profile(1024), map_f32(|x| x + 1.0));
    let ctx = context(&device, RuntimeOptions::default());
    let pipeline = Pipeline::sequential(Arc::clone(&ctx), vec![Subgraph::new("add1", 1)])?;

    for value in [1.0, 2.0, 3.0] {
        let outputs = pipeline.execute_direct(Invocation::new(SessionId(1), vec![scalar(value)]))?;
        assert_eq!(outputs[0].to_f32_vec()?, vec![value + 1.0]);
    }
    assert_eq!(ctx.profiler().count(gexec::profiling::FAST_PATH), 2);
    assert_eq!(device.execute_count(), 3);
    assert_eq!(device.live_copies(), 0);

    // An evicted memo entry falls back to regular admission.
    ctx.unload(InstanceId(1))?;
    let outputs = pipeline.execute_direct(Invocation::new(SessionId(1), vec![scalar(5.0)]))?;
    assert_eq!(outputs[0].to_f32_vec()?, vec![6.0]);
    assert_eq!(ctx.profiler().count(gexec::profiling::FAST_PATH), 2);
    Ok(())
}

#[test]
fn compile_reports_build_status() -> anyhow::Result<()> {
    let device = Arc::new(RefDevice::default());
    let (ctx, partitions) = three_stage(&device);
    let multi = Pipeline::sequential(Arc::clone(&ctx), partitions)?;
    let single = Pipeline::sequential(ctx, vec![Subgraph::new("add1", 1)])?;

    assert_eq!(
        multi.compile(&[scalar(1.0)], SessionId(1))?,
        BuildStatus::NotFullyBuilt
    );
    assert_eq!(
        single.compile(&[scalar(1.0)], SessionId(1))?,
        BuildStatus::Complete
    );
    assert_eq!(device.compile_count(), 2, "only entry partitions compile");

    // Executing compiles the later partitions for the shapes they see.
    multi.execute_direct(Invocation::new(SessionId(1), vec![scalar(1.0)]))?;
    assert_eq!(
        multi.compile(&[scalar(1.0)], SessionId(1))?,
        BuildStatus::Complete
    );
    assert_eq!(device.compile_count(), 4);
    Ok(())
}

#[test]
fn explicit_load_primes_the_fast_path() -> anyhow::Result<()> {
    let device = Arc::new(RefDevice::default());
    device.register_graph("add1", feature_profile(1024), map_f32(|x| x + 1.0));
    let ctx = context(&device, RuntimeOptions::default());
    let pipeline = Pipeline::sequential(Arc::clone(&ctx), vec![Subgraph::new("add1", 1)])?;

    pipeline.compile(&[scalar(0.0)], SessionId(3))?;
    pipeline.load(&Invocation::new(SessionId(3), vec![scalar(0.0)]))?;
    let outputs = pipeline.execute_direct(Invocation::new(SessionId(3), vec![scalar(4.0)]))?;
    assert_eq!(outputs[0].to_f32_vec()?, vec![5.0]);
    assert_eq!(ctx.profiler().count(gexec::profiling::FAST_PATH), 1);
    assert_eq!(device.load_count(), 1);
    Ok(())
}

#[test]
fn load_requires_a_compiled_entry() -> anyhow::Result<()> {
    let device = Arc::new(RefDevice::default());
    let (ctx, partitions) = three_stage(&device);
    let pipeline = Pipeline::sequential(ctx, partitions)?;

    let err = pipeline
        .load(&Invocation::new(SessionId(1), vec![scalar(1.0)]))
        .unwrap_err();
    assert!(matches!(err, RuntimeError::Parameter { .. }), "{err}");

    pipeline.compile(&[scalar(1.0)], SessionId(1))?;
    let instance = pipeline.load(&Invocation::new(SessionId(1), vec![scalar(1.0)]))?;
    assert!(device.is_loaded(instance));
    Ok(())
}

#[test]
fn callback_receives_outputs() -> anyhow::Result<()> {
    let device = Arc::new(RefDevice::default());
    let (ctx, partitions) = three_stage(&device);
    let pipeline = Pipeline::sequential(ctx, partitions)?;

    let (tx, rx) = mpsc::channel();
    pipeline.execute(
        Invocation::new(SessionId(1), vec![scalar(0.0)]).with_callback(move |status, outputs| {
            let _ = tx.send((status, outputs));
        }),
    )?;
    let (status, outputs) = rx.recv()?;
    assert!(status.is_ok());
    assert_eq!(outputs[0].to_f32_vec()?, vec![12.0]);
    Ok(())
}

#[test]
fn failed_execution_reports_empty_outputs_and_releases_copies() -> anyhow::Result<()> {
    let device = Arc::new(RefDevice::default());
    device.register_graph("add1", feature_profile(1024), map_f32(|x| x + 1.0));
    device.register_graph("fault", feature_profile(1024), |_inputs: &[Tensor]| {
        anyhow::bail!("kernel fault")
    });
    let ctx = context(&device, RuntimeOptions::default());
    let pipeline = Pipeline::sequential(
        ctx,
        vec![Subgraph::new("add1", 1), Subgraph::new("fault", 1)],
    )?;

    let (tx, rx) = mpsc::channel();
    let returned = pipeline.execute(
        Invocation::new(SessionId(1), vec![scalar(0.0)]).with_callback(move |status, outputs| {
            let _ = tx.send((status, outputs));
        }),
    );
    let (status, outputs) = rx.recv()?;
    let err = status.unwrap_err();
    assert!(matches!(err, RuntimeError::Execution { .. }), "{err}");
    assert!(err.to_string().contains("kernel fault"));
    assert!(outputs.is_empty());
    assert_eq!(returned.unwrap_err(), err);
    assert_eq!(device.live_copies(), 0);
    Ok(())
}

#[test]
fn execute_without_callback_is_rejected() -> anyhow::Result<()> {
    let device = Arc::new(RefDevice::default());
    let (ctx, partitions) = three_stage(&device);
    let pipeline = Pipeline::sequential(ctx, partitions)?;
    let err = pipeline
        .execute(Invocation::new(SessionId(1), vec![scalar(0.0)]))
        .unwrap_err();
    assert!(matches!(err, RuntimeError::Parameter { .. }), "{err}");
    assert_eq!(device.execute_count(), 0);
    Ok(())
}

#[test]
fn outputs_honor_placement_and_supplied_buffers() -> anyhow::Result<()> {
    let device = Arc::new(RefDevice::default());
    device.register_graph("add1", feature_profile(1024), map_f32(|x| x + 1.0));
    let ctx = context(&device, RuntimeOptions::default());
    let pipeline = Pipeline::sequential(ctx, vec![Subgraph::new("add1", 1)])?;

    let on_device = pipeline.execute_direct(
        Invocation::new(SessionId(1), vec![scalar(1.0)]).with_output_placement(Placement::Device),
    )?;
    assert_eq!(on_device[0].placement, Placement::Device);

    let supplied = pipeline.execute_direct(
        Invocation::new(SessionId(1), vec![scalar(1.0)]).with_outputs(vec![scalar(0.0)]),
    )?;
    assert_eq!(supplied[0].to_f32_vec()?, vec![2.0]);

    let err = pipeline
        .execute_direct(
            Invocation::new(SessionId(1), vec![scalar(1.0)])
                .with_outputs(vec![Tensor::from_f32([2], &[0.0, 0.0])?]),
        )
        .unwrap_err();
    assert!(matches!(err, RuntimeError::Parameter { .. }), "{err}");
    assert_eq!(device.live_copies(), 0);
    Ok(())
}

#[test]
fn finalize_unloads_later_partitions_first() -> anyhow::Result<()> {
    let device = Arc::new(RefDevice::default());
    let (ctx, partitions) = three_stage(&device);
    let pipeline = Pipeline::sequential(Arc::clone(&ctx), partitions)?;

    pipeline.execute_direct(Invocation::new(SessionId(1), vec![scalar(1.0)]))?;
    assert_eq!(device.loaded_instances().len(), 3);

    pipeline.finalize()?;
    assert_eq!(
        device.unload_order(),
        vec![InstanceId(3), InstanceId(2), InstanceId(1)]
    );
    assert!(ctx.cache().is_empty());
    assert_eq!(device.allocated_bytes(), 0);
    assert_eq!(device.streams_in_use(), 0);

    let err = pipeline
        .execute_direct(Invocation::new(SessionId(1), vec![scalar(1.0)]))
        .unwrap_err();
    assert!(matches!(err, RuntimeError::Parameter { .. }), "{err}");
    pipeline.finalize()?;
    Ok(())
}

#[test]
fn boundary_scratch_lives_until_finalize() -> anyhow::Result<()> {
    let device = Arc::new(RefDevice::default());
    let producer = GraphProfile {
        boundary_bytes: 4096,
        ..GraphProfile::default()
    };
    device.register_graph("produce", producer, map_f32(|x| x + 1.0));
    device.register_graph("consume", GraphProfile::default(), map_f32(|x| x * 3.0));
    let ctx = context(&device, RuntimeOptions::default());
    let partitions = vec![Subgraph::new("produce", 1), Subgraph::new("consume", 1)];
    let pipeline = Pipeline::sequential(Arc::clone(&ctx), partitions.clone())?;

    for _ in 0..2 {
        let outputs = pipeline.execute_direct(Invocation::new(SessionId(1), vec![scalar(1.0)]))?;
        assert_eq!(outputs[0].to_f32_vec()?, vec![6.0]);
    }
    assert_eq!(device.allocated_bytes(), 4096, "scratch allocated once");
    pipeline.finalize()?;
    assert_eq!(device.allocated_bytes(), 0);

    // A caller allocator on the stream owns boundary buffers instead.
    let with_allocator = Pipeline::sequential(ctx, partitions)?;
    with_allocator.register_allocator(with_allocator.default_stream(), Arc::new(RefAllocator::new()))?;
    with_allocator.execute_direct(Invocation::new(SessionId(1), vec![scalar(1.0)]))?;
    assert_eq!(device.allocated_bytes(), 0);
    Ok(())
}

#[test]
fn stale_artifacts_mark_the_graph_stale() -> anyhow::Result<()> {
    let device = Arc::new(RefDevice::default());
    let (ctx, partitions) = three_stage(&device);
    let pipeline = Pipeline::sequential(ctx, partitions)?;

    pipeline.execute_direct(Invocation::new(SessionId(1), vec![scalar(1.0)]))?;
    assert!(!pipeline.is_user_graph_stale()?);
    device.mark_stale("mul2");
    assert!(pipeline.is_user_graph_stale()?);
    Ok(())
}

#[test]
fn partition_output_count_is_checked() -> anyhow::Result<()> {
    let device = Arc::new(RefDevice::default());
    device.register_graph("one", GraphProfile::default(), map_f32(|x| x));
    let ctx = context(&device, RuntimeOptions::default());
    let pipeline = Pipeline::sequential(ctx, vec![Subgraph::new("one", 2)])?;

    let err = pipeline
        .execute_direct(Invocation::new(SessionId(1), vec![scalar(1.0)]))
        .unwrap_err();
    assert!(matches!(err, RuntimeError::Execution { .. }), "{err}");
    Ok(())
}
