mod common;

use std::sync::{Arc, Barrier};
use std::thread;

use gexec::profiling;
use gexec::{
    DType, EntryState, GraphProfile, Invocation, PartitionId, Pipeline, RuntimeError,
    RuntimeOptions, SessionId, ShapeSignature, Subgraph, Tensor, TensorSpec,
};
use gexec_backend_ref::RefDevice;

use common::{context, feature_profile, identity, scalar};

fn image(dims: [usize; 4]) -> anyhow::Result<Tensor> {
    let spec = TensorSpec::new(DType::U8, dims);
    let len = spec.byte_len().unwrap_or(0);
    Ok(Tensor::host(spec, vec![7; len])?)
}

#[test]
fn concurrent_sessions_compile_once_and_fork_the_rest() -> anyhow::Result<()> {
    let device = Arc::new(RefDevice::default());
    device.register_graph("net", feature_profile(4096), identity);
    let ctx = context(&device, RuntimeOptions::default());
    let pipeline = Pipeline::sequential(ctx, vec![Subgraph::new("net", 1)])?;

    const SESSIONS: u64 = 8;
    let barrier = Barrier::new(SESSIONS as usize);
    let results: Vec<_> = thread::scope(|scope| {
        let handles: Vec<_> = (0..SESSIONS)
            .map(|session| {
                let pipeline = &pipeline;
                let barrier = &barrier;
                scope.spawn(move || {
                    barrier.wait();
                    pipeline.execute_direct(Invocation::new(SessionId(session), vec![scalar(1.0)]))
                })
            })
            .collect();
        handles.into_iter().map(|h| h.join()).collect()
    });

    for result in results {
        let outputs = result.expect("worker panicked")?;
        assert_eq!(outputs[0].to_f32_vec()?, vec![1.0]);
    }
    assert_eq!(device.compile_count(), 1, "one compile per entry");
    assert_eq!(device.fork_count(), SESSIONS as usize - 1);

    let signature = ShapeSignature::of(&[scalar(1.0)]);
    let entry = pipeline
        .cache_entry(PartitionId(0), &signature)?
        .expect("entry exists");
    assert_eq!(entry.instances().count(), SESSIONS as usize);
    Ok(())
}

#[test]
fn repeated_shape_reuses_the_loaded_instance() -> anyhow::Result<()> {
    let device = Arc::new(RefDevice::default());
    device.register_graph("resnet", feature_profile(1 << 16), identity);
    let ctx = context(&device, RuntimeOptions::default());
    let pipeline = Pipeline::sequential(Arc::clone(&ctx), vec![Subgraph::new("resnet", 1)])?;
    let session = SessionId(1);

    for _ in 0..3 {
        let outputs =
            pipeline.execute_direct(Invocation::new(session, vec![image([1, 224, 224, 3])?]))?;
        assert_eq!(outputs[0].spec.dims, vec![1, 224, 224, 3]);
    }
    assert_eq!(device.compile_count(), 1);
    assert_eq!(device.fork_count(), 0);
    assert_eq!(device.load_count(), 1);
    assert_eq!(ctx.profiler().count(profiling::FAST_PATH), 2);

    pipeline.execute_direct(Invocation::new(session, vec![image([2, 224, 224, 3])?]))?;
    assert_eq!(device.compile_count(), 2, "a new shape compiles a new variant");
    Ok(())
}

#[test]
fn forked_instances_are_independent() -> anyhow::Result<()> {
    let device = Arc::new(RefDevice::default());
    device.register_graph("net", feature_profile(1024), identity);
    let ctx = context(&device, RuntimeOptions::default());
    let pipeline = Pipeline::sequential(Arc::clone(&ctx), vec![Subgraph::new("net", 1)])?;

    pipeline.compile(&[scalar(0.0)], SessionId(1))?;
    let first = pipeline.load(&Invocation::new(SessionId(1), vec![scalar(0.0)]))?;
    let second = pipeline.load(&Invocation::new(SessionId(2), vec![scalar(0.0)]))?;
    assert_ne!(first, second);
    assert_eq!(device.fork_count(), 1);

    assert!(ctx.unload(first)?);
    assert!(!ctx.admission().is_loaded(first));
    assert!(ctx.admission().is_loaded(second));

    let outputs = pipeline.execute_direct(Invocation::new(SessionId(2), vec![scalar(3.0)]))?;
    assert_eq!(outputs[0].to_f32_vec()?, vec![3.0]);
    Ok(())
}

#[test]
fn instantiated_entry_rejects_other_sessions() -> anyhow::Result<()> {
    let device = Arc::new(RefDevice::default());
    let profile = GraphProfile {
        exclusive: true,
        ..feature_profile(1024)
    };
    device.register_graph("bound", profile, identity);
    let ctx = context(&device, RuntimeOptions::default());
    let pipeline = Pipeline::sequential(ctx, vec![Subgraph::new("bound", 1)])?;

    pipeline.execute_direct(Invocation::new(SessionId(1), vec![scalar(1.0)]))?;
    let signature = ShapeSignature::of(&[scalar(1.0)]);
    let entry = pipeline
        .cache_entry(PartitionId(0), &signature)?
        .expect("entry exists");
    assert_eq!(entry.state(), EntryState::Instantiated);

    let err = pipeline
        .execute_direct(Invocation::new(SessionId(2), vec![scalar(1.0)]))
        .unwrap_err();
    assert!(matches!(err, RuntimeError::Unimplemented { .. }), "{err}");

    // The owning session keeps working.
    pipeline.execute_direct(Invocation::new(SessionId(1), vec![scalar(2.0)]))?;
    Ok(())
}

#[test]
fn failed_load_leaves_template_for_the_next_session() -> anyhow::Result<()> {
    let device = Arc::new(RefDevice::default());
    device.register_graph("net", feature_profile(1024), identity);
    let ctx = context(&device, RuntimeOptions::default());
    let pipeline = Pipeline::sequential(Arc::clone(&ctx), vec![Subgraph::new("net", 1)])?;

    device.fail_next_load("injected load failure");
    let err = pipeline
        .execute_direct(Invocation::new(SessionId(1), vec![scalar(1.0)]))
        .unwrap_err();
    assert!(matches!(err, RuntimeError::Device { .. }), "{err}");

    let signature = ShapeSignature::of(&[scalar(1.0)]);
    let entry = pipeline
        .cache_entry(PartitionId(0), &signature)?
        .expect("entry exists");
    assert_eq!(entry.state(), EntryState::Compiled);
    assert!(entry.template().is_some());
    assert_eq!(device.allocated_bytes(), 0, "partial load rolled back");

    pipeline.execute_direct(Invocation::new(SessionId(2), vec![scalar(1.0)]))?;
    assert_eq!(device.compile_count(), 1);
    assert_eq!(device.fork_count(), 0, "the unclaimed template is reused");
    Ok(())
}

#[test]
fn failed_compile_leaves_entry_uncompiled() -> anyhow::Result<()> {
    let device = Arc::new(RefDevice::default());
    device.register_graph("net", feature_profile(1024), identity);
    let ctx = context(&device, RuntimeOptions::default());
    let pipeline = Pipeline::sequential(ctx, vec![Subgraph::new("net", 1)])?;

    device.fail_next_compile("injected compile failure");
    let err = pipeline
        .execute_direct(Invocation::new(SessionId(1), vec![scalar(1.0)]))
        .unwrap_err();
    assert!(matches!(err, RuntimeError::Compiler { .. }), "{err}");

    let signature = ShapeSignature::of(&[scalar(1.0)]);
    let entry = pipeline
        .cache_entry(PartitionId(0), &signature)?
        .expect("entry exists");
    assert_eq!(entry.state(), EntryState::Uncompiled);

    pipeline.execute_direct(Invocation::new(SessionId(1), vec![scalar(1.0)]))?;
    assert_eq!(device.compile_count(), 1);
    Ok(())
}

#[test]
fn unknown_subgraph_is_a_compiler_error() -> anyhow::Result<()> {
    let device = Arc::new(RefDevice::default());
    let ctx = context(&device, RuntimeOptions::default());
    let pipeline = Pipeline::sequential(ctx, vec![Subgraph::new("missing", 1)])?;
    let err = pipeline.compile(&[scalar(1.0)], SessionId(1)).unwrap_err();
    assert!(matches!(err, RuntimeError::Compiler { .. }), "{err}");
    Ok(())
}
