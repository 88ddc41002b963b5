#![allow(dead_code)]

use std::sync::Arc;

use gexec::{GraphProfile, RuntimeContext, RuntimeOptions, Tensor};
use gexec_backend_ref::RefDevice;
use tracing_subscriber::EnvFilter;

pub const MB: u64 = 1 << 20;

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

pub fn context(device: &Arc<RefDevice>, options: RuntimeOptions) -> Arc<RuntimeContext> {
    init_tracing();
    RuntimeContext::with_backend(options, Arc::clone(device))
}

pub fn feature_profile(bytes: u64) -> GraphProfile {
    GraphProfile {
        feature_bytes: bytes,
        ..GraphProfile::default()
    }
}

pub fn identity(inputs: &[Tensor]) -> anyhow::Result<Vec<Tensor>> {
    Ok(inputs.to_vec())
}

/// Kernel applying `f` to every element of every f32 input.
pub fn map_f32(
    f: impl Fn(f32) -> f32 + Send + Sync + 'static,
) -> impl Fn(&[Tensor]) -> anyhow::Result<Vec<Tensor>> + Send + Sync + 'static {
    move |inputs| {
        inputs
            .iter()
            .map(|tensor| {
                let values: Vec<f32> = tensor.to_f32_vec()?.into_iter().map(&f).collect();
                Ok(Tensor::from_f32(tensor.spec.dims.clone(), &values)?)
            })
            .collect()
    }
}

pub fn scalar(value: f32) -> Tensor {
    Tensor::from_f32([1], &[value]).expect("scalar tensor")
}
