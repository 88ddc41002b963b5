//! Core data types shared by the compile cache, the admission controller and the pipeline.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::sync::{Arc, Mutex, MutexGuard};

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Element type of a tensor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum DType {
    F32,
    F16,
    Si32,
    I8,
    U8,
    I1,
}

impl DType {
    pub fn size_in_bytes(self) -> usize {
        match self {
            DType::F32 | DType::Si32 => 4,
            DType::F16 => 2,
            DType::I8 | DType::U8 | DType::I1 => 1,
        }
    }

    fn short_name(self) -> &'static str {
        match self {
            DType::F32 => "f32",
            DType::F16 => "f16",
            DType::Si32 => "si32",
            DType::I8 => "i8",
            DType::U8 => "u8",
            DType::I1 => "i1",
        }
    }
}

/// Static description of a dense tensor.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TensorSpec {
    pub dtype: DType,
    pub dims: Vec<usize>,
}

impl TensorSpec {
    pub fn new(dtype: DType, dims: impl Into<Vec<usize>>) -> Self {
        Self {
            dtype,
            dims: dims.into(),
        }
    }

    pub fn element_count(&self) -> Option<usize> {
        self.dims
            .iter()
            .try_fold(1usize, |acc, dim| acc.checked_mul(*dim))
    }

    pub fn byte_len(&self) -> Option<usize> {
        self.element_count()?.checked_mul(self.dtype.size_in_bytes())
    }
}

/// Where the bytes of a tensor currently live.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum Placement {
    #[default]
    Host,
    Device,
}

/// Dense tensor payload exchanged between the caller, the pipeline and the backend.
#[derive(Debug, Clone)]
pub struct Tensor {
    pub spec: TensorSpec,
    pub placement: Placement,
    pub data: Arc<[u8]>,
}

impl Tensor {
    pub fn new(spec: TensorSpec, placement: Placement, data: Vec<u8>) -> RuntimeResult<Self> {
        let expected = spec.byte_len().ok_or_else(|| {
            RuntimeError::parameter(format!("tensor byte length overflows for {spec:?}"))
        })?;
        if expected != data.len() {
            return Err(RuntimeError::parameter(format!(
                "tensor data length mismatch: spec={expected} bytes, data={} bytes",
                data.len()
            )));
        }
        Ok(Self {
            spec,
            placement,
            data: Arc::from(data),
        })
    }

    pub fn host(spec: TensorSpec, data: Vec<u8>) -> RuntimeResult<Self> {
        Self::new(spec, Placement::Host, data)
    }

    pub fn from_f32(dims: impl Into<Vec<usize>>, values: &[f32]) -> RuntimeResult<Self> {
        let bytes = values.iter().flat_map(|v| v.to_le_bytes()).collect();
        Self::host(TensorSpec::new(DType::F32, dims), bytes)
    }

    pub fn to_f32_vec(&self) -> RuntimeResult<Vec<f32>> {
        if self.spec.dtype != DType::F32 {
            return Err(RuntimeError::parameter(format!(
                "expected f32 tensor, got {:?}",
                self.spec.dtype
            )));
        }
        Ok(self
            .data
            .chunks_exact(4)
            .map(|chunk| f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
            .collect())
    }

    /// Same payload, different residency tag. Backends use this after a copy.
    pub fn with_placement(&self, placement: Placement) -> Self {
        Self {
            spec: self.spec.clone(),
            placement,
            data: Arc::clone(&self.data),
        }
    }

    pub fn is_host(&self) -> bool {
        self.placement == Placement::Host
    }
}

/// Key identifying which compiled variant of a partition applies to a set of inputs.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ShapeSignature(Vec<(DType, Vec<usize>)>);

impl ShapeSignature {
    pub fn of(inputs: &[Tensor]) -> Self {
        Self(
            inputs
                .iter()
                .map(|tensor| (tensor.spec.dtype, tensor.spec.dims.clone()))
                .collect(),
        )
    }

    pub fn from_specs(specs: &[TensorSpec]) -> Self {
        Self(
            specs
                .iter()
                .map(|spec| (spec.dtype, spec.dims.clone()))
                .collect(),
        )
    }

    pub fn entries(&self) -> &[(DType, Vec<usize>)] {
        &self.0
    }
}

impl fmt::Display for ShapeSignature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("[")?;
        for (idx, (dtype, dims)) in self.0.iter().enumerate() {
            if idx != 0 {
                f.write_str(", ")?;
            }
            write!(f, "{}:", dtype.short_name())?;
            let dims = dims
                .iter()
                .map(|d| d.to_string())
                .collect::<Vec<_>>()
                .join("x");
            f.write_str(&dims)?;
        }
        f.write_str("]")
    }
}

/// Loadable artifact instance (a compiled template or one of its forks).
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, PartialOrd, Ord)]
pub struct InstanceId(pub u64);

impl fmt::Display for InstanceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "instance#{}", self.0)
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, PartialOrd, Ord, Default)]
pub struct SessionId(pub u64);

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, PartialOrd, Ord)]
pub struct StreamId(pub u64);

impl fmt::Display for StreamId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "stream#{}", self.0)
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, PartialOrd, Ord)]
pub struct EventId(pub u64);

/// One user graph registered with a runtime context.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, PartialOrd, Ord)]
pub struct GraphId(pub u64);

/// Index of a partition inside its user graph's ordered partition sequence.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, PartialOrd, Ord)]
pub struct PartitionId(pub usize);

/// Device memory regions a resident graph may hold.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MemoryKind {
    /// Persistent scratch ("feature") memory.
    Feature,
    Weight,
    FixedPriority,
}

impl MemoryKind {
    pub const ALL: [MemoryKind; 3] = [
        MemoryKind::Feature,
        MemoryKind::Weight,
        MemoryKind::FixedPriority,
    ];
}

impl fmt::Display for MemoryKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            MemoryKind::Feature => "feature",
            MemoryKind::Weight => "weight",
            MemoryKind::FixedPriority => "fixed_priority",
        })
    }
}

impl FromStr for MemoryKind {
    type Err = RuntimeError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "feature" => Ok(MemoryKind::Feature),
            "weight" => Ok(MemoryKind::Weight),
            "fixed_priority" | "fixed-priority" => Ok(MemoryKind::FixedPriority),
            other => Err(RuntimeError::parameter(format!(
                "unknown memory kind '{other}'"
            ))),
        }
    }
}

/// Resource footprint a compiler reports for one compiled artifact.
///
/// All instances forked from the same template share the template's profile.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GraphProfile {
    pub feature_bytes: u64,
    pub weight_bytes: u64,
    pub fixed_priority_bytes: u64,
    /// Part of the feature region that can alias caller buffers when zero-copy reuse is on.
    pub zero_copy_bytes: u64,
    /// Runtime-owned scratch needed at this partition's output boundary.
    pub boundary_bytes: u64,
    pub stream_count: usize,
    pub follow_stream_count: usize,
    pub event_count: usize,
    pub blocking_op_event_count: usize,
    pub collective_event_count: usize,
    /// Participates in a cross-device collective; never evicted.
    pub has_collective_task: bool,
    /// Executes asynchronously; its stream is synchronized before eviction.
    pub asynchronous: bool,
    /// Cannot be forked; the first caller to load it owns it.
    pub exclusive: bool,
}

/// Per-call options applied when an instance is loaded.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoadOptions {
    /// Caller-pinned base addresses; no allocation happens for these kinds.
    pub pinned_bases: BTreeMap<MemoryKind, u64>,
    /// The graph opts into an app-refreshable persistent feature region.
    pub refreshable_feature: bool,
}

impl LoadOptions {
    pub fn with_pinned_base(mut self, kind: MemoryKind, addr: u64) -> Self {
        self.pinned_bases.insert(kind, addr);
        self
    }

    pub fn pinned_base(&self, kind: MemoryKind) -> Option<u64> {
        self.pinned_bases.get(&kind).copied()
    }
}

/// Options forwarded verbatim to the external compiler.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompileOptions {
    pub attrs: BTreeMap<String, String>,
}

/// Opaque description of the graph fragment a partition compiles.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Subgraph {
    pub name: String,
    pub output_count: usize,
}

impl Subgraph {
    pub fn new(name: impl Into<String>, output_count: usize) -> Self {
        Self {
            name: name.into(),
            output_count,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ResourceKind {
    Memory,
    Streams,
    Events,
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ResourceKind::Memory => "device memory",
            ResourceKind::Streams => "streams",
            ResourceKind::Events => "events",
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RuntimeError {
    #[error("invalid parameter: {message}")]
    Parameter { message: String },
    #[error("{resource} exhausted: required {required}, available {available}")]
    ResourceExhausted {
        resource: ResourceKind,
        required: u64,
        available: u64,
    },
    #[error("compiler failure: {message}")]
    Compiler { message: String },
    #[error("execution failure: {message}")]
    Execution { message: String },
    #[error("device failure: {message}")]
    Device { message: String },
    #[error("{op} is not implemented: {reason}")]
    Unimplemented { op: &'static str, reason: String },
}

impl RuntimeError {
    pub fn parameter(message: impl Into<String>) -> Self {
        RuntimeError::Parameter {
            message: message.into(),
        }
    }

    pub fn compiler(message: impl Into<String>) -> Self {
        RuntimeError::Compiler {
            message: message.into(),
        }
    }

    pub fn execution(message: impl Into<String>) -> Self {
        RuntimeError::Execution {
            message: message.into(),
        }
    }

    pub fn device(message: impl Into<String>) -> Self {
        RuntimeError::Device {
            message: message.into(),
        }
    }

    pub fn unimplemented(op: &'static str, reason: impl Into<String>) -> Self {
        RuntimeError::Unimplemented {
            op,
            reason: reason.into(),
        }
    }

    pub fn exhausted(resource: ResourceKind, required: u64, available: u64) -> Self {
        RuntimeError::ResourceExhausted {
            resource,
            required,
            available,
        }
    }

    pub fn is_resource_exhausted(&self) -> bool {
        matches!(self, RuntimeError::ResourceExhausted { .. })
    }
}

/// Convenience alias for results returned by runtime routines.
pub type RuntimeResult<T> = Result<T, RuntimeError>;

pub(crate) fn lock_named<'a, T>(mutex: &'a Mutex<T>, name: &str) -> RuntimeResult<MutexGuard<'a, T>> {
    mutex
        .lock()
        .map_err(|_| RuntimeError::execution(format!("{name} mutex poisoned")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn shape_signature_display_lists_dtype_and_dims() {
        let input = Tensor::host(TensorSpec::new(DType::U8, [1, 2, 2, 3]), vec![0; 12]).unwrap();
        let signature = ShapeSignature::of(&[input]);
        assert_eq!(signature.to_string(), "[u8:1x2x2x3]");
    }

    #[test]
    fn signatures_differ_by_dtype() {
        let a = ShapeSignature::from_specs(&[TensorSpec::new(DType::F32, [4])]);
        let b = ShapeSignature::from_specs(&[TensorSpec::new(DType::Si32, [4])]);
        assert_ne!(a, b);
    }

    #[test]
    fn tensor_rejects_mismatched_payload() {
        let err = Tensor::host(TensorSpec::new(DType::F32, [2]), vec![0; 3]).unwrap_err();
        assert!(matches!(err, RuntimeError::Parameter { .. }));
    }

    #[test]
    fn memory_kind_parses_both_spellings() {
        assert_eq!("fixed-priority".parse::<MemoryKind>().unwrap(), MemoryKind::FixedPriority);
        assert_eq!(" Feature ".parse::<MemoryKind>().unwrap(), MemoryKind::Feature);
        assert!("scratch".parse::<MemoryKind>().is_err());
    }
}
