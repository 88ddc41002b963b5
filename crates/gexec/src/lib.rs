//! Runtime layer between a graph compiler and a device's execution engine.
//!
//! A [`Pipeline`] runs a user graph split into partitions. Each partition is
//! compiled once per input shape signature by the [`cache::CompileCache`],
//! forked for every additional session, and loaded onto the device through the
//! [`admission::AdmissionController`], which evicts other resident graphs when
//! memory, streams or events run short.

pub mod admission;
pub mod allocator;
pub mod cache;
pub mod config;
pub mod context;
pub mod device;
pub mod pipeline;
pub mod profiling;
pub mod spec;

pub use admission::{ResidentInfo, ResidentState, ResourceRequirements};
pub use allocator::AllocationPath;
pub use cache::{CacheEntry, EntryState};
pub use config::RuntimeOptions;
pub use context::RuntimeContext;
pub use device::{Block, Compiler, DeviceRuntime, ExecutionBackend, ExternalAllocator, MemoryInfo};
pub use pipeline::{BuildStatus, Invocation, Partitioner, Pipeline, SequentialPartitioner};
pub use spec::{
    CompileOptions, DType, GraphProfile, InstanceId, LoadOptions, MemoryKind, PartitionId,
    Placement, ResourceKind, RuntimeError, RuntimeResult, SessionId, ShapeSignature, StreamId,
    Subgraph, Tensor, TensorSpec,
};
