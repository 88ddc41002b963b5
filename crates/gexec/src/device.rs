//! Interfaces of the collaborators the runtime drives: the graph compiler, the device
//! runtime, the execution backend and optional caller-registered allocators.
//!
//! Implementations must be thread-safe. Device selection is thread-affine, so the
//! runtime calls [`DeviceRuntime::set_device`] before every batch of device calls
//! and never assumes a previous selection persisted.

use std::collections::BTreeMap;

use crate::spec::{
    CompileOptions, EventId, GraphProfile, InstanceId, MemoryKind, RuntimeResult, SessionId,
    ShapeSignature, StreamId, Subgraph, Tensor,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct MemoryInfo {
    pub free: u64,
    pub total: u64,
}

/// A block handed out by an [`ExternalAllocator`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Block {
    pub addr: u64,
    pub size: u64,
}

/// Low-level device primitives.
pub trait DeviceRuntime: Send + Sync {
    fn set_device(&self, device: u32) -> RuntimeResult<()>;

    fn create_stream(&self) -> RuntimeResult<StreamId>;

    fn destroy_stream(&self, stream: StreamId) -> RuntimeResult<()>;

    /// Blocks the calling thread until all work queued on `stream` completes.
    fn synchronize(&self, stream: StreamId) -> RuntimeResult<()>;

    fn create_event(&self) -> RuntimeResult<EventId>;

    fn destroy_event(&self, event: EventId) -> RuntimeResult<()>;

    fn available_streams(&self) -> RuntimeResult<usize>;

    fn available_events(&self) -> RuntimeResult<usize>;

    fn memory_info(&self) -> RuntimeResult<MemoryInfo>;

    fn malloc(&self, kind: MemoryKind, size: u64) -> RuntimeResult<u64>;

    fn free(&self, kind: MemoryKind, addr: u64) -> RuntimeResult<()>;

    /// Copies a host tensor to the device. The copy must later be passed to
    /// [`DeviceRuntime::release_tensor`].
    fn copy_to_device(&self, tensor: &Tensor, stream: StreamId) -> RuntimeResult<Tensor>;

    fn copy_to_host(&self, tensor: &Tensor, stream: StreamId) -> RuntimeResult<Tensor>;

    fn release_tensor(&self, tensor: &Tensor) -> RuntimeResult<()>;

    /// Drops device-side caches kept for dynamic-shape execution. Returns the bytes freed.
    fn trim_caches(&self) -> RuntimeResult<u64> {
        Ok(0)
    }
}

/// Everything the compiler needs to build one variant of a partition.
#[derive(Debug, Clone, Copy)]
pub struct CompileRequest<'a> {
    pub instance: InstanceId,
    pub subgraph: &'a Subgraph,
    pub signature: &'a ShapeSignature,
    pub options: &'a CompileOptions,
    pub session: SessionId,
}

pub trait Compiler: Send + Sync {
    /// Compiles `request.subgraph` for the given shapes under `request.instance`
    /// and reports the artifact's resource footprint.
    fn compile(&self, request: &CompileRequest<'_>) -> RuntimeResult<GraphProfile>;

    /// Clones an already compiled template into a new independently loadable instance.
    fn fork(&self, template: InstanceId, instance: InstanceId) -> RuntimeResult<()>;

    /// True once the compiler wants this artifact rebuilt.
    fn is_stale(&self, instance: InstanceId) -> bool;
}

/// Device addresses bound to a loaded instance, per memory kind.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LoadedMemory {
    pub regions: BTreeMap<MemoryKind, u64>,
}

pub trait ExecutionBackend: Send + Sync {
    fn load(
        &self,
        instance: InstanceId,
        stream: StreamId,
        memory: &LoadedMemory,
    ) -> RuntimeResult<()>;

    /// Dispatches `instance` on `stream`. Completion is only guaranteed after the
    /// stream is synchronized. A non-empty `outputs` holds caller-supplied buffers.
    fn execute(
        &self,
        instance: InstanceId,
        stream: StreamId,
        inputs: &[Tensor],
        outputs: &mut Vec<Tensor>,
    ) -> RuntimeResult<()>;

    fn unload(&self, instance: InstanceId) -> RuntimeResult<()>;
}

/// Caller-provided allocator registered against a stream.
pub trait ExternalAllocator: Send + Sync {
    fn malloc(&self, size: u64) -> RuntimeResult<Block>;

    fn malloc_advise(&self, size: u64, hint_addr: u64) -> RuntimeResult<Block>;

    fn free(&self, block: Block) -> RuntimeResult<()>;
}
