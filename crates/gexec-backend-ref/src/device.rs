use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::{self, ThreadId};

use gexec::device::{
    CompileRequest, Compiler, DeviceRuntime, ExecutionBackend, LoadedMemory, MemoryInfo,
};
use gexec::spec::EventId;
use gexec::{
    GraphProfile, InstanceId, MemoryKind, Placement, ResourceKind, RuntimeError, RuntimeResult,
    StreamId, Tensor,
};
use tracing::debug;

/// Host function standing in for a compiled partition.
pub type Kernel = Arc<dyn Fn(&[Tensor]) -> anyhow::Result<Vec<Tensor>> + Send + Sync>;

const BASE_ADDR: u64 = 0x1000_0000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RefDeviceConfig {
    pub memory_bytes: u64,
    pub streams: usize,
    pub events: usize,
    pub device_count: u32,
}

impl Default for RefDeviceConfig {
    fn default() -> Self {
        Self {
            memory_bytes: 1 << 30,
            streams: 64,
            events: 256,
            device_count: 1,
        }
    }
}

/// Every collaborator call the device observed, in order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RefCall {
    Compile {
        instance: InstanceId,
        subgraph: String,
    },
    Fork {
        template: InstanceId,
        instance: InstanceId,
    },
    Load {
        instance: InstanceId,
        regions: BTreeMap<MemoryKind, u64>,
    },
    Execute {
        instance: InstanceId,
        stream: StreamId,
    },
    Unload {
        instance: InstanceId,
    },
    Malloc {
        kind: MemoryKind,
        addr: u64,
        size: u64,
    },
    Free {
        kind: MemoryKind,
        addr: u64,
    },
    Synchronize {
        stream: StreamId,
    },
    Trim {
        bytes: u64,
    },
}

struct GraphDef {
    profile: GraphProfile,
    kernel: Kernel,
}

struct Artifact {
    subgraph: String,
    stale: bool,
}

#[derive(Default)]
struct State {
    selected: HashMap<ThreadId, u32>,
    allocations: HashMap<u64, (MemoryKind, u64)>,
    used_memory: u64,
    next_addr: u64,
    external_reserved: u64,
    dynamic_cache: u64,
    streams: BTreeSet<StreamId>,
    next_stream: u64,
    events: BTreeSet<EventId>,
    next_event: u64,
    graphs: HashMap<String, GraphDef>,
    artifacts: HashMap<InstanceId, Artifact>,
    loaded: BTreeSet<InstanceId>,
    live_copies: usize,
    fail_next_compile: Option<String>,
    fail_next_load: Option<String>,
    calls: Vec<RefCall>,
}

/// In-process device that implements the device runtime, the compiler and the
/// execution backend over host memory with strict budget accounting.
///
/// Device selection is tracked per thread; every device call fails unless the
/// calling thread selected a device first.
pub struct RefDevice {
    config: RefDeviceConfig,
    state: Mutex<State>,
}

impl RefDevice {
    pub fn new(config: RefDeviceConfig) -> Self {
        Self {
            config,
            state: Mutex::new(State {
                next_addr: BASE_ADDR,
                next_stream: 1,
                next_event: 1,
                ..State::default()
            }),
        }
    }

    pub fn with_memory(memory_bytes: u64) -> Self {
        Self::new(RefDeviceConfig {
            memory_bytes,
            ..RefDeviceConfig::default()
        })
    }

    pub fn config(&self) -> RefDeviceConfig {
        self.config
    }

    /// Makes `name` compilable. Every compile of it reports `profile`.
    pub fn register_graph<F>(&self, name: impl Into<String>, profile: GraphProfile, kernel: F)
    where
        F: Fn(&[Tensor]) -> anyhow::Result<Vec<Tensor>> + Send + Sync + 'static,
    {
        self.inspect().graphs.insert(
            name.into(),
            GraphDef {
                profile,
                kernel: Arc::new(kernel),
            },
        );
    }

    /// Memory held by something outside the runtime, such as another process.
    pub fn reserve_external(&self, bytes: u64) {
        self.inspect().external_reserved = bytes;
    }

    /// Bytes held by the dynamic-shape cache until [`DeviceRuntime::trim_caches`] runs.
    pub fn set_dynamic_cache(&self, bytes: u64) {
        self.inspect().dynamic_cache = bytes;
    }

    /// Marks every artifact compiled from `subgraph` as stale.
    pub fn mark_stale(&self, subgraph: &str) {
        for artifact in self.inspect().artifacts.values_mut() {
            if artifact.subgraph == subgraph {
                artifact.stale = true;
            }
        }
    }

    pub fn fail_next_compile(&self, message: impl Into<String>) {
        self.inspect().fail_next_compile = Some(message.into());
    }

    pub fn fail_next_load(&self, message: impl Into<String>) {
        self.inspect().fail_next_load = Some(message.into());
    }

    pub fn calls(&self) -> Vec<RefCall> {
        self.inspect().calls.clone()
    }

    pub fn clear_calls(&self) {
        self.inspect().calls.clear();
    }

    pub fn compile_count(&self) -> usize {
        self.count_calls(|call| matches!(call, RefCall::Compile { .. }))
    }

    pub fn fork_count(&self) -> usize {
        self.count_calls(|call| matches!(call, RefCall::Fork { .. }))
    }

    pub fn load_count(&self) -> usize {
        self.count_calls(|call| matches!(call, RefCall::Load { .. }))
    }

    pub fn execute_count(&self) -> usize {
        self.count_calls(|call| matches!(call, RefCall::Execute { .. }))
    }

    pub fn unload_order(&self) -> Vec<InstanceId> {
        self.inspect()
            .calls
            .iter()
            .filter_map(|call| match call {
                RefCall::Unload { instance } => Some(*instance),
                _ => None,
            })
            .collect()
    }

    pub fn loaded_instances(&self) -> Vec<InstanceId> {
        self.inspect().loaded.iter().copied().collect()
    }

    pub fn is_loaded(&self, instance: InstanceId) -> bool {
        self.inspect().loaded.contains(&instance)
    }

    /// Device copies of host inputs that were never released.
    pub fn live_copies(&self) -> usize {
        self.inspect().live_copies
    }

    pub fn allocated_bytes(&self) -> u64 {
        self.inspect().used_memory
    }

    pub fn allocated_bytes_of(&self, kind: MemoryKind) -> u64 {
        self.inspect()
            .allocations
            .values()
            .filter(|(k, _)| *k == kind)
            .map(|(_, size)| size)
            .sum()
    }

    pub fn streams_in_use(&self) -> usize {
        self.inspect().streams.len()
    }

    pub fn events_in_use(&self) -> usize {
        self.inspect().events.len()
    }

    fn count_calls(&self, pred: impl Fn(&RefCall) -> bool) -> usize {
        self.inspect().calls.iter().filter(|call| pred(call)).count()
    }

    /// State access for test helpers; a poisoned lock still yields the data.
    fn inspect(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn lock(&self) -> RuntimeResult<MutexGuard<'_, State>> {
        self.state
            .lock()
            .map_err(|_| RuntimeError::device("reference device state poisoned"))
    }

    /// Locks the state after checking the calling thread selected a device.
    fn selected(&self) -> RuntimeResult<MutexGuard<'_, State>> {
        let state = self.lock()?;
        if !state.selected.contains_key(&thread::current().id()) {
            return Err(RuntimeError::device(
                "no device selected on the calling thread",
            ));
        }
        Ok(state)
    }

    fn free_memory(&self, state: &State) -> u64 {
        self.config
            .memory_bytes
            .saturating_sub(state.used_memory + state.external_reserved + state.dynamic_cache)
    }
}

impl Default for RefDevice {
    fn default() -> Self {
        Self::new(RefDeviceConfig::default())
    }
}

impl DeviceRuntime for RefDevice {
    fn set_device(&self, device: u32) -> RuntimeResult<()> {
        if device >= self.config.device_count {
            return Err(RuntimeError::parameter(format!(
                "device {device} does not exist ({} available)",
                self.config.device_count
            )));
        }
        self.lock()?.selected.insert(thread::current().id(), device);
        Ok(())
    }

    fn create_stream(&self) -> RuntimeResult<StreamId> {
        let mut state = self.selected()?;
        if state.streams.len() >= self.config.streams {
            return Err(RuntimeError::exhausted(
                ResourceKind::Streams,
                1,
                0,
            ));
        }
        let stream = StreamId(state.next_stream);
        state.next_stream += 1;
        state.streams.insert(stream);
        Ok(stream)
    }

    fn destroy_stream(&self, stream: StreamId) -> RuntimeResult<()> {
        if !self.selected()?.streams.remove(&stream) {
            return Err(RuntimeError::device(format!("unknown {stream}")));
        }
        Ok(())
    }

    fn synchronize(&self, stream: StreamId) -> RuntimeResult<()> {
        self.selected()?.calls.push(RefCall::Synchronize { stream });
        Ok(())
    }

    fn create_event(&self) -> RuntimeResult<EventId> {
        let mut state = self.selected()?;
        if state.events.len() >= self.config.events {
            return Err(RuntimeError::exhausted(ResourceKind::Events, 1, 0));
        }
        let event = EventId(state.next_event);
        state.next_event += 1;
        state.events.insert(event);
        Ok(event)
    }

    fn destroy_event(&self, event: EventId) -> RuntimeResult<()> {
        if !self.selected()?.events.remove(&event) {
            return Err(RuntimeError::device(format!("unknown event {}", event.0)));
        }
        Ok(())
    }

    fn available_streams(&self) -> RuntimeResult<usize> {
        Ok(self.config.streams.saturating_sub(self.selected()?.streams.len()))
    }

    fn available_events(&self) -> RuntimeResult<usize> {
        Ok(self.config.events.saturating_sub(self.selected()?.events.len()))
    }

    fn memory_info(&self) -> RuntimeResult<MemoryInfo> {
        let state = self.selected()?;
        Ok(MemoryInfo {
            free: self.free_memory(&state),
            total: self.config.memory_bytes,
        })
    }

    fn malloc(&self, kind: MemoryKind, size: u64) -> RuntimeResult<u64> {
        let mut state = self.selected()?;
        let free = self.free_memory(&state);
        if size > free {
            return Err(RuntimeError::exhausted(ResourceKind::Memory, size, free));
        }
        let addr = state.next_addr;
        // Keep blocks apart so addresses stay unique even for zero-sized requests.
        state.next_addr += size.max(1).next_multiple_of(256);
        state.used_memory += size;
        state.allocations.insert(addr, (kind, size));
        state.calls.push(RefCall::Malloc { kind, addr, size });
        Ok(addr)
    }

    fn free(&self, kind: MemoryKind, addr: u64) -> RuntimeResult<()> {
        let mut state = self.selected()?;
        match state.allocations.remove(&addr) {
            Some((allocated_kind, size)) if allocated_kind == kind => {
                state.used_memory -= size;
                state.calls.push(RefCall::Free { kind, addr });
                Ok(())
            }
            Some(entry) => {
                state.allocations.insert(addr, entry);
                Err(RuntimeError::device(format!(
                    "address {addr:#x} was allocated as {} but freed as {kind}",
                    entry.0
                )))
            }
            None => Err(RuntimeError::device(format!(
                "free of unknown address {addr:#x}"
            ))),
        }
    }

    fn copy_to_device(&self, tensor: &Tensor, _stream: StreamId) -> RuntimeResult<Tensor> {
        self.selected()?.live_copies += 1;
        Ok(tensor.with_placement(Placement::Device))
    }

    fn copy_to_host(&self, tensor: &Tensor, _stream: StreamId) -> RuntimeResult<Tensor> {
        let _state = self.selected()?;
        Ok(tensor.with_placement(Placement::Host))
    }

    fn release_tensor(&self, tensor: &Tensor) -> RuntimeResult<()> {
        if tensor.is_host() {
            return Err(RuntimeError::parameter("cannot release a host tensor"));
        }
        let mut state = self.selected()?;
        state.live_copies = state.live_copies.checked_sub(1).ok_or_else(|| {
            RuntimeError::device("released more device copies than were made")
        })?;
        Ok(())
    }

    fn trim_caches(&self) -> RuntimeResult<u64> {
        let mut state = self.selected()?;
        let bytes = std::mem::take(&mut state.dynamic_cache);
        state.calls.push(RefCall::Trim { bytes });
        Ok(bytes)
    }
}

impl Compiler for RefDevice {
    fn compile(&self, request: &CompileRequest<'_>) -> RuntimeResult<GraphProfile> {
        let mut state = self.lock()?;
        if let Some(message) = state.fail_next_compile.take() {
            return Err(RuntimeError::compiler(message));
        }
        let name = &request.subgraph.name;
        let profile = state
            .graphs
            .get(name)
            .map(|graph| graph.profile.clone())
            .ok_or_else(|| RuntimeError::compiler(format!("unknown subgraph '{name}'")))?;
        state.artifacts.insert(
            request.instance,
            Artifact {
                subgraph: name.clone(),
                stale: false,
            },
        );
        state.calls.push(RefCall::Compile {
            instance: request.instance,
            subgraph: name.clone(),
        });
        debug!(instance = %request.instance, subgraph = %name, signature = %request.signature, "reference compile");
        Ok(profile)
    }

    fn fork(&self, template: InstanceId, instance: InstanceId) -> RuntimeResult<()> {
        let mut state = self.lock()?;
        let subgraph = state
            .artifacts
            .get(&template)
            .map(|artifact| artifact.subgraph.clone())
            .ok_or_else(|| RuntimeError::compiler(format!("cannot fork unknown {template}")))?;
        state.artifacts.insert(
            instance,
            Artifact {
                subgraph,
                stale: false,
            },
        );
        state.calls.push(RefCall::Fork { template, instance });
        Ok(())
    }

    fn is_stale(&self, instance: InstanceId) -> bool {
        self.inspect()
            .artifacts
            .get(&instance)
            .map(|artifact| artifact.stale)
            .unwrap_or(false)
    }
}

impl ExecutionBackend for RefDevice {
    fn load(
        &self,
        instance: InstanceId,
        _stream: StreamId,
        memory: &LoadedMemory,
    ) -> RuntimeResult<()> {
        let mut state = self.selected()?;
        if let Some(message) = state.fail_next_load.take() {
            return Err(RuntimeError::device(message));
        }
        if !state.artifacts.contains_key(&instance) {
            return Err(RuntimeError::execution(format!("{instance} was never compiled")));
        }
        if !state.loaded.insert(instance) {
            return Err(RuntimeError::execution(format!("{instance} is already loaded")));
        }
        state.calls.push(RefCall::Load {
            instance,
            regions: memory.regions.clone(),
        });
        Ok(())
    }

    fn execute(
        &self,
        instance: InstanceId,
        stream: StreamId,
        inputs: &[Tensor],
        outputs: &mut Vec<Tensor>,
    ) -> RuntimeResult<()> {
        let kernel = {
            let mut state = self.selected()?;
            if !state.loaded.contains(&instance) {
                return Err(RuntimeError::execution(format!("{instance} is not loaded")));
            }
            if inputs.iter().any(Tensor::is_host) {
                return Err(RuntimeError::parameter(
                    "kernel inputs must be device resident",
                ));
            }
            let subgraph = state
                .artifacts
                .get(&instance)
                .map(|artifact| artifact.subgraph.clone())
                .ok_or_else(|| RuntimeError::execution(format!("{instance} has no artifact")))?;
            let kernel = state
                .graphs
                .get(&subgraph)
                .map(|graph| Arc::clone(&graph.kernel))
                .ok_or_else(|| RuntimeError::execution(format!("unknown subgraph '{subgraph}'")))?;
            state.calls.push(RefCall::Execute { instance, stream });
            kernel
        };

        let results = kernel(inputs).map_err(|err| RuntimeError::execution(format!("{err:#}")))?;
        if outputs.is_empty() {
            outputs.extend(results.iter().map(|t| t.with_placement(Placement::Device)));
            return Ok(());
        }
        if outputs.len() != results.len() {
            return Err(RuntimeError::parameter(format!(
                "caller supplied {} output buffers for {} results",
                outputs.len(),
                results.len()
            )));
        }
        for (slot, result) in outputs.iter_mut().zip(results) {
            if slot.spec != result.spec {
                return Err(RuntimeError::parameter(format!(
                    "output buffer {:?} does not match result {:?}",
                    slot.spec, result.spec
                )));
            }
            *slot = result.with_placement(slot.placement);
        }
        Ok(())
    }

    fn unload(&self, instance: InstanceId) -> RuntimeResult<()> {
        let mut state = self.selected()?;
        if !state.loaded.remove(&instance) {
            return Err(RuntimeError::execution(format!("{instance} is not loaded")));
        }
        state.calls.push(RefCall::Unload { instance });
        Ok(())
    }
}
