//! Partition pipeline executor.
//!
//! A user graph is split into an ordered sequence of partitions. An invocation
//! enters at the partition chosen by [`Partitioner::first`], and each partition's
//! outputs become the next partition's inputs through two swapped buffers until
//! the partitioner reports no successor.

use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use tracing::{debug, info, warn};

use crate::admission::AdmissionController;
use crate::allocator::{MallocRequest, ReleaseHandle};
use crate::cache::{CacheEntry, EntryId, EntryState, LoadRequest, PartitionKey};
use crate::context::RuntimeContext;
use crate::device::{DeviceRuntime, ExternalAllocator};
use crate::profiling;
use crate::spec::{
    lock_named, CompileOptions, GraphId, InstanceId, LoadOptions, MemoryKind, PartitionId,
    Placement, RuntimeError, RuntimeResult, SessionId, ShapeSignature, StreamId, Subgraph, Tensor,
};

/// Attempts to dispatch an instance that another caller keeps evicting.
const MAX_ADMISSION_ATTEMPTS: usize = 3;

/// Chooses the entry partition and each successor. Decisions may depend on data.
pub trait Partitioner: Send + Sync {
    fn first(&self, inputs: &[Tensor]) -> RuntimeResult<PartitionId>;

    /// `outputs` are host-resident views of `current`'s outputs.
    fn next(&self, current: PartitionId, outputs: &[Tensor])
        -> RuntimeResult<Option<PartitionId>>;
}

/// Walks partitions in index order starting from the first one.
#[derive(Debug, Clone, Copy)]
pub struct SequentialPartitioner {
    count: usize,
}

impl SequentialPartitioner {
    pub fn new(count: usize) -> Self {
        Self { count }
    }
}

impl Partitioner for SequentialPartitioner {
    fn first(&self, _inputs: &[Tensor]) -> RuntimeResult<PartitionId> {
        Ok(PartitionId(0))
    }

    fn next(
        &self,
        current: PartitionId,
        _outputs: &[Tensor],
    ) -> RuntimeResult<Option<PartitionId>> {
        let next = current.0 + 1;
        Ok((next < self.count).then_some(PartitionId(next)))
    }
}

pub type Callback = Box<dyn FnOnce(RuntimeResult<()>, Vec<Tensor>) + Send>;

/// One caller request.
pub struct Invocation {
    pub inputs: Vec<Tensor>,
    pub stream: Option<StreamId>,
    pub load_options: Option<LoadOptions>,
    pub session: SessionId,
    pub output_placement: Placement,
    /// Pre-supplied buffers for the final partition's outputs.
    pub outputs: Option<Vec<Tensor>>,
    pub callback: Option<Callback>,
}

impl Invocation {
    pub fn new(session: SessionId, inputs: Vec<Tensor>) -> Self {
        Self {
            inputs,
            stream: None,
            load_options: None,
            session,
            output_placement: Placement::Host,
            outputs: None,
            callback: None,
        }
    }

    pub fn with_stream(mut self, stream: StreamId) -> Self {
        self.stream = Some(stream);
        self
    }

    pub fn with_load_options(mut self, options: LoadOptions) -> Self {
        self.load_options = Some(options);
        self
    }

    pub fn with_output_placement(mut self, placement: Placement) -> Self {
        self.output_placement = placement;
        self
    }

    pub fn with_outputs(mut self, outputs: Vec<Tensor>) -> Self {
        self.outputs = Some(outputs);
        self
    }

    pub fn with_callback(
        mut self,
        callback: impl FnOnce(RuntimeResult<()>, Vec<Tensor>) + Send + 'static,
    ) -> Self {
        self.callback = Some(Box::new(callback));
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BuildStatus {
    Complete,
    /// The entry partition is compiled but later partitions are only known once
    /// it runs; they are compiled on demand by `execute`.
    NotFullyBuilt,
}

#[derive(Default)]
struct BoundaryNode {
    scratch: Option<ReleaseHandle>,
    /// Partitions that consumed this partition's outputs.
    superseded_by: BTreeSet<usize>,
}

/// Runtime-owned boundary scratch, one node per partition, with the
/// producer-to-consumer edges observed while executing.
struct BoundaryArena {
    nodes: Vec<BoundaryNode>,
}

impl BoundaryArena {
    fn new(partitions: usize) -> Self {
        Self {
            nodes: (0..partitions).map(|_| BoundaryNode::default()).collect(),
        }
    }

    fn has_scratch(&self, partition: PartitionId) -> bool {
        self.nodes[partition.0].scratch.is_some()
    }

    fn set_scratch(&mut self, partition: PartitionId, handle: ReleaseHandle) {
        self.nodes[partition.0].scratch = Some(handle);
    }

    fn take_scratch(&mut self, partition: PartitionId) -> Option<ReleaseHandle> {
        self.nodes[partition.0].scratch.take()
    }

    fn link(&mut self, producer: PartitionId, consumer: PartitionId) {
        if producer != consumer {
            self.nodes[producer.0].superseded_by.insert(consumer.0);
        }
    }

    /// Consumers before producers; ties and cycles fall back to descending index.
    fn teardown_order(&self) -> Vec<PartitionId> {
        let count = self.nodes.len();
        let mut released = vec![false; count];
        let mut order = Vec::with_capacity(count);
        while order.len() < count {
            let ready = (0..count).rev().find(|&p| {
                !released[p]
                    && self.nodes[p]
                        .superseded_by
                        .iter()
                        .all(|&consumer| released[consumer])
            });
            let Some(next) = ready.or_else(|| (0..count).rev().find(|&p| !released[p])) else {
                break;
            };
            released[next] = true;
            order.push(PartitionId(next));
        }
        order
    }
}

/// Device copies made for one call; released when the call ends on any path.
struct DeviceCopies<'a> {
    device: &'a dyn DeviceRuntime,
    stream: StreamId,
    staged: Vec<Tensor>,
}

impl<'a> DeviceCopies<'a> {
    fn new(device: &'a dyn DeviceRuntime, stream: StreamId) -> Self {
        Self {
            device,
            stream,
            staged: Vec::new(),
        }
    }

    fn stage(&mut self, tensor: &Tensor) -> RuntimeResult<Tensor> {
        let copy = self.device.copy_to_device(tensor, self.stream)?;
        self.staged.push(copy.clone());
        Ok(copy)
    }

    fn stage_all(&mut self, tensors: Vec<Tensor>) -> RuntimeResult<Vec<Tensor>> {
        tensors
            .into_iter()
            .map(|tensor| {
                if tensor.is_host() {
                    self.stage(&tensor)
                } else {
                    Ok(tensor)
                }
            })
            .collect()
    }
}

impl Drop for DeviceCopies<'_> {
    fn drop(&mut self) {
        for tensor in self.staged.drain(..) {
            if let Err(err) = self.device.release_tensor(&tensor) {
                warn!(%err, "failed to release device input copy");
            }
        }
    }
}

/// Instances marked running for one call; cleared when the call ends.
struct RunningSet<'a> {
    admission: &'a AdmissionController,
    instances: Vec<InstanceId>,
}

impl<'a> RunningSet<'a> {
    fn new(admission: &'a AdmissionController) -> Self {
        Self {
            admission,
            instances: Vec::new(),
        }
    }

    fn begin(&mut self, instance: InstanceId) -> RuntimeResult<bool> {
        if self.instances.contains(&instance) {
            return Ok(self.admission.is_loaded(instance));
        }
        let started = self.admission.try_begin_run(instance)?;
        if started {
            self.instances.push(instance);
        }
        Ok(started)
    }
}

impl Drop for RunningSet<'_> {
    fn drop(&mut self) {
        for instance in self.instances.drain(..) {
            let _ = self.admission.set_running(instance, false);
        }
    }
}

#[derive(Debug, Clone)]
struct FastPathRecord {
    partition: PartitionId,
    signature: ShapeSignature,
    instance: InstanceId,
}

pub struct Pipeline {
    ctx: Arc<RuntimeContext>,
    graph: GraphId,
    partitions: Vec<Subgraph>,
    partitioner: Arc<dyn Partitioner>,
    compile_options: CompileOptions,
    default_stream: StreamId,
    boundaries: Mutex<BoundaryArena>,
    fast_path: Mutex<HashMap<SessionId, FastPathRecord>>,
    registered_streams: Mutex<Vec<StreamId>>,
    finalized: AtomicBool,
}

impl Pipeline {
    pub fn new(
        ctx: Arc<RuntimeContext>,
        partitions: Vec<Subgraph>,
        partitioner: Arc<dyn Partitioner>,
    ) -> RuntimeResult<Self> {
        if partitions.is_empty() {
            return Err(RuntimeError::parameter(
                "a pipeline needs at least one partition",
            ));
        }
        ctx.ensure_device()?;
        let default_stream = ctx.device().create_stream()?;
        let graph = ctx.next_graph_id();
        debug!(graph = graph.0, partitions = partitions.len(), "pipeline created");
        Ok(Self {
            boundaries: Mutex::new(BoundaryArena::new(partitions.len())),
            ctx,
            graph,
            partitions,
            partitioner,
            compile_options: CompileOptions::default(),
            default_stream,
            fast_path: Mutex::new(HashMap::new()),
            registered_streams: Mutex::new(Vec::new()),
            finalized: AtomicBool::new(false),
        })
    }

    /// Pipeline whose partitions always run in index order.
    pub fn sequential(ctx: Arc<RuntimeContext>, partitions: Vec<Subgraph>) -> RuntimeResult<Self> {
        let partitioner = Arc::new(SequentialPartitioner::new(partitions.len()));
        Self::new(ctx, partitions, partitioner)
    }

    pub fn with_compile_options(mut self, options: CompileOptions) -> Self {
        self.compile_options = options;
        self
    }

    pub fn graph_id(&self) -> GraphId {
        self.graph
    }

    pub fn partition_count(&self) -> usize {
        self.partitions.len()
    }

    pub fn default_stream(&self) -> StreamId {
        self.default_stream
    }

    pub fn is_last(&self, partition: PartitionId) -> bool {
        partition.0 + 1 == self.partitions.len()
    }

    pub fn cache_entry(
        &self,
        partition: PartitionId,
        signature: &ShapeSignature,
    ) -> RuntimeResult<Option<CacheEntry>> {
        match self.ctx.cache().lookup(self.key(partition), signature)? {
            Some(id) => Ok(Some(self.ctx.cache().entry(id)?)),
            None => Ok(None),
        }
    }

    /// Registers a caller allocator for `stream`; `finalize` unregisters it.
    pub fn register_allocator(
        &self,
        stream: StreamId,
        allocator: Arc<dyn ExternalAllocator>,
    ) -> RuntimeResult<()> {
        self.ctx.selector().register_allocator(stream, allocator)?;
        lock_named(&self.registered_streams, "registered stream list")?.push(stream);
        Ok(())
    }

    /// Compiles the entry partition chosen for `inputs`.
    ///
    /// Later partitions only see their input shapes while executing, so the
    /// graph counts as fully built once every other partition has some
    /// compiled variant from earlier calls.
    pub fn compile(&self, inputs: &[Tensor], session: SessionId) -> RuntimeResult<BuildStatus> {
        self.ensure_live()?;
        let partition = self.partitioner.first(inputs)?;
        let subgraph = self.resolve(partition)?;
        let cache = self.ctx.cache();
        let entry = cache.entry_for(self.key(partition), &ShapeSignature::of(inputs))?;
        cache.compile(entry, subgraph, &self.compile_options, session)?;
        if self.is_last(partition) {
            return Ok(BuildStatus::Complete);
        }
        for other in (0..self.partitions.len()).map(PartitionId) {
            if other != partition && !cache.has_compiled(self.key(other))? {
                return Ok(BuildStatus::NotFullyBuilt);
            }
        }
        Ok(BuildStatus::Complete)
    }

    /// Loads the already compiled entry partition for the invocation's session.
    pub fn load(&self, invocation: &Invocation) -> RuntimeResult<InstanceId> {
        self.ensure_live()?;
        self.ctx.ensure_device()?;
        let partition = self.partitioner.first(&invocation.inputs)?;
        let subgraph = self.resolve(partition)?;
        let signature = ShapeSignature::of(&invocation.inputs);
        let cache = self.ctx.cache();
        let entry = self.compiled_entry(partition, &signature)?;
        let default_options = LoadOptions::default();
        let instance = cache.compile_and_load(LoadRequest {
            entry,
            subgraph,
            compile_options: &self.compile_options,
            stream: invocation.stream.unwrap_or(self.default_stream),
            load_options: invocation.load_options.as_ref().unwrap_or(&default_options),
            session: invocation.session,
        })?;
        if self.is_last(partition) {
            self.remember_fast_path(invocation.session, partition, signature, instance)?;
        }
        Ok(instance)
    }

    /// Runs the invocation and reports through its callback. Failures reach the
    /// callback with an empty output list and are also returned.
    pub fn execute(&self, mut invocation: Invocation) -> RuntimeResult<()> {
        let Some(callback) = invocation.callback.take() else {
            return Err(RuntimeError::parameter(
                "execute requires a completion callback",
            ));
        };
        match self.execute_direct(invocation) {
            Ok(outputs) => {
                callback(Ok(()), outputs);
                Ok(())
            }
            Err(err) => {
                callback(Err(err.clone()), Vec::new());
                Err(err)
            }
        }
    }

    /// Runs the invocation and returns the final outputs.
    pub fn execute_direct(&self, invocation: Invocation) -> RuntimeResult<Vec<Tensor>> {
        self.ensure_live()?;
        self.ctx.ensure_device()?;
        let Invocation {
            inputs,
            stream,
            load_options,
            session,
            output_placement,
            outputs: mut supplied,
            ..
        } = invocation;
        let stream = stream.unwrap_or(self.default_stream);
        let load_options = load_options.unwrap_or_default();
        let device = self.ctx.device().as_ref();
        let backend = self.ctx.backend();
        let mut copies = DeviceCopies::new(device, stream);
        let mut running = RunningSet::new(self.ctx.admission());

        let entry_partition = self.partitioner.first(&inputs)?;
        self.resolve(entry_partition)?;
        let entry_signature = ShapeSignature::of(&inputs);

        if self.is_last(entry_partition) {
            if let Some(instance) =
                self.fast_path_instance(entry_partition, session, &entry_signature, &mut running)?
            {
                self.ctx.profiler().cache_event(profiling::FAST_PATH);
                let inputs = copies.stage_all(inputs)?;
                let mut outputs = supplied.take().unwrap_or_default();
                backend.execute(instance, stream, &inputs, &mut outputs)?;
                device.synchronize(stream)?;
                drop(running);
                return self.finish_outputs(outputs, output_placement, stream);
            }
        }

        let mut buffers: [Vec<Tensor>; 2] = [copies.stage_all(inputs)?, Vec::new()];
        let mut input_slot = 0;
        let mut current = entry_partition;
        let mut last_instance = None;
        loop {
            let subgraph = self.resolve(current)?;
            let last = self.is_last(current);
            let output_slot = 1 - input_slot;
            buffers[output_slot] = match (last, supplied.take()) {
                (true, Some(outputs)) => outputs,
                (_, pending) => {
                    supplied = pending;
                    Vec::with_capacity(subgraph.output_count)
                }
            };

            let signature = ShapeSignature::of(&buffers[input_slot]);
            let entry = self.ctx.cache().entry_for(self.key(current), &signature)?;
            let instance = self.acquire_instance(
                &mut running,
                LoadRequest {
                    entry,
                    subgraph,
                    compile_options: &self.compile_options,
                    stream,
                    load_options: &load_options,
                    session,
                },
            )?;
            last_instance = Some((signature, instance));

            if !last && !self.ctx.selector().has_allocator(stream)? {
                self.ensure_boundary_scratch(current, entry, session, stream)?;
            }

            let (step_inputs, step_outputs) = split_buffers(&mut buffers, input_slot);
            backend.execute(instance, stream, step_inputs, step_outputs)?;
            if step_outputs.len() != subgraph.output_count {
                return Err(RuntimeError::execution(format!(
                    "partition '{}' produced {} outputs, expected {}",
                    subgraph.name,
                    step_outputs.len(),
                    subgraph.output_count
                )));
            }
            if last {
                break;
            }

            let view = self.host_view(step_outputs, stream)?;
            let Some(next) = self.partitioner.next(current, &view)? else {
                break;
            };
            self.resolve(next)?;
            lock_named(&self.boundaries, "boundary arena")?.link(current, next);
            for tensor in buffers[output_slot].iter_mut() {
                if tensor.is_host() {
                    *tensor = copies.stage(tensor)?;
                }
            }
            input_slot = output_slot;
            current = next;
        }

        device.synchronize(stream)?;
        drop(running);

        if current == entry_partition && self.is_last(current) {
            if let Some((signature, instance)) = last_instance {
                self.remember_fast_path(session, current, signature, instance)?;
            }
        }

        let outputs = std::mem::take(&mut buffers[1 - input_slot]);
        self.finish_outputs(outputs, output_placement, stream)
    }

    /// True if the compiler wants any instance of this graph rebuilt.
    pub fn is_user_graph_stale(&self) -> RuntimeResult<bool> {
        let compiler = self.ctx.compiler();
        Ok(self
            .ctx
            .cache()
            .instances_of_graph(self.graph)?
            .into_iter()
            .any(|instance| compiler.is_stale(instance)))
    }

    /// Unloads every partition, later partitions first, then drops the graph's
    /// cache entries and allocator registrations. Idempotent.
    pub fn finalize(&self) -> RuntimeResult<()> {
        if self.finalized.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.ctx.ensure_device()?;
        let order = lock_named(&self.boundaries, "boundary arena")?.teardown_order();
        for partition in order {
            for instance in self.ctx.cache().instances_of(self.key(partition))? {
                self.ctx.admission().unload(instance)?;
            }
            let scratch = lock_named(&self.boundaries, "boundary arena")?.take_scratch(partition);
            if let Some(handle) = scratch {
                self.ctx.selector().release(handle)?;
            }
        }
        let removed = self.ctx.cache().remove_graph(self.graph)?;
        let streams: Vec<StreamId> =
            lock_named(&self.registered_streams, "registered stream list")?
                .drain(..)
                .collect();
        for stream in streams {
            self.ctx.selector().unregister_allocator(stream)?;
        }
        lock_named(&self.fast_path, "fast path table")?.clear();
        self.ctx.device().destroy_stream(self.default_stream)?;
        info!(graph = self.graph.0, entries = removed, "pipeline finalized");
        Ok(())
    }

    fn key(&self, partition: PartitionId) -> PartitionKey {
        PartitionKey {
            graph: self.graph,
            partition,
        }
    }

    fn ensure_live(&self) -> RuntimeResult<()> {
        if self.finalized.load(Ordering::SeqCst) {
            return Err(RuntimeError::parameter(format!(
                "graph {} has been finalized",
                self.graph.0
            )));
        }
        Ok(())
    }

    fn resolve(&self, partition: PartitionId) -> RuntimeResult<&Subgraph> {
        self.partitions.get(partition.0).ok_or_else(|| {
            RuntimeError::parameter(format!(
                "partition {} out of range for a graph with {} partitions",
                partition.0,
                self.partitions.len()
            ))
        })
    }

    fn compiled_entry(
        &self,
        partition: PartitionId,
        signature: &ShapeSignature,
    ) -> RuntimeResult<EntryId> {
        let cache = self.ctx.cache();
        let not_compiled = || {
            RuntimeError::parameter(format!(
                "partition {} has not been compiled for {signature}",
                partition.0
            ))
        };
        let entry = cache
            .lookup(self.key(partition), signature)?
            .ok_or_else(not_compiled)?;
        if cache.entry(entry)?.state() == EntryState::Uncompiled {
            return Err(not_compiled());
        }
        Ok(entry)
    }

    /// Cached instance for a single-partition call, marked running. Never takes
    /// the cache lock; a stale answer only costs a regular admission.
    fn fast_path_instance(
        &self,
        partition: PartitionId,
        session: SessionId,
        signature: &ShapeSignature,
        running: &mut RunningSet<'_>,
    ) -> RuntimeResult<Option<InstanceId>> {
        let record = lock_named(&self.fast_path, "fast path table")?
            .get(&session)
            .cloned();
        let Some(record) = record else {
            return Ok(None);
        };
        if record.partition != partition || &record.signature != signature {
            return Ok(None);
        }
        if running.begin(record.instance)? {
            Ok(Some(record.instance))
        } else {
            Ok(None)
        }
    }

    fn remember_fast_path(
        &self,
        session: SessionId,
        partition: PartitionId,
        signature: ShapeSignature,
        instance: InstanceId,
    ) -> RuntimeResult<()> {
        lock_named(&self.fast_path, "fast path table")?.insert(
            session,
            FastPathRecord {
                partition,
                signature,
                instance,
            },
        );
        Ok(())
    }

    fn acquire_instance(
        &self,
        running: &mut RunningSet<'_>,
        request: LoadRequest<'_>,
    ) -> RuntimeResult<InstanceId> {
        for _ in 0..MAX_ADMISSION_ATTEMPTS {
            let instance = self.ctx.cache().compile_and_load(request)?;
            if running.begin(instance)? {
                return Ok(instance);
            }
            debug!(%instance, "instance evicted before dispatch; readmitting");
        }
        Err(RuntimeError::execution(format!(
            "instance for session {} was evicted {MAX_ADMISSION_ATTEMPTS} times before dispatch",
            request.session.0
        )))
    }

    fn ensure_boundary_scratch(
        &self,
        partition: PartitionId,
        entry: EntryId,
        session: SessionId,
        stream: StreamId,
    ) -> RuntimeResult<()> {
        if lock_named(&self.boundaries, "boundary arena")?.has_scratch(partition) {
            return Ok(());
        }
        let bytes = self
            .ctx
            .cache()
            .entry(entry)?
            .profile()
            .map(|profile| profile.boundary_bytes)
            .unwrap_or(0);
        if bytes == 0 {
            return Ok(());
        }
        let (addr, handle) = self.ctx.selector().select_and_malloc(&MallocRequest {
            kind: MemoryKind::Feature,
            size: bytes,
            session,
            stream,
            pinned_base: None,
            refreshable: false,
            hint_addr: None,
        })?;
        debug!(partition = partition.0, addr, bytes, "allocated boundary scratch");
        if let Some(handle) = handle {
            let mut arena = lock_named(&self.boundaries, "boundary arena")?;
            if arena.has_scratch(partition) {
                // Another caller won the race.
                drop(arena);
                self.ctx.selector().release(handle)?;
            } else {
                arena.set_scratch(partition, handle);
            }
        }
        Ok(())
    }

    fn host_view(&self, outputs: &[Tensor], stream: StreamId) -> RuntimeResult<Vec<Tensor>> {
        let device = self.ctx.device();
        outputs
            .iter()
            .map(|tensor| {
                if tensor.is_host() {
                    Ok(tensor.clone())
                } else {
                    device.copy_to_host(tensor, stream)
                }
            })
            .collect()
    }

    fn finish_outputs(
        &self,
        outputs: Vec<Tensor>,
        placement: Placement,
        stream: StreamId,
    ) -> RuntimeResult<Vec<Tensor>> {
        let device = self.ctx.device();
        outputs
            .into_iter()
            .map(|tensor| match (placement, tensor.placement) {
                (Placement::Host, Placement::Device) => device.copy_to_host(&tensor, stream),
                (Placement::Device, Placement::Host) => device.copy_to_device(&tensor, stream),
                _ => Ok(tensor),
            })
            .collect()
    }
}

impl Drop for Pipeline {
    fn drop(&mut self) {
        if let Err(err) = self.finalize() {
            warn!(graph = self.graph.0, %err, "pipeline teardown failed");
        }
    }
}

fn split_buffers(
    buffers: &mut [Vec<Tensor>; 2],
    input_slot: usize,
) -> (&Vec<Tensor>, &mut Vec<Tensor>) {
    let (head, tail) = buffers.split_at_mut(1);
    if input_slot == 0 {
        (&head[0], &mut tail[0])
    } else {
        (&tail[0], &mut head[0])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sequential_partitioner_stops_after_last() {
        let partitioner = SequentialPartitioner::new(3);
        assert_eq!(partitioner.first(&[]).unwrap(), PartitionId(0));
        assert_eq!(
            partitioner.next(PartitionId(1), &[]).unwrap(),
            Some(PartitionId(2))
        );
        assert_eq!(partitioner.next(PartitionId(2), &[]).unwrap(), None);
    }

    #[test]
    fn teardown_releases_consumers_before_producers() {
        let mut arena = BoundaryArena::new(4);
        arena.link(PartitionId(0), PartitionId(1));
        arena.link(PartitionId(1), PartitionId(2));
        arena.link(PartitionId(2), PartitionId(3));
        let order: Vec<usize> = arena.teardown_order().into_iter().map(|p| p.0).collect();
        assert_eq!(order, vec![3, 2, 1, 0]);
    }

    #[test]
    fn teardown_follows_edges_over_index() {
        // 0 feeds 2 directly and 2 feeds 1: 1 must go before 2, 2 before 0.
        let mut arena = BoundaryArena::new(3);
        arena.link(PartitionId(0), PartitionId(2));
        arena.link(PartitionId(2), PartitionId(1));
        let order: Vec<usize> = arena.teardown_order().into_iter().map(|p| p.0).collect();
        assert_eq!(order, vec![1, 2, 0]);
    }

    #[test]
    fn teardown_breaks_cycles_by_descending_index() {
        let mut arena = BoundaryArena::new(2);
        arena.link(PartitionId(0), PartitionId(1));
        arena.link(PartitionId(1), PartitionId(0));
        let order: Vec<usize> = arena.teardown_order().into_iter().map(|p| p.0).collect();
        assert_eq!(order, vec![1, 0]);
    }
}
