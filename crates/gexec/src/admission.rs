//! Load admission: budget checks against the device and eviction of other
//! resident graphs when a new load would not fit.
//!
//! Eviction walks the loaded-graph table in registration order. There is no
//! recency or cost ranking.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};

use serde::Serialize;
use tracing::{debug, info, warn};

use crate::allocator::{AllocationPath, AllocatorSelector, MallocRequest, PoolKey, ReleaseHandle};
use crate::config::RuntimeOptions;
use crate::device::{DeviceRuntime, ExecutionBackend, LoadedMemory};
use crate::profiling::{self, Profiler};
use crate::spec::{
    lock_named, EventId, GraphProfile, InstanceId, LoadOptions, MemoryKind, ResourceKind,
    RuntimeError, RuntimeResult, SessionId, StreamId,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct ResourceRequirements {
    pub memory: u64,
    pub streams: usize,
    pub events: usize,
}

impl ResourceRequirements {
    /// Memory, stream and event needs of one load.
    ///
    /// Memory is zero when the caller supplies the feature region itself
    /// (pinned base or app-refreshable region).
    pub fn for_load(profile: &GraphProfile, options: &LoadOptions, zero_copy_reuse: bool) -> Self {
        let externally_supplied = options.pinned_base(MemoryKind::Feature).is_some()
            || options.refreshable_feature;
        let memory = if externally_supplied {
            0
        } else {
            let zero_copy = if zero_copy_reuse {
                profile.zero_copy_bytes.min(profile.feature_bytes)
            } else {
                0
            };
            profile.feature_bytes - zero_copy + profile.fixed_priority_bytes + profile.weight_bytes
        };
        Self {
            memory,
            streams: profile.stream_count + profile.follow_stream_count + 1,
            events: profile.event_count
                + profile.blocking_op_event_count
                + profile.collective_event_count,
        }
    }

    fn add(&mut self, other: &ResourceRequirements) {
        self.memory += other.memory;
        self.streams += other.streams;
        self.events += other.events;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResidentState {
    Unloaded,
    Loaded,
}

/// A graph instance known to the admission controller.
///
/// Records stay in the table after eviction so a reload keeps its load count
/// and table position; only an explicit unload removes them.
#[derive(Debug)]
pub struct ResidentGraph {
    instance: InstanceId,
    session: SessionId,
    profile: GraphProfile,
    state: ResidentState,
    /// Calls currently dispatching on this instance.
    running: usize,
    load_count: u32,
    launch_stream: StreamId,
    committed: ResourceRequirements,
    memory: Vec<ReleaseHandle>,
    streams: Vec<StreamId>,
    events: Vec<EventId>,
    last_regions: BTreeMap<MemoryKind, u64>,
}

impl ResidentGraph {
    fn evictable(&self) -> bool {
        self.state == ResidentState::Loaded
            && !self.profile.has_collective_task
            && self.running == 0
    }

    /// Whether evicting this graph gives back any of `resource`. Pooled blocks
    /// only reach the device through a trim.
    fn relieves(&self, resource: ResourceKind, trim: bool) -> bool {
        match resource {
            ResourceKind::Memory => self.memory.iter().any(|handle| match handle.path() {
                AllocationPath::Device => true,
                AllocationPath::SessionPool => trim,
                AllocationPath::External | AllocationPath::PinnedBase => false,
            }),
            ResourceKind::Streams => !self.streams.is_empty(),
            ResourceKind::Events => !self.events.is_empty(),
        }
    }
}

/// Snapshot of one resident graph for callers and tests.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResidentInfo {
    pub instance: InstanceId,
    pub session: SessionId,
    pub state: ResidentState,
    pub load_count: u32,
    pub committed: ResourceRequirements,
}

#[derive(Debug, Clone, Copy)]
pub struct LoadCandidate<'a> {
    pub instance: InstanceId,
    pub session: SessionId,
    pub profile: &'a GraphProfile,
    pub stream: StreamId,
    pub options: &'a LoadOptions,
}

#[derive(Debug, Clone, Copy)]
struct Shortfall {
    resource: ResourceKind,
    required: u64,
    available: u64,
}

impl Shortfall {
    fn hopeless(&self, reclaimable: &ResourceRequirements) -> bool {
        let potential = match self.resource {
            ResourceKind::Memory => self.available + reclaimable.memory,
            ResourceKind::Streams => self.available + reclaimable.streams as u64,
            ResourceKind::Events => self.available + reclaimable.events as u64,
        };
        potential < self.required
    }
}

pub struct AdmissionController {
    device: Arc<dyn DeviceRuntime>,
    backend: Arc<dyn ExecutionBackend>,
    selector: Arc<AllocatorSelector>,
    profiler: Arc<Profiler>,
    device_id: u32,
    zero_copy_reuse: bool,
    trim_on_exhaustion: bool,
    table: Mutex<Vec<ResidentGraph>>,
}

impl AdmissionController {
    pub fn new(
        device: Arc<dyn DeviceRuntime>,
        backend: Arc<dyn ExecutionBackend>,
        selector: Arc<AllocatorSelector>,
        profiler: Arc<Profiler>,
        options: &RuntimeOptions,
    ) -> Self {
        Self {
            device,
            backend,
            selector,
            profiler,
            device_id: options.device_id,
            zero_copy_reuse: options.zero_copy_reuse,
            trim_on_exhaustion: options.trim_on_exhaustion,
            table: Mutex::new(Vec::new()),
        }
    }

    pub fn requirements(&self, candidate: &LoadCandidate<'_>) -> ResourceRequirements {
        ResourceRequirements::for_load(candidate.profile, candidate.options, self.zero_copy_reuse)
    }

    /// Loads `candidate` onto the device, evicting other resident graphs if the
    /// device budget is short. Loading an already loaded instance is a no-op.
    pub fn admit_and_load(&self, candidate: LoadCandidate<'_>) -> RuntimeResult<()> {
        self.device.set_device(self.device_id)?;
        let mut table = lock_named(&self.table, "loaded-graph table")?;
        if table
            .iter()
            .any(|g| g.instance == candidate.instance && g.state == ResidentState::Loaded)
        {
            return Ok(());
        }

        let required = self.requirements(&candidate);
        let mut trimmed = false;

        // Refuse up front when even evicting every eligible graph cannot cover
        // some resource, so a hopeless load leaves the device untouched.
        let shortfalls = self.shortfalls(&required, &candidate)?;
        let reclaimable = self.reclaimable(&table, candidate.instance)?;
        if let Some(short) = shortfalls
            .iter()
            .find(|short| short.resource != ResourceKind::Memory && short.hopeless(&reclaimable))
        {
            return Err(self.exhausted(candidate.instance, *short));
        }
        let memory_hopeless = shortfalls
            .iter()
            .any(|short| short.resource == ResourceKind::Memory && short.hopeless(&reclaimable));
        if memory_hopeless {
            if self.trim_on_exhaustion {
                trimmed = true;
                self.trim()?;
            }
            let reclaimable = self.reclaimable(&table, candidate.instance)?;
            if let Some(short) = self
                .shortfalls(&required, &candidate)?
                .into_iter()
                .find(|short| short.hopeless(&reclaimable))
            {
                return Err(self.exhausted(candidate.instance, short));
            }
        }

        let mut evicted_since_trim = false;
        loop {
            let shortfalls = self.shortfalls(&required, &candidate)?;
            let Some(first) = shortfalls.first().copied() else {
                break;
            };
            let victim = table.iter().position(|g| {
                g.instance != candidate.instance
                    && g.evictable()
                    && shortfalls
                        .iter()
                        .any(|short| g.relieves(short.resource, self.trim_on_exhaustion))
            });
            if let Some(idx) = victim {
                self.evict(&mut table[idx])?;
                evicted_since_trim = true;
                continue;
            }
            // Evicted pooled blocks only turn idle, so trim again after evicting.
            let memory_short = shortfalls
                .iter()
                .find(|short| short.resource == ResourceKind::Memory)
                .copied();
            if let Some(short) = memory_short {
                if self.trim_on_exhaustion && (!trimmed || evicted_since_trim) {
                    trimmed = true;
                    evicted_since_trim = false;
                    self.trim()?;
                    continue;
                }
                return Err(self.exhausted(candidate.instance, short));
            }
            return Err(self.exhausted(candidate.instance, first));
        }

        self.load_resident(&mut table, &candidate, required)
    }

    /// Evicts (if loaded) and forgets `instance`.
    pub fn unload(&self, instance: InstanceId) -> RuntimeResult<bool> {
        self.device.set_device(self.device_id)?;
        let mut table = lock_named(&self.table, "loaded-graph table")?;
        let Some(idx) = table.iter().position(|g| g.instance == instance) else {
            return Ok(false);
        };
        if table[idx].state == ResidentState::Loaded {
            self.release_resident(&mut table[idx])?;
        }
        table.remove(idx);
        Ok(true)
    }

    /// Counts one call starting (`true`) or finishing (`false`) on `instance`.
    /// The graph is evictable only while no call is running on it.
    pub fn set_running(&self, instance: InstanceId, running: bool) -> RuntimeResult<()> {
        let mut table = lock_named(&self.table, "loaded-graph table")?;
        let graph = table
            .iter_mut()
            .find(|g| g.instance == instance)
            .ok_or_else(|| RuntimeError::parameter(format!("{instance} is not resident")))?;
        if running {
            graph.running += 1;
        } else {
            graph.running = graph.running.saturating_sub(1);
        }
        Ok(())
    }

    /// Counts a call running on `instance` if it is still loaded. Returns false
    /// when it was evicted or unloaded in the meantime.
    pub fn try_begin_run(&self, instance: InstanceId) -> RuntimeResult<bool> {
        let mut table = lock_named(&self.table, "loaded-graph table")?;
        match table
            .iter_mut()
            .find(|g| g.instance == instance && g.state == ResidentState::Loaded)
        {
            Some(graph) => {
                graph.running += 1;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    pub fn is_loaded(&self, instance: InstanceId) -> bool {
        self.table
            .lock()
            .map(|table| {
                table
                    .iter()
                    .any(|g| g.instance == instance && g.state == ResidentState::Loaded)
            })
            .unwrap_or(false)
    }

    pub fn info(&self, instance: InstanceId) -> Option<ResidentInfo> {
        let table = self.table.lock().ok()?;
        table
            .iter()
            .find(|g| g.instance == instance)
            .map(|g| ResidentInfo {
                instance: g.instance,
                session: g.session,
                state: g.state,
                load_count: g.load_count,
                committed: g.committed,
            })
    }

    /// Sum of resources held by loaded graphs.
    pub fn committed(&self) -> RuntimeResult<ResourceRequirements> {
        let table = lock_named(&self.table, "loaded-graph table")?;
        let mut total = ResourceRequirements::default();
        for graph in table.iter().filter(|g| g.state == ResidentState::Loaded) {
            total.add(&graph.committed);
        }
        Ok(total)
    }

    pub fn loaded_instances(&self) -> RuntimeResult<Vec<InstanceId>> {
        let table = lock_named(&self.table, "loaded-graph table")?;
        Ok(table
            .iter()
            .filter(|g| g.state == ResidentState::Loaded)
            .map(|g| g.instance)
            .collect())
    }

    /// Every resource the device is short of for this load, memory first.
    fn shortfalls(
        &self,
        required: &ResourceRequirements,
        candidate: &LoadCandidate<'_>,
    ) -> RuntimeResult<Vec<Shortfall>> {
        let mut shortfalls = Vec::new();
        let mut memory = required.memory;
        // A pooled block that already fits the feature region needs no new memory.
        let feature = self.feature_bytes(candidate.profile);
        if memory != 0
            && feature != 0
            && self
                .selector
                .can_reuse_pooled(candidate.session, MemoryKind::Feature, feature)?
        {
            memory = memory.saturating_sub(feature);
        }

        let free = self.device.memory_info()?.free;
        if memory > free {
            shortfalls.push(Shortfall {
                resource: ResourceKind::Memory,
                required: memory,
                available: free,
            });
        }
        let streams = self.device.available_streams()?;
        if required.streams > streams {
            shortfalls.push(Shortfall {
                resource: ResourceKind::Streams,
                required: required.streams as u64,
                available: streams as u64,
            });
        }
        let events = self.device.available_events()?;
        if required.events > events {
            shortfalls.push(Shortfall {
                resource: ResourceKind::Events,
                required: required.events as u64,
                available: events as u64,
            });
        }
        Ok(shortfalls)
    }

    /// Feature bytes a load allocates: the region minus what zero-copy reuse covers.
    fn feature_bytes(&self, profile: &GraphProfile) -> u64 {
        let zero_copy = if self.zero_copy_reuse {
            profile.zero_copy_bytes.min(profile.feature_bytes)
        } else {
            0
        };
        profile.feature_bytes - zero_copy
    }

    /// What evicting every eligible graph (and trimming, when allowed) would
    /// give back to the device.
    fn reclaimable(
        &self,
        table: &[ResidentGraph],
        exclude: InstanceId,
    ) -> RuntimeResult<ResourceRequirements> {
        let mut total = ResourceRequirements::default();
        let mut pooled: HashMap<(PoolKey, u64), usize> = HashMap::new();
        for graph in table
            .iter()
            .filter(|g| g.instance != exclude && g.evictable())
        {
            total.streams += graph.streams.len();
            total.events += graph.events.len();
            for handle in &graph.memory {
                match (handle.path(), handle.pool_key()) {
                    (AllocationPath::Device, _) => total.memory += handle.size(),
                    (AllocationPath::SessionPool, Some(key)) => {
                        *pooled.entry((key, handle.addr())).or_default() += 1;
                    }
                    _ => {}
                }
            }
        }
        if self.trim_on_exhaustion {
            total.memory += self.selector.idle_after_release(&pooled)?;
        }
        Ok(total)
    }

    fn exhausted(&self, instance: InstanceId, short: Shortfall) -> RuntimeError {
        warn!(
            %instance,
            resource = %short.resource,
            required = short.required,
            available = short.available,
            "load admission failed"
        );
        RuntimeError::exhausted(short.resource, short.required, short.available)
    }

    fn trim(&self) -> RuntimeResult<()> {
        let pooled = self.selector.trim_idle()?;
        let cached = self.device.trim_caches()?;
        warn!(pooled, cached, "trimmed idle device memory before admission retry");
        self.profiler.cache_event(profiling::TRIM);
        Ok(())
    }

    fn evict(&self, graph: &mut ResidentGraph) -> RuntimeResult<()> {
        info!(
            instance = %graph.instance,
            memory = graph.committed.memory,
            streams = graph.committed.streams,
            events = graph.committed.events,
            "evicting resident graph"
        );
        self.release_resident(graph)?;
        self.profiler.cache_event(profiling::EVICT);
        Ok(())
    }

    fn release_resident(&self, graph: &mut ResidentGraph) -> RuntimeResult<()> {
        if graph.profile.asynchronous {
            self.device.synchronize(graph.launch_stream)?;
        }
        self.backend.unload(graph.instance)?;
        for handle in graph.memory.drain(..) {
            self.selector.release(handle)?;
        }
        for stream in graph.streams.drain(..) {
            self.device.destroy_stream(stream)?;
        }
        for event in graph.events.drain(..) {
            self.device.destroy_event(event)?;
        }
        graph.state = ResidentState::Unloaded;
        graph.running = 0;
        graph.committed = ResourceRequirements::default();
        Ok(())
    }

    fn load_resident(
        &self,
        table: &mut Vec<ResidentGraph>,
        candidate: &LoadCandidate<'_>,
        required: ResourceRequirements,
    ) -> RuntimeResult<()> {
        let idx = match table.iter().position(|g| g.instance == candidate.instance) {
            Some(idx) => idx,
            None => {
                table.push(ResidentGraph {
                    instance: candidate.instance,
                    session: candidate.session,
                    profile: candidate.profile.clone(),
                    state: ResidentState::Unloaded,
                    running: 0,
                    load_count: 0,
                    launch_stream: candidate.stream,
                    committed: ResourceRequirements::default(),
                    memory: Vec::new(),
                    streams: Vec::new(),
                    events: Vec::new(),
                    last_regions: BTreeMap::new(),
                });
                table.len() - 1
            }
        };
        let graph = &mut table[idx];
        graph.launch_stream = candidate.stream;

        let result = self.acquire_and_load(graph, candidate);
        if let Err(err) = result {
            // Give back whatever was acquired before the failing step.
            for handle in graph.memory.drain(..) {
                let (kind, addr) = (handle.kind(), handle.addr());
                if let Err(release_err) = self.selector.release(handle) {
                    warn!(
                        %release_err,
                        %kind,
                        addr,
                        "failed to release memory after a failed load"
                    );
                }
            }
            for stream in graph.streams.drain(..) {
                if let Err(release_err) = self.device.destroy_stream(stream) {
                    warn!(%release_err, %stream, "failed to destroy stream after a failed load");
                }
            }
            for event in graph.events.drain(..) {
                if let Err(release_err) = self.device.destroy_event(event) {
                    warn!(%release_err, ?event, "failed to destroy event after a failed load");
                }
            }
            if graph.load_count == 0 {
                table.remove(idx);
            }
            return Err(err);
        }

        graph.state = ResidentState::Loaded;
        graph.load_count += 1;
        graph.committed = required;
        debug!(
            instance = %candidate.instance,
            load_count = graph.load_count,
            memory = required.memory,
            "graph loaded"
        );
        self.profiler.cache_event(profiling::LOAD);
        Ok(())
    }

    fn acquire_and_load(
        &self,
        graph: &mut ResidentGraph,
        candidate: &LoadCandidate<'_>,
    ) -> RuntimeResult<()> {
        let profile = candidate.profile;
        let mut memory = LoadedMemory::default();
        for (kind, size) in [
            (MemoryKind::Feature, self.feature_bytes(profile)),
            (MemoryKind::Weight, profile.weight_bytes),
            (MemoryKind::FixedPriority, profile.fixed_priority_bytes),
        ] {
            let pinned_base = candidate.options.pinned_base(kind);
            if size == 0 && pinned_base.is_none() {
                continue;
            }
            let request = MallocRequest {
                kind,
                size,
                session: candidate.session,
                stream: candidate.stream,
                pinned_base,
                refreshable: kind == MemoryKind::Feature && candidate.options.refreshable_feature,
                hint_addr: graph.last_regions.get(&kind).copied(),
            };
            let (addr, handle) = self.selector.select_and_malloc(&request)?;
            memory.regions.insert(kind, addr);
            graph.last_regions.insert(kind, addr);
            if let Some(handle) = handle {
                graph.memory.push(handle);
            }
        }

        let required = self.requirements(candidate);
        for _ in 0..required.streams {
            graph.streams.push(self.device.create_stream()?);
        }
        for _ in 0..required.events {
            graph.events.push(self.device.create_event()?);
        }

        self.backend
            .load(candidate.instance, candidate.stream, &memory)
    }
}
