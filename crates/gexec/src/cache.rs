//! Shape-keyed compile/load cache.
//!
//! Each (partition, shape signature) pair owns one [`CacheEntry`] stored in a
//! generation-indexed arena. A single cache mutex serializes every admission
//! decision together with the compile, fork and load calls it triggers, which
//! guarantees at most one compile and one initial load in flight per entry.
//! Kernel execution never happens under this lock.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use tracing::{debug, info};

use crate::admission::{AdmissionController, LoadCandidate};
use crate::device::{CompileRequest, Compiler};
use crate::profiling::{self, Profiler};
use crate::spec::{
    lock_named, CompileOptions, GraphId, GraphProfile, InstanceId, LoadOptions, PartitionId,
    RuntimeError, RuntimeResult, SessionId, ShapeSignature, StreamId, Subgraph,
};

/// Handle into the entry arena. Stale after the owning graph is torn down.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct EntryId {
    index: u32,
    generation: u32,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PartitionKey {
    pub graph: GraphId,
    pub partition: PartitionId,
}

/// Entry states only move forward; teardown is the only way back.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum EntryState {
    Uncompiled,
    Compiled,
    /// Bound to the session that first loaded it; cannot be forked.
    Instantiated,
}

#[derive(Debug, Clone)]
pub struct CacheEntry {
    key: PartitionKey,
    signature: ShapeSignature,
    state: EntryState,
    template: Option<InstanceId>,
    forks: Vec<InstanceId>,
    owners: HashMap<SessionId, InstanceId>,
    profile: Option<GraphProfile>,
}

impl CacheEntry {
    fn new(key: PartitionKey, signature: ShapeSignature) -> Self {
        Self {
            key,
            signature,
            state: EntryState::Uncompiled,
            template: None,
            forks: Vec::new(),
            owners: HashMap::new(),
            profile: None,
        }
    }

    pub fn key(&self) -> PartitionKey {
        self.key
    }

    pub fn signature(&self) -> &ShapeSignature {
        &self.signature
    }

    pub fn state(&self) -> EntryState {
        self.state
    }

    pub fn template(&self) -> Option<InstanceId> {
        self.template
    }

    pub fn forks(&self) -> &[InstanceId] {
        &self.forks
    }

    pub fn profile(&self) -> Option<&GraphProfile> {
        self.profile.as_ref()
    }

    pub fn instance_for(&self, session: SessionId) -> Option<InstanceId> {
        self.owners.get(&session).copied()
    }

    /// Template first, then forks in creation order.
    pub fn instances(&self) -> impl Iterator<Item = InstanceId> + '_ {
        self.template.into_iter().chain(self.forks.iter().copied())
    }

    /// An instance no session owns yet, left behind by a failed load.
    fn unclaimed(&self) -> Option<InstanceId> {
        self.instances()
            .find(|instance| !self.owners.values().any(|owned| owned == instance))
    }
}

struct Slot {
    generation: u32,
    entry: Option<CacheEntry>,
}

#[derive(Default)]
struct CacheInner {
    slots: Vec<Slot>,
    free: Vec<u32>,
    index: HashMap<(PartitionKey, ShapeSignature), EntryId>,
}

impl CacheInner {
    fn get(&self, id: EntryId) -> RuntimeResult<&CacheEntry> {
        self.slots
            .get(id.index as usize)
            .filter(|slot| slot.generation == id.generation)
            .and_then(|slot| slot.entry.as_ref())
            .ok_or_else(|| RuntimeError::parameter(format!("stale cache entry handle {id:?}")))
    }

    fn get_mut(&mut self, id: EntryId) -> RuntimeResult<&mut CacheEntry> {
        self.slots
            .get_mut(id.index as usize)
            .filter(|slot| slot.generation == id.generation)
            .and_then(|slot| slot.entry.as_mut())
            .ok_or_else(|| RuntimeError::parameter(format!("stale cache entry handle {id:?}")))
    }

    fn insert(&mut self, entry: CacheEntry) -> EntryId {
        match self.free.pop() {
            Some(index) => {
                let slot = &mut self.slots[index as usize];
                slot.entry = Some(entry);
                EntryId {
                    index,
                    generation: slot.generation,
                }
            }
            None => {
                self.slots.push(Slot {
                    generation: 0,
                    entry: Some(entry),
                });
                EntryId {
                    index: (self.slots.len() - 1) as u32,
                    generation: 0,
                }
            }
        }
    }

    fn remove(&mut self, id: EntryId) -> Option<CacheEntry> {
        let slot = self.slots.get_mut(id.index as usize)?;
        if slot.generation != id.generation {
            return None;
        }
        let entry = slot.entry.take()?;
        slot.generation = slot.generation.wrapping_add(1);
        self.free.push(id.index);
        Some(entry)
    }
}

/// Arguments of [`CompileCache::compile_and_load`].
#[derive(Debug, Clone, Copy)]
pub struct LoadRequest<'a> {
    pub entry: EntryId,
    pub subgraph: &'a Subgraph,
    pub compile_options: &'a CompileOptions,
    pub stream: StreamId,
    pub load_options: &'a LoadOptions,
    pub session: SessionId,
}

pub struct CompileCache {
    compiler: Arc<dyn Compiler>,
    admission: Arc<AdmissionController>,
    profiler: Arc<Profiler>,
    next_instance: AtomicU64,
    inner: Mutex<CacheInner>,
}

impl CompileCache {
    pub fn new(
        compiler: Arc<dyn Compiler>,
        admission: Arc<AdmissionController>,
        profiler: Arc<Profiler>,
    ) -> Self {
        Self {
            compiler,
            admission,
            profiler,
            next_instance: AtomicU64::new(1),
            inner: Mutex::new(CacheInner::default()),
        }
    }

    /// Finds the entry for `(key, signature)`, creating an uncompiled one on first sight.
    pub fn entry_for(&self, key: PartitionKey, signature: &ShapeSignature) -> RuntimeResult<EntryId> {
        let mut inner = lock_named(&self.inner, "compile cache")?;
        let lookup = (key, signature.clone());
        if let Some(id) = inner.index.get(&lookup) {
            return Ok(*id);
        }
        let id = inner.insert(CacheEntry::new(key, signature.clone()));
        inner.index.insert(lookup, id);
        debug!(partition = key.partition.0, %signature, "new cache entry");
        Ok(id)
    }

    pub fn lookup(
        &self,
        key: PartitionKey,
        signature: &ShapeSignature,
    ) -> RuntimeResult<Option<EntryId>> {
        let inner = lock_named(&self.inner, "compile cache")?;
        Ok(inner.index.get(&(key, signature.clone())).copied())
    }

    /// Snapshot of an entry.
    pub fn entry(&self, id: EntryId) -> RuntimeResult<CacheEntry> {
        let inner = lock_named(&self.inner, "compile cache")?;
        inner.get(id).cloned()
    }

    /// Compiles the entry's template if it has none yet and returns the template id.
    pub fn compile(
        &self,
        id: EntryId,
        subgraph: &Subgraph,
        options: &CompileOptions,
        session: SessionId,
    ) -> RuntimeResult<InstanceId> {
        let mut inner = lock_named(&self.inner, "compile cache")?;
        let entry = inner.get_mut(id)?;
        match entry.template {
            Some(template) => {
                self.profiler.cache_event(profiling::CACHE_HIT);
                Ok(template)
            }
            None => self.compile_locked(entry, subgraph, options, session),
        }
    }

    /// Resolves an instance for `request.session`, compiling, forking and loading as needed.
    ///
    /// | state        | session owns an instance  | session owns none             |
    /// |--------------|---------------------------|-------------------------------|
    /// | Uncompiled   | error                     | compile template, load it     |
    /// | Compiled     | (re)load its instance     | fork template, load the fork  |
    /// | Instantiated | (re)load its instance     | `Unimplemented`               |
    pub fn compile_and_load(&self, request: LoadRequest<'_>) -> RuntimeResult<InstanceId> {
        let mut inner = lock_named(&self.inner, "compile cache")?;
        let entry = inner.get_mut(request.entry)?;
        let owned = entry.instance_for(request.session);

        match (entry.state, owned) {
            (EntryState::Uncompiled, Some(instance)) => Err(RuntimeError::parameter(format!(
                "session {} owns {instance} but the entry is uncompiled",
                request.session.0
            ))),
            (EntryState::Uncompiled, None) => {
                self.profiler.cache_event(profiling::CACHE_MISS);
                let template = self.compile_locked(
                    entry,
                    request.subgraph,
                    request.compile_options,
                    request.session,
                )?;
                self.load_locked(entry, template, &request)
            }
            (EntryState::Compiled | EntryState::Instantiated, Some(instance)) => {
                if self.admission.is_loaded(instance) {
                    self.profiler.cache_event(profiling::CACHE_HIT);
                    return Ok(instance);
                }
                // Evicted since its last use.
                self.load_locked(entry, instance, &request)
            }
            (EntryState::Compiled, None) => {
                self.profiler.cache_event(profiling::CACHE_MISS);
                let instance = match entry.unclaimed() {
                    Some(instance) => instance,
                    None => self.fork_locked(entry)?,
                };
                self.load_locked(entry, instance, &request)
            }
            (EntryState::Instantiated, None) => Err(RuntimeError::unimplemented(
                "compile_and_load",
                "an instantiated entry cannot be re-entered by another session until cache aging exists",
            )),
        }
    }

    /// Clones `template` into `instance` through the compiler.
    pub fn fork(&self, template: InstanceId, instance: InstanceId) -> RuntimeResult<()> {
        self.compiler.fork(template, instance)?;
        self.profiler.cache_event(profiling::FORK);
        debug!(%template, %instance, "forked instance");
        Ok(())
    }

    pub fn instances_of(&self, key: PartitionKey) -> RuntimeResult<Vec<InstanceId>> {
        let inner = lock_named(&self.inner, "compile cache")?;
        let mut instances = Vec::new();
        for id in inner.index.iter().filter(|((k, _), _)| *k == key).map(|(_, id)| *id) {
            instances.extend(inner.get(id)?.instances());
        }
        instances.sort();
        Ok(instances)
    }

    /// True if some shape variant of `key` has been compiled.
    pub fn has_compiled(&self, key: PartitionKey) -> RuntimeResult<bool> {
        let inner = lock_named(&self.inner, "compile cache")?;
        for id in inner.index.iter().filter(|((k, _), _)| *k == key).map(|(_, id)| *id) {
            if inner.get(id)?.state() != EntryState::Uncompiled {
                return Ok(true);
            }
        }
        Ok(false)
    }

    pub fn instances_of_graph(&self, graph: GraphId) -> RuntimeResult<Vec<InstanceId>> {
        let inner = lock_named(&self.inner, "compile cache")?;
        let mut instances = Vec::new();
        for id in inner
            .index
            .iter()
            .filter(|((k, _), _)| k.graph == graph)
            .map(|(_, id)| *id)
        {
            instances.extend(inner.get(id)?.instances());
        }
        instances.sort();
        Ok(instances)
    }

    /// Drops every entry of `graph`. Handles to them become stale.
    pub fn remove_graph(&self, graph: GraphId) -> RuntimeResult<usize> {
        let mut inner = lock_named(&self.inner, "compile cache")?;
        let doomed: Vec<(PartitionKey, ShapeSignature)> = inner
            .index
            .keys()
            .filter(|(k, _)| k.graph == graph)
            .cloned()
            .collect();
        for lookup in &doomed {
            if let Some(id) = inner.index.remove(lookup) {
                inner.remove(id);
            }
        }
        Ok(doomed.len())
    }

    pub fn len(&self) -> usize {
        self.inner
            .lock()
            .map(|inner| inner.index.len())
            .unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn next_instance_id(&self) -> InstanceId {
        InstanceId(self.next_instance.fetch_add(1, Ordering::Relaxed))
    }

    fn compile_locked(
        &self,
        entry: &mut CacheEntry,
        subgraph: &Subgraph,
        options: &CompileOptions,
        session: SessionId,
    ) -> RuntimeResult<InstanceId> {
        let instance = self.next_instance_id();
        let profile = self.compiler.compile(&CompileRequest {
            instance,
            subgraph,
            signature: &entry.signature,
            options,
            session,
        })?;
        info!(
            subgraph = %subgraph.name,
            signature = %entry.signature,
            %instance,
            "compiled partition"
        );
        entry.template = Some(instance);
        entry.profile = Some(profile);
        entry.state = EntryState::Compiled;
        self.profiler.cache_event(profiling::COMPILE);
        Ok(instance)
    }

    fn fork_locked(&self, entry: &mut CacheEntry) -> RuntimeResult<InstanceId> {
        let template = entry
            .template
            .ok_or_else(|| RuntimeError::execution("compiled entry has no template"))?;
        let instance = self.next_instance_id();
        self.fork(template, instance)?;
        entry.forks.push(instance);
        Ok(instance)
    }

    fn load_locked(
        &self,
        entry: &mut CacheEntry,
        instance: InstanceId,
        request: &LoadRequest<'_>,
    ) -> RuntimeResult<InstanceId> {
        let profile = entry
            .profile
            .as_ref()
            .ok_or_else(|| RuntimeError::execution("compiled entry has no resource profile"))?;
        self.admission.admit_and_load(LoadCandidate {
            instance,
            session: request.session,
            profile,
            stream: request.stream,
            options: request.load_options,
        })?;
        let exclusive = profile.exclusive;
        entry.owners.insert(request.session, instance);
        if exclusive && entry.state == EntryState::Compiled {
            entry.state = EntryState::Instantiated;
        }
        Ok(instance)
    }
}
