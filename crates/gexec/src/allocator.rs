//! Allocator selection for the persistent memory regions of a graph.
//!
//! Every allocation returns a [`ReleaseHandle`] that remembers which provider
//! supplied the block, so eviction releases memory through the same path that
//! acquired it even if the caller's allocator registrations changed since.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex};

use tracing::debug;

use crate::config::RuntimeOptions;
use crate::device::{Block, DeviceRuntime, ExternalAllocator};
use crate::spec::{lock_named, MemoryKind, RuntimeError, RuntimeResult, SessionId, StreamId};

/// Which of the four providers supplied a region.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AllocationPath {
    /// Caller pinned the base address; nothing was allocated.
    PinnedBase,
    /// Caller-registered allocator bound to the graph's stream.
    External,
    /// Expandable pool shared by graphs of one session on one device.
    SessionPool,
    /// Plain per-kind device allocation.
    Device,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PoolKey {
    pub session: SessionId,
    pub device: u32,
    pub kind: MemoryKind,
}

#[derive(Debug, Clone, Copy)]
pub struct MallocRequest {
    pub kind: MemoryKind,
    pub size: u64,
    pub session: SessionId,
    pub stream: StreamId,
    pub pinned_base: Option<u64>,
    pub refreshable: bool,
    /// Address this region had before; forwarded to `malloc_advise`.
    pub hint_addr: Option<u64>,
}

pub struct ReleaseHandle {
    kind: MemoryKind,
    addr: u64,
    size: u64,
    route: ReleaseRoute,
}

enum ReleaseRoute {
    External {
        allocator: Arc<dyn ExternalAllocator>,
        block: Block,
    },
    SessionPool(Arc<SessionPool>),
    Device,
}

impl ReleaseHandle {
    pub fn path(&self) -> AllocationPath {
        match self.route {
            ReleaseRoute::External { .. } => AllocationPath::External,
            ReleaseRoute::SessionPool(_) => AllocationPath::SessionPool,
            ReleaseRoute::Device => AllocationPath::Device,
        }
    }

    pub fn kind(&self) -> MemoryKind {
        self.kind
    }

    pub fn addr(&self) -> u64 {
        self.addr
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    /// Pool the block belongs to, for session-pooled allocations.
    pub fn pool_key(&self) -> Option<PoolKey> {
        match &self.route {
            ReleaseRoute::SessionPool(pool) => Some(pool.key),
            _ => None,
        }
    }
}

impl fmt::Debug for ReleaseHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReleaseHandle")
            .field("kind", &self.kind)
            .field("addr", &self.addr)
            .field("size", &self.size)
            .field("path", &self.path())
            .finish()
    }
}

struct PoolBlock {
    addr: u64,
    size: u64,
    users: usize,
}

/// Expandable pool of device blocks for one (session, device, kind).
///
/// Graphs of the same session run one at a time, so a cached block large enough
/// for a request is handed out again even while another graph holds it.
pub struct SessionPool {
    key: PoolKey,
    device: Arc<dyn DeviceRuntime>,
    blocks: Mutex<Vec<PoolBlock>>,
}

impl SessionPool {
    fn new(key: PoolKey, device: Arc<dyn DeviceRuntime>) -> Self {
        Self {
            key,
            device,
            blocks: Mutex::new(Vec::new()),
        }
    }

    fn acquire(&self, size: u64) -> RuntimeResult<u64> {
        let mut blocks = lock_named(&self.blocks, "session pool")?;
        if let Some(block) = blocks
            .iter_mut()
            .filter(|block| block.size >= size)
            .min_by_key(|block| block.size)
        {
            block.users += 1;
            return Ok(block.addr);
        }

        // Grow: idle blocks that were too small go back to the device first.
        let mut kept = Vec::with_capacity(blocks.len());
        for block in blocks.drain(..) {
            if block.users == 0 {
                self.device.free(self.key.kind, block.addr)?;
            } else {
                kept.push(block);
            }
        }
        *blocks = kept;

        let addr = self.device.malloc(self.key.kind, size)?;
        debug!(session = self.key.session.0, kind = %self.key.kind, bytes = size, "session pool expanded");
        blocks.push(PoolBlock {
            addr,
            size,
            users: 1,
        });
        Ok(addr)
    }

    fn release(&self, addr: u64) -> RuntimeResult<()> {
        let mut blocks = lock_named(&self.blocks, "session pool")?;
        let block = blocks
            .iter_mut()
            .find(|block| block.addr == addr)
            .ok_or_else(|| {
                RuntimeError::parameter(format!(
                    "address {addr:#x} does not belong to the {} pool of session {}",
                    self.key.kind, self.key.session.0
                ))
            })?;
        block.users = block.users.saturating_sub(1);
        Ok(())
    }

    fn can_serve(&self, size: u64) -> RuntimeResult<bool> {
        let blocks = lock_named(&self.blocks, "session pool")?;
        Ok(blocks.iter().any(|block| block.size >= size))
    }

    fn trim_idle(&self) -> RuntimeResult<u64> {
        let mut blocks = lock_named(&self.blocks, "session pool")?;
        let mut freed = 0;
        let mut kept = Vec::with_capacity(blocks.len());
        for block in blocks.drain(..) {
            if block.users == 0 {
                self.device.free(self.key.kind, block.addr)?;
                freed += block.size;
            } else {
                kept.push(block);
            }
        }
        *blocks = kept;
        Ok(freed)
    }

    /// Bytes a trim would free once `released` users per block address have
    /// let go of their blocks.
    fn idle_after(&self, released: &HashMap<(PoolKey, u64), usize>) -> RuntimeResult<u64> {
        let blocks = lock_named(&self.blocks, "session pool")?;
        Ok(blocks
            .iter()
            .filter(|block| {
                let leaving = released.get(&(self.key, block.addr)).copied().unwrap_or(0);
                block.users <= leaving
            })
            .map(|block| block.size)
            .sum())
    }

    pub fn cached_bytes(&self) -> u64 {
        self.blocks
            .lock()
            .map(|blocks| blocks.iter().map(|block| block.size).sum())
            .unwrap_or(0)
    }
}

pub struct AllocatorSelector {
    device: Arc<dyn DeviceRuntime>,
    device_id: u32,
    session_pooled: bool,
    persistent_kinds: Vec<MemoryKind>,
    external: Mutex<HashMap<StreamId, Arc<dyn ExternalAllocator>>>,
    pools: Mutex<HashMap<PoolKey, Arc<SessionPool>>>,
}

impl AllocatorSelector {
    pub fn new(device: Arc<dyn DeviceRuntime>, options: &RuntimeOptions) -> Self {
        Self {
            device,
            device_id: options.device_id,
            session_pooled: options.session_pooled_allocator,
            persistent_kinds: options.persistent_priority_kinds.clone(),
            external: Mutex::new(HashMap::new()),
            pools: Mutex::new(HashMap::new()),
        }
    }

    pub fn register_allocator(
        &self,
        stream: StreamId,
        allocator: Arc<dyn ExternalAllocator>,
    ) -> RuntimeResult<()> {
        lock_named(&self.external, "external allocator table")?.insert(stream, allocator);
        Ok(())
    }

    pub fn unregister_allocator(&self, stream: StreamId) -> RuntimeResult<bool> {
        Ok(lock_named(&self.external, "external allocator table")?
            .remove(&stream)
            .is_some())
    }

    pub fn has_allocator(&self, stream: StreamId) -> RuntimeResult<bool> {
        Ok(lock_named(&self.external, "external allocator table")?.contains_key(&stream))
    }

    /// Picks a provider for `request` and allocates from it.
    ///
    /// Pinned bases return no handle since nothing was allocated.
    pub fn select_and_malloc(
        &self,
        request: &MallocRequest,
    ) -> RuntimeResult<(u64, Option<ReleaseHandle>)> {
        if let Some(base) = request.pinned_base {
            debug!(kind = %request.kind, base, "using caller-pinned base");
            return Ok((base, None));
        }

        let external = lock_named(&self.external, "external allocator table")?
            .get(&request.stream)
            .cloned();
        if let Some(allocator) = external {
            if request.refreshable || self.persistent_kinds.contains(&request.kind) {
                let block = match request.hint_addr {
                    Some(hint) => allocator.malloc_advise(request.size, hint)?,
                    None => allocator.malloc(request.size)?,
                };
                debug!(kind = %request.kind, addr = block.addr, bytes = block.size, stream = %request.stream, "allocated through external allocator");
                return Ok((
                    block.addr,
                    Some(ReleaseHandle {
                        kind: request.kind,
                        addr: block.addr,
                        size: request.size,
                        route: ReleaseRoute::External { allocator, block },
                    }),
                ));
            }
        }

        if self.session_pooled {
            let pool = self.pool(request.session, request.kind)?;
            let addr = pool.acquire(request.size)?;
            return Ok((
                addr,
                Some(ReleaseHandle {
                    kind: request.kind,
                    addr,
                    size: request.size,
                    route: ReleaseRoute::SessionPool(pool),
                }),
            ));
        }

        let addr = self.device.malloc(request.kind, request.size)?;
        Ok((
            addr,
            Some(ReleaseHandle {
                kind: request.kind,
                addr,
                size: request.size,
                route: ReleaseRoute::Device,
            }),
        ))
    }

    pub fn release(&self, handle: ReleaseHandle) -> RuntimeResult<()> {
        match handle.route {
            ReleaseRoute::External { allocator, block } => allocator.free(block),
            ReleaseRoute::SessionPool(pool) => pool.release(handle.addr),
            ReleaseRoute::Device => self.device.free(handle.kind, handle.addr),
        }
    }

    /// True when a session pool already holds a block of at least `size` bytes,
    /// so a load needs no new device memory for this kind.
    pub fn can_reuse_pooled(
        &self,
        session: SessionId,
        kind: MemoryKind,
        size: u64,
    ) -> RuntimeResult<bool> {
        if !self.session_pooled {
            return Ok(false);
        }
        let key = PoolKey {
            session,
            device: self.device_id,
            kind,
        };
        let pool = lock_named(&self.pools, "session pool table")?
            .get(&key)
            .cloned();
        match pool {
            Some(pool) => pool.can_serve(size),
            None => Ok(false),
        }
    }

    /// Returns idle pooled blocks to the device.
    pub fn trim_idle(&self) -> RuntimeResult<u64> {
        let pools: Vec<Arc<SessionPool>> = lock_named(&self.pools, "session pool table")?
            .values()
            .cloned()
            .collect();
        let mut freed = 0;
        for pool in pools {
            freed += pool.trim_idle()?;
        }
        Ok(freed)
    }

    /// Pooled bytes a trim would return to the device after the given block
    /// users are released. Already idle blocks count too.
    pub fn idle_after_release(
        &self,
        released: &HashMap<(PoolKey, u64), usize>,
    ) -> RuntimeResult<u64> {
        let pools: Vec<Arc<SessionPool>> = lock_named(&self.pools, "session pool table")?
            .values()
            .cloned()
            .collect();
        let mut idle = 0;
        for pool in pools {
            idle += pool.idle_after(released)?;
        }
        Ok(idle)
    }

    pub fn pooled_bytes(&self, session: SessionId, kind: MemoryKind) -> RuntimeResult<u64> {
        let key = PoolKey {
            session,
            device: self.device_id,
            kind,
        };
        Ok(lock_named(&self.pools, "session pool table")?
            .get(&key)
            .map(|pool| pool.cached_bytes())
            .unwrap_or(0))
    }

    fn pool(&self, session: SessionId, kind: MemoryKind) -> RuntimeResult<Arc<SessionPool>> {
        let key = PoolKey {
            session,
            device: self.device_id,
            kind,
        };
        let mut pools = lock_named(&self.pools, "session pool table")?;
        Ok(Arc::clone(pools.entry(key).or_insert_with(|| {
            Arc::new(SessionPool::new(key, Arc::clone(&self.device)))
        })))
    }
}
