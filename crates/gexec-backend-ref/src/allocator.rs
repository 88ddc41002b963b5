use std::collections::BTreeMap;
use std::sync::Mutex;

use gexec::device::{Block, ExternalAllocator};
use gexec::{RuntimeError, RuntimeResult};

const BASE_ADDR: u64 = 0x7000_0000_0000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AllocatorCall {
    Malloc { size: u64, addr: u64 },
    MallocAdvise { size: u64, hint: u64, addr: u64 },
    Free { addr: u64 },
}

#[derive(Default)]
struct AllocatorState {
    live: BTreeMap<u64, u64>,
    next_addr: u64,
    calls: Vec<AllocatorCall>,
}

/// Caller-side allocator with its own address space.
///
/// `malloc_advise` hands back the hinted address whenever it is not in use,
/// so a graph reloaded through it sees the same regions as before.
#[derive(Default)]
pub struct RefAllocator {
    state: Mutex<AllocatorState>,
}

impl RefAllocator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn calls(&self) -> Vec<AllocatorCall> {
        self.state
            .lock()
            .map(|state| state.calls.clone())
            .unwrap_or_default()
    }

    pub fn live_blocks(&self) -> usize {
        self.state.lock().map(|state| state.live.len()).unwrap_or(0)
    }

    fn lock(&self) -> RuntimeResult<std::sync::MutexGuard<'_, AllocatorState>> {
        self.state
            .lock()
            .map_err(|_| RuntimeError::device("reference allocator state poisoned"))
    }

    fn fresh(state: &mut AllocatorState, size: u64) -> u64 {
        if state.next_addr == 0 {
            state.next_addr = BASE_ADDR;
        }
        let addr = state.next_addr;
        state.next_addr += size.max(1).next_multiple_of(256);
        state.live.insert(addr, size);
        addr
    }
}

impl ExternalAllocator for RefAllocator {
    fn malloc(&self, size: u64) -> RuntimeResult<Block> {
        let mut state = self.lock()?;
        let addr = Self::fresh(&mut state, size);
        state.calls.push(AllocatorCall::Malloc { size, addr });
        Ok(Block { addr, size })
    }

    fn malloc_advise(&self, size: u64, hint: u64) -> RuntimeResult<Block> {
        let mut state = self.lock()?;
        let addr = if hint >= BASE_ADDR && hint < state.next_addr && !state.live.contains_key(&hint) {
            state.live.insert(hint, size);
            hint
        } else {
            Self::fresh(&mut state, size)
        };
        state.calls.push(AllocatorCall::MallocAdvise { size, hint, addr });
        Ok(Block { addr, size })
    }

    fn free(&self, block: Block) -> RuntimeResult<()> {
        let mut state = self.lock()?;
        if state.live.remove(&block.addr).is_none() {
            return Err(RuntimeError::device(format!(
                "free of unknown block {:#x}",
                block.addr
            )));
        }
        state.calls.push(AllocatorCall::Free { addr: block.addr });
        Ok(())
    }
}
