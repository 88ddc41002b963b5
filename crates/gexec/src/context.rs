use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::admission::AdmissionController;
use crate::allocator::AllocatorSelector;
use crate::cache::CompileCache;
use crate::config::RuntimeOptions;
use crate::device::{Compiler, DeviceRuntime, ExecutionBackend};
use crate::profiling::Profiler;
use crate::spec::{GraphId, InstanceId, RuntimeResult};

/// Owns every piece of shared runtime state for one device: the loaded-graph
/// table, the allocator tables and the compile cache. Independent contexts can
/// coexist in one process.
pub struct RuntimeContext {
    options: RuntimeOptions,
    device: Arc<dyn DeviceRuntime>,
    compiler: Arc<dyn Compiler>,
    backend: Arc<dyn ExecutionBackend>,
    selector: Arc<AllocatorSelector>,
    admission: Arc<AdmissionController>,
    cache: CompileCache,
    profiler: Arc<Profiler>,
    next_graph: AtomicU64,
}

impl RuntimeContext {
    pub fn new(
        options: RuntimeOptions,
        device: Arc<dyn DeviceRuntime>,
        compiler: Arc<dyn Compiler>,
        backend: Arc<dyn ExecutionBackend>,
    ) -> Arc<Self> {
        let profiler = Arc::new(Profiler::new());
        let selector = Arc::new(AllocatorSelector::new(Arc::clone(&device), &options));
        let admission = Arc::new(AdmissionController::new(
            Arc::clone(&device),
            Arc::clone(&backend),
            Arc::clone(&selector),
            Arc::clone(&profiler),
            &options,
        ));
        let cache = CompileCache::new(
            Arc::clone(&compiler),
            Arc::clone(&admission),
            Arc::clone(&profiler),
        );
        Arc::new(Self {
            options,
            device,
            compiler,
            backend,
            selector,
            admission,
            cache,
            profiler,
            next_graph: AtomicU64::new(1),
        })
    }

    /// Builds a context from one object implementing all three collaborator roles.
    pub fn with_backend<B>(options: RuntimeOptions, backend: Arc<B>) -> Arc<Self>
    where
        B: DeviceRuntime + Compiler + ExecutionBackend + 'static,
    {
        Self::new(
            options,
            Arc::clone(&backend) as Arc<dyn DeviceRuntime>,
            Arc::clone(&backend) as Arc<dyn Compiler>,
            backend as Arc<dyn ExecutionBackend>,
        )
    }

    pub fn options(&self) -> &RuntimeOptions {
        &self.options
    }

    pub fn device(&self) -> &Arc<dyn DeviceRuntime> {
        &self.device
    }

    pub fn compiler(&self) -> &Arc<dyn Compiler> {
        &self.compiler
    }

    pub fn backend(&self) -> &Arc<dyn ExecutionBackend> {
        &self.backend
    }

    pub fn selector(&self) -> &AllocatorSelector {
        &self.selector
    }

    pub fn admission(&self) -> &AdmissionController {
        &self.admission
    }

    pub fn cache(&self) -> &CompileCache {
        &self.cache
    }

    pub fn profiler(&self) -> &Profiler {
        &self.profiler
    }

    /// Selects this context's device for the calling thread.
    pub fn ensure_device(&self) -> RuntimeResult<()> {
        self.device.set_device(self.options.device_id)
    }

    /// Explicitly unloads `instance`, releasing everything it holds.
    pub fn unload(&self, instance: InstanceId) -> RuntimeResult<bool> {
        self.admission.unload(instance)
    }

    pub(crate) fn next_graph_id(&self) -> GraphId {
        GraphId(self.next_graph.fetch_add(1, Ordering::Relaxed))
    }
}
