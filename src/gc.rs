use crate::GCResult;
use crate::collector::{Collector, FinalizationEntry, Registry, ReleaseAction};
use crate::epoch::{BarrierState, EpochBarrier, EpochScope};
use crate::error::GCError;
use crate::ffi::{NativeError, NativeRuntime};
use crate::handle::{NativeId, Tensor};
use std::sync::Arc;

#[derive(Debug, Clone)]
pub struct GcConfig {
    /// Unreachable entries queued before the collector runs a pass on its own.
    pub pending_threshold: usize,
    /// Native bytes queued before the collector runs a pass on its own.
    pub pending_bytes_threshold: Option<usize>,
    pub epoch_scope: EpochScope,
    pub debug_flags: u32,
    pub worker_name: String,
}

impl GcConfig {
    pub fn new() -> Self {
        Self {
            pending_threshold: 700,
            pending_bytes_threshold: None,
            epoch_scope: EpochScope::ArmingThread,
            debug_flags: 0,
            worker_name: "tensor-gc-finalizer".to_string(),
        }
    }

    pub fn pending_threshold(mut self, threshold: usize) -> Self {
        self.pending_threshold = threshold;
        self
    }

    pub fn pending_bytes_threshold(mut self, bytes: usize) -> Self {
        self.pending_bytes_threshold = Some(bytes);
        self
    }

    pub fn epoch_scope(mut self, scope: EpochScope) -> Self {
        self.epoch_scope = scope;
        self
    }

    pub fn debug_flags(mut self, flags: u32) -> Self {
        self.debug_flags = flags;
        self
    }

    pub fn worker_name(mut self, name: impl Into<String>) -> Self {
        self.worker_name = name.into();
        self
    }
}

impl Default for GcConfig {
    fn default() -> Self {
        Self::new()
    }
}

struct GcInner {
    registry: Arc<Registry>,
    barrier: EpochBarrier,
    collector: Collector,
}

impl Drop for GcInner {
    fn drop(&mut self) {
        if self.barrier.is_armed() {
            log::warn!("tensor context dropped with an armed barrier, finish() was never called");
        }
        self.collector.shutdown();
    }
}

/// Lifetime bridge between host-side tensor handles and a native runtime.
///
/// Cloning is cheap and every clone shares the same registry, barrier and
/// collector thread. Independent pipelines use independent contexts.
///
/// Training loops drive the barrier:
///
/// ```ignore
/// gc.prepare();
/// for batch in loader {
///     let loss = model.forward(&batch)?;
///     drop(loss);
///     gc.request_collection();
/// }
/// gc.finish();
/// ```
#[derive(Clone)]
pub struct TensorGc {
    inner: Arc<GcInner>,
}

impl TensorGc {
    pub fn new(runtime: Arc<dyn NativeRuntime>) -> GCResult<Self> {
        Self::with_config(runtime, GcConfig::default())
    }

    pub fn with_config(runtime: Arc<dyn NativeRuntime>, config: GcConfig) -> GCResult<Self> {
        let registry = Arc::new(Registry::new(
            runtime,
            config.pending_threshold,
            config.pending_bytes_threshold,
            config.debug_flags,
        ));
        let collector = Collector::spawn(Arc::clone(&registry), &config.worker_name)?;

        Ok(Self {
            inner: Arc::new(GcInner {
                registry,
                barrier: EpochBarrier::new(config.epoch_scope),
                collector,
            }),
        })
    }

    pub fn runtime(&self) -> &dyn NativeRuntime {
        self.inner.registry.runtime()
    }

    /// Wraps a fresh native identifier in a managed tensor.
    ///
    /// Fails only if another live handle already owns `id`.
    pub fn wrap_native(&self, id: NativeId) -> GCResult<Tensor> {
        let registry = &self.inner.registry;
        registry.track(id)?;

        let bytes = registry.runtime().resident_bytes(id);
        let token = self.inner.barrier.mint();
        registry.add_resident(bytes);
        log::trace!("tensor {id} registered ({bytes} bytes, tracked: {})", token.is_some());

        let entry = FinalizationEntry::new(id, ReleaseAction::Native, token, bytes);
        Ok(Tensor::new(self.clone(), id, bytes, Some(entry)))
    }

    /// Wraps an identifier whose cleanup the caller already owns. Dropping
    /// the tensor releases nothing.
    pub fn wrap_unmanaged(&self, id: NativeId) -> GCResult<Tensor> {
        self.inner.registry.track(id)?;
        let bytes = self.runtime().resident_bytes(id);
        Ok(Tensor::new(self.clone(), id, bytes, None))
    }

    /// Attaches a release action to an unmanaged tensor.
    pub fn register_finalizer<F>(&self, tensor: &mut Tensor, release: F) -> GCResult<()>
    where
        F: FnOnce(NativeId) -> Result<(), NativeError> + Send + Sync + 'static,
    {
        if !Arc::ptr_eq(&tensor.context().inner, &self.inner) {
            return Err(GCError::Internal(format!(
                "tensor {} belongs to another context",
                tensor.id()
            )));
        }
        if tensor.is_managed() {
            return Err(GCError::FinalizerAlreadyRegistered(tensor.id()));
        }

        let token = self.inner.barrier.mint();
        let bytes = tensor.resident_bytes();
        self.inner.registry.add_resident(bytes);
        tensor.attach(FinalizationEntry::new(
            tensor.id(),
            ReleaseAction::Custom(Box::new(release)),
            token,
            bytes,
        ));
        Ok(())
    }

    /// Native-call wrapper: runs `f` and wraps the identifier it returns.
    /// On failure nothing is registered and no native allocation is left
    /// behind.
    pub fn call<F>(&self, f: F) -> GCResult<Tensor>
    where
        F: FnOnce(&dyn NativeRuntime) -> Result<NativeId, NativeError>,
    {
        let id = f(self.runtime())?;
        self.wrap_native(id).inspect_err(|err| {
            log::error!("fresh tensor {id} could not be wrapped: {err}");
            // The runtime just handed `id` out, so a stale handle claims it.
            if let Err(release_err) = self.runtime().release(id) {
                log::error!("releasing unwrapped tensor {id} failed: {release_err}");
            }
        })
    }

    pub fn empty(&self, shape: &[usize]) -> GCResult<Tensor> {
        self.call(|rt| rt.allocate(shape))
    }

    /// Arms the barrier. A no-op when already armed.
    pub fn prepare(&self) {
        self.inner.barrier.prepare();
    }

    /// Requests a collector pass and, if the barrier is armed, blocks until
    /// every tensor registered in the current epoch has been finalized.
    ///
    /// On an idle barrier this arms it and returns without waiting, so the
    /// first call in a loop only starts tracking. Tensors of the closing
    /// epoch that are still alive when this is called stall the wait.
    pub fn request_collection(&self) {
        if !self.inner.barrier.is_armed() {
            self.collect();
            self.prepare();
            return;
        }
        self.wait_epoch();
    }

    /// Like [`request_collection`](Self::request_collection) without the
    /// arming side effect: on an idle barrier it only requests a pass.
    pub fn wait(&self) {
        if !self.inner.barrier.is_armed() {
            self.collect();
            return;
        }
        self.wait_epoch();
    }

    /// Final wait of a loop, then back to idle whatever is outstanding.
    pub fn finish(&self) {
        self.request_collection();
        self.inner.barrier.disarm();
    }

    /// Asks the collector for a pass without waiting for it.
    pub fn collect(&self) {
        self.inner.collector.request_pass();
    }

    fn wait_epoch(&self) {
        let Some((epoch, group)) = self.inner.barrier.close_epoch() else {
            return;
        };

        let registry = &self.inner.registry;
        registry.enter_wait();
        self.inner.collector.request_pass();
        log::debug!(
            "waiting for epoch {epoch}, {} finalizer(s) outstanding",
            self.outstanding()
        );
        group.wait();
        registry.leave_wait();
    }

    pub fn barrier_state(&self) -> BarrierState {
        self.inner.barrier.state()
    }

    /// Tracked entries registered while armed and not finalized yet.
    pub fn outstanding(&self) -> usize {
        self.inner.barrier.outstanding()
    }

    pub fn epoch(&self) -> u64 {
        self.inner.barrier.epoch()
    }

    pub fn is_tracked(&self, id: NativeId) -> bool {
        self.inner.registry.is_tracked(id)
    }

    pub fn set_threshold(&self, threshold: usize) {
        self.inner.registry.set_pending_threshold(threshold);
    }

    pub fn threshold(&self) -> usize {
        self.inner.registry.pending_threshold()
    }

    pub fn set_debug(&self, flags: u32) {
        self.inner.registry.set_debug_flags(flags);
    }

    pub fn get_debug(&self) -> u32 {
        self.inner.registry.debug_flags()
    }

    pub fn stats(&self) -> crate::GCStats {
        let snap = self.inner.registry.snapshot();
        crate::GCStats {
            collections: snap.collections,
            collected: snap.collected,
            released: snap.released,
            uncollectable: snap.uncollectable,
            total_tracked: snap.total_tracked,
            pending: snap.pending,
            outstanding: self.outstanding(),
            epoch: self.epoch(),
            resident_bytes: snap.resident_bytes,
        }
    }

    pub(crate) fn defer(&self, entry: FinalizationEntry) {
        if self.inner.registry.defer(entry) {
            self.inner.collector.request_pass();
        }
    }

    pub(crate) fn release_now(&self, id: NativeId, entry: Option<FinalizationEntry>) -> GCResult<()> {
        self.inner.registry.explicit_release(id, entry)?;
        Ok(())
    }

    pub(crate) fn forget(&self, id: NativeId) {
        self.inner.registry.untrack(id);
    }
}

impl std::fmt::Debug for TensorGc {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TensorGc")
            .field("state", &self.barrier_state())
            .field("epoch", &self.epoch())
            .field("outstanding", &self.outstanding())
            .finish()
    }
}

/// Process-wide context for hosts that cannot pass one around.
pub mod global {
    use super::*;
    use parking_lot::RwLock;

    static GC: RwLock<Option<TensorGc>> = parking_lot::const_rwlock(None);

    /// Installs `gc`, returning the context it replaced.
    pub fn install(gc: TensorGc) -> Option<TensorGc> {
        GC.write().replace(gc)
    }

    pub fn uninstall() -> Option<TensorGc> {
        GC.write().take()
    }

    pub fn get() -> Option<TensorGc> {
        GC.read().clone()
    }

    /// Returns false when no context is installed.
    pub fn request_collection() -> bool {
        match get() {
            Some(gc) => {
                gc.request_collection();
                true
            }
            None => false,
        }
    }

    pub fn finish() -> bool {
        match get() {
            Some(gc) => {
                gc.finish();
                true
            }
            None => false,
        }
    }
}
