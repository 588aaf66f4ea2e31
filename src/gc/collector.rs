//! Collector facade - allocation, forced collection, finalizers, statistics
//!
//! Design: Reference counting does the common case inline on the releasing
//! thread. The collector only coordinates the rare work:
//! 1. Cycle reclamation, delegated to a `TracingBackend`
//! 2. Draining the pending finalizer queue
//! 3. Counters, memory pressure and configuration
//!
//! One process-wide collector is created lazily by `Collector::global()`.
//! Independent collectors can be created for isolated heaps.

use super::backend::{CollectOutcome, TracingBackend};
use super::control::{alloc_object, dealloc_object, ControlBlock, RawRef, TypeInfo, MAX_GENERATION};
use super::cycles::TrialDeletion;
use super::heap::{GcStats, Heap};
use super::hooks::Managed;
use super::strong::StrongHandle;
use crate::config::CollectorConfig;
use crate::error::{GcError, GcResult};
use crate::logging::{debug, error, info, log_allocation, log_finalizer_failure, log_gc_complete, trace, warn};
use once_cell::sync::{Lazy, OnceCell};
use parking_lot::Mutex;
use std::cell::Cell;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::ptr::NonNull;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Global collector, created on first use
static GLOBAL: Lazy<Collector> = Lazy::new(|| {
    let config = CollectorConfig::from_env().unwrap_or_else(|err| {
        warn!(error = %err, "Ignoring invalid collector environment, using defaults");
        CollectorConfig::default()
    });
    Collector::with_config(config)
});

thread_local! {
    /// Set while this thread runs a collection, so finalizers that allocate
    /// or collect do not re-enter it.
    static COLLECTING: Cell<bool> = Cell::new(false);
}

/// Marks this thread as collecting until dropped, unwinding included
struct CollectingScope;

impl CollectingScope {
    fn enter() -> Self {
        COLLECTING.with(|c| c.set(true));
        Self
    }
}

impl Drop for CollectingScope {
    fn drop(&mut self) {
        COLLECTING.with(|c| c.set(false));
    }
}

/// Summary of one forced collection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CollectionReport {
    pub generation: usize,
    pub objects_scanned: usize,
    pub objects_reclaimed: usize,
    pub finalizers_run: usize,
    pub duration: Duration,
    /// The call happened inside a running collection and did nothing
    pub skipped: bool,
}

impl CollectionReport {
    fn skipped(generation: usize) -> Self {
        Self {
            generation,
            objects_scanned: 0,
            objects_reclaimed: 0,
            finalizers_run: 0,
            duration: Duration::ZERO,
            skipped: true,
        }
    }
}

pub struct Collector {
    heap: Arc<Heap>,
    backend: Box<dyn TracingBackend>,
    backend_ready: OnceCell<()>,
    collection_lock: Mutex<()>,
}

impl Collector {
    /// Highest generation bucket accepted by `collect_generation`
    pub const MAX_GENERATION: usize = MAX_GENERATION;

    /// Collector with default configuration and the trial-deletion backend
    pub fn new() -> Self {
        Self::with_config(CollectorConfig::default())
    }

    pub fn with_config(config: CollectorConfig) -> Self {
        Self::with_backend(config, TrialDeletion::new())
    }

    pub fn with_backend(config: CollectorConfig, backend: impl TracingBackend) -> Self {
        Self {
            heap: Arc::new(Heap::new(config)),
            backend: Box::new(backend),
            backend_ready: OnceCell::new(),
            collection_lock: Mutex::new(()),
        }
    }

    /// The process-wide collector
    pub fn global() -> &'static Collector {
        &GLOBAL
    }

    pub fn heap(&self) -> &Arc<Heap> {
        &self.heap
    }

    pub fn backend_name(&self) -> &'static str {
        self.backend.name()
    }

    /// Start the tracing backend (exactly once, thread-safe)
    pub fn initialize(&self) -> GcResult<()> {
        self.backend_ready
            .get_or_try_init(|| {
                debug!(backend = self.backend.name(), "Initializing tracing backend");
                self.backend.init().map_err(|err| {
                    let reason = match err {
                        GcError::BackendInit { reason, .. } | GcError::Backend { reason, .. } => reason,
                        other => other.to_string(),
                    };
                    error!(backend = self.backend.name(), reason = %reason, "Tracing backend failed to start");
                    GcError::BackendInit {
                        backend: self.backend.name(),
                        reason,
                    }
                })
            })
            .map(|_| ())
    }

    pub fn is_initialized(&self) -> bool {
        self.backend_ready.get().is_some()
    }

    // ===== Allocation =====

    /// Allocate a managed object without hooks
    pub fn allocate<T: Send + Sync + 'static>(&self, value: T) -> GcResult<StrongHandle<T>> {
        self.allocate_with(value, TypeInfo::plain::<T>())
    }

    /// Allocate a managed object with finalizer, cleanup and tracing hooks
    pub fn allocate_managed<T: Managed>(&self, value: T) -> GcResult<StrongHandle<T>> {
        self.allocate_with(value, TypeInfo::managed::<T>())
    }

    /// Take ownership of an existing boxed object
    pub fn adopt<T: Send + Sync + 'static>(&self, object: Box<T>) -> GcResult<StrongHandle<T>> {
        let info = TypeInfo::plain::<T>();
        self.reserve(&info)?;
        // SAFETY: Box::into_raw never returns null
        let ptr = unsafe { NonNull::new_unchecked(Box::into_raw(object)) };
        self.install(ptr, info)
    }

    /// Adopt a boxed object that implements the hook contract
    pub fn adopt_managed<T: Managed>(&self, object: Box<T>) -> GcResult<StrongHandle<T>> {
        let info = TypeInfo::managed::<T>();
        self.reserve(&info)?;
        // SAFETY: Box::into_raw never returns null
        let ptr = unsafe { NonNull::new_unchecked(Box::into_raw(object)) };
        self.install(ptr, info)
    }

    fn allocate_with<T: Send + Sync + 'static>(&self, value: T, info: TypeInfo) -> GcResult<StrongHandle<T>> {
        self.reserve(&info)?;
        let ptr = alloc_object::<T>().ok_or(GcError::AllocationFailed {
            type_name: info.type_name,
            size: info.layout.size(),
        })?;
        // SAFETY: fresh storage sized and aligned for T
        unsafe { ptr.as_ptr().write(value) };
        self.install(ptr, info)
    }

    /// Create the control block for an initialized object
    fn install<T>(&self, ptr: NonNull<T>, info: TypeInfo) -> GcResult<StrongHandle<T>> {
        let object = ptr.cast::<()>();
        let Some(block) = ControlBlock::allocate(object, info, Arc::clone(&self.heap)) else {
            // Nothing was registered; dispose of the object ourselves
            // SAFETY: we still own the initialized object
            unsafe {
                (info.drop)(object.as_ptr());
                dealloc_object(object.as_ptr(), info.layout);
            }
            return Err(GcError::AllocationFailed {
                type_name: info.type_name,
                size: std::mem::size_of::<ControlBlock>(),
            });
        };

        self.heap.register(object.as_ptr() as usize, block, info.layout.size());
        log_allocation(info.type_name, info.layout.size(), object.as_ptr());

        // SAFETY: the block starts with one strong reference for this handle
        Ok(unsafe { StrongHandle::from_raw_parts(RawRef { ptr, block }) })
    }

    /// Enforce the heap ceiling, collecting once before giving up
    fn reserve(&self, info: &TypeInfo) -> GcResult<()> {
        let Some(limit) = self.heap.heap_limit() else {
            return Ok(());
        };
        let requested = info.layout.size();
        if self.heap.live_bytes() + requested <= limit {
            return Ok(());
        }

        if !COLLECTING.with(Cell::get) {
            debug!(
                requested,
                live = self.heap.live_bytes(),
                limit,
                "Heap limit reached, forcing full collection"
            );
            self.collect()?;
        }

        let live = self.heap.live_bytes();
        if live + requested > limit {
            warn!(type_name = info.type_name, requested, live, limit, "Allocation refused by heap limit");
            return Err(GcError::HeapLimitExceeded { requested, live, limit });
        }
        Ok(())
    }

    // ===== Collection =====

    /// Force a full collection (all generations)
    pub fn collect(&self) -> GcResult<CollectionReport> {
        self.collect_generation(MAX_GENERATION)
    }

    /// Force a collection of `generation` and every younger generation
    pub fn collect_generation(&self, generation: usize) -> GcResult<CollectionReport> {
        if generation > MAX_GENERATION {
            return Err(GcError::InvalidGeneration {
                requested: generation,
                max: MAX_GENERATION,
            });
        }
        self.initialize()?;

        if COLLECTING.with(Cell::get) {
            debug!(generation, "Collection requested from inside a collection, skipping");
            return Ok(CollectionReport::skipped(generation));
        }

        let start = Instant::now();
        let outcome = {
            let _guard = self.collection_lock.lock();
            let _collecting = CollectingScope::enter();
            self.backend.collect(&self.heap, generation)?
        };
        self.heap.record_collection(generation, outcome.objects_reclaimed);

        let finalizers_run = self.wait_for_pending_finalizers();
        let duration = start.elapsed();

        self.log_collection(generation, &outcome, duration);

        Ok(CollectionReport {
            generation,
            objects_scanned: outcome.objects_scanned,
            objects_reclaimed: outcome.objects_reclaimed,
            finalizers_run,
            duration,
            skipped: false,
        })
    }

    fn log_collection(&self, generation: usize, outcome: &CollectOutcome, duration: Duration) {
        if self.heap.logging() {
            log_gc_complete(
                duration.as_micros() as u64,
                outcome.objects_reclaimed,
                self.heap.live_objects(),
            );
        } else {
            debug!(generation, scanned = outcome.objects_scanned, "Collection finished");
        }
        if duration.as_millis() > 10 {
            warn!(duration_ms = duration.as_millis() as u64, "GC collection took significant time");
        }
    }

    /// Heap size estimate from the backend, optionally after a full collection
    pub fn get_total_memory(&self, force_full_collection: bool) -> GcResult<usize> {
        self.initialize()?;
        if force_full_collection {
            self.collect()?;
        }
        Ok(self.backend.heap_size(&self.heap))
    }

    // ===== Finalizers =====

    /// Queue a callback for the next finalizer drain
    pub fn register_finalizer(&self, finalizer: impl FnOnce() + Send + 'static) {
        self.ensure_initialized();
        self.heap.enqueue_finalizer(Box::new(finalizer));
        trace!(pending = self.heap.pending_finalizers(), "Finalizer registered");
    }

    /// Run every queued finalizer on this thread, including ones queued by
    /// finalizers while draining. Returns how many ran.
    pub fn wait_for_pending_finalizers(&self) -> usize {
        self.ensure_initialized();

        let mut ran = 0;
        let mut failed = 0;
        while let Some(finalizer) = self.heap.pop_finalizer() {
            ran += 1;
            self.heap.record_finalizer_run();
            if catch_unwind(AssertUnwindSafe(finalizer)).is_err() {
                failed += 1;
                self.heap.record_finalizer_failure();
                log_finalizer_failure("queued", "callback", "finalizer callback panicked");
            }
        }

        if ran > 0 && self.heap.logging() {
            info!(ran, failed, "Pending finalizers drained");
        }
        ran
    }

    /// Skip the finalizer when this object is destroyed. Idempotent.
    pub fn suppress_finalize<T: ?Sized>(&self, handle: &StrongHandle<T>) {
        self.ensure_initialized();
        handle.set_finalize_suppressed(true);
    }

    /// Undo `suppress_finalize`. Idempotent.
    pub fn re_register_for_finalize<T: ?Sized>(&self, handle: &StrongHandle<T>) {
        self.ensure_initialized();
        handle.set_finalize_suppressed(false);
    }

    // ===== Statistics =====

    /// Collections that covered `generation`; 0 for unknown generations
    pub fn collection_count(&self, generation: usize) -> u64 {
        self.ensure_initialized();
        self.heap.collection_count(generation)
    }

    pub fn statistics(&self) -> GcStats {
        self.ensure_initialized();
        self.heap.stats()
    }

    /// Zero the cumulative counters. Live gauges are kept.
    pub fn reset_statistics(&self) {
        self.ensure_initialized();
        self.heap.reset_stats();
        debug!("GC statistics reset");
    }

    // ===== Memory pressure =====

    /// Record unmanaged memory held by managed objects. Informational only.
    pub fn add_memory_pressure(&self, bytes: u64) -> GcResult<u64> {
        self.ensure_initialized();
        if bytes == 0 {
            return Err(GcError::InvalidMemoryPressure);
        }
        let total = self.heap.add_pressure(bytes);
        trace!(bytes, total, "Memory pressure added");
        Ok(total)
    }

    /// Undo `add_memory_pressure`. Saturates at zero.
    pub fn remove_memory_pressure(&self, bytes: u64) -> GcResult<u64> {
        self.ensure_initialized();
        if bytes == 0 {
            return Err(GcError::InvalidMemoryPressure);
        }
        let total = self.heap.remove_pressure(bytes);
        trace!(bytes, total, "Memory pressure removed");
        Ok(total)
    }

    pub fn memory_pressure(&self) -> u64 {
        self.heap.memory_pressure()
    }

    // ===== Configuration =====

    pub fn config(&self) -> CollectorConfig {
        self.heap.config()
    }

    /// Replace the whole configuration
    pub fn configure(&self, config: CollectorConfig) -> GcResult<()> {
        config.validate()?;
        debug!(?config, "Collector reconfigured");
        self.heap.update_config(|current| *current = config);
        Ok(())
    }

    /// Set or clear the heap ceiling in bytes
    pub fn set_heap_limit(&self, limit: Option<usize>) -> GcResult<()> {
        if limit == Some(0) {
            return Err(GcError::config("heap_limit must be greater than zero"));
        }
        self.heap.update_config(|config| config.heap_limit = limit);
        Ok(())
    }

    pub fn set_logging(&self, enabled: bool) {
        self.heap.update_config(|config| config.logging = enabled);
    }

    /// Prefer parallel tracing during collections
    pub fn set_concurrent(&self, concurrent: bool) {
        self.heap.update_config(|config| config.concurrent = concurrent);
    }

    /// Initialize for operations that cannot report an error; the failure
    /// is logged here and surfaces again on the next `collect`.
    fn ensure_initialized(&self) {
        if let Err(err) = self.initialize() {
            error!(error = %err, "Collector used with a failed tracing backend");
        }
    }
}

impl Default for Collector {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for Collector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Collector")
            .field("backend", &self.backend.name())
            .field("initialized", &self.is_initialized())
            .field("heap", &self.heap)
            .finish()
    }
}
