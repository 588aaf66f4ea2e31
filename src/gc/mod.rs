//! Garbage collector - reference counting + cycle detection
//!
//! Design: Hybrid approach with deterministic destruction:
//! 1. Reference counting (fast path, inline on the releasing thread)
//! 2. Trial deletion with tricolor marking (rare, cycles only)
//! 3. Queued finalizers drained after each forced collection
//!
//! Handles:
//! - `StrongHandle` owns, `WeakHandle` observes, `StackRef` borrows
//! - Every object has one `ControlBlock`, shared by all its handles

mod backend;
mod collector;
mod control;
mod cycles;
mod heap;
mod hooks;
mod pool;
mod pressure;
mod stack_ref;
mod strong;
mod weak;

#[cfg(test)]
mod tests;

pub use backend::{CollectOutcome, CountingOnly, TracingBackend};
pub use collector::{CollectionReport, Collector};
pub use control::{ControlBlock, MAX_GENERATION};
pub use cycles::TrialDeletion;
pub use heap::{GcStats, Heap, HeapObject};
pub use hooks::{Managed, ObjectId, Tracer};
pub use pool::{Generation, Pool, PoolIndex};
pub use pressure::MemoryPressureGuard;
pub use stack_ref::StackRef;
pub use strong::StrongHandle;
pub use weak::WeakHandle;

use crate::error::GcResult;
use crate::logging::{debug, error, info, log_gc_complete};
use std::time::Instant;

/// Initialize the global collector and its tracing backend
pub fn init() -> GcResult<()> {
    info!("GC subsystem initializing");

    let collector = Collector::global();
    collector.initialize()?;

    debug!(
        backend = collector.backend_name(),
        config = ?collector.config(),
        "GC initialized"
    );
    Ok(())
}

/// Final collection and finalizer drain
pub fn cleanup() {
    info!("GC subsystem cleanup starting");

    let start = Instant::now();
    let collector = Collector::global();
    let reclaimed = match collector.collect() {
        Ok(report) => report.objects_reclaimed,
        Err(err) => {
            error!(error = %err, "Final collection failed");
            0
        }
    };
    collector.wait_for_pending_finalizers();

    log_gc_complete(start.elapsed().as_micros() as u64, reclaimed, collector.heap().live_objects());
}

/// Allocate on the global collector
pub fn allocate<T: Send + Sync + 'static>(value: T) -> GcResult<StrongHandle<T>> {
    Collector::global().allocate(value)
}

/// Allocate a hooked object on the global collector
pub fn allocate_managed<T: Managed>(value: T) -> GcResult<StrongHandle<T>> {
    Collector::global().allocate_managed(value)
}

/// Full collection on the global collector
pub fn collect() -> GcResult<CollectionReport> {
    Collector::global().collect()
}

/// Force immediate collection (for testing/profiling)
pub fn force_collect() {
    info!("Forcing immediate GC collection");
    if let Err(err) = collect() {
        error!(error = %err, "Forced collection failed");
    }
}

/// Get GC statistics of the global collector
pub fn stats() -> GcStats {
    let stats = Collector::global().statistics();

    debug!(
        live_objects = stats.live_objects,
        collections = stats.collections,
        reclaimed = stats.objects_reclaimed,
        "GC statistics retrieved"
    );

    stats
}
