//! Tracing backend seam
//!
//! The collector never reclaims cycles itself. It hands the heap to a
//! `TracingBackend`, which decides what is unreachable and breaks those
//! cycles; reference counting then destroys the members as usual.

use super::heap::Heap;
use crate::error::GcResult;

/// Result of one backend pass
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CollectOutcome {
    /// Objects the backend examined
    pub objects_scanned: usize,
    /// Objects whose cycles were broken
    pub objects_reclaimed: usize,
}

/// External cycle collector used by `Collector::collect`.
///
/// Implementations are initialized exactly once per collector, lazily, and
/// are never called concurrently with themselves for the same collector.
pub trait TracingBackend: Send + Sync + 'static {
    /// Short name used in logs and errors
    fn name(&self) -> &'static str;

    /// One-time startup. Failure is fatal for the owning collector.
    fn init(&self) -> GcResult<()> {
        Ok(())
    }

    /// Find and break unreachable cycles among objects of generation
    /// `generation` or younger.
    fn collect(&self, heap: &Heap, generation: usize) -> GcResult<CollectOutcome>;

    /// Heap size estimate in bytes
    fn heap_size(&self, heap: &Heap) -> usize {
        heap.live_bytes()
    }
}

/// Backend that never reclaims anything. Cycles leak; counting still works.
#[derive(Debug, Default, Clone, Copy)]
pub struct CountingOnly;

impl TracingBackend for CountingOnly {
    fn name(&self) -> &'static str {
        "counting-only"
    }

    fn collect(&self, _heap: &Heap, _generation: usize) -> GcResult<CollectOutcome> {
        Ok(CollectOutcome::default())
    }
}
