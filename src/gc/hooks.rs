//! Per-object hook contract
//!
//! Types allocated with `allocate_managed` get a finalizer, an on-destroy
//! cleanup hook, and optionally take part in cycle collection by reporting
//! their outgoing strong handles.

use super::control::ControlBlock;
use super::strong::StrongHandle;
use smallvec::SmallVec;
use std::ptr::NonNull;

/// Lifetime hooks for a managed object.
///
/// Every hook may run on any thread. Panics are caught and discarded by the
/// collector, but hooks should not rely on that.
pub trait Managed: Send + Sync + 'static {
    /// Whether `trace` reports outgoing references. Only traced objects are
    /// considered by the cycle collector.
    const TRACED: bool = false;

    /// Runs once when the last strong handle is released, unless suppressed
    /// with `Collector::suppress_finalize`.
    fn finalize(&mut self) {}

    /// Runs once after the finalizer, right before the object is dropped.
    fn on_destroy(&mut self) {}

    /// Report every `StrongHandle` this object holds.
    fn trace(&self, tracer: &mut Tracer) {
        let _ = tracer;
    }

    /// Release every `StrongHandle` this object holds. Called on members of
    /// an unreachable cycle to break it.
    fn clear_references(&self) {}
}

/// Identity of a managed object, stable for the lifetime of its control block
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObjectId(usize);

impl ObjectId {
    #[inline]
    pub(crate) fn of(block: NonNull<ControlBlock>) -> Self {
        Self(block.as_ptr() as usize)
    }

    #[inline]
    pub fn as_usize(self) -> usize {
        self.0
    }
}

/// Collects the outgoing edges of one object during tracing
#[derive(Debug, Default)]
pub struct Tracer {
    edges: SmallVec<[ObjectId; 8]>,
}

impl Tracer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record an outgoing strong reference. Null handles are ignored.
    #[inline]
    pub fn visit<T: ?Sized>(&mut self, handle: &StrongHandle<T>) {
        if let Some(id) = handle.object_id() {
            self.edges.push(id);
        }
    }

    /// Record every handle in an iterator
    pub fn visit_all<'a, T: ?Sized + 'a>(&mut self, handles: impl IntoIterator<Item = &'a StrongHandle<T>>) {
        for handle in handles {
            self.visit(handle);
        }
    }

    pub fn edges(&self) -> &[ObjectId] {
        &self.edges
    }

    pub(crate) fn into_edges(self) -> SmallVec<[ObjectId; 8]> {
        self.edges
    }
}
