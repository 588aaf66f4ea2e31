//! Heap state shared by a collector and every control block it created
//!
//! Holds the live-object registry (object address -> control block), the
//! cycle-candidate set, statistics counters, the pending finalizer queue,
//! the memory-pressure accumulator, and the runtime configuration.

use super::control::{ControlBlock, MAX_GENERATION};
use super::hooks::{ObjectId, Tracer};
use crate::config::CollectorConfig;
use crate::logging::trace;
use crossbeam::queue::SegQueue;
use dashmap::{DashMap, DashSet};
use parking_lot::RwLock;
use serde::Serialize;
use smallvec::SmallVec;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

/// Deferred cleanup callback
pub(crate) type Finalizer = Box<dyn FnOnce() + Send + 'static>;

/// Registry entry. Only dereferenced while the registry shard is locked,
/// which keeps the block's implicit weak reference alive.
#[derive(Clone, Copy)]
struct BlockRef(NonNull<ControlBlock>);

// Safety: blocks are only touched through atomics while registered
unsafe impl Send for BlockRef {}
unsafe impl Sync for BlockRef {}

/// Lock-free counters. Cumulative counters only grow until reset;
/// live gauges track the current heap.
#[derive(Default)]
struct Counters {
    allocations: AtomicU64,
    deallocations: AtomicU64,
    bytes_allocated: AtomicU64,
    bytes_freed: AtomicU64,
    collections: AtomicU64,
    generation_collections: [AtomicU64; MAX_GENERATION + 1],
    objects_reclaimed: AtomicU64,
    finalizers_run: AtomicU64,
    finalizer_failures: AtomicU64,

    live_objects: AtomicUsize,
    live_bytes: AtomicUsize,
    live_blocks: AtomicUsize,
}

/// GC statistics for monitoring
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct GcStats {
    pub allocations: u64,
    pub deallocations: u64,
    pub bytes_allocated: u64,
    pub bytes_freed: u64,
    pub collections: u64,
    pub generation_collections: [u64; MAX_GENERATION + 1],
    pub objects_reclaimed: u64,
    pub finalizers_run: u64,
    pub finalizer_failures: u64,
    pub live_objects: usize,
    pub live_bytes: usize,
    pub pending_finalizers: usize,
    pub memory_pressure: u64,
}

pub struct Heap {
    registry: DashMap<usize, BlockRef>,
    candidates: DashSet<usize>,
    counters: Counters,
    pending: SegQueue<Finalizer>,
    pending_count: AtomicUsize,
    memory_pressure: AtomicU64,
    config: RwLock<CollectorConfig>,
}

impl Heap {
    pub(crate) fn new(config: CollectorConfig) -> Self {
        Self {
            registry: DashMap::with_capacity(1024),
            candidates: DashSet::with_capacity(256),
            counters: Counters::default(),
            pending: SegQueue::new(),
            pending_count: AtomicUsize::new(0),
            memory_pressure: AtomicU64::new(0),
            config: RwLock::new(config),
        }
    }

    // ===== Registry =====

    /// Record a new object. Zero-sized objects share an address and are
    /// counted but not indexed.
    pub(crate) fn register(&self, address: usize, block: NonNull<ControlBlock>, size: usize) {
        if size != 0 {
            self.registry.insert(address, BlockRef(block));
        }
        self.counters.allocations.fetch_add(1, Ordering::Relaxed);
        self.counters.bytes_allocated.fetch_add(size as u64, Ordering::Relaxed);
        self.counters.live_objects.fetch_add(1, Ordering::Relaxed);
        self.counters.live_bytes.fetch_add(size, Ordering::Relaxed);
        self.counters.live_blocks.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn unregister(&self, address: usize, block: NonNull<ControlBlock>) {
        self.registry.remove_if(&address, |_, entry| entry.0 == block);
        self.candidates.remove(&(block.as_ptr() as usize));
    }

    /// Take a strong reference to the object at `address`, if it is managed
    /// here and still alive.
    pub(crate) fn upgrade_address(&self, address: usize) -> Option<NonNull<ControlBlock>> {
        let block = {
            let entry = self.registry.get(&address)?;
            let block = entry.value().0;
            // SAFETY: registered, so the implicit weak reference is still held
            if !unsafe { block.as_ref() }.try_add_strong_ref() {
                return None;
            }
            block
        };

        // Outside the shard guard: giving the reference back can destroy
        // the object, which unregisters it.
        // SAFETY: we own the reference just taken
        if unsafe { ControlBlock::abandon_if_condemned(block) } {
            return None;
        }
        Some(block)
    }

    /// Whether `address` is a live object of this heap
    pub fn contains(&self, address: usize) -> bool {
        self.registry.contains_key(&address)
    }

    /// Pin every traced object whose generation is at most `max_generation`.
    ///
    /// Each returned `HeapObject` holds a strong reference until dropped.
    pub fn traced_objects(&self, max_generation: usize) -> Vec<HeapObject> {
        let mut pinned = Vec::new();
        for entry in self.registry.iter() {
            let block = entry.value().0;
            // SAFETY: registered, so the implicit weak reference is still held
            let b = unsafe { block.as_ref() };
            if b.is_traced() && b.generation() <= max_generation && b.try_add_strong_ref() {
                pinned.push(HeapObject { block });
            }
        }
        trace!(pinned = pinned.len(), max_generation, "pinned traced objects");
        pinned
    }

    // ===== Cycle candidates =====

    #[inline]
    pub(crate) fn register_candidate(&self, block: NonNull<ControlBlock>) {
        self.candidates.insert(block.as_ptr() as usize);
    }

    pub fn has_candidates(&self) -> bool {
        !self.candidates.is_empty()
    }

    pub fn candidate_count(&self) -> usize {
        self.candidates.len()
    }

    pub fn clear_candidates(&self) {
        self.candidates.clear();
    }

    // ===== Counters =====

    pub(crate) fn record_deallocation(&self, size: usize) {
        self.counters.deallocations.fetch_add(1, Ordering::Relaxed);
        self.counters.bytes_freed.fetch_add(size as u64, Ordering::Relaxed);
        self.counters.live_objects.fetch_sub(1, Ordering::Relaxed);
        self.counters.live_bytes.fetch_sub(size, Ordering::Relaxed);
    }

    pub(crate) fn record_block_freed(&self) {
        self.counters.live_blocks.fetch_sub(1, Ordering::Relaxed);
    }

    pub(crate) fn record_finalizer_failure(&self) {
        self.counters.finalizer_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_collection(&self, generation: usize, reclaimed: usize) {
        self.counters.collections.fetch_add(1, Ordering::Relaxed);
        for bucket in &self.counters.generation_collections[..=generation] {
            bucket.fetch_add(1, Ordering::Relaxed);
        }
        self.counters.objects_reclaimed.fetch_add(reclaimed as u64, Ordering::Relaxed);
    }

    pub(crate) fn collection_count(&self, generation: usize) -> u64 {
        self.counters
            .generation_collections
            .get(generation)
            .map(|c| c.load(Ordering::Relaxed))
            .unwrap_or(0)
    }

    pub fn live_objects(&self) -> usize {
        self.counters.live_objects.load(Ordering::Relaxed)
    }

    pub fn live_bytes(&self) -> usize {
        self.counters.live_bytes.load(Ordering::Relaxed)
    }

    /// Control blocks not yet freed (objects plus blocks kept by weak handles)
    pub fn live_blocks(&self) -> usize {
        self.counters.live_blocks.load(Ordering::Relaxed)
    }

    pub(crate) fn stats(&self) -> GcStats {
        let c = &self.counters;
        GcStats {
            allocations: c.allocations.load(Ordering::Relaxed),
            deallocations: c.deallocations.load(Ordering::Relaxed),
            bytes_allocated: c.bytes_allocated.load(Ordering::Relaxed),
            bytes_freed: c.bytes_freed.load(Ordering::Relaxed),
            collections: c.collections.load(Ordering::Relaxed),
            generation_collections: std::array::from_fn(|g| {
                c.generation_collections[g].load(Ordering::Relaxed)
            }),
            objects_reclaimed: c.objects_reclaimed.load(Ordering::Relaxed),
            finalizers_run: c.finalizers_run.load(Ordering::Relaxed),
            finalizer_failures: c.finalizer_failures.load(Ordering::Relaxed),
            live_objects: c.live_objects.load(Ordering::Relaxed),
            live_bytes: c.live_bytes.load(Ordering::Relaxed),
            pending_finalizers: self.pending_count.load(Ordering::Acquire),
            memory_pressure: self.memory_pressure.load(Ordering::Relaxed),
        }
    }

    /// Zero the cumulative counters. Live gauges are left alone.
    pub(crate) fn reset_stats(&self) {
        let c = &self.counters;
        c.allocations.store(0, Ordering::Relaxed);
        c.deallocations.store(0, Ordering::Relaxed);
        c.bytes_allocated.store(0, Ordering::Relaxed);
        c.bytes_freed.store(0, Ordering::Relaxed);
        c.collections.store(0, Ordering::Relaxed);
        for bucket in &c.generation_collections {
            bucket.store(0, Ordering::Relaxed);
        }
        c.objects_reclaimed.store(0, Ordering::Relaxed);
        c.finalizers_run.store(0, Ordering::Relaxed);
        c.finalizer_failures.store(0, Ordering::Relaxed);
    }

    // ===== Pending finalizers =====

    pub(crate) fn enqueue_finalizer(&self, finalizer: Finalizer) {
        self.pending.push(finalizer);
        self.pending_count.fetch_add(1, Ordering::Release);
    }

    pub(crate) fn pop_finalizer(&self) -> Option<Finalizer> {
        let finalizer = self.pending.pop()?;
        self.pending_count.fetch_sub(1, Ordering::Release);
        Some(finalizer)
    }

    pub(crate) fn record_finalizer_run(&self) {
        self.counters.finalizers_run.fetch_add(1, Ordering::Relaxed);
    }

    pub fn pending_finalizers(&self) -> usize {
        self.pending_count.load(Ordering::Acquire)
    }

    // ===== Memory pressure =====

    pub(crate) fn add_pressure(&self, bytes: u64) -> u64 {
        self.memory_pressure.fetch_add(bytes, Ordering::Relaxed) + bytes
    }

    /// Subtract pressure, saturating at zero
    pub(crate) fn remove_pressure(&self, bytes: u64) -> u64 {
        let previous = self
            .memory_pressure
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |p| Some(p.saturating_sub(bytes)))
            .unwrap_or(0);
        previous.saturating_sub(bytes)
    }

    pub fn memory_pressure(&self) -> u64 {
        self.memory_pressure.load(Ordering::Relaxed)
    }

    // ===== Configuration =====

    pub fn config(&self) -> CollectorConfig {
        self.config.read().clone()
    }

    pub(crate) fn update_config(&self, f: impl FnOnce(&mut CollectorConfig)) {
        f(&mut self.config.write());
    }

    pub fn concurrent(&self) -> bool {
        self.config.read().concurrent
    }

    pub fn logging(&self) -> bool {
        self.config.read().logging
    }

    pub fn heap_limit(&self) -> Option<usize> {
        self.config.read().heap_limit
    }
}

impl std::fmt::Debug for Heap {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Heap")
            .field("live_objects", &self.live_objects())
            .field("live_bytes", &self.live_bytes())
            .field("candidates", &self.candidate_count())
            .field("pending_finalizers", &self.pending_finalizers())
            .finish()
    }
}

/// A traced object pinned for the duration of a collection.
///
/// Holds one strong reference, released on drop. Dropping the pin of an
/// object whose cycle was broken destroys it.
pub struct HeapObject {
    block: NonNull<ControlBlock>,
}

// Safety: managed objects are Send + Sync by construction
unsafe impl Send for HeapObject {}
unsafe impl Sync for HeapObject {}

impl HeapObject {
    #[inline]
    fn block(&self) -> &ControlBlock {
        // SAFETY: the pin keeps the block alive
        unsafe { self.block.as_ref() }
    }

    pub fn id(&self) -> ObjectId {
        ObjectId::of(self.block)
    }

    pub fn type_name(&self) -> &'static str {
        self.block().type_name()
    }

    /// Strong count, including this pin
    pub fn strong_count(&self) -> usize {
        self.block().strong_count()
    }

    pub fn generation(&self) -> usize {
        self.block().generation()
    }

    /// Survived a pass: lift any condemnation and move up a generation
    pub fn promote(&self) {
        let block = self.block();
        block.pardon();
        block.promote();
    }

    /// Refuse weak upgrades, then read the strong count (pin included)
    pub fn condemn(&self) -> usize {
        self.block().condemn()
    }

    /// Lift a condemnation and queue the object for the next pass
    pub fn pardon(&self) {
        let block = self.block();
        block.pardon();
        block.heap().register_candidate(self.block);
    }

    /// Outgoing strong references reported by the object
    pub fn trace(&self) -> SmallVec<[ObjectId; 8]> {
        let mut tracer = Tracer::new();
        // SAFETY: pinned, so the object is alive
        unsafe { self.block().trace_object(&mut tracer) };
        tracer.into_edges()
    }

    /// Ask the object to drop its outgoing strong references
    pub fn clear_references(&self) {
        // SAFETY: pinned, so the object is alive
        unsafe { self.block().clear_object() };
    }
}

impl Drop for HeapObject {
    fn drop(&mut self) {
        // SAFETY: the pin owns one strong reference
        unsafe { ControlBlock::release_pin(self.block) };
    }
}

impl std::fmt::Debug for HeapObject {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HeapObject")
            .field("id", &self.id())
            .field("type", &self.type_name())
            .field("strong", &self.strong_count())
            .field("generation", &self.generation())
            .finish()
    }
}
