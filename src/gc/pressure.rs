//! RAII memory pressure tracking
//!
//! Managed objects that own large unmanaged buffers report them so the
//! collector's statistics reflect the real footprint.

use super::collector::Collector;
use super::heap::Heap;
use crate::logging::trace;
use std::sync::Arc;

/// Reports `amount` bytes of unmanaged memory while alive.
///
/// ```ignore
/// struct Image {
///     pixels: Vec<u8>,
///     _pressure: MemoryPressureGuard,
/// }
///
/// let pixels = vec![0u8; 4 << 20];
/// let guard = MemoryPressureGuard::new(collector, pixels.len() as u64);
/// ```
pub struct MemoryPressureGuard {
    heap: Arc<Heap>,
    amount: u64,
}

impl MemoryPressureGuard {
    /// Start tracking `amount` bytes on `collector`
    pub fn new(collector: &Collector, amount: u64) -> Self {
        let heap = Arc::clone(collector.heap());
        if amount != 0 {
            heap.add_pressure(amount);
        }
        Self { heap, amount }
    }

    /// Guard on the global collector
    pub fn global(amount: u64) -> Self {
        Self::new(Collector::global(), amount)
    }

    /// Grow or shrink the tracked amount by `delta` bytes
    pub fn adjust(&mut self, delta: i64) {
        let target = if delta >= 0 {
            self.amount.saturating_add(delta as u64)
        } else {
            self.amount.saturating_sub(delta.unsigned_abs())
        };
        self.set(target);
    }

    /// Replace the tracked amount
    pub fn set(&mut self, amount: u64) {
        if amount > self.amount {
            self.heap.add_pressure(amount - self.amount);
        } else if amount < self.amount {
            self.heap.remove_pressure(self.amount - amount);
        }
        trace!(from = self.amount, to = amount, "Memory pressure adjusted");
        self.amount = amount;
    }

    #[inline]
    pub fn amount(&self) -> u64 {
        self.amount
    }
}

impl Drop for MemoryPressureGuard {
    fn drop(&mut self) {
        if self.amount != 0 {
            self.heap.remove_pressure(self.amount);
        }
    }
}

impl std::fmt::Debug for MemoryPressureGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryPressureGuard")
            .field("amount", &self.amount)
            .finish()
    }
}
