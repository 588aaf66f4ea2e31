//! Hybrid GC - reference-counted object lifetime with a tracing cycle collector
//!
//! Objects are owned through atomically counted `StrongHandle`s and
//! destroyed on the thread that releases the last one. `WeakHandle`s observe
//! without owning, and `StackRef`s borrow for parameter passing. A
//! `Collector` reclaims reference cycles on demand, drains queued
//! finalizers, and keeps statistics.

pub mod config;
pub mod error;
pub mod gc;
pub mod logging;

// Re-export core types
pub use config::CollectorConfig;
pub use error::{GcError, GcResult};
pub use gc::{
    CollectionReport, Collector, GcStats, Managed, MemoryPressureGuard, Pool, PoolIndex, StackRef, StrongHandle,
    Tracer, WeakHandle,
};

/// Runtime initialization: logging from the environment, then the global
/// collector.
pub fn init() -> GcResult<()> {
    logging::init();
    gc::init()
}

/// Runtime cleanup: final collection and finalizer drain
pub fn cleanup() {
    gc::cleanup();
}
