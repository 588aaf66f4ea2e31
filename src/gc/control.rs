//! Control block - per-object bookkeeping shared by every handle
//!
//! Layout: the managed object lives in its own allocation; the control
//! block sits in a second allocation that outlives the object for as long
//! as weak handles observe it.
//!
//! Count protocol (same scheme as `std::sync::Arc`):
//! - `strong` counts StrongHandles (and collector pins).
//! - `weak` counts WeakHandles plus one implicit reference held jointly by
//!   all strong references. The implicit reference is released after the
//!   object is destroyed, so whichever release takes `weak` to zero frees
//!   the block, and it happens exactly once.
//!
//! A sweep that judges an object unreachable condemns it before breaking
//! its cycle. Upgrades from weak handles or addresses check the mark after
//! incrementing and give the reference back if they lost that race.

use super::heap::Heap;
use super::hooks::{Managed, Tracer};
use crate::logging::{log_deallocation, log_finalizer_failure, trace};
use std::alloc::{alloc, dealloc, Layout};
use std::any::Any;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::ptr::{self, NonNull};
use std::sync::atomic::{fence, AtomicBool, AtomicPtr, AtomicU8, AtomicUsize, Ordering};
use std::sync::Arc;

/// Counts above this abort the process rather than risk wrap-around.
const MAX_REFCOUNT: usize = isize::MAX as usize;

/// Highest synthetic generation an object can be promoted to.
pub const MAX_GENERATION: usize = 2;

/// Type metadata - erased per-type behavior captured at allocation
#[derive(Clone, Copy)]
pub(crate) struct TypeInfo {
    pub type_name: &'static str,
    pub layout: Layout,
    pub drop: unsafe fn(*mut ()),
    pub finalize: Option<unsafe fn(*mut ())>,
    pub on_destroy: Option<unsafe fn(*mut ())>,
    pub trace: Option<unsafe fn(*const (), &mut Tracer)>,
    pub clear: Option<unsafe fn(*const ())>,
}

impl TypeInfo {
    /// Type info for objects without hooks
    pub fn plain<T: Send + Sync + 'static>() -> Self {
        Self {
            type_name: std::any::type_name::<T>(),
            layout: Layout::new::<T>(),
            drop: drop_value::<T>,
            finalize: None,
            on_destroy: None,
            trace: None,
            clear: None,
        }
    }

    /// Type info wired to the `Managed` hooks
    pub fn managed<T: Managed>() -> Self {
        let (trace, clear) = if T::TRACED {
            (
                Some(trace_value::<T> as unsafe fn(*const (), &mut Tracer)),
                Some(clear_value::<T> as unsafe fn(*const ())),
            )
        } else {
            (None, None)
        };

        Self {
            finalize: Some(finalize_value::<T>),
            on_destroy: Some(on_destroy_value::<T>),
            trace,
            clear,
            ..Self::plain::<T>()
        }
    }
}

unsafe fn drop_value<T>(ptr: *mut ()) {
    ptr::drop_in_place(ptr as *mut T);
}

unsafe fn finalize_value<T: Managed>(ptr: *mut ()) {
    (*(ptr as *mut T)).finalize();
}

unsafe fn on_destroy_value<T: Managed>(ptr: *mut ()) {
    (*(ptr as *mut T)).on_destroy();
}

unsafe fn trace_value<T: Managed>(ptr: *const (), tracer: &mut Tracer) {
    (*(ptr as *const T)).trace(tracer);
}

unsafe fn clear_value<T: Managed>(ptr: *const ()) {
    (*(ptr as *const T)).clear_references();
}

/// Allocate uninitialized storage for one `T`
///
/// Zero-sized types get a dangling pointer and are never deallocated.
pub(crate) fn alloc_object<T>() -> Option<NonNull<T>> {
    let layout = Layout::new::<T>();
    if layout.size() == 0 {
        return Some(NonNull::dangling());
    }
    // SAFETY: layout has non-zero size
    NonNull::new(unsafe { alloc(layout) } as *mut T)
}

/// Release object storage obtained from `alloc_object` or a `Box`
pub(crate) unsafe fn dealloc_object(ptr: *mut (), layout: Layout) {
    if layout.size() != 0 {
        dealloc(ptr as *mut u8, layout);
    }
}

/// Object pointer paired with its control block
pub(crate) struct RawRef<T: ?Sized> {
    pub ptr: NonNull<T>,
    pub block: NonNull<ControlBlock>,
}

impl<T: ?Sized> Clone for RawRef<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T: ?Sized> Copy for RawRef<T> {}

/// Shared bookkeeping record for one managed object
pub struct ControlBlock {
    strong: AtomicUsize,
    weak: AtomicUsize,
    destroyed: AtomicBool,
    condemned: AtomicBool,
    finalize_suppressed: AtomicBool,
    generation: AtomicU8,
    object: AtomicPtr<()>,
    info: TypeInfo,
    heap: Arc<Heap>,
}

impl ControlBlock {
    /// Allocate a block owning `object` with one strong reference.
    ///
    /// Returns `None` when the block itself cannot be allocated; the object
    /// is left untouched for the caller to dispose of.
    pub(crate) fn allocate(object: NonNull<()>, info: TypeInfo, heap: Arc<Heap>) -> Option<NonNull<Self>> {
        let layout = Layout::new::<Self>();
        // SAFETY: ControlBlock is not zero-sized
        let block = NonNull::new(unsafe { alloc(layout) } as *mut Self)?;

        // SAFETY: freshly allocated, correctly aligned for Self
        unsafe {
            block.as_ptr().write(Self {
                strong: AtomicUsize::new(1),
                weak: AtomicUsize::new(1),
                destroyed: AtomicBool::new(false),
                condemned: AtomicBool::new(false),
                finalize_suppressed: AtomicBool::new(false),
                generation: AtomicU8::new(0),
                object: AtomicPtr::new(object.as_ptr()),
                info,
                heap,
            });
        }

        Some(block)
    }

    /// Increment strong count (hot path)
    #[inline]
    pub(crate) fn add_strong_ref(&self) {
        let old = self.strong.fetch_add(1, Ordering::Relaxed);
        if old > MAX_REFCOUNT {
            std::process::abort();
        }
    }

    /// Increment strong count unless it already reached zero.
    ///
    /// A zero strong count means destruction is underway or finished, so
    /// the 0 -> 1 transition is refused.
    #[inline]
    pub(crate) fn try_add_strong_ref(&self) -> bool {
        let mut current = self.strong.load(Ordering::Relaxed);
        loop {
            if current == 0 {
                return false;
            }
            if current > MAX_REFCOUNT {
                std::process::abort();
            }
            match self.strong.compare_exchange_weak(
                current,
                current + 1,
                Ordering::SeqCst,
                Ordering::Relaxed,
            ) {
                Ok(_) => return true,
                Err(actual) => current = actual,
            }
        }
    }

    /// Take a strong reference on behalf of a weak handle or address lookup.
    ///
    /// Refused when the count already reached zero or a sweep condemned the
    /// object.
    ///
    /// # Safety
    /// The block must stay alive for the duration of the call, and the
    /// caller must not hold a lock that destroying the object would take.
    pub(crate) unsafe fn try_upgrade(this: NonNull<Self>) -> bool {
        this.as_ref().try_add_strong_ref() && !Self::abandon_if_condemned(this)
    }

    /// Give back a reference just taken by `try_add_strong_ref` if a sweep
    /// condemned the object. Returns true when the reference was given back.
    ///
    /// # Safety
    /// The caller must own the reference taken by `try_add_strong_ref`.
    pub(crate) unsafe fn abandon_if_condemned(this: NonNull<Self>) -> bool {
        if this.as_ref().condemned.load(Ordering::SeqCst) {
            Self::release_pin(this);
            true
        } else {
            false
        }
    }

    /// Refuse upgrades from now on, then read the strong count.
    ///
    /// An upgrade racing this call either shows up in the returned count or
    /// sees the mark and backs out.
    pub(crate) fn condemn(&self) -> usize {
        self.condemned.store(true, Ordering::SeqCst);
        self.strong.load(Ordering::SeqCst)
    }

    /// Lift a condemnation
    pub(crate) fn pardon(&self) {
        self.condemned.store(false, Ordering::SeqCst);
    }

    #[inline]
    pub fn is_condemned(&self) -> bool {
        self.condemned.load(Ordering::Acquire)
    }

    /// Increment weak count
    #[inline]
    pub(crate) fn add_weak_ref(&self) {
        let old = self.weak.fetch_add(1, Ordering::Relaxed);
        if old > MAX_REFCOUNT {
            std::process::abort();
        }
    }

    /// Decrement strong count, destroying the object on the 1 -> 0 transition.
    ///
    /// # Safety
    /// The caller must own one strong reference, which this call consumes.
    /// `this` may be freed by the time the call returns.
    pub(crate) unsafe fn release_strong_ref(this: NonNull<Self>) {
        let block = this.as_ref();

        // A cycle can only become garbage when a decrement leaves the count
        // above zero. The candidate is recorded after the decrement so a
        // pass that misses the decrement cannot also wipe the record. The
        // block may be freed once the decrement lands, so hold the heap.
        let heap = block.is_traced().then(|| Arc::clone(&block.heap));

        if Self::decrement(this) {
            if let Some(heap) = heap {
                heap.register_candidate(this);
            }
        }
    }

    /// Decrement strong count without recording a cycle candidate.
    ///
    /// Used for collector pins, which never change reachability.
    ///
    /// # Safety
    /// Same contract as `release_strong_ref`.
    pub(crate) unsafe fn release_pin(this: NonNull<Self>) {
        Self::decrement(this);
    }

    /// Returns true when the object outlived the decrement
    #[inline]
    unsafe fn decrement(this: NonNull<Self>) -> bool {
        let old = this.as_ref().strong.fetch_sub(1, Ordering::Release);
        debug_assert!(old > 0, "strong count underflow");

        if old != 1 {
            return true;
        }

        // Synchronize with every prior release
        fence(Ordering::Acquire);
        Self::destroy_object(this);
        Self::release_weak_ref(this);
        false
    }

    /// Decrement weak count, freeing the block when it reaches zero.
    ///
    /// # Safety
    /// The caller must own one weak reference (or the implicit one).
    pub(crate) unsafe fn release_weak_ref(this: NonNull<Self>) {
        let old = this.as_ref().weak.fetch_sub(1, Ordering::Release);
        debug_assert!(old > 0, "weak count underflow");

        if old == 1 {
            fence(Ordering::Acquire);
            Self::free(this);
        }
    }

    /// Destroy the managed object (cold path)
    #[cold]
    #[inline(never)]
    unsafe fn destroy_object(this: NonNull<Self>) {
        let block = this.as_ref();

        // Observers must see the object as dead before any hook runs
        block.destroyed.store(true, Ordering::Release);
        let object = block.object.swap(ptr::null_mut(), Ordering::AcqRel);
        debug_assert!(!object.is_null(), "object destroyed twice");

        block.heap.unregister(object as usize, this);

        let info = block.info;
        if let Some(finalize) = info.finalize {
            if !block.finalize_suppressed.load(Ordering::Acquire) {
                block.run_hook("finalize", || finalize(object));
            }
        }
        if let Some(on_destroy) = info.on_destroy {
            block.run_hook("on_destroy", || on_destroy(object));
        }
        block.run_hook("drop", || (info.drop)(object));
        dealloc_object(object, info.layout);

        log_deallocation(info.type_name, info.layout.size(), object);
        block.heap.record_deallocation(info.layout.size());
    }

    /// Run a hook, swallowing any panic it raises.
    fn run_hook(&self, hook: &str, f: impl FnOnce()) {
        if let Err(payload) = catch_unwind(AssertUnwindSafe(f)) {
            let message = panic_message(payload.as_ref());
            log_finalizer_failure(hook, self.info.type_name, &message);
            self.heap.record_finalizer_failure();
        }
    }

    /// Free the block itself (cold path)
    #[cold]
    unsafe fn free(this: NonNull<Self>) {
        trace!(event = "control_block_free", address = ?this.as_ptr());
        let heap = Arc::clone(&this.as_ref().heap);
        ptr::drop_in_place(this.as_ptr());
        dealloc(this.as_ptr() as *mut u8, Layout::new::<Self>());
        heap.record_block_freed();
    }

    /// True once the strong count has reached zero
    #[inline]
    pub fn is_expired(&self) -> bool {
        self.destroyed.load(Ordering::Acquire) || self.strong.load(Ordering::Acquire) == 0
    }

    /// Object address, or null once expired.
    ///
    /// Only meaningful to dereference while holding a strong reference.
    #[inline]
    pub fn get_object(&self) -> *mut () {
        if self.is_expired() {
            ptr::null_mut()
        } else {
            self.object.load(Ordering::Acquire)
        }
    }

    /// Current strong count (informational, racy)
    #[inline]
    pub fn strong_count(&self) -> usize {
        self.strong.load(Ordering::Acquire)
    }

    /// Current number of weak handles (informational, racy)
    #[inline]
    pub fn weak_count(&self) -> usize {
        let weak = self.weak.load(Ordering::Acquire);
        if self.destroyed.load(Ordering::Acquire) {
            weak
        } else {
            weak.saturating_sub(1)
        }
    }

    /// Sole owner: one strong reference, no weak handles, and never pinned
    /// by a collection.
    #[inline]
    pub(crate) fn is_unique(&self) -> bool {
        !self.is_traced()
            && self.strong.load(Ordering::Acquire) == 1
            && self.weak.load(Ordering::Acquire) == 1
    }

    #[inline]
    pub fn is_finalize_suppressed(&self) -> bool {
        self.finalize_suppressed.load(Ordering::Acquire)
    }

    #[inline]
    pub(crate) fn set_finalize_suppressed(&self, suppressed: bool) {
        self.finalize_suppressed.store(suppressed, Ordering::Release);
    }

    #[inline]
    pub fn generation(&self) -> usize {
        self.generation.load(Ordering::Relaxed) as usize
    }

    /// Move to the next generation after surviving a collection
    pub(crate) fn promote(&self) {
        let _ = self.generation.fetch_update(Ordering::Relaxed, Ordering::Relaxed, |g| {
            ((g as usize) < MAX_GENERATION).then_some(g + 1)
        });
    }

    #[inline]
    pub fn type_name(&self) -> &'static str {
        self.info.type_name
    }

    #[inline]
    pub fn size(&self) -> usize {
        self.info.layout.size()
    }

    #[inline]
    pub(crate) fn is_traced(&self) -> bool {
        self.info.trace.is_some()
    }

    /// Report outgoing references. Caller must hold a strong reference.
    pub(crate) unsafe fn trace_object(&self, tracer: &mut Tracer) {
        if let Some(trace_fn) = self.info.trace {
            let object = self.object.load(Ordering::Acquire);
            if !object.is_null() {
                trace_fn(object, tracer);
            }
        }
    }

    /// Drop outgoing references. Caller must hold a strong reference.
    pub(crate) unsafe fn clear_object(&self) {
        if let Some(clear_fn) = self.info.clear {
            let object = self.object.load(Ordering::Acquire);
            if !object.is_null() {
                self.run_hook("clear_references", || clear_fn(object));
            }
        }
    }

    #[inline]
    pub(crate) fn heap(&self) -> &Arc<Heap> {
        &self.heap
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
