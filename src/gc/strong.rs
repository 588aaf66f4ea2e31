//! Strong handle - owning reference to a managed object
//!
//! Optimized for minimal overhead:
//! - Cloning is a single relaxed increment
//! - Deterministic destruction on the last release
//! - Thread-safe atomic refcounting for concurrent access
//!
//! Handles may be null (`Default`, `take`, `reset`). Dereferencing a null
//! handle is a checked failure: `Deref` panics with a clear message, and
//! `get` / `try_get` report it without panicking.

use super::control::{ControlBlock, RawRef};
use super::hooks::ObjectId;
use super::stack_ref::StackRef;
use super::weak::WeakHandle;
use crate::error::{GcError, GcResult};
use std::any::Any;
use std::fmt;
use std::marker::PhantomData;
use std::ops::Deref;
use std::ptr::NonNull;

/// Owning reference with deterministic destruction
pub struct StrongHandle<T: ?Sized> {
    raw: Option<RawRef<T>>,
    _marker: PhantomData<T>,
}

impl<T: ?Sized> StrongHandle<T> {
    /// A handle that references nothing
    #[inline]
    pub const fn null() -> Self {
        Self {
            raw: None,
            _marker: PhantomData,
        }
    }

    /// Wrap a strong reference the caller already owns
    ///
    /// # Safety
    /// `raw.block` must have had its strong count incremented on behalf of
    /// the returned handle, and `raw.ptr` must point at the block's object.
    #[inline]
    pub(crate) unsafe fn from_raw_parts(raw: RawRef<T>) -> Self {
        Self {
            raw: Some(raw),
            _marker: PhantomData,
        }
    }

    #[inline]
    pub(crate) fn raw(&self) -> Option<RawRef<T>> {
        self.raw
    }

    #[inline]
    fn block(&self) -> Option<&ControlBlock> {
        // SAFETY: a non-null handle keeps strong >= 1, so the block is alive
        self.raw.map(|raw| unsafe { &*raw.block.as_ptr() })
    }

    #[inline]
    pub fn is_null(&self) -> bool {
        self.raw.is_none()
    }

    /// Borrow the object, `None` for a null handle
    #[inline]
    pub fn get(&self) -> Option<&T> {
        // SAFETY: strong >= 1 keeps the object alive for the borrow
        self.raw.map(|raw| unsafe { &*raw.ptr.as_ptr() })
    }

    /// Mutable access when this is the only handle of any kind.
    ///
    /// Traced objects never qualify, since a collection may trace them
    /// at any time.
    pub fn get_mut(this: &mut Self) -> Option<&mut T> {
        let raw = this.raw?;
        // SAFETY: non-null, so the block is alive
        if unsafe { raw.block.as_ref() }.is_unique() {
            // SAFETY: no other handle can reach the object while we hold
            // the only one mutably
            Some(unsafe { &mut *raw.ptr.as_ptr() })
        } else {
            None
        }
    }

    /// Borrow the object, reporting a null handle as an error
    #[inline]
    pub fn try_get(&self) -> GcResult<&T> {
        self.get().ok_or(GcError::NullHandle)
    }

    /// Current strong count, 0 when null. Informational only.
    #[inline]
    pub fn use_count(&self) -> usize {
        self.block().map_or(0, ControlBlock::strong_count)
    }

    /// Current number of weak handles, 0 when null. Informational only.
    #[inline]
    pub fn weak_count(&self) -> usize {
        self.block().map_or(0, ControlBlock::weak_count)
    }

    /// Weak handle sharing this object's control block
    #[inline]
    pub fn get_weak_handle(&self) -> WeakHandle<T> {
        WeakHandle::from_strong(self)
    }

    /// Alias for `get_weak_handle`
    #[inline]
    pub fn downgrade(this: &Self) -> WeakHandle<T> {
        this.get_weak_handle()
    }

    /// Non-owning borrow for parameter passing, `None` when null
    #[inline]
    pub fn as_stack_ref(&self) -> Option<StackRef<'_, T>> {
        StackRef::from_handle(self)
    }

    /// Release this reference and become null
    #[inline]
    pub fn reset(&mut self) {
        if let Some(raw) = self.raw.take() {
            // SAFETY: this handle owned one strong reference
            unsafe { ControlBlock::release_strong_ref(raw.block) };
        }
    }

    /// Move the reference out, leaving a null handle behind
    #[inline]
    pub fn take(&mut self) -> Self {
        Self {
            raw: self.raw.take(),
            _marker: PhantomData,
        }
    }

    /// Whether both handles reference the same object. Two null handles
    /// are equal.
    #[inline]
    pub fn ptr_eq<U: ?Sized>(&self, other: &StrongHandle<U>) -> bool {
        self.object_id() == other.object_id()
    }

    #[inline]
    pub fn object_id(&self) -> Option<ObjectId> {
        self.raw.map(|raw| ObjectId::of(raw.block))
    }

    /// Raw object pointer, `None` when null
    #[inline]
    pub fn as_non_null(&self) -> Option<NonNull<T>> {
        self.raw.map(|raw| raw.ptr)
    }

    /// Finalizer suppression flag of the referenced object
    #[inline]
    pub fn is_finalize_suppressed(&self) -> bool {
        self.block().map_or(false, ControlBlock::is_finalize_suppressed)
    }

    /// Synthetic generation of the referenced object
    #[inline]
    pub fn generation(&self) -> Option<usize> {
        self.block().map(ControlBlock::generation)
    }

    /// Reinterpret the object pointer, taking a new strong reference.
    ///
    /// # Safety
    /// `f` must return a pointer to the same object (an unsizing coercion or
    /// an upcast to a trait it implements). Use the `upcast!` macro for the
    /// safe case.
    pub unsafe fn cast_unchecked<U: ?Sized>(&self, f: impl FnOnce(NonNull<T>) -> NonNull<U>) -> StrongHandle<U> {
        match self.raw {
            Some(raw) => {
                // SAFETY: block alive while self is non-null
                raw.block.as_ref().add_strong_ref();
                StrongHandle::from_raw_parts(RawRef {
                    ptr: f(raw.ptr),
                    block: raw.block,
                })
            }
            None => StrongHandle::null(),
        }
    }

    pub(crate) fn set_finalize_suppressed(&self, suppressed: bool) {
        if let Some(block) = self.block() {
            block.set_finalize_suppressed(suppressed);
        }
    }
}

impl<T: ?Sized> StrongHandle<T> {
    /// Consume the handle, keeping its strong reference alive.
    ///
    /// Pair with `from_raw` to rebuild the handle.
    pub fn into_raw(self) -> Option<(NonNull<T>, NonNull<ControlBlock>)> {
        let raw = self.raw;
        std::mem::forget(self);
        raw.map(|raw| (raw.ptr, raw.block))
    }

    /// Rebuild a handle from `into_raw` output without touching counts
    ///
    /// # Safety
    /// The pair must come from `into_raw` and be used at most once.
    pub unsafe fn from_raw(ptr: NonNull<T>, block: NonNull<ControlBlock>) -> Self {
        Self::from_raw_parts(RawRef { ptr, block })
    }
}

impl<T: Any + Send + Sync> StrongHandle<T> {
    /// Static upcast to a type-erased handle. The count is unchanged.
    pub fn into_any(self) -> StrongHandle<dyn Any + Send + Sync> {
        let raw = self.raw;
        std::mem::forget(self);
        match raw {
            Some(raw) => {
                let ptr: NonNull<dyn Any + Send + Sync> = raw.ptr;
                // SAFETY: ownership of the strong reference moves over
                unsafe { StrongHandle::from_raw_parts(RawRef { ptr, block: raw.block }) }
            }
            None => StrongHandle::null(),
        }
    }
}

impl StrongHandle<dyn Any + Send + Sync> {
    /// Dynamic downcast. On success the strong count is incremented; on
    /// failure (or a null handle) no count is touched.
    pub fn downcast<U: Any + Send + Sync>(&self) -> Option<StrongHandle<U>> {
        let raw = self.raw?;
        if !self.get()?.is::<U>() {
            return None;
        }
        // SAFETY: the type check above guarantees the pointee is a U
        unsafe {
            raw.block.as_ref().add_strong_ref();
            Some(StrongHandle::from_raw_parts(RawRef {
                ptr: raw.ptr.cast::<U>(),
                block: raw.block,
            }))
        }
    }

    /// Whether the object is a `U`
    pub fn is<U: Any>(&self) -> bool {
        self.get().map_or(false, |object| object.is::<U>())
    }
}

/// Upcast a handle to a trait object, taking a new strong reference.
///
/// ```ignore
/// let shape: StrongHandle<dyn Shape + Send + Sync> = upcast!(circle => dyn Shape + Send + Sync);
/// ```
#[macro_export]
macro_rules! upcast {
    ($handle:expr => $target:ty) => {{
        // SAFETY: an unsizing coercion keeps the object address
        unsafe {
            $handle.cast_unchecked(|ptr| -> ::core::ptr::NonNull<$target> { ptr })
        }
    }};
}

impl<T: ?Sized> Clone for StrongHandle<T> {
    #[inline]
    fn clone(&self) -> Self {
        if let Some(block) = self.block() {
            block.add_strong_ref();
        }
        Self {
            raw: self.raw,
            _marker: PhantomData,
        }
    }
}

impl<T: ?Sized> Drop for StrongHandle<T> {
    #[inline]
    fn drop(&mut self) {
        self.reset();
    }
}

impl<T: ?Sized> Default for StrongHandle<T> {
    fn default() -> Self {
        Self::null()
    }
}

impl<T: ?Sized> Deref for StrongHandle<T> {
    type Target = T;

    #[inline]
    fn deref(&self) -> &T {
        match self.get() {
            Some(object) => object,
            None => panic!("dereferenced a null StrongHandle"),
        }
    }
}

impl<T: ?Sized + fmt::Debug> fmt::Debug for StrongHandle<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.get() {
            Some(object) => f.debug_tuple("StrongHandle").field(&object).finish(),
            None => f.write_str("StrongHandle(null)"),
        }
    }
}

impl<T: ?Sized> fmt::Pointer for StrongHandle<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.raw {
            Some(raw) => fmt::Pointer::fmt(&raw.ptr, f),
            None => f.write_str("0x0"),
        }
    }
}

// StrongHandle is thread-safe with atomic refcounting
unsafe impl<T: ?Sized + Send + Sync> Send for StrongHandle<T> {}
unsafe impl<T: ?Sized + Send + Sync> Sync for StrongHandle<T> {}
