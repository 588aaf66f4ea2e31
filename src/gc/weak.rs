//! Weak handle - non-owning observer of a managed object
//!
//! A weak handle keeps the control block alive but never the object. It is
//! never dereferenced directly: `lock` first takes a strong reference, and
//! refuses to do so once the strong count has reached zero.

use super::control::{ControlBlock, RawRef};
use super::strong::StrongHandle;
use crate::error::{GcError, GcResult};
use std::fmt;
use std::marker::PhantomData;

pub struct WeakHandle<T: ?Sized> {
    raw: Option<RawRef<T>>,
    _marker: PhantomData<T>,
}

impl<T: ?Sized> WeakHandle<T> {
    /// A weak handle that observes nothing. Always expired.
    #[inline]
    pub const fn new() -> Self {
        Self {
            raw: None,
            _marker: PhantomData,
        }
    }

    /// Observe the object referenced by `strong` (increments the weak count)
    pub fn from_strong(strong: &StrongHandle<T>) -> Self {
        let raw = strong.raw();
        if let Some(raw) = raw {
            // SAFETY: strong >= 1 keeps the block alive
            unsafe { raw.block.as_ref() }.add_weak_ref();
        }
        Self {
            raw,
            _marker: PhantomData,
        }
    }

    #[inline]
    fn block(&self) -> Option<&ControlBlock> {
        // SAFETY: our weak reference keeps the block alive
        self.raw.map(|raw| unsafe { &*raw.block.as_ptr() })
    }

    /// Upgrade to a strong handle, or a null handle if the object is gone.
    ///
    /// The strong count is incremented with a compare-and-swap that refuses
    /// the 0 -> 1 transition, so a concurrent last release always wins and
    /// the result never points at a destroyed object. An object a running
    /// collection has already judged unreachable also yields a null handle.
    pub fn lock(&self) -> StrongHandle<T> {
        match self.raw {
            Some(raw) => {
                // SAFETY: our weak reference keeps the block alive
                let block = unsafe { raw.block.as_ref() };
                // SAFETY: as above, and no lock is held here
                if !block.is_expired() && unsafe { ControlBlock::try_upgrade(raw.block) } {
                    // SAFETY: strong count incremented on behalf of the new handle
                    unsafe { StrongHandle::from_raw_parts(raw) }
                } else {
                    StrongHandle::null()
                }
            }
            None => StrongHandle::null(),
        }
    }

    /// `lock` returning `None` instead of a null handle
    #[inline]
    pub fn upgrade(&self) -> Option<StrongHandle<T>> {
        let strong = self.lock();
        (!strong.is_null()).then_some(strong)
    }

    /// `lock` reporting a null or expired handle as an error
    pub fn try_upgrade(&self) -> GcResult<StrongHandle<T>> {
        if self.raw.is_none() {
            return Err(GcError::NullHandle);
        }
        self.upgrade().ok_or(GcError::Expired)
    }

    /// True if the handle is null or its object has been destroyed
    #[inline]
    pub fn expired(&self) -> bool {
        self.block().map_or(true, ControlBlock::is_expired)
    }

    /// Current strong count, 0 once expired. Informational only.
    #[inline]
    pub fn use_count(&self) -> usize {
        match self.block() {
            Some(block) if !block.is_expired() => block.strong_count(),
            _ => 0,
        }
    }

    /// Current number of weak handles sharing the block. Informational only.
    #[inline]
    pub fn weak_count(&self) -> usize {
        self.block().map_or(0, ControlBlock::weak_count)
    }

    /// Whether both handles observe the same control block
    #[inline]
    pub fn ptr_eq<U: ?Sized>(&self, other: &WeakHandle<U>) -> bool {
        match (self.raw, other.raw) {
            (Some(a), Some(b)) => a.block == b.block,
            (None, None) => true,
            _ => false,
        }
    }

    /// Drop the observation and become null
    pub fn reset(&mut self) {
        if let Some(raw) = self.raw.take() {
            // SAFETY: this handle owned one weak reference
            unsafe { ControlBlock::release_weak_ref(raw.block) };
        }
    }
}

impl<T: ?Sized> Clone for WeakHandle<T> {
    fn clone(&self) -> Self {
        if let Some(block) = self.block() {
            block.add_weak_ref();
        }
        Self {
            raw: self.raw,
            _marker: PhantomData,
        }
    }
}

impl<T: ?Sized> Drop for WeakHandle<T> {
    fn drop(&mut self) {
        self.reset();
    }
}

impl<T: ?Sized> Default for WeakHandle<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: ?Sized> From<&StrongHandle<T>> for WeakHandle<T> {
    fn from(strong: &StrongHandle<T>) -> Self {
        Self::from_strong(strong)
    }
}

impl<T: ?Sized> fmt::Debug for WeakHandle<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "(WeakHandle)")
    }
}

// Same bounds as StrongHandle: a weak handle can be upgraded on any thread
unsafe impl<T: ?Sized + Send + Sync> Send for WeakHandle<T> {}
unsafe impl<T: ?Sized + Send + Sync> Sync for WeakHandle<T> {}
