//! Stack reference - transient borrow for call parameters and locals
//!
//! Carries no count. Built from a `StrongHandle`, the borrow checker ties it
//! to the handle's scope. Built from a raw pointer, staying inside the
//! owner's lifetime is the caller's contract.

use super::collector::Collector;
use super::control::{ControlBlock, RawRef};
use super::strong::StrongHandle;
use std::fmt;
use std::marker::PhantomData;
use std::ops::Deref;
use std::ptr::NonNull;

pub struct StackRef<'a, T: ?Sized> {
    ptr: NonNull<T>,
    block: Option<NonNull<ControlBlock>>,
    _marker: PhantomData<&'a T>,
}

impl<'a, T: ?Sized> StackRef<'a, T> {
    /// Borrow a handle's object, `None` for a null handle
    pub fn from_handle(handle: &'a StrongHandle<T>) -> Option<Self> {
        handle.raw().map(|raw| Self {
            ptr: raw.ptr,
            block: Some(raw.block),
            _marker: PhantomData,
        })
    }

    /// Borrow a plain reference. Converting back to a strong handle
    /// succeeds only if the referent is a live managed object.
    pub fn from_ref(object: &'a T) -> Self {
        Self {
            ptr: NonNull::from(object),
            block: None,
            _marker: PhantomData,
        }
    }

    /// Borrow through a raw pointer, `None` for null
    ///
    /// # Safety
    /// `ptr` must be valid for reads for `'a`, and something else must keep
    /// the object alive for that long.
    pub unsafe fn from_raw(ptr: *const T) -> Option<Self> {
        NonNull::new(ptr as *mut T).map(|ptr| Self {
            ptr,
            block: None,
            _marker: PhantomData,
        })
    }

    /// The borrowed object
    #[inline]
    pub fn get(&self) -> &'a T {
        // SAFETY: the owner outlives 'a
        unsafe { &*self.ptr.as_ptr() }
    }

    #[inline]
    pub fn as_ptr(&self) -> NonNull<T> {
        self.ptr
    }

    /// Whether the control block is already known (built from a handle)
    #[inline]
    pub fn has_block(&self) -> bool {
        self.block.is_some()
    }

    /// Take a strong reference, looking the object up in the global
    /// collector when the control block is not known.
    pub fn to_strong(&self) -> Option<StrongHandle<T>> {
        self.to_strong_in(Collector::global())
    }

    /// Take a strong reference, looking the object up in `collector` when
    /// the control block is not known.
    pub fn to_strong_in(&self, collector: &Collector) -> Option<StrongHandle<T>> {
        let block = match self.block {
            Some(block) => {
                // SAFETY: the owner keeps strong >= 1, so the block is alive
                if !unsafe { ControlBlock::try_upgrade(block) } {
                    return None;
                }
                block
            }
            None => collector.heap().upgrade_address(self.ptr.cast::<()>().as_ptr() as usize)?,
        };
        // SAFETY: the strong count was incremented for the new handle
        Some(unsafe { StrongHandle::from_raw_parts(RawRef { ptr: self.ptr, block }) })
    }
}

impl<'a, T: ?Sized> Clone for StackRef<'a, T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<'a, T: ?Sized> Copy for StackRef<'a, T> {}

impl<'a, T: ?Sized> Deref for StackRef<'a, T> {
    type Target = T;

    #[inline]
    fn deref(&self) -> &T {
        self.get()
    }
}

impl<'a, T: ?Sized> From<&'a T> for StackRef<'a, T> {
    fn from(object: &'a T) -> Self {
        Self::from_ref(object)
    }
}

impl<'a, T: ?Sized + fmt::Debug> fmt::Debug for StackRef<'a, T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("StackRef").field(&self.get()).finish()
    }
}

// Behaves like &'a T, plus Send for the object since to_strong can hand out
// an owning handle on another thread
unsafe impl<'a, T: ?Sized + Send + Sync> Send for StackRef<'a, T> {}
unsafe impl<'a, T: ?Sized + Send + Sync> Sync for StackRef<'a, T> {}
