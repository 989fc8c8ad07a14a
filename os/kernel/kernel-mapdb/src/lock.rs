//! # Frame Lock
//!
//! The per-frame spinlock. Holders never sleep and never take a lock of a
//! coarser level while holding a finer one; frames are always locked top-down
//! along the page hierarchy.
//!
//! A [`Frame`](crate::Frame) keeps its top-level frame locked for as long as
//! it lives, so everything nested below one top-level frame is serialized by
//! that lock. The locks of nested frames are still taken, in top-down order,
//! whenever a nested frame is touched; they do not add exclusion of their own.

use core::{
    cell::UnsafeCell,
    fmt,
    hint::spin_loop,
    ops::{Deref, DerefMut},
    sync::atomic::{AtomicBool, Ordering},
};

/// Test-and-test-and-set spinlock guarding the state of one physical frame.
pub struct FrameLock<T> {
    /// * `false`: unlocked
    /// * `true`: locked
    locked: AtomicBool,
    inner: UnsafeCell<T>,
}

// Safety: mutual exclusion; only T: Send may cross CPUs.
unsafe impl<T: Send> Sync for FrameLock<T> {}

impl<T> FrameLock<T> {
    pub const fn new(inner: T) -> Self {
        Self {
            locked: AtomicBool::new(false),
            inner: UnsafeCell::new(inner),
        }
    }

    #[inline]
    fn try_acquire(&self) -> bool {
        self.locked
            .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
    }

    /// Try once; returns immediately.
    #[inline]
    pub fn try_lock(&self) -> Option<FrameGuard<'_, T>> {
        self.try_acquire().then_some(FrameGuard { lock: self })
    }

    /// Spin until acquired, then return a guard.
    #[inline]
    pub fn lock(&self) -> FrameGuard<'_, T> {
        while !self.try_acquire() {
            // Wait on a plain load so contenders don't bounce the cache line.
            while self.locked.load(Ordering::Relaxed) {
                spin_loop();
            }
        }
        FrameGuard { lock: self }
    }

    #[inline]
    pub fn with_lock<R>(&self, f: impl FnOnce(&mut T) -> R) -> R {
        let mut g = self.lock();
        f(&mut g)
    }

    /// Snapshot of the lock word; only meaningful for diagnostics.
    #[inline]
    pub fn is_locked(&self) -> bool {
        self.locked.load(Ordering::Relaxed)
    }

    /// Mutable access when you have `&mut self` (no contention possible).
    #[inline]
    pub const fn get_mut(&mut self) -> &mut T {
        self.inner.get_mut()
    }

    #[inline]
    pub fn into_inner(self) -> T {
        self.inner.into_inner()
    }
}

impl<T: Default> Default for FrameLock<T> {
    fn default() -> Self {
        Self::new(T::default())
    }
}

impl<T> fmt::Debug for FrameLock<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FrameLock")
            .field("locked", &self.is_locked())
            .finish_non_exhaustive()
    }
}

/// RAII guard of a [`FrameLock`]; unlocks on drop, including during unwinding.
pub struct FrameGuard<'a, T> {
    lock: &'a FrameLock<T>,
}

impl<T> Deref for FrameGuard<'_, T> {
    type Target = T;
    fn deref(&self) -> &T {
        unsafe { &*self.lock.inner.get() }
    }
}

impl<T> DerefMut for FrameGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        unsafe { &mut *self.lock.inner.get() }
    }
}

impl<T> Drop for FrameGuard<'_, T> {
    fn drop(&mut self) {
        // Release publishes the critical section.
        self.lock.locked.store(false, Ordering::Release);
    }
}
