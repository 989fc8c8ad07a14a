//! # Slab Quota
//!
//! Mapping trees and nested treemaps draw their backing blocks from the
//! kernel's slab allocator. The database talks to it through [`SlabQuota`],
//! which decides whether a block of a given size may be taken. A refusal
//! becomes [`MapdbError::OutOfMemory`](crate::MapdbError::OutOfMemory) at the
//! caller instead of a panic.

use core::sync::atomic::{AtomicUsize, Ordering};

/// Budget for mapping-database storage.
///
/// Implementations must be cheap and non-blocking; they are called with a
/// frame lock held.
pub trait SlabQuota: Sync {
    /// Tries to charge `bytes`. Returns `false` if the budget is exhausted.
    fn reserve(&self, bytes: usize) -> bool;

    /// Returns `bytes` previously charged with [`reserve`](Self::reserve).
    fn release(&self, bytes: usize);
}

/// A quota that never refuses.
#[derive(Debug, Default, Copy, Clone)]
pub struct Unlimited;

impl SlabQuota for Unlimited {
    #[inline]
    fn reserve(&self, _bytes: usize) -> bool {
        true
    }

    #[inline]
    fn release(&self, _bytes: usize) {}
}

/// Shared instance used by [`Mapdb::new`](crate::Mapdb::new).
pub static UNLIMITED: Unlimited = Unlimited;

/// A quota with a fixed byte limit.
///
/// ### Example
/// ```rust
/// # use kernel_mapdb::{BoundedQuota, SlabQuota};
/// let q = BoundedQuota::new(100);
/// assert!(q.reserve(60));
/// assert!(!q.reserve(60));
/// q.release(60);
/// assert_eq!(q.used(), 0);
/// ```
#[derive(Debug)]
pub struct BoundedQuota {
    limit: AtomicUsize,
    used: AtomicUsize,
}

impl BoundedQuota {
    #[must_use]
    pub const fn new(limit: usize) -> Self {
        Self {
            limit: AtomicUsize::new(limit),
            used: AtomicUsize::new(0),
        }
    }

    /// Bytes currently charged.
    #[inline]
    pub fn used(&self) -> usize {
        self.used.load(Ordering::Acquire)
    }

    #[inline]
    pub fn limit(&self) -> usize {
        self.limit.load(Ordering::Acquire)
    }

    /// Changes the limit. Existing charges stay in place even above it.
    #[inline]
    pub fn set_limit(&self, limit: usize) {
        self.limit.store(limit, Ordering::Release);
    }
}

impl SlabQuota for BoundedQuota {
    fn reserve(&self, bytes: usize) -> bool {
        let limit = self.limit();
        self.used
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |used| {
                used.checked_add(bytes).filter(|&total| total <= limit)
            })
            .is_ok()
    }

    fn release(&self, bytes: usize) {
        let prev = self.used.fetch_sub(bytes, Ordering::AcqRel);
        debug_assert!(prev >= bytes, "quota released more than it reserved");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bounded_quota_enforces_limit() {
        let q = BoundedQuota::new(64);
        assert!(q.reserve(32));
        assert!(q.reserve(32));
        assert!(!q.reserve(1));
        q.release(16);
        assert!(q.reserve(16));
        assert_eq!(q.used(), 64);
    }

    #[test]
    fn raising_the_limit_admits_more() {
        let q = BoundedQuota::new(0);
        assert!(!q.reserve(8));
        q.set_limit(8);
        assert!(q.reserve(8));
    }
}
