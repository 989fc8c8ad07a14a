//! # Mapping Tree
//!
//! The derivation tree of one physical frame at one granularity, stored as a
//! preorder-packed array.
//!
//! ## Layout
//!
//! ```text
//! index:  0      1      2      3      4      5
//! depth:  0      1      2      2      1      2
//!         root ─┬─ A ─┬─ B
//!               │     └─ C
//!               └─ D ─── E
//! ```
//!
//! A node's descendants occupy the indices right after it, up to (excluding)
//! the first later node whose depth is not greater than its own. Removing a
//! subtree is therefore a single range drain, and inserting a child means
//! placing it at the end of the parent's range, which keeps siblings in
//! insertion order.
//!
//! ## Storage
//!
//! Capacity moves in power-of-two size classes between [`MIN_CAPACITY`] and
//! [`MAX_CAPACITY`] nodes. Each class change charges the new block to the
//! [`SlabQuota`] and moves the nodes in order before the old block is given
//! back, so a failed resize leaves the tree untouched.

use crate::error::MapdbError;
use crate::mapping::Mapping;
use crate::quota::SlabQuota;
use crate::space::SpaceId;
use alloc::vec::Vec;
use core::fmt;

/// Smallest block, in nodes.
pub const MIN_CAPACITY: usize = 4;

/// Largest block, in nodes; a full tree rejects further derivations.
pub const MAX_CAPACITY: usize = 2048;

const _: () = {
    assert!(MIN_CAPACITY.is_power_of_two());
    assert!(MAX_CAPACITY.is_power_of_two());
    assert!(MIN_CAPACITY <= MAX_CAPACITY);
};

/// Bytes charged for a block of `capacity` nodes.
#[inline]
#[must_use]
pub const fn block_bytes(capacity: usize) -> usize {
    capacity * size_of::<Mapping>()
}

pub struct MappingTree {
    nodes: Vec<Mapping>,
    /// Size class currently charged to `quota`.
    capacity: usize,
    quota: &'static dyn SlabQuota,
}

impl MappingTree {
    /// Creates a tree holding only its root, the frame's original owner.
    ///
    /// # Errors
    /// [`MapdbError::OutOfMemory`] if the first block cannot be obtained.
    pub(crate) fn with_root(
        space: SpaceId,
        page: u64,
        quota: &'static dyn SlabQuota,
    ) -> Result<Self, MapdbError> {
        let nodes = alloc_block(quota, MIN_CAPACITY)?;
        let mut tree = Self {
            nodes,
            capacity: MIN_CAPACITY,
            quota,
        };
        tree.nodes.push(Mapping::new(space, page, 0));
        Ok(tree)
    }

    /// Number of nodes, root included.
    #[inline]
    #[must_use]
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Size class of the backing block, in nodes.
    #[inline]
    #[must_use]
    pub const fn capacity(&self) -> usize {
        self.capacity
    }

    #[inline]
    #[must_use]
    pub fn root(&self) -> Option<&Mapping> {
        self.nodes.first()
    }

    #[inline]
    #[must_use]
    pub fn get(&self, index: usize) -> Option<&Mapping> {
        self.nodes.get(index)
    }

    #[inline]
    pub(crate) fn get_mut(&mut self, index: usize) -> Option<&mut Mapping> {
        self.nodes.get_mut(index)
    }

    /// Nodes in preorder.
    #[inline]
    #[must_use]
    pub fn nodes(&self) -> &[Mapping] {
        &self.nodes
    }

    #[inline]
    pub(crate) fn nodes_mut(&mut self) -> &mut [Mapping] {
        &mut self.nodes
    }

    /// Index of the node of `space` at virtual page `page`.
    #[must_use]
    pub fn find(&self, space: SpaceId, page: u64) -> Option<usize> {
        self.nodes
            .iter()
            .position(|m| m.space() == space && m.page() == page)
    }

    /// One past the last descendant of `index`.
    #[must_use]
    pub fn subtree_end(&self, index: usize) -> usize {
        let Some(node) = self.nodes.get(index) else {
            return self.nodes.len();
        };
        let depth = node.depth();
        self.nodes[index + 1..]
            .iter()
            .position(|m| m.depth() <= depth)
            .map_or(self.nodes.len(), |off| index + 1 + off)
    }

    /// Appends a child of `parent` after its last descendant.
    ///
    /// # Errors
    /// - [`MapdbError::DepthExceeded`] if `parent` sits at the maximum depth.
    /// - [`MapdbError::OutOfMemory`] if the tree is full and cannot grow.
    pub(crate) fn insert_child(
        &mut self,
        parent: usize,
        space: SpaceId,
        page: u64,
    ) -> Result<usize, MapdbError> {
        let depth = self
            .nodes
            .get(parent)
            .ok_or(MapdbError::NotMapped)?
            .depth()
            .checked_add(1)
            .ok_or(MapdbError::DepthExceeded)?;

        if self.nodes.len() == self.capacity {
            self.grow()?;
        }

        let at = self.subtree_end(parent);
        self.nodes.insert(at, Mapping::new(space, page, depth));
        Ok(at)
    }

    /// Removes `index` and all of its descendants, handing each removed node
    /// to `sink` in preorder. Returns the number of removed nodes.
    pub(crate) fn remove_subtree(&mut self, index: usize, sink: impl FnMut(Mapping)) -> usize {
        let end = self.subtree_end(index);
        self.remove_range(index, end, sink)
    }

    /// Removes the strict descendants of `index`; the node itself stays.
    pub(crate) fn remove_descendants(&mut self, index: usize, sink: impl FnMut(Mapping)) -> usize {
        let end = self.subtree_end(index);
        self.remove_range(index + 1, end, sink)
    }

    fn remove_range(&mut self, start: usize, end: usize, mut sink: impl FnMut(Mapping)) -> usize {
        if start >= end {
            return 0;
        }
        for m in self.nodes.drain(start..end) {
            sink(m);
        }
        self.shrink();
        end - start
    }

    /// Depth sequence is a valid preorder: one root at depth 0, every later
    /// node at depth >= 1 and at most one deeper than its predecessor.
    #[must_use]
    pub fn is_preorder(&self) -> bool {
        let Some(root) = self.nodes.first() else {
            return true;
        };
        root.depth() == 0
            && self
                .nodes
                .windows(2)
                .all(|w| w[1].depth() >= 1 && w[1].depth() <= w[0].depth().saturating_add(1))
    }

    fn grow(&mut self) -> Result<(), MapdbError> {
        if self.capacity >= MAX_CAPACITY {
            log::warn!("mapdb: mapping tree full at {} nodes", self.capacity);
            return Err(MapdbError::OutOfMemory);
        }
        let target = self.capacity * 2;
        let mut grown = alloc_block(self.quota, target)?;
        grown.append(&mut self.nodes);
        let old = core::mem::replace(&mut self.nodes, grown);
        drop(old);
        self.quota.release(block_bytes(self.capacity));
        log::debug!("mapdb: mapping tree grew {} -> {} nodes", self.capacity, target);
        self.capacity = target;
        Ok(())
    }

    fn shrink(&mut self) {
        let mut target = self.capacity;
        while target > MIN_CAPACITY && self.nodes.len() * 4 <= target {
            target /= 2;
        }
        if target == self.capacity {
            return;
        }

        // Shrinking is best effort; without a new block the tree keeps the old one.
        let mut shrunk = Vec::new();
        if shrunk.try_reserve_exact(target).is_err() {
            return;
        }
        shrunk.append(&mut self.nodes);
        self.nodes = shrunk;
        self.quota
            .release(block_bytes(self.capacity) - block_bytes(target));
        log::debug!("mapdb: mapping tree shrank {} -> {} nodes", self.capacity, target);
        self.capacity = target;
    }
}

/// Charges and allocates a block of `capacity` nodes.
fn alloc_block(quota: &dyn SlabQuota, capacity: usize) -> Result<Vec<Mapping>, MapdbError> {
    let bytes = block_bytes(capacity);
    if !quota.reserve(bytes) {
        log::warn!("mapdb: quota refused a {capacity}-node tree block");
        return Err(MapdbError::OutOfMemory);
    }
    let mut nodes = Vec::new();
    if nodes.try_reserve_exact(capacity).is_err() {
        quota.release(bytes);
        log::warn!("mapdb: allocator refused a {capacity}-node tree block");
        return Err(MapdbError::OutOfMemory);
    }
    Ok(nodes)
}

impl Drop for MappingTree {
    fn drop(&mut self) {
        self.quota.release(block_bytes(self.capacity));
    }
}

impl fmt::Debug for MappingTree {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MappingTree")
            .field("capacity", &self.capacity)
            .field("nodes", &self.nodes)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::quota::{BoundedQuota, UNLIMITED};

    fn s(id: u64) -> SpaceId {
        SpaceId::new(id)
    }

    fn depths(t: &MappingTree) -> Vec<u8> {
        t.nodes().iter().map(Mapping::depth).collect()
    }

    fn spaces(t: &MappingTree) -> Vec<u64> {
        t.nodes().iter().map(|m| m.space().as_u64()).collect()
    }

    #[test]
    fn children_land_after_the_parents_subtree() {
        let mut t = MappingTree::with_root(s(0), 0, &UNLIMITED).unwrap();
        let a = t.insert_child(0, s(1), 10).unwrap();
        t.insert_child(0, s(4), 40).unwrap();
        let b = t.insert_child(a, s(2), 20).unwrap();
        t.insert_child(a, s(3), 30).unwrap();
        // D moved right by two when B and C went in ahead of it.
        let d = t.find(s(4), 40).unwrap();
        assert_eq!(d, 4);
        t.insert_child(d, s(5), 50).unwrap();

        assert_eq!(b, 2);
        assert_eq!(spaces(&t), [0, 1, 2, 3, 4, 5]);
        assert_eq!(depths(&t), [0, 1, 2, 2, 1, 2]);
        assert!(t.is_preorder());
        assert_eq!(t.subtree_end(0), 6);
        assert_eq!(t.subtree_end(1), 4);
        assert_eq!(t.subtree_end(4), 6);
    }

    #[test]
    fn remove_subtree_takes_the_contiguous_range() {
        let mut t = MappingTree::with_root(s(0), 0, &UNLIMITED).unwrap();
        let a = t.insert_child(0, s(1), 1).unwrap();
        t.insert_child(a, s(2), 2).unwrap();
        t.insert_child(0, s(3), 3).unwrap();

        let mut removed = Vec::new();
        let n = t.remove_subtree(1, |m| removed.push(m.space().as_u64()));
        assert_eq!(n, 2);
        assert_eq!(removed, [1, 2]);
        assert_eq!(spaces(&t), [0, 3]);
        assert!(t.is_preorder());

        let n = t.remove_descendants(0, |_| {});
        assert_eq!(n, 1);
        assert_eq!(t.len(), 1);
    }

    #[test]
    fn growth_and_shrink_follow_size_classes() {
        static QUOTA: BoundedQuota = BoundedQuota::new(usize::MAX);
        let mut t = MappingTree::with_root(s(0), 0, &QUOTA).unwrap();
        assert_eq!(QUOTA.used(), block_bytes(MIN_CAPACITY));

        for i in 1..=20 {
            t.insert_child(0, s(i), i).unwrap();
        }
        assert_eq!(t.capacity(), 32);
        assert_eq!(QUOTA.used(), block_bytes(32));
        assert_eq!(spaces(&t), (0..=20).collect::<Vec<_>>());

        t.remove_descendants(0, |_| {});
        assert_eq!(t.capacity(), MIN_CAPACITY);
        assert_eq!(QUOTA.used(), block_bytes(MIN_CAPACITY));

        drop(t);
        assert_eq!(QUOTA.used(), 0);
    }

    #[test]
    fn refused_growth_leaves_the_tree_intact() {
        static QUOTA: BoundedQuota = BoundedQuota::new(block_bytes(MIN_CAPACITY));
        let mut t = MappingTree::with_root(s(0), 0, &QUOTA).unwrap();
        for i in 1..4 {
            t.insert_child(0, s(i), i).unwrap();
        }
        assert_eq!(t.insert_child(0, s(9), 9), Err(MapdbError::OutOfMemory));
        assert_eq!(t.len(), 4);
        assert_eq!(t.capacity(), MIN_CAPACITY);
        assert!(t.is_preorder());
    }

    #[test]
    fn depth_is_bounded() {
        let mut t = MappingTree::with_root(s(0), 0, &UNLIMITED).unwrap();
        let mut parent = 0;
        for i in 1..=u64::from(u8::MAX) {
            parent = t.insert_child(parent, s(i), i).unwrap();
        }
        assert_eq!(t.get(parent).map(Mapping::depth), Some(u8::MAX));
        assert_eq!(
            t.insert_child(parent, s(999), 0),
            Err(MapdbError::DepthExceeded)
        );
        assert!(t.is_preorder());
    }
}
