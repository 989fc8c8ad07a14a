//! # Treemaps and Physframes
//!
//! A [`Treemap`] is a flat array of [`Physframe`] slots covering a contiguous
//! physical range at one page size. The top-level treemap spans all managed
//! memory at the coarsest size; a nested treemap (a node's *submap*) covers
//! exactly one page of its parent at the next finer size.
//!
//! ```text
//!  top (1G)   ┌───────┬───────┬───────┐
//!             │ frame │ frame │ frame │  ...
//!             └───┬───┴───────┴───────┘
//!                 │ tree: root(S0) ── A(S1) +submap
//!                 ▼
//!  submap (2M)    ┌───────┬───────┬─ ─ ─┐
//!                 │ frame │ frame │      512 slots, implicit root = S1
//!                 └───┬───┴───────┴─ ─ ─┘
//!                     │ tree: root(S1) ── B(S2)
//! ```
//!
//! Every frame starts out [`FrameState::Implicit`]: the treemap's owner holds
//! it at the owner's default virtual page and nothing is derived. Trees are
//! materialised on the first derivation and collapse back when they are
//! reduced to a plain root again. A submap whose frames are all implicit is
//! idle and gets merged back into its parent node.

use crate::access::AccessFlags;
use crate::addresses::{PageShift, PhysicalAddress, VirtRange, VirtualAddress};
use crate::config::PageSizeLadder;
use crate::error::MapdbError;
use crate::lock::{FrameGuard, FrameLock};
use crate::mapping::{Mapping, MappingInfo};
use crate::mapping_tree::MappingTree;
use crate::quota::SlabQuota;
use crate::space::SpaceId;
use alloc::alloc::{Layout, alloc};
use alloc::boxed::Box;
use alloc::vec::Vec;
use core::fmt;
use core::ops::Range;
use core::sync::atomic::{AtomicUsize, Ordering};

/// What one physical frame currently records.
#[derive(Debug, Default)]
pub enum FrameState {
    /// No tree: the treemap's owner holds the frame, nothing is derived.
    #[default]
    Implicit,
    /// A materialised mapping tree.
    Tree(MappingTree),
    /// The frame's root mapping was revoked; nothing maps it.
    Revoked,
}

impl FrameState {
    #[inline]
    #[must_use]
    pub const fn tree(&self) -> Option<&MappingTree> {
        match self {
            Self::Tree(tree) => Some(tree),
            _ => None,
        }
    }

    #[inline]
    pub(crate) const fn tree_mut(&mut self) -> Option<&mut MappingTree> {
        match self {
            Self::Tree(tree) => Some(tree),
            _ => None,
        }
    }

    #[inline]
    #[must_use]
    pub const fn is_implicit(&self) -> bool {
        matches!(self, Self::Implicit)
    }

    #[inline]
    #[must_use]
    pub const fn is_revoked(&self) -> bool {
        matches!(self, Self::Revoked)
    }
}

/// Per-frame slot: a spinlock around the frame's [`FrameState`].
#[derive(Debug, Default)]
pub struct Physframe {
    state: FrameLock<FrameState>,
}

impl Physframe {
    #[inline]
    pub(crate) fn lock(&self) -> FrameGuard<'_, FrameState> {
        self.state.lock()
    }

    #[inline]
    pub(crate) fn try_lock(&self) -> Option<FrameGuard<'_, FrameState>> {
        self.state.try_lock()
    }
}

pub struct Treemap {
    frames: Box<[Physframe]>,
    /// Ladder level of `shift`.
    level: usize,
    shift: PageShift,
    phys_base: PhysicalAddress,
    /// Owner of every implicit root in this treemap.
    owner: SpaceId,
    /// Virtual address of slot 0 in `owner`.
    virt_base: VirtualAddress,
    /// Frames that are not [`FrameState::Implicit`].
    busy: AtomicUsize,
    quota: &'static dyn SlabQuota,
}

impl Treemap {
    /// Allocates a treemap of `len` implicit frames.
    ///
    /// # Errors
    /// [`MapdbError::OutOfMemory`] if the quota or the allocator refuses.
    pub(crate) fn new(
        len: usize,
        level: usize,
        shift: PageShift,
        phys_base: PhysicalAddress,
        owner: SpaceId,
        virt_base: VirtualAddress,
        quota: &'static dyn SlabQuota,
    ) -> Result<Self, MapdbError> {
        let bytes = Self::charge(len);
        if !quota.reserve(bytes) {
            log::warn!("mapdb: quota refused a {len}-slot treemap");
            return Err(MapdbError::OutOfMemory);
        }
        let mut frames = Vec::new();
        if frames.try_reserve_exact(len).is_err() {
            quota.release(bytes);
            log::warn!("mapdb: allocator refused a {len}-slot treemap");
            return Err(MapdbError::OutOfMemory);
        }
        frames.resize_with(len, Physframe::default);

        Ok(Self {
            frames: frames.into_boxed_slice(),
            level,
            shift,
            phys_base,
            owner,
            virt_base,
            busy: AtomicUsize::new(0),
            quota,
        })
    }

    /// Builds the submap that refines `node`, a node of slot `slot` of `self`,
    /// at the next finer size of `ladder`.
    ///
    /// # Errors
    /// - [`MapdbError::UnsupportedPageSize`] if `self` is already at the finest size.
    /// - [`MapdbError::OutOfMemory`] if the allocation is refused.
    pub(crate) fn split_of(
        &self,
        slot: usize,
        node: &Mapping,
        ladder: &PageSizeLadder,
    ) -> Result<Box<Self>, MapdbError> {
        let level = self.level + 1;
        let shift = ladder.get(level).ok_or(MapdbError::UnsupportedPageSize)?;
        let len = 1usize << (self.shift.as_u32() - shift.as_u32());
        let submap = Self::new(
            len,
            level,
            shift,
            self.slot_phys(slot),
            node.space(),
            VirtualAddress::from_page_number(node.page(), self.shift),
            self.quota,
        )?;
        log::debug!(
            "mapdb: split {} page {} of {} into {len} x {shift}",
            self.shift,
            self.slot_phys(slot),
            node.space()
        );
        try_box(submap)
    }

    const fn charge(len: usize) -> usize {
        size_of::<Self>() + len * size_of::<Physframe>()
    }

    /// Number of slots.
    #[inline]
    #[must_use]
    pub fn len(&self) -> usize {
        self.frames.len()
    }

    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    /// Ladder level of this treemap (0 = top).
    #[inline]
    #[must_use]
    pub const fn level(&self) -> usize {
        self.level
    }

    #[inline]
    #[must_use]
    pub const fn shift(&self) -> PageShift {
        self.shift
    }

    #[inline]
    #[must_use]
    pub const fn phys_base(&self) -> PhysicalAddress {
        self.phys_base
    }

    #[inline]
    #[must_use]
    pub const fn owner(&self) -> SpaceId {
        self.owner
    }

    #[inline]
    #[must_use]
    pub const fn virt_base(&self) -> VirtualAddress {
        self.virt_base
    }

    /// Bytes of physical memory covered; `len() << shift`.
    #[inline]
    #[must_use]
    pub fn covered(&self) -> u64 {
        (self.frames.len() as u64) << self.shift.as_u32()
    }

    /// Slot holding `phys`, if it lies in this treemap.
    #[must_use]
    pub fn slot_for(&self, phys: PhysicalAddress) -> Option<usize> {
        let off = phys.as_u64().checked_sub(self.phys_base.as_u64())?;
        let slot = usize::try_from(off >> self.shift.as_u32()).ok()?;
        (slot < self.frames.len()).then_some(slot)
    }

    /// Physical base of slot `slot`.
    #[inline]
    #[must_use]
    pub fn slot_phys(&self, slot: usize) -> PhysicalAddress {
        self.phys_base + ((slot as u64) << self.shift.as_u32())
    }

    /// Virtual address at which the owner holds slot `slot` by default.
    #[inline]
    #[must_use]
    pub fn slot_virt(&self, slot: usize) -> VirtualAddress {
        self.virt_base + ((slot as u64) << self.shift.as_u32())
    }

    /// Virtual page number of the implicit root of slot `slot`.
    #[inline]
    #[must_use]
    pub fn default_page(&self, slot: usize) -> u64 {
        self.slot_virt(slot).page_number(self.shift)
    }

    #[inline]
    pub(crate) fn frame(&self, slot: usize) -> &Physframe {
        &self.frames[slot]
    }

    #[inline]
    pub(crate) fn frames(&self) -> &[Physframe] {
        &self.frames
    }

    /// Slots whose virtual page in the owner's space intersects `range`.
    #[must_use]
    pub fn slots_in(&self, range: &VirtRange) -> Range<usize> {
        let span = VirtRange::with_len(self.virt_base, self.covered());
        let r = range.intersect(&span);
        if r.is_empty() {
            return 0..0;
        }
        let base = self.virt_base.as_u64();
        let shift = self.shift.as_u32();
        let first = (r.start().as_u64() - base) >> shift;
        let last = (r.end().as_u64() - 1 - base) >> shift;
        let slot = |n: u64| usize::try_from(n).map_or(self.len(), |n| n.min(self.len()));
        slot(first)..slot(last + 1)
    }

    /// Description of the implicit root of slot `slot`.
    #[must_use]
    pub fn root_info(&self, slot: usize) -> MappingInfo {
        MappingInfo {
            space: self.owner,
            virt: self.slot_virt(slot),
            phys: self.slot_phys(slot),
            shift: self.shift,
            depth: 0,
            access: AccessFlags::new(),
            split: false,
        }
    }

    /// Whether every frame is implicit, i.e. the submap adds nothing to its parent.
    #[inline]
    #[must_use]
    pub fn is_idle(&self) -> bool {
        self.busy() == 0
    }

    /// Number of frames that are not implicit.
    #[inline]
    pub(crate) fn busy(&self) -> usize {
        self.busy.load(Ordering::Acquire)
    }

    /// Materialises the tree of slot `slot` if it is still implicit.
    ///
    /// # Errors
    /// - [`MapdbError::NotMapped`] for a revoked frame.
    /// - [`MapdbError::OutOfMemory`] if the first tree block is refused.
    pub(crate) fn materialize<'s>(
        &self,
        slot: usize,
        state: &'s mut FrameState,
    ) -> Result<&'s mut MappingTree, MapdbError> {
        if state.is_implicit() {
            let tree = MappingTree::with_root(self.owner, self.default_page(slot), self.quota)?;
            *state = FrameState::Tree(tree);
            self.busy.fetch_add(1, Ordering::AcqRel);
        }
        state.tree_mut().ok_or(MapdbError::NotMapped)
    }

    /// Marks slot `slot` as revoked, dropping whatever tree it had.
    pub(crate) fn revoke(&self, state: &mut FrameState) {
        if state.is_implicit() {
            self.busy.fetch_add(1, Ordering::AcqRel);
        }
        *state = FrameState::Revoked;
    }

    /// Restores the invariants of slot `slot` after a mutation of node `node`:
    /// an idle submap on the node is merged back, and a tree reduced to a
    /// plain root collapses to [`FrameState::Implicit`].
    pub(crate) fn settle(&self, slot: usize, state: &mut FrameState, node: usize) {
        let Some(tree) = state.tree_mut() else {
            return;
        };
        if tree.get_mut(node).is_some_and(Mapping::merge_idle_submap) {
            log::debug!(
                "mapdb: merged {} page {} back into one mapping",
                self.shift,
                self.slot_phys(slot)
            );
        }
        if tree.len() == 1 && tree.root().is_some_and(Mapping::is_plain) {
            *state = FrameState::Implicit;
            self.busy.fetch_sub(1, Ordering::AcqRel);
        } else if tree.is_empty() {
            *state = FrameState::Revoked;
        }
    }
}

impl Drop for Treemap {
    fn drop(&mut self) {
        self.quota.release(Self::charge(self.frames.len()));
    }
}

impl fmt::Debug for Treemap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Treemap")
            .field("level", &self.level)
            .field("shift", &self.shift)
            .field("phys_base", &self.phys_base)
            .field("len", &self.frames.len())
            .field("owner", &self.owner)
            .field("virt_base", &self.virt_base)
            .field("busy", &self.busy.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

/// Moves `value` to the heap, reporting allocation failure instead of aborting.
fn try_box<T>(value: T) -> Result<Box<T>, MapdbError> {
    let layout = Layout::new::<T>();
    debug_assert!(layout.size() > 0);
    // Safety: `layout` has a non-zero size.
    let ptr = unsafe { alloc(layout) }.cast::<T>();
    if ptr.is_null() {
        log::warn!("mapdb: allocator refused a treemap header");
        return Err(MapdbError::OutOfMemory);
    }
    // Safety: `ptr` is a fresh, properly aligned allocation for one `T` from
    // the global allocator, which is what `Box` expects to free.
    unsafe {
        ptr.write(value);
        Ok(Box::from_raw(ptr))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::quota::{BoundedQuota, UNLIMITED};

    fn top(len: usize) -> Treemap {
        Treemap::new(
            len,
            0,
            PageShift::SIZE_2M,
            PhysicalAddress::new(0x4000_0000),
            SpaceId::new(0),
            VirtualAddress::new(0x4000_0000),
            &UNLIMITED,
        )
        .unwrap()
    }

    #[test]
    fn slot_geometry() {
        let t = top(4);
        assert_eq!(t.covered(), 4 << 21);
        assert_eq!(t.slot_for(PhysicalAddress::new(0x4000_0000)), Some(0));
        assert_eq!(t.slot_for(PhysicalAddress::new(0x405F_FFFF)), Some(2));
        assert_eq!(t.slot_for(PhysicalAddress::new(0x4080_0000)), None);
        assert_eq!(t.slot_for(PhysicalAddress::new(0x3FFF_F000)), None);
        assert_eq!(t.slot_phys(3).as_u64(), 0x4060_0000);
        assert_eq!(t.default_page(1), 0x4020_0000 >> 21);
    }

    #[test]
    fn slots_in_clips_to_the_covered_span() {
        let t = top(4);
        let base = 0x4000_0000u64;
        let two_m = PageShift::SIZE_2M.size();
        let r = VirtRange::new(
            VirtualAddress::new(base + two_m + 0x1000),
            VirtualAddress::new(base + 3 * two_m),
        );
        assert_eq!(t.slots_in(&r), 1..3);
        assert_eq!(t.slots_in(&VirtRange::all()), 0..4);
        let below = VirtRange::with_len(VirtualAddress::zero(), 0x1000);
        assert!(t.slots_in(&below).is_empty());
    }

    #[test]
    fn materialize_and_settle_round_trip() {
        let t = top(2);
        let mut state = FrameState::Implicit;
        let tree = t.materialize(1, &mut state).unwrap();
        assert_eq!(tree.root().map(Mapping::page), Some(t.default_page(1)));
        assert!(!t.is_idle());

        t.settle(1, &mut state, 0);
        assert!(state.is_implicit());
        assert!(t.is_idle());
    }

    #[test]
    fn revoked_frames_keep_the_treemap_busy() {
        let t = top(2);
        let mut state = FrameState::Implicit;
        t.revoke(&mut state);
        assert!(state.is_revoked());
        assert!(!t.is_idle());
        assert_eq!(
            t.materialize(0, &mut state).err(),
            Some(MapdbError::NotMapped)
        );
    }

    #[test]
    fn split_covers_exactly_the_parent_page() {
        let t = top(2);
        let node = Mapping::new(SpaceId::new(7), 0x123, 0);
        let ladder = PageSizeLadder::new(&[PageShift::SIZE_2M, PageShift::SIZE_4K]).unwrap();
        let sub = t.split_of(1, &node, &ladder).unwrap();
        assert_eq!(sub.len(), 512);
        assert_eq!(sub.covered(), PageShift::SIZE_2M.size());
        assert_eq!(sub.phys_base(), t.slot_phys(1));
        assert_eq!(sub.owner(), SpaceId::new(7));
        assert_eq!(sub.virt_base().as_u64(), 0x123 << 21);
        assert_eq!(sub.default_page(5), (0x123 << 9) + 5);

        let fine = sub.split_of(0, &node, &ladder).err();
        assert_eq!(fine, Some(MapdbError::UnsupportedPageSize));
    }

    #[test]
    fn quota_covers_the_slot_array() {
        static QUOTA: BoundedQuota = BoundedQuota::new(usize::MAX);
        let t = Treemap::new(
            8,
            0,
            PageShift::SIZE_4K,
            PhysicalAddress::zero(),
            SpaceId::new(0),
            VirtualAddress::zero(),
            &QUOTA,
        )
        .unwrap();
        assert_eq!(QUOTA.used(), Treemap::charge(8));
        drop(t);
        assert_eq!(QUOTA.used(), 0);
    }
}
