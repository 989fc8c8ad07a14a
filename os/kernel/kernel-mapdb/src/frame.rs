//! # Frame Handles
//!
//! A [`Frame`] is what [`Mapdb::lookup`](crate::Mapdb::lookup) hands out: the
//! top-level frame's lock, the path of (node, sub-slot) steps through nested
//! treemaps down to the frame that holds the found mapping, and that
//! mapping's index (the *anchor*).
//!
//! Only the top-level lock is kept between calls. Every operation re-locks
//! the nested frames on the path top-down for its own duration; since all of
//! them hang off the top-level frame, nobody else can reach them meanwhile.
//!
//! A handle permits any number of reads and at most one successful mutation
//! ([`Frame::insert`] or a flush). Dropping it unlocks the frame.

use crate::access::AccessFlags;
use crate::addresses::{PageShift, PhysicalAddress, VirtRange, VirtualAddress};
use crate::config::{MAX_LEVELS, PageSizeLadder};
use crate::error::MapdbError;
use crate::lock::FrameGuard;
use crate::mapdb::Mapdb;
use crate::mapping::{Mapping, MappingInfo};
use crate::space::SpaceId;
use crate::treemap::{FrameState, Treemap};
use core::fmt;
use core::ops::Range;

/// What a flush removes.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum FlushMode {
    /// The anchor and everything derived from it, within the range.
    Full,
    /// Everything derived from the anchor within the range; the anchor stays.
    ChildrenOnly,
    /// Nothing. Collects and clears the access flags of everything derived
    /// from the anchor within the range.
    Probe,
}

/// One descent into a submap: the node carrying it and the sub-slot taken.
#[derive(Debug, Copy, Clone, Default, Eq, PartialEq)]
struct Step {
    node: usize,
    slot: usize,
}

#[derive(Copy, Clone, Default)]
struct Path {
    steps: [Step; MAX_LEVELS - 1],
    len: usize,
}

impl Path {
    fn push(&mut self, step: Step) {
        debug_assert!(self.len < self.steps.len(), "descent deeper than the ladder");
        if let Some(s) = self.steps.get_mut(self.len) {
            *s = step;
            self.len += 1;
        }
    }

    const fn pop(&mut self) {
        self.len = self.len.saturating_sub(1);
    }

    fn as_slice(&self) -> &[Step] {
        &self.steps[..self.len]
    }
}

impl fmt::Debug for Path {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.as_slice()).finish()
    }
}

/// A locked, located mapping.
pub struct Frame<'db> {
    db: &'db Mapdb,
    guard: FrameGuard<'db, FrameState>,
    top_slot: usize,
    path: Path,
    anchor: usize,
    /// Granularity of the anchor's tree.
    shift: PageShift,
    /// Page of the anchor in its space.
    virt: VirtualAddress,
    /// Physical page of the anchor.
    phys: PhysicalAddress,
    spent: bool,
    /// The anchor was removed by this handle's flush.
    gone: bool,
}

struct Query {
    space: SpaceId,
    virt: VirtualAddress,
    phys: PhysicalAddress,
    shift: PageShift,
}

impl<'db> Frame<'db> {
    /// Finds the mapping of `virt` in `space` for `phys`, as tracked at page
    /// size `shift` or at the nearest coarser size that was never split.
    ///
    /// Callers validate the arguments; the top-level frame is locked only on
    /// success.
    pub(crate) fn locate(
        db: &'db Mapdb,
        top_slot: usize,
        space: SpaceId,
        virt: VirtualAddress,
        phys: PhysicalAddress,
        shift: PageShift,
    ) -> Result<Self, MapdbError> {
        let top = db.top();
        let guard = top.frame(top_slot).lock();
        let query = Query {
            space,
            virt,
            phys,
            shift,
        };
        let mut path = Path::default();
        let anchor = locate(top, top_slot, &guard, &query, &mut path).ok_or(MapdbError::NotMapped)?;
        let shift = db
            .ladder()
            .get(path.len)
            .ok_or(MapdbError::UnsupportedPageSize)?;

        Ok(Self {
            db,
            guard,
            top_slot,
            path,
            anchor,
            shift,
            virt: virt.align_down(shift),
            phys: phys.align_down(shift),
            spent: false,
            gone: false,
        })
    }

    /// Page size at which the anchor is tracked. Coarser than the looked-up
    /// size when the mapping was never refined.
    #[inline]
    #[must_use]
    pub const fn page_shift(&self) -> PageShift {
        self.shift
    }

    /// Whether a mutation was already carried out through this handle.
    #[inline]
    #[must_use]
    pub const fn is_spent(&self) -> bool {
        self.spent
    }

    /// Snapshot of the anchor mapping.
    ///
    /// # Errors
    /// [`MapdbError::NotMapped`] once the anchor was flushed away.
    pub fn info(&self) -> Result<MappingInfo, MapdbError> {
        self.at_anchor(node_info)?
    }

    /// Derives a mapping of `target_phys` into `target_space` at `target_virt`
    /// from the anchor, `size` bytes large.
    ///
    /// A size finer than the anchor's splits the anchor's page (across as many
    /// ladder levels as needed) and hangs the new mapping off the sub-frame
    /// root that stands for the anchor there.
    ///
    /// # Errors
    /// - [`MapdbError::HandleSpent`] after a previous mutation.
    /// - [`MapdbError::ExceedsParentGranularity`] for a size above the anchor's.
    /// - [`MapdbError::UnsupportedPageSize`] for a size not on the ladder.
    /// - [`MapdbError::Misaligned`] if `target_virt` or `target_phys` is not size-aligned.
    /// - [`MapdbError::OutOfRange`] if `target_phys` is outside the anchor's page.
    /// - [`MapdbError::AlreadyMapped`] if `target_space` already maps that page there.
    /// - [`MapdbError::OutOfMemory`], [`MapdbError::DepthExceeded`] from the trees.
    ///
    /// A failed insert leaves the database as it was.
    pub fn insert(
        &mut self,
        target_space: SpaceId,
        target_virt: VirtualAddress,
        target_phys: PhysicalAddress,
        size: PageShift,
    ) -> Result<MappingInfo, MapdbError> {
        if self.spent {
            return Err(MapdbError::HandleSpent);
        }
        if size > self.shift {
            return Err(MapdbError::ExceedsParentGranularity);
        }
        if self.db.ladder().level_of(size).is_none() {
            return Err(MapdbError::UnsupportedPageSize);
        }
        if !target_virt.is_aligned(size) || !target_phys.is_aligned(size) {
            return Err(MapdbError::Misaligned);
        }
        if target_phys.align_down(self.shift) != self.phys {
            return Err(MapdbError::OutOfRange);
        }

        let request = Query {
            space: target_space,
            virt: target_virt,
            phys: target_phys,
            shift: size,
        };
        let db = self.db;
        // Mappings of the same page may hang off any node of the frame.
        if records(db.top(), self.top_slot, &self.guard, &request) {
            return Err(MapdbError::AlreadyMapped);
        }
        let ladder = db.ladder();
        let info = self
            .at_anchor_mut(|map, slot, state, anchor| {
                insert_at(map, slot, state, anchor, &request, ladder)
            })??;
        self.spent = true;
        log::trace!("mapdb: mapped {info}");
        Ok(info)
    }

    /// [`flush_with`](Self::flush_with) without a page-table visitor.
    ///
    /// # Errors
    /// As [`flush_with`](Self::flush_with).
    pub fn flush(&mut self, mode: FlushMode, range: VirtRange) -> Result<AccessFlags, MapdbError> {
        self.flush_with(mode, range, |_| AccessFlags::new())
    }

    /// Removes (or, for [`FlushMode::Probe`], inspects) what derives from the
    /// anchor within `range`.
    ///
    /// `range` is in the anchor's address space and is clipped to the anchor's
    /// page; it must be aligned to the finest page size. Mappings at the
    /// anchor's own granularity span the whole page and are removed whole.
    /// Under [`FlushMode::Full`] a range that covers only part of the anchor
    /// splits it first and revokes the pieces inside the range.
    ///
    /// `unmap` is shown every non-root mapping that is removed or probed,
    /// including everything refined below a removed mapping, and returns the
    /// access state it harvested from the page tables. Roots of sub-frames
    /// are never shown: after a partial [`FlushMode::Full`] the caller
    /// invalidates `range` in its own page table itself.
    ///
    /// Returns the union of the recorded flags of every removed or probed
    /// mapping and everything `unmap` returned.
    ///
    /// # Errors
    /// - [`MapdbError::HandleSpent`] after a previous mutation.
    /// - [`MapdbError::Misaligned`] if `range` is not aligned to the finest page size.
    /// - [`MapdbError::OutOfMemory`] if a partial [`FlushMode::Full`] cannot split
    ///   the anchor; nothing was removed then.
    pub fn flush_with<F>(
        &mut self,
        mode: FlushMode,
        range: VirtRange,
        unmap: F,
    ) -> Result<AccessFlags, MapdbError>
    where
        F: FnMut(&MappingInfo) -> AccessFlags,
    {
        if self.spent {
            return Err(MapdbError::HandleSpent);
        }
        let db = self.db;
        let ladder = db.ladder();
        if !range.is_aligned(ladder.finest()) {
            return Err(MapdbError::Misaligned);
        }
        let page = VirtRange::page(self.virt, self.shift);
        let range = range.intersect(&page);
        if range.is_empty() {
            self.spent = true;
            return Ok(AccessFlags::new());
        }

        let mut flush = Flush {
            range,
            ladder,
            unmap,
            flags: AccessFlags::new(),
        };
        self.at_anchor_mut(|map, slot, state, anchor| flush.run(mode, map, slot, state, anchor))??;

        self.spent = true;
        self.gone = mode == FlushMode::Full && range.contains(&page);
        log::trace!(
            "mapdb: flush {mode:?} {range:?} of {} page {}",
            self.shift,
            self.phys
        );
        Ok(flush.flags)
    }

    /// Visits the anchor, everything derived from it, and the refinements of
    /// the anchor whose pages intersect `range`, in preorder. Returns the
    /// number of visited mappings.
    ///
    /// # Errors
    /// [`MapdbError::NotMapped`] once the anchor was flushed away.
    pub fn foreach_mapping(
        &self,
        range: VirtRange,
        mut visit: impl FnMut(&MappingInfo),
    ) -> Result<usize, MapdbError> {
        let mut count = 0;
        self.at_anchor(|map, slot, state, anchor| {
            walk_nodes(map, slot, state, anchor, &range, &mut |info: &MappingInfo| {
                count += 1;
                visit(info);
            });
        })?;
        Ok(count)
    }

    /// Records access state on the anchor, e.g. after a page fault through it.
    /// Does not count as a mutation.
    ///
    /// # Errors
    /// - [`MapdbError::NotMapped`] once the anchor was flushed away.
    /// - [`MapdbError::OutOfMemory`] if an implicit root needs a tree to hold
    ///   the flags.
    pub fn touch(&mut self, flags: AccessFlags) -> Result<(), MapdbError> {
        if flags.is_empty() {
            return Ok(());
        }
        self.at_anchor_mut(|map, slot, state, anchor| -> Result<(), MapdbError> {
            map.materialize(slot, state)?
                .get_mut(anchor)
                .ok_or(MapdbError::NotMapped)?
                .record_access(flags);
            Ok(())
        })?
    }

    /// Unlocks the frame.
    #[inline]
    pub fn release(self) {
        drop(self);
    }

    fn at_anchor<R>(
        &self,
        f: impl FnOnce(&Treemap, usize, &FrameState, usize) -> R,
    ) -> Result<R, MapdbError> {
        if self.gone {
            return Err(MapdbError::NotMapped);
        }
        let anchor = self.anchor;
        walk(
            self.db.top(),
            self.top_slot,
            &self.guard,
            self.path.as_slice(),
            |map, slot, state| f(map, slot, state, anchor),
        )
    }

    fn at_anchor_mut<R>(
        &mut self,
        f: impl FnOnce(&Treemap, usize, &mut FrameState, usize) -> R,
    ) -> Result<R, MapdbError> {
        if self.gone {
            return Err(MapdbError::NotMapped);
        }
        let anchor = self.anchor;
        walk_mut(
            self.db.top(),
            self.top_slot,
            &mut self.guard,
            self.path.as_slice(),
            |map, slot, state| f(map, slot, state, anchor),
        )
    }
}

impl Drop for Frame<'_> {
    fn drop(&mut self) {
        // Submaps on the path stay pinned while the handle lives.
        settle_path(
            self.db.top(),
            self.top_slot,
            &mut self.guard,
            self.path.as_slice(),
            self.anchor,
        );
    }
}

impl fmt::Debug for Frame<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Frame")
            .field("top_slot", &self.top_slot)
            .field("path", &self.path)
            .field("anchor", &self.anchor)
            .field("shift", &self.shift)
            .field("virt", &self.virt)
            .field("phys", &self.phys)
            .field("spent", &self.spent)
            .field("gone", &self.gone)
            .finish_non_exhaustive()
    }
}

fn locate(
    map: &Treemap,
    slot: usize,
    state: &FrameState,
    query: &Query,
    path: &mut Path,
) -> Option<usize> {
    let shift = map.shift();
    let page = query.virt.page_number(shift);
    let Some(tree) = state.tree() else {
        let hit = state.is_implicit()
            && map.owner() == query.space
            && map.default_page(slot) == page;
        return hit.then_some(0);
    };

    for (index, node) in tree.nodes().iter().enumerate() {
        let hit = node.space() == query.space && node.page() == page;
        if hit && (shift == query.shift || !node.has_submap()) {
            return Some(index);
        }
        if shift == query.shift {
            continue;
        }
        let Some(sub) = node.submap() else {
            continue;
        };
        let Some(sub_slot) = sub.slot_for(query.phys) else {
            continue;
        };

        path.push(Step {
            node: index,
            slot: sub_slot,
        });
        let guard = sub.frame(sub_slot).lock();
        if let Some(found) = locate(sub, sub_slot, &guard, query, path) {
            return Some(found);
        }
        drop(guard);
        path.pop();

        // The refinement of the matching node is authoritative.
        if hit {
            return None;
        }
    }
    None
}

/// Whether `query.space` already maps `query.virt` at exactly `query.shift`
/// anywhere below this frame, whichever mapping it was derived from.
fn records(map: &Treemap, slot: usize, state: &FrameState, query: &Query) -> bool {
    let shift = map.shift();
    let page = query.virt.page_number(shift);
    let Some(tree) = state.tree() else {
        return shift == query.shift
            && state.is_implicit()
            && map.owner() == query.space
            && map.default_page(slot) == page;
    };
    if shift == query.shift {
        return tree.find(query.space, page).is_some();
    }
    tree.nodes().iter().filter_map(Mapping::submap).any(|sub| {
        sub.slot_for(query.phys).is_some_and(|sub_slot| {
            let guard = sub.frame(sub_slot).lock();
            records(sub, sub_slot, &guard, query)
        })
    })
}

fn walk<R>(
    map: &Treemap,
    slot: usize,
    state: &FrameState,
    path: &[Step],
    f: impl FnOnce(&Treemap, usize, &FrameState) -> R,
) -> Result<R, MapdbError> {
    let Some((step, rest)) = path.split_first() else {
        return Ok(f(map, slot, state));
    };
    let sub = submap_at(state, step.node)?;
    let guard = sub.frame(step.slot).lock();
    walk(sub, step.slot, &guard, rest, f)
}

fn walk_mut<R>(
    map: &Treemap,
    slot: usize,
    state: &mut FrameState,
    path: &[Step],
    f: impl FnOnce(&Treemap, usize, &mut FrameState) -> R,
) -> Result<R, MapdbError> {
    let Some((step, rest)) = path.split_first() else {
        return Ok(f(map, slot, state));
    };
    let sub = submap_at(state, step.node)?;
    let mut guard = sub.frame(step.slot).lock();
    walk_mut(sub, step.slot, &mut guard, rest, f)
}

fn submap_at(state: &FrameState, node: usize) -> Result<&Treemap, MapdbError> {
    state
        .tree()
        .and_then(|t| t.get(node))
        .and_then(Mapping::submap)
        .ok_or(MapdbError::NotMapped)
}

/// Settles every frame on `path`, deepest first.
fn settle_path(map: &Treemap, slot: usize, state: &mut FrameState, path: &[Step], anchor: usize) {
    if let Some((step, rest)) = path.split_first()
        && let Ok(sub) = submap_at(state, step.node)
    {
        let mut guard = sub.frame(step.slot).lock();
        settle_path(sub, step.slot, &mut guard, rest, anchor);
    }
    let node = path.first().map_or(anchor, |s| s.node);
    map.settle(slot, state, node);
}

fn node_info(
    map: &Treemap,
    slot: usize,
    state: &FrameState,
    index: usize,
) -> Result<MappingInfo, MapdbError> {
    match state {
        FrameState::Implicit if index == 0 => Ok(map.root_info(slot)),
        FrameState::Tree(tree) => tree
            .get(index)
            .map(|m| m.info(map.shift(), map.slot_phys(slot)))
            .ok_or(MapdbError::NotMapped),
        _ => Err(MapdbError::NotMapped),
    }
}

/// Virtual page of node `index` in its own space.
fn node_page(map: &Treemap, slot: usize, state: &FrameState, index: usize) -> Option<VirtRange> {
    node_info(map, slot, state, index)
        .ok()
        .map(|info| VirtRange::with_len(info.virt, info.size()))
}

fn insert_at(
    map: &Treemap,
    slot: usize,
    state: &mut FrameState,
    parent: usize,
    request: &Query,
    ladder: &PageSizeLadder,
) -> Result<MappingInfo, MapdbError> {
    let result = insert_below(map, slot, state, parent, request, ladder);
    // Undoes tree materialisation and splits of a failed attempt.
    map.settle(slot, state, parent);
    result
}

fn insert_below(
    map: &Treemap,
    slot: usize,
    state: &mut FrameState,
    parent: usize,
    request: &Query,
    ladder: &PageSizeLadder,
) -> Result<MappingInfo, MapdbError> {
    let tree = map.materialize(slot, state)?;
    let shift = map.shift();

    if request.shift == shift {
        let page = request.virt.page_number(shift);
        if tree.find(request.space, page).is_some() {
            return Err(MapdbError::AlreadyMapped);
        }
        let at = tree.insert_child(parent, request.space, page)?;
        return tree
            .get(at)
            .map(|m| m.info(shift, map.slot_phys(slot)))
            .ok_or(MapdbError::NotMapped);
    }

    let node = tree.get_mut(parent).ok_or(MapdbError::NotMapped)?;
    if !node.has_submap() {
        let submap = map.split_of(slot, node, ladder)?;
        node.set_submap(submap);
    }
    let sub = node.submap().ok_or(MapdbError::NotMapped)?;
    let sub_slot = sub.slot_for(request.phys).ok_or(MapdbError::OutOfRange)?;
    let mut guard = sub.frame(sub_slot).lock();
    insert_at(sub, sub_slot, &mut guard, 0, request, ladder)
}

fn walk_nodes(
    map: &Treemap,
    slot: usize,
    state: &FrameState,
    anchor: usize,
    range: &VirtRange,
    visit: &mut dyn FnMut(&MappingInfo),
) {
    let Some(page) = node_page(map, slot, state, anchor) else {
        return;
    };
    if range.intersect(&page).is_empty() {
        return;
    }
    let Some(tree) = state.tree() else {
        visit(&map.root_info(slot));
        return;
    };

    let shift = map.shift();
    let phys = map.slot_phys(slot);
    let end = tree.subtree_end(anchor);
    for (index, node) in tree.nodes()[anchor..end].iter().enumerate() {
        visit(&node.info(shift, phys));
        let Some(sub) = node.submap() else {
            continue;
        };
        // Only the anchor's refinements are filtered; a derived mapping's
        // refinements lie in its own space and are part of it.
        let scope = if index == 0 { *range } else { VirtRange::all() };
        for sub_slot in sub.slots_in(&scope) {
            let guard = sub.frame(sub_slot).lock();
            walk_nodes(sub, sub_slot, &guard, 0, &scope, visit);
        }
    }
}

/// First and last element of `slots`.
fn edges(slots: Range<usize>) -> impl Iterator<Item = usize> {
    let first = (!slots.is_empty()).then_some(slots.start);
    let last = (slots.len() > 1).then(|| slots.end - 1);
    first.into_iter().chain(last)
}

struct Flush<'a, F> {
    /// Clipped to the anchor's page, in the anchor's space.
    range: VirtRange,
    ladder: &'a PageSizeLadder,
    unmap: F,
    flags: AccessFlags,
}

impl<F> Flush<'_, F>
where
    F: FnMut(&MappingInfo) -> AccessFlags,
{
    fn run(
        &mut self,
        mode: FlushMode,
        map: &Treemap,
        slot: usize,
        state: &mut FrameState,
        anchor: usize,
    ) -> Result<(), MapdbError> {
        match mode {
            FlushMode::Probe => self.probe(map, slot, state, anchor),
            FlushMode::ChildrenOnly => self.sweep(map, slot, state, anchor, false),
            FlushMode::Full => {
                if let Err(e) = self.prepare(map, slot, state, anchor) {
                    self.unwind(map, slot, state, anchor);
                    return Err(e);
                }
                self.sweep(map, slot, state, anchor, true);
            }
        }
        Ok(())
    }

    /// Splits `anchor` until the range boundaries fall on page boundaries.
    /// All allocation of a partial flush happens here, before anything is removed.
    fn prepare(
        &self,
        map: &Treemap,
        slot: usize,
        state: &mut FrameState,
        anchor: usize,
    ) -> Result<(), MapdbError> {
        let Some(page) = node_page(map, slot, state, anchor) else {
            return Ok(());
        };
        let range = self.range.intersect(&page);
        if range.is_empty() || range.contains(&page) {
            return Ok(());
        }

        let tree = map.materialize(slot, state)?;
        let node = tree.get_mut(anchor).ok_or(MapdbError::NotMapped)?;
        if !node.has_submap() {
            let submap = map.split_of(slot, node, self.ladder)?;
            node.set_submap(submap);
        }
        let sub = node.submap().ok_or(MapdbError::NotMapped)?;
        for sub_slot in edges(sub.slots_in(&range)) {
            let mut guard = sub.frame(sub_slot).lock();
            self.prepare(sub, sub_slot, &mut guard, 0)?;
        }
        Ok(())
    }

    /// Settles whatever [`prepare`](Self::prepare) may have touched.
    fn unwind(&self, map: &Treemap, slot: usize, state: &mut FrameState, anchor: usize) {
        if let Ok(sub) = submap_at(state, anchor) {
            for sub_slot in edges(sub.slots_in(&self.range)) {
                let mut guard = sub.frame(sub_slot).lock();
                self.unwind(sub, sub_slot, &mut guard, 0);
            }
        }
        map.settle(slot, state, anchor);
    }

    fn sweep(
        &mut self,
        map: &Treemap,
        slot: usize,
        state: &mut FrameState,
        anchor: usize,
        remove_anchor: bool,
    ) {
        let Some(page) = node_page(map, slot, state, anchor) else {
            return;
        };
        let range = self.range.intersect(&page);
        if range.is_empty() {
            return;
        }
        let covers = range.contains(&page);
        let shift = map.shift();
        let phys = map.slot_phys(slot);

        if let Some(tree) = state.tree_mut() {
            if remove_anchor && covers {
                tree.remove_subtree(anchor, |m| self.retire(&m, shift, phys));
            } else {
                if let Some(sub) = tree.get(anchor).and_then(Mapping::submap) {
                    for sub_slot in sub.slots_in(&range) {
                        let mut guard = sub.frame(sub_slot).lock();
                        self.sweep(sub, sub_slot, &mut guard, 0, remove_anchor);
                    }
                }
                tree.remove_descendants(anchor, |m| self.retire(&m, shift, phys));
            }
        } else if remove_anchor && covers && state.is_implicit() {
            map.revoke(state);
        }
        map.settle(slot, state, anchor);
    }

    /// Accounts for a removed mapping and everything refined below it.
    fn retire(&mut self, node: &Mapping, shift: PageShift, phys: PhysicalAddress) {
        self.flags |= node.access();
        if !node.is_root() {
            self.flags |= (self.unmap)(&node.info(shift, phys));
        }
        let Some(sub) = node.submap() else {
            return;
        };
        for (sub_slot, frame) in sub.frames().iter().enumerate() {
            let guard = frame.lock();
            if let Some(tree) = guard.tree() {
                for m in tree.nodes() {
                    self.retire(m, sub.shift(), sub.slot_phys(sub_slot));
                }
            }
        }
    }

    fn probe(&mut self, map: &Treemap, slot: usize, state: &mut FrameState, anchor: usize) {
        let Some(page) = node_page(map, slot, state, anchor) else {
            return;
        };
        let range = self.range.intersect(&page);
        if range.is_empty() {
            return;
        }
        let shift = map.shift();
        let phys = map.slot_phys(slot);
        let Some(tree) = state.tree_mut() else {
            return;
        };

        if let Some(sub) = tree.get(anchor).and_then(Mapping::submap) {
            for sub_slot in sub.slots_in(&range) {
                let mut guard = sub.frame(sub_slot).lock();
                self.probe(sub, sub_slot, &mut guard, 0);
            }
        }
        let end = tree.subtree_end(anchor);
        for node in &mut tree.nodes_mut()[anchor + 1..end] {
            self.harvest(node, shift, phys);
        }
        map.settle(slot, state, anchor);
    }

    /// Collects and clears the flags of `node` and of its refinements.
    fn harvest(&mut self, node: &mut Mapping, shift: PageShift, phys: PhysicalAddress) {
        let info = node.info(shift, phys);
        self.flags |= node.take_access();
        if !node.is_root() {
            self.flags |= (self.unmap)(&info);
        }
        if let Some(sub) = node.submap() {
            for sub_slot in 0..sub.len() {
                let mut guard = sub.frame(sub_slot).lock();
                if let Some(tree) = guard.tree_mut() {
                    for m in tree.nodes_mut() {
                        self.harvest(m, sub.shift(), sub.slot_phys(sub_slot));
                    }
                }
                sub.settle(sub_slot, &mut guard, 0);
            }
        }
        node.merge_idle_submap();
    }
}
