//! # Mapping Nodes

use crate::access::AccessFlags;
use crate::addresses::{PageShift, PhysicalAddress, VirtualAddress};
use crate::space::SpaceId;
use crate::treemap::Treemap;
use alloc::boxed::Box;
use core::fmt;

/// One node of a mapping tree: `space` has the tree's frame mapped at
/// virtual page `page`, at the tree's granularity.
///
/// A node with a `submap` is still the mapping at its own granularity. The
/// submap refines it for finer-grained derivations: there, every sub-frame's
/// root stands for the node's mapping of that sub-page.
pub struct Mapping {
    space: SpaceId,
    page: u64,
    depth: u8,
    access: AccessFlags,
    submap: Option<Box<Treemap>>,
}

impl Mapping {
    pub(crate) const fn new(space: SpaceId, page: u64, depth: u8) -> Self {
        Self {
            space,
            page,
            depth,
            access: AccessFlags::new(),
            submap: None,
        }
    }

    #[inline]
    #[must_use]
    pub const fn space(&self) -> SpaceId {
        self.space
    }

    /// Virtual page number in units of the owning tree's granularity.
    #[inline]
    #[must_use]
    pub const fn page(&self) -> u64 {
        self.page
    }

    /// Distance from the tree's root.
    #[inline]
    #[must_use]
    pub const fn depth(&self) -> u8 {
        self.depth
    }

    #[inline]
    #[must_use]
    pub const fn access(&self) -> AccessFlags {
        self.access
    }

    #[inline]
    pub(crate) fn record_access(&mut self, flags: AccessFlags) {
        self.access |= flags;
    }

    #[inline]
    pub(crate) const fn take_access(&mut self) -> AccessFlags {
        self.access.take()
    }

    #[inline]
    #[must_use]
    pub const fn is_root(&self) -> bool {
        self.depth == 0
    }

    #[inline]
    #[must_use]
    pub fn submap(&self) -> Option<&Treemap> {
        self.submap.as_deref()
    }

    #[inline]
    pub(crate) fn set_submap(&mut self, submap: Box<Treemap>) {
        debug_assert!(self.submap.is_none(), "node already split");
        self.submap = Some(submap);
    }

    #[inline]
    pub(crate) fn take_submap(&mut self) -> Option<Box<Treemap>> {
        self.submap.take()
    }

    /// Drops the submap if none of its frames records anything. Returns
    /// whether a merge happened.
    pub(crate) fn merge_idle_submap(&mut self) -> bool {
        if self.submap.as_deref().is_some_and(Treemap::is_idle) {
            self.submap = None;
            true
        } else {
            false
        }
    }

    #[inline]
    pub(crate) fn has_submap(&self) -> bool {
        self.submap.is_some()
    }

    /// Whether this node carries nothing beyond what an implicit root implies.
    #[inline]
    pub(crate) fn is_plain(&self) -> bool {
        self.submap.is_none() && self.access.is_empty()
    }

    /// Snapshot of this node, given the granularity and frame of its tree.
    #[must_use]
    pub fn info(&self, shift: PageShift, phys: PhysicalAddress) -> MappingInfo {
        MappingInfo {
            space: self.space,
            virt: VirtualAddress::from_page_number(self.page, shift),
            phys,
            shift,
            depth: self.depth,
            access: self.access,
            split: self.submap.is_some(),
        }
    }
}

impl fmt::Debug for Mapping {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Mapping")
            .field("space", &self.space)
            .field("page", &format_args!("{:#x}", self.page))
            .field("depth", &self.depth)
            .field("access", &self.access)
            .field("split", &self.submap.is_some())
            .finish()
    }
}

/// Copyable description of a mapping handed to callers and visitors.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct MappingInfo {
    /// Owning address space.
    pub space: SpaceId,
    /// Virtual base address of the mapping in `space`.
    pub virt: VirtualAddress,
    /// Physical base address of the mapped page.
    pub phys: PhysicalAddress,
    /// Page size of the mapping.
    pub shift: PageShift,
    /// Distance from the root of its tree.
    pub depth: u8,
    /// Access flags recorded on the node.
    pub access: AccessFlags,
    /// Whether finer mappings were carved out of this one.
    pub split: bool,
}

impl MappingInfo {
    /// Size of the mapping in bytes.
    #[inline]
    #[must_use]
    pub const fn size(&self) -> u64 {
        self.shift.size()
    }
}

impl fmt::Display for MappingInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {} -> {} [{}] d={}",
            self.space, self.virt, self.phys, self.shift, self.depth
        )?;
        if !self.access.is_empty() {
            write!(
                f,
                " {}{}{}",
                if self.access.accessed() { 'a' } else { '-' },
                if self.access.written() { 'w' } else { '-' },
                if self.access.executed() { 'x' } else { '-' },
            )?;
        }
        if self.split {
            f.write_str(" +split")?;
        }
        Ok(())
    }
}
