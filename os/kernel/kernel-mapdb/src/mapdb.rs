//! # The Mapping Database

use crate::addresses::{PageShift, PhysicalAddress, VirtualAddress};
use crate::config::{MapdbConfig, PageSizeLadder};
use crate::dump::FrameDump;
use crate::error::{InvariantViolation, MapdbError};
use crate::frame::Frame;
use crate::mapping::Mapping;
use crate::quota::{SlabQuota, UNLIMITED};
use crate::space::SpaceId;
use crate::treemap::{FrameState, Treemap};

/// Records, for every managed physical page, which address spaces map it and
/// from whom each mapping was derived.
///
/// ### Example
/// ```rust
/// # use kernel_mapdb::*;
/// let config = MapdbConfig::new(SpaceId::new(0))
///     .with_phys_range(PhysicalAddress::zero(), 1 << 30);
/// let db = Mapdb::new(config).unwrap();
///
/// // The root space holds everything at the identity address.
/// let phys = PhysicalAddress::new(0x20_0000);
/// let mut frame = db
///     .lookup(SpaceId::new(0), VirtualAddress::new(0), PhysicalAddress::zero(), PageShift::SIZE_1G)
///     .unwrap();
/// frame
///     .insert(SpaceId::new(1), VirtualAddress::new(0x7000_0000), phys, PageShift::SIZE_4K)
///     .unwrap();
/// frame.release();
///
/// let found = db
///     .lookup(SpaceId::new(1), VirtualAddress::new(0x7000_0000), phys, PageShift::SIZE_4K)
///     .unwrap();
/// assert_eq!(found.info().unwrap().depth, 1);
/// ```
pub struct Mapdb {
    top: Treemap,
    ladder: PageSizeLadder,
    root_space: SpaceId,
    quota: &'static dyn SlabQuota,
}

impl Mapdb {
    /// Builds a database in which `config.root_space` holds all of
    /// `config`'s physical range, identity mapped, at the coarsest page size.
    ///
    /// # Errors
    /// - [`MapdbError::Config`] for an invalid configuration.
    /// - [`MapdbError::OutOfMemory`] if the top-level treemap cannot be allocated.
    pub fn new(config: MapdbConfig) -> Result<Self, MapdbError> {
        Self::with_quota(config, &UNLIMITED)
    }

    /// As [`new`](Self::new), charging all database storage to `quota`.
    ///
    /// # Errors
    /// As [`new`](Self::new).
    pub fn with_quota(
        config: MapdbConfig,
        quota: &'static dyn SlabQuota,
    ) -> Result<Self, MapdbError> {
        config.validate()?;
        let frames = usize::try_from(config.top_frames()).map_err(|_| MapdbError::OutOfMemory)?;
        let shift = config.ladder.coarsest();
        let top = Treemap::new(
            frames,
            0,
            shift,
            config.phys_base,
            config.root_space,
            VirtualAddress::new(config.phys_base.as_u64()),
            quota,
        )?;

        log::info!(
            "mapdb: {} owns {frames} x {shift} from {}, ladder {:?}",
            config.root_space,
            config.phys_base,
            config.ladder
        );
        Ok(Self {
            top,
            ladder: config.ladder,
            root_space: config.root_space,
            quota,
        })
    }

    /// Finds and locks the mapping of `phys` at `virt` in `space`.
    ///
    /// `size` is the page size at which the caller holds the mapping. If the
    /// mapping is tracked at a coarser size (it was never split), the coarser
    /// mapping is returned; see [`Frame::page_shift`].
    ///
    /// # Errors
    /// - [`MapdbError::UnsupportedPageSize`] for a size not on the ladder.
    /// - [`MapdbError::Misaligned`] if `virt` or `phys` is not size-aligned.
    /// - [`MapdbError::OutOfRange`] if `phys` is not managed.
    /// - [`MapdbError::NotMapped`] if `space` does not map `phys` at `virt`.
    ///
    /// On error no lock is held.
    pub fn lookup(
        &self,
        space: SpaceId,
        virt: VirtualAddress,
        phys: PhysicalAddress,
        size: PageShift,
    ) -> Result<Frame<'_>, MapdbError> {
        if self.ladder.level_of(size).is_none() {
            return Err(MapdbError::UnsupportedPageSize);
        }
        if !virt.is_aligned(size) || !phys.is_aligned(size) {
            return Err(MapdbError::Misaligned);
        }
        let slot = self.top.slot_for(phys).ok_or(MapdbError::OutOfRange)?;
        log::trace!("mapdb: lookup {space} {virt} -> {phys} [{size}]");
        Frame::locate(self, slot, space, virt, phys, size)
    }

    #[inline]
    #[must_use]
    pub const fn ladder(&self) -> &PageSizeLadder {
        &self.ladder
    }

    #[inline]
    #[must_use]
    pub const fn root_space(&self) -> SpaceId {
        self.root_space
    }

    /// First managed physical address.
    #[inline]
    #[must_use]
    pub const fn phys_base(&self) -> PhysicalAddress {
        self.top.phys_base()
    }

    /// Number of managed bytes.
    #[inline]
    #[must_use]
    pub fn phys_size(&self) -> u64 {
        self.top.covered()
    }

    #[inline]
    #[must_use]
    pub fn quota(&self) -> &'static dyn SlabQuota {
        self.quota
    }

    #[inline]
    pub(crate) const fn top(&self) -> &Treemap {
        &self.top
    }

    /// Renders the frame that holds `phys`, for a kernel debugger.
    #[inline]
    #[must_use]
    pub const fn dump(&self, phys: PhysicalAddress) -> FrameDump<'_> {
        FrameDump::new(self, phys)
    }

    /// Audits every materialised tree and nested treemap.
    ///
    /// Locks every frame in turn; calling it while holding a [`Frame`]
    /// deadlocks.
    ///
    /// # Errors
    /// The first [`InvariantViolation`] found.
    pub fn check_invariants(&self) -> Result<(), InvariantViolation> {
        audit(&self.top, &self.ladder)
    }
}

impl core::fmt::Debug for Mapdb {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Mapdb")
            .field("root_space", &self.root_space)
            .field("ladder", &self.ladder)
            .field("top", &self.top)
            .finish_non_exhaustive()
    }
}

fn audit(map: &Treemap, ladder: &PageSizeLadder) -> Result<(), InvariantViolation> {
    let mut busy = 0;
    for (slot, frame) in map.frames().iter().enumerate() {
        let phys = map.slot_phys(slot);
        let guard = frame.lock();
        let tree = match &*guard {
            FrameState::Implicit => continue,
            FrameState::Revoked => {
                busy += 1;
                continue;
            }
            FrameState::Tree(tree) => tree,
        };
        busy += 1;

        if tree.is_empty() || !tree.is_preorder() {
            return Err(InvariantViolation::NotPreorder { phys });
        }
        if tree.len() == 1 && tree.root().is_some_and(Mapping::is_plain) {
            return Err(InvariantViolation::NotCollapsed { phys });
        }
        for node in tree.nodes() {
            let Some(sub) = node.submap() else {
                continue;
            };
            let covers = sub.phys_base() == phys
                && sub.covered() == map.shift().size()
                && Some(sub.shift()) == ladder.get(map.level() + 1)
                && sub.owner() == node.space()
                && sub.virt_base() == node.info(map.shift(), phys).virt;
            if !covers {
                return Err(InvariantViolation::Coverage { phys });
            }
            if sub.is_idle() {
                return Err(InvariantViolation::IdleSubmap { phys });
            }
            audit(sub, ladder)?;
        }
    }
    if busy != map.busy() {
        return Err(InvariantViolation::BusyCount {
            phys: map.phys_base(),
        });
    }
    Ok(())
}
