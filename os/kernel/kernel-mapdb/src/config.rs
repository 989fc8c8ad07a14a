//! # Boot-Time Configuration
//!
//! The mapping database is built once at boot from a [`MapdbConfig`]: the
//! root address space that initially holds all physical memory, the physical
//! range to manage, and the coarse-to-fine [`PageSizeLadder`] used when a
//! mapping is split into nested treemaps.

use crate::addresses::{PageShift, PhysicalAddress};
use crate::error::ConfigError;
use crate::space::SpaceId;

/// Maximum number of page sizes on a ladder (and thus treemap nesting depth).
pub const MAX_LEVELS: usize = 4;

/// Smallest supported page size (4 KiB).
pub const MIN_PAGE_SHIFT: u8 = 12;

/// Largest supported page size (128 TiB, the canonical lower half).
pub const MAX_PAGE_SHIFT: u8 = 47;

/// Widest single split step; a nested treemap has at most `1 << MAX_SPLIT_SHIFT` slots.
pub const MAX_SPLIT_SHIFT: u8 = 12;

const _: () = {
    assert!(MAX_LEVELS >= 1);
    assert!(MIN_PAGE_SHIFT < MAX_PAGE_SHIFT);
    assert!(MAX_SPLIT_SHIFT > 0);
};

/// Page sizes from coarsest to finest.
///
/// ### Example
/// ```rust
/// # use kernel_mapdb::{PageShift, PageSizeLadder};
/// let ladder = PageSizeLadder::new(&[PageShift::new(22), PageShift::SIZE_4K]).unwrap();
/// assert_eq!(ladder.coarsest(), PageShift::new(22));
/// assert_eq!(ladder.finest(), PageShift::SIZE_4K);
/// assert_eq!(ladder.level_of(PageShift::SIZE_4K), Some(1));
/// ```
#[derive(Copy, Clone, Eq, PartialEq)]
pub struct PageSizeLadder {
    shifts: [PageShift; MAX_LEVELS],
    len: usize,
}

impl PageSizeLadder {
    /// x86-64: 1 GiB, 2 MiB and 4 KiB pages.
    pub const X86_64: Self = Self {
        shifts: [
            PageShift::SIZE_1G,
            PageShift::SIZE_2M,
            PageShift::SIZE_4K,
            PageShift::SIZE_4K,
        ],
        len: 3,
    };

    /// Validates and copies `shifts`.
    ///
    /// # Errors
    /// - [`ConfigError::EmptyLadder`] / [`ConfigError::TooManyLevels`] on a bad length.
    /// - [`ConfigError::PageSizeOutOfBounds`] for sizes outside
    ///   [`MIN_PAGE_SHIFT`]`..=`[`MAX_PAGE_SHIFT`].
    /// - [`ConfigError::LadderOrder`] unless strictly coarse to fine.
    /// - [`ConfigError::SplitTooWide`] if one step exceeds [`MAX_SPLIT_SHIFT`].
    pub fn new(shifts: &[PageShift]) -> Result<Self, ConfigError> {
        if shifts.is_empty() {
            return Err(ConfigError::EmptyLadder);
        }
        if shifts.len() > MAX_LEVELS {
            return Err(ConfigError::TooManyLevels { max: MAX_LEVELS });
        }

        let mut ladder = Self {
            shifts: [PageShift::SIZE_4K; MAX_LEVELS],
            len: shifts.len(),
        };
        for (i, &shift) in shifts.iter().enumerate() {
            if !(MIN_PAGE_SHIFT..=MAX_PAGE_SHIFT).contains(&shift.as_u8()) {
                return Err(ConfigError::PageSizeOutOfBounds { shift });
            }
            if let Some(&coarse) = i.checked_sub(1).and_then(|p| shifts.get(p)) {
                if shift >= coarse {
                    return Err(ConfigError::LadderOrder { shift });
                }
                if coarse.as_u8() - shift.as_u8() > MAX_SPLIT_SHIFT {
                    return Err(ConfigError::SplitTooWide { coarse, fine: shift });
                }
            }
            ladder.shifts[i] = shift;
        }
        Ok(ladder)
    }

    /// Number of levels.
    #[inline]
    #[must_use]
    pub const fn len(&self) -> usize {
        self.len
    }

    /// Always `false`; a validated ladder has at least one level.
    #[inline]
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.len == 0
    }

    #[inline]
    #[must_use]
    pub fn get(&self, level: usize) -> Option<PageShift> {
        self.as_slice().get(level).copied()
    }

    #[inline]
    #[must_use]
    pub const fn coarsest(&self) -> PageShift {
        self.shifts[0]
    }

    #[inline]
    #[must_use]
    pub const fn finest(&self) -> PageShift {
        self.shifts[self.len - 1]
    }

    /// Ladder level at which pages of `shift` are tracked.
    #[must_use]
    pub fn level_of(&self, shift: PageShift) -> Option<usize> {
        self.as_slice().iter().position(|&s| s == shift)
    }

    #[inline]
    #[must_use]
    pub fn as_slice(&self) -> &[PageShift] {
        &self.shifts[..self.len]
    }
}

impl Default for PageSizeLadder {
    fn default() -> Self {
        Self::X86_64
    }
}

impl core::fmt::Debug for PageSizeLadder {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_list().entries(self.as_slice()).finish()
    }
}

/// Construction parameters of a [`Mapdb`](crate::Mapdb).
///
/// ### Example
/// ```rust
/// # use kernel_mapdb::{MapdbConfig, PhysicalAddress, SpaceId};
/// let config = MapdbConfig::new(SpaceId::new(0))
///     .with_phys_range(PhysicalAddress::zero(), 4 << 30);
/// assert!(config.validate().is_ok());
/// ```
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct MapdbConfig {
    /// Space that holds all managed memory before anything is mapped.
    pub root_space: SpaceId,
    /// First managed physical address.
    pub phys_base: PhysicalAddress,
    /// Number of managed bytes.
    pub phys_size: u64,
    /// Page sizes used for nested treemaps.
    pub ladder: PageSizeLadder,
}

impl MapdbConfig {
    /// A configuration with an empty physical range and the x86-64 ladder.
    #[must_use]
    pub const fn new(root_space: SpaceId) -> Self {
        Self {
            root_space,
            phys_base: PhysicalAddress::zero(),
            phys_size: 0,
            ladder: PageSizeLadder::X86_64,
        }
    }

    #[must_use]
    pub const fn with_root_space(mut self, root_space: SpaceId) -> Self {
        self.root_space = root_space;
        self
    }

    #[must_use]
    pub const fn with_phys_range(mut self, base: PhysicalAddress, size: u64) -> Self {
        self.phys_base = base;
        self.phys_size = size;
        self
    }

    #[must_use]
    pub const fn with_ladder(mut self, ladder: PageSizeLadder) -> Self {
        self.ladder = ladder;
        self
    }

    /// Checks the physical range against the ladder.
    ///
    /// # Errors
    /// - [`ConfigError::EmptyRange`] for a zero-sized range.
    /// - [`ConfigError::RangeMisaligned`] unless base and size are multiples
    ///   of the coarsest page.
    /// - [`ConfigError::RangeOverflow`] if the range wraps.
    pub const fn validate(&self) -> Result<(), ConfigError> {
        let top = self.ladder.coarsest();
        if self.phys_size == 0 {
            return Err(ConfigError::EmptyRange);
        }
        if !self.phys_base.is_aligned(top) || self.phys_size & top.offset_mask() != 0 {
            return Err(ConfigError::RangeMisaligned { shift: top });
        }
        if self.phys_base.as_u64().checked_add(self.phys_size).is_none() {
            return Err(ConfigError::RangeOverflow);
        }
        Ok(())
    }

    /// Number of top-level frames the configuration describes.
    #[inline]
    #[must_use]
    pub const fn top_frames(&self) -> u64 {
        self.phys_size >> self.ladder.coarsest().as_u32()
    }
}
