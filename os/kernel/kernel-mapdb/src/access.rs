//! # Access Flags
//!
//! Reference and modification state harvested from page-table entries and
//! recorded on mapping nodes. A flush returns the union of the flags of every
//! node it removed or probed.

use bitfield_struct::bitfield;
use core::ops::{BitOr, BitOrAssign};

/// Access state of one mapping.
///
/// | Bit | Name       | Meaning |
/// |-----|------------|---------|
/// | 0   | `accessed` | The page was referenced (read, write or fetch) |
/// | 1   | `written`  | The page was written (dirty) |
/// | 2   | `executed` | An instruction was fetched from the page |
/// | 3–7 | reserved   | Must be zero |
///
/// ### Example
/// ```rust
/// # use kernel_mapdb::AccessFlags;
/// let flags = AccessFlags::new().with_accessed(true) | AccessFlags::new().with_written(true);
/// assert!(flags.accessed() && flags.written());
/// assert!(!flags.executed());
/// ```
#[bitfield(u8)]
#[derive(PartialEq, Eq)]
pub struct AccessFlags {
    /// Referenced through any access.
    pub accessed: bool,
    /// Written (dirty).
    pub written: bool,
    /// Instruction fetch.
    pub executed: bool,
    #[bits(5)]
    __reserved: u8,
}

impl AccessFlags {
    /// Read and write access, what a store through a mapping reports.
    #[inline]
    #[must_use]
    pub const fn touched_writable() -> Self {
        Self::new().with_accessed(true).with_written(true)
    }

    #[inline]
    #[must_use]
    pub const fn is_empty(self) -> bool {
        self.into_bits() == 0
    }

    #[inline]
    #[must_use]
    pub const fn union(self, other: Self) -> Self {
        Self::from_bits(self.into_bits() | other.into_bits())
    }

    /// Returns the flags and clears them in place.
    #[inline]
    pub const fn take(&mut self) -> Self {
        let flags = *self;
        *self = Self::new();
        flags
    }
}

impl BitOr for AccessFlags {
    type Output = Self;

    #[inline]
    fn bitor(self, rhs: Self) -> Self {
        self.union(rhs)
    }
}

impl BitOrAssign for AccessFlags {
    #[inline]
    fn bitor_assign(&mut self, rhs: Self) {
        *self = self.union(rhs);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn union_and_take() {
        let mut a = AccessFlags::new().with_accessed(true);
        a |= AccessFlags::new().with_executed(true);
        assert!(a.accessed() && a.executed() && !a.written());

        let taken = a.take();
        assert_eq!(taken.into_bits(), 0b101);
        assert!(a.is_empty());
    }

    #[test]
    fn touched_writable_sets_both_bits() {
        let f = AccessFlags::touched_writable();
        assert!(f.accessed());
        assert!(f.written());
        assert_eq!(f | AccessFlags::new(), f);
    }
}
