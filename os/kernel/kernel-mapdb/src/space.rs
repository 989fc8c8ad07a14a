//! # Address Space Identity

use core::fmt;

/// Identifies the address space that owns a mapping.
///
/// The mapping database never owns address spaces; a [`SpaceId`] is only the
/// key the page-table layer uses to find the space again when a mapping is
/// revoked.
#[repr(transparent)]
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct SpaceId(u64);

impl SpaceId {
    #[inline]
    #[must_use]
    pub const fn new(id: u64) -> Self {
        Self(id)
    }

    #[inline]
    #[must_use]
    pub const fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Debug for SpaceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Space({})", self.0)
    }
}

impl fmt::Display for SpaceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "S{}", self.0)
    }
}

impl From<u64> for SpaceId {
    #[inline]
    fn from(id: u64) -> Self {
        Self::new(id)
    }
}
