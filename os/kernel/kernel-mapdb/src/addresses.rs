//! # Addresses and Page Granularity
//!
//! Thin `u64` newtypes that keep physical and virtual addresses apart, plus
//! [`PageShift`], the runtime page granularity used by every level of the
//! mapping database.
//!
//! Unlike compile-time page-size markers, the mapping database works with a
//! ladder of sizes chosen at boot, so granularity travels as a value.

use core::fmt;
use core::ops::{Add, AddAssign};

/// Log2 of a page size, e.g. `12` for 4 KiB pages.
#[repr(transparent)]
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct PageShift(u8);

impl PageShift {
    /// 4 KiB pages.
    pub const SIZE_4K: Self = Self(12);
    /// 2 MiB pages.
    pub const SIZE_2M: Self = Self(21);
    /// 1 GiB pages.
    pub const SIZE_1G: Self = Self(30);

    #[inline]
    #[must_use]
    pub const fn new(shift: u8) -> Self {
        Self(shift)
    }

    #[inline]
    #[must_use]
    pub const fn as_u8(self) -> u8 {
        self.0
    }

    #[inline]
    #[must_use]
    pub const fn as_u32(self) -> u32 {
        self.0 as u32
    }

    /// Page size in bytes.
    #[inline]
    #[must_use]
    pub const fn size(self) -> u64 {
        1 << self.0
    }

    /// Mask of the in-page offset bits.
    #[inline]
    #[must_use]
    pub const fn offset_mask(self) -> u64 {
        self.size() - 1
    }
}

impl fmt::Display for PageShift {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.0 {
            s @ 30.. => write!(f, "{}G", 1u64 << (s - 30)),
            s @ 20..30 => write!(f, "{}M", 1u64 << (s - 20)),
            s @ 10..20 => write!(f, "{}K", 1u64 << (s - 10)),
            s => write!(f, "{}B", 1u64 << s),
        }
    }
}

impl fmt::Debug for PageShift {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

macro_rules! address_type {
    ($(#[$meta:meta])* $name:ident, $debug:literal) => {
        $(#[$meta])*
        #[repr(transparent)]
        #[derive(Copy, Clone, Default, Eq, PartialEq, Ord, PartialOrd, Hash)]
        pub struct $name(u64);

        impl $name {
            #[inline]
            #[must_use]
            pub const fn new(value: u64) -> Self {
                Self(value)
            }

            #[inline]
            #[must_use]
            pub const fn zero() -> Self {
                Self(0)
            }

            #[inline]
            #[must_use]
            pub const fn as_u64(self) -> u64 {
                self.0
            }

            /// Whether the low `shift` bits are clear.
            #[inline]
            #[must_use]
            pub const fn is_aligned(self, shift: PageShift) -> bool {
                self.0 & shift.offset_mask() == 0
            }

            #[inline]
            #[must_use]
            pub const fn align_down(self, shift: PageShift) -> Self {
                Self(self.0 & !shift.offset_mask())
            }

            /// Page number at granularity `shift`.
            #[inline]
            #[must_use]
            pub const fn page_number(self, shift: PageShift) -> u64 {
                self.0 >> shift.0
            }

            /// Address of page number `page` at granularity `shift`.
            #[inline]
            #[must_use]
            pub const fn from_page_number(page: u64, shift: PageShift) -> Self {
                Self(page << shift.0)
            }

            /// Offset within the page of granularity `shift`.
            #[inline]
            #[must_use]
            pub const fn offset(self, shift: PageShift) -> u64 {
                self.0 & shift.offset_mask()
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, concat!($debug, "(0x{:016X})"), self.0)
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "0x{:016X}", self.0)
            }
        }

        impl From<u64> for $name {
            #[inline]
            fn from(v: u64) -> Self {
                Self::new(v)
            }
        }

        impl Add<u64> for $name {
            type Output = Self;
            #[inline]
            fn add(self, rhs: u64) -> Self::Output {
                Self(self.0 + rhs)
            }
        }

        impl AddAssign<u64> for $name {
            #[inline]
            fn add_assign(&mut self, rhs: u64) {
                self.0 += rhs;
            }
        }
    };
}

address_type!(
    /// Physical memory address (RAM or MMIO), the key of the mapping database.
    PhysicalAddress,
    "PA"
);

address_type!(
    /// Virtual address inside one address space.
    VirtualAddress,
    "VA"
);

/// Half-open virtual address range `[start, end)` in one address space.
#[derive(Copy, Clone, Eq, PartialEq, Hash)]
pub struct VirtRange {
    start: VirtualAddress,
    end: VirtualAddress,
}

impl VirtRange {
    /// Creates `[start, end)`. An inverted range is treated as empty.
    #[inline]
    #[must_use]
    pub const fn new(start: VirtualAddress, end: VirtualAddress) -> Self {
        if end.as_u64() < start.as_u64() {
            Self { start, end: start }
        } else {
            Self { start, end }
        }
    }

    /// The range `[start, start + len)`, saturating at the top of the space.
    #[inline]
    #[must_use]
    pub const fn with_len(start: VirtualAddress, len: u64) -> Self {
        Self::new(start, VirtualAddress::new(start.as_u64().saturating_add(len)))
    }

    /// The whole page of granularity `shift` that contains `virt`.
    #[inline]
    #[must_use]
    pub const fn page(virt: VirtualAddress, shift: PageShift) -> Self {
        let start = virt.align_down(shift);
        Self::with_len(start, shift.size())
    }

    /// Every address.
    #[inline]
    #[must_use]
    pub const fn all() -> Self {
        Self::new(VirtualAddress::zero(), VirtualAddress::new(u64::MAX))
    }

    #[inline]
    #[must_use]
    pub const fn start(&self) -> VirtualAddress {
        self.start
    }

    #[inline]
    #[must_use]
    pub const fn end(&self) -> VirtualAddress {
        self.end
    }

    #[inline]
    #[must_use]
    pub const fn len(&self) -> u64 {
        self.end.as_u64() - self.start.as_u64()
    }

    #[inline]
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Both ends aligned to `shift`. The saturated upper end of [`VirtRange::all`]
    /// counts as aligned.
    #[inline]
    #[must_use]
    pub const fn is_aligned(&self, shift: PageShift) -> bool {
        self.start.is_aligned(shift) && (self.end.is_aligned(shift) || self.end.as_u64() == u64::MAX)
    }

    #[inline]
    #[must_use]
    pub const fn intersect(&self, other: &Self) -> Self {
        let start = if self.start.as_u64() > other.start.as_u64() {
            self.start
        } else {
            other.start
        };
        let end = if self.end.as_u64() < other.end.as_u64() {
            self.end
        } else {
            other.end
        };
        Self::new(start, end)
    }

    #[inline]
    #[must_use]
    pub const fn contains(&self, other: &Self) -> bool {
        self.start.as_u64() <= other.start.as_u64() && other.end.as_u64() <= self.end.as_u64()
    }
}

impl fmt::Debug for VirtRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}, {})", self.start, self.end)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn page_shift_sizes_and_display() {
        assert_eq!(PageShift::SIZE_4K.size(), 4096);
        assert_eq!(PageShift::SIZE_2M.offset_mask(), 0x1F_FFFF);
        assert_eq!(format!("{}", PageShift::SIZE_4K), "4K");
        assert_eq!(format!("{}", PageShift::SIZE_2M), "2M");
        assert_eq!(format!("{}", PageShift::new(22)), "4M");
        assert_eq!(format!("{}", PageShift::SIZE_1G), "1G");
    }

    #[test]
    fn alignment_helpers() {
        let a = PhysicalAddress::new(0x12345);
        assert!(!a.is_aligned(PageShift::SIZE_4K));
        assert_eq!(a.align_down(PageShift::SIZE_4K).as_u64(), 0x12000);
        assert_eq!(a.page_number(PageShift::SIZE_4K), 0x12);
        assert_eq!(a.offset(PageShift::SIZE_4K), 0x345);
        assert_eq!(
            VirtualAddress::from_page_number(3, PageShift::SIZE_2M).as_u64(),
            3 * 0x20_0000
        );
    }

    #[test]
    fn range_intersection_and_containment() {
        let page = VirtRange::page(VirtualAddress::new(0x20_1234), PageShift::SIZE_2M);
        assert_eq!(page.start().as_u64(), 0x20_0000);
        assert_eq!(page.len(), 0x20_0000);

        let r = VirtRange::with_len(VirtualAddress::new(0x3F_F000), 0x2000);
        let i = page.intersect(&r);
        assert_eq!(i.start().as_u64(), 0x3F_F000);
        assert_eq!(i.end().as_u64(), 0x40_0000);
        assert!(page.contains(&i));
        assert!(!i.contains(&page));

        let disjoint = VirtRange::with_len(VirtualAddress::new(0x80_0000), 0x1000);
        assert!(page.intersect(&disjoint).is_empty());
        assert!(VirtRange::all().is_aligned(PageShift::SIZE_1G));
    }
}
