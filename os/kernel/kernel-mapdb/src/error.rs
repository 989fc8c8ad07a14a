//! # Errors

use crate::addresses::{PageShift, PhysicalAddress};

/// Failure of a mapping-database operation.
///
/// Every variant is recoverable from the database's point of view: the
/// operation that reported it left all frames unlocked (unless a handle was
/// returned) and every tree in preorder.
#[derive(Debug, Copy, Clone, PartialEq, Eq, thiserror::Error)]
pub enum MapdbError {
    /// No node matches the requested space and address.
    #[error("no such mapping")]
    NotMapped,
    /// The target space already holds a node for that page at that size.
    #[error("target page is already mapped")]
    AlreadyMapped,
    /// An address or range is not aligned to the requested page size.
    #[error("address not aligned to the page size")]
    Misaligned,
    /// Tree or treemap storage could not be allocated.
    #[error("out of mapping-database memory")]
    OutOfMemory,
    /// An insert asked for a page larger than the page it derives from.
    #[error("page size exceeds the parent mapping's granularity")]
    ExceedsParentGranularity,
    /// A physical address lies outside the managed range or the anchor's page.
    #[error("physical address out of range")]
    OutOfRange,
    /// The page size is not on the configured ladder.
    #[error("unsupported page size")]
    UnsupportedPageSize,
    /// The derivation chain is too deep to record.
    #[error("mapping tree depth exceeded")]
    DepthExceeded,
    /// The frame handle already carried out its mutating operation.
    #[error("frame handle already used for a mutation")]
    HandleSpent,
    #[error(transparent)]
    Config(#[from] ConfigError),
}

/// Rejected [`MapdbConfig`](crate::MapdbConfig).
#[derive(Debug, Copy, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("page-size ladder is empty")]
    EmptyLadder,
    #[error("page-size ladder has more than {max} levels")]
    TooManyLevels { max: usize },
    #[error("page-size ladder is not strictly coarse to fine at {shift}")]
    LadderOrder { shift: PageShift },
    #[error("page size {shift} is outside the supported range")]
    PageSizeOutOfBounds { shift: PageShift },
    #[error("splitting {coarse} into {fine} pages needs too many slots")]
    SplitTooWide { coarse: PageShift, fine: PageShift },
    #[error("physical range is empty")]
    EmptyRange,
    #[error("physical range is not aligned to {shift} pages")]
    RangeMisaligned { shift: PageShift },
    #[error("physical range overflows the address space")]
    RangeOverflow,
}

/// Structural defect found by [`Mapdb::check_invariants`](crate::Mapdb::check_invariants).
#[derive(Debug, Copy, Clone, PartialEq, Eq, thiserror::Error)]
pub enum InvariantViolation {
    #[error("tree of {phys} is empty or not in preorder")]
    NotPreorder { phys: PhysicalAddress },
    #[error("tree of {phys} is a plain root that should be implicit")]
    NotCollapsed { phys: PhysicalAddress },
    #[error("submap under {phys} does not cover exactly its parent page")]
    Coverage { phys: PhysicalAddress },
    #[error("submap under {phys} is idle but was not merged")]
    IdleSubmap { phys: PhysicalAddress },
    #[error("treemap at {phys} miscounts its materialised frames")]
    BusyCount { phys: PhysicalAddress },
}
