//! # Kernel Mapping Database
//!
//! Tracks, for every physical page the kernel manages, which address spaces
//! map it and from which mapping each of those was derived, so that revoking
//! a mapping can revoke everything derived from it.
//!
//! ## Structure
//!
//! * A top-level [`Treemap`] slices the managed physical range into pages of
//!   the coarsest configured size. Each slot is a [`Physframe`] behind its own
//!   spinlock ([`FrameLock`]).
//! * A frame holds a [`MappingTree`]: the derivation tree of that page at that
//!   size, packed in preorder. Its root is the frame's original owner.
//! * When a mapping is derived at a finer size, the node it derives from
//!   gains a nested treemap (its *submap*) covering its page at the next
//!   finer size of the [`PageSizeLadder`]. Submaps that no longer record
//!   anything are merged back.
//!
//! ## Usage
//!
//! [`Mapdb::lookup`] locks the top-level frame and returns a [`Frame`] handle
//! positioned at the mapping. Through it, [`Frame::insert`] derives a new
//! mapping, [`Frame::flush`] / [`Frame::flush_with`] revoke derived mappings
//! (or probe their access state), and [`Frame::foreach_mapping`] walks them.
//! Dropping the handle unlocks the frame.
//!
//! Storage is charged to a [`SlabQuota`]; exhausting it surfaces as
//! [`MapdbError::OutOfMemory`] and leaves the database unchanged.

#![cfg_attr(not(any(test, doctest)), no_std)]
#![allow(unsafe_code)]

extern crate alloc;

mod access;
mod addresses;
mod config;
mod dump;
mod error;
mod frame;
mod lock;
mod mapdb;
mod mapping;
mod mapping_tree;
mod quota;
mod space;
mod treemap;

pub use access::AccessFlags;
pub use addresses::{PageShift, PhysicalAddress, VirtRange, VirtualAddress};
pub use config::{
    MAX_LEVELS, MAX_PAGE_SHIFT, MAX_SPLIT_SHIFT, MIN_PAGE_SHIFT, MapdbConfig, PageSizeLadder,
};
pub use dump::FrameDump;
pub use error::{ConfigError, InvariantViolation, MapdbError};
pub use frame::{FlushMode, Frame};
pub use lock::{FrameGuard, FrameLock};
pub use mapdb::Mapdb;
pub use mapping::{Mapping, MappingInfo};
pub use mapping_tree::{MAX_CAPACITY, MIN_CAPACITY, MappingTree, block_bytes};
pub use quota::{BoundedQuota, SlabQuota, UNLIMITED, Unlimited};
pub use space::SpaceId;
pub use treemap::{FrameState, Physframe, Treemap};
