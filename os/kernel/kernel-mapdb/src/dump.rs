//! # Debugger Dump
//!
//! Renders one top-level frame with everything nested below it:
//!
//! ```text
//! frame 0x0000000000000000 [1G]
//!   S0 0x0000000000000000 -> 0x0000000000000000 [1G] d=0 +split
//!     slot 1 [2M]
//!       S0 0x0000000000200000 -> 0x0000000000200000 [2M] d=0 +split
//!         slot 0 [4K]
//!           S0 0x0000000000200000 -> 0x0000000000200000 [4K] d=0
//!             S1 0x0000000070000000 -> 0x0000000000200000 [4K] d=1
//!     511 implicit
//! ```
//!
//! Frames are only ever `try_lock`ed; a frame somebody else holds shows up
//! as `<locked>`.

use crate::addresses::PhysicalAddress;
use crate::mapdb::Mapdb;
use crate::treemap::{FrameState, Treemap};
use core::fmt;

/// [`Display`](fmt::Display) adapter returned by [`Mapdb::dump`].
#[derive(Debug, Copy, Clone)]
pub struct FrameDump<'a> {
    db: &'a Mapdb,
    phys: PhysicalAddress,
}

impl<'a> FrameDump<'a> {
    pub(crate) const fn new(db: &'a Mapdb, phys: PhysicalAddress) -> Self {
        Self { db, phys }
    }
}

impl fmt::Display for FrameDump<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let top = self.db.top();
        let Some(slot) = top.slot_for(self.phys) else {
            return writeln!(f, "frame {} not managed", self.phys);
        };
        writeln!(f, "frame {} [{}]", top.slot_phys(slot), top.shift())?;
        dump_frame(f, top, slot, 1)
    }
}

fn dump_frame(f: &mut fmt::Formatter<'_>, map: &Treemap, slot: usize, indent: usize) -> fmt::Result {
    let Some(guard) = map.frame(slot).try_lock() else {
        return writeln!(f, "{:w$}<locked>", "", w = indent * 2);
    };
    let tree = match &*guard {
        FrameState::Implicit => {
            return writeln!(f, "{:w$}{} (implicit)", "", map.root_info(slot), w = indent * 2);
        }
        FrameState::Revoked => return writeln!(f, "{:w$}<revoked>", "", w = indent * 2),
        FrameState::Tree(tree) => tree,
    };

    let phys = map.slot_phys(slot);
    for node in tree.nodes() {
        let at = indent + usize::from(node.depth());
        writeln!(f, "{:w$}{}", "", node.info(map.shift(), phys), w = at * 2)?;
        let Some(sub) = node.submap() else {
            continue;
        };

        let mut implicit = 0;
        for sub_slot in 0..sub.len() {
            let quiet = sub
                .frame(sub_slot)
                .try_lock()
                .is_some_and(|g| g.is_implicit());
            if quiet {
                implicit += 1;
                continue;
            }
            writeln!(f, "{:w$}slot {sub_slot} [{}]", "", sub.shift(), w = (at + 1) * 2)?;
            dump_frame(f, sub, sub_slot, at + 2)?;
        }
        if implicit > 0 {
            writeln!(f, "{:w$}{implicit} implicit", "", w = (at + 1) * 2)?;
        }
    }
    Ok(())
}
