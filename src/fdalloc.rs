//! FD Slot Allocator: carves two-page entry slots from the top of the
//! device downward, with a bounded deletion stack for reuse.

use crate::bitmap::Bitmap;
use crate::error::{Error, Result};
use crate::layout::FILE_SLOT_PAGES;

pub enum FreeOutcome {
    Done,
    /// The entry that lived at `from` must be rewritten at `to`, its
    /// in-memory `pageid` updated, and (if a directory) every child's
    /// `parentid` updated to `to`.
    Relocate { from: u64, to: u64 },
}

pub struct FdAllocator {
    fd_next_page: u64,
    fd_count: u64,
    dir_count: u64,
    delmax: u32,
    delstack: Vec<u64>,
    data_page: u64,
}

impl FdAllocator {
    pub fn new(fd_next_page: u64, fd_count: u64, dir_count: u64, delmax: u32, data_page: u64) -> Self {
        FdAllocator {
            fd_next_page,
            fd_count,
            dir_count,
            delmax,
            delstack: Vec::new(),
            data_page,
        }
    }

    pub fn with_delstack(mut self, delstack: Vec<u64>) -> Self {
        self.delstack = delstack;
        self
    }

    pub fn fd_next_page(&self) -> u64 {
        self.fd_next_page
    }

    pub fn fd_count(&self) -> u64 {
        self.fd_count
    }

    pub fn dir_count(&self) -> u64 {
        self.dir_count
    }

    pub fn delstack(&self) -> &[u64] {
        &self.delstack
    }

    pub fn delmax(&self) -> u32 {
        self.delmax
    }

    /// The lowest-address slot currently allocated (the allocation frontier).
    pub fn frontier(&self) -> u64 {
        self.fd_next_page + FILE_SLOT_PAGES
    }

    pub fn allocate(&mut self, bitmap: &mut Bitmap, isdir: bool) -> Result<u64> {
        if let Some(slot) = self.delstack.pop() {
            self.fd_count += 1;
            if isdir {
                self.dir_count += 1;
            }
            return Ok(slot);
        }

        if self.fd_next_page < self.data_page {
            return Err(Error::OutOfSpace);
        }
        let slot = self.fd_next_page;
        bitmap.set_exact(slot, FILE_SLOT_PAGES);
        self.fd_next_page -= FILE_SLOT_PAGES;
        self.fd_count += 1;
        if isdir {
            self.dir_count += 1;
        }
        Ok(slot)
    }

    /// Frees the slot at `pageid`. Freeing the exact allocation frontier
    /// always shrinks the FD area immediately (and then coalesces any
    /// trailing holes that were already sitting in the deletion stack, so
    /// the stack never ends up holding the frontier address). Freeing any
    /// other slot pushes a hole onto the deletion stack if there's room, or
    /// — once the stack is full — relocates the frontier entry into the
    /// freed slot and shrinks (see `FreeOutcome`).
    pub fn free(&mut self, bitmap: &mut Bitmap, pageid: u64, isdir: bool) -> FreeOutcome {
        let outcome = if pageid == self.frontier() {
            bitmap.clear_exact(pageid, FILE_SLOT_PAGES);
            self.fd_next_page += FILE_SLOT_PAGES;
            self.coalesce_trailing_holes(bitmap);
            FreeOutcome::Done
        } else if (self.delstack.len() as u32) < self.delmax {
            self.delstack.push(pageid);
            FreeOutcome::Done
        } else {
            let frontier = self.frontier();
            bitmap.clear_exact(frontier, FILE_SLOT_PAGES);
            self.fd_next_page += FILE_SLOT_PAGES;
            self.coalesce_trailing_holes(bitmap);
            FreeOutcome::Relocate { from: frontier, to: pageid }
        };

        self.fd_count -= 1;
        if isdir {
            self.dir_count -= 1;
        }
        outcome
    }

    /// After a shrink, the new frontier may itself already be a recorded
    /// hole (pushed while it was an interior slot, later becoming the
    /// boundary). Absorb any such holes so the deletion stack never holds
    /// the frontier address.
    fn coalesce_trailing_holes(&mut self, bitmap: &mut Bitmap) {
        while let Some(pos) = self.delstack.iter().position(|&s| s == self.frontier()) {
            self.delstack.remove(pos);
            let frontier = self.frontier();
            bitmap.clear_exact(frontier, FILE_SLOT_PAGES);
            self.fd_next_page += FILE_SLOT_PAGES;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fixture() -> (Bitmap, FdAllocator) {
        let bm = Bitmap::new(16, 10);
        let fd = FdAllocator::new(1000 - FILE_SLOT_PAGES, 0, 0, 2, 10);
        (bm, fd)
    }

    #[test]
    fn allocate_carves_from_the_top_downward() {
        let (mut bm, mut fd) = fixture();
        let a = fd.allocate(&mut bm, false).unwrap();
        let b = fd.allocate(&mut bm, true).unwrap();
        assert_eq!(a, 998);
        assert_eq!(b, 996);
        assert_eq!(fd.fd_count(), 2);
        assert_eq!(fd.dir_count(), 1);
    }

    #[test]
    fn free_under_stack_capacity_just_pushes() {
        let (mut bm, mut fd) = fixture();
        let a = fd.allocate(&mut bm, false).unwrap();
        let _b = fd.allocate(&mut bm, false).unwrap();
        assert!(matches!(fd.free(&mut bm, a, false), FreeOutcome::Done));
        assert_eq!(fd.delstack(), &[a]);
    }

    #[test]
    fn freeing_the_frontier_shrinks_immediately() {
        let (mut bm, mut fd) = fixture();
        let a = fd.allocate(&mut bm, false).unwrap();
        assert_eq!(fd.frontier(), a);
        assert!(matches!(fd.free(&mut bm, a, false), FreeOutcome::Done));
        assert!(fd.delstack().is_empty(), "the frontier must not be tracked as a hole");
        assert!(!bm.is_set(a));
    }

    #[test]
    fn free_of_non_frontier_slot_relocates_the_frontier_entry_when_stack_full() {
        let (mut bm, mut fd) = fixture();
        let a = fd.allocate(&mut bm, false).unwrap(); // 998
        let b = fd.allocate(&mut bm, false).unwrap(); // 996
        let c = fd.allocate(&mut bm, false).unwrap(); // 994
        let d = fd.allocate(&mut bm, false).unwrap(); // 992, the frontier

        fd.free(&mut bm, b, false); // interior hole, stack now [b]
        fd.free(&mut bm, a, false); // interior hole, stack now [b, a] (full, delmax = 2)
        assert_eq!(fd.frontier(), d);

        match fd.free(&mut bm, c, false) {
            FreeOutcome::Relocate { from, to } => {
                assert_eq!(from, d, "the entry at the frontier must move");
                assert_eq!(to, c, "it must move into the freed slot");
            }
            FreeOutcome::Done => panic!("expected a relocation once the stack is full"),
        }
        assert_eq!(fd.delstack(), &[b, a], "the existing holes are untouched");
        assert_eq!(fd.frontier(), c);
    }
}
