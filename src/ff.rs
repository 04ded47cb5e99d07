//! First-fit allocator: a Knuth TAOCP §2.5-style arena where every block of
//! the region is tagged in-use or free and joined, end to end, with no gaps.
//!
//! A block is
//!
//! ```text
//!  0        4        8       12            size-1 size
//!  +--------+--------+--------+-- ... --+--------+
//!  | szetag | next   | prev   | payload  |  tag   |
//!  +--------+--------+--------+-- ... --+--------+
//! ```
//!
//! `szetag` packs the total block size (including the header word and the
//! single trailer byte) together with the in-use bit: `(size << 1) | tag`.
//! The trailer is a single byte equal to `tag` — not a second copy of the
//! size — so a neighbor's address arithmetic alone tells you whether it is
//! free, but recovering *which* free block that is still means walking the
//! avail list, exactly as Knuth's original `free` does. `next`/`prev` only
//! hold meaningful data while the block is free: they are the avail list's
//! intrusive links, living inside the free bytes they describe.
//!
//! The avail list is kept sorted ascending by block size. `get` walks it from
//! the small end and takes the first block that fits, which is the
//! classic "first fit" search Knuth describes, applied to a list ordered by
//! size rather than address.

use modular_bitfield::prelude::*;

use crate::diag::{self, HeapStats};
use crate::error::{AllocError, Result};
use crate::region::{PseudoPtr, Region};

/// Packed layout of a block's header word: the top 31 bits hold the total
/// block size (header+payload+trailer), the low bit the in-use flag.
#[bitfield]
#[derive(Clone, Copy)]
struct SzeTag {
    tag: bool,
    size: B31,
}

const HEADER_SIZE: u32 = 4;
/// The trailer is a single tag byte, not a second size word.
const TRAILER_SIZE: u32 = 1;
const OVERHEAD: u32 = HEADER_SIZE + TRAILER_SIZE;
const NEXT_OFFSET: u32 = 4;
const PREV_OFFSET: u32 = 8;
/// `MINSIZE_FF`: the smallest block `get` ever hands out.
pub(crate) const MIN_BLOCK_SIZE: u32 = 32;

fn pack_sze_tag(size: u32, allocated: bool) -> u32 {
    let packed = SzeTag::new().with_size(size).with_tag(allocated);
    u32::from_le_bytes(packed.into_bytes())
}

fn unpack_sze_tag(raw: u32) -> (u32, bool) {
    let packed = SzeTag::from_bytes(raw.to_le_bytes());
    (packed.size(), packed.tag())
}

/// A first-fit arena over a caller-supplied [`Region`].
///
/// Holds only the avail list's head and tail; every other piece of state
/// (block sizes, tags, links) lives in the region itself, so `FirstFit` is
/// `Copy`-sized and cheap to wrap in a lock.
#[derive(Clone, Copy, Debug)]
pub struct FirstFit {
    region: Region,
    first: PseudoPtr,
    last: PseudoPtr,
}

impl FirstFit {
    /// Builds a first-fit arena spanning the whole of `region` as a single
    /// free block.
    ///
    /// Returns [`AllocError::Corruption`] if `region` is not strictly larger
    /// than `MIN_BLOCK_SIZE` (§4.1 init: "Fails if `hs <= 32`").
    pub fn init(region: Region) -> Result<Self> {
        if region.len() <= MIN_BLOCK_SIZE {
            log::error!(
                "region of {} byte(s) is not larger than the minimum block size {}",
                region.len(),
                MIN_BLOCK_SIZE
            );
            return Err(AllocError::Corruption);
        }

        let blk = PseudoPtr::new(0);
        let mut ff = Self {
            region,
            first: PseudoPtr::NONE,
            last: PseudoPtr::NONE,
        };
        unsafe {
            ff.write_block(blk, region.len(), false);
            ff.set_prev(blk, PseudoPtr::NONE);
            ff.set_next(blk, PseudoPtr::NONE);
        }
        ff.first = blk;
        ff.last = blk;
        Ok(ff)
    }

    #[must_use]
    pub const fn region(&self) -> &Region {
        &self.region
    }

    // -- block header/trailer accessors --------------------------------

    unsafe fn read_tag(&self, blk: PseudoPtr) -> (u32, bool) {
        unpack_sze_tag(self.region.read_u32(blk))
    }

    /// Reads only the in-use bit from the single trailer byte immediately
    /// before `trailer_end` — the trailer carries no size of its own.
    unsafe fn read_trailer_tag(&self, trailer_end: PseudoPtr) -> bool {
        self.region.read_u8(trailer_end - TRAILER_SIZE) != 0
    }

    /// Writes `size`/`allocated` to the header word and the one-byte
    /// trailer tag.
    unsafe fn write_block(&self, blk: PseudoPtr, size: u32, allocated: bool) {
        self.region.write_u32(blk, pack_sze_tag(size, allocated));
        self.region
            .write_u8(blk + size - TRAILER_SIZE, allocated as u8);
    }

    unsafe fn prev(&self, blk: PseudoPtr) -> PseudoPtr {
        self.region.read_link(blk + PREV_OFFSET)
    }

    unsafe fn set_prev(&self, blk: PseudoPtr, value: PseudoPtr) {
        self.region.write_link(blk + PREV_OFFSET, value);
    }

    unsafe fn next(&self, blk: PseudoPtr) -> PseudoPtr {
        self.region.read_link(blk + NEXT_OFFSET)
    }

    unsafe fn set_next(&self, blk: PseudoPtr, value: PseudoPtr) {
        self.region.write_link(blk + NEXT_OFFSET, value);
    }

    // -- avail list ------------------------------------------------------

    /// Inserts `blk` (already tagged free, with a size written to its
    /// header/trailer) into the avail list, keeping it sorted ascending by
    /// size.
    unsafe fn avail_insert(&mut self, blk: PseudoPtr, size: u32) {
        let mut cursor = self.first;
        while cursor.is_some() {
            let (cursor_size, _) = self.read_tag(cursor);
            if cursor_size >= size {
                break;
            }
            cursor = self.next(cursor);
        }

        if cursor.is_none() {
            // Larger than everything currently free: append at the tail.
            self.set_prev(blk, self.last);
            self.set_next(blk, PseudoPtr::NONE);
            if self.last.is_some() {
                self.set_next(self.last, blk);
            } else {
                self.first = blk;
            }
            self.last = blk;
        } else {
            let before = self.prev(cursor);
            self.set_prev(blk, before);
            self.set_next(blk, cursor);
            self.set_prev(cursor, blk);
            if before.is_some() {
                self.set_next(before, blk);
            } else {
                self.first = blk;
            }
        }
    }

    /// Splices `blk` out of the avail list.
    unsafe fn avail_remove(&mut self, blk: PseudoPtr) {
        let before = self.prev(blk);
        let after = self.next(blk);

        if before.is_some() {
            self.set_next(before, after);
        } else {
            self.first = after;
        }

        if after.is_some() {
            self.set_prev(after, before);
        } else {
            self.last = before;
        }
    }

    /// Smallest free block with `size >= needed`, or `None`.
    unsafe fn avail_find_fit(&self, needed: u32) -> Option<PseudoPtr> {
        let mut cursor = self.first;
        while cursor.is_some() {
            let (size, _) = self.read_tag(cursor);
            if size >= needed {
                return Some(cursor);
            }
            cursor = self.next(cursor);
        }
        None
    }

    /// Finds the avail-list entry whose byte range ends exactly at `end`,
    /// i.e. the free block immediately preceding `end` in address order.
    /// The avail list is sorted by size, not address, so this is a linear
    /// scan — the same one §4.1 `free` step 3 describes ("scanning the
    /// avail list for the entry whose `offset + size == offset(b)`").
    unsafe fn avail_find_by_end(&self, end: PseudoPtr) -> Option<PseudoPtr> {
        let mut cursor = self.first;
        while cursor.is_some() {
            let (size, _) = self.read_tag(cursor);
            if cursor + size == end {
                return Some(cursor);
            }
            cursor = self.next(cursor);
        }
        None
    }

    // -- public operations -------------------------------------------------

    /// Allocates at least `size` bytes, returning a pseudo-pointer to the
    /// payload.
    ///
    /// `size == 0` and `size` large enough that the effective block size
    /// would reach the whole arena both report [`AllocError::OutOfMemory`]
    /// rather than succeeding with a zero-capacity or whole-arena block.
    pub fn get(&mut self, size: u32) -> Result<PseudoPtr> {
        if size == 0 {
            log::trace!("ff::get(0) rejected");
            return Err(AllocError::OutOfMemory);
        }

        let needed = (size + OVERHEAD).max(MIN_BLOCK_SIZE);
        if needed >= self.region.len() {
            log::trace!(
                "ff::get({size}) needs {needed} byte(s), arena holds only {}",
                self.region.len()
            );
            return Err(AllocError::OutOfMemory);
        }

        let blk = unsafe { self.avail_find_fit(needed) }.ok_or_else(|| {
            log::trace!("ff::get({size}) found no fitting block");
            AllocError::OutOfMemory
        })?;

        unsafe {
            self.avail_remove(blk);
            let (blk_size, _) = self.read_tag(blk);

            if blk_size > needed + MIN_BLOCK_SIZE {
                let remainder = blk_size - needed;
                self.write_block(blk, needed, true);
                let split = blk + needed;
                self.write_block(split, remainder, false);
                self.avail_insert(split, remainder);
            } else {
                self.write_block(blk, blk_size, true);
            }

            Ok(blk + HEADER_SIZE)
        }
    }

    /// Releases a payload pointer previously returned by [`FirstFit::get`] or
    /// [`FirstFit::extend`], coalescing with either neighbor that is free.
    ///
    /// Returns [`AllocError::NotFound`] if `ptr` does not point at a
    /// currently-allocated block of this arena, and
    /// [`AllocError::Corruption`] if the trailer byte before the block
    /// claims a free predecessor that the avail list does not contain
    /// (§4.1 "INTERNAL when coalescence finds the previous neighbour absent
    /// from the avail list despite being untagged").
    pub fn free(&mut self, ptr: PseudoPtr) -> Result<()> {
        let mut blk = self.block_of(ptr)?;
        let (mut size, _) = unsafe { self.read_tag(blk) };

        unsafe {
            if blk.offset() >= TRAILER_SIZE && !self.read_trailer_tag(blk) {
                let prev_blk = self.avail_find_by_end(blk).ok_or_else(|| {
                    log::error!(
                        "ff::free: trailer before block at {blk} claims a free predecessor, \
                         but no avail-list entry ends there"
                    );
                    AllocError::Corruption
                })?;
                let (prev_size, _) = self.read_tag(prev_blk);
                self.avail_remove(prev_blk);
                blk = prev_blk;
                size += prev_size;
            }

            let next_blk = blk + size;
            if self.region.contains_range(next_blk, HEADER_SIZE) {
                let (next_size, next_allocated) = self.read_tag(next_blk);
                if !next_allocated {
                    self.avail_remove(next_blk);
                    size += next_size;
                }
            }

            self.write_block(blk, size, false);
            self.avail_insert(blk, size);
        }

        log::trace!("ff::free -> block of {size} byte(s) at {blk}");
        Ok(())
    }

    /// Resizes the allocation at `ptr` to `new_size` bytes, preserving its
    /// content up to `min(old, new)` bytes.
    ///
    /// Always allocates a fresh block, copies, and frees the old one: this
    /// arena does not attempt an in-place extension, even when the
    /// trailing neighbor is free and large enough.
    pub fn extend(&mut self, ptr: PseudoPtr, new_size: u32) -> Result<PseudoPtr> {
        let blk = self.block_of(ptr)?;
        let (blk_size, _) = unsafe { self.read_tag(blk) };
        let old_payload = blk_size - OVERHEAD;

        let new_ptr = self.get(new_size)?;
        unsafe {
            self.region
                .copy(ptr, new_ptr, old_payload.min(new_size));
        }
        // `blk` was already tagged allocated and is unaffected by `get`
        // possibly splitting other blocks, so this cannot fail.
        self.free(ptr).expect("old block just validated by block_of");
        Ok(new_ptr)
    }

    /// Resolves a payload pointer to its block header, checking that it is
    /// in range and currently allocated.
    fn block_of(&self, ptr: PseudoPtr) -> Result<PseudoPtr> {
        if ptr.is_none() || ptr.offset() < HEADER_SIZE {
            return Err(AllocError::NotFound);
        }
        let blk = ptr - HEADER_SIZE;
        if !self.region.contains_range(blk, HEADER_SIZE) {
            return Err(AllocError::NotFound);
        }
        let (size, allocated) = unsafe { self.read_tag(blk) };
        if !allocated || !self.region.contains_range(blk, size) {
            return Err(AllocError::NotFound);
        }
        Ok(blk)
    }

    /// Walks every block once, from the base of the region to its end,
    /// producing used/free byte totals.
    ///
    /// `lost` is always `0` for a `FirstFit` arena: its blocks partition the
    /// region exactly, with no byte belonging to neither side.
    #[must_use]
    pub fn stats(&self) -> HeapStats {
        let mut stats = HeapStats {
            mem: self.region.len(),
            ..HeapStats::default()
        };
        let mut cursor = PseudoPtr::new(0);
        while cursor.offset() < self.region.len() {
            let (size, allocated) = unsafe { self.read_tag(cursor) };
            if allocated {
                stats.used += size;
            } else {
                stats.free += size;
            }
            cursor = cursor + size;
        }
        stats
    }

    /// Writes an ANSI-colored, block-by-block visualisation of the arena to
    /// `w`, followed by the `stats()` summary.
    pub fn print<W: core::fmt::Write>(&self, w: &mut W) -> core::fmt::Result {
        let mut cursor = PseudoPtr::new(0);
        let mut first = true;
        while cursor.offset() < self.region.len() {
            let (size, allocated) = unsafe { self.read_tag(cursor) };
            if !first {
                w.write_str(" | ")?;
            }
            first = false;
            diag::write_block_token(w, size, allocated)?;
            cursor = cursor + size;
        }
        w.write_str("\n")?;
        diag::write_summary(w, self.stats())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use core::ptr::NonNull;

    fn arena(size: u32) -> FirstFit {
        let buf = Box::leak(vec![0u8; size as usize].into_boxed_slice());
        let region = unsafe { Region::new(NonNull::new(buf.as_mut_ptr()).unwrap(), size) };
        FirstFit::init(region).unwrap()
    }

    #[test]
    fn fresh_arena_is_one_free_block() {
        let ff = arena(256);
        let stats = ff.stats();
        assert_eq!(stats.used, 0);
        assert_eq!(stats.free, 256);
        assert!(stats.is_consistent());
    }

    #[test]
    fn get_then_free_returns_to_a_single_free_block() {
        let mut ff = arena(256);
        let p = ff.get(32).unwrap();
        assert!(ff.stats().used > 0);
        ff.free(p).unwrap();
        let stats = ff.stats();
        assert_eq!(stats.used, 0);
        assert_eq!(stats.free, 256);
    }

    #[test]
    fn small_request_rounds_up_to_minsize() {
        // End-to-end scenario §8-7: `get(27)` on a large arena allocates
        // exactly the minimum block size, since `27 + 5 < 32`.
        let mut ff = arena(1024 * 1024);
        let before = ff.stats();
        let _p = ff.get(27).unwrap();
        assert_eq!(ff.stats().used, MIN_BLOCK_SIZE);
        assert_eq!(ff.stats().free, before.free - MIN_BLOCK_SIZE);
    }

    #[test]
    fn zero_size_get_is_out_of_memory() {
        let mut ff = arena(256);
        assert_eq!(ff.get(0), Err(AllocError::OutOfMemory));
    }

    #[test]
    fn get_larger_than_arena_is_out_of_memory() {
        let mut ff = arena(64);
        assert_eq!(ff.get(1024), Err(AllocError::OutOfMemory));
    }

    #[test]
    fn free_of_unknown_pointer_is_not_found() {
        let mut ff = arena(256);
        assert_eq!(ff.free(PseudoPtr::new(0)), Err(AllocError::NotFound));
    }

    #[test]
    fn double_free_is_not_found() {
        let mut ff = arena(256);
        let p = ff.get(16).unwrap();
        ff.free(p).unwrap();
        assert_eq!(ff.free(p), Err(AllocError::NotFound));
    }

    #[test]
    fn coalesces_adjacent_neighbors_on_free() {
        let mut ff = arena(256);
        let a = ff.get(16).unwrap();
        let b = ff.get(16).unwrap();
        let c = ff.get(16).unwrap();
        ff.free(a).unwrap();
        ff.free(c).unwrap();
        // `b` borders two free blocks now; freeing it must merge all three.
        ff.free(b).unwrap();
        let stats = ff.stats();
        assert_eq!(stats.used, 0);
        assert_eq!(stats.free, 256);
    }

    #[test]
    fn extend_preserves_content() {
        let mut ff = arena(256);
        let p = ff.get(16).unwrap();
        unsafe {
            for i in 0..16u32 {
                ff.region().write_u8(p + i, i as u8);
            }
        }
        let grown = ff.extend(p, 64).unwrap();
        unsafe {
            for i in 0..16u32 {
                assert_eq!(ff.region().read_u8(grown + i), i as u8);
            }
        }
    }

    #[test]
    fn exhausted_arena_reports_out_of_memory() {
        let mut ff = arena(256);
        let mut allocs = std::vec::Vec::new();
        loop {
            match ff.get(8) {
                Ok(p) => allocs.push(p),
                Err(AllocError::OutOfMemory) => break,
                Err(other) => panic!("unexpected error {other:?}"),
            }
        }
        assert!(ff.get(8).is_err());
        for p in allocs {
            ff.free(p).unwrap();
        }
        assert_eq!(ff.stats().free, 256);
    }
}
