use log::debug;
use zerocopy::{AsBytes, FromBytes};

use crate::BLOCK_SIZE;

#[derive(Debug, PartialEq)]
pub enum State {
    Free,
    Used,
}

#[repr(C)]
#[derive(AsBytes, FromBytes, Clone, Copy)]
pub struct Bitmap {
    /// Stores one bit per block, packed into a single 4K block. A 4K bitmap
    /// tracks up to 4096 * 8 = 32,768 blocks.
    bitmap: [u64; BLOCK_SIZE / 8],
}

impl Bitmap {
    pub fn new() -> Self {
        Self {
            bitmap: [0; BLOCK_SIZE / 8],
        }
    }

    /// Decodes a bitmap from the raw contents of its disk block.
    pub fn parse(buf: &[u8]) -> Self {
        assert!(
            buf.len() >= BLOCK_SIZE,
            "bitmap buffer must span a whole block"
        );
        unsafe { std::ptr::read_unaligned(buf.as_ptr() as *const Bitmap) }
    }

    pub fn serialize(&self) -> &[u8] {
        self.as_bytes()
    }

    pub fn get(&self, blocknr: usize) -> State {
        let word = self.bitmap[blocknr / 64];
        match (word >> (blocknr % 64)) & 1 {
            0 => State::Free,
            _ => State::Used,
        }
    }

    pub fn set_reserved(&mut self, blocknr: usize) {
        self.bitmap[blocknr / 64] |= 1_u64 << (blocknr % 64);
    }

    pub fn set_free(&mut self, blocknr: usize) {
        self.bitmap[blocknr / 64] &= !(1_u64 << (blocknr % 64));
    }

    /// Total bits set, i.e. blocks currently marked allocated.
    pub fn count_used(&self) -> u32 {
        self.bitmap.iter().map(|word| word.count_ones()).sum()
    }
}

/// Single-block allocator over the free-space bitmap.
///
/// Allocation policy: a `next_free` cursor seeded just past the statically
/// reserved region (superblock, bitmap, inode table) hands out untouched
/// blocks in O(1). Once the cursor runs off the end of the device the
/// allocator falls back to a first-fit scan of the bitmap, picking up blocks
/// released by earlier frees.
pub struct BlockAllocator {
    map: Bitmap,
    /// Cursor for the fast allocation path.
    next_free: u32,
    /// Number of addressable blocks; ids at or past this are never handed out.
    nblocks: u32,
}

impl BlockAllocator {
    /// Builds a fresh allocator with the reserved region `[0, reserved)`
    /// marked permanently in use.
    pub fn format(nblocks: u32, reserved: u32) -> Self {
        let mut map = Bitmap::new();
        for blocknr in 0..reserved {
            map.set_reserved(blocknr as usize);
        }
        Self {
            map,
            next_free: reserved,
            nblocks,
        }
    }

    /// Rebuilds the allocator from a bitmap read off disk. The cursor
    /// restarts at the data region; slots it has already handed out in a
    /// previous life are skipped by the used-bit check in [`allocate`].
    ///
    /// [`allocate`]: BlockAllocator::allocate
    pub fn open(map: Bitmap, nblocks: u32, reserved: u32) -> Self {
        Self {
            map,
            next_free: reserved,
            nblocks,
        }
    }

    /// Returns a free block id and marks it allocated, or `None` when the
    /// device is out of space.
    pub fn allocate(&mut self) -> Option<u32> {
        while self.next_free < self.nblocks {
            let blocknr = self.next_free;
            self.next_free += 1;
            if let State::Free = self.map.get(blocknr as usize) {
                self.map.set_reserved(blocknr as usize);
                debug!("alloc_block {} (cursor)", blocknr);
                return Some(blocknr);
            }
        }

        // Cursor exhausted: first-fit scan for a bit cleared by free().
        for blocknr in 0..self.nblocks {
            if let State::Free = self.map.get(blocknr as usize) {
                self.map.set_reserved(blocknr as usize);
                debug!("alloc_block {} (scan)", blocknr);
                return Some(blocknr);
            }
        }
        None
    }

    /// Clears the bit for `blocknr`. Freeing an already-free block is a
    /// no-op, and out-of-range ids are ignored.
    pub fn free(&mut self, blocknr: u32) {
        if blocknr >= self.nblocks {
            return;
        }
        self.map.set_free(blocknr as usize);
    }

    pub fn free_count(&self) -> u32 {
        self.nblocks - self.map.count_used()
    }

    pub fn map(&self) -> &Bitmap {
        &self.map
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn can_read_and_write_values_to_bitmap() {
        let mut bmp = Bitmap::new();

        bmp.set_reserved(2);

        assert_eq!(bmp.get(0), State::Free);
        assert_eq!(bmp.get(2), State::Used);
    }

    #[test]
    fn can_set_values_at_ends_of_bitmap() {
        let mut bmp = Bitmap::new();

        bmp.set_reserved(0);
        bmp.set_reserved(BLOCK_SIZE * 8 - 1);

        assert_eq!(bmp.get(0), State::Used);
        assert_eq!(bmp.get(BLOCK_SIZE * 8 - 1), State::Used);
    }

    #[test]
    fn can_toggle_block_between_free_and_used() {
        let mut bmp = Bitmap::new();

        bmp.set_reserved(10);
        bmp.set_reserved(11);
        assert_eq!(bmp.get(10), State::Used);

        bmp.set_free(10);
        assert_eq!(bmp.get(10), State::Free);
        // Neighbors keep their state.
        assert_eq!(bmp.get(11), State::Used);
    }

    #[test]
    fn can_serialize_and_deserialize_state() {
        let mut bmp = Bitmap::new();
        bmp.set_reserved(10);
        bmp.set_reserved(11);
        bmp.set_reserved(12);

        let read_bmp = Bitmap::parse(bmp.serialize());
        assert_eq!(read_bmp.get(10), State::Used);
        assert_eq!(read_bmp.get(12), State::Used);
        assert_eq!(read_bmp.get(13), State::Free);
        assert_eq!(read_bmp.count_used(), 3);
    }

    #[test]
    fn format_reserves_static_region() {
        let alloc = BlockAllocator::format(16, 4);
        for blocknr in 0..4 {
            assert_eq!(alloc.map().get(blocknr), State::Used);
        }
        assert_eq!(alloc.free_count(), 12);
    }

    #[test]
    fn allocations_are_unique_and_start_past_reserved() {
        let mut alloc = BlockAllocator::format(16, 4);

        let mut seen = Vec::new();
        while let Some(blocknr) = alloc.allocate() {
            assert!(blocknr >= 4, "reserved block {} handed out", blocknr);
            assert!(!seen.contains(&blocknr), "block {} allocated twice", blocknr);
            seen.push(blocknr);
        }
        assert_eq!(seen.len(), 12);
        assert_eq!(alloc.free_count(), 0);
    }

    #[test]
    fn exhausted_allocator_recovers_freed_blocks_by_scan() {
        let mut alloc = BlockAllocator::format(8, 4);
        let ids: Vec<u32> = (0..4).map(|_| alloc.allocate().unwrap()).collect();
        assert_eq!(alloc.allocate(), None);

        alloc.free(ids[2]);
        // Cursor is spent, so this allocation comes from the bitmap scan.
        assert_eq!(alloc.allocate(), Some(ids[2]));
        assert_eq!(alloc.allocate(), None);
    }

    #[test]
    fn free_is_idempotent_and_ignores_out_of_range() {
        let mut alloc = BlockAllocator::format(8, 4);
        let blocknr = alloc.allocate().unwrap();

        alloc.free(blocknr);
        let count = alloc.free_count();
        alloc.free(blocknr);
        assert_eq!(alloc.free_count(), count);

        alloc.free(1000);
        assert_eq!(alloc.free_count(), count);
    }

    #[test]
    fn reopened_allocator_skips_previously_used_blocks() {
        let mut alloc = BlockAllocator::format(8, 4);
        let first = alloc.allocate().unwrap();
        let map = *alloc.map();

        let mut reopened = BlockAllocator::open(map, 8, 4);
        let next = reopened.allocate().unwrap();
        assert_ne!(next, first);
    }
}
