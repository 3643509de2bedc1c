//! Blocks: page runs obtained from the arena and carved into segments
//!
//! Every block starts with a header, followed by the segments allocated from
//! it, in address order, possibly separated by free gaps:
//!
//! `|block header|seg|payload...|  gap  |seg|payload...|     free      |`
//!
//! Blocks are chained together in a doubly linked list whose order carries
//! no meaning. The list and the headers are only ever touched by the heap
//! state, from within its critical section.

use crate::{
    arena::PageArena,
    diag::BlockInfo,
    div_round_up,
    segment::{Segment, SEGMENT_HEADER_SIZE},
};

use std::{mem, ptr::NonNull};


/// Header found at the start of every block
#[repr(C)]
#[derive(Debug)]
pub struct BlockHeader {
    /// Previous block in the block list
    prev: Option<Block>,

    /// Next block in the block list
    next: Option<Block>,

    /// Number of arena pages making up the block
    pages: usize,

    /// Capacity of the block in bytes, header included
    size: usize,

    /// Bytes used by the block header, the segment headers and the segments
    usage: usize,

    /// Lowest segment of the block, or None if the block is empty
    first: Option<Segment>,
}

/// Bytes taken by a block header at the start of its block
pub const BLOCK_HEADER_SIZE: usize = mem::size_of::<BlockHeader>();


/// Number of pages that a block must span to host a segment of `size` bytes
///
/// Small requests get at least `min_pages` pages, so that the cost of going
/// to the arena is amortized over many allocations. Returns None if the page
/// count cannot be represented.
pub fn pages_for(size: usize, page_size: usize, min_pages: usize) -> Option<usize> {
    let needed = size.checked_add(BLOCK_HEADER_SIZE + SEGMENT_HEADER_SIZE)?;
    Some(div_round_up(needed, page_size).max(min_pages))
}


/// Handle to a live block
///
/// Handles are plain copies of the header address. They remain meaningful
/// for as long as the block is linked in the heap's block list, and are only
/// dereferenced by the heap state while it holds the heap lock.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
#[repr(transparent)]
pub struct Block(NonNull<BlockHeader>);

impl Block {
    /// Obtain a fresh block of pages from the arena, sized for a segment of
    /// `size` bytes, and initialize its header
    ///
    /// Returns None if the arena cannot provide enough contiguous pages.
    pub fn create(arena: &mut PageArena, size: usize, min_pages: usize) -> Option<Self> {
        let pages = pages_for(size, arena.page_size(), min_pages)?;
        let start = arena.acquire(pages)?;
        let header = start.cast::<BlockHeader>();

        // This is safe because the arena just granted us these pages, which
        // are page-aligned and therefore suitably aligned for the header.
        unsafe {
            header.as_ptr().write(BlockHeader {
                prev: None,
                next: None,
                pages,
                size: pages * arena.page_size(),
                usage: BLOCK_HEADER_SIZE,
                first: None,
            });
        }
        Some(Self(header))
    }

    /// Give the block's pages back to the arena
    ///
    /// # Safety
    ///
    /// The block must be empty and already unlinked from the block list. The
    /// handle, and any copy of it, is dangling afterwards.
    pub unsafe fn destroy(self, arena: &mut PageArena) {
        debug_assert!(self.first().is_none(), "Destroyed a block with live segments");
        let pages = self.pages();
        arena.release(self.0.cast(), pages);
    }

    fn header(&self) -> &BlockHeader {
        // Handles only exist for live blocks, see type documentation
        unsafe { self.0.as_ref() }
    }

    fn header_mut(&mut self) -> &mut BlockHeader {
        unsafe { self.0.as_mut() }
    }

    /// Address of the block, which is also the address of its first page
    pub fn addr(self) -> usize {
        self.0.as_ptr() as usize
    }

    /// Address right after the block header, where segments may start
    pub fn payload_start(self) -> usize {
        self.addr() + BLOCK_HEADER_SIZE
    }

    /// Address right after the last byte of the block
    pub fn end(self) -> usize {
        self.addr() + self.size()
    }

    pub fn pages(self) -> usize {
        self.header().pages
    }

    pub fn size(self) -> usize {
        self.header().size
    }

    pub fn usage(self) -> usize {
        self.header().usage
    }

    /// Bytes of the block which no header or segment accounts for
    ///
    /// These are not necessarily contiguous.
    pub fn free_space(self) -> usize {
        self.size() - self.usage()
    }

    /// Account for `bytes` more being used in the block
    pub fn add_usage(mut self, bytes: usize) {
        let header = self.header_mut();
        header.usage += bytes;
        debug_assert!(header.usage <= header.size, "Block usage exceeds its size");
    }

    /// Account for `bytes` less being used in the block
    pub fn sub_usage(mut self, bytes: usize) {
        let header = self.header_mut();
        debug_assert!(header.usage >= BLOCK_HEADER_SIZE + bytes,
                      "Block usage underflow");
        header.usage -= bytes;
    }

    pub fn prev(self) -> Option<Self> {
        self.header().prev
    }

    pub fn set_prev(mut self, prev: Option<Self>) {
        self.header_mut().prev = prev;
    }

    pub fn next(self) -> Option<Self> {
        self.header().next
    }

    pub fn set_next(mut self, next: Option<Self>) {
        self.header_mut().next = next;
    }

    pub fn first(self) -> Option<Segment> {
        self.header().first
    }

    pub fn set_first(mut self, first: Option<Segment>) {
        self.header_mut().first = first;
    }

    /// Iterate over the block's segments, in address order
    pub fn segments(self) -> impl Iterator<Item = Segment> {
        let mut cursor = self.first();
        std::iter::from_fn(move || {
            let current = cursor?;
            cursor = current.next();
            Some(current)
        })
    }

    /// Summary of the block for diagnostics
    pub fn info(self) -> BlockInfo {
        BlockInfo {
            address: self.addr(),
            pages: self.pages(),
            size: self.size(),
            usage: self.usage(),
            segments: self.segments().count(),
        }
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    const PAGE: usize = 4096;

    #[test]
    fn page_counts() {
        let overhead = BLOCK_HEADER_SIZE + SEGMENT_HEADER_SIZE;
        assert_eq!(pages_for(0, PAGE, 1), Some(1));
        assert_eq!(pages_for(PAGE - overhead, PAGE, 1), Some(1));
        assert_eq!(pages_for(PAGE - overhead + 1, PAGE, 1), Some(2));
        assert_eq!(pages_for(100, PAGE, 16), Some(16));
        assert_eq!(pages_for(20 * PAGE, PAGE, 16), Some(21));
        assert_eq!(pages_for(usize::MAX, PAGE, 16), None);
    }

    #[test]
    fn create_and_destroy() {
        let mut arena = PageArena::reserve(PAGE, 32).unwrap();
        let block = Block::create(&mut arena, 100, 16).unwrap();
        assert_eq!(arena.free_pages(), 16);
        assert_eq!(block.addr() % PAGE, 0);
        assert_eq!(block.pages(), 16);
        assert_eq!(block.size(), 16 * PAGE);
        assert_eq!(block.usage(), BLOCK_HEADER_SIZE);
        assert_eq!(block.free_space(), 16 * PAGE - BLOCK_HEADER_SIZE);
        assert_eq!(block.end(), block.addr() + 16 * PAGE);
        assert!(block.first().is_none());
        assert!(block.prev().is_none() && block.next().is_none());
        assert_eq!(block.segments().count(), 0);

        block.add_usage(64);
        assert_eq!(block.free_space(), 16 * PAGE - BLOCK_HEADER_SIZE - 64);
        block.sub_usage(64);

        unsafe { block.destroy(&mut arena) };
        assert_eq!(arena.free_pages(), 32);
    }

    #[test]
    fn too_big_for_arena() {
        let mut arena = PageArena::reserve(PAGE, 8).unwrap();
        assert!(Block::create(&mut arena, 8 * PAGE, 1).is_none());
        assert_eq!(arena.free_pages(), 8);
    }
}
