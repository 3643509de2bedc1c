//! Heap state: the block list and the segment placement logic
//!
//! Everything in this module runs with the heap lock held. It never logs nor
//! calls user hooks, since both may allocate. Instead, every operation returns
//! an outcome value describing what happened, which the `Heap` facade reports
//! once the lock has been released.

use crate::{
    align::{align_ptr, slack_for, unalign_ptr, SLOT_SIZE},
    arena::PageArena,
    block::Block,
    diag::{classify, BlockInfo, Counters, HeapStats},
    error::{HeapError, Misuse},
    segment::{physical_size, Segment, LIVE_MAGIC, SEGMENT_ALIGN, SEGMENT_HEADER_SIZE},
};

use std::ptr::{self, NonNull};


/// Where in a block a new segment was placed
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Placement {
    /// The block had no segment yet
    EmptyBlock,

    /// Between the block header and the first segment
    FrontGap,

    /// After the last segment of the block
    TrailingSpace,

    /// In a gap between two consecutive segments
    BetweenSegments,
}


/// Outcome of a successful allocation
#[derive(Clone, Copy, Debug)]
pub struct Grant {
    /// Pointer handed over to the user
    pub ptr: NonNull<u8>,

    /// Identifier of the new segment, for diagnostics
    pub id: u32,

    /// Placement case that was taken
    pub placement: Placement,

    /// Block that had to be created for this allocation, if any
    pub grown: Option<BlockInfo>,

    /// Truth that a zero-sized request was turned into a 1-byte one
    pub zero_sized: bool,
}

/// Outcome of a successful free
#[derive(Clone, Copy, Debug)]
pub struct Release {
    /// Bytes that the freed segment had reserved
    pub size: usize,

    /// Block that became empty and went back to the arena, if any
    pub reclaimed: Option<BlockInfo>,
}

/// Outcome of a successful reallocation
#[derive(Clone, Copy, Debug)]
pub enum Resize {
    /// Reallocation to zero bytes, the segment was freed
    Freed(Release),

    /// Reallocation of a null pointer, a segment was allocated
    Fresh(Grant),

    /// The segment was large enough, only its requested size changed
    InPlace,

    /// Contents were moved to a new segment and the old one was freed
    Moved(Grant, Release),
}


/// Mutable state of a heap, to be kept behind the heap lock
#[derive(Debug)]
pub struct HeapState {
    /// Source of the pages that blocks are made of
    arena: PageArena,

    /// Minimal number of pages per block
    min_block_pages: usize,

    /// Head of the block list
    root: Option<Block>,

    /// Block believed to have the most free space
    ///
    /// This is only a search hint. It may be outdated, but it always points
    /// to a live block or is None.
    best_bet: Option<Block>,

    /// Accounting and misuse statistics
    counters: Counters,

    /// Identifier of the next segment
    next_id: u32,
}

// Blocks and segments live in pages that the arena owns exclusively, and are
// only reached through this state, so it can be moved across threads.
unsafe impl Send for HeapState {}

impl HeapState {
    /// Set up an empty heap over a page arena
    pub fn new(arena: PageArena, min_block_pages: usize) -> Self {
        debug_assert!(min_block_pages != 0, "Blocks must span at least one page");
        Self {
            arena,
            min_block_pages,
            root: None,
            best_bet: None,
            counters: Counters::default(),
            next_id: 0,
        }
    }

    /// Page size of the underlying arena
    pub fn page_size(&self) -> usize {
        self.arena.page_size()
    }

    /// Bytes currently reserved by live segments
    pub fn in_use(&self) -> usize {
        self.counters.in_use
    }

    /// Snapshot of the heap's accounting
    pub fn stats(&self) -> HeapStats {
        HeapStats {
            allocated: self.counters.allocated,
            in_use: self.counters.in_use,
            warnings: self.counters.warnings,
            errors: self.counters.errors,
            possible_overruns: self.counters.possible_overruns,
            blocks: self.blocks().count(),
            free_pages: self.arena.free_pages(),
            total_pages: self.arena.capacity(),
        }
    }

    /// Visit every block of the heap, in list order
    pub fn walk(&self, mut visitor: impl FnMut(&BlockInfo)) {
        for block in self.blocks() {
            visitor(&block.info());
        }
    }

    /// Iterate over the block list
    fn blocks(&self) -> impl Iterator<Item = Block> {
        let mut cursor = self.root;
        std::iter::from_fn(move || {
            let current = cursor?;
            cursor = current.next();
            Some(current)
        })
    }

    /// Allocate `req_size` bytes aligned to `align` (0 and 1 meaning no
    /// particular alignment), zero-filled
    pub fn allocate(&mut self, req_size: usize, align: usize) -> Result<Grant, HeapError> {
        // Check the alignment, which the pointer transform relies on
        if align != 0 && !align.is_power_of_two() {
            return Err(HeapError::InvalidAlignment { align });
        }

        // Zero-sized requests are suspicious, serve them with a single byte
        let zero_sized = req_size == 0;
        let req_size = if zero_sized {
            self.counters.warnings += 1;
            1
        } else {
            req_size
        };

        // Compute the physical size of the segment. Requests that big could
        // never be satisfied anyway.
        let exhausted = HeapError::Exhausted { requested: req_size };
        let size = req_size.checked_add(slack_for(align))
                           .and_then(physical_size)
                           .ok_or(exhausted)?;
        let needed = size.checked_add(SEGMENT_HEADER_SIZE).ok_or(exhausted)?;

        // Make sure that there is a block to search
        let mut grown = None;
        let root = match self.root {
            Some(root) => root,
            None => {
                let block = self.grow(size, req_size)?;
                grown = Some(block.info());
                self.root = Some(block);
                block
            }
        };

        // Start at the best bet if it looks promising, else at the root
        let (mut block, mut from_best_bet) = match self.best_bet {
            Some(bet) if bet.free_space() >= needed => (bet, true),
            _ => (root, false),
        };

        loop {
            // Keep track of the emptiest block that we've seen, including the
            // one that we are about to allocate from
            if self.best_bet.map_or(true, |bet| block.free_space() > bet.free_space()) {
                self.best_bet = Some(block);
            }

            // Blocks without enough free space cannot fit us, whatever the
            // way that this space is fragmented.
            if block.free_space() >= needed {
                if let Some((addr, placement, prev, next)) = Self::find_gap(block, size) {
                    let segment = self.carve(block, addr, size, req_size, prev, next);
                    let ptr = self.finish(segment, req_size, align);
                    return Ok(Grant { ptr, id: segment.id(), placement, grown, zero_sized });
                }
            }

            // At the end of the list, give the blocks before the best bet a
            // chance before growing the heap
            block = match block.next() {
                Some(next) => next,
                None if from_best_bet => {
                    from_best_bet = false;
                    self.root.unwrap_or(root)
                }
                None => {
                    let new_block = self.grow(size, req_size)?;
                    new_block.set_prev(Some(block));
                    block.set_next(Some(new_block));
                    grown = Some(new_block.info());
                    new_block
                }
            };
        }
    }

    /// Free the segment behind `ptr`, which was allocated with alignment
    /// `align`
    ///
    /// Misuse is accounted for, and leaves the heap untouched.
    pub fn free(&mut self, ptr: *mut u8, align: usize) -> Result<Release, Misuse> {
        if ptr.is_null() {
            self.counters.record(Misuse::NullPointer);
            return Err(Misuse::NullPointer);
        }
        let segment = self.locate(ptr, align)?;
        Ok(self.release(segment))
    }

    /// Resize the allocation behind `ptr` to `new_size` bytes
    ///
    /// A zero `new_size` frees the allocation, a null `ptr` allocates a new
    /// one. Growing beyond the segment's reservation always moves the data.
    pub fn reallocate(&mut self,
                      ptr: *mut u8,
                      align: usize,
                      new_size: usize) -> Result<Resize, HeapError> {
        if new_size == 0 {
            return Ok(Resize::Freed(self.free(ptr, align)?));
        }
        if ptr.is_null() {
            return self.allocate(new_size, align).map(Resize::Fresh);
        }

        // Shrinking, or growing within the alignment and rounding slack
        let segment = self.locate(ptr, align)?;
        let capacity = segment.end() - ptr as usize;
        if new_size <= capacity {
            segment.set_req_size(new_size);
            return Ok(Resize::InPlace);
        }

        // Everything else needs a new segment. The old one is still live
        // while we copy, so the two cannot overlap.
        let old_size = segment.req_size();
        let grant = self.allocate(new_size, align)?;
        unsafe { ptr::copy_nonoverlapping(ptr, grant.ptr.as_ptr(), old_size.min(new_size)); }
        let release = self.release(segment);
        Ok(Resize::Moved(grant, release))
    }

    /// Look for room for a `size`-byte segment in `block`
    ///
    /// On success, returns the header address, the placement case, and the
    /// segments that the new one must be linked between.
    fn find_gap(block: Block,
                size: usize) -> Option<(usize, Placement, Option<Segment>, Option<Segment>)> {
        let span = SEGMENT_HEADER_SIZE + size;

        // An empty block that has enough free space can always host us
        let first = match block.first() {
            None => return Some((block.payload_start(), Placement::EmptyBlock, None, None)),
            Some(first) => first,
        };

        // Is there room before the first segment?
        if first.addr() - block.payload_start() >= span {
            return Some((block.payload_start(), Placement::FrontGap, None, Some(first)));
        }

        // Look for room after each segment, in address order
        let mut segment = first;
        loop {
            match segment.next() {
                None => {
                    return if block.end() - segment.end() >= span {
                        Some((segment.end(), Placement::TrailingSpace, Some(segment), None))
                    } else {
                        None
                    };
                }
                Some(next) => {
                    if next.addr() - segment.end() >= span {
                        return Some((segment.end(),
                                     Placement::BetweenSegments,
                                     Some(segment),
                                     Some(next)));
                    }
                    segment = next;
                }
            }
        }
    }

    /// Write a segment header at `addr` and link it between `prev` and `next`
    fn carve(&mut self,
             block: Block,
             addr: usize,
             size: usize,
             req_size: usize,
             prev: Option<Segment>,
             next: Option<Segment>) -> Segment {
        let id = self.next_id;
        self.next_id = id.wrapping_add(1);

        // This is safe because find_gap only reports gaps of the block which
        // can hold the header and `size` bytes, at SEGMENT_ALIGN boundaries.
        let segment = unsafe { Segment::write(addr, block, size, req_size, id) };
        segment.set_prev(prev);
        segment.set_next(next);
        match prev {
            Some(prev) => prev.set_next(Some(segment)),
            None => block.set_first(Some(segment)),
        }
        if let Some(next) = next {
            next.set_prev(Some(segment));
        }

        block.add_usage(SEGMENT_HEADER_SIZE + size);
        self.counters.in_use += size;
        segment
    }

    /// Produce the user pointer of a fresh segment, zero-filled
    fn finish(&self, segment: Segment, req_size: usize, align: usize) -> NonNull<u8> {
        // This is safe because the segment reserved the alignment slack on
        // top of the requested size.
        unsafe {
            let ptr = align_ptr(segment.payload(), align);
            debug_assert!(ptr as usize + req_size <= segment.end(),
                          "Aligned payload overflows its segment");
            ptr::write_bytes(ptr, 0, req_size);
            NonNull::new_unchecked(ptr)
        }
    }

    /// Find the live segment behind a user pointer, without trusting it
    ///
    /// Memory is only read once the pointer is known to fall within the
    /// arena, so that foreign pointers cannot fault.
    fn locate(&mut self, ptr: *mut u8, align: usize) -> Result<Segment, Misuse> {
        let addr = ptr as usize;
        let bad_pointer = Misuse::BadPointer { address: addr };
        let slot_in_arena = align <= 1 || self.arena.contains(addr.wrapping_sub(SLOT_SIZE));
        if !self.arena.contains(addr) || !slot_in_arena {
            self.counters.record(bad_pointer);
            return Err(bad_pointer);
        }

        // Undo the alignment, then make sure that the header is ours to read
        let raw = unsafe { unalign_ptr(ptr, align) } as usize;
        let header = raw.wrapping_sub(SEGMENT_HEADER_SIZE);
        if header % SEGMENT_ALIGN != 0 || !self.arena.contains(header) {
            self.counters.record(bad_pointer);
            return Err(bad_pointer);
        }

        // Check the sentinel before trusting anything else in the header
        let magic = unsafe { Segment::peek_magic(header) };
        if magic != LIVE_MAGIC {
            let misuse = classify(magic, addr);
            self.counters.record(misuse);
            return Err(misuse);
        }
        Ok(unsafe { Segment::from_addr(header) })
    }

    /// Unlink a live segment, and destroy its block if it became empty
    fn release(&mut self, segment: Segment) -> Release {
        let block = segment.block();
        let size = segment.size();
        let (prev, next) = (segment.prev(), segment.next());
        segment.kill();

        match prev {
            Some(prev) => prev.set_next(next),
            None => block.set_first(next),
        }
        if let Some(next) = next {
            next.set_prev(prev);
        }
        block.sub_usage(SEGMENT_HEADER_SIZE + size);
        self.counters.in_use -= size;

        // Give empty blocks back, or see if this one is the new best bet
        let mut reclaimed = None;
        if block.first().is_none() {
            reclaimed = Some(self.destroy(block));
        } else if let Some(bet) = self.best_bet {
            if block.free_space() > bet.free_space() {
                self.best_bet = Some(block);
            }
        }
        Release { size, reclaimed }
    }

    /// Obtain a new block able to host a `size`-byte segment
    fn grow(&mut self, size: usize, req_size: usize) -> Result<Block, HeapError> {
        match Block::create(&mut self.arena, size, self.min_block_pages) {
            Some(block) => {
                self.counters.allocated += block.size();
                Ok(block)
            }
            None => {
                self.counters.warnings += 1;
                Err(HeapError::Exhausted { requested: req_size })
            }
        }
    }

    /// Unlink an empty block and give its pages back to the arena
    fn destroy(&mut self, block: Block) -> BlockInfo {
        let info = block.info();
        let (prev, next) = (block.prev(), block.next());
        match prev {
            Some(prev) => prev.set_next(next),
            None => self.root = next,
        }
        if let Some(next) = next {
            next.set_prev(prev);
        }
        if self.best_bet == Some(block) {
            self.best_bet = None;
        }
        self.counters.allocated -= block.size();

        // This is safe because the block is empty and no longer reachable
        unsafe { block.destroy(&mut self.arena) };
        info
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use crate::block::BLOCK_HEADER_SIZE;

    const PAGE: usize = 4096;

    fn state(capacity: usize, min_block_pages: usize) -> HeapState {
        let arena = PageArena::reserve(PAGE, capacity).unwrap();
        HeapState::new(arena, min_block_pages)
    }

    fn alloc(state: &mut HeapState, size: usize) -> (*mut u8, Placement) {
        let grant = state.allocate(size, 0).unwrap();
        (grant.ptr.as_ptr(), grant.placement)
    }

    #[test]
    fn placement_cases() {
        let mut state = state(64, 16);

        // The first allocation creates the root block
        let grant = state.allocate(100, 0).unwrap();
        assert_eq!(grant.id, 0);
        assert_eq!(grant.placement, Placement::EmptyBlock);
        let block = grant.grown.unwrap();
        assert_eq!(block.pages, 16);
        assert_eq!(grant.ptr.as_ptr() as usize,
                   block.address + BLOCK_HEADER_SIZE + SEGMENT_HEADER_SIZE);
        let a = grant.ptr.as_ptr();

        // Further allocations go after the last segment
        let (b, placement) = alloc(&mut state, 200);
        assert_eq!(placement, Placement::TrailingSpace);
        let (c, _) = alloc(&mut state, 300);
        assert!(a < b && b < c);

        // A hole between two segments is reused
        state.free(b, 0).unwrap();
        let (b2, placement) = alloc(&mut state, 200);
        assert_eq!(placement, Placement::BetweenSegments);
        assert_eq!(b2, b);

        // So is a hole at the front of the block
        state.free(a, 0).unwrap();
        let (a2, placement) = alloc(&mut state, 50);
        assert_eq!(placement, Placement::FrontGap);
        assert_eq!(a2, a);

        for &ptr in &[a2, b2, c] {
            state.free(ptr, 0).unwrap();
        }
        assert_eq!(state.stats().blocks, 0);
        assert_eq!(state.in_use(), 0);
    }

    #[test]
    fn usage_accounting() {
        let mut state = state(64, 16);
        let (ptr, _) = alloc(&mut state, 100);
        let stats = state.stats();
        assert_eq!(stats.allocated, 16 * PAGE);
        assert_eq!(stats.in_use, physical_size(100).unwrap());
        assert_eq!(stats.blocks, 1);
        assert_eq!(stats.free_pages, 48);
        assert_eq!(stats.total_pages, 64);

        let mut visited = Vec::new();
        state.walk(|info| visited.push(*info));
        assert_eq!(visited.len(), 1);
        assert_eq!(visited[0].segments, 1);
        assert_eq!(visited[0].usage,
                   BLOCK_HEADER_SIZE + SEGMENT_HEADER_SIZE + stats.in_use);

        let release = state.free(ptr, 0).unwrap();
        assert_eq!(release.size, stats.in_use);
        assert_eq!(release.reclaimed.unwrap().pages, 16);
        assert_eq!(state.stats().allocated, 0);
        assert_eq!(state.stats().free_pages, 64);
    }

    #[test]
    fn new_blocks_are_appended() {
        let mut state = state(64, 16);
        let (big, _) = alloc(&mut state, 60_000);
        let grant = state.allocate(10_000, 0).unwrap();
        assert_eq!(grant.placement, Placement::EmptyBlock);
        assert!(grant.grown.is_some());
        assert_eq!(state.stats().blocks, 2);

        // The grown block is the emptiest one, so it became the best bet and
        // small requests go to its trailing space, not to the root's
        let grown = block_of(grant.ptr.as_ptr());
        assert_eq!(state.best_bet, Some(grown));
        let (small, placement) = alloc(&mut state, 100);
        assert_eq!(placement, Placement::TrailingSpace);
        assert_eq!(block_of(small), grown);
        assert_eq!(small as usize,
                   grant.ptr.as_ptr() as usize + 10_000 + SEGMENT_HEADER_SIZE);

        // Blocks are reclaimed once their last segment is gone
        let release = state.free(big, 0).unwrap();
        assert!(release.reclaimed.is_some());
        assert_eq!(state.stats().blocks, 1);
        let release = state.free(small, 0).unwrap();
        assert!(release.reclaimed.is_none());
        state.free(grant.ptr.as_ptr(), 0).unwrap();
        assert_eq!(state.stats().blocks, 0);
        assert_eq!(state.stats().free_pages, 64);
    }

    #[test]
    fn search_starts_at_best_bet() {
        let mut state = state(64, 16);

        // A root block with a little trailing space, then an emptier block
        let (big, _) = alloc(&mut state, 60_000);
        let root = block_of(big);
        let (medium, _) = alloc(&mut state, 10_000);
        let grown = block_of(medium);
        assert_ne!(grown, root);
        assert!(root.free_space() >= 100 + SEGMENT_HEADER_SIZE);

        // Small requests would fit in the root, but the search starts at the
        // best bet and never walks back to the root while it has room
        let smalls = (0..20).map(|_| alloc(&mut state, 100).0).collect::<Vec<_>>();
        for &small in &smalls {
            assert_eq!(block_of(small), grown);
        }
        assert_eq!(state.best_bet, Some(grown));
        assert_eq!(root.free_space(), 16 * PAGE - BLOCK_HEADER_SIZE - SEGMENT_HEADER_SIZE - 60_000);

        for ptr in smalls.into_iter().chain(vec![big, medium]) {
            state.free(ptr, 0).unwrap();
        }
        assert_eq!(state.stats().blocks, 0);
        assert!(state.best_bet.is_none());
    }

    #[test]
    fn freeing_moves_best_bet() {
        let mut state = state(64, 16);
        let (a, _) = alloc(&mut state, 30_000);
        let (b, _) = alloc(&mut state, 30_000);
        let root = block_of(a);
        let (c, _) = alloc(&mut state, 40_000);
        let grown = block_of(c);
        assert_ne!(grown, root);
        assert_eq!(state.best_bet, Some(grown));

        // Freeing leaves the root with more free space than the grown block
        state.free(a, 0).unwrap();
        assert!(root.free_space() > grown.free_space());
        assert_eq!(state.best_bet, Some(root));

        // Which the next search starts from
        let (d, placement) = alloc(&mut state, 20_000);
        assert_eq!(placement, Placement::FrontGap);
        assert_eq!(d, a);

        for &ptr in &[b, c, d] {
            state.free(ptr, 0).unwrap();
        }
        assert_eq!(state.stats().blocks, 0);
    }

    #[test]
    fn best_bet_search_restarts_from_root() {
        let mut state = state(64, 1);

        // A two-page root block with a single free byte run at its end
        let (r1, _) = alloc(&mut state, 5000);
        let (r2, _) = alloc(&mut state, 3000);

        // A second two-page block
        let (b1, _) = alloc(&mut state, 6000);
        let (b2, _) = alloc(&mut state, 1000);
        assert_eq!(state.stats().blocks, 2);

        // Fragment the second block so that it has the most free space, but
        // no gap of 3000 bytes
        state.free(b1, 0).unwrap();
        let (c1, placement) = alloc(&mut state, 3000);
        assert_eq!(placement, Placement::FrontGap);
        assert_eq!(c1, b1);
        state.free(r2, 0).unwrap();
        assert_eq!(state.best_bet, Some(block_of(c1)));

        // The search starts at the best bet, fails there, and finds the
        // trailing space of the root block instead of growing the heap
        let (d, placement) = alloc(&mut state, 3000);
        assert_eq!(placement, Placement::TrailingSpace);
        assert_eq!(d, r2);
        assert_eq!(state.stats().blocks, 2);

        for &ptr in &[r1, d, c1, b2] {
            state.free(ptr, 0).unwrap();
        }
        assert_eq!(state.stats().free_pages, 64);
        assert!(state.best_bet.is_none());
    }

    fn block_of(ptr: *mut u8) -> Block {
        unsafe { Segment::from_addr(ptr as usize - SEGMENT_HEADER_SIZE) }.block()
    }

    #[test]
    fn alignment() {
        let mut state = state(64, 16);
        let mut ptrs = Vec::new();
        for &align in &[2, 4, 8, 16, 64, 256, PAGE] {
            let grant = state.allocate(24, align).unwrap();
            assert_eq!(grant.ptr.as_ptr() as usize % align, 0);
            ptrs.push((grant.ptr.as_ptr(), align));
        }
        for (ptr, align) in ptrs {
            state.free(ptr, align).unwrap();
        }
        assert_eq!(state.in_use(), 0);
        assert_eq!(state.allocate(8, 3).unwrap_err(), HeapError::InvalidAlignment { align: 3 });
    }

    #[test]
    fn zero_sized_requests() {
        let mut state = state(16, 1);
        let grant = state.allocate(0, 0).unwrap();
        assert!(grant.zero_sized);
        assert_eq!(state.stats().warnings, 1);
        assert_eq!(state.in_use(), physical_size(1).unwrap());
        state.free(grant.ptr.as_ptr(), 0).unwrap();
    }

    #[test]
    fn misuse_is_detected() {
        let mut state = state(16, 1);
        let (ptr, _) = alloc(&mut state, 64);
        let (keep, _) = alloc(&mut state, 64);

        assert_eq!(state.free(ptr::null_mut(), 0).unwrap_err(), Misuse::NullPointer);
        state.free(ptr, 0).unwrap();
        assert_eq!(state.free(ptr, 0).unwrap_err(), Misuse::DoubleFree);

        let mut local = 0u64;
        let foreign = &mut local as *mut u64 as *mut u8;
        assert_eq!(state.free(foreign, 0).unwrap_err(),
                   Misuse::BadPointer { address: foreign as usize });
        let inside = unsafe { keep.add(3) };
        assert_eq!(state.free(inside, 0).unwrap_err(),
                   Misuse::BadPointer { address: inside as usize });

        let stats = state.stats();
        assert_eq!(stats.warnings, 1);
        assert_eq!(stats.errors, 3);
        assert_eq!(stats.possible_overruns, 0);

        // The heap is still consistent
        state.free(keep, 0).unwrap();
        assert_eq!(state.stats().blocks, 0);
    }

    #[test]
    fn reallocation() {
        let mut state = state(64, 16);
        let (ptr, _) = alloc(&mut state, 100);
        unsafe { ptr::write_bytes(ptr, 0x5a, 100) };

        // Shrinking, and growing within the rounding slack, stay in place
        assert!(matches!(state.reallocate(ptr, 0, 10).unwrap(), Resize::InPlace));
        assert!(matches!(state.reallocate(ptr, 0, 104).unwrap(), Resize::InPlace));

        // Growing further moves the data
        let _blocker = alloc(&mut state, 8).0;
        let moved = match state.reallocate(ptr, 0, 1000).unwrap() {
            Resize::Moved(grant, release) => {
                assert!(release.reclaimed.is_none());
                grant.ptr.as_ptr()
            }
            other => panic!("Unexpected outcome {:?}", other),
        };
        assert_ne!(moved, ptr);
        unsafe {
            assert!((0..100).all(|i| *moved.add(i) == 0x5a));
            assert!((104..1000).all(|i| *moved.add(i) == 0));
        }
        assert_eq!(state.free(ptr, 0).unwrap_err(), Misuse::DoubleFree);

        // Null and zero-sized edge cases
        let fresh = match state.reallocate(ptr::null_mut(), 0, 32).unwrap() {
            Resize::Fresh(grant) => grant.ptr.as_ptr(),
            other => panic!("Unexpected outcome {:?}", other),
        };
        assert!(matches!(state.reallocate(fresh, 0, 0).unwrap(), Resize::Freed(_)));
    }
}
