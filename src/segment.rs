//! Segments: individual allocations carved out of a block
//!
//! A segment is a header followed by the physical reservation made for one
//! allocation. Within a block, segments form a doubly linked list ordered by
//! address. The header carries a sentinel which tells live segments apart
//! from freed ones and from random memory.

use crate::{align::align_up, block::Block};

use std::{mem, ptr::NonNull};


/// Sentinel carried by the header of every live segment
pub const LIVE_MAGIC: u32 = 0xc001_c0de;

/// Sentinel written over `LIVE_MAGIC` when a segment is freed
pub const DEAD_MAGIC: u32 = 0xdead_dead;


/// Header found at the start of every segment
#[repr(C)]
#[derive(Debug)]
pub struct SegmentHeader {
    /// Previous segment of the owning block (lower address)
    prev: Option<Segment>,

    /// Next segment of the owning block (higher address)
    next: Option<Segment>,

    /// Block that the segment was carved from
    block: Block,

    /// `LIVE_MAGIC` or `DEAD_MAGIC`, anything else means corruption
    magic: u32,

    /// Allocation number, for diagnostics only (wraps around)
    id: u32,

    /// Bytes reserved after the header, alignment slack included
    size: usize,

    /// Bytes requested by the user
    req_size: usize,
}

/// Bytes taken by a segment header
pub const SEGMENT_HEADER_SIZE: usize = mem::size_of::<SegmentHeader>();

/// Alignment of segment headers
///
/// Physical segment sizes are kept multiples of this, so that a header that
/// directly follows another segment is always properly aligned.
pub const SEGMENT_ALIGN: usize = mem::align_of::<SegmentHeader>();


/// Physical reservation needed by a segment holding `size` bytes, or None if
/// it cannot be represented
pub fn physical_size(size: usize) -> Option<usize> {
    size.checked_add(SEGMENT_ALIGN - 1)
        .map(|padded| align_up(padded - (SEGMENT_ALIGN - 1), SEGMENT_ALIGN))
}


/// Handle to a segment header
///
/// Like block handles, these are plain addresses that the heap state only
/// dereferences while it holds the heap lock.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
#[repr(transparent)]
pub struct Segment(NonNull<SegmentHeader>);

impl Segment {
    /// Write a live segment header at `addr`
    ///
    /// Only the header is written: linking it into the block's segment list
    /// is up to the caller.
    ///
    /// # Safety
    ///
    /// `addr..addr + SEGMENT_HEADER_SIZE + size` must lie within the free
    /// space of `block`, and `addr` must be a multiple of `SEGMENT_ALIGN`.
    pub unsafe fn write(addr: usize,
                        block: Block,
                        size: usize,
                        req_size: usize,
                        id: u32) -> Self {
        debug_assert_eq!(addr % SEGMENT_ALIGN, 0, "Misaligned segment header");
        debug_assert_eq!(size % SEGMENT_ALIGN, 0, "Unpadded segment size");
        debug_assert!(addr >= block.payload_start()
                          && addr + SEGMENT_HEADER_SIZE + size <= block.end(),
                      "Segment is out of block range");
        let header = NonNull::new_unchecked(addr as *mut SegmentHeader);
        header.as_ptr().write(SegmentHeader {
            prev: None,
            next: None,
            block,
            magic: LIVE_MAGIC,
            id,
            size,
            req_size,
        });
        Self(header)
    }

    /// Read the sentinel of what may or may not be a segment header
    ///
    /// # Safety
    ///
    /// `addr` must be a multiple of `SEGMENT_ALIGN`, and the header-sized
    /// memory range at `addr` must be readable.
    pub unsafe fn peek_magic(addr: usize) -> u32 {
        let header = addr as *const SegmentHeader;
        (*header).magic
    }

    /// Handle to the segment header at `addr`
    ///
    /// # Safety
    ///
    /// A live segment header must be located at `addr`, as attested by
    /// `peek_magic` returning `LIVE_MAGIC`.
    pub unsafe fn from_addr(addr: usize) -> Self {
        Self(NonNull::new_unchecked(addr as *mut SegmentHeader))
    }

    fn header(&self) -> &SegmentHeader {
        // Handles only exist for live segments, see type documentation
        unsafe { self.0.as_ref() }
    }

    fn header_mut(&mut self) -> &mut SegmentHeader {
        unsafe { self.0.as_mut() }
    }

    /// Address of the segment header
    pub fn addr(self) -> usize {
        self.0.as_ptr() as usize
    }

    /// Start of the segment's reservation, right after the header
    pub fn payload(self) -> *mut u8 {
        (self.addr() + SEGMENT_HEADER_SIZE) as *mut u8
    }

    /// Address right after the segment's reservation
    pub fn end(self) -> usize {
        self.addr() + SEGMENT_HEADER_SIZE + self.size()
    }

    pub fn block(self) -> Block {
        self.header().block
    }

    /// Mark the segment as freed, so that later frees can tell
    pub fn kill(mut self) {
        self.header_mut().magic = DEAD_MAGIC;
    }

    pub fn id(self) -> u32 {
        self.header().id
    }

    pub fn size(self) -> usize {
        self.header().size
    }

    pub fn req_size(self) -> usize {
        self.header().req_size
    }

    pub fn set_req_size(mut self, req_size: usize) {
        self.header_mut().req_size = req_size;
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
}
