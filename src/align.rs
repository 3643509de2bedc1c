//! Reversible pointer alignment
//!
//! Segment payloads start right after their header, which is only naturally
//! aligned. Stronger alignment is obtained by reserving some slack in the
//! segment, moving the returned pointer forward, and recording how far it was
//! moved in a slot located right before it:
//!
//! `|header|..padding..|slot|aligned payload...|`
//!
//! Freeing reads the slot back to find the header again.

use std::{mem, ptr};


/// Width of the offset slot stored before every aligned pointer
pub const SLOT_SIZE: usize = mem::size_of::<usize>();


/// Round `value` up to the next multiple of `align`
///
/// `align` must be a power of two.
#[inline]
pub const fn align_up(value: usize, align: usize) -> usize {
    (value + align - 1) & !(align - 1)
}

/// Extra bytes that a segment must reserve so that its payload can be
/// aligned to `align`, including the offset slot
///
/// Alignments of 0 and 1 need no slack at all.
#[inline]
pub const fn slack_for(align: usize) -> usize {
    if align > 1 { align + SLOT_SIZE } else { 0 }
}

/// Move `ptr` forward to the next `align` boundary that leaves room for the
/// offset slot, and record the total offset in that slot
///
/// # Safety
///
/// `align` must be 0 or a power of two. When it is greater than 1,
/// `slack_for(align)` bytes starting at `ptr` must be valid for writes.
pub unsafe fn align_ptr(ptr: *mut u8, align: usize) -> *mut u8 {
    if align <= 1 {
        return ptr;
    }
    debug_assert!(align.is_power_of_two(), "Alignment must be a power of 2");

    // Leave room for the slot, then round up to the boundary
    let addr = ptr as usize;
    let offset = align_up(addr + SLOT_SIZE, align) - addr;
    debug_assert!(offset < slack_for(align), "Alignment slack is too small");
    let aligned = ptr.add(offset);

    // The slot is only guaranteed to be aligned for alignments >= SLOT_SIZE
    ptr::write_unaligned(aligned.sub(SLOT_SIZE) as *mut usize, offset);
    aligned
}

/// Undo `align_ptr`, recovering the pointer that was originally aligned
///
/// An implausible slot value (one that `align_ptr` could never have written
/// for this alignment) leaves the pointer untouched, so that header
/// validation can reject it later on.
///
/// # Safety
///
/// When `align` is greater than 1, the `SLOT_SIZE` bytes before `ptr` must be
/// valid for reads.
pub unsafe fn unalign_ptr(ptr: *mut u8, align: usize) -> *mut u8 {
    if align <= 1 {
        return ptr;
    }
    let offset = ptr::read_unaligned(ptr.sub(SLOT_SIZE) as *const usize);
    if offset < slack_for(align) && offset <= ptr as usize {
        ptr.sub(offset)
    } else {
        ptr
    }
}
