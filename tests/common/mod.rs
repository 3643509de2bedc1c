//! Helpers shared by the integration tests

use kheap::{Builder, Heap};

use require_unsafe_in_body::require_unsafe_in_body;

use std::ptr::NonNull;


/// Heap with 4 KiB pages and 16-page blocks
pub fn heap(page_capacity: usize) -> Heap {
    Builder::new().page_size(4096)
                  .page_capacity(page_capacity)
                  .build()
                  .expect("Failed to reserve a test heap")
}

/// Byte expected at `offset` in a buffer filled with `pattern`
pub fn pattern_byte(pattern: u8, offset: usize) -> u8 {
    pattern.wrapping_add(offset as u8)
}

/// Fill `len` bytes at `ptr` with a pattern seeded by `pattern`
///
/// # Safety
///
/// `ptr` must be valid for `len` bytes of writes.
#[require_unsafe_in_body]
pub unsafe fn fill(ptr: NonNull<u8>, len: usize, pattern: u8) {
    for offset in 0..len {
        unsafe { ptr.as_ptr().add(offset).write(pattern_byte(pattern, offset)) };
    }
}

/// Truth that `len` bytes at `ptr` still hold the pattern written by `fill`
///
/// # Safety
///
/// `ptr` must be valid for `len` bytes of reads.
#[require_unsafe_in_body]
pub unsafe fn holds(ptr: NonNull<u8>, len: usize, pattern: u8) -> bool {
    (0..len).all(|offset| unsafe { ptr.as_ptr().add(offset).read() } == pattern_byte(pattern, offset))
}

/// Truth that `len` bytes at `ptr` are all zero
///
/// # Safety
///
/// `ptr` must be valid for `len` bytes of reads.
#[require_unsafe_in_body]
pub unsafe fn is_zeroed(ptr: NonNull<u8>, len: usize) -> bool {
    (0..len).all(|offset| unsafe { ptr.as_ptr().add(offset).read() } == 0)
}
