//! Use of a `Heap` as the global allocator

use crate::{Heap, DEFAULT_ALIGNMENT};

use std::{
    alloc::{GlobalAlloc, Layout},
    ptr::{self, NonNull},
};


/// Alignment that the heap uses for a given layout
///
/// Both sides of an allocation must agree on it, since freeing reads back the
/// alignment slot that allocation wrote.
fn heap_align(layout: Layout) -> usize {
    layout.align().max(DEFAULT_ALIGNMENT)
}

// Failures are reported as null pointers, as GlobalAlloc demands. Misuse is
// still logged and handed over to the diagnostic hook.
unsafe impl GlobalAlloc for Heap {
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        self.try_allocate(layout.size(), heap_align(layout))
            .map_or(ptr::null_mut(), NonNull::as_ptr)
    }

    unsafe fn dealloc(&self, ptr: *mut u8, layout: Layout) {
        let _ = self.try_free(ptr, heap_align(layout));
    }

    // Every allocation is zero-filled already
    unsafe fn alloc_zeroed(&self, layout: Layout) -> *mut u8 {
        self.alloc(layout)
    }

    unsafe fn realloc(&self, ptr: *mut u8, layout: Layout, new_size: usize) -> *mut u8 {
        match self.try_reallocate(ptr, heap_align(layout), new_size) {
            Ok(Some(new_ptr)) => new_ptr.as_ptr(),
            Ok(None) | Err(_) => ptr::null_mut(),
        }
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use crate::Builder;

    #[test]
    fn layouts() {
        let heap = Builder::new().page_size(4096).page_capacity(32).build().unwrap();
        unsafe {
            for &align in &[1, 2, 8, 16, 32, 4096] {
                let layout = Layout::from_size_align(40, align).unwrap();
                let ptr = heap.alloc_zeroed(layout);
                assert!(!ptr.is_null());
                assert_eq!(ptr as usize % align.max(DEFAULT_ALIGNMENT), 0);
                assert!((0..40).all(|i| *ptr.add(i) == 0));
                ptr.write_bytes(0x77, 40);

                let grown = heap.realloc(ptr, layout, 400);
                assert!(!grown.is_null());
                assert_eq!(grown as usize % align.max(DEFAULT_ALIGNMENT), 0);
                assert!((0..40).all(|i| *grown.add(i) == 0x77));
                heap.dealloc(grown, Layout::from_size_align(400, align).unwrap());
            }
        }
        let stats = heap.stats();
        assert_eq!(stats.in_use, 0);
        assert_eq!(stats.errors, 0);
    }

    #[test]
    fn exhaustion_yields_null() {
        let heap = Builder::new().page_size(4096).page_capacity(4).build().unwrap();
        let layout = Layout::from_size_align(1 << 20, 8).unwrap();
        assert!(unsafe { heap.alloc(layout) }.is_null());
        assert_eq!(heap.stats().warnings, 1);
    }
}
