//! Page arena: grants and reclaims contiguous runs of fixed-size pages
//!
//! The arena manages a contiguous region of address space, which it divides
//! into evenly sized **pages**. Page occupancy is tracked by a bitmap that is
//! stored at the start of the region itself, so that the arena can exist
//! before any allocator does:
//!
//! `|bitmap words|..padding..|page 0|page 1|page 2|...|page N-1|`
//!
//! The arena has no lock of its own. It is mutated through `&mut self`, and
//! the heap only ever reaches it from within its critical section.

use crate::{align::align_up, bitmap::Bitmap, error::BuildError};

use std::{fmt, mem, ptr::NonNull};


/// Fixed-capacity page allocator over a contiguous region
pub struct PageArena {
    /// Address of page 0
    ///
    /// Always a multiple of the page size, whatever the alignment of the
    /// region that was handed to us.
    pages_start: usize,

    /// Bitshift-based representation of the page size
    ///
    /// This tells the optimizer that the page size is a power of two, so that
    /// address to page index translation compiles down to shifts. Please use
    /// page_size() to query the page size.
    page_shift: u8,

    /// Occupancy of the pages, in address order
    bitmap: Bitmap,

    /// Number of pages currently granted
    granted: usize,

    /// Host memory reservation backing the region, if we made it ourselves
    reservation: Option<region::Allocation>,
}

// The arena exclusively owns the region it manages (or was promised exclusive
// use of it by the caller of `new_in`), so moving it across threads is fine.
unsafe impl Send for PageArena {}

impl PageArena {
    /// Reserve a fresh region from the host and manage it
    ///
    /// The page size must be a power of two, and the capacity (in pages) must
    /// not be zero. These are checked by `Builder`.
    pub fn reserve(page_size: usize, capacity: usize) -> Result<Self, BuildError> {
        // Enough room for the bitmap, plus a page worth of slack so that
        // page 0 can always be moved up to a page boundary.
        let len = Self::bitmap_bytes(capacity)
            .checked_add(page_size)
            .and_then(|len| capacity.checked_mul(page_size)?.checked_add(len))
            .ok_or(BuildError::CapacityOverflow { page_size, capacity })?;
        let mut reservation = region::alloc(len, region::Protection::READ_WRITE)?;

        // This is safe because the region was just reserved for our exclusive
        // use, is readable and writable, and lives as long as the arena since
        // the arena owns the reservation.
        let base = NonNull::new(reservation.as_mut_ptr::<u8>())
                       .expect("Successful reservations are never null");
        let mut arena = unsafe { Self::new_in(base, reservation.len(), page_size, capacity)? };
        arena.reservation = Some(reservation);
        Ok(arena)
    }

    /// Manage a caller-provided region
    ///
    /// # Safety
    ///
    /// `base..base + len` must be valid for reads and writes, must not be used
    /// by anything else while the arena exists, and must outlive the arena.
    /// `page_size` must be a power of two and `capacity` must not be zero.
    pub unsafe fn new_in(base: NonNull<u8>,
                         len: usize,
                         page_size: usize,
                         capacity: usize) -> Result<Self, BuildError> {
        // Check interface preconditions in debug builds
        debug_assert!(page_size.is_power_of_two(), "Page size must be a power of 2");
        debug_assert!(capacity != 0, "Arena capacity must not be zero");

        // Lay out bitmap and pages within the region
        let base_addr = base.as_ptr() as usize;
        let bitmap_start = align_up(base_addr, mem::align_of::<usize>());
        let overflow = || BuildError::CapacityOverflow { page_size, capacity };
        let bitmap_end = bitmap_start.checked_add(Self::bitmap_bytes(capacity))
                                     .ok_or_else(overflow)?;
        let pages_start = bitmap_end.checked_add(page_size - 1)
                                    .ok_or_else(overflow)? & !(page_size - 1);
        let needed = capacity
            .checked_mul(page_size)
            .and_then(|pages_len| (pages_start - base_addr).checked_add(pages_len))
            .ok_or_else(overflow)?;
        if needed > len {
            return Err(BuildError::RegionTooSmall { needed, available: len });
        }

        // Set up the occupancy bitmap in the first bytes of the region
        let words = NonNull::new_unchecked(bitmap_start as *mut usize);
        Ok(Self {
            pages_start,
            page_shift: page_size.trailing_zeros() as u8,
            bitmap: Bitmap::new_in(words, capacity),
            granted: 0,
            reservation: None,
        })
    }

    /// Size of the occupancy bitmap for a given capacity (in bytes)
    fn bitmap_bytes(capacity: usize) -> usize {
        Bitmap::words_for(capacity) * mem::size_of::<usize>()
    }

    /// Page size of this arena (in bytes)
    pub const fn page_size(&self) -> usize {
        1 << (self.page_shift as usize)
    }

    /// Total number of pages managed by this arena
    pub fn capacity(&self) -> usize {
        self.bitmap.len()
    }

    /// Number of pages which are not currently granted
    pub fn free_pages(&self) -> usize {
        self.capacity() - self.granted
    }

    /// Truth that `addr` falls within the pages managed by this arena
    pub fn contains(&self, addr: usize) -> bool {
        addr >= self.pages_start
            && addr - self.pages_start < (self.capacity() << self.page_shift)
    }

    /// Grant a run of `count` contiguous pages
    ///
    /// Returns the address of the first page, or `None` if no free run is
    /// long enough. Running out of pages is not fatal at this level, the
    /// decision belongs to the caller.
    pub fn acquire(&mut self, count: usize) -> Option<NonNull<u8>> {
        if count == 0 || count > self.free_pages() {
            return None;
        }
        let first_page = self.bitmap.find_clear_run(count)?;
        self.bitmap.set_run(first_page, count);
        self.granted += count;
        NonNull::new((self.pages_start + (first_page << self.page_shift)) as *mut u8)
    }

    /// Give back a run of pages previously granted by `acquire`
    ///
    /// # Safety
    ///
    /// `ptr` and `count` must match a previous successful call to `acquire`,
    /// and the run must not have been released already. Violations are only
    /// detected in debug builds.
    pub unsafe fn release(&mut self, ptr: NonNull<u8>, count: usize) {
        // In debug builds, check that the pointer does come from our pages
        let addr = ptr.as_ptr() as usize;
        debug_assert!(self.contains(addr), "Released pages are out of arena range");
        debug_assert_eq!((addr - self.pages_start) % self.page_size(), 0,
                         "Released pages don't start on a page boundary");

        let first_page = (addr - self.pages_start) >> self.page_shift;
        self.bitmap.clear_run(first_page, count);
        self.granted -= count;
    }
}

impl fmt::Debug for PageArena {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PageArena")
         .field("pages_start", &format_args!("{:#x}", self.pages_start))
         .field("page_size", &self.page_size())
         .field("capacity", &self.capacity())
         .field("granted", &self.granted)
         .field("reserved", &self.reservation.is_some())
         .finish()
    }
}

impl Drop for PageArena {
    fn drop(&mut self) {
        debug_assert_eq!(self.bitmap.count_set(), self.granted,
                         "Page bitmap and grant count disagree");

        // Pages still granted at this point belong to leaked allocations,
        // whose pointers become dangling when the reservation goes away.
        if self.granted != 0 {
            log::warn!("page arena dropped with {} pages still granted",
                       self.granted);
        }
    }
}
