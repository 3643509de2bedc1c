//! This crate provides a general purpose heap for freestanding environments,
//! such as kernels, where there is no underlying allocator to call into. All
//! it needs is a contiguous region of memory, which it manages on its own.
//!
//! The heap offers the usual trio of allocation, reallocation and liberation
//! of variable-sized buffers, with arbitrary power-of-two alignment. It also
//! keeps an eye on its users: freeing a buffer twice, freeing a pointer that
//! it did not hand out, or overrunning a buffer by a few bytes is detected,
//! counted and reported rather than silently corrupting the heap.
//!
//! # Heap layout primer
//!
//! The heap manages memory at two levels of granularity.
//!
//! At the coarse level, the region given to the heap is divided into evenly
//! sized **pages**, whose occupancy is tracked by a bitmap stored at the
//! start of the region. This **page arena** hands out contiguous runs of
//! pages and takes them back, and that is all it knows how to do.
//!
//! At the fine level, each run of pages that the heap obtains from the arena
//! is a **block**, which starts with a small header and is carved into
//! **segments**, one per allocation. Each segment also starts with a header,
//! which records its size, the block it belongs to, and a sentinel value that
//! tells live segments apart from freed ones and from random memory. Within a
//! block, segments are kept sorted by address, so that the free space between
//! them can be found and reused.
//!
//! Allocation looks for a gap that is large enough in the existing blocks,
//! starting with the block that is believed to have the most free space, and
//! only asks the arena for a new block when none fits. Liberation unlinks the
//! segment, and gives the block's pages back to the arena once its last
//! segment is gone.
//!
//! The **page size** and the **minimal block size** are the main tuning
//! parameters. Larger blocks mean fewer trips to the arena and less
//! bookkeeping, but more memory held by a heap that only has a handful of
//! small allocations in flight.
//!
//! # Example
//!
//! ```
//! use kheap::Builder;
//!
//! let heap = Builder::new().page_capacity(64).build().unwrap();
//! let ptr = heap.allocate(100);
//! unsafe {
//!     ptr.as_ptr().write_bytes(0x42, 100);
//!     heap.free(ptr.as_ptr());
//! }
//! assert_eq!(heap.in_use(), 0);
//! ```
//!
//! A `Heap` can also live in a `static` and serve as the global allocator,
//! in which case it must be initialized with `Heap::init_in` or
//! `Heap::init_reserved` before the first allocation.

mod align;
mod arena;
mod bitmap;
mod block;
mod builder;
mod diag;
mod error;
mod global;
mod segment;
mod state;

use crate::{
    builder::Hooks,
    state::{Grant, HeapState, Release, Resize},
};

use std::{
    panic::Location,
    ptr::{self, NonNull},
};


// Re-export the public interface at the crate root
pub use crate::{
    builder::{Builder, HeapConfig, DEFAULT_MIN_BLOCK_PAGES, MIN_PAGE_SIZE},
    diag::{
        panic_on_oom,
        BlockInfo,
        Diagnostic,
        DiagnosticHook,
        HeapStats,
        OomHandler,
        OutOfMemory,
    },
    error::{BuildError, HeapError, Misuse},
};


/// Alignment of the pointers returned by `Heap::allocate` and friends
pub const DEFAULT_ALIGNMENT: usize = 16;


/// A thread-safe general purpose heap
///
/// A heap does nothing until it is given a region to manage, which is done
/// either by `Builder::build` (or `build_in`), or by calling `init_reserved`
/// (or `init_in`) on a heap created with `Heap::new`.
#[derive(Debug)]
pub struct Heap {
    /// Everything the heap knows, once initialized
    ///
    /// A single lock covers every operation from start to end. Logging and
    /// user callbacks happen after the lock is released, as they are free to
    /// allocate from this very heap.
    inner: spin::Mutex<Option<Installed>>,
}

/// State of an initialized heap
#[derive(Debug)]
struct Installed {
    state: HeapState,
    hooks: Hooks,
}

/// Alignment of an allocation, as requested by the user
#[derive(Clone, Copy, Debug)]
enum Align {
    /// Explicit alignment in bytes (0 or a power of two)
    Bytes(usize),

    /// Alignment on the arena's page size
    Page,
}

impl Align {
    fn resolve(self, state: &HeapState) -> usize {
        match self {
            Align::Bytes(align) => align,
            Align::Page => state.page_size(),
        }
    }
}

impl Heap {
    /// Create a heap that is not backed by any memory yet
    ///
    /// This can be used to initialize a `static`. Allocations will fail with
    /// `HeapError::Uninitialized` until the heap is initialized.
    pub const fn new() -> Self {
        Self {
            inner: spin::Mutex::new(None),
        }
    }

    /// Back the heap with a region reserved from the host
    ///
    /// # Panics
    ///
    /// If the heap was already initialized.
    pub fn init_reserved(&self, config: HeapConfig) -> Result<(), BuildError> {
        let arena = config.reserve_arena()?;
        self.install(config, HeapState::new(arena, config.min_block_pages()));
        Ok(())
    }

    /// Back the heap with a caller-provided region
    ///
    /// # Safety
    ///
    /// `base..base + len` must be valid for reads and writes, must not be used
    /// by anything else while the heap exists, and must outlive the heap.
    ///
    /// # Panics
    ///
    /// If the heap was already initialized.
    pub unsafe fn init_in(&self,
                          config: HeapConfig,
                          base: NonNull<u8>,
                          len: usize) -> Result<(), BuildError> {
        let arena = config.arena_in(base, len)?;
        self.install(config, HeapState::new(arena, config.min_block_pages()));
        Ok(())
    }

    fn install(&self, config: HeapConfig, state: HeapState) {
        {
            let mut inner = self.inner.lock();
            assert!(inner.is_none(), "Heap must only be initialized once");
            *inner = Some(Installed { state, hooks: config.hooks() });
        }
        log::debug!("heap initialized with {} pages of {} bytes",
                    config.page_capacity(), config.page_size());
    }

    /// Allocate `size` bytes with `DEFAULT_ALIGNMENT`, zero-filled
    ///
    /// Failure to allocate is fatal and ends up in the configured
    /// out-of-memory handler.
    #[track_caller]
    pub fn allocate(&self, size: usize) -> NonNull<u8> {
        self.allocate_aligned(size, DEFAULT_ALIGNMENT)
    }

    /// Allocate `size` bytes aligned to `align`, zero-filled
    ///
    /// `align` must be a power of 2, or 0 for the natural alignment of the
    /// heap's headers. Memory allocated this way must be freed with
    /// `free_aligned` and the same alignment.
    ///
    /// Invalid alignments are a programming error and cause a panic, whereas
    /// `try_allocate` reports them as `HeapError::InvalidAlignment`.
    #[track_caller]
    pub fn allocate_aligned(&self, size: usize, align: usize) -> NonNull<u8> {
        assert!(align == 0 || align.is_power_of_two(),
                "Alignment must be 0 or a power of 2");
        match self.grant(size, Align::Bytes(align)) {
            Ok(ptr) => ptr,
            Err(error) => self.out_of_memory(error),
        }
    }

    /// Allocate `size` bytes aligned on a page boundary, zero-filled
    ///
    /// Memory allocated this way must be freed with `free_page_aligned`.
    #[track_caller]
    pub fn allocate_page_aligned(&self, size: usize) -> NonNull<u8> {
        match self.grant(size, Align::Page) {
            Ok(ptr) => ptr,
            Err(error) => self.out_of_memory(error),
        }
    }

    /// Allocate `size` bytes aligned to `align`, zero-filled, or report why
    /// this cannot be done
    #[track_caller]
    pub fn try_allocate(&self, size: usize, align: usize) -> Result<NonNull<u8>, HeapError> {
        self.grant(size, Align::Bytes(align))
    }

    /// Allocate a zero-filled array of `count` elements of `size` bytes,
    /// with `DEFAULT_ALIGNMENT`
    ///
    /// Failure to allocate, including the array size overflowing `usize`, is
    /// fatal and ends up in the configured out-of-memory handler.
    #[track_caller]
    pub fn callocate(&self, count: usize, size: usize) -> NonNull<u8> {
        match self.try_callocate(count, size) {
            Ok(ptr) => ptr,
            Err(error) => self.out_of_memory(error),
        }
    }

    /// Allocate a zero-filled array of `count` elements of `size` bytes, or
    /// report why this cannot be done
    #[track_caller]
    pub fn try_callocate(&self, count: usize, size: usize) -> Result<NonNull<u8>, HeapError> {
        match count.checked_mul(size) {
            Some(total) => self.grant(total, Align::Bytes(DEFAULT_ALIGNMENT)),
            None => {
                let error = HeapError::SizeOverflow { count, size };
                log::warn!("{} from {}", error, Location::caller());
                Err(error)
            }
        }
    }

    /// Free memory allocated by `allocate` or `callocate`
    ///
    /// Freeing a null pointer does nothing. Freeing a pointer twice, or a
    /// pointer that this heap did not hand out, is reported and ignored.
    ///
    /// # Safety
    ///
    /// The memory must not be used after it has been freed. Pointers that do
    /// not come from this heap must not point into another heap's live
    /// allocations.
    #[track_caller]
    pub unsafe fn free(&self, ptr: *mut u8) {
        self.free_aligned(ptr, DEFAULT_ALIGNMENT)
    }

    /// Free memory allocated by `allocate_aligned` with alignment `align`
    ///
    /// # Safety
    ///
    /// See `free`.
    #[track_caller]
    pub unsafe fn free_aligned(&self, ptr: *mut u8, align: usize) {
        // Misuse has already been reported at this point
        let _ = self.release(ptr, Align::Bytes(align));
    }

    /// Free memory allocated by `allocate_page_aligned`
    ///
    /// # Safety
    ///
    /// See `free`.
    #[track_caller]
    pub unsafe fn free_page_aligned(&self, ptr: *mut u8) {
        let _ = self.release(ptr, Align::Page);
    }

    /// Free memory allocated with alignment `align`, telling whether the
    /// pointer was accepted
    ///
    /// # Safety
    ///
    /// See `free`.
    #[track_caller]
    pub unsafe fn try_free(&self, ptr: *mut u8, align: usize) -> Result<(), HeapError> {
        self.release(ptr, Align::Bytes(align))
    }

    /// Resize memory allocated by `allocate`
    ///
    /// Resizing to zero bytes frees the memory and returns None. Resizing a
    /// null pointer allocates. Otherwise, the memory is resized in place if
    /// it has room, or moved to a new allocation, and the pointer to the
    /// resized memory is returned.
    ///
    /// Failure to allocate is fatal. Misuse is reported and yields None.
    ///
    /// # Safety
    ///
    /// After this call, `ptr` must not be used anymore, unless it was
    /// returned back.
    #[track_caller]
    pub unsafe fn reallocate(&self, ptr: *mut u8, new_size: usize) -> Option<NonNull<u8>> {
        self.reallocate_aligned(ptr, DEFAULT_ALIGNMENT, new_size)
    }

    /// Resize memory allocated by `allocate_aligned` with alignment `align`
    ///
    /// The resized memory keeps the same alignment, which must be 0 or a
    /// power of 2 as in `allocate_aligned`.
    ///
    /// # Safety
    ///
    /// See `reallocate`.
    #[track_caller]
    pub unsafe fn reallocate_aligned(&self,
                                     ptr: *mut u8,
                                     align: usize,
                                     new_size: usize) -> Option<NonNull<u8>> {
        assert!(align == 0 || align.is_power_of_two(),
                "Alignment must be 0 or a power of 2");
        match self.try_reallocate(ptr, align, new_size) {
            Ok(result) => result,
            Err(HeapError::Misuse(_)) => None,
            Err(error) => self.out_of_memory(error),
        }
    }

    /// Resize memory allocated with alignment `align`, or report why this
    /// cannot be done
    ///
    /// On failure, the original memory is left untouched.
    ///
    /// # Safety
    ///
    /// See `reallocate`.
    #[track_caller]
    pub unsafe fn try_reallocate(&self,
                                 ptr: *mut u8,
                                 align: usize,
                                 new_size: usize) -> Result<Option<NonNull<u8>>, HeapError> {
        let location = Location::caller();
        let (result, hooks) = self.locked(|state| state.reallocate(ptr, align, new_size));
        match result {
            Ok(Resize::Freed(release)) => {
                report_release(&release, ptr);
                Ok(None)
            }
            Ok(Resize::Fresh(grant)) => {
                report_grant(&grant, new_size, align, location);
                Ok(Some(grant.ptr))
            }
            Ok(Resize::InPlace) => {
                log::trace!("resized {:p} to {} bytes in place", ptr, new_size);
                Ok(NonNull::new(ptr))
            }
            Ok(Resize::Moved(grant, release)) => {
                report_grant(&grant, new_size, align, location);
                report_release(&release, ptr);
                Ok(Some(grant.ptr))
            }
            Err(error) => {
                report_error(error, ptr, hooks, location);
                Err(error)
            }
        }
    }

    /// Bytes currently reserved by live allocations, alignment slack
    /// included
    pub fn in_use(&self) -> usize {
        self.inner.lock().as_ref().map_or(0, |installed| installed.state.in_use())
    }

    /// Snapshot of the heap's accounting
    ///
    /// An uninitialized heap reports all zeroes.
    pub fn stats(&self) -> HeapStats {
        self.inner.lock()
            .as_ref()
            .map(|installed| installed.state.stats())
            .unwrap_or_default()
    }

    /// Visit every block of the heap
    ///
    /// The visitor runs with the heap locked, so it must not use this heap in
    /// any way. In particular, it must not allocate if this heap is the
    /// global allocator.
    pub fn walk(&self, visitor: impl FnMut(&BlockInfo)) {
        if let Some(installed) = self.inner.lock().as_ref() {
            installed.state.walk(visitor);
        }
    }

    /// Log the heap's accounting at the info level
    pub fn dump(&self) {
        let stats = self.stats();
        log::info!("heap statistics:\n{}", stats);
    }

    /// Run `operation` on the locked heap state
    ///
    /// Also returns the callbacks to be used for reporting, once the lock is
    /// released.
    fn locked<R>(&self,
                 operation: impl FnOnce(&mut HeapState) -> Result<R, HeapError>)
                 -> (Result<R, HeapError>, Hooks) {
        let mut inner = self.inner.lock();
        match inner.as_mut() {
            Some(installed) => (operation(&mut installed.state), installed.hooks),
            None => (Err(HeapError::Uninitialized), Hooks::default()),
        }
    }

    /// Allocation backend shared by all allocation entry points
    #[track_caller]
    fn grant(&self, size: usize, align: Align) -> Result<NonNull<u8>, HeapError> {
        let location = Location::caller();
        let (result, hooks) = self.locked(|state| {
            let align = align.resolve(state);
            state.allocate(size, align).map(|grant| (grant, align))
        });
        match result {
            Ok((grant, align)) => {
                report_grant(&grant, size, align, location);
                Ok(grant.ptr)
            }
            Err(error) => {
                report_error(error, ptr::null_mut(), hooks, location);
                Err(error)
            }
        }
    }

    /// Liberation backend shared by all liberation entry points
    #[track_caller]
    unsafe fn release(&self, ptr: *mut u8, align: Align) -> Result<(), HeapError> {
        let location = Location::caller();
        let (result, hooks) = self.locked(|state| {
            let align = align.resolve(state);
            state.free(ptr, align).map_err(HeapError::from)
        });
        match result {
            Ok(release) => {
                report_release(&release, ptr);
                Ok(())
            }
            Err(error) => {
                report_error(error, ptr, hooks, location);
                Err(error)
            }
        }
    }

    /// Hand a fatal allocation failure over to the out-of-memory handler
    #[track_caller]
    fn out_of_memory(&self, error: HeapError) -> ! {
        let (stats, hooks) = match self.inner.lock().as_ref() {
            Some(installed) => (installed.state.stats(), installed.hooks),
            None => (HeapStats::default(), Hooks::default()),
        };
        let oom = OutOfMemory { error, stats, location: Location::caller() };
        (hooks.oom_handler)(&oom)
    }
}

impl Default for Heap {
    fn default() -> Self {
        Self::new()
    }
}


/// Log a successful allocation
fn report_grant(grant: &Grant,
                size: usize,
                align: usize,
                location: &'static Location<'static>) {
    if grant.zero_sized {
        log::warn!("zero-sized allocation from {}, serving 1 byte", location);
    }
    if let Some(block) = grant.grown {
        log::debug!("heap grown by {} pages at {:#x}", block.pages, block.address);
    }
    log::trace!("allocation #{}: {} bytes aligned to {} at {:p} ({:?})",
                grant.id, size, align, grant.ptr, grant.placement);
}

/// Log a successful liberation
fn report_release(release: &Release, ptr: *mut u8) {
    log::trace!("freed {:p} ({} bytes)", ptr, release.size);
    if let Some(block) = release.reclaimed {
        log::debug!("heap shrunk by {} pages at {:#x}", block.pages, block.address);
    }
}

/// Log a failed operation, and tell the diagnostic hook about misuse
fn report_error(error: HeapError,
                ptr: *mut u8,
                hooks: Hooks,
                location: &'static Location<'static>) {
    match error {
        HeapError::Misuse(misuse) => {
            let diagnostic = Diagnostic { misuse, address: ptr as usize, location };
            diag::report(&diagnostic, hooks.diagnostic_hook);
        }
        _ => log::warn!("{} from {}", error, location),
    }
}


/// Small utility to divide two integers, rounding the result up
fn div_round_up(x: usize, y: usize) -> usize {
    // Check interface preconditions in debug builds
    debug_assert!(y != 0, "Attempted to divide by zero");

    // Return rounded division result
    (x / y) + (x % y != 0) as usize
}
