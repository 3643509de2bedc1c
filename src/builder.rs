//! Mechanism for configuring a `Heap`, with proper invariant checking

use crate::{
    arena::PageArena,
    diag::{panic_on_oom, DiagnosticHook, OomHandler},
    error::BuildError,
    Heap,
};

use std::ptr::NonNull;


/// Smallest supported page size (in bytes)
///
/// Pages must at least hold a block header and a small segment.
pub const MIN_PAGE_SIZE: usize = 64;

/// Default minimal number of pages per block
pub const DEFAULT_MIN_BLOCK_PAGES: usize = 16;


/// Builder for a heap
//
// NOTE: The main purpose of this builder is to ensure that a certain number of
//       preconditions are upheld upon constructing the heap. These are listed
//       as "must" bullet points in the struct members' doc comments.
#[derive(Debug)]
pub struct Builder {
    /// Page size of the arena in bytes
    /// - Will be set to the host's page size if unspecified
    /// - Must be a power of 2, so that the arena has fast divide/modulo
    /// - Must be at least `MIN_PAGE_SIZE`
    page_size: Option<usize>,

    /// Number of pages managed by the arena
    /// - Must be specified
    /// - Must be nonzero
    page_capacity: Option<usize>,

    /// Minimal number of pages per block
    /// - Will be set to `DEFAULT_MIN_BLOCK_PAGES` if unspecified
    /// - Must be nonzero
    min_block_pages: Option<usize>,

    /// Handler for fatal allocation failures
    /// - Will be set to `panic_on_oom` if unspecified
    oom_handler: Option<OomHandler>,

    /// Observer of every detected misuse
    /// - Will be left unset if unspecified
    diagnostic_hook: Option<DiagnosticHook>,
}

impl Builder {
    /// Start configuring a heap
    pub const fn new() -> Self {
        Self {
            page_size: None,
            page_capacity: None,
            min_block_pages: None,
            oom_handler: None,
            diagnostic_hook: None,
        }
    }

    /// Set the page size of the heap's arena (in bytes)
    ///
    /// The page size is the granularity at which blocks are obtained from the
    /// arena, and the alignment of `Heap::allocate_page_aligned` allocations.
    ///
    /// It must be a power of 2 and at least `MIN_PAGE_SIZE`. If unspecified,
    /// the host's page size is used.
    pub fn page_size(&mut self, page_size: usize) -> &mut Self {
        assert!(page_size.is_power_of_two(), "Page size must be a power of 2");
        assert!(page_size >= MIN_PAGE_SIZE,
                "Page size must be at least {} bytes", MIN_PAGE_SIZE);
        assert!(self.page_size.replace(page_size).is_none(),
                "Page size must only be set once");
        self
    }

    /// Set the number of pages managed by the heap's arena
    ///
    /// This bounds the amount of memory that the heap will ever hand out.
    /// Bookkeeping and fragmentation mean that somewhat less than
    /// `page_capacity * page_size` bytes can actually be allocated.
    ///
    /// The page capacity must not be zero.
    pub fn page_capacity(&mut self, page_capacity: usize) -> &mut Self {
        assert!(page_capacity != 0, "Page capacity must not be zero");
        assert!(self.page_capacity.replace(page_capacity).is_none(),
                "Page capacity must only be set once");
        self
    }

    /// Set the minimal number of pages that a block spans
    ///
    /// Small allocations are served from blocks of at least this many pages,
    /// which amortizes the cost of going to the arena over many of them. A
    /// larger value means fewer blocks, but more memory held by a heap that
    /// has little in use.
    ///
    /// The minimal block size must not be zero, and defaults to
    /// `DEFAULT_MIN_BLOCK_PAGES` pages.
    pub fn min_block_pages(&mut self, min_block_pages: usize) -> &mut Self {
        assert!(min_block_pages != 0, "Blocks must span at least one page");
        assert!(self.min_block_pages.replace(min_block_pages).is_none(),
                "Minimal block size must only be set once");
        self
    }

    /// Set the handler that fatal allocation failures end up in
    ///
    /// It is called, with the heap unlocked, when `Heap::allocate` and
    /// friends cannot be satisfied. By default, this panics.
    pub fn oom_handler(&mut self, handler: OomHandler) -> &mut Self {
        assert!(self.oom_handler.replace(handler).is_none(),
                "Out-of-memory handler must only be set once");
        self
    }

    /// Set a hook that is told about every misuse of the heap
    ///
    /// It is called, with the heap unlocked, after each null, double or bad
    /// free has been logged.
    pub fn diagnostic_hook(&mut self, hook: DiagnosticHook) -> &mut Self {
        assert!(self.diagnostic_hook.replace(hook).is_none(),
                "Diagnostic hook must only be set once");
        self
    }

    /// Check the configuration and resolve its defaults
    ///
    /// You must have configured at least a page capacity before calling this
    /// function.
    pub fn config(&self) -> HeapConfig {
        let page_capacity = self.page_capacity
                                .expect("You must specify a page capacity");
        HeapConfig {
            page_size: self.page_size.unwrap_or_else(region::page::size),
            page_capacity,
            min_block_pages: self.min_block_pages.unwrap_or(DEFAULT_MIN_BLOCK_PAGES),
            hooks: Hooks {
                oom_handler: self.oom_handler.unwrap_or(panic_on_oom),
                diagnostic_hook: self.diagnostic_hook,
            },
        }
    }

    /// Build a heap over a region reserved from the host
    pub fn build(&self) -> Result<Heap, BuildError> {
        let heap = Heap::new();
        heap.init_reserved(self.config())?;
        Ok(heap)
    }

    /// Build a heap over a caller-provided region
    ///
    /// # Safety
    ///
    /// `base..base + len` must be valid for reads and writes, must not be used
    /// by anything else while the heap exists, and must outlive the heap.
    pub unsafe fn build_in(&self, base: NonNull<u8>, len: usize) -> Result<Heap, BuildError> {
        let heap = Heap::new();
        heap.init_in(self.config(), base, len)?;
        Ok(heap)
    }
}

impl Default for Builder {
    fn default() -> Self {
        Self::new()
    }
}


/// Validated heap configuration, as produced by `Builder::config`
///
/// This is what `Heap::init_reserved` and `Heap::init_in` expect, which is
/// handy for heaps that live in a `static` and can only be set up later on.
#[derive(Clone, Copy, Debug)]
pub struct HeapConfig {
    /// Page size of the arena in bytes
    page_size: usize,

    /// Number of pages in the arena
    page_capacity: usize,

    /// Minimal number of pages per block
    min_block_pages: usize,

    /// Callbacks invoked by the heap
    hooks: Hooks,
}

impl HeapConfig {
    /// Reserve an arena from the host, as configured
    pub(crate) fn reserve_arena(&self) -> Result<PageArena, BuildError> {
        PageArena::reserve(self.page_size, self.page_capacity)
    }

    /// Manage a caller-provided region, as configured
    ///
    /// # Safety
    ///
    /// See `Builder::build_in`.
    pub(crate) unsafe fn arena_in(&self,
                                  base: NonNull<u8>,
                                  len: usize) -> Result<PageArena, BuildError> {
        PageArena::new_in(base, len, self.page_size, self.page_capacity)
    }

    pub fn page_size(&self) -> usize {
        self.page_size
    }

    pub fn page_capacity(&self) -> usize {
        self.page_capacity
    }

    pub fn min_block_pages(&self) -> usize {
        self.min_block_pages
    }

    pub(crate) fn hooks(&self) -> Hooks {
        self.hooks
    }
}


/// Callbacks that the heap invokes once its lock is released
#[derive(Clone, Copy, Debug)]
pub(crate) struct Hooks {
    pub oom_handler: OomHandler,
    pub diagnostic_hook: Option<DiagnosticHook>,
}

impl Default for Hooks {
    fn default() -> Self {
        Self {
            oom_handler: panic_on_oom,
            diagnostic_hook: None,
        }
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use crate::diag::{Diagnostic, OutOfMemory};

    #[test]
    fn defaults() {
        let config = Builder::new().page_capacity(8).config();
        assert_eq!(config.page_size(), region::page::size());
        assert_eq!(config.page_capacity(), 8);
        assert_eq!(config.min_block_pages(), DEFAULT_MIN_BLOCK_PAGES);
        assert!(config.hooks().diagnostic_hook.is_none());
    }

    #[test]
    fn explicit_settings() {
        fn hook(_: &Diagnostic) {}
        fn handler(oom: &OutOfMemory) -> ! {
            panic!("custom handler: {}", oom)
        }
        let config = Builder::new().page_size(256)
                                   .page_capacity(32)
                                   .min_block_pages(2)
                                   .oom_handler(handler)
                                   .diagnostic_hook(hook)
                                   .config();
        assert_eq!(config.page_size(), 256);
        assert_eq!(config.page_capacity(), 32);
        assert_eq!(config.min_block_pages(), 2);
        assert!(config.hooks().diagnostic_hook.is_some());
    }

    #[test]
    fn build_in_caller_region() {
        let mut storage = vec![0u64; 1024];
        let base = NonNull::new(storage.as_mut_ptr() as *mut u8).unwrap();
        let len = storage.len() * 8;
        let heap = unsafe {
            Builder::new().page_size(256)
                          .page_capacity(16)
                          .min_block_pages(1)
                          .build_in(base, len)
        }.unwrap();
        let stats = heap.stats();
        assert_eq!(stats.total_pages, 16);
        assert_eq!(stats.free_pages, 16);
        drop(heap);

        let too_small = unsafe { Builder::new().page_size(256)
                                               .page_capacity(64)
                                               .build_in(base, len) };
        assert!(matches!(too_small, Err(BuildError::RegionTooSmall { .. })));
    }

    #[test]
    fn oversized_capacity() {
        let result = Builder::new().page_size(4096)
                                   .page_capacity(usize::MAX)
                                   .build();
        assert!(matches!(result, Err(BuildError::CapacityOverflow { .. })));
    }

    #[test]
    #[should_panic(expected = "Page size must be a power of 2")]
    fn non_power_of_two_page_size() {
        Builder::new().page_size(1000);
    }

    #[test]
    #[should_panic(expected = "Page size must be at least")]
    fn tiny_page_size() {
        Builder::new().page_size(32);
    }

    #[test]
    #[should_panic(expected = "Page capacity must not be zero")]
    fn zero_capacity() {
        Builder::new().page_capacity(0);
    }

    #[test]
    #[should_panic(expected = "Page capacity must only be set once")]
    fn capacity_set_twice() {
        Builder::new().page_capacity(1).page_capacity(2);
    }

    #[test]
    #[should_panic(expected = "Blocks must span at least one page")]
    fn zero_block_pages() {
        Builder::new().min_block_pages(0);
    }

    #[test]
    #[should_panic(expected = "You must specify a page capacity")]
    fn missing_capacity() {
        Builder::new().config();
    }
}
