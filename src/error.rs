//! Error types of the heap

use thiserror::Error;


/// Caller misuse detected by `free` and `reallocate`
///
/// Misuse never corrupts the heap: the offending call is counted, reported,
/// and otherwise ignored.
#[derive(Clone, Copy, Debug, Error, Eq, PartialEq)]
pub enum Misuse {
    /// A null pointer was freed
    #[error("null pointer freed")]
    NullPointer,

    /// The segment header sentinel only partially matches, which usually
    /// means that a neighbouring allocation was written a few bytes past its
    /// end
    #[error("possible 1-3 byte overrun, header magic is {magic:#010x}")]
    PossibleOverrun { magic: u32 },

    /// The segment was already freed
    #[error("segment freed twice")]
    DoubleFree,

    /// The pointer did not come from this heap, or was freed with another
    /// alignment than the one it was allocated with
    #[error("bad pointer {address:#x}")]
    BadPointer { address: usize },
}


/// Errors returned by the non-fatal heap entry points
#[derive(Clone, Copy, Debug, Error, Eq, PartialEq)]
pub enum HeapError {
    /// The page arena cannot provide enough pages for this request
    #[error("heap exhausted by a request of {requested} bytes")]
    Exhausted { requested: usize },

    /// `count * size` does not fit in a `usize`
    #[error("array of {count} elements of {size} bytes overflows")]
    SizeOverflow { count: usize, size: usize },

    /// Alignments must be 0 or a power of two
    #[error("alignment {align} is not a power of 2")]
    InvalidAlignment { align: usize },

    /// The heap was used before being given an arena
    #[error("heap used before initialization")]
    Uninitialized,

    /// The caller handed us a pointer that we cannot free
    #[error(transparent)]
    Misuse(#[from] Misuse),
}


/// Errors that can occur while setting up a heap's page arena
#[derive(Debug, Error)]
pub enum BuildError {
    /// The host refused to reserve the arena's region
    #[error("failed to reserve the arena region")]
    Reserve(#[from] region::Error),

    /// A caller-provided region cannot hold the bitmap and all pages
    #[error("arena region is {available} bytes, {needed} bytes are needed")]
    RegionTooSmall { needed: usize, available: usize },

    /// The arena size does not fit in the address space
    #[error("{capacity} pages of {page_size} bytes overflow the address space")]
    CapacityOverflow { page_size: usize, capacity: usize },
}
