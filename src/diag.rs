//! Usage accounting and misuse diagnostics

use crate::{
    error::{HeapError, Misuse},
    segment::{DEAD_MAGIC, LIVE_MAGIC},
};

use std::{fmt, panic::Location};


/// Callback notified of every misuse, after the heap lock is released
pub type DiagnosticHook = fn(&Diagnostic);

/// Callback invoked when a fatal allocation cannot be satisfied
///
/// It runs after the heap lock is released and must not return.
pub type OomHandler = fn(&OutOfMemory) -> !;


/// Report of a misuse, as handed to the diagnostic hook
#[derive(Clone, Copy, Debug)]
pub struct Diagnostic {
    /// What went wrong
    pub misuse: Misuse,

    /// Pointer handed over by the caller
    pub address: usize,

    /// Source location of the offending call
    pub location: &'static Location<'static>,
}

impl fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} on {:#x} from {}", self.misuse, self.address, self.location)
    }
}


/// Report of a failed fatal allocation, as handed to the out-of-memory handler
#[derive(Clone, Copy, Debug)]
pub struct OutOfMemory {
    /// Why the allocation failed
    pub error: HeapError,

    /// Heap state right after the failure
    pub stats: HeapStats,

    /// Source location of the failed call
    pub location: &'static Location<'static>,
}

impl fmt::Display for OutOfMemory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "OUT OF MEMORY: {} from {} ({} of {} pages free)",
               self.error, self.location, self.stats.free_pages, self.stats.total_pages)
    }
}

/// Default out-of-memory handler: there is no way to recover, so panic
pub fn panic_on_oom(oom: &OutOfMemory) -> ! {
    panic!("{}", oom)
}


/// Snapshot of the heap's accounting
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct HeapStats {
    /// Bytes obtained from the page arena (sum of all block sizes)
    pub allocated: usize,

    /// Bytes reserved by live segments, alignment slack included
    pub in_use: usize,

    /// Suspicious but harmless calls (null frees, zero-sized requests,
    /// arena exhaustion)
    pub warnings: u64,

    /// Rejected frees and reallocations
    pub errors: u64,

    /// Errors that look like a small overrun of a neighbouring allocation
    pub possible_overruns: u64,

    /// Number of blocks in the block list
    pub blocks: usize,

    /// Pages left in the arena
    pub free_pages: usize,

    /// Pages managed by the arena
    pub total_pages: usize,
}

impl fmt::Display for HeapStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "system memory allocated: {} bytes in {} blocks",
                 self.allocated, self.blocks)?;
        writeln!(f, "memory in use: {} bytes", self.in_use)?;
        writeln!(f, "arena pages free: {} of {}", self.free_pages, self.total_pages)?;
        writeln!(f, "warnings: {}", self.warnings)?;
        writeln!(f, "errors: {}", self.errors)?;
        write!(f, "possible overruns: {}", self.possible_overruns)
    }
}


/// Description of one block, as visited by `Heap::walk`
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct BlockInfo {
    /// Address of the block (and of its first page)
    pub address: usize,

    /// Number of arena pages making up the block
    pub pages: usize,

    /// Capacity of the block in bytes
    pub size: usize,

    /// Bytes used by headers and segments
    pub usage: usize,

    /// Number of live segments
    pub segments: usize,
}


/// Running counters kept by the heap state
#[derive(Clone, Copy, Debug, Default)]
pub(crate) struct Counters {
    pub allocated: usize,
    pub in_use: usize,
    pub warnings: u64,
    pub errors: u64,
    pub possible_overruns: u64,
}

impl Counters {
    /// Account for a detected misuse
    pub fn record(&mut self, misuse: Misuse) {
        match misuse {
            Misuse::NullPointer => self.warnings += 1,
            Misuse::PossibleOverrun { .. } => {
                self.errors += 1;
                self.possible_overruns += 1;
            }
            Misuse::DoubleFree | Misuse::BadPointer { .. } => self.errors += 1,
        }
    }
}


/// Work out why a segment header does not carry the live sentinel
///
/// A header that was freed carries the dead sentinel. A header whose low
/// bytes still match the live sentinel was most likely clobbered by a write
/// that ran a few bytes past the end of the previous allocation. Anything
/// else is not a header of ours.
pub fn classify(magic: u32, address: usize) -> Misuse {
    debug_assert_ne!(magic, LIVE_MAGIC, "Live headers are not misuse");
    if magic == DEAD_MAGIC {
        return Misuse::DoubleFree;
    }
    let partial_match = [0x00ff_ffff, 0x0000_ffff, 0x0000_00ff]
        .iter()
        .any(|&mask| magic & mask == LIVE_MAGIC & mask);
    if partial_match {
        Misuse::PossibleOverrun { magic }
    } else {
        Misuse::BadPointer { address }
    }
}

/// Log a misuse and hand it over to the diagnostic hook, if any
///
/// Must be called without holding the heap lock, since both the logger and
/// the hook are free to allocate.
pub fn report(diagnostic: &Diagnostic, hook: Option<DiagnosticHook>) {
    match diagnostic.misuse {
        Misuse::NullPointer => log::warn!("{}", diagnostic),
        _ => log::error!("{}", diagnostic),
    }
    if let Some(hook) = hook {
        hook(diagnostic);
    }
}
