//! Mechanisms for tracking page occupancy with a bitmap
//!
//! Since modern CPUs are not bit-addressable, arrays of unsigned integers must
//! be used as vectors of bits. This module provides an abstraction to ease
//! correct manipulation of such a bitmap in the standard use case of granting
//! and reclaiming contiguous runs of pages.

use std::{ptr::NonNull, slice};


/// Number of pages tracked by one bitmap word
pub const BITS_PER_WORD: usize = std::mem::size_of::<usize>() * 8;


/// Contiguous bit pattern within a single bitmap word
///
/// Will contain a pattern of the form 0b001111110000..., which can be used for
/// targeting a subset of the pages tracked by a word without touching the rest.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
#[repr(transparent)]
pub struct WordMask(usize);

impl WordMask {
    /// The empty mask (no page targeted)
    pub const EMPTY: Self = Self(0);

    /// The full mask (every page of the word targeted)
    pub const FULL: Self = Self(usize::MAX);

    /// Compute a mask given the index of the first bit that should be 1 and
    /// the number of bits that should be 1.
    pub fn new(start: usize, len: usize) -> Self {
        // Check interface preconditions in debug builds
        debug_assert!(start < BITS_PER_WORD, "Mask start is out of word range");
        debug_assert!(len <= BITS_PER_WORD - start,
                      "Mask end is out of word range");

        // Handle the "full word" edge case without overflowing
        if len == BITS_PER_WORD {
            return Self::FULL;
        }

        // Otherwise, use a general bit pattern computation
        Self(((1 << len) - 1) << start)
    }

    /// Truth that no bit is set in this mask
    pub fn is_empty(self) -> bool {
        self == Self::EMPTY
    }

    /// Truth that all bits are set in this mask
    pub fn is_full(self) -> bool {
        self == Self::FULL
    }

    /// Set of bits which are set in both masks
    pub fn intersection(self, other: Self) -> Self {
        Self(self.0 & other.0)
    }

    /// Set of bits which are set in either mask
    pub fn union(self, other: Self) -> Self {
        Self(self.0 | other.0)
    }

    /// Flip every bit of the mask
    pub fn inverse(self) -> Self {
        Self(!self.0)
    }

    /// Truth that the bit at `idx` is set
    pub fn contains(self, idx: usize) -> bool {
        debug_assert!(idx < BITS_PER_WORD, "Bit index is out of word range");
        self.0 & (1 << idx) != 0
    }
}


/// Page occupancy bitmap stored in externally provided memory
///
/// One bit tracks one page, in address order. A set bit means that the page
/// is currently granted. The bitmap does not own its storage: in a heap that
/// has no underlying allocator, the words live at the start of the managed
/// region itself.
///
/// Bits past the end of the tracked range (in the last storage word) are kept
/// permanently set, so that no search can ever report them as free.
#[derive(Debug)]
pub struct Bitmap {
    /// Start of the word storage
    words: NonNull<usize>,

    /// Number of words in the storage
    num_words: usize,

    /// Number of meaningful bits (= tracked pages)
    num_bits: usize,
}

impl Bitmap {
    /// Number of storage words needed to track `num_bits` pages
    pub const fn words_for(num_bits: usize) -> usize {
        num_bits / BITS_PER_WORD + (num_bits % BITS_PER_WORD != 0) as usize
    }

    /// Set up a bitmap with every page marked free
    ///
    /// # Safety
    ///
    /// `storage` must be valid for reads and writes of
    /// `Self::words_for(num_bits)` properly aligned words, and must not be
    /// accessed through any other path for as long as the bitmap lives.
    pub unsafe fn new_in(storage: NonNull<usize>, num_bits: usize) -> Self {
        debug_assert!(num_bits != 0, "Bitmap must track at least one page");
        let mut bitmap = Self {
            words: storage,
            num_words: Self::words_for(num_bits),
            num_bits,
        };

        // Start from a fully free bitmap...
        for word in bitmap.words_mut() {
            *word = 0;
        }

        // ...then permanently reserve the padding bits of the last word
        let tail_bits = num_bits % BITS_PER_WORD;
        if tail_bits != 0 {
            let padding = WordMask::new(tail_bits, BITS_PER_WORD - tail_bits);
            let last = bitmap.num_words - 1;
            bitmap.words_mut()[last] = padding.0;
        }
        bitmap
    }

    /// Number of pages tracked by this bitmap
    pub fn len(&self) -> usize {
        self.num_bits
    }

    /// Number of pages currently granted
    pub fn count_set(&self) -> usize {
        let padding = self.num_words * BITS_PER_WORD - self.num_bits;
        let ones: usize = self.words()
                              .iter()
                              .map(|word| word.count_ones() as usize)
                              .sum();
        ones - padding
    }

    /// Find the first run of `len` consecutive free pages
    ///
    /// The scan always starts at the beginning of the bitmap, which keeps
    /// low addresses densely used. Fully granted words are skipped at once,
    /// and fully free words extend the current run at once.
    pub fn find_clear_run(&self, len: usize) -> Option<usize> {
        debug_assert!(len != 0, "Requested an empty page run");

        let mut run_start = 0;
        let mut run_len = 0;
        for (word_idx, &word) in self.words().iter().enumerate() {
            let word = WordMask(word);

            // Obstacle everywhere, any run in progress is broken
            if word.is_full() {
                run_len = 0;
                continue;
            }

            // No obstacle at all, extend the run by a full word
            if word.is_empty() {
                if run_len == 0 {
                    run_start = word_idx * BITS_PER_WORD;
                }
                run_len += BITS_PER_WORD;
                if run_len >= len {
                    return Some(run_start);
                }
                continue;
            }

            // Mixed word, go bit by bit
            for bit in 0..BITS_PER_WORD {
                if word.contains(bit) {
                    run_len = 0;
                    continue;
                }
                if run_len == 0 {
                    run_start = word_idx * BITS_PER_WORD + bit;
                }
                run_len += 1;
                if run_len >= len {
                    return Some(run_start);
                }
            }
        }
        None
    }

    /// Mark pages `start..start + len` as granted
    pub fn set_run(&mut self, start: usize, len: usize) {
        self.for_each_mask(start, len, |word, mask| {
            debug_assert!(word.intersection(mask).is_empty(),
                          "Tried to grant pages which were already granted");
            word.union(mask)
        });
    }

    /// Mark pages `start..start + len` as free
    pub fn clear_run(&mut self, start: usize, len: usize) {
        self.for_each_mask(start, len, |word, mask| {
            debug_assert_eq!(word.intersection(mask), mask,
                             "Tried to release pages which weren't granted");
            word.intersection(mask.inverse())
        });
    }

    /// Apply `update` to every word covered by a page run, along with the
    /// mask of the run's bits within that word
    fn for_each_mask(&mut self,
                     start: usize,
                     len: usize,
                     mut update: impl FnMut(WordMask, WordMask) -> WordMask) {
        // Check interface preconditions in debug builds
        debug_assert!(len != 0, "Page run must not be empty");
        debug_assert!(start < self.num_bits && len <= self.num_bits - start,
                      "Page run is out of bitmap range");

        let end = start + len;
        let mut idx = start;
        while idx < end {
            let word_idx = idx / BITS_PER_WORD;
            let local_start = idx % BITS_PER_WORD;
            let local_len = (BITS_PER_WORD - local_start).min(end - idx);
            let mask = WordMask::new(local_start, local_len);
            let word = &mut self.words_mut()[word_idx];
            *word = update(WordMask(*word), mask).0;
            idx += local_len;
        }
    }

    fn words(&self) -> &[usize] {
        // This is safe because `new_in` requires exclusive, valid storage of
        // exactly this many words for the lifetime of the bitmap.
        unsafe { slice::from_raw_parts(self.words.as_ptr(), self.num_words) }
    }

    fn words_mut(&mut self) -> &mut [usize] {
        // Same as above, and `&mut self` guarantees unique access
        unsafe { slice::from_raw_parts_mut(self.words.as_ptr(), self.num_words) }
    }
}
