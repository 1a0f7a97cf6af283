//! Size brackets of the slab allocator.
//!
//! Sizes up to 512 bytes are served in 16 byte steps, and two more brackets cover
//! (512, 1024] and (1024, 2048]. Anything larger is a large object and is handed out in
//! whole pages.

use crate::utils::align_usize;

pub const PAGE_SIZE: usize = 4096;
pub const NUM_BRACKETS: usize = 34;
pub const BRACKET_QUANTUM: usize = 16;
pub const BRACKET_QUANTUM_SHIFT: usize = 4;
pub const MAX_QUANTUM_BRACKET_SIZE: usize = 512;
pub const LARGE_SIZE_THRESHOLD: usize = 2048;
/// Brackets below this index are served from thread-local runs by default.
pub const NUM_THREAD_LOCAL_BRACKETS: usize = 8;
pub const MAX_THREAD_LOCAL_BRACKET_SIZE: usize = 128;

/// Bytes of the in-run header: magic byte, bracket index and padding.
pub const RUN_HEADER_SIZE: usize = 8;
pub const RUN_MAGIC: u8 = 42;

#[derive(Clone, Debug)]
pub struct BracketTable {
    sizes: [usize; NUM_BRACKETS],
    pages: [usize; NUM_BRACKETS],
    slots: [usize; NUM_BRACKETS],
    header_sizes: [usize; NUM_BRACKETS],
}

impl BracketTable {
    pub fn new() -> Self {
        let mut sizes = [0; NUM_BRACKETS];
        let mut pages = [0; NUM_BRACKETS];
        let mut slots = [0; NUM_BRACKETS];
        let mut header_sizes = [0; NUM_BRACKETS];

        for i in 0..NUM_BRACKETS {
            sizes[i] = if i < NUM_BRACKETS - 2 {
                BRACKET_QUANTUM * (i + 1)
            } else if i == NUM_BRACKETS - 2 {
                1024
            } else {
                2048
            };
            pages[i] = if i < NUM_BRACKETS - 2 {
                1
            } else if i == NUM_BRACKETS - 2 {
                2
            } else {
                4
            };
            let run_size = pages[i] * PAGE_SIZE;
            // The header occupies whole slots so every slot stays bracket aligned.
            header_sizes[i] = align_usize(RUN_HEADER_SIZE, sizes[i]);
            slots[i] = (run_size - header_sizes[i]) / sizes[i];
            debug_assert!(header_sizes[i] + slots[i] * sizes[i] <= run_size);
        }

        Self {
            sizes,
            pages,
            slots,
            header_sizes,
        }
    }

    #[inline]
    pub fn bracket_size(&self, idx: usize) -> usize {
        self.sizes[idx]
    }
    #[inline]
    pub fn num_pages(&self, idx: usize) -> usize {
        self.pages[idx]
    }
    #[inline]
    pub fn num_slots(&self, idx: usize) -> usize {
        self.slots[idx]
    }
    #[inline]
    pub fn header_size(&self, idx: usize) -> usize {
        self.header_sizes[idx]
    }

    #[inline]
    pub fn run_size(&self, idx: usize) -> usize {
        self.pages[idx] * PAGE_SIZE
    }

    /// Bracket index serving `size`. `size` must not exceed [`LARGE_SIZE_THRESHOLD`].
    #[inline]
    pub fn size_to_index(size: usize) -> usize {
        debug_assert!(size <= LARGE_SIZE_THRESHOLD);
        let size = size.max(1);
        if size <= MAX_QUANTUM_BRACKET_SIZE {
            (align_usize(size, BRACKET_QUANTUM) >> BRACKET_QUANTUM_SHIFT) - 1
        } else if size <= 1024 {
            NUM_BRACKETS - 2
        } else {
            NUM_BRACKETS - 1
        }
    }

    #[inline]
    pub fn size_to_index_and_bracket_size(&self, size: usize) -> (usize, usize) {
        let idx = Self::size_to_index(size);
        (idx, self.sizes[idx])
    }

    #[inline]
    pub fn round_to_bracket_size(&self, size: usize) -> usize {
        self.sizes[Self::size_to_index(size)]
    }
}

impl Default for BracketTable {
    fn default() -> Self {
        Self::new()
    }
}
